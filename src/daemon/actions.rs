//! The action interpreter: every configured effect goes through here.

use super::context::{CommandState, DaemonContext, DaemonEvent};
use super::events::publish_dial_value;
use crate::config::{Action, BindingId, Config};
use crate::graph::links;
use crate::midish;
use crate::prompt;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// A command's finish chain never runs earlier than this after its
/// start, so rapid toggles can't outrun the thing they toggled.
pub const MIN_SETTLE: Duration = Duration::from_millis(150);

/// Execute one action. `origin` is the button that triggered it, when
/// there is one, for LED feedback. Errors are per-action; the caller
/// logs and carries on.
pub fn run_action<'a>(
    ctx: &'a mut DaemonContext,
    action: &'a Action,
    origin: Option<&'a str>,
) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
    Box::pin(async move {
        match action {
            Action::Command { command, cancelable, on_finish, id } => {
                run_command(ctx, command, *cancelable, on_finish, id)?;
            }

            Action::Mute { dial, mute } => {
                ctx.mutes.insert(dial.clone(), *mute);
                if *mute {
                    // The gate is closed now; push the floor through it
                    // directly so the output actually goes quiet.
                    publish_dial_value(ctx, dial, 0).await?;
                } else {
                    let raw = ctx.dial_value(dial);
                    publish_dial_value(ctx, dial, raw).await?;
                }
            }

            Action::SetRange { dial, range } => {
                ctx.ranges.insert(dial.clone(), *range);
                if !ctx.is_muted(dial) {
                    let raw = ctx.dial_value(dial);
                    publish_dial_value(ctx, dial, raw).await?;
                }
            }

            Action::Midi { events } => {
                for event in events {
                    let command = midish::midi_event_to_midish(event)?;
                    ctx.midish.send(command).await;
                }
            }

            Action::Lv2LoadPreset { plugin, preset } => {
                match ctx.plugins.get(plugin) {
                    Some(handle) => handle.send(format!("preset {}", preset)).await,
                    None => warn!("no plugin named {:?}", plugin),
                }
            }

            Action::Lv2ShowGui { plugin } => {
                match ctx.plugins.get(plugin) {
                    Some(handle) => handle.send("show".to_string()).await,
                    None => warn!("no plugin named {:?}", plugin),
                }
            }

            Action::Link { src, dest } => {
                let src = links::resolve_endpoint(&ctx.graph, src)?;
                let dest = links::resolve_endpoint(&ctx.graph, dest)?;
                links::ensure_link(&ctx.graph, &*ctx.links, &src, &dest).await?;
            }

            Action::Unlink { src, dest } => {
                let src = links::resolve_endpoint(&ctx.graph, src)?;
                let dest = links::resolve_endpoint(&ctx.graph, dest)?;
                links::destroy_link(&ctx.graph, &*ctx.links, &src, &dest).await?;
            }

            Action::ExclusiveLink { src, dest } => {
                let src = links::resolve_endpoint(&ctx.graph, src)?;
                let dest = links::resolve_endpoint(&ctx.graph, dest)?;
                links::exclusive_link(&ctx.graph, &*ctx.links, &src, &dest).await?;
            }

            Action::LedSet { button, color } => {
                ctx.set_button_color(button, color);
            }

            Action::LedSave { button } => {
                let current = ctx
                    .button_colors
                    .get(button)
                    .cloned()
                    .unwrap_or_else(|| "OFF".to_string());
                ctx.led_saves.insert(button.clone(), current);
            }

            Action::LedRestore { button } => {
                match ctx.led_saves.get(button).cloned() {
                    Some(color) => ctx.set_button_color(button, &color),
                    None => debug!("nothing saved for button {:?}", button),
                }
            }

            Action::Cycle { items, id } => {
                // Advance first; the stored counter is the item that ran.
                let counter = ctx.cycle_states.get(id).copied().unwrap_or(0);
                let idx = (counter + 1) % items.len();
                ctx.cycle_states.insert(id.clone(), idx);
                for a in &items[idx].actions {
                    run_action(ctx, a, origin).await?;
                }
                // LED previews the item the next press will run.
                let next = &items[(idx + 1) % items.len()];
                if let (Some(origin), Some(color)) = (origin, &next.color) {
                    ctx.set_button_color(origin, color);
                }
            }

            Action::MixerSelect { channel, on_finish } => {
                mixer_select(ctx, *channel, on_finish).await?;
            }

            Action::Cancel { alt } => {
                if ctx.prompt_open {
                    prompt::dismiss().await?;
                } else if let Some(alt) = alt {
                    run_action(ctx, alt, origin).await?;
                }
            }

            Action::ConfigReload => {
                reload_config(ctx).await?;
            }
        }
        Ok(())
    })
}

fn run_command(
    ctx: &mut DaemonContext,
    command: &str,
    cancelable: bool,
    on_finish: &[Action],
    id: &BindingId,
) -> Result<()> {
    if let Some(state) = ctx.commands.get_mut(id) {
        if cancelable {
            debug!("killing running command: {}", command);
            if let Some(kill) = state.kill.take() {
                let _ = kill.send(());
            }
        } else {
            debug!("command already running, ignoring: {}", command);
        }
        return Ok(());
    }

    info!("running: {}", command);
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn: {}", command))?;

    let (kill_tx, kill_rx) = oneshot::channel();
    let started = Instant::now();
    ctx.commands.insert(
        id.clone(),
        CommandState { started, kill: Some(kill_tx) },
    );
    tokio::spawn(wait_command(
        child,
        id.clone(),
        started,
        on_finish.to_vec(),
        kill_rx,
        ctx.events.clone(),
    ));
    Ok(())
}

async fn wait_command(
    mut child: tokio::process::Child,
    id: BindingId,
    started: Instant,
    on_finish: Vec<Action>,
    mut kill_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<DaemonEvent>,
) {
    tokio::select! {
        _ = &mut kill_rx => {
            let _ = child.start_kill();
        }
        _ = child.wait() => {}
    }
    let _ = child.wait().await;
    sleep_until(started + MIN_SETTLE).await;
    let _ = events
        .send(DaemonEvent::CommandExited { id, started, on_finish })
        .await;
}

async fn mixer_select(ctx: &mut DaemonContext, channel: u32, on_finish: &[Action]) -> Result<()> {
    // The finish chain belongs to the prompt that is already on screen;
    // a mashed button must not fire it again.
    if ctx.prompt_open {
        warn!("a prompt is already open, skipping selection");
        return Ok(());
    }

    let channels = ctx.graph.mixer_channels(&ctx.config.pipewire.mixer_node);
    if channels.get(channel as usize - 1).is_none() {
        warn!("mixer channel {} doesn't exist right now", channel);
        return run_finish(ctx, on_finish).await;
    }

    let mut candidates = HashMap::new();
    let mut labels = Vec::new();
    for node in ctx.graph.audio_clients() {
        let name = node
            .prop("application.name")
            .or_else(|| node.prop("node.name"))
            .unwrap_or("unknown");
        let label = format!("{} [{}]", name, node.id);
        candidates.insert(label.clone(), node.id);
        labels.push(label);
    }
    if labels.is_empty() {
        debug!("no audio clients to choose from");
        return run_finish(ctx, on_finish).await;
    }

    ctx.prompt_open = true;
    ctx.prompt_candidates = candidates;
    let events = ctx.events.clone();
    let on_finish = on_finish.to_vec();
    let title = format!("Mixer Channel {}", channel);
    tokio::spawn(async move {
        let choice = match prompt::choose(&title, &labels).await {
            Ok(choice) => choice,
            Err(e) => {
                error!("prompt failed: {:#}", e);
                None
            }
        };
        let _ = events
            .send(DaemonEvent::PromptDone { choice, channel, on_finish })
            .await;
    });
    Ok(())
}

async fn run_finish(ctx: &mut DaemonContext, on_finish: &[Action]) -> Result<()> {
    for action in on_finish {
        run_action(ctx, action, None).await?;
    }
    Ok(())
}

/// Reload bindings and graph rules from disk. Presence is carried over
/// for rules that survive, so nothing refires; new rules start absent
/// and fire on the next reconcile. Plugin changes need a restart.
async fn reload_config(ctx: &mut DaemonContext) -> Result<()> {
    let new = Config::load(&ctx.config_path).await?;

    let mut presence = HashMap::new();
    for rule in &new.pipewire.rules {
        let prev = ctx.presence.get(&rule.node).copied().unwrap_or(false);
        presence.insert(rule.node.clone(), prev);
    }
    ctx.presence = presence;
    ctx.config = new;
    info!("configuration reloaded from {}", ctx.config_path);
    Ok(())
}
