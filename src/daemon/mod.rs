//! Daemon orchestration: startup, the one event loop, reconciliation,
//! shutdown.

pub mod actions;
pub mod context;
pub mod events;

#[cfg(test)]
mod tests;

use crate::config::{Action, Binding, Config, MixerChannelSpec};
use crate::debounce::Debouncer;
use crate::device::{button_led_bytes, Device};
use crate::graph::links::{self, ConnectMode, PwLink};
use crate::graph::{self, GraphChange};
use crate::midi::{ByteTriplet, MidiEvent};
use crate::{jalv, midish, proc, state};
use anyhow::{anyhow, Context, Result};
use context::{DaemonContext, DaemonEvent};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const RECONCILE_DEBOUNCE: Duration = Duration::from_millis(100);

pub async fn run(config_path: String, check_only: bool) -> Result<()> {
    let config = Config::load(&config_path).await?;
    if check_only {
        info!("configuration OK: {}", config_path);
        return Ok(());
    }

    let device = Device::by_name(&config.device)
        .ok_or_else(|| anyhow!("no device description for {:?}", config.device))?;
    let in_port = proc::find_device_port(&config.input_midi).await?;
    let out_port = proc::find_device_port(&config.output_midi).await?;

    let (midi_tx, mut midi_rx) = mpsc::channel::<MidiEvent>(64);
    let (graph_tx, mut graph_rx) = mpsc::channel::<Vec<GraphChange>>(64);
    let (events_tx, mut events_rx) = mpsc::channel::<DaemonEvent>(64);
    let (led_tx, mut led_rx) = mpsc::unbounded_channel::<Vec<ByteTriplet>>();
    let (midish_handle, midish_rx) = midish::channel();

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    tasks.spawn(crate::midi::watch_input(in_port, midi_tx));
    tasks.spawn(graph::watch::run(graph_tx));
    tasks.spawn(midish::run(midish_rx));

    let mut plugins = HashMap::new();
    for plugin in &config.pipewire.plugins {
        let (handle, rx) = jalv::channel(&plugin.name);
        tasks.spawn(jalv::run(plugin.clone(), config.lv2_path.clone(), rx));
        plugins.insert(plugin.name.clone(), handle);
    }

    {
        let port = out_port.clone();
        tasks.spawn(async move {
            while let Some(triplets) = led_rx.recv().await {
                if let Err(e) = crate::midi::send_triplets(&port, &triplets).await {
                    warn!("LED write failed: {:#}", e);
                }
            }
            Ok(())
        });
    }

    // The sequencer has to register with ALSA before it can be patched.
    connect_with_retries(&config.connections).await?;

    let state_file = config.state_file.clone();
    let presence = config
        .pipewire
        .rules
        .iter()
        .map(|r| (r.node.clone(), false))
        .collect();

    let mut ctx = DaemonContext {
        config,
        config_path,
        device,
        shift: false,
        prompt_open: false,
        prompt_candidates: HashMap::new(),
        ranges: HashMap::new(),
        mutes: HashMap::new(),
        dials: HashMap::new(),
        led_saves: HashMap::new(),
        button_colors: HashMap::new(),
        cycle_states: HashMap::new(),
        pending_presses: HashMap::new(),
        commands: HashMap::new(),
        graph: graph::GraphState::default(),
        presence,
        midish: midish_handle,
        plugins,
        links: Box::new(PwLink),
        leds: led_tx,
        events: events_tx,
    };
    ctx.seed_from(state::restore(state_file.as_deref()).await);
    apply_initial_leds(&mut ctx);

    let mut debounce = Debouncer::new(RECONCILE_DEBOUNCE);
    let result = event_loop(
        &mut ctx,
        &mut midi_rx,
        &mut graph_rx,
        &mut events_rx,
        &mut debounce,
        &mut tasks,
    )
    .await;

    state::dump(state_file.as_deref(), &ctx.persist()).await;
    // The LED writer dies with the JoinSet, so write directly.
    if let Err(e) = crate::midi::send_triplets(&out_port, &all_leds_off(&ctx.device)).await {
        warn!("couldn't blank the LEDs: {:#}", e);
    }
    tasks.shutdown().await;
    result
}

async fn event_loop(
    ctx: &mut DaemonContext,
    midi_rx: &mut mpsc::Receiver<MidiEvent>,
    graph_rx: &mut mpsc::Receiver<Vec<GraphChange>>,
    events_rx: &mut mpsc::Receiver<DaemonEvent>,
    debounce: &mut Debouncer,
    tasks: &mut JoinSet<Result<()>>,
) -> Result<()> {
    loop {
        tokio::select! {
            Some(event) = midi_rx.recv() => {
                if let Err(e) = events::handle_midi_event(ctx, event).await {
                    error!("event handling failed: {:#}", e);
                }
            }
            Some(items) = graph_rx.recv() => {
                ctx.graph.ingest(items).context("graph ingestion failed")?;
                debounce.poke();
            }
            Some(event) = events_rx.recv() => {
                handle_daemon_event(ctx, event).await;
            }
            _ = debounce.fired() => {
                if let Err(e) = reconcile(ctx).await {
                    error!("reconcile pass failed: {:#}", e);
                }
            }
            Some(joined) = tasks.join_next() => {
                match joined {
                    Ok(Ok(())) => debug!("helper task finished"),
                    Ok(Err(e)) => return Err(e),
                    Err(e) => return Err(anyhow!("helper task panicked: {}", e)),
                }
            }
            _ = shutdown_signal() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_daemon_event(ctx: &mut DaemonContext, event: DaemonEvent) {
    match event {
        DaemonEvent::LongPressFired { button } => {
            events::handle_long_press(ctx, &button).await;
        }

        DaemonEvent::CommandExited { id, started, on_finish } => {
            let current = ctx.commands.get(&id).map(|s| s.started);
            if current != Some(started) {
                debug!("stale command completion ignored");
                return;
            }
            ctx.commands.remove(&id);
            for action in &on_finish {
                if let Err(e) = actions::run_action(ctx, action, None).await {
                    error!("finish action failed: {:#}", e);
                }
            }
        }

        DaemonEvent::PromptDone { choice, channel, on_finish } => {
            ctx.prompt_open = false;
            if let Some(choice) = choice {
                match ctx.prompt_candidates.get(&choice).copied() {
                    Some(node_id) => assign_choice(ctx, node_id, channel).await,
                    None => warn!("prompt answered with unknown choice {:?}", choice),
                }
            }
            ctx.prompt_candidates.clear();
            for action in &on_finish {
                if let Err(e) = actions::run_action(ctx, action, None).await {
                    error!("finish action failed: {:#}", e);
                }
            }
        }
    }
}

async fn assign_choice(ctx: &mut DaemonContext, node_id: u32, channel: u32) {
    let channels = ctx.graph.mixer_channels(&ctx.config.pipewire.mixer_node);
    let Some(target) = channels.get(channel as usize - 1) else {
        warn!("mixer channel {} vanished while the prompt was open", channel);
        return;
    };
    let main_ids = main_output_ids(ctx);
    if let Err(e) = links::connect_to_mixer(
        &ctx.graph,
        &*ctx.links,
        node_id,
        target,
        ConnectMode::Smart,
        &main_ids,
    )
    .await
    {
        error!("mixer assignment failed: {:#}", e);
    }
}

/// One debounced pass over the graph: hotplug edges first, then mixer
/// assignment for matching nodes that aren't wired up yet.
pub async fn reconcile(ctx: &mut DaemonContext) -> Result<()> {
    let rules = ctx.config.pipewire.rules.clone();

    for rule in &rules {
        let present = !ctx.graph.find_nodes(&rule.node).is_empty();
        let prev = ctx.presence.get(&rule.node).copied().unwrap_or(false);
        if present && !prev {
            info!("node appeared: {}", rule.node);
            for action in rule.on_connect.iter().flatten() {
                if let Err(e) = actions::run_action(ctx, action, None).await {
                    error!("on_connect action failed: {:#}", e);
                }
            }
        } else if !present && prev {
            info!("node left: {}", rule.node);
            for action in rule.on_disconnect.iter().flatten() {
                if let Err(e) = actions::run_action(ctx, action, None).await {
                    error!("on_disconnect action failed: {:#}", e);
                }
            }
        }
        ctx.presence.insert(rule.node.clone(), present);
    }

    let channels = ctx.graph.mixer_channels(&ctx.config.pipewire.mixer_node);
    if channels.is_empty() {
        return Ok(());
    }
    let main_ids = main_output_ids(ctx);

    for rule in &rules {
        let Some(spec) = rule.mixer_channel else { continue };
        let nodes: Vec<u32> = ctx.graph.find_nodes(&rule.node).iter().map(|n| n.id).collect();
        if nodes.is_empty() {
            continue;
        }

        // A channel already serving one instance takes every match, so
        // two copies of the same app never straddle two channels.
        let occupied = nodes
            .iter()
            .find_map(|&n| ctx.graph.assigned_mixer_channel(n, &channels));
        let target = match occupied {
            Some(idx) => &channels[idx],
            None => match spec {
                MixerChannelSpec::Fixed(n) => match channels.get(n as usize - 1) {
                    Some(ch) => ch,
                    None => {
                        warn!("rule {:?} wants channel {} but the mixer has {}", rule.node, n, channels.len());
                        continue;
                    }
                },
                MixerChannelSpec::RoundRobin => {
                    match channels.iter().find(|ch| ctx.graph.channel_is_free(ch)) {
                        Some(ch) => ch,
                        None => {
                            debug!("no free mixer channel for {:?}", rule.node);
                            continue;
                        }
                    }
                }
            },
        };

        for node_id in nodes {
            debug!("assigning {:?} ({}) to {}", rule.node, node_id, target.label());
            if let Err(e) = links::connect_to_mixer(
                &ctx.graph,
                &*ctx.links,
                node_id,
                target,
                rule.connect_mode,
                &main_ids,
            )
            .await
            {
                error!("mixer assignment failed: {:#}", e);
            }
        }
    }
    Ok(())
}

fn main_output_ids(ctx: &DaemonContext) -> Vec<u32> {
    ctx.graph
        .find_nodes(&ctx.config.pipewire.main_output)
        .iter()
        .map(|n| n.id)
        .collect()
}

/// Paint every LED: restored colors win, then per-binding defaults,
/// then off.
fn apply_initial_leds(ctx: &mut DaemonContext) {
    let mut triplets = Vec::new();
    let buttons = ctx.device.buttons.clone();
    for button in &buttons {
        if button.led_states.is_none() {
            continue;
        }
        let color = ctx
            .button_colors
            .get(&button.label)
            .cloned()
            .or_else(|| default_button_color(ctx, &button.label))
            .unwrap_or_else(|| "OFF".to_string());
        if let Some(t) = button_led_bytes(button, &color) {
            triplets.push(t);
        }
        if color != "OFF" {
            ctx.button_colors.insert(button.label.clone(), color);
        }
    }
    ctx.send_leds(triplets);
}

/// Resting color for a bound button: the release slot's color, or for a
/// cycle button the color of the item its next press will run.
fn default_button_color(ctx: &DaemonContext, label: &str) -> Option<String> {
    let Binding::Button { on_press, on_release, .. } = ctx.config.bindings.get(label)? else {
        return None;
    };
    if let Some(color) = on_release.as_ref().and_then(|s| s.color.clone()) {
        return Some(color);
    }
    for action in on_press.iter().flat_map(|s| s.actions.iter()) {
        if let Action::Cycle { items, id } = action {
            // The stored counter is the last-run item; preview its successor.
            let counter = ctx.cycle_states.get(id).copied().unwrap_or(0);
            return items[(counter + 1) % items.len()].color.clone();
        }
    }
    None
}

fn all_leds_off(device: &Device) -> Vec<ByteTriplet> {
    device
        .buttons
        .iter()
        .filter(|b| b.led_states.is_some())
        .map(|b| ByteTriplet::led(b.channel, b.note, 0))
        .collect()
}

async fn connect_with_retries(connections: &[(String, String)]) -> Result<()> {
    if connections.is_empty() {
        return Ok(());
    }
    let mut last = None;
    for attempt in 1..=5 {
        match proc::connect_midi_devices(connections).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!("device plumbing attempt {} failed: {:#}", attempt, e);
                last = Some(e);
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        }
    }
    Err(last.unwrap_or_else(|| anyhow!("device plumbing failed")))
        .context("couldn't wire up the sequencer clients")
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("can't install SIGTERM handler: {}", e);
            std::future::pending().await
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
