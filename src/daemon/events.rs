//! Button and dial handling: shift routing, long-press timers, and the
//! dial value pipeline into the sequencer.

use super::actions::run_action;
use super::context::{DaemonContext, DaemonEvent, PendingPress};
use crate::config::{Binding, MapFunction, PressSlot, Range};
use crate::midi::MidiEvent;
use crate::midish;
use anyhow::Result;
use std::time::Duration;
use tracing::{debug, error};

pub const DEFAULT_LONG_PRESS: Duration = Duration::from_millis(500);

const SHIFT_LABEL: &str = "Shift";

pub async fn handle_midi_event(ctx: &mut DaemonContext, event: MidiEvent) -> Result<()> {
    // The melodic keys live on their own channel and are not ours to
    // interpret.
    if event.channel() == ctx.device.keys_channel {
        debug!("keys: {}", event);
        return Ok(());
    }

    match event {
        MidiEvent::NoteOn { channel, note, .. } => handle_note_on(ctx, channel, note).await,
        MidiEvent::NoteOff { channel, note, .. } => handle_note_off(ctx, channel, note).await,
        MidiEvent::ControlChange { channel, controller, value } => {
            handle_control_change(ctx, channel, controller, value).await
        }
        other => {
            debug!("unhandled event: {}", other);
            Ok(())
        }
    }
}

async fn handle_note_on(ctx: &mut DaemonContext, channel: u8, note: u8) -> Result<()> {
    let Some(button) = ctx.device.lookup_button(channel, note) else {
        debug!("note on for unknown button ch:{} n:{}", channel, note);
        return Ok(());
    };
    let label = button.label.clone();
    if label == SHIFT_LABEL {
        ctx.shift = true;
        return Ok(());
    }

    let Some(Binding::Button {
        on_press,
        on_long_press,
        on_shift_press,
        on_shift_long_press,
        ..
    }) = ctx.config.bindings.get(&label)
    else {
        debug!("unbound button: {}", label);
        return Ok(());
    };

    let (short, long) = if ctx.shift {
        (on_shift_press.clone(), on_shift_long_press.clone())
    } else {
        (on_press.clone(), on_long_press.clone())
    };

    if let Some(long) = long {
        // Don't run anything yet: the press only resolves to short or
        // long once the timer or the release wins.
        let timeout = long
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_LONG_PRESS);
        let events = ctx.events.clone();
        let fired_label = label.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events
                .send(DaemonEvent::LongPressFired { button: fired_label })
                .await;
        });
        ctx.pending_presses
            .insert(label, PendingPress { timer, short, long });
    } else if let Some(short) = short {
        run_slot(ctx, &short, &label).await;
    }
    Ok(())
}

async fn handle_note_off(ctx: &mut DaemonContext, channel: u8, note: u8) -> Result<()> {
    let Some(button) = ctx.device.lookup_button(channel, note) else {
        return Ok(());
    };
    let label = button.label.clone();
    if label == SHIFT_LABEL {
        ctx.shift = false;
        return Ok(());
    }

    if let Some(pending) = ctx.pending_presses.remove(&label) {
        pending.timer.abort();
        if let Some(short) = pending.short {
            run_slot(ctx, &short, &label).await;
        }
    }

    let release = match ctx.config.bindings.get(&label) {
        Some(Binding::Button { on_release: Some(slot), .. }) => Some(slot.clone()),
        _ => None,
    };
    if let Some(release) = release {
        run_slot(ctx, &release, &label).await;
    }
    Ok(())
}

/// The timer won the race: the press is a long press.
pub async fn handle_long_press(ctx: &mut DaemonContext, button: &str) {
    let Some(pending) = ctx.pending_presses.remove(button) else {
        debug!("stale long-press timer for {:?}", button);
        return;
    };
    let long = pending.long;
    run_slot(ctx, &long, button).await;
}

pub async fn run_slot(ctx: &mut DaemonContext, slot: &PressSlot, origin: &str) {
    for action in &slot.actions {
        if let Err(e) = run_action(ctx, action, Some(origin)).await {
            error!("action on {:?} failed: {:#}", origin, e);
        }
    }
    if let Some(color) = &slot.color {
        ctx.set_button_color(origin, color);
    }
}

async fn handle_control_change(
    ctx: &mut DaemonContext,
    channel: u8,
    controller: u8,
    value: u8,
) -> Result<()> {
    // Shift freezes the dials, so a range can be changed without a jump
    // in the output.
    if ctx.shift {
        return Ok(());
    }

    let Some(dial) = ctx.device.lookup_dial(channel, controller) else {
        debug!("cc for unknown dial ch:{} cc:{}", channel, controller);
        return Ok(());
    };
    let label = dial.label.clone();
    ctx.dials.insert(label.clone(), value);
    manifest_dial_value(ctx, &label, value).await
}

/// Publish a dial value unless the dial is muted. The raw value has
/// already been recorded, so un-muting later picks it up.
pub async fn manifest_dial_value(ctx: &mut DaemonContext, label: &str, raw: u8) -> Result<()> {
    if ctx.is_muted(label) {
        debug!("dial {:?} is muted, swallowing {}", label, raw);
        return Ok(());
    }
    publish_dial_value(ctx, label, raw).await
}

/// Map and send a dial value to the sequencer, mute or no mute.
pub async fn publish_dial_value(ctx: &mut DaemonContext, label: &str, raw: u8) -> Result<()> {
    let Some(Binding::Passthrough { out_channel, out_controller, map_function, high_precision }) =
        ctx.config.bindings.get(label)
    else {
        debug!("dial {:?} has no passthrough binding", label);
        return Ok(());
    };
    let (out_channel, out_controller, map_function, high_precision) =
        (*out_channel, *out_controller, *map_function, *high_precision);

    let range = ctx.dial_range(label);
    let command = if high_precision {
        let value = map_value_wide(raw, map_function, range);
        midish::wide_control_to_midish(out_channel, out_controller, value)
    } else {
        let event = MidiEvent::ControlChange {
            channel: out_channel,
            controller: out_controller,
            value: map_value(raw, map_function, range),
        };
        midish::midi_event_to_midish(&event)?
    };
    ctx.midish.send(command).await;
    Ok(())
}

fn map_norm(raw: u8, map_function: MapFunction, range: Range) -> f64 {
    let x = f64::from(raw) / 127.0;
    let y = match map_function {
        MapFunction::Identity => x,
        MapFunction::Squared => x * x,
        MapFunction::Sqrt => x.sqrt(),
        MapFunction::Taper => x * x * (3.0 - 2.0 * x),
    };
    range[0] + y * (range[1] - range[0])
}

/// Transfer curve composed with the dial's range override.
pub fn map_value(raw: u8, map_function: MapFunction, range: Range) -> u8 {
    (map_norm(raw, map_function, range) * 127.0).round().clamp(0.0, 127.0) as u8
}

/// Same mapping scaled to the 14-bit controller range.
pub fn map_value_wide(raw: u8, map_function: MapFunction, range: Range) -> u16 {
    (map_norm(raw, map_function, range) * 16383.0).round().clamp(0.0, 16383.0) as u16
}
