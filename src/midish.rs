//! The midish sequencer link: process lifecycle, handshake, channel
//! selection, and rendering MIDI events into midish commands.

use crate::midi::MidiEvent;
use crate::proc::{failure_code, ProcessFailure};
use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Sends raw midish command lines to the writer task. Dropping all
/// handles shuts the sequencer down.
#[derive(Clone)]
pub struct MidishHandle {
    tx: mpsc::Sender<String>,
}

impl MidishHandle {
    pub async fn send(&self, command: String) {
        if self.tx.send(command).await.is_err() {
            warn!("sequencer is gone, command dropped");
        }
    }
}

pub fn channel() -> (MidishHandle, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(64);
    (MidishHandle { tx }, rx)
}

/// Tracks which `outN` the sequencer currently has selected and emits a
/// `co outN` switch line in front of commands that target another one.
struct ChannelTracker {
    current: Option<String>,
    token: Regex,
}

impl ChannelTracker {
    fn new() -> Result<Self> {
        Ok(ChannelTracker {
            current: None,
            token: Regex::new(r"\bout(\d+)\b").context("channel token regex")?,
        })
    }

    fn wrap(&mut self, command: &str) -> Vec<String> {
        let mut lines = Vec::with_capacity(2);
        if let Some(cap) = self.token.captures(command) {
            let target = cap[0].to_string();
            if self.current.as_deref() != Some(&target) {
                lines.push(format!("co {}", target));
                self.current = Some(target);
            }
        }
        lines.push(command.to_string());
        lines
    }
}

/// Runs the sequencer for the lifetime of the daemon: spawn, handshake,
/// then forward commands. The process exiting on its own is a component
/// failure.
pub async fn run(mut rx: mpsc::Receiver<String>) -> Result<()> {
    let mut child = Command::new("stdbuf")
        .args(["-i0", "-o0", "-e0", "midish"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn midish")?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("midish stdin not captured"))?;

    // Handshake: one raw-mode device on the virtual port, sixteen named
    // outputs, channel 0 selected, recording running.
    let mut handshake = String::from("dnew 0 \"14:0\" rw\ni\n");
    for n in 0..16 {
        handshake.push_str(&format!("onew out{} {{0 {}}}\n", n, n));
    }
    handshake.push_str("co out0\n");
    stdin
        .write_all(handshake.as_bytes())
        .await
        .context("midish handshake failed")?;
    info!("sequencer ready");

    let mut tracker = ChannelTracker::new()?;
    tracker.current = Some("out0".to_string());

    loop {
        tokio::select! {
            command = rx.recv() => {
                let Some(command) = command else {
                    debug!("sequencer channel closed, stopping midish");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Ok(());
                };
                for line in tracker.wrap(&command) {
                    debug!("midish <- {}", line);
                    stdin
                        .write_all(format!("{}\n", line).as_bytes())
                        .await
                        .context("midish write failed")?;
                }
            }
            status = child.wait() => {
                let status = status.context("midish wait failed")?;
                return Err(ProcessFailure {
                    id: "midish".to_string(),
                    code: failure_code(status),
                }
                .into());
            }
        }
    }
}

/// 14-bit controller update, the high-precision variant of `ctl`.
pub fn wide_control_to_midish(channel: u8, controller: u8, value: u16) -> String {
    format!("oaddev {{xctl out{} {} {}}}", channel, controller, value)
}

/// Render an event as a midish `oaddev` command. Notes are never routed
/// through the sequencer.
pub fn midi_event_to_midish(event: &MidiEvent) -> Result<String> {
    let out = format!("out{}", event.channel());
    match *event {
        MidiEvent::ControlChange { controller, value, .. } => {
            Ok(format!("oaddev {{ctl {} {} {}}}", out, controller, value))
        }
        MidiEvent::PolyAftertouch { note, pressure, .. } => {
            Ok(format!("oaddev {{kat {} {} {}}}", out, note, pressure))
        }
        MidiEvent::ChannelAftertouch { pressure, .. } => {
            Ok(format!("oaddev {{cat {} {}}}", out, pressure))
        }
        MidiEvent::PitchBend { lsb, msb, .. } => {
            let amount = ((msb as u16) << 4) | lsb as u16;
            Ok(format!("oaddev {{bend {} {}}}", out, amount))
        }
        MidiEvent::ProgramChange { program, .. } => {
            Ok(format!("oaddev {{xpc {} {}}}", out, program))
        }
        MidiEvent::NoteOn { .. } | MidiEvent::NoteOff { .. } => {
            bail!("note events cannot be rendered for the sequencer")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_control_change() {
        let e = MidiEvent::ControlChange { channel: 5, controller: 7, value: 100 };
        assert_eq!(midi_event_to_midish(&e).unwrap(), "oaddev {ctl out5 7 100}");
    }

    #[test]
    fn renders_wide_control_change() {
        assert_eq!(wide_control_to_midish(5, 7, 16383), "oaddev {xctl out5 7 16383}");
    }

    #[test]
    fn renders_bend_and_program_change() {
        let e = MidiEvent::PitchBend { channel: 0, lsb: 0x03, msb: 0x40 };
        assert_eq!(midi_event_to_midish(&e).unwrap(), "oaddev {bend out0 1027}");
        let e = MidiEvent::ProgramChange { channel: 2, program: 12 };
        assert_eq!(midi_event_to_midish(&e).unwrap(), "oaddev {xpc out2 12}");
    }

    #[test]
    fn notes_are_rejected() {
        let e = MidiEvent::NoteOn { channel: 0, note: 60, velocity: 100 };
        assert!(midi_event_to_midish(&e).is_err());
    }

    #[test]
    fn channel_switch_is_prefixed_once() {
        let mut t = ChannelTracker::new().unwrap();
        t.current = Some("out0".to_string());

        assert_eq!(
            t.wrap("oaddev {ctl out5 7 100}"),
            vec!["co out5", "oaddev {ctl out5 7 100}"]
        );
        // Same channel again: no prefix.
        assert_eq!(t.wrap("oaddev {ctl out5 7 90}"), vec!["oaddev {ctl out5 7 90}"]);
        // Commands without a channel token pass through untouched.
        assert_eq!(t.wrap("i"), vec!["i"]);
        assert_eq!(
            t.wrap("oaddev {ctl out0 7 1}"),
            vec!["co out0", "oaddev {ctl out0 7 1}"]
        );
    }
}
