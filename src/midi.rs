//! MIDI event types and the hex wire codec for the control surface.
//!
//! The surface speaks newline-delimited hex over `amidi`: two or three
//! bytes per line inbound, and concatenated three-byte triplets outbound
//! (LED updates).

use crate::proc::{failure_code, ProcessFailure};
use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A decoded MIDI event from the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MidiEvent {
    NoteOff { channel: u8, note: u8, velocity: u8 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    PolyAftertouch { channel: u8, note: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelAftertouch { channel: u8, pressure: u8 },
    PitchBend { channel: u8, lsb: u8, msb: u8 },
}

impl MidiEvent {
    pub fn channel(&self) -> u8 {
        match *self {
            MidiEvent::NoteOff { channel, .. }
            | MidiEvent::NoteOn { channel, .. }
            | MidiEvent::PolyAftertouch { channel, .. }
            | MidiEvent::ControlChange { channel, .. }
            | MidiEvent::ProgramChange { channel, .. }
            | MidiEvent::ChannelAftertouch { channel, .. }
            | MidiEvent::PitchBend { channel, .. } => channel,
        }
    }

    fn from_bytes(b1: u8, b2: u8, b3: u8) -> Option<Self> {
        let channel = b1 & 0x0F;
        match b1 >> 4 {
            0x8 => Some(MidiEvent::NoteOff { channel, note: b2, velocity: b3 }),
            0x9 => Some(MidiEvent::NoteOn { channel, note: b2, velocity: b3 }),
            0xA => Some(MidiEvent::PolyAftertouch { channel, note: b2, pressure: b3 }),
            0xB => Some(MidiEvent::ControlChange { channel, controller: b2, value: b3 }),
            0xC => Some(MidiEvent::ProgramChange { channel, program: b2 }),
            0xD => Some(MidiEvent::ChannelAftertouch { channel, pressure: b2 }),
            0xE => Some(MidiEvent::PitchBend { channel, lsb: b2, msb: b3 }),
            _ => None,
        }
    }
}

impl fmt::Display for MidiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MidiEvent::NoteOff { channel, note, velocity } => {
                write!(f, "NoteOff ch:{} n:{} v:{}", channel, note, velocity)
            }
            MidiEvent::NoteOn { channel, note, velocity } => {
                write!(f, "NoteOn ch:{} n:{} v:{}", channel, note, velocity)
            }
            MidiEvent::PolyAftertouch { channel, note, pressure } => {
                write!(f, "PolyAftertouch ch:{} n:{} p:{}", channel, note, pressure)
            }
            MidiEvent::ControlChange { channel, controller, value } => {
                write!(f, "CC ch:{} cc:{} v:{}", channel, controller, value)
            }
            MidiEvent::ProgramChange { channel, program } => {
                write!(f, "ProgramChange ch:{} p:{}", channel, program)
            }
            MidiEvent::ChannelAftertouch { channel, pressure } => {
                write!(f, "ChannelAftertouch ch:{} p:{}", channel, pressure)
            }
            MidiEvent::PitchBend { channel, lsb, msb } => {
                write!(f, "PitchBend ch:{} lsb:{} msb:{}", channel, lsb, msb)
            }
        }
    }
}

/// Exactly three raw protocol bytes, the wire unit for outbound LED writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteTriplet {
    pub b1: u8,
    pub b2: u8,
    pub b3: u8,
}

impl ByteTriplet {
    /// LED update for a button: NoteOn status, note, LED state code.
    pub fn led(channel: u8, note: u8, state: u8) -> Self {
        ByteTriplet {
            b1: (0x9 << 4) | (channel & 0x0F),
            b2: note,
            b3: state,
        }
    }
}

/// Encode triplets into one hex string for a single `amidi --send-hex` write.
pub fn encode_triplets(items: &[ByteTriplet]) -> String {
    let mut out = String::with_capacity(items.len() * 6);
    for t in items {
        out.push_str(&hex::encode([t.b1, t.b2, t.b3]));
    }
    out
}

/// Stateful decoder for the `amidi --dump` hex-line stream.
///
/// The virtual MIDI driver omits the status byte when it repeats the
/// previous message's, so two-byte lines whose first byte is not a valid
/// status are decoded as data bytes under the last successfully decoded
/// status. Before any status has been seen the carried status is 0, which
/// never names a valid kind, so such a line is dropped with a debug log.
#[derive(Debug, Default)]
pub struct HexDecoder {
    prev_status: u8,
}

impl HexDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one line of the dump. Returns `None` for malformed or
    /// unrecognized lines (logged, never fatal).
    pub fn decode_line(&mut self, line: &str) -> Option<MidiEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if line.len() != 4 && line.len() != 6 {
            warn!("hex line isn't 2 or 3 bytes long: {:?}", line);
            return None;
        }

        let bytes = match hex::decode(line) {
            Ok(b) => b,
            Err(e) => {
                warn!("undecodable hex line {:?}: {}", line, e);
                return None;
            }
        };

        let mut b1 = bytes[0];
        let mut b2 = bytes[1];
        let mut b3 = if bytes.len() > 2 { bytes[2] } else { 0 };

        // Two data bytes with no status: reuse the carried status byte.
        if bytes.len() == 2 && !(0x8..=0xE).contains(&(b1 >> 4)) {
            b3 = b2;
            b2 = b1;
            b1 = self.prev_status;
        }

        match MidiEvent::from_bytes(b1, b2, b3) {
            Some(event) => {
                self.prev_status = b1;
                Some(event)
            }
            None => {
                debug!("unknown MIDI status nibble in {:02x}", b1);
                None
            }
        }
    }
}

/// Dump the hardware port and feed decoded events to the main loop.
/// The dump process exiting means the device went away.
pub async fn watch_input(port: String, tx: mpsc::Sender<MidiEvent>) -> Result<()> {
    let mut child = Command::new("amidi")
        .arg("-p")
        .arg(&port)
        .arg("--dump")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn amidi")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("amidi stdout not captured"))?;
    let mut lines = BufReader::new(stdout).lines();
    let mut decoder = HexDecoder::new();

    info!("listening on {}", port);
    while let Some(line) = lines.next_line().await.context("amidi read failed")? {
        if let Some(event) = decoder.decode_line(&line) {
            if tx.send(event).await.is_err() {
                return Ok(());
            }
        }
    }

    let status = child.wait().await.context("amidi wait failed")?;
    Err(ProcessFailure {
        id: "amidi".to_string(),
        code: failure_code(status),
    }
    .into())
}

/// One `amidi --send-hex` write carrying any number of triplets.
pub async fn send_triplets(port: &str, triplets: &[ByteTriplet]) -> Result<()> {
    if triplets.is_empty() {
        return Ok(());
    }
    let hex = encode_triplets(triplets);
    crate::proc::run(&format!("amidi -p {} --send-hex='{}'", port, hex))
        .await
        .map(|_| ())
}
