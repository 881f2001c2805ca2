//! The single mutable runtime state. Only the main loop holds it, so
//! every handler gets `&mut` with no locking anywhere.

use crate::config::{BindingId, Config, PressSlot, Range};
use crate::device::{button_led_bytes, Device};
use crate::graph::links::LinkRunner;
use crate::graph::GraphState;
use crate::jalv::PluginHandle;
use crate::midi::ByteTriplet;
use crate::midish::MidishHandle;
use crate::state::PersistentState;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// What helper tasks post back into the main loop.
#[derive(Debug)]
pub enum DaemonEvent {
    LongPressFired {
        button: String,
    },
    CommandExited {
        id: BindingId,
        started: Instant,
        on_finish: Vec<crate::config::Action>,
    },
    PromptDone {
        choice: Option<String>,
        channel: u32,
        on_finish: Vec<crate::config::Action>,
    },
}

/// A button held down with a long-press slot armed.
pub struct PendingPress {
    pub timer: JoinHandle<()>,
    /// Short-press slot to run if the button is released in time.
    pub short: Option<PressSlot>,
    pub long: PressSlot,
}

/// A running command action. `started` doubles as the generation tag:
/// the waiter's completion event only settles if it still matches.
pub struct CommandState {
    pub started: Instant,
    pub kill: Option<oneshot::Sender<()>>,
}

pub struct DaemonContext {
    pub config: Config,
    pub config_path: String,
    pub device: Device,

    pub shift: bool,
    pub prompt_open: bool,
    /// Prompt label -> node id, for the prompt currently on screen.
    pub prompt_candidates: HashMap<String, u32>,

    pub ranges: HashMap<String, Range>,
    pub mutes: HashMap<String, bool>,
    pub dials: HashMap<String, u8>,
    pub led_saves: HashMap<String, String>,
    pub button_colors: HashMap<String, String>,
    pub cycle_states: HashMap<BindingId, usize>,

    pub pending_presses: HashMap<String, PendingPress>,
    pub commands: HashMap<BindingId, CommandState>,

    pub graph: GraphState,
    /// Per graph-rule node term: was it present at the last reconcile.
    pub presence: HashMap<String, bool>,

    pub midish: MidishHandle,
    pub plugins: HashMap<String, PluginHandle>,
    pub links: Box<dyn LinkRunner>,
    pub leds: mpsc::UnboundedSender<Vec<ByteTriplet>>,
    pub events: mpsc::Sender<DaemonEvent>,
}

impl DaemonContext {
    /// Last raw value seen on a dial; midpoint before the first touch.
    pub fn dial_value(&self, label: &str) -> u8 {
        self.dials.get(label).copied().unwrap_or(64)
    }

    pub fn dial_range(&self, label: &str) -> Range {
        self.ranges.get(label).copied().unwrap_or([0.0, 1.0])
    }

    pub fn is_muted(&self, label: &str) -> bool {
        self.mutes.get(label).copied().unwrap_or(false)
    }

    /// Update a button's LED and remember the color.
    pub fn set_button_color(&mut self, label: &str, color: &str) {
        let Some(button) = self.device.button_by_label(label) else {
            debug!("no button {:?} to color", label);
            return;
        };
        if let Some(triplet) = button_led_bytes(button, color) {
            let _ = self.leds.send(vec![triplet]);
        }
        self.button_colors.insert(label.to_string(), color.to_string());
    }

    pub fn send_leds(&self, triplets: Vec<ByteTriplet>) {
        if !triplets.is_empty() {
            let _ = self.leds.send(triplets);
        }
    }

    pub fn seed_from(&mut self, state: PersistentState) {
        self.ranges = state.ranges;
        self.mutes = state.mutes;
        self.dials = state.dials;
        self.led_saves = state.led_save_states;
        self.button_colors = state.button_colors;
        self.cycle_states = state
            .cycle_states
            .into_iter()
            .map(|(k, v)| (BindingId(k), v))
            .collect();
    }

    pub fn persist(&self) -> PersistentState {
        PersistentState {
            ranges: self.ranges.clone(),
            mutes: self.mutes.clone(),
            dials: self.dials.clone(),
            led_save_states: self.led_saves.clone(),
            button_colors: self.button_colors.clone(),
            cycle_states: self
                .cycle_states
                .iter()
                .map(|(k, v)| (k.0.clone(), *v))
                .collect(),
        }
    }
}
