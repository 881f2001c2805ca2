//! Persistent daemon state: a small JSON file written at shutdown and
//! read back at startup. Losing it is never fatal.

use crate::config::Range;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::fs;
use tracing::{error, info, warn};

/// Everything worth surviving a restart. Dial maps are keyed by dial
/// label, LED maps by button label, cycle positions by binding id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistentState {
    pub ranges: HashMap<String, Range>,
    pub mutes: HashMap<String, bool>,
    pub dials: HashMap<String, u8>,
    pub led_save_states: HashMap<String, String>,
    pub button_colors: HashMap<String, String>,
    pub cycle_states: HashMap<String, usize>,
}

/// Read the state file. Absence or corruption degrades to defaults.
pub async fn restore(path: Option<&str>) -> PersistentState {
    let Some(path) = path else {
        return PersistentState::default();
    };
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) => {
            warn!("no state restored from {}: {}", path, e);
            return PersistentState::default();
        }
    };
    match serde_json::from_str(&contents) {
        Ok(state) => {
            info!("state restored from {}", path);
            state
        }
        Err(e) => {
            error!("state file {} is malformed, starting fresh: {}", path, e);
            PersistentState::default()
        }
    }
}

/// Write the state file; without a configured path this is a no-op.
pub async fn dump(path: Option<&str>, state: &PersistentState) {
    let Some(path) = path else { return };
    let json = match serde_json::to_string_pretty(state) {
        Ok(json) => json,
        Err(e) => {
            error!("failed to serialize state: {}", e);
            return;
        }
    };
    match fs::write(path, json).await {
        Ok(()) => info!("state dumped to {}", path),
        Err(e) => error!("failed to write state file {}: {}", path, e),
    }
}
