//! Configuration model: bindings, graph rules, plugins.
//!
//! The file is parsed as YAML (JSON parses as a YAML subset), validated
//! eagerly, and every command/cycle action is stamped with a stable
//! structural id before the daemon sees it.

use crate::device::Device;
use crate::graph::links::ConnectMode;
use crate::midi::MidiEvent;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use tokio::fs;

/// Dial input-to-output mapping range.
pub type Range = [f64; 2];

/// Stable identity of a command/cycle action, a sha1 of its canonical
/// JSON. Assigned once at load time; keys the per-binding runtime state
/// (running command, cycle position) across reloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BindingId(pub String);

/// A logical `node:port` endpoint in the audio graph.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeAndPort {
    pub node: String,
    pub port: String,
}

/// Numeric transfer function applied to dial values before publishing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MapFunction {
    #[default]
    Identity,
    Squared,
    Sqrt,
    Taper,
}

/// One step of a cycle action.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CycleItem {
    pub actions: Vec<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// One concrete effect the interpreter can execute. Closed set: adding a
/// variant is a compile-checked change in every match over it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum Action {
    #[serde(rename = "command")]
    Command {
        command: String,
        #[serde(default)]
        cancelable: bool,
        #[serde(default, rename = "onFinish")]
        on_finish: Vec<Action>,
        #[serde(skip)]
        id: BindingId,
    },
    #[serde(rename = "mute")]
    Mute { dial: String, mute: bool },
    #[serde(rename = "range")]
    SetRange { dial: String, range: Range },
    #[serde(rename = "midi")]
    Midi { events: Vec<MidiEvent> },
    #[serde(rename = "lv2::load_preset")]
    Lv2LoadPreset { plugin: String, preset: String },
    #[serde(rename = "lv2::show_gui")]
    Lv2ShowGui { plugin: String },
    #[serde(rename = "pipewire::link")]
    Link { src: NodeAndPort, dest: NodeAndPort },
    #[serde(rename = "pipewire::unlink")]
    Unlink { src: NodeAndPort, dest: NodeAndPort },
    #[serde(rename = "pipewire::exclusive_link")]
    ExclusiveLink { src: NodeAndPort, dest: NodeAndPort },
    #[serde(rename = "led::set")]
    LedSet { button: String, color: String },
    #[serde(rename = "led::save")]
    LedSave { button: String },
    #[serde(rename = "led::restore")]
    LedRestore { button: String },
    #[serde(rename = "cycle")]
    Cycle {
        items: Vec<CycleItem>,
        #[serde(skip)]
        id: BindingId,
    },
    #[serde(rename = "mixer::select")]
    MixerSelect {
        channel: u32,
        #[serde(default, rename = "onFinish")]
        on_finish: Vec<Action>,
    },
    #[serde(rename = "cancel")]
    Cancel {
        #[serde(skip_serializing_if = "Option::is_none")]
        alt: Option<Box<Action>>,
    },
    #[serde(rename = "config::reload")]
    ConfigReload,
}

/// Actions plus LED color for one button event slot.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PressSlot {
    pub actions: Vec<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Long-press slots only; milliseconds before the press is promoted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// What a control-surface element does.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Binding {
    /// Up to five event slots for a button.
    Button {
        #[serde(default, rename = "onPress", skip_serializing_if = "Option::is_none")]
        on_press: Option<PressSlot>,
        #[serde(default, rename = "onLongPress", skip_serializing_if = "Option::is_none")]
        on_long_press: Option<PressSlot>,
        #[serde(default, rename = "onShiftPress", skip_serializing_if = "Option::is_none")]
        on_shift_press: Option<PressSlot>,
        #[serde(default, rename = "onShiftLongPress", skip_serializing_if = "Option::is_none")]
        on_shift_long_press: Option<PressSlot>,
        #[serde(default, rename = "onRelease", skip_serializing_if = "Option::is_none")]
        on_release: Option<PressSlot>,
    },
    /// Dial feed-through to the sequencer.
    Passthrough {
        #[serde(rename = "outChannel")]
        out_channel: u8,
        #[serde(rename = "outController")]
        out_controller: u8,
        #[serde(default, rename = "mapFunction")]
        map_function: MapFunction,
        /// Publish 14-bit `xctl` values instead of 7-bit `ctl`.
        #[serde(default, rename = "highPrecision")]
        high_precision: bool,
    },
}

/// Mixer channel target of a graph rule: a 1-based channel number, or
/// `"round_robin"` for the first free one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerChannelSpec {
    Fixed(u32),
    RoundRobin,
}

impl Serialize for MixerChannelSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MixerChannelSpec::Fixed(n) => serializer.serialize_u32(*n),
            MixerChannelSpec::RoundRobin => serializer.serialize_str("round_robin"),
        }
    }
}

impl<'de> Deserialize<'de> for MixerChannelSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u32),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(MixerChannelSpec::Fixed(n)),
            Raw::Str(s) if s == "round_robin" => Ok(MixerChannelSpec::RoundRobin),
            Raw::Str(s) => Err(serde::de::Error::custom(format!(
                "unknown mixer channel {:?}",
                s
            ))),
        }
    }
}

/// Hotplug / mixer-assignment rule keyed by a node search term.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GraphRule {
    pub node: String,
    #[serde(default, rename = "onConnect", skip_serializing_if = "Option::is_none")]
    pub on_connect: Option<Vec<Action>>,
    #[serde(default, rename = "onDisconnect", skip_serializing_if = "Option::is_none")]
    pub on_disconnect: Option<Vec<Action>>,
    #[serde(default, rename = "mixerChannel", skip_serializing_if = "Option::is_none")]
    pub mixer_channel: Option<MixerChannelSpec>,
    #[serde(default, rename = "connectMode")]
    pub connect_mode: ConnectMode,
}

/// An LV2 plugin to host for the lifetime of the daemon.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginConfig {
    pub name: String,
    /// jalv flavor to run, e.g. "jalv" or "jalv.gtk3".
    pub host: String,
    pub uri: String,
}

/// Audio-graph related configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PipewireConfig {
    #[serde(default)]
    pub rules: Vec<GraphRule>,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    /// `node.description` of the mixer node whose input ports form the
    /// stereo channels.
    #[serde(default = "default_mixer_node", rename = "mixerNode")]
    pub mixer_node: String,
    /// Node smart-mode connects steal links away from.
    #[serde(default = "default_main_output", rename = "mainOutput")]
    pub main_output: String,
}

/// Root configuration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Name of the control surface, resolved via [`Device::by_name`].
    pub device: String,
    #[serde(rename = "inputMidi")]
    pub input_midi: String,
    #[serde(rename = "outputMidi")]
    pub output_midi: String,
    /// ALSA sequencer client pairs to wire up with `aconnect` at startup.
    #[serde(default)]
    pub connections: Vec<(String, String)>,
    #[serde(default)]
    pub bindings: HashMap<String, Binding>,
    #[serde(default)]
    pub pipewire: PipewireConfig,
    #[serde(default, rename = "lv2Path", skip_serializing_if = "Option::is_none")]
    pub lv2_path: Option<String>,
    #[serde(default, rename = "stateFile", skip_serializing_if = "Option::is_none")]
    pub state_file: Option<String>,
}

fn default_mixer_node() -> String {
    "Mixer".to_string()
}

fn default_main_output() -> String {
    "Main Output".to_string()
}

impl Config {
    /// Load, validate and id-stamp a configuration file.
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path))?;

        let mut config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config: {}", path))?;

        config.validate()?;
        config.assign_ids();
        Ok(config)
    }

    /// Validate for correctness against the configured device.
    pub fn validate(&self) -> Result<()> {
        if self.input_midi.is_empty() {
            bail!("inputMidi cannot be empty");
        }
        if self.output_midi.is_empty() {
            bail!("outputMidi cannot be empty");
        }

        let device = Device::by_name(&self.device)
            .with_context(|| format!("no device description for {:?}", self.device))?;

        for (label, binding) in &self.bindings {
            match binding {
                Binding::Button { .. } => {
                    if device.button_by_label(label).is_none() {
                        bail!("binding {:?} names no button on {}", label, device.name);
                    }
                }
                Binding::Passthrough { out_channel, .. } => {
                    if device.dial_by_label(label).is_none() {
                        bail!("binding {:?} names no dial on {}", label, device.name);
                    }
                    if *out_channel > 15 {
                        bail!("binding {:?} output channel must be 0-15", label);
                    }
                }
            }

            for action in binding_actions(binding) {
                validate_action(action, &device)
                    .with_context(|| format!("invalid action under binding {:?}", label))?;
            }
        }

        for rule in &self.pipewire.rules {
            if rule.node.is_empty() {
                bail!("graph rule with empty node search term");
            }
            if let Some(MixerChannelSpec::Fixed(n)) = rule.mixer_channel {
                if n == 0 {
                    bail!("graph rule {:?}: mixer channels are numbered from 1", rule.node);
                }
            }
            for action in rule_actions(rule) {
                validate_action(action, &device)
                    .with_context(|| format!("invalid action under rule {:?}", rule.node))?;
            }
        }

        for plugin in &self.pipewire.plugins {
            if plugin.name.is_empty() || plugin.host.is_empty() || plugin.uri.is_empty() {
                bail!("plugin entries need name, host and uri");
            }
        }

        Ok(())
    }

    /// Stamp every command/cycle action with its structural hash.
    pub fn assign_ids(&mut self) {
        for binding in self.bindings.values_mut() {
            for action in binding_actions_mut(binding) {
                assign_action_id(action);
            }
        }
        for rule in &mut self.pipewire.rules {
            for action in rule
                .on_connect
                .iter_mut()
                .chain(rule.on_disconnect.iter_mut())
                .flatten()
            {
                assign_action_id(action);
            }
        }
    }
}

fn validate_action(action: &Action, device: &Device) -> Result<()> {
    match action {
        Action::Command { command, on_finish, .. } => {
            if command.is_empty() {
                bail!("command action with empty command line");
            }
            for a in on_finish {
                validate_action(a, device)?;
            }
        }
        Action::Mute { dial, .. } | Action::SetRange { dial, .. } => {
            if device.dial_by_label(dial).is_none() {
                bail!("action names unknown dial {:?}", dial);
            }
        }
        Action::LedSet { button, .. } | Action::LedSave { button } | Action::LedRestore { button } => {
            if device.button_by_label(button).is_none() {
                bail!("action names unknown button {:?}", button);
            }
        }
        Action::Cycle { items, .. } => {
            if items.is_empty() {
                bail!("cycle action with no items");
            }
            for item in items {
                for a in &item.actions {
                    validate_action(a, device)?;
                }
            }
        }
        Action::MixerSelect { channel, on_finish } => {
            if *channel == 0 {
                bail!("mixer channels are numbered from 1");
            }
            for a in on_finish {
                validate_action(a, device)?;
            }
        }
        Action::Cancel { alt } => {
            if let Some(alt) = alt {
                validate_action(alt, device)?;
            }
        }
        Action::Midi { events } => {
            for event in events {
                if matches!(event, MidiEvent::NoteOn { .. } | MidiEvent::NoteOff { .. }) {
                    bail!("note events cannot be passed through to the sequencer");
                }
            }
        }
        Action::Lv2LoadPreset { .. }
        | Action::Lv2ShowGui { .. }
        | Action::Link { .. }
        | Action::Unlink { .. }
        | Action::ExclusiveLink { .. }
        | Action::ConfigReload => {}
    }
    Ok(())
}

fn assign_action_id(action: &mut Action) {
    // Children first so nesting depth doesn't matter.
    match action {
        Action::Command { on_finish, .. } => {
            for a in on_finish.iter_mut() {
                assign_action_id(a);
            }
        }
        Action::Cycle { items, .. } => {
            for item in items.iter_mut() {
                for a in item.actions.iter_mut() {
                    assign_action_id(a);
                }
            }
        }
        Action::MixerSelect { on_finish, .. } => {
            for a in on_finish.iter_mut() {
                assign_action_id(a);
            }
        }
        Action::Cancel { alt: Some(alt) } => assign_action_id(alt),
        _ => {}
    }

    if matches!(action, Action::Command { .. } | Action::Cycle { .. }) {
        let new_id = structural_id(action);
        if let Action::Command { id, .. } | Action::Cycle { id, .. } = action {
            *id = new_id;
        }
    }
}

/// sha1 over the canonical JSON of the action definition. The `id` fields
/// are `serde(skip)`, so the hash is independent of assignment order.
fn structural_id(action: &Action) -> BindingId {
    let json = serde_json::to_vec(action).unwrap_or_default();
    BindingId(hex::encode(Sha1::digest(&json)))
}

fn binding_actions(binding: &Binding) -> Vec<&Action> {
    match binding {
        Binding::Button {
            on_press,
            on_long_press,
            on_shift_press,
            on_shift_long_press,
            on_release,
        } => [on_press, on_long_press, on_shift_press, on_shift_long_press, on_release]
            .into_iter()
            .flatten()
            .flat_map(|slot| slot.actions.iter())
            .collect(),
        Binding::Passthrough { .. } => Vec::new(),
    }
}

fn binding_actions_mut(binding: &mut Binding) -> Vec<&mut Action> {
    match binding {
        Binding::Button {
            on_press,
            on_long_press,
            on_shift_press,
            on_shift_long_press,
            on_release,
        } => [on_press, on_long_press, on_shift_press, on_shift_long_press, on_release]
            .into_iter()
            .flatten()
            .flat_map(|slot| slot.actions.iter_mut())
            .collect(),
        Binding::Passthrough { .. } => Vec::new(),
    }
}

fn rule_actions(rule: &GraphRule) -> impl Iterator<Item = &Action> {
    rule.on_connect
        .iter()
        .chain(rule.on_disconnect.iter())
        .flatten()
}
