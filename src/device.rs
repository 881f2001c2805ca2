//! Control-surface descriptions: buttons, dials, keys and LED codes.
//!
//! Only the AKAI APC Key 25 is described for now; adding a surface means
//! adding another constructor here and listing it in `Device::by_name`.

use crate::midi::ByteTriplet;
use std::collections::HashMap;
use tracing::warn;

/// One physical button: where it lives on the wire and which LED states
/// it supports (color name to LED data byte).
#[derive(Debug, Clone)]
pub struct Button {
    pub label: String,
    pub channel: u8,
    pub note: u8,
    pub led_states: Option<HashMap<String, u8>>,
}

/// One endless/absolute dial.
#[derive(Debug, Clone)]
pub struct Dial {
    pub label: String,
    pub channel: u8,
    pub controller: u8,
}

/// A control surface: buttons, dials, and the channel the melodic keys
/// transmit on (key events are logged and otherwise ignored).
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub buttons: Vec<Button>,
    pub dials: Vec<Dial>,
    pub keys_channel: u8,
}

impl Device {
    /// Look up the built-in description for a configured device name.
    pub fn by_name(name: &str) -> Option<Device> {
        match name {
            "APC Key 25 MIDI" => Some(apc_key_25()),
            _ => None,
        }
    }

    pub fn lookup_button(&self, channel: u8, note: u8) -> Option<&Button> {
        self.buttons
            .iter()
            .find(|b| b.channel == channel && b.note == note)
    }

    pub fn lookup_dial(&self, channel: u8, controller: u8) -> Option<&Dial> {
        self.dials
            .iter()
            .find(|d| d.channel == channel && d.controller == controller)
    }

    pub fn button_by_label(&self, label: &str) -> Option<&Button> {
        self.buttons.iter().find(|b| b.label == label)
    }

    pub fn dial_by_label(&self, label: &str) -> Option<&Dial> {
        self.dials.iter().find(|d| d.label == label)
    }
}

/// LED bytes for setting a button to a named color, or `None` when the
/// button has no LED or doesn't support the color (logged).
pub fn button_led_bytes(button: &Button, color: &str) -> Option<ByteTriplet> {
    let states = button.led_states.as_ref()?;
    match states.get(color) {
        Some(&code) => Some(ByteTriplet::led(button.channel, button.note, code)),
        None => {
            warn!(
                "button {:?} doesn't support requested color {:?}",
                button.label, color
            );
            None
        }
    }
}

fn grid_led_states() -> HashMap<String, u8> {
    [
        ("OFF", 0),
        ("GREEN", 1),
        ("GREEN_FLASHING", 2),
        ("RED", 3),
        ("RED_FLASHING", 4),
        ("AMBER", 5),
        ("AMBER_FLASHING", 6),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn on_off_led_states() -> HashMap<String, u8> {
    [("OFF", 0), ("ON", 1)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn apc_key_25() -> Device {
    let mut buttons = Vec::new();

    // 5x8 clip grid, bottom-left is note 0.
    for note in 0u8..40 {
        buttons.push(Button {
            label: format!("Button {}", note + 1),
            channel: 0,
            note,
            led_states: Some(grid_led_states()),
        });
    }

    let round = [
        (64u8, "Up"),
        (65, "Down"),
        (66, "Left"),
        (67, "Right"),
        (68, "Volume"),
        (69, "Pan"),
        (70, "Send"),
        (71, "Device"),
        (82, "Clip Stop"),
        (83, "Solo"),
        (84, "Rec Arm"),
        (85, "Mute"),
        (86, "Select"),
    ];
    for (note, label) in round {
        buttons.push(Button {
            label: label.to_string(),
            channel: 0,
            note,
            led_states: Some(on_off_led_states()),
        });
    }

    // No LED on these.
    for (note, label) in [(81u8, "Stop All Clips"), (91, "Play/Pause"), (93, "Rec"), (98, "Shift")]
    {
        buttons.push(Button {
            label: label.to_string(),
            channel: 0,
            note,
            led_states: None,
        });
    }

    let dials = (48u8..56)
        .enumerate()
        .map(|(i, controller)| Dial {
            label: format!("Dial {}", i + 1),
            channel: 0,
            controller,
        })
        .collect();

    Device {
        name: "APC Key 25 MIDI".to_string(),
        buttons,
        dials,
        keys_channel: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apc_lookup() {
        let dev = Device::by_name("APC Key 25 MIDI").unwrap();
        assert_eq!(dev.lookup_button(0, 98).unwrap().label, "Shift");
        assert_eq!(dev.lookup_button(0, 0).unwrap().label, "Button 1");
        assert_eq!(dev.lookup_dial(0, 48).unwrap().label, "Dial 1");
        assert!(dev.lookup_button(1, 0).is_none());
    }

    #[test]
    fn led_bytes_for_grid_button() {
        let dev = Device::by_name("APC Key 25 MIDI").unwrap();
        let b = dev.button_by_label("Button 3").unwrap();
        let t = button_led_bytes(b, "RED").unwrap();
        assert_eq!((t.b1, t.b2, t.b3), (0x90, 2, 3));
    }

    #[test]
    fn unsupported_color_is_none() {
        let dev = Device::by_name("APC Key 25 MIDI").unwrap();
        let b = dev.button_by_label("Solo").unwrap();
        assert!(button_led_bytes(b, "AMBER").is_none());
        // Shift has no LEDs at all.
        let shift = dev.button_by_label("Shift").unwrap();
        assert!(button_led_bytes(shift, "ON").is_none());
    }

    #[test]
    fn unknown_device_name() {
        assert!(Device::by_name("Launchpad").is_none());
    }
}
