//! Scenario tests for the daemon state machine, driven against fake
//! sinks: a recording link runner and in-memory sequencer/LED channels.

use super::actions::run_action;
use super::context::{DaemonContext, DaemonEvent};
use super::{events, handle_daemon_event, reconcile};
use crate::config::{Action, Binding, BindingId, Config};
use crate::device::Device;
use crate::graph::links::test_support::FakeRunner;
use crate::graph::test_support::{link, node, port, remove};
use crate::graph::GraphState;
use crate::midi::{ByteTriplet, MidiEvent};
use crate::midish;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Harness {
    midish_rx: mpsc::Receiver<String>,
    led_rx: mpsc::UnboundedReceiver<Vec<ByteTriplet>>,
    events_rx: mpsc::Receiver<DaemonEvent>,
    links: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn drain_leds(&mut self) -> Vec<ByteTriplet> {
        let mut all = Vec::new();
        while let Ok(batch) = self.led_rx.try_recv() {
            all.extend(batch);
        }
        all
    }

    fn link_calls(&self) -> Vec<String> {
        self.links.lock().unwrap().clone()
    }
}

fn ctx_from_yaml(yaml: &str) -> (DaemonContext, Harness) {
    let mut config: Config = serde_yaml::from_str(yaml).unwrap();
    config.validate().unwrap();
    config.assign_ids();
    let device = Device::by_name(&config.device).unwrap();

    let (midish_handle, midish_rx) = midish::channel();
    let (led_tx, led_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::channel(64);
    let (runner, links) = FakeRunner::new();
    let presence = config
        .pipewire
        .rules
        .iter()
        .map(|r| (r.node.clone(), false))
        .collect();

    let ctx = DaemonContext {
        config,
        config_path: "/dev/null".to_string(),
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
        graph: GraphState::default(),
        presence,
        midish: midish_handle,
        plugins: HashMap::new(),
        links: Box::new(runner),
        leds: led_tx,
        events: events_tx,
    };
    (ctx, Harness { midish_rx, led_rx, events_rx, links })
}

fn note_on(note: u8) -> MidiEvent {
    MidiEvent::NoteOn { channel: 0, note, velocity: 127 }
}

fn note_off(note: u8) -> MidiEvent {
    MidiEvent::NoteOff { channel: 0, note, velocity: 0 }
}

fn cc(controller: u8, value: u8) -> MidiEvent {
    MidiEvent::ControlChange { channel: 0, controller, value }
}

const DIAL_YAML: &str = r#"
device: "APC Key 25 MIDI"
inputMidi: "APC Key 25 MIDI"
outputMidi: "APC Key 25 MIDI"
bindings:
  "Dial 1":
    type: passthrough
    outChannel: 5
    outController: 7
"#;

#[tokio::test]
async fn dial_values_flow_to_the_sequencer() {
    let (mut ctx, mut h) = ctx_from_yaml(DIAL_YAML);
    events::handle_midi_event(&mut ctx, cc(48, 100)).await.unwrap();
    assert_eq!(h.midish_rx.recv().await.unwrap(), "oaddev {ctl out5 7 100}");
}

#[tokio::test]
async fn mute_swallows_and_unmute_republishes_once() {
    let (mut ctx, mut h) = ctx_from_yaml(DIAL_YAML);
    let dial = "Dial 1".to_string();

    events::handle_midi_event(&mut ctx, cc(48, 100)).await.unwrap();
    assert_eq!(h.midish_rx.recv().await.unwrap(), "oaddev {ctl out5 7 100}");

    // Muting pushes the floor through in spite of the gate.
    run_action(&mut ctx, &Action::Mute { dial: dial.clone(), mute: true }, None)
        .await
        .unwrap();
    assert_eq!(h.midish_rx.recv().await.unwrap(), "oaddev {ctl out5 7 0}");

    // Turns while muted go nowhere, but the raw value is tracked.
    events::handle_midi_event(&mut ctx, cc(48, 90)).await.unwrap();
    assert!(h.midish_rx.try_recv().is_err());

    run_action(&mut ctx, &Action::Mute { dial, mute: false }, None)
        .await
        .unwrap();
    assert_eq!(h.midish_rx.recv().await.unwrap(), "oaddev {ctl out5 7 90}");
    assert!(h.midish_rx.try_recv().is_err());
}

#[tokio::test]
async fn shift_freezes_the_dials() {
    let (mut ctx, mut h) = ctx_from_yaml(DIAL_YAML);

    events::handle_midi_event(&mut ctx, note_on(98)).await.unwrap();
    events::handle_midi_event(&mut ctx, cc(48, 100)).await.unwrap();
    // Nothing published, nothing recorded.
    assert!(h.midish_rx.try_recv().is_err());
    assert!(ctx.dials.is_empty());

    events::handle_midi_event(&mut ctx, note_off(98)).await.unwrap();
    events::handle_midi_event(&mut ctx, cc(48, 90)).await.unwrap();
    assert_eq!(h.midish_rx.recv().await.unwrap(), "oaddev {ctl out5 7 90}");
}

#[tokio::test]
async fn high_precision_dial_publishes_wide_controls() {
    let (mut ctx, mut h) = ctx_from_yaml(
        r#"
device: "APC Key 25 MIDI"
inputMidi: "APC Key 25 MIDI"
outputMidi: "APC Key 25 MIDI"
bindings:
  "Dial 1":
    type: passthrough
    outChannel: 5
    outController: 7
    highPrecision: true
"#,
    );
    events::handle_midi_event(&mut ctx, cc(48, 127)).await.unwrap();
    assert_eq!(h.midish_rx.recv().await.unwrap(), "oaddev {xctl out5 7 16383}");

    events::handle_midi_event(&mut ctx, cc(48, 0)).await.unwrap();
    assert_eq!(h.midish_rx.recv().await.unwrap(), "oaddev {xctl out5 7 0}");
}

#[tokio::test]
async fn range_override_rescales_published_values() {
    let (mut ctx, mut h) = ctx_from_yaml(DIAL_YAML);
    events::handle_midi_event(&mut ctx, cc(48, 127)).await.unwrap();
    assert_eq!(h.midish_rx.recv().await.unwrap(), "oaddev {ctl out5 7 127}");

    // Installing a range republishes the current value through it.
    run_action(
        &mut ctx,
        &Action::SetRange { dial: "Dial 1".to_string(), range: [0.0, 0.5] },
        None,
    )
    .await
    .unwrap();
    assert_eq!(h.midish_rx.recv().await.unwrap(), "oaddev {ctl out5 7 64}");
}

const PRESS_YAML: &str = r#"
device: "APC Key 25 MIDI"
inputMidi: "APC Key 25 MIDI"
outputMidi: "APC Key 25 MIDI"
bindings:
  "Button 1":
    type: button
    onPress:
      color: GREEN
      actions: []
    onLongPress:
      color: RED
      actions: []
"#;

#[tokio::test(start_paused = true)]
async fn quick_release_resolves_to_a_short_press() {
    let (mut ctx, mut h) = ctx_from_yaml(PRESS_YAML);

    events::handle_midi_event(&mut ctx, note_on(0)).await.unwrap();
    // Nothing resolves while the button is held.
    assert!(h.drain_leds().is_empty());

    tokio::time::advance(Duration::from_millis(100)).await;
    events::handle_midi_event(&mut ctx, note_off(0)).await.unwrap();
    assert_eq!(h.drain_leds(), vec![ByteTriplet::led(0, 0, 1)]);

    // The aborted timer never fires.
    assert!(timeout(Duration::from_secs(2), h.events_rx.recv()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn held_button_resolves_to_a_long_press() {
    let (mut ctx, mut h) = ctx_from_yaml(PRESS_YAML);

    events::handle_midi_event(&mut ctx, note_on(0)).await.unwrap();
    let event = timeout(Duration::from_secs(2), h.events_rx.recv())
        .await
        .expect("long-press timer should fire")
        .unwrap();
    assert!(matches!(event, DaemonEvent::LongPressFired { ref button } if button == "Button 1"));

    handle_daemon_event(&mut ctx, event).await;
    assert_eq!(h.drain_leds(), vec![ByteTriplet::led(0, 0, 3)]);

    // The release runs no short-press slot anymore.
    events::handle_midi_event(&mut ctx, note_off(0)).await.unwrap();
    assert!(h.drain_leds().is_empty());
}

#[tokio::test]
async fn shift_routes_to_the_shift_slot() {
    let (mut ctx, mut h) = ctx_from_yaml(
        r#"
device: "APC Key 25 MIDI"
inputMidi: "APC Key 25 MIDI"
outputMidi: "APC Key 25 MIDI"
bindings:
  "Button 1":
    type: button
    onPress:
      color: GREEN
      actions: []
    onShiftPress:
      color: AMBER
      actions: []
"#,
    );

    events::handle_midi_event(&mut ctx, note_on(98)).await.unwrap();
    assert!(ctx.shift);
    events::handle_midi_event(&mut ctx, note_on(0)).await.unwrap();
    assert_eq!(h.drain_leds(), vec![ByteTriplet::led(0, 0, 5)]);

    events::handle_midi_event(&mut ctx, note_off(98)).await.unwrap();
    events::handle_midi_event(&mut ctx, note_off(0)).await.unwrap();
    events::handle_midi_event(&mut ctx, note_on(0)).await.unwrap();
    assert_eq!(h.drain_leds(), vec![ByteTriplet::led(0, 0, 1)]);
}

#[tokio::test]
async fn cancelable_command_settles_once() {
    let (mut ctx, mut h) = ctx_from_yaml(
        r#"
device: "APC Key 25 MIDI"
inputMidi: "APC Key 25 MIDI"
outputMidi: "APC Key 25 MIDI"
bindings:
  "Button 1":
    type: button
    onPress:
      actions:
        - type: command
          command: "sleep 30"
          cancelable: true
          onFinish:
            - type: "led::set"
              button: "Button 1"
              color: GREEN
"#,
    );

    let started = std::time::Instant::now();
    events::handle_midi_event(&mut ctx, note_on(0)).await.unwrap();
    events::handle_midi_event(&mut ctx, note_off(0)).await.unwrap();
    assert_eq!(ctx.commands.len(), 1);

    // Second press kills the running command instead of restarting it.
    events::handle_midi_event(&mut ctx, note_on(0)).await.unwrap();

    let event = timeout(Duration::from_secs(5), h.events_rx.recv())
        .await
        .expect("the killed command should settle")
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));
    handle_daemon_event(&mut ctx, event).await;

    assert!(ctx.commands.is_empty());
    assert_eq!(h.drain_leds(), vec![ByteTriplet::led(0, 0, 1)]);
    // No second settle.
    assert!(h.events_rx.try_recv().is_err());
}

#[tokio::test]
async fn cycle_advances_and_previews_the_next_item() {
    let (mut ctx, mut h) = ctx_from_yaml(
        r#"
device: "APC Key 25 MIDI"
inputMidi: "APC Key 25 MIDI"
outputMidi: "APC Key 25 MIDI"
bindings:
  "Button 1":
    type: button
    onPress:
      actions:
        - type: cycle
          items:
            - color: GREEN
              actions:
                - { type: "led::set", button: "Button 2", color: GREEN }
            - color: RED
              actions:
                - { type: "led::set", button: "Button 2", color: RED }
"#,
    );

    // The counter advances before running, so the first press lands on
    // the second item; Button 1 previews the one after it.
    events::handle_midi_event(&mut ctx, note_on(0)).await.unwrap();
    assert_eq!(
        h.drain_leds(),
        vec![ByteTriplet::led(0, 1, 3), ByteTriplet::led(0, 0, 1)]
    );

    events::handle_midi_event(&mut ctx, note_on(0)).await.unwrap();
    assert_eq!(
        h.drain_leds(),
        vec![ByteTriplet::led(0, 1, 1), ByteTriplet::led(0, 0, 3)]
    );

    let id = match &ctx.config.bindings["Button 1"] {
        Binding::Button { on_press: Some(slot), .. } => match &slot.actions[0] {
            Action::Cycle { id, .. } => id.clone(),
            _ => panic!("expected a cycle"),
        },
        _ => panic!("expected a button"),
    };
    assert_eq!(ctx.cycle_states.get(&id), Some(&0));
}

const RULE_YAML: &str = r#"
device: "APC Key 25 MIDI"
inputMidi: "APC Key 25 MIDI"
outputMidi: "APC Key 25 MIDI"
pipewire:
  rules:
    - node: "spotify"
      mixerChannel: round_robin
      onConnect:
        - { type: "led::set", button: "Button 3", color: GREEN }
      onDisconnect:
        - { type: "led::set", button: "Button 3", color: OFF }
"#;

fn mixer_fragment() -> Vec<crate::graph::GraphChange> {
    vec![
        node(1, "mixer.node", "Mixer", None),
        port(10, 1, "playback_1", "in"),
        port(11, 1, "playback_2", "in"),
        port(12, 1, "playback_3", "in"),
        port(13, 1, "playback_4", "in"),
    ]
}

#[tokio::test]
async fn hotplug_edges_fire_exactly_once() {
    let (mut ctx, mut h) = ctx_from_yaml(RULE_YAML);
    ctx.graph.ingest(mixer_fragment()).unwrap();

    reconcile(&mut ctx).await.unwrap();
    assert!(h.drain_leds().is_empty());

    ctx.graph
        .ingest(vec![
            node(2, "spotify", "Spotify", Some("Stream/Output/Audio")),
            port(20, 2, "output_FL", "out"),
            port(21, 2, "output_FR", "out"),
        ])
        .unwrap();

    reconcile(&mut ctx).await.unwrap();
    assert_eq!(h.drain_leds(), vec![ByteTriplet::led(0, 2, 1)]);

    // A burst of more fragments for the same node changes nothing.
    reconcile(&mut ctx).await.unwrap();
    assert!(h.drain_leds().is_empty());

    ctx.graph.ingest(vec![remove(2)]).unwrap();
    reconcile(&mut ctx).await.unwrap();
    assert_eq!(h.drain_leds(), vec![ByteTriplet::led(0, 2, 0)]);
}

#[tokio::test]
async fn round_robin_takes_the_first_free_channel() {
    let (mut ctx, h) = ctx_from_yaml(RULE_YAML);
    let mut fragment = mixer_fragment();
    fragment.extend([
        node(2, "spotify", "Spotify", Some("Stream/Output/Audio")),
        port(20, 2, "output_FL", "out"),
        port(21, 2, "output_FR", "out"),
        // Channel 1 is taken by someone else.
        node(3, "game", "Game", Some("Stream/Output/Audio")),
        port(30, 3, "output_FL", "out"),
        port(31, 3, "output_FR", "out"),
        link(100, 3, 30, 1, 10),
        link(101, 3, 31, 1, 11),
    ]);
    ctx.graph.ingest(fragment).unwrap();

    reconcile(&mut ctx).await.unwrap();
    let calls = h.link_calls();
    assert!(calls.contains(&"create 20->12".to_string()));
    assert!(calls.contains(&"create 21->13".to_string()));

    // Once the graph reflects the links, reconciles are quiet.
    ctx.graph
        .ingest(vec![link(102, 2, 20, 1, 12), link(103, 2, 21, 1, 13)])
        .unwrap();
    let before = h.link_calls().len();
    reconcile(&mut ctx).await.unwrap();
    assert_eq!(h.link_calls().len(), before);
}

#[tokio::test]
async fn round_robin_with_no_free_channel_is_a_noop() {
    let (mut ctx, h) = ctx_from_yaml(RULE_YAML);
    let mut fragment: Vec<crate::graph::GraphChange> = vec![
        node(1, "mixer.node", "Mixer", None),
        port(10, 1, "playback_1", "in"),
        port(11, 1, "playback_2", "in"),
        node(2, "spotify", "Spotify", Some("Stream/Output/Audio")),
        port(20, 2, "output_FL", "out"),
        port(21, 2, "output_FR", "out"),
    ];
    fragment.extend([
        node(3, "game", "Game", Some("Stream/Output/Audio")),
        port(30, 3, "output_FL", "out"),
        port(31, 3, "output_FR", "out"),
        link(100, 3, 30, 1, 10),
        link(101, 3, 31, 1, 11),
    ]);
    ctx.graph.ingest(fragment).unwrap();

    reconcile(&mut ctx).await.unwrap();
    assert!(h.link_calls().iter().all(|c| !c.starts_with("create 20")));
    assert!(h.link_calls().iter().all(|c| !c.starts_with("create 21")));
}

#[tokio::test]
async fn second_instance_joins_the_occupied_channel() {
    let (mut ctx, h) = ctx_from_yaml(RULE_YAML);
    let mut fragment = mixer_fragment();
    fragment.extend([
        // One instance already sits on channel 2.
        node(2, "spotify", "Spotify", Some("Stream/Output/Audio")),
        port(20, 2, "output_FL", "out"),
        port(21, 2, "output_FR", "out"),
        link(100, 2, 20, 1, 12),
        link(101, 2, 21, 1, 13),
        node(4, "spotify", "Spotify", Some("Stream/Output/Audio")),
        port(40, 4, "output_FL", "out"),
        port(41, 4, "output_FR", "out"),
    ]);
    ctx.graph.ingest(fragment).unwrap();

    reconcile(&mut ctx).await.unwrap();
    let calls = h.link_calls();
    // The newcomer lands on the occupied channel, not a free one.
    assert!(calls.contains(&"create 40->12".to_string()));
    assert!(calls.contains(&"create 41->13".to_string()));
    assert!(!calls.iter().any(|c| c == "create 40->10" || c == "create 41->11"));
    // The resident's links already exist.
    assert!(!calls.iter().any(|c| c.starts_with("create 20") || c.starts_with("create 21")));
}

#[tokio::test]
async fn reselect_while_a_prompt_is_open_is_swallowed() {
    let (mut ctx, mut h) = ctx_from_yaml(DIAL_YAML);
    ctx.prompt_open = true;

    run_action(
        &mut ctx,
        &Action::MixerSelect {
            channel: 1,
            on_finish: vec![Action::LedSet {
                button: "Button 1".to_string(),
                color: "GREEN".to_string(),
            }],
        },
        None,
    )
    .await
    .unwrap();

    // The open prompt's own finish chain must stay the only one.
    assert!(h.drain_leds().is_empty());
    assert!(h.events_rx.try_recv().is_err());
}

#[tokio::test]
async fn led_save_and_restore_round_trip() {
    let (mut ctx, mut h) = ctx_from_yaml(PRESS_YAML);
    let set = |color: &str| Action::LedSet {
        button: "Button 1".to_string(),
        color: color.to_string(),
    };

    run_action(&mut ctx, &set("AMBER"), None).await.unwrap();
    run_action(&mut ctx, &Action::LedSave { button: "Button 1".to_string() }, None)
        .await
        .unwrap();
    run_action(&mut ctx, &set("RED"), None).await.unwrap();
    run_action(&mut ctx, &Action::LedRestore { button: "Button 1".to_string() }, None)
        .await
        .unwrap();

    let leds = h.drain_leds();
    assert_eq!(
        leds,
        vec![
            ByteTriplet::led(0, 0, 5),
            ByteTriplet::led(0, 0, 3),
            ByteTriplet::led(0, 0, 5),
        ]
    );
    assert_eq!(ctx.button_colors.get("Button 1").map(String::as_str), Some("AMBER"));
}

#[tokio::test]
async fn stale_command_completion_is_ignored() {
    let (mut ctx, mut h) = ctx_from_yaml(DIAL_YAML);
    let event = DaemonEvent::CommandExited {
        id: BindingId("deadbeef".to_string()),
        started: tokio::time::Instant::now(),
        on_finish: vec![Action::LedSet {
            button: "Button 1".to_string(),
            color: "GREEN".to_string(),
        }],
    };
    handle_daemon_event(&mut ctx, event).await;
    assert!(h.drain_leds().is_empty());
}
