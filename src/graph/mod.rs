//! Audio-graph snapshot: items ingested from the `pw-dump -m` stream,
//! with link indexes and name/port resolution on top.

pub mod links;
pub mod watch;

use anyhow::{bail, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Node,
    Port,
    Link,
    Device,
    Client,
    Factory,
    Metadata,
    Other,
}

impl<'de> serde::Deserialize<'de> for ItemKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "PipeWire:Interface:Node" => ItemKind::Node,
            "PipeWire:Interface:Port" => ItemKind::Port,
            "PipeWire:Interface:Link" => ItemKind::Link,
            "PipeWire:Interface:Device" => ItemKind::Device,
            "PipeWire:Interface:Client" => ItemKind::Client,
            "PipeWire:Interface:Factory" => ItemKind::Factory,
            "PipeWire:Interface:Metadata" => ItemKind::Metadata,
            _ => ItemKind::Other,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemInfo {
    #[serde(rename = "output-node-id")]
    pub output_node_id: Option<u32>,
    #[serde(rename = "output-port-id")]
    pub output_port_id: Option<u32>,
    #[serde(rename = "input-node-id")]
    pub input_node_id: Option<u32>,
    #[serde(rename = "input-port-id")]
    pub input_port_id: Option<u32>,
    #[serde(default)]
    pub props: serde_json::Map<String, Value>,
}

/// One object from the dump, upserted by id.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphItem {
    pub id: u32,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    #[serde(default)]
    pub info: ItemInfo,
}

/// What one monitor fragment says about an object.
#[derive(Debug, Clone)]
pub enum GraphChange {
    Upsert(GraphItem),
    Remove(u32),
}

impl GraphItem {
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.info.props.get(key).and_then(Value::as_str)
    }

    pub fn prop_u32(&self, key: &str) -> Option<u32> {
        match self.info.props.get(key)? {
            Value::Number(n) => n.as_u64().map(|n| n as u32),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// One link's endpoints, as stored in both index directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkEdge {
    pub output_node: u32,
    pub output_port: u32,
    pub input_node: u32,
    pub input_port: u32,
}

/// A `node:port` endpoint with enough identity for `pw-link`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRef {
    pub node_id: u32,
    pub port_id: u32,
    pub name: String,
}

/// A stereo mixer input channel, numbered from 1.
#[derive(Debug, Clone)]
pub struct MixerChannel {
    pub index: u32,
    pub left: PortRef,
    pub right: PortRef,
}

impl MixerChannel {
    pub fn label(&self) -> String {
        format!("Mixer Channel {}", self.index)
    }
}

/// The daemon's materialized view of the graph.
#[derive(Debug, Default)]
pub struct GraphState {
    items: HashMap<u32, GraphItem>,
    /// Link edges keyed by `"outNode:outPort"`.
    forward: HashMap<String, Vec<LinkEdge>>,
    /// Link edges keyed by `"inNode:inPort"`.
    reverse: HashMap<String, Vec<LinkEdge>>,
}

pub fn endpoint_key(node: u32, port: u32) -> String {
    format!("{}:{}", node, port)
}

impl GraphState {
    /// Apply a fragment of changes and rebuild the link indexes. A link
    /// item missing any endpoint id means the dump stream is broken in a
    /// way we can't recover a consistent view from.
    pub fn ingest(&mut self, fragment: Vec<GraphChange>) -> Result<()> {
        for change in fragment {
            match change {
                GraphChange::Upsert(item) => {
                    self.items.insert(item.id, item);
                }
                GraphChange::Remove(id) => {
                    self.items.remove(&id);
                }
            }
        }

        self.forward.clear();
        self.reverse.clear();
        for item in self.items.values() {
            if item.kind != ItemKind::Link {
                continue;
            }
            let info = &item.info;
            let (Some(on), Some(op), Some(inn), Some(ip)) = (
                info.output_node_id,
                info.output_port_id,
                info.input_node_id,
                info.input_port_id,
            ) else {
                bail!("link {} is missing endpoint ids", item.id);
            };
            let edge = LinkEdge {
                output_node: on,
                output_port: op,
                input_node: inn,
                input_port: ip,
            };
            self.forward.entry(endpoint_key(on, op)).or_default().push(edge);
            self.reverse.entry(endpoint_key(inn, ip)).or_default().push(edge);
        }
        Ok(())
    }

    pub fn links_from(&self, node: u32, port: u32) -> &[LinkEdge] {
        self.forward
            .get(&endpoint_key(node, port))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn links_to(&self, node: u32, port: u32) -> &[LinkEdge] {
        self.reverse
            .get(&endpoint_key(node, port))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Nodes matching a search term against `node.name` or
    /// `node.description`: exact match, or regex when prefixed `re:`.
    pub fn find_nodes(&self, term: &str) -> Vec<&GraphItem> {
        let matcher: Box<dyn Fn(&str) -> bool> = match term.strip_prefix("re:") {
            Some(pattern) => match Regex::new(pattern) {
                Ok(re) => Box::new(move |s: &str| re.is_match(s)),
                Err(e) => {
                    warn!("bad node search regex {:?}: {}", pattern, e);
                    return Vec::new();
                }
            },
            None => {
                let term = term.to_string();
                Box::new(move |s: &str| s == term)
            }
        };

        self.items
            .values()
            .filter(|item| item.kind == ItemKind::Node)
            .filter(|item| {
                item.prop("node.name").map(&matcher).unwrap_or(false)
                    || item.prop("node.description").map(&matcher).unwrap_or(false)
            })
            .collect()
    }

    /// A node's port by `port.name`.
    pub fn find_port(&self, node_id: u32, port_name: &str) -> Option<PortRef> {
        self.node_ports(node_id)
            .into_iter()
            .find(|p| p.prop("port.name") == Some(port_name))
            .map(port_ref)
    }

    fn node_ports(&self, node_id: u32) -> Vec<&GraphItem> {
        self.items
            .values()
            .filter(|item| item.kind == ItemKind::Port)
            .filter(|item| item.prop_u32("node.id") == Some(node_id))
            .collect()
    }

    /// Output ports of a node, sorted by name for stable L/R pairing.
    pub fn output_ports(&self, node_id: u32) -> Vec<PortRef> {
        let mut ports: Vec<PortRef> = self
            .node_ports(node_id)
            .into_iter()
            .filter(|p| p.prop("port.direction") == Some("out"))
            .map(port_ref)
            .collect();
        ports.sort_by(|a, b| a.name.cmp(&b.name));
        ports
    }

    /// Application playback streams, i.e. nodes with
    /// `media.class == "Stream/Output/Audio"`.
    pub fn audio_clients(&self) -> Vec<&GraphItem> {
        self.items
            .values()
            .filter(|item| item.kind == ItemKind::Node)
            .filter(|item| item.prop("media.class") == Some("Stream/Output/Audio"))
            .collect()
    }

    /// Stereo channels of the mixer node (matched by `node.description`).
    /// Input ports sort by the trailing integer in their name and pair up
    /// consecutively; an odd leftover port is dropped.
    pub fn mixer_channels(&self, mixer_description: &str) -> Vec<MixerChannel> {
        let Some(mixer) = self
            .items
            .values()
            .find(|item| {
                item.kind == ItemKind::Node
                    && item.prop("node.description") == Some(mixer_description)
            })
        else {
            return Vec::new();
        };

        let mut ports: Vec<(u32, PortRef)> = self
            .node_ports(mixer.id)
            .into_iter()
            .filter(|p| p.prop("port.direction") == Some("in"))
            .map(|p| {
                let r = port_ref(p);
                (port_ordinal(&r.name), r)
            })
            .collect();
        ports.sort_by_key(|(ord, _)| *ord);

        let mut channels = Vec::new();
        let mut iter = ports.into_iter();
        loop {
            let Some((_, left)) = iter.next() else { break };
            let Some((_, right)) = iter.next() else {
                warn!("mixer has an odd unpaired input port: {:?}", left.name);
                break;
            };
            channels.push(MixerChannel {
                index: channels.len() as u32 + 1,
                left,
                right,
            });
        }
        channels
    }

    /// A channel is free when nothing links into either of its ports.
    pub fn channel_is_free(&self, channel: &MixerChannel) -> bool {
        self.links_to(channel.left.node_id, channel.left.port_id).is_empty()
            && self.links_to(channel.right.node_id, channel.right.port_id).is_empty()
    }

    /// Index of the channel one of this node's links lands on, if any.
    pub fn assigned_mixer_channel(
        &self,
        node_id: u32,
        channels: &[MixerChannel],
    ) -> Option<usize> {
        channels.iter().position(|ch| {
            self.links_to(ch.left.node_id, ch.left.port_id)
                .iter()
                .chain(self.links_to(ch.right.node_id, ch.right.port_id))
                .any(|edge| edge.output_node == node_id)
        })
    }
}

fn port_ref(item: &GraphItem) -> PortRef {
    PortRef {
        node_id: item.prop_u32("node.id").unwrap_or(0),
        port_id: item.id,
        name: item.prop("port.name").unwrap_or("").to_string(),
    }
}

/// Trailing integer of a port name, for ordering mixer inputs.
fn port_ordinal(name: &str) -> u32 {
    let digits: String = name
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    match digits.parse() {
        Ok(n) => n,
        Err(_) => {
            warn!("mixer port name has no trailing number: {:?}", name);
            0
        }
    }
}
