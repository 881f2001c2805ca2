//! Link manipulation: idempotent create/destroy on top of the graph
//! view, the connect modes, and the `pw-link` executor seam.

use super::{GraphState, MixerChannel, PortRef};
use crate::config::NodeAndPort;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Executes link create/destroy against the running graph. Production
/// shells out to `pw-link`; tests substitute a recording fake.
#[async_trait]
pub trait LinkRunner: Send + Sync {
    async fn create(&self, output_port: u32, input_port: u32) -> Result<()>;
    async fn destroy(&self, output_port: u32, input_port: u32) -> Result<()>;
}

pub struct PwLink;

#[async_trait]
impl LinkRunner for PwLink {
    async fn create(&self, output_port: u32, input_port: u32) -> Result<()> {
        pw_link(&[&output_port.to_string(), &input_port.to_string()]).await
    }

    async fn destroy(&self, output_port: u32, input_port: u32) -> Result<()> {
        pw_link(&["-d", &output_port.to_string(), &input_port.to_string()]).await
    }
}

/// `pw-link` races against the graph all the time; "File exists" and
/// "No such file or directory" just mean someone got there first.
async fn pw_link(args: &[&str]) -> Result<()> {
    let output = Command::new("pw-link")
        .args(args)
        .output()
        .await
        .map_err(|e| anyhow!("failed to spawn pw-link: {}", e))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("File exists") || stderr.contains("No such file or directory") {
        debug!("pw-link {:?}: {}", args, stderr.trim());
        Ok(())
    } else {
        Err(anyhow!("pw-link {:?} failed: {}", args, stderr.trim()))
    }
}

/// How an application gets attached to a mixer channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectMode {
    /// Add the new links, touch nothing else.
    Plain,
    /// Sever every other link from the source ports first.
    Exclusive,
    /// Sever only links into the main output, leaving effect sends and
    /// the like alone.
    #[default]
    Smart,
}

/// Create a link unless the graph already shows it.
pub async fn ensure_link(
    graph: &GraphState,
    runner: &dyn LinkRunner,
    src: &PortRef,
    dest: &PortRef,
) -> Result<()> {
    let exists = graph
        .links_from(src.node_id, src.port_id)
        .iter()
        .any(|e| e.input_node == dest.node_id && e.input_port == dest.port_id);
    if exists {
        debug!("link {}:{} -> {}:{} already up", src.node_id, src.name, dest.node_id, dest.name);
        return Ok(());
    }
    info!("linking {}:{} -> {}:{}", src.node_id, src.name, dest.node_id, dest.name);
    runner.create(src.port_id, dest.port_id).await
}

/// Destroy a link if the graph shows it.
pub async fn destroy_link(
    graph: &GraphState,
    runner: &dyn LinkRunner,
    src: &PortRef,
    dest: &PortRef,
) -> Result<()> {
    let exists = graph
        .links_from(src.node_id, src.port_id)
        .iter()
        .any(|e| e.input_node == dest.node_id && e.input_port == dest.port_id);
    if !exists {
        return Ok(());
    }
    info!("unlinking {}:{} -> {}:{}", src.node_id, src.name, dest.node_id, dest.name);
    runner.destroy(src.port_id, dest.port_id).await
}

/// Make `dest` the sole destination of `src`: every other link from the
/// source port is destroyed, then the wanted one ensured.
pub async fn exclusive_link(
    graph: &GraphState,
    runner: &dyn LinkRunner,
    src: &PortRef,
    dest: &PortRef,
) -> Result<()> {
    for edge in graph.links_from(src.node_id, src.port_id) {
        if edge.input_node == dest.node_id && edge.input_port == dest.port_id {
            continue;
        }
        runner.destroy(edge.output_port, edge.input_port).await?;
    }
    ensure_link(graph, runner, src, dest).await
}

/// Attach an application node to a stereo mixer channel. Output ports
/// pair with the channel's L/R in sorted order; a mono app feeds both
/// sides. `main_output_ids` is the set of node ids smart mode may steal
/// links away from.
pub async fn connect_to_mixer(
    graph: &GraphState,
    runner: &dyn LinkRunner,
    app_node: u32,
    channel: &MixerChannel,
    mode: ConnectMode,
    main_output_ids: &[u32],
) -> Result<()> {
    let ports = graph.output_ports(app_node);
    if ports.is_empty() {
        warn!("node {} has no output ports yet, not connecting", app_node);
        return Ok(());
    }

    let pairs: Vec<(&PortRef, &PortRef)> = if ports.len() == 1 {
        vec![(&ports[0], &channel.left), (&ports[0], &channel.right)]
    } else {
        ports
            .iter()
            .zip([&channel.left, &channel.right])
            .collect()
    };

    for src in &ports {
        for edge in graph.links_from(src.node_id, src.port_id) {
            let wanted = pairs
                .iter()
                .any(|(s, d)| s.port_id == edge.output_port && d.port_id == edge.input_port);
            if wanted {
                continue;
            }
            let doomed = match mode {
                ConnectMode::Plain => false,
                ConnectMode::Exclusive => true,
                ConnectMode::Smart => main_output_ids.contains(&edge.input_node),
            };
            if doomed {
                runner.destroy(edge.output_port, edge.input_port).await?;
            }
        }
    }

    for (src, dest) in pairs {
        ensure_link(graph, runner, src, dest).await?;
    }
    Ok(())
}

/// Resolve a configured `node`/`port` pair against the current graph.
/// Ambiguity takes the first match; total absence is an error.
pub fn resolve_endpoint(graph: &GraphState, endpoint: &NodeAndPort) -> Result<PortRef> {
    let nodes = graph.find_nodes(&endpoint.node);
    if nodes.len() > 1 {
        warn!("search term {:?} matches {} nodes, using the first", endpoint.node, nodes.len());
    }
    let node = nodes
        .first()
        .ok_or_else(|| anyhow!("no node matches {:?}", endpoint.node))?;
    graph
        .find_port(node.id, &endpoint.port)
        .ok_or_else(|| anyhow!("node {:?} has no port {:?}", endpoint.node, endpoint.port))
}
