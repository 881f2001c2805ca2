//! Monitors the graph via `pw-dump -m`, carving JSON array fragments out
//! of the byte stream and feeding them to the main loop.

use super::{GraphChange, GraphItem};
use crate::proc::{failure_code, ProcessFailure};
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Runs for the lifetime of the daemon. A clean receiver drop means
/// shutdown; the monitor exiting on its own is a component failure.
pub async fn run(tx: mpsc::Sender<Vec<GraphChange>>) -> Result<()> {
    let mut child = Command::new("pw-dump")
        .arg("-m")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn pw-dump")?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("pw-dump stdout not captured"))?;

    info!("graph monitor started");
    let mut buf = String::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = stdout.read(&mut chunk).await.context("pw-dump read failed")?;
        if n == 0 {
            break;
        }
        buf.push_str(&String::from_utf8_lossy(&chunk[..n]));

        while let Some(fragment) = next_fragment(&mut buf) {
            match parse_fragment(&fragment) {
                Ok(items) if items.is_empty() => {}
                Ok(items) => {
                    if tx.send(items).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => error!("unparseable graph fragment: {}", e),
            }
        }
    }

    let status = child.wait().await.context("pw-dump wait failed")?;
    Err(ProcessFailure {
        id: "pw-dump".to_string(),
        code: failure_code(status),
    }
    .into())
}

/// Pull the next complete `[ ... ]` array off the front of the buffer.
/// Arrays start at the beginning of a line and end with a `]` on its own
/// line.
fn next_fragment(buf: &mut String) -> Option<String> {
    let end = buf.find("\n]")?;
    let fragment: String = buf.drain(..end + 2).collect();
    let start = fragment.rfind("\n[").map(|i| i + 1).unwrap_or_else(|| {
        if fragment.starts_with('[') {
            0
        } else {
            fragment.len()
        }
    });
    if start >= fragment.len() {
        debug!("discarding non-array monitor output");
        return Some(String::new());
    }
    Some(fragment[start..].to_string())
}

/// Decode one fragment. Records with a null `info` (or no `type`) are
/// how the monitor reports removed objects.
fn parse_fragment(fragment: &str) -> Result<Vec<GraphChange>> {
    if fragment.is_empty() {
        return Ok(Vec::new());
    }
    let values: Vec<Value> = serde_json::from_str(fragment).context("not a JSON array")?;
    let mut changes = Vec::new();
    for value in values {
        let removed = value.get("info").map(Value::is_null).unwrap_or(true)
            || value.get("type").and_then(Value::as_str).is_none();
        if removed {
            match value.get("id").and_then(Value::as_u64) {
                Some(id) => changes.push(GraphChange::Remove(id as u32)),
                None => debug!("skipping graph record without an id"),
            }
            continue;
        }
        match serde_json::from_value::<GraphItem>(value) {
            Ok(item) => changes.push(GraphChange::Upsert(item)),
            Err(e) => debug!("skipping undecodable graph record: {}", e),
        }
    }
    Ok(changes)
}
