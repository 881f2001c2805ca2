//! LV2 plugin hosting through jalv's line-oriented console.

use crate::config::PluginConfig;
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Writes console commands (`preset <name>`, `show`) to one running
/// plugin host.
#[derive(Clone)]
pub struct PluginHandle {
    pub name: String,
    tx: mpsc::Sender<String>,
}

impl PluginHandle {
    pub async fn send(&self, command: String) {
        if self.tx.send(command).await.is_err() {
            warn!("plugin {} is gone, command dropped", self.name);
        }
    }
}

pub fn channel(name: &str) -> (PluginHandle, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(16);
    (PluginHandle { name: name.to_string(), tx }, rx)
}

/// Host one plugin for the lifetime of the daemon. A crashing plugin is
/// logged and tolerated; the rest of the daemon keeps running.
pub async fn run(
    plugin: PluginConfig,
    lv2_path: Option<String>,
    mut rx: mpsc::Receiver<String>,
) -> Result<()> {
    let mut command = Command::new("stdbuf");
    command
        .args(["-i0", "-o0", "-e0", &plugin.host])
        .arg("-n")
        .arg(&plugin.name)
        .arg(&plugin.uri)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    if let Some(path) = &lv2_path {
        command.env("LV2_PATH", path);
    }
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn plugin host for {}", plugin.name))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("plugin stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("plugin stdout not captured"))?;
    let mut lines = BufReader::new(stdout).lines();

    // Priming the console makes jalv start emitting prompt lines, which
    // is the only readiness signal it gives.
    stdin
        .write_all(b"presets\n")
        .await
        .context("plugin prime write failed")?;
    info!("plugin {} started", plugin.name);

    let control_echo = Regex::new(r"^\s*\S+\s*=\s").context("control echo regex")?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("plugin read failed")? {
                    Some(line) => {
                        // Prompts and control-value echoes are noise.
                        if line.starts_with('>') || control_echo.is_match(&line) {
                            continue;
                        }
                        debug!("{}: {}", plugin.name, line);
                    }
                    None => {
                        warn!("plugin {} exited, continuing without it", plugin.name);
                        let _ = child.wait().await;
                        return Ok(());
                    }
                }
            }
            command = rx.recv() => {
                let Some(command) = command else {
                    debug!("plugin {} channel closed", plugin.name);
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Ok(());
                };
                debug!("{} <- {}", plugin.name, command);
                stdin
                    .write_all(format!("{}\n", command).as_bytes())
                    .await
                    .context("plugin write failed")?;
            }
        }
    }
}
