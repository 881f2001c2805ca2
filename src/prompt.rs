//! On-screen chooser via `rofi -dmenu`.

use anyhow::{anyhow, Context, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Present the options and return the chosen one, or `None` when the
/// prompt was dismissed. The caller ensures only one prompt is open at
/// a time.
pub async fn choose(title: &str, options: &[String]) -> Result<Option<String>> {
    let mut child = Command::new("rofi")
        .args(["-dmenu", "-i", "-p", title])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn rofi")?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("rofi stdin not captured"))?;
    stdin
        .write_all(options.join("\n").as_bytes())
        .await
        .context("rofi write failed")?;
    drop(stdin);

    let output = child.wait_with_output().await.context("rofi wait failed")?;
    if !output.status.success() {
        debug!("prompt dismissed");
        return Ok(None);
    }
    let choice = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok(if choice.is_empty() { None } else { Some(choice) })
}

/// Ask the window manager to deliver Escape to the focused window,
/// closing an open prompt from the outside.
pub async fn dismiss() -> Result<()> {
    crate::proc::run("xdotool key Escape").await.map(|_| ())
}
