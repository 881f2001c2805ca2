//! Shell helpers: one-shot commands, `amidi` port lookup, `aconnect`
//! device plumbing, and the typed failure carried to the exit code.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A supervised external process ended abnormally. The daemon's exit code
/// mirrors the failing component's.
#[derive(Debug, thiserror::Error)]
#[error("{id} exited with code {code}")]
pub struct ProcessFailure {
    pub id: String,
    pub code: i32,
}

/// Exit code to report for a supervised process that shouldn't have
/// exited at all. A "clean" exit is still a failure here.
pub fn failure_code(status: std::process::ExitStatus) -> i32 {
    match status.code() {
        Some(0) | None => 1,
        Some(code) => code,
    }
}

/// Run a command line through `sh -c`, returning trimmed stdout. Non-zero
/// exit is an error carrying stderr.
pub async fn run(command: &str) -> Result<String> {
    debug!("running: {}", command);
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .with_context(|| format!("failed to spawn: {}", command))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "command failed ({}): {}\n{}",
            output.status,
            command,
            stderr.trim()
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Resolve a hardware port like `hw:2,0,0` from `amidi -l` output by
/// device name substring.
pub async fn find_device_port(device_name: &str) -> Result<String> {
    let listing = run("amidi -l").await.context("failed to list MIDI ports")?;
    match parse_amidi_listing(&listing, device_name) {
        Some(port) => {
            info!("found {} on port {}", device_name, port);
            Ok(port)
        }
        None => Err(anyhow!("MIDI device not found: {}", device_name)),
    }
}

fn parse_amidi_listing(listing: &str, device_name: &str) -> Option<String> {
    // Lines look like "IO  hw:2,0,0  APC Key 25 MIDI 1".
    for line in listing.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let _dir = fields.next()?;
        let port = fields.next()?;
        let name = fields.collect::<Vec<_>>().join(" ");
        if name.contains(device_name) {
            return Some(port.to_string());
        }
    }
    None
}

/// Wire up configured ALSA sequencer client pairs with `aconnect`.
/// Already-connected pairs are fine; a missing client is an error.
pub async fn connect_midi_devices(connections: &[(String, String)]) -> Result<()> {
    if connections.is_empty() {
        return Ok(());
    }

    let listing = run("aconnect --list")
        .await
        .context("failed to list sequencer clients")?;
    let clients = parse_aconnect_clients(&listing);

    for (from, to) in connections {
        let from_id = lookup_client(&clients, from)?;
        let to_id = lookup_client(&clients, to)?;

        let output = Command::new("aconnect")
            .arg(from_id.to_string())
            .arg(to_id.to_string())
            .output()
            .await
            .context("failed to spawn aconnect")?;

        if output.status.success() {
            info!("connected {} -> {}", from, to);
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("already subscribed") {
                debug!("{} -> {} already connected", from, to);
            } else {
                warn!("aconnect {} -> {} failed: {}", from, to, stderr.trim());
            }
        }
    }

    Ok(())
}

fn lookup_client(clients: &[(u32, String)], name: &str) -> Result<u32> {
    clients
        .iter()
        .find(|(_, n)| n.contains(name))
        .map(|(id, _)| *id)
        .ok_or_else(|| anyhow!("sequencer client not found: {}", name))
}

fn parse_aconnect_clients(listing: &str) -> Vec<(u32, String)> {
    let re = match Regex::new(r"client (\d+): '(.*?)'") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    re.captures_iter(listing)
        .filter_map(|cap| {
            let id = cap[1].parse().ok()?;
            Some((id, cap[2].to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amidi_listing_finds_port() {
        let listing = "Dir Device    Name\n\
                       IO  hw:1,0,0  Midi Through Port-0\n\
                       IO  hw:2,0,0  APC Key 25 MIDI 1\n";
        assert_eq!(
            parse_amidi_listing(listing, "APC Key 25 MIDI"),
            Some("hw:2,0,0".to_string())
        );
        assert_eq!(parse_amidi_listing(listing, "Launchpad"), None);
    }

    #[test]
    fn aconnect_listing_parses_clients() {
        let listing = "client 0: 'System' [type=kernel]\n\
                       \t0 'Timer '\n\
                       client 14: 'Midi Through' [type=kernel]\n\
                       client 128: 'midish' [type=user,pid=1234]\n";
        let clients = parse_aconnect_clients(listing);
        assert_eq!(clients.len(), 3);
        assert_eq!(lookup_client(&clients, "midish").unwrap(), 128);
        assert!(lookup_client(&clients, "fluidsynth").is_err());
    }

    #[tokio::test]
    async fn run_captures_stdout_and_failure() {
        assert_eq!(run("echo hello").await.unwrap(), "hello");
        let err = run("echo nope >&2; exit 3").await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
