//! Device info reporter.
//!
//! Collects best-effort device facts (hostname, outbound IP, OS release)
//! and publishes them upstream once a minute.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetd_core::client::ApiClient;
use fleetd_core::models::DeviceInfo;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::warn;

const REPORT_INTERVAL: Duration = Duration::from_secs(60);
const REPORT_DEADLINE: Duration = Duration::from_secs(60);

/// Publishes [`DeviceInfo`] on a fixed cadence.
pub struct InfoReporter {
    client: Arc<dyn ApiClient>,
    version: String,
}

impl InfoReporter {
    /// Creates a reporter publishing through `client` for an agent running
    /// `version`.
    #[must_use]
    pub fn new(client: Arc<dyn ApiClient>, version: impl Into<String>) -> Self {
        Self {
            client,
            version: version.into(),
        }
    }

    /// Runs until the stop signal fires.
    pub async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(REPORT_INTERVAL);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = ticker.tick() => {}
            }

            let info = collect_device_info(&self.version);
            match timeout(REPORT_DEADLINE, self.client.set_device_info(&info)).await {
                Ok(Ok(())) => {},
                Ok(Err(err)) => warn!(error = %err, "report device info"),
                Err(_) => warn!("report device info timed out"),
            }
        }
    }
}

/// Collects the current device facts. Every field except the agent version
/// is best-effort.
#[must_use]
pub fn collect_device_info(version: &str) -> DeviceInfo {
    DeviceInfo {
        agent_version: version.to_string(),
        hostname: hostname(),
        ip_address: outbound_ip(),
        os_release: os_release(),
        reported_at: Some(Utc::now()),
    }
}

fn hostname() -> Option<String> {
    let raw = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| std::fs::read_to_string("/etc/hostname"))
        .ok()?;
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// The address the default route would source from. Connecting a UDP socket
/// sends no packets; it only asks the kernel for a route.
fn outbound_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("1.1.1.1:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

fn os_release() -> Option<String> {
    let contents = std::fs::read_to_string("/etc/os-release").ok()?;
    parse_os_release(&contents)
}

fn parse_os_release(contents: &str) -> Option<String> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim().trim_matches('"').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_release_pretty_name() {
        let contents = "NAME=\"Debian GNU/Linux\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\nID=debian\n";
        assert_eq!(
            parse_os_release(contents),
            Some("Debian GNU/Linux 12 (bookworm)".to_string())
        );
    }

    #[test]
    fn test_parse_os_release_missing() {
        assert_eq!(parse_os_release("ID=debian\n"), None);
    }

    #[test]
    fn test_collect_device_info_carries_version() {
        let info = collect_device_info("1.2.3");
        assert_eq!(info.agent_version, "1.2.3");
        assert!(info.reported_at.is_some());
    }
}
