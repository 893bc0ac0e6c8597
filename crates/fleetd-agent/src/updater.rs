//! Agent self-update.
//!
//! The bundle carries the version the device should be running. When it
//! differs from the running version, the updater invokes the installed
//! agent binary's upgrade entry point and lets the process supervisor
//! (systemd or similar) restart the agent afterwards. Failures are logged
//! and retried on the next check.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::watch;
use tracing::{info, warn};

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Converges the installed agent on the bundle's desired version.
pub struct Updater {
    project_id: String,
    current_version: String,
    binary_path: PathBuf,
    desired_version: Mutex<Option<String>>,
}

impl Updater {
    /// Creates an updater for the agent binary at `binary_path` currently
    /// running `current_version`.
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        current_version: impl Into<String>,
        binary_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            current_version: current_version.into(),
            binary_path: binary_path.into(),
            desired_version: Mutex::new(None),
        }
    }

    /// Installs the version the next check converges on. An empty string
    /// clears the target.
    pub fn set_desired_version(&self, version: &str) {
        let mut desired = self
            .desired_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *desired = if version.is_empty() {
            None
        } else {
            Some(version.to_string())
        };
    }

    /// Currently installed target, if any.
    #[must_use]
    pub fn desired_version(&self) -> Option<String> {
        self.desired_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs until the stop signal fires.
    pub async fn run(self: std::sync::Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = ticker.tick() => {}
            }

            let Some(desired) = self.desired_version() else {
                continue;
            };
            if desired == self.current_version {
                continue;
            }

            info!(
                project = %self.project_id,
                current = %self.current_version,
                desired = %desired,
                "agent version differs, upgrading"
            );
            self.upgrade(&desired).await;
        }
    }

    async fn upgrade(&self, desired: &str) {
        let result = Command::new(&self.binary_path)
            .arg("upgrade")
            .arg("--version")
            .arg(desired)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match result {
            Ok(status) if status.success() => {
                info!(desired = %desired, "agent upgrade launched");
            },
            Ok(status) => {
                warn!(desired = %desired, %status, "agent upgrade exited non-zero");
            },
            Err(err) => {
                warn!(desired = %desired, error = %err, "spawn agent upgrade");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_desired_version_empty_clears() {
        let updater = Updater::new("proj", "1.0.0", "/usr/bin/fleetd");
        updater.set_desired_version("1.1.0");
        assert_eq!(updater.desired_version(), Some("1.1.0".to_string()));

        updater.set_desired_version("");
        assert_eq!(updater.desired_version(), None);
    }
}
