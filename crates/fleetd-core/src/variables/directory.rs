//! Directory-backed variables.
//!
//! Policy is expressed as files in a configuration directory: marker files
//! (`disable-ssh`, `disable-custom-commands`) whose presence sets a toggle,
//! and list files (`whitelisted-images`, `disabled-metrics`) holding one
//! entry per line. The directory is rescanned on a short cadence and a
//! changed snapshot is swapped in whole, so readers always see a consistent
//! policy.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Variables;

const SCAN_INTERVAL: Duration = Duration::from_secs(1);

const DISABLE_SSH_FILE: &str = "disable-ssh";
const DISABLE_CUSTOM_COMMANDS_FILE: &str = "disable-custom-commands";
const WHITELISTED_IMAGES_FILE: &str = "whitelisted-images";
const DISABLED_METRICS_FILE: &str = "disabled-metrics";

/// Errors from starting the variables watcher.
#[derive(Debug, thiserror::Error)]
pub enum VariablesError {
    /// The configuration directory could not be scanned.
    #[error("scan configuration directory {}: {source}", dir.display())]
    Scan {
        /// Directory that failed to scan.
        dir: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Snapshot {
    disable_ssh: bool,
    disable_custom_commands: bool,
    whitelisted_images: Option<Vec<String>>,
    disabled_metrics: Vec<String>,
}

/// [`Variables`] implementation watching a configuration directory.
#[derive(Debug)]
pub struct DirectoryVariables {
    dir: PathBuf,
    snapshot: Arc<RwLock<Snapshot>>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DirectoryVariables {
    /// Creates a watcher over `dir`. Nothing is read until
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            dir: dir.into(),
            snapshot: Arc::new(RwLock::new(Snapshot::default())),
            stop,
            task: Mutex::new(None),
        }
    }

    /// Performs the initial scan and spawns the rescan loop.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`VariablesError::Scan`] if the initial scan fails; this is
    /// fatal to agent startup.
    pub fn start(&self) -> Result<(), VariablesError> {
        let initial = scan(&self.dir).map_err(|source| VariablesError::Scan {
            dir: self.dir.clone(),
            source,
        })?;
        *write_guard(&self.snapshot) = initial;

        let dir = self.dir.clone();
        let snapshot = Arc::clone(&self.snapshot);
        let mut stop_rx = self.stop.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCAN_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = ticker.tick() => {}
                }

                match scan(&dir) {
                    Ok(next) => {
                        let changed = *read_guard(&snapshot) != next;
                        if changed {
                            debug!(dir = %dir.display(), "device variables changed");
                            *write_guard(&snapshot) = next;
                        }
                    },
                    Err(err) => {
                        warn!(dir = %dir.display(), error = %err, "rescan device variables");
                    },
                }
            }
        });

        *self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Stops the rescan loop and waits for it to exit.
    pub async fn stop(&self) {
        let _ = self.stop.send(true);
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Variables for DirectoryVariables {
    fn disable_ssh(&self) -> bool {
        read_guard(&self.snapshot).disable_ssh
    }

    fn disable_custom_commands(&self) -> bool {
        read_guard(&self.snapshot).disable_custom_commands
    }

    fn whitelisted_images(&self) -> Option<Vec<String>> {
        read_guard(&self.snapshot).whitelisted_images.clone()
    }

    fn disabled_metrics(&self) -> Vec<String> {
        read_guard(&self.snapshot).disabled_metrics.clone()
    }
}

fn read_guard(lock: &RwLock<Snapshot>) -> std::sync::RwLockReadGuard<'_, Snapshot> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_guard(lock: &RwLock<Snapshot>) -> std::sync::RwLockWriteGuard<'_, Snapshot> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn scan(dir: &Path) -> Result<Snapshot, std::io::Error> {
    // The directory itself must be listable; individual files are optional.
    std::fs::read_dir(dir)?;

    Ok(Snapshot {
        disable_ssh: dir.join(DISABLE_SSH_FILE).exists(),
        disable_custom_commands: dir.join(DISABLE_CUSTOM_COMMANDS_FILE).exists(),
        whitelisted_images: read_lines(&dir.join(WHITELISTED_IMAGES_FILE)),
        disabled_metrics: read_lines(&dir.join(DISABLED_METRICS_FILE)).unwrap_or_default(),
    })
}

fn read_lines(path: &Path) -> Option<Vec<String>> {
    let contents = std::fs::read_to_string(path).ok()?;
    Some(
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_scan_reads_markers_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DISABLE_CUSTOM_COMMANDS_FILE), "").unwrap();
        std::fs::write(
            dir.path().join(WHITELISTED_IMAGES_FILE),
            "registry.example.com/\n# comment\n\nother.example.com/team/\n",
        )
        .unwrap();

        let variables = DirectoryVariables::new(dir.path());
        variables.start().unwrap();

        assert!(!variables.disable_ssh());
        assert!(variables.disable_custom_commands());
        assert_eq!(
            variables.whitelisted_images(),
            Some(vec![
                "registry.example.com/".to_string(),
                "other.example.com/team/".to_string(),
            ])
        );
        assert!(variables.disabled_metrics().is_empty());

        variables.stop().await;
    }

    #[tokio::test]
    async fn test_missing_list_file_means_unrestricted() {
        let dir = tempfile::tempdir().unwrap();
        let variables = DirectoryVariables::new(dir.path());
        variables.start().unwrap();

        assert_eq!(variables.whitelisted_images(), None);

        variables.stop().await;
    }

    #[tokio::test]
    async fn test_missing_directory_is_fatal() {
        let variables = DirectoryVariables::new("/nonexistent/fleetd-conf");
        assert!(variables.start().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_picks_up_new_marker() {
        let dir = tempfile::tempdir().unwrap();
        let variables = DirectoryVariables::new(dir.path());
        variables.start().unwrap();
        assert!(!variables.disable_ssh());

        std::fs::write(dir.path().join(DISABLE_SSH_FILE), "").unwrap();
        for _ in 0..10 {
            if variables.disable_ssh() {
                break;
            }
            tokio::time::sleep(SCAN_INTERVAL).await;
        }
        assert!(variables.disable_ssh());

        variables.stop().await;
    }
}
