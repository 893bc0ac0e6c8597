//! Bundle applier.
//!
//! The applier is the single writer of the agent's desired state. On boot it
//! loads the persisted last-known-good bundle and dispatches it before the
//! first network call, so a disconnected device still converges. From then
//! on it polls the control plane, merges the payload with the previous
//! bundle, persists the result atomically, and only then fans it out:
//! supervisor first, then the garbage collector, then everything else.
//!
//! The merge is what makes a degraded control plane safe: a payload that
//! fails the full parse but still carries a readable `desiredAgentVersion`
//! keeps the previous bundle's applications and policies; a payload that
//! fails both parses drops the cycle entirely.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleetd_core::client::ApiClient;
use fleetd_core::fs_atomic::{atomic_write_with_mode, read_optional};
use fleetd_core::models::{Bundle, MinimalBundle};
use fleetd_core::supervisor::Supervisor;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::metrics::MetricsPusher;
use crate::service_api::DeviceApi;
use crate::status_gc::StatusGarbageCollector;
use crate::updater::Updater;

const APPLY_INTERVAL: Duration = Duration::from_secs(5);
const DOWNLOAD_DEADLINE: Duration = Duration::from_secs(60);

/// Polls the control plane and drives every bundle consumer.
pub struct BundleApplier {
    client: Arc<dyn ApiClient>,
    supervisor: Arc<Supervisor>,
    status_gc: Arc<StatusGarbageCollector>,
    updater: Arc<Updater>,
    metrics_pusher: Arc<MetricsPusher>,
    api: Arc<DeviceApi>,
    bundle_path: PathBuf,
}

impl BundleApplier {
    /// Wires the applier over the agent's shared components. `bundle_path`
    /// is where the last-known-good bundle is persisted.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn ApiClient>,
        supervisor: Arc<Supervisor>,
        status_gc: Arc<StatusGarbageCollector>,
        updater: Arc<Updater>,
        metrics_pusher: Arc<MetricsPusher>,
        api: Arc<DeviceApi>,
        bundle_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            supervisor,
            status_gc,
            updater,
            metrics_pusher,
            api,
            bundle_path: bundle_path.into(),
        }
    }

    /// Runs until the stop signal fires.
    pub async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let mut current = self.load_saved_bundle();
        if let Some(bundle) = &current {
            info!("applying saved bundle before first download");
            self.dispatch(bundle).await;
        }

        let mut ticker = tokio::time::interval(APPLY_INTERVAL);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = ticker.tick() => {}
            }

            if let Some(bundle) = self.download_latest_bundle(current.as_ref()).await {
                self.dispatch(&bundle).await;
                current = Some(bundle);
            }
        }
    }

    /// Loads the persisted bundle. A corrupt file is discarded (not
    /// deleted); the next successful download overwrites it atomically.
    fn load_saved_bundle(&self) -> Option<Bundle> {
        let bytes = match read_optional(&self.bundle_path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, "read saved bundle");
                return None;
            },
        };
        match serde_json::from_slice(&bytes) {
            Ok(bundle) => Some(bundle),
            Err(err) => {
                warn!(error = %err, "discarding corrupt saved bundle");
                None
            },
        }
    }

    async fn download_latest_bundle(&self, old: Option<&Bundle>) -> Option<Bundle> {
        let bytes = match timeout(DOWNLOAD_DEADLINE, self.client.get_bundle_bytes()).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => {
                warn!(error = %err, "get bundle");
                return None;
            },
            Err(_) => {
                warn!("get bundle timed out");
                return None;
            },
        };

        let bundle = merge_bundle(old, &bytes)?;

        let canonical = match serde_json::to_vec(&bundle) {
            Ok(canonical) => canonical,
            Err(err) => {
                warn!(error = %err, "marshal bundle");
                return None;
            },
        };
        if let Err(err) = atomic_write_with_mode(&self.bundle_path, &canonical, 0o644) {
            warn!(error = %err, "save bundle");
            return None;
        }

        Some(bundle)
    }

    /// Fan-out order is fixed: the supervisor reconciles before the GC sees
    /// the bundle, so records are never deleted ahead of teardown.
    async fn dispatch(&self, bundle: &Bundle) {
        self.supervisor.set(bundle).await;
        self.status_gc.set_bundle(bundle);
        self.updater.set_desired_version(&bundle.desired_agent_version);
        self.metrics_pusher.set_bundle(bundle);
        self.api.set_bundle(bundle.clone());
    }
}

/// Merges an upstream payload with the previous in-memory bundle.
///
/// - Full parse success: the payload replaces the bundle entirely.
/// - Full parse failure with a parseable minimal projection: the previous
///   bundle survives with only `desired_agent_version` overwritten.
/// - Both fail: `None`; the cycle is dropped.
#[must_use]
pub fn merge_bundle(old: Option<&Bundle>, bytes: &[u8]) -> Option<Bundle> {
    match serde_json::from_slice::<Bundle>(bytes) {
        Ok(bundle) => Some(bundle),
        Err(err) => {
            warn!(error = %err, "unmarshal full bundle");
            match serde_json::from_slice::<MinimalBundle>(bytes) {
                Ok(minimal) => {
                    let mut bundle = old.cloned().unwrap_or_default();
                    bundle.desired_agent_version = minimal.desired_agent_version;
                    Some(bundle)
                },
                Err(err) => {
                    warn!(error = %err, "unmarshal minimal bundle");
                    None
                },
            }
        },
    }
}
