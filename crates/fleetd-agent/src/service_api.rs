//! Device control API.
//!
//! The shared read surface behind both the local HTTP server and the remote
//! tunnel protocol: current bundle, device info, per-service logs and
//! metrics. The bundle slot is swapped whole by the bundle applier; readers
//! always see either the previous or the new bundle.

use std::sync::{Arc, PoisonError, RwLock};

use fleetd_core::engine::{ContainerEngine, EngineError};
use fleetd_core::models::{Bundle, DeviceInfo, Metric};
use fleetd_core::supervisor::Supervisor;
use fleetd_core::variables::Variables;

use crate::info::collect_device_info;
use crate::metrics::ServiceMetricsFetcher;

/// Default number of log lines returned when the caller does not say.
pub const DEFAULT_LOG_TAIL: usize = 100;

/// Errors surfaced by the device API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The referenced application/service has no managed container.
    #[error("no container for {application}/{service}")]
    NoContainer {
        /// Application that was asked for.
        application: String,
        /// Service that was asked for.
        service: String,
    },

    /// The engine call failed.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// The device-local control surface.
pub struct DeviceApi {
    version: String,
    engine: Arc<dyn ContainerEngine>,
    supervisor: Arc<Supervisor>,
    variables: Arc<dyn Variables>,
    fetcher: Arc<ServiceMetricsFetcher>,
    bundle: RwLock<Option<Bundle>>,
}

impl DeviceApi {
    /// Wires the API over the agent's shared components.
    #[must_use]
    pub fn new(
        version: impl Into<String>,
        engine: Arc<dyn ContainerEngine>,
        supervisor: Arc<Supervisor>,
        variables: Arc<dyn Variables>,
        fetcher: Arc<ServiceMetricsFetcher>,
    ) -> Self {
        Self {
            version: version.into(),
            engine,
            supervisor,
            variables,
            fetcher,
            bundle: RwLock::new(None),
        }
    }

    /// Installs the latest accepted bundle.
    pub fn set_bundle(&self, bundle: Bundle) {
        *self
            .bundle
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(bundle);
    }

    /// The latest accepted bundle, if any has been seen yet.
    #[must_use]
    pub fn current_bundle(&self) -> Option<Bundle> {
        self.bundle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current device facts.
    #[must_use]
    pub fn device_info(&self) -> DeviceInfo {
        collect_device_info(&self.version)
    }

    /// Whether SSH is disabled by device policy.
    #[must_use]
    pub fn ssh_disabled(&self) -> bool {
        self.variables.disable_ssh()
    }

    /// Tail of the log of the container backing `(application, service)`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NoContainer`] when the pair has no managed
    /// container, or the engine's error when reading fails.
    pub async fn service_logs(
        &self,
        application: &str,
        service: &str,
        tail: usize,
    ) -> Result<String, ApiError> {
        let container_id = self
            .supervisor
            .container_for(application, service)
            .await
            .ok_or_else(|| ApiError::NoContainer {
                application: application.to_string(),
                service: service.to_string(),
            })?;
        Ok(self.engine.container_logs(&container_id, tail).await?)
    }

    /// Live metrics of the container backing `(application, service)`.
    ///
    /// # Errors
    ///
    /// Returns the engine's error when the pair has no container or
    /// sampling fails.
    pub async fn service_metrics(
        &self,
        application: &str,
        service: &str,
    ) -> Result<Vec<Metric>, ApiError> {
        Ok(self.fetcher.service_metrics(application, service).await?)
    }
}
