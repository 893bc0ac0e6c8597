//! Container engine abstraction.
//!
//! The agent never talks to a concrete container runtime directly; it drives
//! the [`ContainerEngine`] trait, which an adapter crate implements for the
//! runtime actually installed on the device. Agent-managed containers are
//! discovered exclusively by label filter, never by name.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::{PortBinding, RestartPolicy, Service};

/// Label carrying the owning application id.
pub const LABEL_APPLICATION: &str = "com.fleetd.application";

/// Label carrying the service name.
pub const LABEL_SERVICE: &str = "com.fleetd.service";

/// Label carrying the release the container was created from.
pub const LABEL_RELEASE: &str = "com.fleetd.release";

/// Label carrying the canonical spec hash of the service the container was
/// created from. Spec equivalence wins over release identity: a running
/// container with a matching hash is adopted regardless of its release
/// label.
pub const LABEL_SPEC_HASH: &str = "com.fleetd.spec-hash";

/// Errors surfaced by a container engine adapter.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The referenced container does not exist.
    #[error("container not found: {0}")]
    NotFound(String),

    /// The image could not be pulled.
    #[error("pull image {image}: {message}")]
    PullFailed {
        /// Image reference that failed to pull.
        image: String,
        /// Engine-provided detail.
        message: String,
    },

    /// Any other engine failure.
    #[error("engine: {0}")]
    Other(String),
}

impl EngineError {
    /// Returns `true` if the error means the container does not exist.
    ///
    /// Stop and remove treat this as success.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Everything the engine needs to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Container name.
    pub name: String,

    /// Image reference.
    pub image: String,

    /// Entrypoint override.
    pub entrypoint: Vec<String>,

    /// Command override.
    pub command: Vec<String>,

    /// Environment variables.
    pub environment: BTreeMap<String, String>,

    /// Volume bindings.
    pub volumes: Vec<String>,

    /// Port bindings.
    pub ports: Vec<PortBinding>,

    /// Restart policy, enforced by the engine.
    pub restart: RestartPolicy,

    /// CPU shares.
    pub cpu_shares: Option<u64>,

    /// Memory limit in bytes.
    pub memory_limit_bytes: Option<u64>,

    /// Labels identifying the container as agent-managed.
    pub labels: BTreeMap<String, String>,
}

impl ContainerConfig {
    /// Builds the config for one service of one application release,
    /// including the identity labels the supervisor discovers containers by.
    #[must_use]
    pub fn for_service(
        application_id: &str,
        service_name: &str,
        release_id: &str,
        service: &Service,
    ) -> Self {
        let spec_hash = service.spec_hash();

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_APPLICATION.to_string(), application_id.to_string());
        labels.insert(LABEL_SERVICE.to_string(), service_name.to_string());
        labels.insert(LABEL_RELEASE.to_string(), release_id.to_string());
        labels.insert(LABEL_SPEC_HASH.to_string(), spec_hash.clone());

        Self {
            name: format!(
                "fleetd-{application_id}-{service_name}-{}",
                &spec_hash[..12]
            ),
            image: service.image.clone(),
            entrypoint: service.entrypoint.clone(),
            command: service.command.clone(),
            environment: service.environment.clone(),
            volumes: service.volumes.clone(),
            ports: service.ports.clone(),
            restart: service.restart,
            cpu_shares: service.cpu_shares,
            memory_limit_bytes: service.memory_limit_bytes,
            labels,
        }
    }
}

/// Coarse container status as observed from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Created but never started.
    Created,

    /// Currently running.
    Running,

    /// Exited, with the exit code when the engine reports one.
    Exited {
        /// Exit code if available.
        exit_code: Option<i32>,
    },

    /// Status the adapter could not map.
    Unknown,
}

impl ContainerStatus {
    /// Returns `true` if the container is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// A container as listed or inspected from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Engine-assigned container id.
    pub id: String,

    /// Container name.
    pub name: String,

    /// Labels on the container.
    pub labels: BTreeMap<String, String>,

    /// Observed status.
    pub status: ContainerStatus,
}

impl ContainerSummary {
    /// Value of a label, if present.
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Point-in-time resource usage of one container.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ContainerStats {
    /// CPU usage as a percentage of one core.
    pub cpu_percent: f64,

    /// Memory in use, in bytes.
    pub memory_usage_bytes: u64,

    /// Memory limit, if one is set.
    pub memory_limit_bytes: Option<u64>,

    /// Total bytes received on the container's interfaces.
    pub network_rx_bytes: u64,

    /// Total bytes transmitted on the container's interfaces.
    pub network_tx_bytes: u64,
}

/// Abstract container lifecycle consumed by the supervisor.
///
/// Implementations must be safe to call from multiple tasks; per-service
/// exclusion is achieved by the supervisor issuing all calls for one service
/// from that service's single worker.
#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    /// Pull an image to idempotent completion.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PullFailed`] when the image cannot be pulled;
    /// the supervisor retries on its tick.
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Create a container, returning its engine-assigned id.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be created.
    async fn create_container(&self, config: &ContainerConfig) -> Result<String, EngineError>;

    /// Start a created or exited container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be started.
    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Stop a container, waiting up to `grace` before the engine kills it.
    ///
    /// # Errors
    ///
    /// Returns an error if stopping fails. [`EngineError::NotFound`] is
    /// treated as success by callers.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), EngineError>;

    /// Remove a stopped container.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails. [`EngineError::NotFound`] is
    /// treated as success by callers.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    /// List containers whose labels contain every entry of `label_filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be queried.
    async fn list_containers(
        &self,
        label_filter: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerSummary>, EngineError>;

    /// Inspect a single container.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the container does not exist.
    async fn inspect_container(&self, id: &str) -> Result<ContainerSummary, EngineError>;

    /// Fetch the tail of a container's log.
    ///
    /// # Errors
    ///
    /// Returns an error if logs cannot be read.
    async fn container_logs(&self, id: &str, tail: usize) -> Result<String, EngineError>;

    /// Sample a container's resource usage.
    ///
    /// # Errors
    ///
    /// Returns an error if stats cannot be read.
    async fn container_stats(&self, id: &str) -> Result<ContainerStats, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_service_labels_and_name() {
        let service = Service {
            image: "registry.example.com/sensor:1.4".to_string(),
            ..Service::default()
        };
        let config = ContainerConfig::for_service("app1", "sensor", "rel9", &service);

        assert_eq!(config.labels[LABEL_APPLICATION], "app1");
        assert_eq!(config.labels[LABEL_SERVICE], "sensor");
        assert_eq!(config.labels[LABEL_RELEASE], "rel9");
        assert_eq!(config.labels[LABEL_SPEC_HASH], service.spec_hash());
        assert!(config.name.starts_with("fleetd-app1-sensor-"));
    }

    #[test]
    fn test_not_found_predicate() {
        assert!(EngineError::NotFound("c1".to_string()).is_not_found());
        assert!(!EngineError::Other("boom".to_string()).is_not_found());
    }
}
