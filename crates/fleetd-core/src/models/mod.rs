//! Bundle data model.
//!
//! Types shared between the agent and the control plane: the bundle of
//! desired state, application releases, declarative service specs, and the
//! status/state facts reported back upstream.
//!
//! The wire format is JSON with camelCase keys. Unknown fields are tolerated
//! everywhere so a newer control plane can add fields without breaking older
//! agents; maps use [`BTreeMap`] so the canonical serialization (and with it
//! the service spec hash) is deterministic.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The unit of desired state for a whole device, issued by the control
/// plane.
///
/// Besides the desired applications, the bundle carries the control plane's
/// record of what it believes has been reported for this device (consumed by
/// the status garbage collector) and metrics policy (consumed by the metrics
/// pusher). The last accepted bundle is persisted verbatim so a disconnected
/// device still converges on restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Bundle {
    /// Desired applications, keyed by their `id` field.
    pub applications: Vec<Application>,

    /// Agent version the device should be running.
    pub desired_agent_version: String,

    /// Application statuses the control plane has on record.
    pub application_statuses: Vec<ApplicationStatusRecord>,

    /// Service statuses the control plane has on record.
    pub service_statuses: Vec<ServiceStatusRecord>,

    /// Service states the control plane has on record.
    pub service_states: Vec<ServiceStateRecord>,

    /// Device-level metrics policy.
    pub device_metrics_config: Option<MetricsConfig>,

    /// Per-service metrics policy.
    pub service_metrics_configs: Vec<ServiceMetricsConfig>,
}

/// Minimal projection of a bundle.
///
/// When a full [`Bundle`] parse fails (control-plane schema drift), this
/// projection is tried so that at least the desired agent version survives.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MinimalBundle {
    /// Agent version the device should be running.
    pub desired_agent_version: String,
}

/// A named collection of services deployed together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Application {
    /// Opaque application identifier.
    pub id: String,

    /// The latest release of this application. Only the latest release is
    /// material to the agent; switching releases is atomic at the
    /// application level.
    pub latest_release: Release,
}

/// An immutable snapshot of an application's service specs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Release {
    /// Opaque release identifier.
    pub id: String,

    /// Service specs by service name.
    pub services: BTreeMap<String, Service>,
}

/// A declarative container specification within a release.
///
/// Two services are equivalent iff their [`spec_hash`](Self::spec_hash)
/// matches; equivalence is the sole decision input for whether a running
/// container needs to be replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Service {
    /// Container image reference.
    pub image: String,

    /// Entrypoint override.
    pub entrypoint: Vec<String>,

    /// Command override.
    pub command: Vec<String>,

    /// Environment variables.
    pub environment: BTreeMap<String, String>,

    /// Volume bindings, in `host:container` form.
    pub volumes: Vec<String>,

    /// Port bindings.
    pub ports: Vec<PortBinding>,

    /// Restart policy.
    pub restart: RestartPolicy,

    /// Grace period given to the container to stop before it is killed.
    #[serde(with = "humantime_serde")]
    pub stop_grace_period: Duration,

    /// CPU shares (relative weight).
    pub cpu_shares: Option<u64>,

    /// Memory limit in bytes.
    pub memory_limit_bytes: Option<u64>,
}

impl Default for Service {
    fn default() -> Self {
        Self {
            image: String::new(),
            entrypoint: Vec::new(),
            command: Vec::new(),
            environment: BTreeMap::new(),
            volumes: Vec::new(),
            ports: Vec::new(),
            restart: RestartPolicy::default(),
            stop_grace_period: default_stop_grace_period(),
            cpu_shares: None,
            memory_limit_bytes: None,
        }
    }
}

const fn default_stop_grace_period() -> Duration {
    Duration::from_secs(10)
}

impl Service {
    /// Canonical digest of this spec, used for equivalence checks.
    ///
    /// Sha256 over the canonical JSON serialization (fixed field order, maps
    /// sorted by key), rendered as lowercase hex.
    #[must_use]
    pub fn spec_hash(&self) -> String {
        // Serializing a Service cannot fail: all fields are plain data.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(canonical))
    }
}

/// A single port binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortBinding {
    /// Port on the host.
    pub host_port: u16,

    /// Port inside the container.
    pub container_port: u16,

    /// Protocol, `tcp` or `udp`.
    pub protocol: String,
}

impl Default for PortBinding {
    fn default() -> Self {
        Self {
            host_port: 0,
            container_port: 0,
            protocol: default_protocol(),
        }
    }
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Restart policy for a service's container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Always restart the container when it stops.
    #[default]
    Always,

    /// Never restart the container.
    No,

    /// Restart only when the container exits with a non-zero code.
    OnFailure,

    /// Restart unless the container was explicitly stopped.
    UnlessStopped,
}

/// Observed lifecycle state of a service's container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStateKind {
    /// The image is being pulled.
    Pulling,

    /// The container exists but has not been started.
    Created,

    /// The container is running.
    Running,

    /// The container exited.
    Exited,

    /// The container was stopped by the agent.
    Stopped,

    /// The state could not be determined.
    #[default]
    Unknown,
}

impl std::fmt::Display for ServiceStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pulling => write!(f, "pulling"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Stopped => write!(f, "stopped"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Request payload for reporting an application's current release.
///
/// Published only once every service in the desired set has reported the
/// target release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDeviceApplicationStatusRequest {
    /// Release the application is currently running.
    pub current_release_id: String,
}

/// Request payload for reporting a service's current release.
///
/// Reported when the service has been observed running the container
/// produced from that release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDeviceServiceStatusRequest {
    /// Release the service is currently running.
    pub current_release_id: String,
}

/// Request payload for reporting a service's observed state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDeviceServiceStateRequest {
    /// Observed lifecycle state.
    pub state: ServiceStateKind,

    /// Error detail accompanying the state, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// An application status record the control plane has on file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicationStatusRecord {
    /// Application the record belongs to.
    pub application_id: String,

    /// Recorded release.
    pub current_release_id: String,
}

/// A service status record the control plane has on file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceStatusRecord {
    /// Application the record belongs to.
    pub application_id: String,

    /// Service the record belongs to.
    pub service: String,

    /// Recorded release.
    pub current_release_id: String,
}

/// A service state record the control plane has on file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceStateRecord {
    /// Application the record belongs to.
    pub application_id: String,

    /// Service the record belongs to.
    pub service: String,

    /// Recorded state.
    pub state: ServiceStateKind,
}

/// Metrics collection policy for the device or a single service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsConfig {
    /// Whether collection is enabled at all.
    pub enabled: bool,

    /// Metric names to collect. Empty means all available metrics.
    pub names: Vec<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            names: Vec::new(),
        }
    }
}

/// Metrics policy for one service of one application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceMetricsConfig {
    /// Application the policy applies to.
    pub application_id: String,

    /// Service the policy applies to.
    pub service: String,

    /// The collection policy itself.
    pub config: MetricsConfig,
}

/// A single metric sample pushed upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    /// Metric name.
    pub name: String,

    /// Sample value.
    pub value: f64,

    /// Additional labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Device facts published by the info reporter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    /// Version of the agent currently running.
    pub agent_version: String,

    /// Device hostname, if readable.
    pub hostname: Option<String>,

    /// Best-effort outbound IP address.
    pub ip_address: Option<String>,

    /// Operating system pretty name from `/etc/os-release`.
    pub os_release: Option<String>,

    /// When these facts were collected.
    pub reported_at: Option<DateTime<Utc>>,
}
