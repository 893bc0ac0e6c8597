//! Metrics collection and push.
//!
//! Device metrics come from `/proc`; per-service metrics come from the
//! engine's stats endpoint, resolved through the supervisor's container
//! lookup. The bundle decides which services are scraped and which metric
//! names the control plane wants; the device's own `disabled-metrics`
//! variable is a deny-list applied on top.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fleetd_core::client::ApiClient;
use fleetd_core::engine::{ContainerEngine, ContainerStats, EngineError};
use fleetd_core::models::{Bundle, Metric, MetricsConfig};
use fleetd_core::supervisor::Supervisor;
use fleetd_core::variables::Variables;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::warn;

const PUSH_INTERVAL: Duration = Duration::from_secs(60);
const PUSH_DEADLINE: Duration = Duration::from_secs(60);

/// Resolves a (application, service) pair to live container stats.
pub struct ServiceMetricsFetcher {
    engine: Arc<dyn ContainerEngine>,
    supervisor: Arc<Supervisor>,
}

impl ServiceMetricsFetcher {
    /// Creates a fetcher reading stats through `engine` for containers
    /// managed by `supervisor`.
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>, supervisor: Arc<Supervisor>) -> Self {
        Self { engine, supervisor }
    }

    /// Samples the container currently backing `(application_id, service)`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when no container is managed for
    /// the pair, or the engine's error when sampling fails.
    pub async fn service_metrics(
        &self,
        application_id: &str,
        service: &str,
    ) -> Result<Vec<Metric>, EngineError> {
        let container_id = self
            .supervisor
            .container_for(application_id, service)
            .await
            .ok_or_else(|| {
                EngineError::NotFound(format!("{application_id}/{service} has no container"))
            })?;
        let stats = self.engine.container_stats(&container_id).await?;
        Ok(stats_to_metrics(&stats))
    }
}

/// Pushes device and per-service metrics upstream on a fixed cadence.
pub struct MetricsPusher {
    client: Arc<dyn ApiClient>,
    fetcher: Arc<ServiceMetricsFetcher>,
    variables: Arc<dyn Variables>,
    bundle: Mutex<Option<Bundle>>,
}

impl MetricsPusher {
    /// Creates a pusher publishing through `client`.
    #[must_use]
    pub fn new(
        client: Arc<dyn ApiClient>,
        fetcher: Arc<ServiceMetricsFetcher>,
        variables: Arc<dyn Variables>,
    ) -> Self {
        Self {
            client,
            fetcher,
            variables,
            bundle: Mutex::new(None),
        }
    }

    /// Installs the bundle whose metrics policy the next pushes follow.
    pub fn set_bundle(&self, bundle: &Bundle) {
        *self.bundle.lock().unwrap_or_else(PoisonError::into_inner) = Some(bundle.clone());
    }

    /// Runs until the stop signal fires.
    pub async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(PUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = ticker.tick() => {}
            }
            self.push_once().await;
        }
    }

    async fn push_once(&self) {
        let Some(bundle) = self
            .bundle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return;
        };
        let disabled = self.variables.disabled_metrics();

        let device_config = bundle.device_metrics_config.clone().unwrap_or_default();
        if device_config.enabled {
            let metrics = filter_metrics(device_metrics(), &device_config, &disabled);
            if !metrics.is_empty() {
                match timeout(PUSH_DEADLINE, self.client.push_device_metrics(&metrics)).await {
                    Ok(Ok(())) => {},
                    Ok(Err(err)) => warn!(error = %err, "push device metrics"),
                    Err(_) => warn!("push device metrics timed out"),
                }
            }
        }

        for config in &bundle.service_metrics_configs {
            if !config.config.enabled {
                continue;
            }
            let metrics = match self
                .fetcher
                .service_metrics(&config.application_id, &config.service)
                .await
            {
                Ok(metrics) => metrics,
                Err(err) => {
                    warn!(
                        application = %config.application_id,
                        service = %config.service,
                        error = %err,
                        "fetch service metrics"
                    );
                    continue;
                },
            };
            let metrics = filter_metrics(metrics, &config.config, &disabled);
            if metrics.is_empty() {
                continue;
            }
            match timeout(
                PUSH_DEADLINE,
                self.client
                    .push_service_metrics(&config.application_id, &config.service, &metrics),
            )
            .await
            {
                Ok(Ok(())) => {},
                Ok(Err(err)) => {
                    warn!(
                        application = %config.application_id,
                        service = %config.service,
                        error = %err,
                        "push service metrics"
                    );
                },
                Err(_) => {
                    warn!(
                        application = %config.application_id,
                        service = %config.service,
                        "push service metrics timed out"
                    );
                },
            }
        }
    }
}

/// Converts an engine stats sample into named metrics.
#[must_use]
pub fn stats_to_metrics(stats: &ContainerStats) -> Vec<Metric> {
    let mut metrics = vec![
        metric("cpu_percent", stats.cpu_percent),
        metric("memory_usage_bytes", to_f64(stats.memory_usage_bytes)),
        metric("network_rx_bytes", to_f64(stats.network_rx_bytes)),
        metric("network_tx_bytes", to_f64(stats.network_tx_bytes)),
    ];
    if let Some(limit) = stats.memory_limit_bytes {
        metrics.push(metric("memory_limit_bytes", to_f64(limit)));
    }
    metrics
}

/// Samples device-level metrics from `/proc`. Unreadable sources are
/// silently skipped.
#[must_use]
pub fn device_metrics() -> Vec<Metric> {
    let mut metrics = Vec::new();
    if let Some(load1) = read_load1() {
        metrics.push(metric("load1", load1));
    }
    if let Ok(contents) = std::fs::read_to_string("/proc/meminfo") {
        if let Some(total) = parse_meminfo_bytes(&contents, "MemTotal:") {
            metrics.push(metric("memory_total_bytes", to_f64(total)));
        }
        if let Some(available) = parse_meminfo_bytes(&contents, "MemAvailable:") {
            metrics.push(metric("memory_available_bytes", to_f64(available)));
        }
    }
    metrics
}

fn read_load1() -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/loadavg").ok()?;
    contents.split_whitespace().next()?.parse().ok()
}

fn parse_meminfo_bytes(contents: &str, key: &str) -> Option<u64> {
    let line = contents.lines().find(|line| line.starts_with(key))?;
    let kilobytes: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kilobytes * 1024)
}

fn filter_metrics(metrics: Vec<Metric>, config: &MetricsConfig, disabled: &[String]) -> Vec<Metric> {
    metrics
        .into_iter()
        .filter(|m| config.names.is_empty() || config.names.contains(&m.name))
        .filter(|m| !disabled.contains(&m.name))
        .collect()
}

fn metric(name: &str, value: f64) -> Metric {
    Metric {
        name: name.to_string(),
        value,
        labels: BTreeMap::new(),
    }
}

#[allow(clippy::cast_precision_loss)] // metric values are approximate by nature
fn to_f64(value: u64) -> f64 {
    value as f64
}
