//! Status garbage collector.
//!
//! The bundle carries the control plane's own record of reported statuses
//! and states. Any record whose application or (application, service) pair
//! is no longer in the desired set is deleted upstream. Deletes are
//! best-effort: a failure keeps the record queued for the next tick, a
//! success removes it so it is not re-issued.
//!
//! The bundle applier invokes [`set_bundle`](StatusGarbageCollector::set_bundle)
//! only after the supervisor has reconciled the same bundle, so the GC
//! never deletes a record for a service that is still being torn down
//! toward the desired set.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fleetd_core::client::ApiClient;
use fleetd_core::models::Bundle;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

const GC_INTERVAL: Duration = Duration::from_secs(1);
const DELETE_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct GcState {
    stale_application_statuses: HashSet<String>,
    stale_service_statuses: HashSet<(String, String)>,
    stale_service_states: HashSet<(String, String)>,
}

/// Deletes upstream status and state records that no bundle references
/// anymore.
pub struct StatusGarbageCollector {
    client: Arc<dyn ApiClient>,
    state: Mutex<GcState>,
}

impl StatusGarbageCollector {
    /// Creates a collector deleting through `client`.
    #[must_use]
    pub fn new(client: Arc<dyn ApiClient>) -> Self {
        Self {
            client,
            state: Mutex::new(GcState::default()),
        }
    }

    /// Recomputes the stale-record sets from `bundle`.
    pub fn set_bundle(&self, bundle: &Bundle) {
        let desired_applications: HashSet<&str> = bundle
            .applications
            .iter()
            .map(|application| application.id.as_str())
            .collect();
        let desired_pairs: HashSet<(&str, &str)> = bundle
            .applications
            .iter()
            .flat_map(|application| {
                application
                    .latest_release
                    .services
                    .keys()
                    .map(move |service| (application.id.as_str(), service.as_str()))
            })
            .collect();

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.stale_application_statuses = bundle
            .application_statuses
            .iter()
            .filter(|record| !desired_applications.contains(record.application_id.as_str()))
            .map(|record| record.application_id.clone())
            .collect();
        state.stale_service_statuses = bundle
            .service_statuses
            .iter()
            .filter(|record| {
                !desired_pairs.contains(&(record.application_id.as_str(), record.service.as_str()))
            })
            .map(|record| (record.application_id.clone(), record.service.clone()))
            .collect();
        state.stale_service_states = bundle
            .service_states
            .iter()
            .filter(|record| {
                !desired_pairs.contains(&(record.application_id.as_str(), record.service.as_str()))
            })
            .map(|record| (record.application_id.clone(), record.service.clone()))
            .collect();
    }

    /// Runs until the stop signal fires.
    pub async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(GC_INTERVAL);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = ticker.tick() => {}
            }
            self.collect_once().await;
        }
    }

    async fn collect_once(&self) {
        let (applications, statuses, states) = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            (
                state.stale_application_statuses.clone(),
                state.stale_service_statuses.clone(),
                state.stale_service_states.clone(),
            )
        };

        for application_id in applications {
            match timeout(
                DELETE_DEADLINE,
                self.client.delete_device_application_status(&application_id),
            )
            .await
            {
                Ok(Ok(())) => {
                    info!(application = %application_id, "deleted stale application status");
                    self.state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .stale_application_statuses
                        .remove(&application_id);
                },
                Ok(Err(err)) => {
                    warn!(application = %application_id, error = %err, "delete application status");
                },
                Err(_) => {
                    warn!(application = %application_id, "delete application status timed out");
                },
            }
        }

        for (application_id, service) in statuses {
            match timeout(
                DELETE_DEADLINE,
                self.client
                    .delete_device_service_status(&application_id, &service),
            )
            .await
            {
                Ok(Ok(())) => {
                    info!(application = %application_id, service = %service, "deleted stale service status");
                    self.state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .stale_service_statuses
                        .remove(&(application_id, service));
                },
                Ok(Err(err)) => {
                    warn!(application = %application_id, service = %service, error = %err, "delete service status");
                },
                Err(_) => {
                    warn!(application = %application_id, service = %service, "delete service status timed out");
                },
            }
        }

        for (application_id, service) in states {
            match timeout(
                DELETE_DEADLINE,
                self.client
                    .delete_device_service_state(&application_id, &service),
            )
            .await
            {
                Ok(Ok(())) => {
                    info!(application = %application_id, service = %service, "deleted stale service state");
                    self.state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .stale_service_states
                        .remove(&(application_id, service));
                },
                Ok(Err(err)) => {
                    warn!(application = %application_id, service = %service, error = %err, "delete service state");
                },
                Err(_) => {
                    warn!(application = %application_id, service = %service, "delete service state timed out");
                },
            }
        }
    }
}
