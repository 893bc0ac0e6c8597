//! Supervision hierarchy.
//!
//! The top-level [`Supervisor`] owns one application supervisor per desired
//! application; each application supervisor owns one worker per service and
//! the application's [`Reporter`]. Applying a bundle is an idempotent
//! reconcile: new applications are created, departed ones are stopped and
//! awaited, surviving ones are forwarded their (possibly unchanged) target.
//!
//! Errors never surface through [`Supervisor::set`]; they are reported as
//! service states and retried on the workers' own cadence.

mod application;
mod reporter;
mod service;

pub use reporter::{Reporter, StatusSink};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::engine::ContainerEngine;
use crate::models::Bundle;
use crate::validator::Validator;
use application::ApplicationSupervisor;

/// Cadence of the supervision and reporter loops.
pub(crate) const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Deadline applied to each individual upstream publication.
pub(crate) const REPORT_DEADLINE: Duration = Duration::from_secs(60);

/// Top-level supervisor: drives every application toward the bundle's
/// desired state.
pub struct Supervisor {
    engine: Arc<dyn ContainerEngine>,
    sink: Arc<dyn StatusSink>,
    validators: Arc<[Box<dyn Validator>]>,
    applications: Mutex<HashMap<String, ApplicationSupervisor>>,
}

impl Supervisor {
    /// Creates a supervisor writing through `engine` and reporting through
    /// `sink`. Every service spec must pass all of `validators` before any
    /// engine work is scheduled for it.
    #[must_use]
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        sink: Arc<dyn StatusSink>,
        validators: Vec<Box<dyn Validator>>,
    ) -> Self {
        Self {
            engine,
            sink,
            validators: validators.into(),
            applications: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotently reconciles the supervision tree toward `bundle`.
    ///
    /// Safe to call concurrently; calls serialize on an internal lock and
    /// each application supervisor processes updates in order.
    pub async fn set(&self, bundle: &Bundle) {
        let mut applications = self.applications.lock().await;

        let desired: HashSet<&str> = bundle
            .applications
            .iter()
            .map(|application| application.id.as_str())
            .collect();
        let removed: Vec<String> = applications
            .keys()
            .filter(|id| !desired.contains(id.as_str()))
            .cloned()
            .collect();
        for id in removed {
            if let Some(supervisor) = applications.remove(&id) {
                info!(application = %id, "application removed");
                supervisor.stop().await;
            }
        }

        for application in &bundle.applications {
            let supervisor = applications
                .entry(application.id.clone())
                .or_insert_with(|| {
                    info!(application = %application.id, "application added");
                    ApplicationSupervisor::new(
                        application.id.clone(),
                        Arc::clone(&self.engine),
                        Arc::clone(&self.validators),
                        Arc::new(Reporter::new(
                            application.id.clone(),
                            Arc::clone(&self.sink),
                        )),
                    )
                });
            supervisor
                .set_desired_application(
                    &application.latest_release.id,
                    &application.latest_release.services,
                )
                .await;
        }
    }

    /// Id of the container currently backing `(application_id, service)`,
    /// if one is managed.
    pub async fn container_for(&self, application_id: &str, service: &str) -> Option<String> {
        self.applications
            .lock()
            .await
            .get(application_id)
            .and_then(|supervisor| supervisor.container_id(service))
    }

    /// Stops every application supervisor and awaits full teardown.
    pub async fn shutdown(&self) {
        let mut applications = self.applications.lock().await;
        let supervisors: Vec<ApplicationSupervisor> = applications
            .drain()
            .map(|(_, supervisor)| supervisor)
            .collect();
        for supervisor in supervisors {
            supervisor.stop().await;
        }
    }
}
