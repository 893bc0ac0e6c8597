//! Per-application supervision.
//!
//! Owns the set of service workers for one application and the reporter the
//! workers feed. Updates are processed serially; the reporter's quorum set
//! is updated only after the worker set matches the target, so the gate
//! never references a service the supervisors are not converging on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::info;

use super::reporter::Reporter;
use super::service::ServiceSupervisor;
use crate::engine::ContainerEngine;
use crate::models::Service;
use crate::validator::Validator;

pub(crate) struct ApplicationSupervisor {
    application_id: String,
    engine: Arc<dyn ContainerEngine>,
    validators: Arc<[Box<dyn Validator>]>,
    reporter: Arc<Reporter>,
    service_supervisors: HashMap<String, ServiceSupervisor>,
}

impl ApplicationSupervisor {
    pub(crate) fn new(
        application_id: String,
        engine: Arc<dyn ContainerEngine>,
        validators: Arc<[Box<dyn Validator>]>,
        reporter: Arc<Reporter>,
    ) -> Self {
        Self {
            application_id,
            engine,
            validators,
            reporter,
            service_supervisors: HashMap::new(),
        }
    }

    /// Reconciles the worker set toward `(release_id, services)`.
    pub(crate) async fn set_desired_application(
        &mut self,
        release_id: &str,
        services: &BTreeMap<String, Service>,
    ) {
        // Removed services first: their workers are stopped and awaited so
        // teardown completes before the reporter's quorum set shrinks.
        let removed: Vec<String> = self
            .service_supervisors
            .keys()
            .filter(|name| !services.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(supervisor) = self.service_supervisors.remove(&name) {
                info!(
                    application = %self.application_id,
                    service = %name,
                    "service removed"
                );
                supervisor.stop().await;
            }
        }

        // Added or changed services: an equivalent spec is retargeted in
        // place, anything else replaces the worker (old one stopped first).
        for (name, service) in services {
            let spec_hash = service.spec_hash();
            let replace = match self.service_supervisors.get(name) {
                Some(existing) if existing.spec_hash() == spec_hash => {
                    existing.set_release(release_id);
                    false
                },
                Some(_) => true,
                None => true,
            };
            if !replace {
                continue;
            }

            if let Some(previous) = self.service_supervisors.remove(name) {
                info!(
                    application = %self.application_id,
                    service = %name,
                    "service spec changed, replacing"
                );
                previous.stop().await;
            }
            let supervisor = ServiceSupervisor::start(
                self.application_id.clone(),
                name.clone(),
                release_id.to_string(),
                service.clone(),
                Arc::clone(&self.engine),
                Arc::clone(&self.validators),
                Arc::clone(&self.reporter),
            );
            self.service_supervisors.insert(name.clone(), supervisor);
        }

        // Only now does the reporter's quorum set match the worker set.
        self.reporter.set_desired_application(release_id, services);
    }

    /// Id of the container currently backing `service`, if any.
    pub(crate) fn container_id(&self, service: &str) -> Option<String> {
        self.service_supervisors
            .get(service)
            .and_then(ServiceSupervisor::container_id)
    }

    /// Stops every worker concurrently, awaits teardown, then stops the
    /// reporter.
    pub(crate) async fn stop(mut self) {
        let supervisors: Vec<ServiceSupervisor> = self
            .service_supervisors
            .drain()
            .map(|(_, supervisor)| supervisor)
            .collect();
        futures::future::join_all(supervisors.into_iter().map(ServiceSupervisor::stop)).await;
        self.reporter.stop().await;
    }
}
