//! Per-service supervision worker.
//!
//! One worker exists per (application, service). On every tick (and on edge
//! wake-ups when the target changes) it drives the engine one step toward
//! the target spec: validate, adopt or replace the container, pull, create,
//! start. Engine errors are retried on the next tick; validator failures are
//! sticky until the spec changes; cancellation is honored between steps.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::reporter::Reporter;
use super::DEFAULT_TICK;
use crate::engine::{
    ContainerConfig, ContainerEngine, ContainerStatus, ContainerSummary, LABEL_APPLICATION,
    LABEL_SERVICE, LABEL_SPEC_HASH,
};
use crate::models::{
    RestartPolicy, Service, ServiceStateKind, SetDeviceServiceStateRequest,
    SetDeviceServiceStatusRequest,
};
use crate::validator::Validator;

#[derive(Debug, Clone)]
struct Target {
    release_id: String,
    service: Service,
    spec_hash: String,
}

/// Handle to one service's supervision worker.
pub(crate) struct ServiceSupervisor {
    target: Arc<Mutex<Target>>,
    current_container: Arc<Mutex<Option<String>>>,
    wake: Arc<Notify>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServiceSupervisor {
    /// Spawns the worker bound to `release_id`.
    pub(crate) fn start(
        application_id: String,
        service_name: String,
        release_id: String,
        service: Service,
        engine: Arc<dyn ContainerEngine>,
        validators: Arc<[Box<dyn Validator>]>,
        reporter: Arc<Reporter>,
    ) -> Self {
        let spec_hash = service.spec_hash();
        let target = Arc::new(Mutex::new(Target {
            release_id,
            service,
            spec_hash,
        }));
        let current_container = Arc::new(Mutex::new(None));
        let wake = Arc::new(Notify::new());
        let (stop, stop_rx) = watch::channel(false);

        let worker = Worker {
            application_id,
            service_name,
            engine,
            validators,
            reporter,
            target: Arc::clone(&target),
            current_container: Arc::clone(&current_container),
            wake: Arc::clone(&wake),
            stopped_by_agent: Mutex::new(HashSet::new()),
        };
        let task = tokio::spawn(worker.run(stop_rx));

        Self {
            target,
            current_container,
            wake,
            stop,
            task,
        }
    }

    /// Hash of the spec this worker converges on.
    pub(crate) fn spec_hash(&self) -> String {
        self.target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spec_hash
            .clone()
    }

    /// Retargets an equivalent spec to a new release.
    ///
    /// The running container is untouched; the next observation reports the
    /// new release.
    pub(crate) fn set_release(&self, release_id: &str) {
        {
            let mut target = self.target.lock().unwrap_or_else(PoisonError::into_inner);
            if target.release_id == release_id {
                return;
            }
            target.release_id = release_id.to_string();
        }
        self.wake.notify_one();
    }

    /// Id of the container currently managed for this service, if any.
    pub(crate) fn container_id(&self) -> Option<String> {
        self.current_container
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stops the worker, tears down its container, and waits for both.
    pub(crate) async fn stop(self) {
        let _ = self.stop.send(true);
        self.wake.notify_one();
        let _ = self.task.await;
    }
}

struct Worker {
    application_id: String,
    service_name: String,
    engine: Arc<dyn ContainerEngine>,
    validators: Arc<[Box<dyn Validator>]>,
    reporter: Arc<Reporter>,
    target: Arc<Mutex<Target>>,
    current_container: Arc<Mutex<Option<String>>>,
    wake: Arc<Notify>,
    /// Ids of containers this worker stopped itself, so `unless-stopped`
    /// can tell an agent stop from a crash. Only populated while a stopped
    /// container can still be observed (its removal failed).
    stopped_by_agent: Mutex<HashSet<String>>,
}

impl Worker {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(DEFAULT_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {}
                () = self.wake.notified() => {}
            }
            if *stop_rx.borrow() {
                break;
            }

            self.reconcile(&stop_rx).await;
        }

        self.teardown().await;
    }

    async fn reconcile(&self, stop_rx: &watch::Receiver<bool>) {
        let target = self
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for validator in self.validators.iter() {
            if let Err(err) = validator.validate(&target.service) {
                debug!(
                    application = %self.application_id,
                    service = %self.service_name,
                    validator = validator.name(),
                    "service vetoed"
                );
                self.report_state(ServiceStateKind::Exited, Some(err.to_string()));
                return;
            }
        }

        let containers = match self.engine.list_containers(&self.identity_labels()).await {
            Ok(containers) => containers,
            Err(err) => {
                warn!(
                    application = %self.application_id,
                    service = %self.service_name,
                    error = %err,
                    "list containers"
                );
                self.report_state(ServiceStateKind::Unknown, Some(err.to_string()));
                return;
            },
        };

        let (matching, stale): (Vec<ContainerSummary>, Vec<ContainerSummary>) = containers
            .into_iter()
            .partition(|container| {
                container.label(LABEL_SPEC_HASH) == Some(target.spec_hash.as_str())
            });

        // The previous spec's containers go away before the new cycle is
        // entered.
        for container in stale {
            if !self.stop_and_remove(&container.id, &target).await {
                return;
            }
        }
        if *stop_rx.borrow() {
            return;
        }

        if let Some(container) = matching.into_iter().next() {
            self.converge_existing(&container, &target).await;
            return;
        }

        self.set_current(None);
        self.start_new_cycle(stop_rx, &target).await;
    }

    /// Drives an already-created container of the right spec toward running.
    async fn converge_existing(&self, container: &ContainerSummary, target: &Target) {
        self.set_current(Some(container.id.clone()));

        match container.status {
            ContainerStatus::Running => {
                // Spec equivalence wins over release identity: the container
                // is reported as running the current target release even if
                // it was created under an earlier one.
                self.reporter.set_service_status(
                    &self.service_name,
                    SetDeviceServiceStatusRequest {
                        current_release_id: target.release_id.clone(),
                    },
                );
                self.report_state(ServiceStateKind::Running, None);
            },
            ContainerStatus::Created => {
                if let Err(err) = self.engine.start_container(&container.id).await {
                    warn!(
                        application = %self.application_id,
                        service = %self.service_name,
                        error = %err,
                        "start container"
                    );
                    self.report_state(ServiceStateKind::Created, Some(err.to_string()));
                } else {
                    self.report_state(ServiceStateKind::Created, None);
                }
            },
            ContainerStatus::Exited { exit_code } => {
                let explicitly_stopped = self
                    .stopped_by_agent
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains(&container.id);
                if !should_restart(target.service.restart, exit_code, explicitly_stopped) {
                    self.report_state(ServiceStateKind::Exited, None);
                    return;
                }
                if let Err(err) = self.engine.start_container(&container.id).await {
                    warn!(
                        application = %self.application_id,
                        service = %self.service_name,
                        error = %err,
                        "restart container"
                    );
                    self.report_state(ServiceStateKind::Exited, Some(err.to_string()));
                } else {
                    self.stopped_by_agent
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&container.id);
                }
            },
            ContainerStatus::Unknown => {
                self.report_state(ServiceStateKind::Unknown, None);
            },
        }
    }

    /// Pull, create, start. Each step may fail and be retried next tick.
    async fn start_new_cycle(&self, stop_rx: &watch::Receiver<bool>, target: &Target) {
        self.report_state(ServiceStateKind::Pulling, None);
        if let Err(err) = self.engine.pull_image(&target.service.image).await {
            warn!(
                application = %self.application_id,
                service = %self.service_name,
                image = %target.service.image,
                error = %err,
                "pull image"
            );
            self.report_state(ServiceStateKind::Pulling, Some(err.to_string()));
            return;
        }
        if *stop_rx.borrow() {
            return;
        }

        let config = ContainerConfig::for_service(
            &self.application_id,
            &self.service_name,
            &target.release_id,
            &target.service,
        );
        let id = match self.engine.create_container(&config).await {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    application = %self.application_id,
                    service = %self.service_name,
                    error = %err,
                    "create container"
                );
                self.report_state(ServiceStateKind::Unknown, Some(err.to_string()));
                return;
            },
        };
        self.set_current(Some(id.clone()));
        self.report_state(ServiceStateKind::Created, None);

        if let Err(err) = self.engine.start_container(&id).await {
            warn!(
                application = %self.application_id,
                service = %self.service_name,
                error = %err,
                "start container"
            );
            self.report_state(ServiceStateKind::Created, Some(err.to_string()));
            return;
        }

        info!(
            application = %self.application_id,
            service = %self.service_name,
            release = %target.release_id,
            container = %id,
            "container started"
        );
        // Running is reported once observed on a later tick.
    }

    /// Stops and removes one container; not-found counts as success.
    ///
    /// A successful stop records the id in the explicit-stop set; the
    /// record only outlives this call when the remove below fails and the
    /// stopped container stays observable.
    async fn stop_and_remove(&self, id: &str, target: &Target) -> bool {
        self.report_state(ServiceStateKind::Stopped, None);

        match self
            .engine
            .stop_container(id, target.service.stop_grace_period)
            .await
        {
            Ok(()) => {
                self.stopped_by_agent
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id.to_string());
            },
            Err(err) if err.is_not_found() => {},
            Err(err) => {
                warn!(
                    application = %self.application_id,
                    service = %self.service_name,
                    container = %id,
                    error = %err,
                    "stop container"
                );
                return false;
            },
        }
        match self.engine.remove_container(id).await {
            Ok(()) => {
                self.stopped_by_agent
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(id);
            },
            Err(err) if err.is_not_found() => {
                self.stopped_by_agent
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(id);
            },
            Err(err) => {
                warn!(
                    application = %self.application_id,
                    service = %self.service_name,
                    container = %id,
                    error = %err,
                    "remove container"
                );
                return false;
            },
        }
        true
    }

    /// Removes every container belonging to this (application, service).
    async fn teardown(&self) {
        let target = self
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match self.engine.list_containers(&self.identity_labels()).await {
            Ok(containers) => {
                for container in containers {
                    self.stop_and_remove(&container.id, &target).await;
                }
            },
            Err(err) => {
                warn!(
                    application = %self.application_id,
                    service = %self.service_name,
                    error = %err,
                    "list containers during teardown"
                );
            },
        }
        self.set_current(None);
    }

    fn identity_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            LABEL_APPLICATION.to_string(),
            self.application_id.clone(),
        );
        labels.insert(LABEL_SERVICE.to_string(), self.service_name.clone());
        labels
    }

    fn report_state(&self, state: ServiceStateKind, error_message: Option<String>) {
        self.reporter.set_service_state(
            &self.service_name,
            SetDeviceServiceStateRequest {
                state,
                error_message,
            },
        );
    }

    fn set_current(&self, id: Option<String>) {
        *self
            .current_container
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = id;
    }
}

/// Whether an exited container comes back up under `policy`.
///
/// An exit code the engine cannot report counts as a failure. The
/// explicit-stop marker is scoped to the worker's lifetime: a container
/// stopped by a previous incarnation of the agent reads as crashed.
const fn should_restart(
    policy: RestartPolicy,
    exit_code: Option<i32>,
    explicitly_stopped: bool,
) -> bool {
    match policy {
        RestartPolicy::Always => true,
        RestartPolicy::No => false,
        RestartPolicy::OnFailure => !matches!(exit_code, Some(0)),
        RestartPolicy::UnlessStopped => !explicitly_stopped,
    }
}
