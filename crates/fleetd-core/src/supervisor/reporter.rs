//! Upstream status reporter.
//!
//! One reporter exists per application. Supervisors feed it observations
//! (`set_service_status`, `set_service_state`) and the desired target
//! (`set_desired_application`); three independent tick-driven loops publish
//! the delta upstream:
//!
//! - the **application-status loop** publishes the desired release, but only
//!   once every service in the desired set has been observed running that
//!   release (the quorum gate);
//! - the **service-status loop** publishes per-service release facts whose
//!   value differs from the last committed publication;
//! - the **service-state loop** does the same for lifecycle state and error
//!   message.
//!
//! A failed publish aborts the current sweep; only the entries that were
//! actually published are committed, so the remainder is retried on the
//! next tick.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Once, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{DEFAULT_TICK, REPORT_DEADLINE};
use crate::client::ClientError;
use crate::models::{
    SetDeviceApplicationStatusRequest, SetDeviceServiceStateRequest,
    SetDeviceServiceStatusRequest, Service,
};

/// Destination for reported facts.
///
/// The reporter holds this typed handle instead of a back-pointer into the
/// composition root; the agent adapts its control-plane client to it.
#[async_trait]
pub trait StatusSink: Send + Sync + 'static {
    /// Publish an application's current release.
    ///
    /// # Errors
    ///
    /// Returns an error if the publication fails; the reporter retries on
    /// its tick.
    async fn report_application_status(
        &self,
        application_id: &str,
        req: &SetDeviceApplicationStatusRequest,
    ) -> Result<(), ClientError>;

    /// Publish a service's current release.
    ///
    /// # Errors
    ///
    /// Returns an error if the publication fails; the reporter retries on
    /// its tick.
    async fn report_service_status(
        &self,
        application_id: &str,
        service: &str,
        req: &SetDeviceServiceStatusRequest,
    ) -> Result<(), ClientError>;

    /// Publish a service's observed state.
    ///
    /// # Errors
    ///
    /// Returns an error if the publication fails; the reporter retries on
    /// its tick.
    async fn report_service_state(
        &self,
        application_id: &str,
        service: &str,
        req: &SetDeviceServiceStateRequest,
    ) -> Result<(), ClientError>;
}

#[derive(Debug, Default)]
struct ReporterState {
    desired_application_release: String,
    desired_service_names: BTreeSet<String>,
    reported_application_release: String,

    service_statuses: BTreeMap<String, SetDeviceServiceStatusRequest>,
    reported_service_statuses: BTreeMap<String, SetDeviceServiceStatusRequest>,

    service_states: BTreeMap<String, SetDeviceServiceStateRequest>,
    reported_service_states: BTreeMap<String, SetDeviceServiceStateRequest>,
}

/// Publishes one application's release, service-status, and service-state
/// facts upstream.
pub struct Reporter {
    application_id: String,
    sink: Arc<dyn StatusSink>,
    state: Arc<RwLock<ReporterState>>,
    stop: watch::Sender<bool>,
    once: Once,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Reporter {
    /// Creates a reporter for `application_id` publishing through `sink`.
    ///
    /// The reporter loops start lazily on the first
    /// [`set_desired_application`](Self::set_desired_application).
    #[must_use]
    pub fn new(application_id: impl Into<String>, sink: Arc<dyn StatusSink>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            application_id: application_id.into(),
            sink,
            state: Arc::new(RwLock::new(ReporterState::default())),
            stop,
            once: Once::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Sets the release and service set the quorum gate is computed
    /// against, and starts the reporter loops if they are not yet running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn set_desired_application(&self, release_id: &str, services: &BTreeMap<String, Service>) {
        {
            let mut state = write_guard(&self.state);
            state.desired_application_release = release_id.to_string();
            state.desired_service_names = services.keys().cloned().collect();
        }

        self.once.call_once(|| {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.push(tokio::spawn(application_status_loop(
                self.application_id.clone(),
                Arc::clone(&self.sink),
                Arc::clone(&self.state),
                self.stop.subscribe(),
            )));
            tasks.push(tokio::spawn(service_status_loop(
                self.application_id.clone(),
                Arc::clone(&self.sink),
                Arc::clone(&self.state),
                self.stop.subscribe(),
            )));
            tasks.push(tokio::spawn(service_state_loop(
                self.application_id.clone(),
                Arc::clone(&self.sink),
                Arc::clone(&self.state),
                self.stop.subscribe(),
            )));
        });
    }

    /// Records that `service` was observed running the given release.
    pub fn set_service_status(&self, service: &str, status: SetDeviceServiceStatusRequest) {
        write_guard(&self.state)
            .service_statuses
            .insert(service.to_string(), status);
    }

    /// Records `service`'s observed lifecycle state.
    pub fn set_service_state(&self, service: &str, state: SetDeviceServiceStateRequest) {
        write_guard(&self.state)
            .service_states
            .insert(service.to_string(), state);
    }

    /// Stops the reporter loops and waits for them to exit.
    pub async fn stop(&self) {
        let _ = self.stop.send(true);
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

fn read_guard(lock: &RwLock<ReporterState>) -> std::sync::RwLockReadGuard<'_, ReporterState> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_guard(lock: &RwLock<ReporterState>) -> std::sync::RwLockWriteGuard<'_, ReporterState> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

async fn application_status_loop(
    application_id: String,
    sink: Arc<dyn StatusSink>,
    state: Arc<RwLock<ReporterState>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(DEFAULT_TICK);
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = ticker.tick() => {}
        }

        // The quorum gate: every desired service must have been observed
        // running the desired release, and that observation must already
        // have been published, before the application advances.
        let release_to_report = {
            let state = read_guard(&state);
            let desired = state.desired_application_release.clone();
            if desired == state.reported_application_release {
                None
            } else {
                let quorum = state.desired_service_names.iter().all(|name| {
                    let observed = state
                        .service_statuses
                        .get(name)
                        .is_some_and(|status| status.current_release_id == desired);
                    let published = state
                        .reported_service_statuses
                        .get(name)
                        .is_some_and(|status| status.current_release_id == desired);
                    observed && published
                });
                quorum.then_some(desired)
            }
        };
        let Some(release) = release_to_report else {
            continue;
        };

        let req = SetDeviceApplicationStatusRequest {
            current_release_id: release.clone(),
        };
        // The publish itself is cancellable: stopping the reporter aborts
        // an in-flight call instead of waiting out its deadline.
        let result = tokio::select! {
            _ = stop_rx.changed() => return,
            result = timeout(
                REPORT_DEADLINE,
                sink.report_application_status(&application_id, &req),
            ) => result,
        };
        match result {
            Ok(Ok(())) => {
                debug!(application = %application_id, release = %release, "reported application status");
                write_guard(&state).reported_application_release = release;
            },
            Ok(Err(err)) => {
                warn!(application = %application_id, error = %err, "report application status");
            },
            Err(_) => {
                warn!(application = %application_id, "report application status timed out");
            },
        }
    }
}

async fn service_status_loop(
    application_id: String,
    sink: Arc<dyn StatusSink>,
    state: Arc<RwLock<ReporterState>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(DEFAULT_TICK);
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = ticker.tick() => {}
        }

        let (diff, snapshot) = {
            let state = read_guard(&state);
            let diff: Vec<(String, SetDeviceServiceStatusRequest)> = state
                .service_statuses
                .iter()
                .filter(|(name, status)| {
                    state
                        .reported_service_statuses
                        .get(*name)
                        .is_none_or(|reported| {
                            reported.current_release_id != status.current_release_id
                        })
                })
                .map(|(name, status)| (name.clone(), status.clone()))
                .collect();
            (diff, state.service_statuses.clone())
        };

        let mut published = Vec::new();
        for (name, status) in &diff {
            let result = tokio::select! {
                _ = stop_rx.changed() => return,
                result = timeout(
                    REPORT_DEADLINE,
                    sink.report_service_status(&application_id, name, status),
                ) => result,
            };
            match result {
                Ok(Ok(())) => published.push(name.clone()),
                Ok(Err(err)) => {
                    warn!(application = %application_id, service = %name, error = %err, "report service status");
                    break;
                },
                Err(_) => {
                    warn!(application = %application_id, service = %name, "report service status timed out");
                    break;
                },
            }
        }

        let mut state = write_guard(&state);
        for name in &published {
            if let Some(status) = snapshot.get(name) {
                state
                    .reported_service_statuses
                    .insert(name.clone(), status.clone());
            }
        }
        state
            .reported_service_statuses
            .retain(|name, _| snapshot.contains_key(name));
    }
}

async fn service_state_loop(
    application_id: String,
    sink: Arc<dyn StatusSink>,
    state: Arc<RwLock<ReporterState>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(DEFAULT_TICK);
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = ticker.tick() => {}
        }

        let (diff, snapshot) = {
            let state = read_guard(&state);
            let diff: Vec<(String, SetDeviceServiceStateRequest)> = state
                .service_states
                .iter()
                .filter(|(name, current)| {
                    state
                        .reported_service_states
                        .get(*name)
                        .is_none_or(|reported| reported != *current)
                })
                .map(|(name, current)| (name.clone(), current.clone()))
                .collect();
            (diff, state.service_states.clone())
        };

        let mut published = Vec::new();
        for (name, service_state) in &diff {
            let result = tokio::select! {
                _ = stop_rx.changed() => return,
                result = timeout(
                    REPORT_DEADLINE,
                    sink.report_service_state(&application_id, name, service_state),
                ) => result,
            };
            match result {
                Ok(Ok(())) => published.push(name.clone()),
                Ok(Err(err)) => {
                    warn!(application = %application_id, service = %name, error = %err, "report service state");
                    break;
                },
                Err(_) => {
                    warn!(application = %application_id, service = %name, "report service state timed out");
                    break;
                },
            }
        }

        let mut state = write_guard(&state);
        for name in &published {
            if let Some(service_state) = snapshot.get(name) {
                state
                    .reported_service_states
                    .insert(name.clone(), service_state.clone());
            }
        }
        state
            .reported_service_states
            .retain(|name, _| snapshot.contains_key(name));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::models::ServiceStateKind;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum SinkCall {
        ApplicationStatus(String, String),
        ServiceStatus(String, String, String),
        ServiceState(String, String, ServiceStateKind),
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<SinkCall>>,
        fail_service_statuses: Mutex<HashSet<String>>,
    }

    impl RecordingSink {
        fn calls(&self) -> Vec<SinkCall> {
            self.calls.lock().unwrap().clone()
        }

        fn fail_service_status(&self, service: &str, fail: bool) {
            let mut failures = self.fail_service_statuses.lock().unwrap();
            if fail {
                failures.insert(service.to_string());
            } else {
                failures.remove(service);
            }
        }
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn report_application_status(
            &self,
            application_id: &str,
            req: &SetDeviceApplicationStatusRequest,
        ) -> Result<(), ClientError> {
            self.calls.lock().unwrap().push(SinkCall::ApplicationStatus(
                application_id.to_string(),
                req.current_release_id.clone(),
            ));
            Ok(())
        }

        async fn report_service_status(
            &self,
            application_id: &str,
            service: &str,
            req: &SetDeviceServiceStatusRequest,
        ) -> Result<(), ClientError> {
            if self.fail_service_statuses.lock().unwrap().contains(service) {
                return Err(ClientError::Transport("injected failure".to_string()));
            }
            self.calls.lock().unwrap().push(SinkCall::ServiceStatus(
                application_id.to_string(),
                service.to_string(),
                req.current_release_id.clone(),
            ));
            Ok(())
        }

        async fn report_service_state(
            &self,
            application_id: &str,
            service: &str,
            req: &SetDeviceServiceStateRequest,
        ) -> Result<(), ClientError> {
            self.calls.lock().unwrap().push(SinkCall::ServiceState(
                application_id.to_string(),
                service.to_string(),
                req.state,
            ));
            Ok(())
        }
    }

    fn services(names: &[&str]) -> BTreeMap<String, Service> {
        names
            .iter()
            .map(|name| ((*name).to_string(), Service::default()))
            .collect()
    }

    fn status(release: &str) -> SetDeviceServiceStatusRequest {
        SetDeviceServiceStatusRequest {
            current_release_id: release.to_string(),
        }
    }

    async fn settle() {
        // Give every loop a handful of ticks; paused time makes this fast.
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_status_waits_for_quorum() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = Reporter::new("app1", Arc::clone(&sink) as Arc<dyn StatusSink>);

        reporter.set_desired_application("r1", &services(&["s1", "s2"]));
        reporter.set_service_status("s1", status("r1"));
        settle().await;

        assert!(
            !sink
                .calls()
                .iter()
                .any(|call| matches!(call, SinkCall::ApplicationStatus(..))),
            "application status must not be published before quorum"
        );

        reporter.set_service_status("s2", status("r1"));
        settle().await;

        let calls = sink.calls();
        let app_index = calls
            .iter()
            .position(|call| {
                *call == SinkCall::ApplicationStatus("app1".to_string(), "r1".to_string())
            })
            .expect("application status published after quorum");
        let status_indices: Vec<_> = calls
            .iter()
            .enumerate()
            .filter(|(_, call)| matches!(call, SinkCall::ServiceStatus(..)))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(status_indices.len(), 2);
        assert!(status_indices.iter().all(|i| *i < app_index));

        reporter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_status_not_republished() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = Reporter::new("app1", Arc::clone(&sink) as Arc<dyn StatusSink>);

        reporter.set_desired_application("r1", &services(&["s1"]));
        reporter.set_service_status("s1", status("r1"));
        settle().await;
        settle().await;

        let app_calls = sink
            .calls()
            .iter()
            .filter(|call| matches!(call, SinkCall::ApplicationStatus(..)))
            .count();
        assert_eq!(app_calls, 1);

        reporter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_status_diff_publishes_only_changes() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = Reporter::new("app1", Arc::clone(&sink) as Arc<dyn StatusSink>);

        reporter.set_desired_application("r1", &services(&["s1", "s2"]));
        reporter.set_service_status("s1", status("r1"));
        reporter.set_service_status("s2", status("r1"));
        settle().await;

        // Re-setting the same value publishes nothing new.
        reporter.set_service_status("s1", status("r1"));
        settle().await;

        let s1_calls = sink
            .calls()
            .iter()
            .filter(|call| {
                matches!(call, SinkCall::ServiceStatus(_, service, _) if service == "s1")
            })
            .count();
        assert_eq!(s1_calls, 1);

        // A changed value publishes exactly once more.
        reporter.set_service_status("s1", status("r2"));
        settle().await;

        let s1_calls = sink
            .calls()
            .iter()
            .filter(|call| {
                matches!(call, SinkCall::ServiceStatus(_, service, _) if service == "s1")
            })
            .count();
        assert_eq!(s1_calls, 2);

        reporter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_publish_is_retried_without_disturbing_committed() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = Reporter::new("app1", Arc::clone(&sink) as Arc<dyn StatusSink>);

        sink.fail_service_status("s2", true);
        reporter.set_desired_application("r1", &services(&["s1", "s2"]));
        reporter.set_service_status("s1", status("r1"));
        reporter.set_service_status("s2", status("r1"));
        settle().await;

        // s1 went through and is committed; s2 kept failing.
        assert!(sink.calls().contains(&SinkCall::ServiceStatus(
            "app1".to_string(),
            "s1".to_string(),
            "r1".to_string()
        )));
        assert!(!sink
            .calls()
            .iter()
            .any(|call| matches!(call, SinkCall::ServiceStatus(_, service, _) if service == "s2")));

        sink.fail_service_status("s2", false);
        settle().await;

        // s2 is retried; s1 is not republished.
        let calls = sink.calls();
        assert_eq!(
            calls
                .iter()
                .filter(
                    |call| matches!(call, SinkCall::ServiceStatus(_, service, _) if service == "s2")
                )
                .count(),
            1
        );
        assert_eq!(
            calls
                .iter()
                .filter(
                    |call| matches!(call, SinkCall::ServiceStatus(_, service, _) if service == "s1")
                )
                .count(),
            1
        );

        reporter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_state_published_on_transition_only() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = Reporter::new("app1", Arc::clone(&sink) as Arc<dyn StatusSink>);

        reporter.set_desired_application("r1", &services(&["s1"]));
        let running = SetDeviceServiceStateRequest {
            state: ServiceStateKind::Running,
            error_message: None,
        };
        reporter.set_service_state("s1", running.clone());
        settle().await;
        reporter.set_service_state("s1", running);
        settle().await;

        let state_calls = sink
            .calls()
            .iter()
            .filter(|call| matches!(call, SinkCall::ServiceState(..)))
            .count();
        assert_eq!(state_calls, 1);

        reporter.stop().await;
    }
}
