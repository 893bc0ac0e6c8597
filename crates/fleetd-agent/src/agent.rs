//! Agent composition root.
//!
//! Wires the supervision hierarchy to a control-plane client and a container
//! engine, bootstraps device registration with atomic on-disk state, and
//! spawns the long-lived workers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetd_core::client::{ApiClient, ClientError};
use fleetd_core::engine::ContainerEngine;
use fleetd_core::fs_atomic::{self, FsAtomicError};
use fleetd_core::models::{
    SetDeviceApplicationStatusRequest, SetDeviceServiceStateRequest,
    SetDeviceServiceStatusRequest,
};
use fleetd_core::supervisor::{StatusSink, Supervisor};
use fleetd_core::validator::{CustomCommandsValidator, ImageValidator, Validator};
use fleetd_core::variables::{DirectoryVariables, Variables, VariablesError};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::applier::BundleApplier;
use crate::info::InfoReporter;
use crate::metrics::{MetricsPusher, ServiceMetricsFetcher};
use crate::server;
use crate::service_api::DeviceApi;
use crate::status_gc::StatusGarbageCollector;
use crate::updater::Updater;

const ACCESS_KEY_FILENAME: &str = "access-key";
const DEVICE_ID_FILENAME: &str = "device-id";
const BUNDLE_FILENAME: &str = "bundle";

const REGISTER_DEADLINE: Duration = Duration::from_secs(60);
const BIND_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Static configuration handed to the agent by its embedding CLI.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Project the device belongs to.
    pub project_id: String,

    /// Token exchanged for a device identity on first start.
    pub registration_token: String,

    /// Directory watched for device policy variables.
    pub conf_dir: PathBuf,

    /// Directory holding per-project agent state.
    pub state_dir: PathBuf,

    /// Port the local control API listens on (`127.0.0.1`). Zero lets the
    /// OS choose.
    pub server_port: u16,

    /// Version of this agent build. Must not be empty.
    pub version: String,

    /// Path to the installed agent binary, used by the self-updater.
    pub binary_path: PathBuf,
}

/// Fatal agent errors.
///
/// Worker loops never produce these; anything here aborts startup so the
/// process supervisor can restart the agent with backoff.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The agent was built without a version string.
    #[error("version not set")]
    VersionNotSet,

    /// The configuration or state directory could not be created.
    #[error(transparent)]
    Fs(#[from] FsAtomicError),

    /// The variables watcher failed to start.
    #[error(transparent)]
    Variables(#[from] VariablesError),

    /// Device registration failed.
    #[error("failed to register device: {0}")]
    Registration(#[source] ClientError),

    /// A persisted identity file is unreadable.
    #[error("read {file}: {message}")]
    ReadState {
        /// File that failed to load.
        file: &'static str,
        /// What went wrong.
        message: String,
    },

    /// [`Agent::run`] was called before [`Agent::initialize`].
    #[error("agent is not initialized")]
    NotInitialized,
}

/// Adapts the control-plane client to the reporter's sink seam.
struct ClientStatusSink {
    client: Arc<dyn ApiClient>,
}

#[async_trait]
impl StatusSink for ClientStatusSink {
    async fn report_application_status(
        &self,
        application_id: &str,
        req: &SetDeviceApplicationStatusRequest,
    ) -> Result<(), ClientError> {
        self.client
            .set_device_application_status(application_id, req)
            .await
    }

    async fn report_service_status(
        &self,
        application_id: &str,
        service: &str,
        req: &SetDeviceServiceStatusRequest,
    ) -> Result<(), ClientError> {
        self.client
            .set_device_service_status(application_id, service, req)
            .await
    }

    async fn report_service_state(
        &self,
        application_id: &str,
        service: &str,
        req: &SetDeviceServiceStateRequest,
    ) -> Result<(), ClientError> {
        self.client
            .set_device_service_state(application_id, service, req)
            .await
    }
}

/// The device agent.
pub struct Agent {
    client: Arc<dyn ApiClient>,
    config: AgentConfig,
    variables: Arc<DirectoryVariables>,
    supervisor: Arc<Supervisor>,
    status_gc: Arc<StatusGarbageCollector>,
    metrics_pusher: Arc<MetricsPusher>,
    updater: Arc<Updater>,
    api: Arc<DeviceApi>,
    listener: Option<TcpListener>,
}

impl Agent {
    /// Wires an agent over the given client and engine.
    ///
    /// Must be called from within a tokio runtime (the variables watcher
    /// spawns its rescan loop here).
    ///
    /// # Errors
    ///
    /// Returns an error if the version string is empty, the configuration
    /// directory cannot be created, or the variables watcher fails to
    /// start. All are fatal.
    pub fn new(
        client: Arc<dyn ApiClient>,
        engine: Arc<dyn ContainerEngine>,
        config: AgentConfig,
    ) -> Result<Self, AgentError> {
        if config.version.is_empty() {
            return Err(AgentError::VersionNotSet);
        }

        fs_atomic::ensure_dir(&config.conf_dir)?;

        let variables = Arc::new(DirectoryVariables::new(&config.conf_dir));
        variables.start()?;
        let variables_dyn: Arc<dyn Variables> = variables.clone();

        let validators: Vec<Box<dyn Validator>> = vec![
            Box::new(ImageValidator::new(Arc::clone(&variables_dyn))),
            Box::new(CustomCommandsValidator::new(Arc::clone(&variables_dyn))),
        ];

        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&engine),
            Arc::new(ClientStatusSink {
                client: Arc::clone(&client),
            }),
            validators,
        ));

        let fetcher = Arc::new(ServiceMetricsFetcher::new(
            Arc::clone(&engine),
            Arc::clone(&supervisor),
        ));
        let api = Arc::new(DeviceApi::new(
            config.version.clone(),
            Arc::clone(&engine),
            Arc::clone(&supervisor),
            Arc::clone(&variables_dyn),
            Arc::clone(&fetcher),
        ));

        Ok(Self {
            status_gc: Arc::new(StatusGarbageCollector::new(Arc::clone(&client))),
            metrics_pusher: Arc::new(MetricsPusher::new(
                Arc::clone(&client),
                fetcher,
                variables_dyn,
            )),
            updater: Arc::new(Updater::new(
                config.project_id.clone(),
                config.version.clone(),
                config.binary_path.clone(),
            )),
            client,
            variables,
            supervisor,
            api,
            listener: None,
            config,
        })
    }

    fn file_location(&self, name: &str) -> PathBuf {
        self.config
            .state_dir
            .join(&self.config.project_id)
            .join(name)
    }

    /// Registers the device if needed, installs the persisted identity on
    /// the client, and binds the local control listener.
    ///
    /// The listener bind is retried indefinitely on a one-second ticker;
    /// everything else here is fatal.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails or the identity files cannot
    /// be read or written.
    pub async fn initialize(&mut self) -> Result<(), AgentError> {
        fs_atomic::ensure_dir(&self.config.state_dir.join(&self.config.project_id))?;

        let access_key_path = self.file_location(ACCESS_KEY_FILENAME);
        if fs_atomic::read_optional(&access_key_path)?.is_some() {
            info!("device already registered");
        } else {
            info!("registering device");
            self.register().await?;
        }

        let access_key = read_identity_file(&access_key_path, ACCESS_KEY_FILENAME)?;
        let device_id =
            read_identity_file(&self.file_location(DEVICE_ID_FILENAME), DEVICE_ID_FILENAME)?;
        self.client.set_access_key(access_key);
        self.client.set_device_id(device_id);

        let mut ticker = tokio::time::interval(BIND_RETRY_INTERVAL);
        let listener = loop {
            ticker.tick().await;
            match TcpListener::bind(("127.0.0.1", self.config.server_port)).await {
                Ok(listener) => break listener,
                Err(err) => {
                    warn!(
                        port = self.config.server_port,
                        error = %err,
                        "bind local control listener"
                    );
                },
            }
        };
        info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "local control listener bound"
        );
        self.listener = Some(listener);
        Ok(())
    }

    async fn register(&self) -> Result<(), AgentError> {
        let response = match timeout(
            REGISTER_DEADLINE,
            self.client.register_device(&self.config.registration_token),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(AgentError::Registration(err)),
            Err(_) => return Err(AgentError::Registration(ClientError::DeadlineExceeded)),
        };

        fs_atomic::atomic_write(
            &self.file_location(ACCESS_KEY_FILENAME),
            response.device_access_key.as_bytes(),
        )?;
        fs_atomic::atomic_write(
            &self.file_location(DEVICE_ID_FILENAME),
            response.device_id.as_bytes(),
        )?;
        info!(device = %response.device_id, "device registered");
        Ok(())
    }

    /// Address of the bound local control listener, once initialized.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Runs every worker until `shutdown` fires, then tears the supervision
    /// tree down and waits for the workers to exit.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::NotInitialized`] if called before
    /// [`initialize`](Self::initialize).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        let listener = self.listener.take().ok_or(AgentError::NotInitialized)?;

        let (stop_tx, stop_rx) = watch::channel(false);

        let applier = BundleApplier::new(
            Arc::clone(&self.client),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.status_gc),
            Arc::clone(&self.updater),
            Arc::clone(&self.metrics_pusher),
            Arc::clone(&self.api),
            self.file_location(BUNDLE_FILENAME),
        );
        let info_reporter = InfoReporter::new(Arc::clone(&self.client), self.config.version.clone());

        let mut workers = Vec::new();
        workers.push(tokio::spawn(applier.run(stop_rx.clone())));
        workers.push(tokio::spawn(
            Arc::clone(&self.status_gc).run(stop_rx.clone()),
        ));
        workers.push(tokio::spawn(info_reporter.run(stop_rx.clone())));
        workers.push(tokio::spawn(
            Arc::clone(&self.metrics_pusher).run(stop_rx.clone()),
        ));
        workers.push(tokio::spawn(Arc::clone(&self.updater).run(stop_rx.clone())));
        workers.push(tokio::spawn(server::local::serve(
            listener,
            Arc::clone(&self.api),
            stop_rx.clone(),
        )));
        workers.push(tokio::spawn(server::remote::run(
            Arc::clone(&self.client),
            Arc::clone(&self.api),
            stop_rx,
        )));

        info!(project = %self.config.project_id, "agent running");
        let _ = shutdown.changed().await;
        info!("agent shutting down");

        let _ = stop_tx.send(true);
        for worker in workers {
            let _ = worker.await;
        }
        self.supervisor.shutdown().await;
        self.variables.stop().await;

        info!("agent shutdown complete");
        Ok(())
    }
}

fn read_identity_file(path: &std::path::Path, name: &'static str) -> Result<String, AgentError> {
    let bytes = fs_atomic::read_optional(path)?.ok_or(AgentError::ReadState {
        file: name,
        message: "file is missing".to_string(),
    })?;
    String::from_utf8(bytes).map_err(|err| AgentError::ReadState {
        file: name,
        message: err.to_string(),
    })
}
