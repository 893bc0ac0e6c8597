//! Shared test doubles: an in-memory control-plane client and container
//! engine, plus a fixed-policy variables source.

#![allow(dead_code)] // not every test binary uses every helper

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fleetd_core::client::{ApiClient, ClientError, RegisterDeviceResponse, TunnelStream};
use fleetd_core::engine::{
    ContainerConfig, ContainerEngine, ContainerStats, ContainerStatus, ContainerSummary,
    EngineError,
};
use fleetd_core::models::{
    DeviceInfo, Metric, ServiceStateKind, SetDeviceApplicationStatusRequest,
    SetDeviceServiceStateRequest, SetDeviceServiceStatusRequest,
};
use fleetd_core::supervisor::StatusSink;
use fleetd_core::variables::Variables;

/// One observed control-plane call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    RegisterDevice {
        token: String,
    },
    SetAccessKey(String),
    SetDeviceId(String),
    SetDeviceInfo,
    SetApplicationStatus {
        application: String,
        release: String,
    },
    SetServiceStatus {
        application: String,
        service: String,
        release: String,
    },
    SetServiceState {
        application: String,
        service: String,
        state: ServiceStateKind,
        error_message: Option<String>,
    },
    DeleteApplicationStatus {
        application: String,
    },
    DeleteServiceStatus {
        application: String,
        service: String,
    },
    DeleteServiceState {
        application: String,
        service: String,
    },
    PushDeviceMetrics {
        count: usize,
    },
    PushServiceMetrics {
        application: String,
        service: String,
        count: usize,
    },
}

/// Recording in-memory control-plane client.
#[derive(Default)]
pub struct FakeApiClient {
    calls: Mutex<Vec<ApiCall>>,
    register_response: Mutex<Option<RegisterDeviceResponse>>,
    bundle_bytes: Mutex<Option<Vec<u8>>>,
}

impl FakeApiClient {
    pub fn with_register_response(device_id: &str, access_key: &str) -> Self {
        let client = Self::default();
        *client.register_response.lock().unwrap() = Some(RegisterDeviceResponse {
            device_id: device_id.to_string(),
            device_access_key: access_key.to_string(),
        });
        client
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_bundle_bytes(&self, bytes: &[u8]) {
        *self.bundle_bytes.lock().unwrap() = Some(bytes.to_vec());
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ApiClient for FakeApiClient {
    fn set_access_key(&self, access_key: String) {
        self.record(ApiCall::SetAccessKey(access_key));
    }

    fn set_device_id(&self, device_id: String) {
        self.record(ApiCall::SetDeviceId(device_id));
    }

    async fn register_device(
        &self,
        registration_token: &str,
    ) -> Result<RegisterDeviceResponse, ClientError> {
        self.record(ApiCall::RegisterDevice {
            token: registration_token.to_string(),
        });
        self.register_response
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ClientError::Transport("registration rejected".to_string()))
    }

    async fn get_bundle_bytes(&self) -> Result<Vec<u8>, ClientError> {
        self.bundle_bytes
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ClientError::Transport("no bundle available".to_string()))
    }

    async fn set_device_info(&self, _info: &DeviceInfo) -> Result<(), ClientError> {
        self.record(ApiCall::SetDeviceInfo);
        Ok(())
    }

    async fn set_device_application_status(
        &self,
        application_id: &str,
        req: &SetDeviceApplicationStatusRequest,
    ) -> Result<(), ClientError> {
        self.record(ApiCall::SetApplicationStatus {
            application: application_id.to_string(),
            release: req.current_release_id.clone(),
        });
        Ok(())
    }

    async fn set_device_service_status(
        &self,
        application_id: &str,
        service: &str,
        req: &SetDeviceServiceStatusRequest,
    ) -> Result<(), ClientError> {
        self.record(ApiCall::SetServiceStatus {
            application: application_id.to_string(),
            service: service.to_string(),
            release: req.current_release_id.clone(),
        });
        Ok(())
    }

    async fn set_device_service_state(
        &self,
        application_id: &str,
        service: &str,
        req: &SetDeviceServiceStateRequest,
    ) -> Result<(), ClientError> {
        self.record(ApiCall::SetServiceState {
            application: application_id.to_string(),
            service: service.to_string(),
            state: req.state,
            error_message: req.error_message.clone(),
        });
        Ok(())
    }

    async fn delete_device_application_status(
        &self,
        application_id: &str,
    ) -> Result<(), ClientError> {
        self.record(ApiCall::DeleteApplicationStatus {
            application: application_id.to_string(),
        });
        Ok(())
    }

    async fn delete_device_service_status(
        &self,
        application_id: &str,
        service: &str,
    ) -> Result<(), ClientError> {
        self.record(ApiCall::DeleteServiceStatus {
            application: application_id.to_string(),
            service: service.to_string(),
        });
        Ok(())
    }

    async fn delete_device_service_state(
        &self,
        application_id: &str,
        service: &str,
    ) -> Result<(), ClientError> {
        self.record(ApiCall::DeleteServiceState {
            application: application_id.to_string(),
            service: service.to_string(),
        });
        Ok(())
    }

    async fn push_device_metrics(&self, metrics: &[Metric]) -> Result<(), ClientError> {
        self.record(ApiCall::PushDeviceMetrics {
            count: metrics.len(),
        });
        Ok(())
    }

    async fn push_service_metrics(
        &self,
        application_id: &str,
        service: &str,
        metrics: &[Metric],
    ) -> Result<(), ClientError> {
        self.record(ApiCall::PushServiceMetrics {
            application: application_id.to_string(),
            service: service.to_string(),
            count: metrics.len(),
        });
        Ok(())
    }

    async fn open_tunnel(&self) -> Result<Box<dyn TunnelStream>, ClientError> {
        Err(ClientError::Transport("no tunnel in tests".to_string()))
    }
}

#[async_trait]
impl StatusSink for FakeApiClient {
    async fn report_application_status(
        &self,
        application_id: &str,
        req: &SetDeviceApplicationStatusRequest,
    ) -> Result<(), ClientError> {
        ApiClient::set_device_application_status(self, application_id, req).await
    }

    async fn report_service_status(
        &self,
        application_id: &str,
        service: &str,
        req: &SetDeviceServiceStatusRequest,
    ) -> Result<(), ClientError> {
        ApiClient::set_device_service_status(self, application_id, service, req).await
    }

    async fn report_service_state(
        &self,
        application_id: &str,
        service: &str,
        req: &SetDeviceServiceStateRequest,
    ) -> Result<(), ClientError> {
        ApiClient::set_device_service_state(self, application_id, service, req).await
    }
}

/// One observed engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOp {
    Pull(String),
    Create(String),
    Start(String),
    Stop(String),
    Remove(String),
}

/// A container held by the fake engine.
#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub status: ContainerStatus,
}

/// Recording in-memory container engine.
#[derive(Default)]
pub struct FakeEngine {
    next_id: AtomicU64,
    containers: Mutex<HashMap<String, FakeContainer>>,
    ops: Mutex<Vec<EngineOp>>,
    pub fail_pull: AtomicBool,
}

impl FakeEngine {
    pub fn ops(&self) -> Vec<EngineOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.containers.lock().unwrap().values().cloned().collect()
    }

    pub fn containers_with_label(&self, key: &str, value: &str) -> Vec<FakeContainer> {
        self.containers()
            .into_iter()
            .filter(|container| container.labels.get(key).map(String::as_str) == Some(value))
            .collect()
    }

    /// Flips a running container to exited, as if its process died.
    pub fn exit_container(&self, id: &str, exit_code: i32) {
        if let Some(container) = self.containers.lock().unwrap().get_mut(id) {
            container.status = ContainerStatus::Exited {
                exit_code: Some(exit_code),
            };
        }
    }

    fn record(&self, op: EngineOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.record(EngineOp::Pull(image.to_string()));
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(EngineError::PullFailed {
                image: image.to_string(),
                message: "injected pull failure".to_string(),
            });
        }
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String, EngineError> {
        let id = format!("c{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: config.name.clone(),
                labels: config.labels.clone(),
                status: ContainerStatus::Created,
            },
        );
        self.record(EngineOp::Create(id.clone()));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(EngineOp::Start(id.to_string()));
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        container.status = ContainerStatus::Running;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), EngineError> {
        self.record(EngineOp::Stop(id.to_string()));
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        container.status = ContainerStatus::Exited { exit_code: Some(0) };
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(EngineOp::Remove(id.to_string()));
        self.containers
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    async fn list_containers(
        &self,
        label_filter: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .values()
            .filter(|container| {
                label_filter
                    .iter()
                    .all(|(key, value)| container.labels.get(key) == Some(value))
            })
            .map(|container| ContainerSummary {
                id: container.id.clone(),
                name: container.name.clone(),
                labels: container.labels.clone(),
                status: container.status,
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerSummary, EngineError> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|container| ContainerSummary {
                id: container.id.clone(),
                name: container.name.clone(),
                labels: container.labels.clone(),
                status: container.status,
            })
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    async fn container_logs(&self, id: &str, _tail: usize) -> Result<String, EngineError> {
        if self.containers.lock().unwrap().contains_key(id) {
            Ok(format!("logs for {id}\n"))
        } else {
            Err(EngineError::NotFound(id.to_string()))
        }
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats, EngineError> {
        if self.containers.lock().unwrap().contains_key(id) {
            Ok(ContainerStats {
                cpu_percent: 2.5,
                memory_usage_bytes: 1024,
                memory_limit_bytes: None,
                network_rx_bytes: 64,
                network_tx_bytes: 32,
            })
        } else {
            Err(EngineError::NotFound(id.to_string()))
        }
    }
}

/// Fixed-policy variables.
#[derive(Debug, Default)]
pub struct StaticVariables {
    pub disable_ssh: bool,
    pub disable_custom_commands: bool,
    pub whitelisted_images: Option<Vec<String>>,
    pub disabled_metrics: Vec<String>,
}

impl Variables for StaticVariables {
    fn disable_ssh(&self) -> bool {
        self.disable_ssh
    }

    fn disable_custom_commands(&self) -> bool {
        self.disable_custom_commands
    }

    fn whitelisted_images(&self) -> Option<Vec<String>> {
        self.whitelisted_images.clone()
    }

    fn disabled_metrics(&self) -> Vec<String> {
        self.disabled_metrics.clone()
    }
}

/// Polls `cond` under paused tokio time until it holds, or panics after a
/// generous virtual-time budget.
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("timed out waiting for: {what}");
}
