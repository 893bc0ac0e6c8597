//! Control-plane client abstraction.
//!
//! The agent consumes the control plane through the [`ApiClient`] trait; the
//! HTTP transport lives in an adapter crate. All calls are made with a
//! bounded deadline by the calling loop, never by the implementation.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::models::{
    DeviceInfo, Metric, SetDeviceApplicationStatusRequest, SetDeviceServiceStateRequest,
    SetDeviceServiceStatusRequest,
};

/// Errors surfaced by a control-plane client adapter.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The transport failed before a response was received.
    #[error("transport: {0}")]
    Transport(String),

    /// The control plane answered with a non-success status.
    #[error("control plane returned status {status}")]
    Status {
        /// HTTP-like status code.
        status: u16,
    },

    /// The caller's deadline elapsed before the call completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A payload could not be encoded or decoded.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Response to a successful device registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceResponse {
    /// Control-plane-assigned device identifier.
    pub device_id: String,

    /// Access key the device authenticates with from now on.
    pub device_access_key: String,
}

/// A bidirectional byte stream tunneled through the control plane.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

/// Bidirectional control-plane transport consumed by the agent.
#[async_trait::async_trait]
pub trait ApiClient: Send + Sync + 'static {
    /// Install the access key used to authenticate subsequent calls.
    fn set_access_key(&self, access_key: String);

    /// Install the device id subsequent calls are scoped to.
    fn set_device_id(&self, device_id: String);

    /// Exchange a registration token for a device identity.
    ///
    /// # Errors
    ///
    /// Returns an error if registration is rejected or the transport fails.
    async fn register_device(
        &self,
        registration_token: &str,
    ) -> Result<RegisterDeviceResponse, ClientError>;

    /// Fetch the latest bundle as raw bytes.
    ///
    /// The payload is parsed (and possibly merged with the last-known-good
    /// bundle) by the caller; the transport makes no schema promise beyond
    /// "bytes".
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    async fn get_bundle_bytes(&self) -> Result<Vec<u8>, ClientError>;

    /// Publish device facts.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    async fn set_device_info(&self, info: &DeviceInfo) -> Result<(), ClientError>;

    /// Publish an application's current release.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    async fn set_device_application_status(
        &self,
        application_id: &str,
        req: &SetDeviceApplicationStatusRequest,
    ) -> Result<(), ClientError>;

    /// Publish a service's current release.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    async fn set_device_service_status(
        &self,
        application_id: &str,
        service: &str,
        req: &SetDeviceServiceStatusRequest,
    ) -> Result<(), ClientError>;

    /// Publish a service's observed state.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    async fn set_device_service_state(
        &self,
        application_id: &str,
        service: &str,
        req: &SetDeviceServiceStateRequest,
    ) -> Result<(), ClientError>;

    /// Delete the stored application status for an application no longer in
    /// the bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    async fn delete_device_application_status(
        &self,
        application_id: &str,
    ) -> Result<(), ClientError>;

    /// Delete the stored service status for a service no longer in the
    /// bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    async fn delete_device_service_status(
        &self,
        application_id: &str,
        service: &str,
    ) -> Result<(), ClientError>;

    /// Delete the stored service state for a service no longer in the
    /// bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    async fn delete_device_service_state(
        &self,
        application_id: &str,
        service: &str,
    ) -> Result<(), ClientError>;

    /// Push device-level metrics.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    async fn push_device_metrics(&self, metrics: &[Metric]) -> Result<(), ClientError>;

    /// Push metrics for one service.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails.
    async fn push_service_metrics(
        &self,
        application_id: &str,
        service: &str,
        metrics: &[Metric],
    ) -> Result<(), ClientError>;

    /// Open a byte tunnel to the control plane for the remote control
    /// protocol.
    ///
    /// # Errors
    ///
    /// Returns an error if the tunnel cannot be established.
    async fn open_tunnel(&self) -> Result<Box<dyn TunnelStream>, ClientError>;
}
