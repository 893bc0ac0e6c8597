//! Remote control protocol.
//!
//! The agent dials the control plane for a byte tunnel and answers
//! length-delimited JSON requests over it, dispatching to the same device
//! API the local server exposes. The tunnel is re-established on a
//! one-second cadence whenever it drops.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fleetd_core::client::{ApiClient, TunnelStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::service_api::{DeviceApi, DEFAULT_LOG_TAIL};

const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
const DIAL_DEADLINE: Duration = Duration::from_secs(60);

/// A request arriving over the tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteRequest {
    /// Liveness probe.
    Health,

    /// Device facts.
    Info,

    /// The current bundle.
    Bundle,

    /// Tail of one service's container log.
    ServiceLogs {
        /// Application id.
        application: String,
        /// Service name.
        service: String,
        /// Number of lines; defaults to [`DEFAULT_LOG_TAIL`].
        #[serde(default)]
        tail: Option<usize>,
    },

    /// Live metrics of one service's container.
    ServiceMetrics {
        /// Application id.
        application: String,
        /// Service name.
        service: String,
    },

    /// SSH session request. Refused when device policy disables SSH.
    Ssh,
}

/// The answer to one [`RemoteRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteResponse {
    /// Whether the request succeeded.
    pub ok: bool,

    /// Error detail when `ok` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Response payload when `ok` is true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl RemoteResponse {
    fn ok(payload: serde_json::Value) -> Self {
        Self {
            ok: true,
            error: None,
            payload: Some(payload),
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            payload: None,
        }
    }
}

/// Dials and serves tunnels until the stop signal fires.
pub async fn run(client: Arc<dyn ApiClient>, api: Arc<DeviceApi>, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(RECONNECT_INTERVAL);
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = ticker.tick() => {}
        }

        let stream = match timeout(DIAL_DEADLINE, client.open_tunnel()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(error = %err, "open remote control tunnel");
                continue;
            },
            Err(_) => {
                warn!("open remote control tunnel timed out");
                continue;
            },
        };

        info!("remote control tunnel established");
        if let Err(err) = serve_tunnel(stream, &api, &mut stop_rx).await {
            warn!(error = %err, "remote control tunnel closed");
        }
    }
}

async fn serve_tunnel(
    stream: Box<dyn TunnelStream>,
    api: &Arc<DeviceApi>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    loop {
        tokio::select! {
            _ = stop_rx.changed() => return Ok(()),
            frame = framed.next() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                let frame = frame?;
                let response = handle_frame(&frame, api).await;
                let encoded = serde_json::to_vec(&response)
                    .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
                framed.send(Bytes::from(encoded)).await?;
            }
        }
    }
}

async fn handle_frame(frame: &[u8], api: &Arc<DeviceApi>) -> RemoteResponse {
    let request: RemoteRequest = match serde_json::from_slice(frame) {
        Ok(request) => request,
        Err(err) => return RemoteResponse::err(format!("bad request: {err}")),
    };
    handle_request(request, api).await
}

async fn handle_request(request: RemoteRequest, api: &Arc<DeviceApi>) -> RemoteResponse {
    match request {
        RemoteRequest::Health => RemoteResponse::ok(serde_json::Value::String("ok".to_string())),
        RemoteRequest::Info => match serde_json::to_value(api.device_info()) {
            Ok(payload) => RemoteResponse::ok(payload),
            Err(err) => RemoteResponse::err(err.to_string()),
        },
        RemoteRequest::Bundle => match api.current_bundle() {
            Some(bundle) => match serde_json::to_value(bundle) {
                Ok(payload) => RemoteResponse::ok(payload),
                Err(err) => RemoteResponse::err(err.to_string()),
            },
            None => RemoteResponse::err("no bundle yet"),
        },
        RemoteRequest::ServiceLogs {
            application,
            service,
            tail,
        } => {
            match api
                .service_logs(&application, &service, tail.unwrap_or(DEFAULT_LOG_TAIL))
                .await
            {
                Ok(logs) => RemoteResponse::ok(serde_json::Value::String(logs)),
                Err(err) => RemoteResponse::err(err.to_string()),
            }
        },
        RemoteRequest::ServiceMetrics {
            application,
            service,
        } => match api.service_metrics(&application, &service).await {
            Ok(metrics) => match serde_json::to_value(metrics) {
                Ok(payload) => RemoteResponse::ok(payload),
                Err(err) => RemoteResponse::err(err.to_string()),
            },
            Err(err) => RemoteResponse::err(err.to_string()),
        },
        RemoteRequest::Ssh => {
            if api.ssh_disabled() {
                RemoteResponse::err("ssh is disabled on this device")
            } else {
                RemoteResponse::err("ssh is not supported by this agent")
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request: RemoteRequest = serde_json::from_str(
            r#"{"type": "service_logs", "application": "a", "service": "s", "tail": 10}"#,
        )
        .unwrap();
        match request {
            RemoteRequest::ServiceLogs {
                application,
                service,
                tail,
            } => {
                assert_eq!(application, "a");
                assert_eq!(service, "s");
                assert_eq!(tail, Some(10));
            },
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let response = RemoteResponse::ok(serde_json::Value::String("ok".to_string()));
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"ok":true,"payload":"ok"}"#
        );
    }
}
