//! Local HTTP control API.
//!
//! Served over the pre-bound `127.0.0.1` listener the agent acquired during
//! initialization. Read-only surface for the on-host CLI.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::error;

use crate::service_api::{ApiError, DeviceApi, DEFAULT_LOG_TAIL};

/// Serves the router on `listener` until the stop signal fires.
pub async fn serve(listener: TcpListener, api: Arc<DeviceApi>, mut stop_rx: watch::Receiver<bool>) {
    let shutdown = async move {
        let _ = stop_rx.changed().await;
    };
    if let Err(err) = axum::serve(listener, router(api))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %err, "serve local device API");
    }
}

/// Builds the local API router.
pub fn router(api: Arc<DeviceApi>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/bundle", get(bundle))
        .route(
            "/applications/{application}/services/{service}/logs",
            get(service_logs),
        )
        .route(
            "/applications/{application}/services/{service}/metrics",
            get(service_metrics),
        )
        .with_state(api)
}

async fn health() -> &'static str {
    "ok"
}

async fn info(State(api): State<Arc<DeviceApi>>) -> Response {
    Json(api.device_info()).into_response()
}

async fn bundle(State(api): State<Arc<DeviceApi>>) -> Response {
    match api.current_bundle() {
        Some(bundle) => Json(bundle).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "no bundle yet").into_response(),
    }
}

async fn service_logs(
    State(api): State<Arc<DeviceApi>>,
    Path((application, service)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let tail = params
        .get("tail")
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_LOG_TAIL);
    match api.service_logs(&application, &service, tail).await {
        Ok(logs) => logs.into_response(),
        Err(err) => error_response(&err),
    }
}

async fn service_metrics(
    State(api): State<Arc<DeviceApi>>,
    Path((application, service)): Path<(String, String)>,
) -> Response {
    match api.service_metrics(&application, &service).await {
        Ok(metrics) => Json(metrics).into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &ApiError) -> Response {
    let status = match err {
        ApiError::NoContainer { .. } => StatusCode::NOT_FOUND,
        ApiError::Engine(engine_err) if engine_err.is_not_found() => StatusCode::NOT_FOUND,
        ApiError::Engine(_) => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string()).into_response()
}
