//! Controller HTTP API plus the health and metrics endpoints both roles serve

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use slice_core::{
    health::{ComponentStatus, HealthRegistry},
    Orchestrator, QoSIntent, SliceError, SliceResource,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Error body returned by every API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// [`SliceError`] rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub SliceError);

impl From<SliceError> for ApiError {
    fn from(err: SliceError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            SliceError::InvalidIntent(_) | SliceError::CommandRejected(_) => {
                StatusCode::BAD_REQUEST
            }
            SliceError::UnknownSite(_) | SliceError::UnknownSlice(_) => StatusCode::NOT_FOUND,
            SliceError::DuplicateSlice(_) | SliceError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            SliceError::ConstraintUnsatisfiable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SliceError::CapacityExhausted { .. }
            | SliceError::PoolExhausted { .. }
            | SliceError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            SliceError::ApplyFailed { .. } => StatusCode::BAD_GATEWAY,
            SliceError::ReconciliationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            SliceError::Configuration(_) | SliceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, code = self.0.code(), "Request failed");
        }
        let body = ErrorBody {
            error: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Shared controller state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub orchestrator: Arc<Orchestrator>,
    pub provision_timeout: Duration,
    /// Cancelled on shutdown; in-flight provisioning then compensates
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        orchestrator: Arc<Orchestrator>,
        provision_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            health_registry,
            orchestrator,
            provision_timeout,
            shutdown,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

async fn create_intent(
    State(state): State<Arc<AppState>>,
    Json(intent): Json<QoSIntent>,
) -> Result<(StatusCode, Json<SliceResource>), ApiError> {
    let resource = state
        .orchestrator
        .provision_within(intent, state.provision_timeout, &state.shutdown)
        .await?;
    Ok((StatusCode::CREATED, Json(resource)))
}

async fn list_slices(State(state): State<Arc<AppState>>) -> Json<Vec<SliceResource>> {
    Json(state.orchestrator.slices())
}

async fn get_slice(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SliceResource>, ApiError> {
    Ok(Json(state.orchestrator.slice(&id)?))
}

async fn rollback_slice(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<RollbackRequest>>,
) -> Result<Json<SliceResource>, ApiError> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "requested".to_string());
    state
        .orchestrator
        .rollback(&id, &reason, &state.shutdown)
        .await?;
    Ok(Json(state.orchestrator.slice(&id)?))
}

async fn list_sites(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.sites())
}

/// Health check response - returns 200 if healthy or degraded, 503 otherwise
async fn healthz(State(registry): State<HealthRegistry>) -> impl IntoResponse {
    let health = registry.health().await;
    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn readyz(State(registry): State<HealthRegistry>) -> impl IntoResponse {
    let readiness = registry.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// `/healthz`, `/readyz` and `/metrics`
pub fn ops_router(health_registry: HealthRegistry) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(health_registry)
}

/// Create the controller router
pub fn create_router(state: Arc<AppState>) -> Router {
    let ops = ops_router(state.health_registry.clone());
    Router::new()
        .route("/v1/intents", post(create_intent))
        .route("/v1/slices", get(list_slices))
        .route("/v1/slices/:id", get(get_slice))
        .route("/v1/slices/:id/rollback", post(rollback_slice))
        .route("/v1/sites", get(list_sites))
        .with_state(state)
        .merge(ops)
}

/// Serve `app` until `shutdown` is cancelled
pub async fn serve(port: u16, app: Router, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
