//! Node agent HTTP API, the server side of `RemoteAgent`

use crate::api::{ops_router, ApiError};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use slice_core::agent::{NodeAgent, TunnelStatus};
use slice_core::{
    health::HealthRegistry, BandwidthPolicy, Measurement, TransportAgent, Tunnel, Vni,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct NodeState {
    pub health_registry: HealthRegistry,
    pub agent: Arc<NodeAgent>,
}

impl NodeState {
    pub fn new(health_registry: HealthRegistry, agent: Arc<NodeAgent>) -> Self {
        Self {
            health_registry,
            agent,
        }
    }
}

async fn apply_policy(
    State(state): State<Arc<NodeState>>,
    Json(policy): Json<BandwidthPolicy>,
) -> Result<StatusCode, ApiError> {
    state.agent.apply(&policy).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_policy(
    State(state): State<Arc<NodeState>>,
    Path((slice_id, interface)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.agent.remove_policy(&slice_id, &interface).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_tunnel(
    State(state): State<Arc<NodeState>>,
    Json(tunnel): Json<Tunnel>,
) -> Result<StatusCode, ApiError> {
    state.agent.create_tunnel(&tunnel).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn teardown_tunnel(
    State(state): State<Arc<NodeState>>,
    Path(vni): Path<Vni>,
) -> Result<StatusCode, ApiError> {
    state.agent.teardown_tunnel(vni).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn tunnel_status(
    State(state): State<Arc<NodeState>>,
    Path(vni): Path<Vni>,
) -> Result<Response, ApiError> {
    Ok(match state.agent.tunnel_status(vni).await? {
        Some(tunnel_state) => Json(TunnelStatus {
            vni,
            state: tunnel_state,
        })
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    })
}

async fn measurements(
    State(state): State<Arc<NodeState>>,
) -> Result<Json<Vec<Measurement>>, ApiError> {
    Ok(Json(state.agent.measurements().await?))
}

/// Create the node router
pub fn create_router(state: Arc<NodeState>) -> Router {
    let ops = ops_router(state.health_registry.clone());
    Router::new()
        .route("/v1/node/policies", post(apply_policy))
        .route("/v1/node/policies/:slice_id/:interface", delete(remove_policy))
        .route("/v1/node/tunnels", post(create_tunnel))
        .route("/v1/node/tunnels/:vni", get(tunnel_status).delete(teardown_tunnel))
        .route("/v1/node/measurements", get(measurements))
        .with_state(state)
        .merge(ops)
}
