//! Integration tests for the controller and node API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use qos_daemon::{api, node_api};
use slice_core::{
    agent::{AllowList, NodeAgent, NodeAgentConfig, RecordingRunner},
    health::{components, HealthRegistry},
    AgentRegistry, Backoff, CapacityLedger, NodeEndpoint, Orchestrator, OrchestratorConfig,
    RemoteAgent, Resources, Site, Tier, TransportAgent, Tunnel, TunnelEndpoint, TunnelState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn site(id: &str, tier: Tier, node: &str, octet: u8) -> Site {
    Site::new(
        id,
        tier,
        NodeEndpoint {
            name: node.to_string(),
            address: format!("10.0.0.{}", octet).parse().unwrap(),
            interface: "eth0".into(),
            agent_url: None,
        },
        Resources::compute(16_000, 65_536).with_bandwidth_mbps(1_000.0),
    )
}

fn dry_run_agent(name: &str) -> Arc<NodeAgent> {
    Arc::new(NodeAgent::new(
        name,
        Arc::new(RecordingRunner::dry_run(Arc::new(AllowList::default()))),
        NodeAgentConfig::default(),
    ))
}

async fn setup_controller() -> (Router, Arc<api::AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::LEDGER).await;
    health_registry.register(components::AGENTS).await;

    let agents = Arc::new(AgentRegistry::new());
    agents.register(dry_run_agent("node-a"));
    agents.register(dry_run_agent("node-c"));
    let ledger = Arc::new(
        CapacityLedger::with_sites([
            site("edge-1", Tier::Edge, "node-a", 1),
            site("central-1", Tier::Central, "node-c", 3),
        ])
        .unwrap(),
    );
    let fast = Backoff::new(Duration::from_millis(1), Duration::from_millis(5));
    let mut config = OrchestratorConfig {
        apply_backoff: fast,
        reconcile_poll_ms: 5,
        ..OrchestratorConfig::default()
    };
    config.placement.backoff = fast;
    let orchestrator = Arc::new(Orchestrator::new(ledger, agents, config).unwrap());

    let state = Arc::new(api::AppState::new(
        health_registry,
        orchestrator,
        Duration::from_secs(10),
        CancellationToken::new(),
    ));
    (api::create_router(state.clone()), state)
}

fn setup_node() -> (Router, Arc<NodeAgent>) {
    let agent = dry_run_agent("node-a");
    let state = Arc::new(node_api::NodeState::new(HealthRegistry::new(), agent.clone()));
    (node_api::create_router(state), agent)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}

fn urllc_intent(id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "sliceType": "URLLC",
        "bandwidthMbps": 0.93,
        "latencyMs": 6.3
    })
}

fn tunnel(vni: u32) -> Tunnel {
    let end = |site: &str, node: &str, octet: u8| TunnelEndpoint {
        site_id: site.to_string(),
        node: node.to_string(),
        address: format!("10.0.0.{}", octet).parse().unwrap(),
        interface: "eth0".to_string(),
    };
    Tunnel {
        vni,
        slice_id: "s".to_string(),
        endpoint_a: end("edge-1", "node-a", 1),
        endpoint_b: end("central-1", "node-c", 3),
        mtu: 1450,
        state: TunnelState::Requested,
    }
}

#[tokio::test]
async fn test_healthz_and_readyz() {
    let (app, state) = setup_controller().await;

    let (status, health) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");

    state
        .health_registry
        .set_degraded(components::AGENTS, "unreachable: node-c")
        .await;
    let (status, health) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");

    let (status, readiness) = send(&app, get("/readyz")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    state.health_registry.set_ready(true).await;
    let (status, _) = send(&app, get("/readyz")).await;
    assert_eq!(status, StatusCode::OK);

    state
        .health_registry
        .set_unhealthy(components::LEDGER, "no sites")
        .await;
    let (status, health) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _state) = setup_controller().await;
    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));
}

#[tokio::test]
async fn test_create_intent_and_fetch_slice() {
    let (app, _state) = setup_controller().await;

    let (status, created) = send(&app, json_request("POST", "/v1/intents", urllc_intent("cam-1"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["lifecycle"], "active");
    assert_eq!(created["tunnels"].as_array().unwrap().len(), 1);
    assert_eq!(created["tunnels"][0]["state"], "up");

    let (status, fetched) = send(&app, get("/v1/slices/cam-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["intent_id"], "cam-1");

    let (_, listed) = send(&app, get("/v1/slices")).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, err) = send(&app, json_request("POST", "/v1/intents", urllc_intent("cam-1"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["error"], "duplicate_slice");
}

#[tokio::test]
async fn test_invalid_intent_is_rejected() {
    let (app, state) = setup_controller().await;
    let intent = serde_json::json!({
        "id": "bad",
        "sliceType": "eMBB",
        "bandwidthMbps": 25.0,
        "latencyMs": 0.1
    });

    let (status, err) = send(&app, json_request("POST", "/v1/intents", intent)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_intent");
    assert_eq!(state.orchestrator.ledger().reservation_count(), 0);
}

#[tokio::test]
async fn test_unknown_slice_is_404() {
    let (app, _state) = setup_controller().await;
    let (status, err) = send(&app, get("/v1/slices/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["error"], "unknown_slice");
}

#[tokio::test]
async fn test_rollback_retires_slice() {
    let (app, state) = setup_controller().await;
    send(&app, json_request("POST", "/v1/intents", urllc_intent("s1"))).await;

    let (status, resource) = send(
        &app,
        json_request("POST", "/v1/slices/s1/rollback", serde_json::json!({"reason": "operator"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resource["lifecycle"], "retired");
    assert_eq!(state.orchestrator.ledger().reservation_count(), 0);
    assert_eq!(state.orchestrator.planner().pool().allocated(), 0);
}

#[tokio::test]
async fn test_list_sites_reports_available_capacity() {
    let (app, _state) = setup_controller().await;
    send(&app, json_request("POST", "/v1/intents", urllc_intent("s1"))).await;

    let (status, sites) = send(&app, get("/v1/sites")).await;
    assert_eq!(status, StatusCode::OK);
    let sites = sites.as_array().unwrap();
    assert_eq!(sites.len(), 2);
    let edge = sites.iter().find(|s| s["id"] == "edge-1").unwrap();
    assert!(
        edge["available_capacity"]["bandwidth_kbps"].as_u64().unwrap()
            < edge["total_capacity"]["bandwidth_kbps"].as_u64().unwrap()
    );
}

#[tokio::test]
async fn test_node_tunnel_lifecycle() {
    let (app, agent) = setup_node();

    let (status, _) = send(&app, get("/v1/node/tunnels/1000")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let body = serde_json::to_value(tunnel(1000)).unwrap();
    let (status, _) = send(&app, json_request("POST", "/v1/node/tunnels", body)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(agent.tunnels().await.len(), 1);

    let (status, tunnel_status) = send(&app, get("/v1/node/tunnels/1000")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tunnel_status["state"], "up");

    let request = Request::builder()
        .method("DELETE")
        .uri("/v1/node/tunnels/1000")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(agent.tunnels().await.is_empty());
}

#[tokio::test]
async fn test_node_rejects_foreign_tunnel() {
    let (app, _agent) = setup_node();
    let mut foreign = tunnel(1001);
    foreign.endpoint_a.node = "node-x".to_string();

    let body = serde_json::to_value(foreign).unwrap();
    let (status, err) = send(&app, json_request("POST", "/v1/node/tunnels", body)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(err["error"], "apply_failed");
}

#[tokio::test]
async fn test_remote_agent_against_node_api() {
    let (app, agent) = setup_node();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let remote = RemoteAgent::new("node-a", &format!("http://{}", addr), Duration::from_secs(2))
        .unwrap();
    remote.create_tunnel(&tunnel(1002)).await.unwrap();
    assert_eq!(remote.tunnel_status(1002).await.unwrap(), Some(TunnelState::Up));
    assert!(remote.measurements().await.unwrap().is_empty());

    remote.remove_policy("s", "eth0").await.unwrap();
    remote.teardown_tunnel(1002).await.unwrap();
    assert_eq!(remote.tunnel_status(1002).await.unwrap(), None);
    assert!(agent.tunnels().await.is_empty());
}
