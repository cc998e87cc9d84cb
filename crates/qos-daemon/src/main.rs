//! Slice QoS daemon
//!
//! `role = "controller"` places slices and drives the node agents;
//! `role = "node"` enforces shaping and tunnels on its host and publishes
//! live measurements.

use anyhow::{Context, Result};
use qos_daemon::{
    api,
    config::{DaemonConfig, Role},
    node_api,
};
use slice_core::{
    agent::{InterfaceProbe, MeasurementLoop, NodeAgent},
    health::{components, ComponentStatus, HealthRegistry},
    CapacityLedger, MeasurementPoller, Orchestrator, StructuredLogger,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Timeout of one TCP connect used as a latency sample
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SLICED_CONFIG").ok())
        .map(PathBuf::from);
    let config = DaemonConfig::load(path.as_deref())?;
    info!(role = config.role.as_str(), node_name = %config.node_name, "Daemon configured");

    let logger = StructuredLogger::new(config.role.as_str());
    logger.log_startup(DAEMON_VERSION, config.role.as_str());

    let shutdown = CancellationToken::new();
    let health_registry = HealthRegistry::new();
    let app = match config.role {
        Role::Controller => start_controller(&config, &health_registry, &shutdown).await?,
        Role::Node => start_node(&config, &health_registry, &shutdown).await?,
    };
    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    shutdown.cancel();

    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }
    info!("Shutting down");
    Ok(())
}

async fn start_controller(
    config: &DaemonConfig,
    health_registry: &HealthRegistry,
    shutdown: &CancellationToken,
) -> Result<axum::Router> {
    for name in [
        components::LEDGER,
        components::PLACEMENT,
        components::PLANNER,
        components::AGENTS,
        components::MEASUREMENT,
    ] {
        health_registry.register(name).await;
    }

    let ledger = Arc::new(
        CapacityLedger::with_sites(config.sites.clone()).context("registering sites")?,
    );
    let agents = Arc::new(config.build_agents(config.command_runner())?);
    let orchestrator = Arc::new(
        Orchestrator::new(ledger, Arc::clone(&agents), config.orchestrator.clone())
            .context("building orchestrator")?,
    );
    info!(sites = config.sites.len(), agents = agents.len(), "Controller initialized");

    let (poller, rx) = MeasurementPoller::new(
        Arc::clone(&agents),
        config.orchestrator.poll_interval(),
        config.measurement.buffer_size,
    );
    tokio::spawn(poller.run(shutdown.clone()));
    tokio::spawn(Arc::clone(&orchestrator).consume_measurements(rx, shutdown.clone()));
    tokio::spawn(watch_controller_health(
        health_registry.clone(),
        Arc::clone(&orchestrator),
        config.health_interval(),
        shutdown.clone(),
    ));

    let state = Arc::new(api::AppState::new(
        health_registry.clone(),
        orchestrator,
        config.provision_timeout(),
        shutdown.clone(),
    ));
    Ok(api::create_router(state))
}

async fn start_node(
    config: &DaemonConfig,
    health_registry: &HealthRegistry,
    shutdown: &CancellationToken,
) -> Result<axum::Router> {
    health_registry.register(components::AGENTS).await;
    health_registry.register(components::MEASUREMENT).await;

    let agent = Arc::new(NodeAgent::new(
        config.node_name.clone(),
        config.command_runner(),
        config.node.clone(),
    ));
    let probe = InterfaceProbe::new(
        config.sysfs_root.clone(),
        config.latency_port,
        PROBE_CONNECT_TIMEOUT,
    );
    let measurement = MeasurementLoop::new(agent.store(), Arc::new(probe), config.measurement.clone());
    let registry = health_registry.clone();
    let token = shutdown.clone();
    tokio::spawn(async move {
        measurement.run(token.clone()).await;
        if !token.is_cancelled() {
            registry
                .set_unhealthy(components::MEASUREMENT, "measurement loop stopped")
                .await;
        }
    });

    let state = Arc::new(node_api::NodeState::new(health_registry.clone(), agent));
    Ok(node_api::create_router(state))
}

/// Refresh agent reachability and VNI pool pressure until shutdown
async fn watch_controller_health(
    registry: HealthRegistry,
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if registry.check_agents(orchestrator.agents()).await != ComponentStatus::Healthy {
                    warn!("Not every transport agent is reachable");
                }
                registry.check_vni_pool(orchestrator.planner().pool()).await;
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
