//! Health and readiness reporting for the slice daemon
//!
//! Components report their own status; the registry folds them into the
//! `/healthz` and `/readyz` responses.

use crate::agent::AgentRegistry;
use crate::transport::VniPool;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Pool usage above which new slices are likely to be refused
const POOL_PRESSURE_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still serving, with reduced capacity or reach
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status among the components
    pub fn compute_status(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .fold(ComponentStatus::Healthy, |worst, status| match (worst, status) {
                (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                    ComponentStatus::Unhealthy
                }
                (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const LEDGER: &str = "ledger";
    pub const PLACEMENT: &str = "placement";
    pub const PLANNER: &str = "planner";
    pub const AGENTS: &str = "agents";
    pub const MEASUREMENT: &str = "measurement";
}

#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("daemon not yet initialized".to_string()),
            };
        }
        let health = self.health().await;
        if let Some((name, _)) = health
            .components
            .iter()
            .find(|(_, c)| !c.status.is_operational())
        {
            return ReadinessResponse {
                ready: false,
                reason: Some(format!("component {} unhealthy", name)),
            };
        }
        ReadinessResponse {
            ready: true,
            reason: None,
        }
    }

    /// Query every agent once; degraded when some are unreachable
    pub async fn check_agents(&self, agents: &AgentRegistry) -> ComponentStatus {
        let all = agents.all();
        if all.is_empty() {
            self.set_unhealthy(components::AGENTS, "no transport agents registered")
                .await;
            return ComponentStatus::Unhealthy;
        }
        let mut failed = Vec::new();
        for agent in &all {
            if agent.measurements().await.is_err() {
                failed.push(agent.node().to_string());
            }
        }
        let health = if failed.is_empty() {
            ComponentHealth::healthy()
        } else if failed.len() == all.len() {
            ComponentHealth::unhealthy("no transport agent reachable")
        } else {
            ComponentHealth::degraded(format!("unreachable: {}", failed.join(", ")))
        };
        let status = health.status;
        self.update(components::AGENTS, health).await;
        status
    }

    /// Degraded once the pool nears exhaustion
    pub async fn check_vni_pool(&self, pool: &VniPool) -> ComponentStatus {
        let capacity = pool.capacity();
        let allocated = pool.allocated();
        let health = if capacity > 0 && allocated as f64 / capacity as f64 >= POOL_PRESSURE_RATIO {
            ComponentHealth::degraded(format!("{} of {} VNIs allocated", allocated, capacity))
        } else {
            ComponentHealth::healthy()
        };
        let status = health.status;
        self.update(components::PLANNER, health).await;
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{NodeAgent, NodeAgentConfig, RecordingRunner, RemoteAgent};
    use std::time::Duration;

    #[tokio::test]
    async fn test_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
        assert!(!registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_worst_component_wins() {
        let registry = HealthRegistry::new();
        registry.register(components::LEDGER).await;
        registry.register(components::PLACEMENT).await;

        registry.set_degraded(components::PLACEMENT, "slow").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry.set_unhealthy(components::LEDGER, "no sites").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_readiness_tracks_components() {
        let registry = HealthRegistry::new();
        registry.register(components::MEASUREMENT).await;
        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry.set_degraded(components::MEASUREMENT, "probe slow").await;
        assert!(registry.readiness().await.ready);

        registry.set_unhealthy(components::MEASUREMENT, "stopped").await;
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.unwrap().contains(components::MEASUREMENT));
    }

    #[tokio::test]
    async fn test_check_agents() {
        let registry = HealthRegistry::new();
        let agents = AgentRegistry::new();
        assert_eq!(registry.check_agents(&agents).await, ComponentStatus::Unhealthy);

        agents.register(Arc::new(NodeAgent::new(
            "node-a",
            Arc::new(RecordingRunner::default()),
            NodeAgentConfig::default(),
        )));
        assert_eq!(registry.check_agents(&agents).await, ComponentStatus::Healthy);

        // nothing listens on the discard port
        agents.register(Arc::new(
            RemoteAgent::new("node-b", "http://127.0.0.1:9", Duration::from_millis(200)).unwrap(),
        ));
        assert_eq!(registry.check_agents(&agents).await, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_check_vni_pool() {
        let registry = HealthRegistry::new();
        let pool = VniPool::new(100, 109).unwrap();
        assert_eq!(registry.check_vni_pool(&pool).await, ComponentStatus::Healthy);
        for _ in 0..9 {
            pool.allocate().unwrap();
        }
        assert_eq!(registry.check_vni_pool(&pool).await, ComponentStatus::Degraded);
    }
}
