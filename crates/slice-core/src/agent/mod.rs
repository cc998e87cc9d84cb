//! Transport agents
//!
//! A transport agent owns the shaping and tunnel state of one node. The
//! orchestrator talks to every node through [`TransportAgent`], either
//! in-process ([`NodeAgent`]) or over HTTP ([`RemoteAgent`]).

pub mod exec;
pub mod measure;
mod node;
mod remote;
pub mod shaper;
pub mod tunnel;

pub use exec::{
    AllowList, ArgPolicy, CommandOutput, CommandRunner, CommandSpec, RecordingRunner,
    SystemRunner,
};
pub use measure::{
    InterfaceProbe, MeasurementConfig, MeasurementLoop, MeasurementStore, MeasurementTarget,
    Probe, ProbeSample,
};
pub use node::{NodeAgent, NodeAgentConfig};
pub use remote::{RemoteAgent, TunnelStatus};

use crate::error::{Result, SliceError};
use crate::models::{BandwidthPolicy, Measurement, Tunnel, TunnelState, Vni};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Per-node enforcement of shaping policies and tunnels
///
/// Every operation is idempotent: re-applying converges on the same state and
/// removing something absent succeeds.
#[async_trait]
pub trait TransportAgent: Send + Sync {
    /// Name of the node this agent controls
    fn node(&self) -> &str;

    async fn apply(&self, policy: &BandwidthPolicy) -> Result<()>;

    async fn remove_policy(&self, slice_id: &str, interface: &str) -> Result<()>;

    async fn create_tunnel(&self, tunnel: &Tunnel) -> Result<()>;

    async fn teardown_tunnel(&self, vni: Vni) -> Result<()>;

    /// `None` when the node holds no such tunnel
    async fn tunnel_status(&self, vni: Vni) -> Result<Option<TunnelState>>;

    /// Latest published reading per slice on this node
    async fn measurements(&self) -> Result<Vec<Measurement>>;
}

/// Agents by node name
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<String, Arc<dyn TransportAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent: Arc<dyn TransportAgent>) {
        self.agents.insert(agent.node().to_string(), agent);
    }

    pub fn get(&self, node: &str) -> Result<Arc<dyn TransportAgent>> {
        self.agents
            .get(node)
            .map(|a| Arc::clone(a.value()))
            .ok_or_else(|| SliceError::ApplyFailed {
                node: node.to_string(),
                reason: "no transport agent registered".to_string(),
            })
    }

    /// All agents sorted by node name
    pub fn all(&self) -> Vec<Arc<dyn TransportAgent>> {
        let mut agents: Vec<_> = self.agents.iter().map(|a| Arc::clone(a.value())).collect();
        agents.sort_by(|a, b| a.node().cmp(b.node()));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
