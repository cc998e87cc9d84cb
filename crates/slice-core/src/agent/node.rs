//! In-process transport agent driving `tc`, `ip` and `bridge`

use super::exec::{CommandRunner, CommandSpec};
use super::measure::{MeasurementStore, MeasurementTarget};
use super::shaper::{self, ShapingTree};
use super::tunnel;
use super::TransportAgent;
use crate::error::{Result, SliceError};
use crate::models::{BandwidthPolicy, Measurement, Tunnel, TunnelEndpoint, TunnelState, Vni};
use crate::observability::{SliceMetrics, StructuredLogger};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Configuration for a node agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAgentConfig {
    /// UDP port of the VXLAN overlay (default: 4789)
    #[serde(default = "default_vxlan_port")]
    pub vxlan_port: u16,
    /// Capacity the HTB root class is capped at
    #[serde(default = "default_link_capacity_mbps")]
    pub link_capacity_mbps: f64,
    /// Per-command timeout for the system runner
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_vxlan_port() -> u16 {
    4789
}

fn default_link_capacity_mbps() -> f64 {
    1000.0
}

fn default_command_timeout_ms() -> u64 {
    5000
}

impl Default for NodeAgentConfig {
    fn default() -> Self {
        Self {
            vxlan_port: default_vxlan_port(),
            link_capacity_mbps: default_link_capacity_mbps(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl NodeAgentConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Default)]
struct NodeState {
    trees: BTreeMap<String, ShapingTree>,
    tunnels: BTreeMap<Vni, Tunnel>,
}

/// Transport agent for the node it runs on
///
/// All mutations hold one async lock, so operations on a node are applied in
/// order while different nodes proceed in parallel.
pub struct NodeAgent {
    name: String,
    runner: Arc<dyn CommandRunner>,
    config: NodeAgentConfig,
    state: Mutex<NodeState>,
    store: Arc<MeasurementStore>,
    logger: StructuredLogger,
    metrics: SliceMetrics,
}

impl NodeAgent {
    pub fn new(name: impl Into<String>, runner: Arc<dyn CommandRunner>, config: NodeAgentConfig) -> Self {
        let name = name.into();
        Self {
            store: Arc::new(MeasurementStore::new(name.clone())),
            name,
            runner,
            config,
            state: Mutex::new(NodeState::default()),
            logger: StructuredLogger::new("node_agent"),
            metrics: SliceMetrics::new(),
        }
    }

    pub fn config(&self) -> &NodeAgentConfig {
        &self.config
    }

    /// Store the measurement loop of this node publishes into
    pub fn store(&self) -> Arc<MeasurementStore> {
        Arc::clone(&self.store)
    }

    /// Policies currently applied, by interface then slice
    pub async fn policies(&self) -> Vec<BandwidthPolicy> {
        let state = self.state.lock().await;
        state
            .trees
            .values()
            .flat_map(|t| t.policies().cloned())
            .collect()
    }

    pub async fn tunnels(&self) -> Vec<Tunnel> {
        self.state.lock().await.tunnels.values().cloned().collect()
    }

    async fn run_checked(&self, command: &CommandSpec) -> Result<()> {
        let output = self.runner.run(command).await?;
        if let Err(e) = output.check(&self.name, command) {
            self.metrics.inc_command_errors();
            return Err(e);
        }
        Ok(())
    }

    /// Run shaping commands in order; deleting what is already gone is not an error
    async fn run_shaping(&self, commands: &[CommandSpec]) -> Result<()> {
        for command in commands {
            let output = self.runner.run(command).await?;
            if !output.success()
                && shaper::is_deletion(command)
                && shaper::only_missing_objects(&output.stderr)
            {
                debug!(node = %self.name, command = %command, "Shaping objects already removed");
                continue;
            }
            if let Err(e) = output.check(&self.name, command) {
                self.metrics.inc_command_errors();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Render and apply one interface's tree, restoring `snapshot` on failure
    ///
    /// Objects the failed batch may have created stay recorded so the next
    /// render of the interface deletes them.
    async fn converge(&self, tree: &mut ShapingTree, snapshot: ShapingTree) -> Result<()> {
        let commands = tree.render(self.config.vxlan_port);
        if let Err(e) = self.run_shaping(&commands).await {
            warn!(node = %self.name, interface = %tree.interface(), error = %e, "Shaping update failed; keeping previous tree");
            let attempted = std::mem::replace(tree, snapshot);
            tree.absorb_failed(&attempted);
            return Err(e);
        }
        tree.commit();
        Ok(())
    }

    /// Remove a half-created link; the original failure is what gets reported
    async fn discard_link(&self, vni: Vni) {
        let command = tunnel::delete_command(vni);
        match self.runner.run(&command).await {
            Ok(out) if out.success() || tunnel::is_missing_device(&out.stderr) => {}
            Ok(out) => {
                warn!(node = %self.name, vni, stderr = %out.stderr.trim(), "Could not remove partial tunnel")
            }
            Err(e) => warn!(node = %self.name, vni, error = %e, "Could not remove partial tunnel"),
        }
    }

    async fn create_link(
        &self,
        tunnel: &Tunnel,
        local: &TunnelEndpoint,
        remote: &TunnelEndpoint,
    ) -> Result<()> {
        let commands =
            tunnel::create_commands(tunnel.vni, tunnel.mtu, local, remote, self.config.vxlan_port);
        let Some((add, rest)) = commands.split_first() else {
            return Ok(());
        };

        let output = self.runner.run(add).await?;
        if !output.success() && tunnel::is_existing_device(&output.stderr) {
            // leftover link from an earlier run; recreate it with our parameters
            debug!(node = %self.name, vni = tunnel.vni, "Replacing existing tunnel link");
            self.discard_link(tunnel.vni).await;
            self.run_checked(add).await?;
        } else if let Err(e) = output.check(&self.name, add) {
            self.metrics.inc_command_errors();
            return Err(e);
        }

        for command in rest {
            if let Err(e) = self.run_checked(command).await {
                self.discard_link(tunnel.vni).await;
                return Err(e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TransportAgent for NodeAgent {
    fn node(&self) -> &str {
        &self.name
    }

    async fn apply(&self, policy: &BandwidthPolicy) -> Result<()> {
        if policy.node != self.name {
            return Err(SliceError::ApplyFailed {
                node: self.name.clone(),
                reason: format!("policy addressed to node {}", policy.node),
            });
        }
        let mut state = self.state.lock().await;
        let link = self.config.link_capacity_mbps;
        let tree = state
            .trees
            .entry(policy.interface.clone())
            .or_insert_with(|| ShapingTree::new(policy.interface.clone(), link));

        let snapshot = tree.clone();
        tree.upsert_policy(policy.clone())?;
        self.converge(tree, snapshot).await?;

        self.logger.log_policy_applied(
            &policy.slice_id,
            &self.name,
            &policy.interface,
            tree.class_count(),
        );
        Ok(())
    }

    async fn remove_policy(&self, slice_id: &str, interface: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(tree) = state.trees.get_mut(interface) else {
            return Ok(());
        };
        if tree.policy(slice_id).is_none() {
            // an earlier failed apply may still have left objects behind
            if tree.has_pending_cleanup() {
                let snapshot = tree.clone();
                self.converge(tree, snapshot).await?;
                info!(node = %self.name, slice_id, interface, "Leftover shaping objects removed");
            }
            return Ok(());
        }
        let snapshot = tree.clone();
        tree.remove_policy(slice_id);
        self.converge(tree, snapshot).await?;
        info!(node = %self.name, slice_id, interface, "Policy removed");
        Ok(())
    }

    async fn create_tunnel(&self, tunnel: &Tunnel) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.tunnels.get(&tunnel.vni) {
            if existing.slice_id == tunnel.slice_id
                && existing.connects(&tunnel.endpoint_a.site_id, &tunnel.endpoint_b.site_id)
            {
                return Ok(());
            }
            return Err(SliceError::ApplyFailed {
                node: self.name.clone(),
                reason: format!("vni {} already carries slice {}", tunnel.vni, existing.slice_id),
            });
        }

        let (local, remote) = tunnel
            .sides_for(&self.name)
            .ok_or_else(|| SliceError::ApplyFailed {
                node: self.name.clone(),
                reason: format!("tunnel {} does not terminate here", tunnel.vni),
            })?;
        self.create_link(tunnel, local, remote).await?;
        let link = self.config.link_capacity_mbps;
        let tree = state
            .trees
            .entry(local.interface.clone())
            .or_insert_with(|| ShapingTree::new(local.interface.clone(), link));
        let snapshot = tree.clone();
        let classified = match tree.attach_tunnel(tunnel.vni, &tunnel.slice_id) {
            Ok(()) => self.converge(tree, snapshot).await,
            Err(e) => Err(e),
        };
        if let Err(e) = classified {
            self.discard_link(tunnel.vni).await;
            return Err(e);
        }

        let mut record = tunnel.clone();
        record.state = TunnelState::Requested;
        state.tunnels.insert(tunnel.vni, record);
        self.store.register(MeasurementTarget {
            slice_id: tunnel.slice_id.clone(),
            vni: tunnel.vni,
            interface: tunnel.interface_name(),
            peer: remote.address,
        });
        self.logger
            .log_tunnel(tunnel.vni, &tunnel.slice_id, "created");
        Ok(())
    }

    async fn teardown_tunnel(&self, vni: Vni) -> Result<()> {
        let mut state = self.state.lock().await;
        let known = state.tunnels.get(&vni).cloned();

        // a create interrupted mid-way may have classified the VNI without recording it
        for tree in state.trees.values_mut() {
            let snapshot = tree.clone();
            if tree.detach_tunnel(vni) {
                self.converge(tree, snapshot).await?;
            }
        }

        let command = tunnel::delete_command(vni);
        let output = self.runner.run(&command).await?;
        if !output.success() && !tunnel::is_missing_device(&output.stderr) {
            self.metrics.inc_command_errors();
            output.check(&self.name, &command)?;
        }

        state.tunnels.remove(&vni);
        self.store.unregister(vni);
        if let Some(tunnel) = known {
            self.logger.log_tunnel(vni, &tunnel.slice_id, "deleted");
        }
        Ok(())
    }

    async fn tunnel_status(&self, vni: Vni) -> Result<Option<TunnelState>> {
        let mut state = self.state.lock().await;
        let Some(record) = state.tunnels.get_mut(&vni) else {
            return Ok(None);
        };
        let command = tunnel::status_command(vni);
        let output = self.runner.run(&command).await?;
        let observed = if output.success() && tunnel::link_is_up(&output.stdout) {
            TunnelState::Up
        } else if output.success() || tunnel::is_missing_device(&output.stderr) {
            TunnelState::Requested
        } else {
            output.check(&self.name, &command)?;
            TunnelState::Requested
        };
        record.state = observed;
        Ok(Some(observed))
    }

    async fn measurements(&self) -> Result<Vec<Measurement>> {
        Ok(self.store.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::exec::{AllowList, RecordingRunner};

    fn agent() -> (NodeAgent, Arc<RecordingRunner>) {
        let runner = Arc::new(RecordingRunner::dry_run(Arc::new(AllowList::default())));
        let agent = NodeAgent::new("node-a", runner.clone(), NodeAgentConfig::default());
        (agent, runner)
    }

    fn policy(slice: &str, mbps: f64) -> BandwidthPolicy {
        BandwidthPolicy {
            slice_id: slice.into(),
            site_id: "edge-1".into(),
            node: "node-a".into(),
            interface: "eth0".into(),
            guaranteed_mbps: mbps,
            burst_mbps: mbps * 1.2,
            priority_class: 1,
            latency_ms: 6.3,
            jitter_ms: 1.0,
            loss_rate: 0.00001,
        }
    }

    fn endpoint(site: &str, node: &str, ip: &str) -> TunnelEndpoint {
        TunnelEndpoint {
            site_id: site.into(),
            node: node.into(),
            address: ip.parse().unwrap(),
            interface: "eth0".into(),
        }
    }

    fn tunnel(vni: Vni, slice: &str) -> Tunnel {
        Tunnel {
            vni,
            slice_id: slice.into(),
            endpoint_a: endpoint("edge-1", "node-a", "10.0.0.1"),
            endpoint_b: endpoint("central-1", "node-c", "10.0.0.3"),
            mtu: 1450,
            state: TunnelState::Requested,
        }
    }

    #[tokio::test]
    async fn test_apply_submits_one_batch() {
        let (agent, runner) = agent();
        agent.apply(&policy("urllc-1", 0.93)).await.unwrap();

        let commands = runner.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].to_string(), "tc -force -batch -");
        assert_eq!(agent.policies().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_apply_keeps_previous_tree() {
        let (agent, runner) = agent();
        agent.apply(&policy("a", 1.0)).await.unwrap();
        runner.fail_when("tc", "classid 1:11", 1, "RTNETLINK answers: Invalid argument");

        let err = agent.apply(&policy("b", 2.0)).await.unwrap_err();
        assert!(matches!(err, SliceError::ApplyFailed { .. }));
        let policies = agent.policies().await;
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].slice_id, "a");

        agent.apply(&policy("b", 2.0)).await.unwrap();
        assert_eq!(agent.policies().await.len(), 2);
    }

    #[tokio::test]
    async fn test_removing_failed_slice_cleans_partial_class() {
        let (agent, runner) = agent();
        agent.apply(&policy("a", 1.0)).await.unwrap();
        runner.fail_when("tc", "classid 1:11", 1, "RTNETLINK answers: Invalid argument");
        assert!(agent.apply(&policy("b", 2.0)).await.is_err());

        runner.clear();
        agent.remove_policy("b", "eth0").await.unwrap();
        let transcript = runner.transcript();
        assert!(
            transcript
                .iter()
                .any(|l| l.contains("class del dev eth0 classid 1:11")),
            "{:?}",
            transcript
        );
        let policies = agent.policies().await;
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].slice_id, "a");

        // nothing left to clean the second time
        runner.clear();
        agent.remove_policy("b", "eth0").await.unwrap();
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_deleting_vanished_objects_is_not_an_error() {
        let (agent, runner) = agent();
        agent.apply(&policy("a", 1.0)).await.unwrap();
        agent.apply(&policy("b", 2.0)).await.unwrap();
        runner.fail_when(
            "tc",
            "class del",
            1,
            "RTNETLINK answers: No such file or directory\nCommand failed -:2",
        );

        agent.remove_policy("b", "eth0").await.unwrap();
        assert_eq!(agent.policies().await.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_rejects_foreign_policy() {
        let (agent, runner) = agent();
        let mut p = policy("a", 1.0);
        p.node = "node-b".into();
        assert!(agent.apply(&p).await.is_err());
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_create_tunnel_is_idempotent() {
        let (agent, runner) = agent();
        agent.apply(&policy("s", 1.0)).await.unwrap();
        runner.clear();

        agent.create_tunnel(&tunnel(1000, "s")).await.unwrap();
        let transcript = runner.transcript();
        assert!(transcript[0].starts_with("ip link add vxlan1000 type vxlan id 1000 local 10.0.0.1"));
        assert!(transcript.iter().any(|l| l.contains("bridge fdb append 00:00:00:00:00:00 dev vxlan1000 dst 10.0.0.3")));
        assert!(transcript.iter().any(|l| l.contains("match u32 0x0003e800")));

        let count = runner.commands().len();
        agent.create_tunnel(&tunnel(1000, "s")).await.unwrap();
        assert_eq!(runner.commands().len(), count);
        assert_eq!(agent.store().targets().len(), 1);

        assert!(agent.create_tunnel(&tunnel(1000, "other")).await.is_err());
    }

    #[tokio::test]
    async fn test_existing_link_is_replaced() {
        let (agent, runner) = agent();
        runner.fail_when("ip", "link add", 1, "RTNETLINK answers: File exists");
        agent.create_tunnel(&tunnel(1000, "s")).await.unwrap();

        let transcript = runner.transcript();
        assert!(transcript[1].contains("ip link del dev vxlan1000"));
        assert!(transcript[2].starts_with("ip link add vxlan1000"));
    }

    #[tokio::test]
    async fn test_partial_tunnel_is_removed() {
        let (agent, runner) = agent();
        runner.fail_when("ip", "mtu", 1, "RTNETLINK answers: Invalid argument");

        assert!(agent.create_tunnel(&tunnel(1000, "s")).await.is_err());
        let transcript = runner.transcript();
        assert_eq!(transcript.last().unwrap(), "ip link del dev vxlan1000");
        assert_eq!(agent.tunnel_status(1000).await.unwrap(), None);
        assert!(agent.store().targets().is_empty());
    }

    #[tokio::test]
    async fn test_tunnel_must_terminate_on_node() {
        let (agent, runner) = agent();
        let mut t = tunnel(1000, "s");
        t.endpoint_a.node = "node-x".into();
        assert!(agent.create_tunnel(&t).await.is_err());
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_status_and_teardown() {
        let (agent, runner) = agent();
        agent.apply(&policy("s", 1.0)).await.unwrap();
        agent.create_tunnel(&tunnel(1000, "s")).await.unwrap();
        assert_eq!(agent.tunnel_status(1000).await.unwrap(), Some(TunnelState::Up));

        runner.clear();
        agent.teardown_tunnel(1000).await.unwrap();
        let transcript = runner.transcript();
        assert!(transcript.iter().any(|l| l.contains("filter del dev eth0 parent 1:")));
        assert_eq!(transcript.last().unwrap(), "ip link del dev vxlan1000");
        assert_eq!(agent.tunnel_status(1000).await.unwrap(), None);
        assert!(agent.tunnels().await.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_of_missing_link_succeeds() {
        let (agent, runner) = agent();
        runner.fail_when("ip", "link del", 1, "Cannot find device \"vxlan1000\"");
        agent.teardown_tunnel(1000).await.unwrap();

        runner.fail_when("ip", "link del", 1, "RTNETLINK answers: Operation not permitted");
        assert!(agent.teardown_tunnel(1000).await.is_err());
    }

    #[tokio::test]
    async fn test_remove_policy_is_idempotent() {
        let (agent, runner) = agent();
        agent.remove_policy("s", "eth0").await.unwrap();
        assert!(runner.commands().is_empty());

        agent.apply(&policy("s", 1.0)).await.unwrap();
        agent.remove_policy("s", "eth0").await.unwrap();
        assert_eq!(runner.commands().last().unwrap().to_string(), "tc qdisc del dev eth0 root");
        assert!(agent.policies().await.is_empty());
    }
}
