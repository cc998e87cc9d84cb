//! Slice orchestration
//!
//! Drives an intent through placement, transport planning, per-node apply
//! and tunnel reconciliation, and runs the tracker's compensations when an
//! attempt fails, is cancelled or a slice is rolled back.

use crate::agent::{AgentRegistry, TransportAgent};
use crate::backoff::Backoff;
use crate::error::{Result, SliceError};
use crate::ledger::{CapacityLedger, Reservation};
use crate::models::{BandwidthPolicy, Measurement, PlacementDecision, QoSIntent, Site, Tunnel, TunnelState, Vni};
use crate::observability::{SliceMetrics, StructuredLogger};
use crate::placement::{PlaceOptions, PlacementConfig, PlacementEngine};
use crate::tracker::{
    Compensation, Lifecycle, SliceEvent, SliceResource, SliceTracker, TrackerConfig,
};
use crate::transport::{TransportConfig, TransportPlan, TransportPlanner};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Attempts per node operation before the whole attempt is rolled back
    #[serde(default = "default_apply_attempts")]
    pub apply_attempts: u32,
    #[serde(default)]
    pub apply_backoff: Backoff,
    /// Bound on a single node operation
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
    /// Bound on waiting for every tunnel endpoint to report up
    #[serde(default = "default_reconcile_timeout_ms")]
    pub reconcile_timeout_ms: u64,
    #[serde(default = "default_reconcile_poll_ms")]
    pub reconcile_poll_ms: u64,
    /// Interval of the controller-side measurement poller
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Re-placements a slice may go through before further degradation retires it
    #[serde(default = "default_max_replacements")]
    pub max_replacements: u32,
}

fn default_apply_attempts() -> u32 {
    3
}

fn default_node_timeout_ms() -> u64 {
    10_000
}

fn default_reconcile_timeout_ms() -> u64 {
    15_000
}

fn default_reconcile_poll_ms() -> u64 {
    200
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_max_replacements() -> u32 {
    3
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            placement: PlacementConfig::default(),
            transport: TransportConfig::default(),
            tracker: TrackerConfig::default(),
            apply_attempts: default_apply_attempts(),
            apply_backoff: Backoff::default(),
            node_timeout_ms: default_node_timeout_ms(),
            reconcile_timeout_ms: default_reconcile_timeout_ms(),
            reconcile_poll_ms: default_reconcile_poll_ms(),
            poll_interval_secs: default_poll_interval_secs(),
            max_replacements: default_max_replacements(),
        }
    }
}

impl OrchestratorConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// One call against a node agent
#[derive(Debug, Clone)]
enum NodeOp {
    Apply(BandwidthPolicy),
    RemovePolicy { slice_id: String, interface: String },
    CreateTunnel(Tunnel),
    TeardownTunnel(Vni),
}

impl NodeOp {
    fn name(&self) -> &'static str {
        match self {
            NodeOp::Apply(_) => "apply_policy",
            NodeOp::RemovePolicy { .. } => "remove_policy",
            NodeOp::CreateTunnel(_) => "create_tunnel",
            NodeOp::TeardownTunnel(_) => "teardown_tunnel",
        }
    }

    async fn run(&self, agent: &dyn TransportAgent) -> Result<()> {
        match self {
            NodeOp::Apply(policy) => agent.apply(policy).await,
            NodeOp::RemovePolicy {
                slice_id,
                interface,
            } => agent.remove_policy(slice_id, interface).await,
            NodeOp::CreateTunnel(tunnel) => agent.create_tunnel(tunnel).await,
            NodeOp::TeardownTunnel(vni) => agent.teardown_tunnel(*vni).await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    attempts: u32,
    backoff: Backoff,
    timeout: Duration,
}

/// Run `op` with a per-attempt timeout, retrying transient failures with backoff
async fn with_retry<F, Fut>(
    node: &str,
    what: &str,
    retry: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let attempts = retry.attempts.max(1);
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(SliceError::Cancelled);
        }
        // an operation already running is allowed to finish; agents leave no half state
        let result = match tokio::time::timeout(retry.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(SliceError::ReconciliationTimeout {
                node: node.to_string(),
                timeout_ms: retry.timeout.as_millis() as u64,
            }),
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                warn!(node, operation = what, attempt = attempt + 1, error = %e, "Node operation failed, retrying");
                retry.backoff.wait(attempt, cancel).await?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Places, provisions, tracks and rolls back slices
pub struct Orchestrator {
    ledger: Arc<CapacityLedger>,
    placement: PlacementEngine,
    planner: TransportPlanner,
    agents: Arc<AgentRegistry>,
    tracker: SliceTracker,
    config: OrchestratorConfig,
    slice_locks: DashMap<String, Arc<Mutex<()>>>,
    inflight: DashMap<String, CancellationToken>,
    /// Re-placements started per slice since it was provisioned
    replacements: DashMap<String, u32>,
    logger: StructuredLogger,
    metrics: SliceMetrics,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<CapacityLedger>,
        agents: Arc<AgentRegistry>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let placement = PlacementEngine::new(Arc::clone(&ledger), config.placement.clone());
        let planner = TransportPlanner::new(Arc::clone(&ledger), config.transport.clone())?;
        let tracker = SliceTracker::new(Arc::clone(&ledger), config.tracker.clone());
        Ok(Self {
            ledger,
            placement,
            planner,
            agents,
            tracker,
            config,
            slice_locks: DashMap::new(),
            inflight: DashMap::new(),
            replacements: DashMap::new(),
            logger: StructuredLogger::new("orchestrator"),
            metrics: SliceMetrics::new(),
        })
    }

    pub fn ledger(&self) -> &Arc<CapacityLedger> {
        &self.ledger
    }

    pub fn planner(&self) -> &TransportPlanner {
        &self.planner
    }

    pub fn tracker(&self) -> &SliceTracker {
        &self.tracker
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn sites(&self) -> Vec<Site> {
        self.ledger.sites()
    }

    pub fn slice(&self, intent_id: &str) -> Result<SliceResource> {
        self.tracker
            .get(intent_id)
            .ok_or_else(|| SliceError::UnknownSlice(intent_id.to_string()))
    }

    pub fn slices(&self) -> Vec<SliceResource> {
        self.tracker.list()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.config.apply_attempts,
            backoff: self.config.apply_backoff,
            timeout: self.config.node_timeout(),
        }
    }

    fn slice_lock(&self, intent_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.slice_locks.entry(intent_id.to_string()).or_default().value())
    }

    /// Provision a slice, giving up and compensating once `timeout` elapses
    pub async fn provision_within(
        &self,
        intent: QoSIntent,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SliceResource> {
        let token = cancel.child_token();
        let expiry = token.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expiry.cancel();
        });
        let result = self.provision(intent, &token).await;
        timer.abort();
        result
    }

    /// Take an intent to `Active`
    ///
    /// Any failure or cancellation rolls back everything this attempt
    /// acquired before the error is returned.
    pub async fn provision(
        &self,
        intent: QoSIntent,
        cancel: &CancellationToken,
    ) -> Result<SliceResource> {
        let start = Instant::now();
        intent.validate()?;
        let id = intent.id.clone();
        self.tracker.register(intent.clone())?;

        let token = cancel.child_token();
        self.inflight.insert(id.clone(), token.clone());
        let lock = self.slice_lock(&id);
        let result = {
            let _guard = lock.lock().await;
            self.provision_locked(&intent, &token).await
        };
        self.inflight.remove(&id);

        match result {
            Ok(()) => {
                let resource = self.slice(&id)?;
                self.metrics
                    .observe_provision_latency(start.elapsed().as_secs_f64());
                self.logger.log_provisioned(
                    &id,
                    resource.tunnels.len(),
                    resource.policies.len(),
                    start.elapsed().as_millis(),
                );
                Ok(resource)
            }
            Err(e) => Err(e),
        }
    }

    async fn provision_locked(&self, intent: &QoSIntent, cancel: &CancellationToken) -> Result<()> {
        let id = intent.id.as_str();
        let placement = match self
            .placement
            .place(intent, &PlaceOptions::default(), cancel)
            .await
        {
            Ok(placement) => placement,
            Err(e) => {
                self.tracker.discard(id)?;
                return Err(e);
            }
        };

        let accepted = self
            .tracker
            .transition(id, SliceEvent::PlacementAccepted)
            .and_then(|_| {
                self.tracker
                    .begin_configuration(id, placement.decision.clone(), &placement.reservations)
            });
        if let Err(e) = accepted {
            self.abandon_placement(id, &placement.reservations, &e).await?;
            return Err(e);
        }

        if let Err(e) = self.realize(intent, &placement.decision, cancel).await {
            self.abort_attempt(id, &e).await?;
            return Err(e);
        }
        Ok(())
    }

    /// Give back a placement the tracker refused and settle the slice's record
    ///
    /// A slice still `Planned` is dropped; one already `Provisioning` is failed
    /// and rolled back so it ends `Retired` instead of stuck mid-attempt.
    async fn abandon_placement(
        &self,
        intent_id: &str,
        reservations: &[Reservation],
        cause: &SliceError,
    ) -> Result<()> {
        self.ledger.release_all(reservations.iter().map(|r| &r.id));
        match self.tracker.lifecycle(intent_id)? {
            Lifecycle::Planned => self.tracker.discard(intent_id),
            Lifecycle::Provisioning => self.abort_attempt(intent_id, cause).await.map(|_| ()),
            other => {
                warn!(slice_id = intent_id, lifecycle = %other, error = %cause, "Placement refused in unexpected state");
                Ok(())
            }
        }
    }

    /// Plan, apply and reconcile the current configuration, then mark it active
    async fn realize(
        &self,
        intent: &QoSIntent,
        decision: &PlacementDecision,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = intent.id.as_str();
        if cancel.is_cancelled() {
            return Err(SliceError::Cancelled);
        }
        let plan = self.planner.plan(decision, intent)?;
        self.tracker
            .record_compensation(id, Compensation::TeardownTunnels(plan.tunnels.clone()))?;
        self.tracker
            .record_compensation(id, Compensation::RemovePolicies(plan.policies.clone()))?;
        self.tracker
            .set_transport(id, plan.policies.clone(), plan.tunnels.clone())?;

        if cancel.is_cancelled() {
            return Err(SliceError::Cancelled);
        }
        self.apply_plan(&plan, cancel).await?;
        self.await_tunnels(&plan, cancel).await?;

        let mut tunnels = plan.tunnels.clone();
        for tunnel in tunnels.iter_mut() {
            self.planner.mark_up(tunnel.vni)?;
            tunnel.state = TunnelState::Up;
        }
        self.tracker.set_transport(id, plan.policies.clone(), tunnels)?;
        if cancel.is_cancelled() {
            return Err(SliceError::Cancelled);
        }
        self.tracker.transition(id, SliceEvent::ProvisioningComplete)?;
        Ok(())
    }

    async fn apply_plan(&self, plan: &TransportPlan, cancel: &CancellationToken) -> Result<()> {
        let mut ops: Vec<(String, NodeOp)> = plan
            .policies
            .iter()
            .map(|p| (p.node.clone(), NodeOp::Apply(p.clone())))
            .collect();
        for tunnel in &plan.tunnels {
            ops.push((tunnel.endpoint_a.node.clone(), NodeOp::CreateTunnel(tunnel.clone())));
            if tunnel.endpoint_b.node != tunnel.endpoint_a.node {
                ops.push((tunnel.endpoint_b.node.clone(), NodeOp::CreateTunnel(tunnel.clone())));
            }
        }
        first_error(self.run_on_nodes(ops, cancel).await)
    }

    /// Run operations sequentially per node and concurrently across nodes
    async fn run_on_nodes(
        &self,
        ops: Vec<(String, NodeOp)>,
        cancel: &CancellationToken,
    ) -> Vec<(String, Result<()>)> {
        let mut by_node: BTreeMap<String, Vec<NodeOp>> = BTreeMap::new();
        for (node, op) in ops {
            by_node.entry(node).or_default().push(op);
        }

        let mut results = Vec::new();
        let mut set = JoinSet::new();
        for (node, ops) in by_node {
            let agent = match self.agents.get(&node) {
                Ok(agent) => agent,
                Err(e) => {
                    results.push((node, Err(e)));
                    continue;
                }
            };
            let retry = self.retry_policy();
            let cancel = cancel.clone();
            set.spawn(async move {
                for op in &ops {
                    let outcome = with_retry(&node, op.name(), retry, &cancel, || {
                        op.run(agent.as_ref())
                    })
                    .await;
                    if let Err(e) = outcome {
                        return (node, Err(e));
                    }
                }
                (node, Ok(()))
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => results.push((
                    "unknown".to_string(),
                    Err(SliceError::ApplyFailed {
                        node: "unknown".to_string(),
                        reason: format!("node task failed: {}", e),
                    }),
                )),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Wait until both ends of every tunnel report it up
    async fn await_tunnels(&self, plan: &TransportPlan, cancel: &CancellationToken) -> Result<()> {
        let mut pending: BTreeSet<(String, Vni)> = BTreeSet::new();
        for tunnel in &plan.tunnels {
            pending.insert((tunnel.endpoint_a.node.clone(), tunnel.vni));
            pending.insert((tunnel.endpoint_b.node.clone(), tunnel.vni));
        }
        let deadline = tokio::time::Instant::now() + self.config.reconcile_timeout();
        let poll = Duration::from_millis(self.config.reconcile_poll_ms.max(1));

        while !pending.is_empty() {
            let mut confirmed = Vec::new();
            for (node, vni) in &pending {
                let agent = self.agents.get(node)?;
                match agent.tunnel_status(*vni).await {
                    Ok(Some(TunnelState::Up)) => confirmed.push((node.clone(), *vni)),
                    Ok(state) => debug!(node = %node, vni, state = ?state, "Tunnel not up yet"),
                    Err(e) => debug!(node = %node, vni, error = %e, "Tunnel status unavailable"),
                }
            }
            for key in confirmed {
                pending.remove(&key);
            }
            if pending.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let node = pending
                    .iter()
                    .next()
                    .map(|(n, _)| n.clone())
                    .unwrap_or_default();
                return Err(SliceError::ReconciliationTimeout {
                    node,
                    timeout_ms: self.config.reconcile_timeout_ms,
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(SliceError::Cancelled),
                _ = tokio::time::sleep(poll) => {}
            }
        }
        Ok(())
    }

    /// Move a failed provisioning attempt to rollback and compensate it fully
    async fn abort_attempt(&self, intent_id: &str, cause: &SliceError) -> Result<Lifecycle> {
        warn!(slice_id = intent_id, error = %cause, "Provisioning attempt failed");
        self.tracker.transition(
            intent_id,
            SliceEvent::ProvisioningFailed {
                reason: cause.to_string(),
            },
        )?;
        // compensation must finish even when the caller already gave up
        self.run_rollback(intent_id, cause.code(), &CancellationToken::new())
            .await
    }

    /// Roll a slice back on request
    ///
    /// A slice still provisioning has its attempt cancelled; the attempt then
    /// compensates itself.
    pub async fn rollback(
        &self,
        intent_id: &str,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<Lifecycle> {
        if let Some(token) = self.inflight.get(intent_id) {
            token.cancel();
        }
        let lock = self.slice_lock(intent_id);
        let _guard = lock.lock().await;

        match self.tracker.lifecycle(intent_id)? {
            Lifecycle::Retired => return Ok(Lifecycle::Retired),
            Lifecycle::RollingBack => {}
            _ => {
                self.tracker.transition(
                    intent_id,
                    SliceEvent::RollbackRequested {
                        reason: reason.to_string(),
                    },
                )?;
            }
        }
        self.run_rollback(intent_id, reason, cancel).await
    }

    /// Run the rollback plan of a slice in `RollingBack`
    async fn run_rollback(
        &self,
        intent_id: &str,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<Lifecycle> {
        let plan = self.tracker.rollback_plan(intent_id)?;
        let count = plan.compensations.len();
        let mut steps = plan.compensations.into_iter();
        while let Some(step) = steps.next() {
            if let Err(e) = self.compensate(intent_id, &step, cancel).await {
                let mut remaining = vec![step];
                remaining.extend(steps);
                self.tracker.restore_compensations(intent_id, remaining)?;
                self.logger
                    .log_rollback(intent_id, reason, count, "incomplete");
                return Err(e);
            }
        }

        self.planner.forget_plan(intent_id);
        let event = if plan.revert {
            SliceEvent::RevertedToActive
        } else {
            SliceEvent::RollbackComplete
        };
        let to = self.tracker.transition(intent_id, event)?;
        if to == Lifecycle::Retired {
            self.replacements.remove(intent_id);
        }
        self.metrics.inc_rollbacks();
        self.logger.log_rollback(intent_id, reason, count, to.as_str());
        Ok(to)
    }

    async fn compensate(
        &self,
        intent_id: &str,
        step: &Compensation,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!(slice_id = intent_id, step = step.name(), "Running compensation");
        match step {
            Compensation::ReleaseReservations(ids) => {
                self.ledger.release_all(ids.iter());
                Ok(())
            }
            Compensation::RemovePolicies(policies) => {
                let ops = policies
                    .iter()
                    .map(|p| {
                        (
                            p.node.clone(),
                            NodeOp::RemovePolicy {
                                slice_id: p.slice_id.clone(),
                                interface: p.interface.clone(),
                            },
                        )
                    })
                    .collect();
                first_error(self.run_on_nodes(ops, cancel).await)
            }
            Compensation::TeardownTunnels(tunnels) => {
                self.teardown_tunnels(tunnels, cancel).await
            }
        }
    }

    async fn teardown_tunnels(&self, tunnels: &[Tunnel], cancel: &CancellationToken) -> Result<()> {
        let mut ops = Vec::new();
        for tunnel in tunnels {
            self.planner.begin_teardown(tunnel.vni)?;
            ops.push((tunnel.endpoint_a.node.clone(), NodeOp::TeardownTunnel(tunnel.vni)));
            if tunnel.endpoint_b.node != tunnel.endpoint_a.node {
                ops.push((tunnel.endpoint_b.node.clone(), NodeOp::TeardownTunnel(tunnel.vni)));
            }
        }
        let results = self.run_on_nodes(ops, cancel).await;
        let done: BTreeSet<&str> = results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(node, _)| node.as_str())
            .collect();

        for tunnel in tunnels {
            for end in [&tunnel.endpoint_a, &tunnel.endpoint_b] {
                if done.contains(end.node.as_str()) {
                    self.planner.confirm_teardown(tunnel.vni, &end.site_id)?;
                }
            }
        }
        first_error(results)
    }

    /// Feed one reading to the tracker and act on the transition it causes
    pub async fn handle_measurement(
        &self,
        measurement: &Measurement,
        cancel: &CancellationToken,
    ) -> Result<Option<Lifecycle>> {
        let outcome = match self.tracker.observe(measurement) {
            Ok(outcome) => outcome,
            Err(SliceError::UnknownSlice(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let id = measurement.slice_id.as_str();
        match outcome {
            Some(Lifecycle::RollingBack) => {
                let lock = self.slice_lock(id);
                let _guard = lock.lock().await;
                if self.tracker.lifecycle(id)? != Lifecycle::RollingBack {
                    return Ok(Some(self.tracker.lifecycle(id)?));
                }
                self.run_rollback(id, "sustained_qos_violation", &CancellationToken::new())
                    .await
                    .map(Some)
            }
            Some(Lifecycle::Degraded) if self.config.tracker.replace_on_degradation => {
                if self.replacement_count(id) < self.config.max_replacements {
                    self.replace(id, cancel).await.map(Some)
                } else {
                    self.retire_degraded(id).await.map(Some)
                }
            }
            other => Ok(other),
        }
    }

    /// Re-placements started for a slice since it was provisioned
    pub fn replacement_count(&self, intent_id: &str) -> u32 {
        self.replacements.get(intent_id).map_or(0, |n| *n)
    }

    /// Roll back a degraded slice that has used up its re-placements
    async fn retire_degraded(&self, intent_id: &str) -> Result<Lifecycle> {
        let lock = self.slice_lock(intent_id);
        let _guard = lock.lock().await;
        if self.tracker.lifecycle(intent_id)? != Lifecycle::Degraded {
            return self.tracker.lifecycle(intent_id);
        }
        warn!(
            slice_id = intent_id,
            replacements = self.replacement_count(intent_id),
            "Re-placement limit reached; retiring slice"
        );
        self.tracker
            .transition(intent_id, SliceEvent::SustainedDegradation)?;
        self.run_rollback(intent_id, "replacement_limit_reached", &CancellationToken::new())
            .await
    }

    /// Make-before-break re-placement of a degraded slice away from its sites
    ///
    /// The new configuration is fully provisioned before the old one is torn
    /// down; if it cannot be, the slice reverts to the old configuration.
    pub async fn replace(&self, intent_id: &str, cancel: &CancellationToken) -> Result<Lifecycle> {
        let lock = self.slice_lock(intent_id);
        let _guard = lock.lock().await;
        if self.tracker.lifecycle(intent_id)? != Lifecycle::Degraded {
            return self.tracker.lifecycle(intent_id);
        }

        let intent = self.tracker.intent(intent_id)?;
        let excluded = self.tracker.current_sites(intent_id)?;
        let generation = self.tracker.generation(intent_id)? + 1;
        self.tracker
            .transition(intent_id, SliceEvent::ReplacementStarted)?;
        *self.replacements.entry(intent_id.to_string()).or_default() += 1;
        info!(slice_id = intent_id, excluded = ?excluded, generation, "Re-placing degraded slice");

        let options = PlaceOptions::excluding(excluded, generation);
        let placement = match self.placement.place(&intent, &options, cancel).await {
            Ok(placement) => placement,
            Err(e) => {
                self.abort_attempt(intent_id, &e).await?;
                return Err(e);
            }
        };
        if let Err(e) = self.tracker.begin_configuration(
            intent_id,
            placement.decision.clone(),
            &placement.reservations,
        ) {
            self.ledger
                .release_all(placement.reservations.iter().map(|r| &r.id));
            self.abort_attempt(intent_id, &e).await?;
            return Err(e);
        }
        if let Err(e) = self.realize(&intent, &placement.decision, cancel).await {
            self.abort_attempt(intent_id, &e).await?;
            return Err(e);
        }

        let superseded = self.tracker.take_superseded(intent_id)?;
        let fresh = CancellationToken::new();
        for step in &superseded {
            if let Err(e) = self.compensate(intent_id, step, &fresh).await {
                warn!(slice_id = intent_id, step = step.name(), error = %e, "Could not release superseded configuration");
            }
        }
        self.tracker.lifecycle(intent_id)
    }

    /// Apply readings from `rx` until cancelled
    pub async fn consume_measurements(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Measurement>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(measurement) = received else { break };
                    if let Err(e) = self.handle_measurement(&measurement, &cancel).await {
                        warn!(slice_id = %measurement.slice_id, error = %e, "Measurement handling failed");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!("Measurement consumer stopped");
    }
}

fn first_error(results: Vec<(String, Result<()>)>) -> Result<()> {
    results
        .into_iter()
        .map(|(_, r)| r)
        .find(|r| r.is_err())
        .unwrap_or(Ok(()))
}

/// Polls every agent's published readings and forwards new ones
pub struct MeasurementPoller {
    agents: Arc<AgentRegistry>,
    interval: Duration,
    tx: mpsc::Sender<Measurement>,
    seen: HashMap<(String, String), i64>,
}

impl MeasurementPoller {
    pub fn new(
        agents: Arc<AgentRegistry>,
        interval: Duration,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<Measurement>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                agents,
                interval,
                tx,
                seen: HashMap::new(),
            },
            rx,
        )
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Starting measurement poller");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let forwarded = self.poll_once().await;
                    debug!(forwarded, "Measurement poll complete");
                }
                _ = cancel.cancelled() => {
                    info!("Shutting down measurement poller");
                    break;
                }
            }
        }
    }

    /// Forward readings newer than the last one seen per (node, slice)
    ///
    /// Entries for slices no reachable agent reports any more are dropped.
    pub async fn poll_once(&mut self) -> usize {
        let mut forwarded = 0;
        let mut reported: HashSet<(String, String)> = HashSet::new();
        let mut unreachable: HashSet<String> = HashSet::new();
        for agent in self.agents.all() {
            let readings = match agent.measurements().await {
                Ok(readings) => readings,
                Err(e) => {
                    warn!(node = %agent.node(), error = %e, "Could not fetch measurements");
                    unreachable.insert(agent.node().to_string());
                    continue;
                }
            };
            for reading in readings {
                let key = (reading.node.clone(), reading.slice_id.clone());
                reported.insert(key.clone());
                if self
                    .seen
                    .get(&key)
                    .is_some_and(|last| *last >= reading.observed_at)
                {
                    continue;
                }
                self.seen.insert(key, reading.observed_at);
                if self.tx.send(reading).await.is_err() {
                    return forwarded;
                }
                forwarded += 1;
            }
        }
        self.seen
            .retain(|key, _| reported.contains(key) || unreachable.contains(&key.0));
        forwarded
    }

    /// (node, slice) pairs whose last reading is remembered
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }
}
