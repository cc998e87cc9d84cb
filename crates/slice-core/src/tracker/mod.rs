//! Slice state tracker
//!
//! Owns the lifecycle of every accepted slice. State only changes through
//! [`SliceTracker::transition`] and [`SliceTracker::observe`]; each
//! configuration a slice goes through carries the compensations that undo it,
//! recorded before the action they compensate is attempted.

mod window;

pub use window::ViolationWindow;

use crate::error::{Result, SliceError};
use crate::ledger::{CapacityLedger, Reservation, ReservationId};
use crate::models::{BandwidthPolicy, Measurement, PlacementDecision, QoSIntent, Tunnel, Vni};
use crate::observability::{SliceMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Violations inside the window that degrade an active slice
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Further violations tolerated while degraded before rolling back
    #[serde(default)]
    pub degraded_grace_violations: usize,
    /// Re-place a degraded slice on other sites instead of counting down to rollback
    #[serde(default)]
    pub replace_on_degradation: bool,
    /// Throughput below this share of the intent bandwidth counts as a violation; 0 disables
    #[serde(default)]
    pub throughput_floor_ratio: f64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_violation_threshold() -> usize {
    3
}

fn default_window_secs() -> u64 {
    60
}

fn default_history_limit() -> usize {
    64
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            violation_threshold: default_violation_threshold(),
            window_secs: default_window_secs(),
            degraded_grace_violations: 0,
            replace_on_degradation: false,
            throughput_floor_ratio: 0.0,
            history_limit: default_history_limit(),
        }
    }
}

impl TrackerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Planned,
    Provisioning,
    Active,
    Degraded,
    RollingBack,
    Retired,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Planned => "planned",
            Lifecycle::Provisioning => "provisioning",
            Lifecycle::Active => "active",
            Lifecycle::Degraded => "degraded",
            Lifecycle::RollingBack => "rolling_back",
            Lifecycle::Retired => "retired",
        }
    }

    /// Slice holds transport resources that are serving traffic
    pub fn is_serving(self) -> bool {
        matches!(self, Lifecycle::Active | Lifecycle::Degraded)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that move a slice between lifecycle states
#[derive(Debug, Clone, PartialEq)]
pub enum SliceEvent {
    PlacementAccepted,
    ProvisioningComplete,
    ProvisioningFailed { reason: String },
    ViolationThresholdExceeded,
    SustainedDegradation,
    ReplacementStarted,
    RollbackRequested { reason: String },
    RevertedToActive,
    RollbackComplete,
}

impl SliceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SliceEvent::PlacementAccepted => "placement_accepted",
            SliceEvent::ProvisioningComplete => "provisioning_complete",
            SliceEvent::ProvisioningFailed { .. } => "provisioning_failed",
            SliceEvent::ViolationThresholdExceeded => "violation_threshold_exceeded",
            SliceEvent::SustainedDegradation => "sustained_degradation",
            SliceEvent::ReplacementStarted => "replacement_started",
            SliceEvent::RollbackRequested { .. } => "rollback_requested",
            SliceEvent::RevertedToActive => "reverted_to_active",
            SliceEvent::RollbackComplete => "rollback_complete",
        }
    }
}

fn next_state(from: Lifecycle, event: &SliceEvent) -> Option<Lifecycle> {
    use Lifecycle::*;
    match (from, event) {
        (Planned, SliceEvent::PlacementAccepted) => Some(Provisioning),
        (Provisioning, SliceEvent::ProvisioningComplete) => Some(Active),
        (Provisioning, SliceEvent::ProvisioningFailed { .. }) => Some(RollingBack),
        (Provisioning | Active | Degraded, SliceEvent::RollbackRequested { .. }) => {
            Some(RollingBack)
        }
        (Active, SliceEvent::ViolationThresholdExceeded) => Some(Degraded),
        (Degraded, SliceEvent::SustainedDegradation) => Some(RollingBack),
        (Degraded, SliceEvent::ReplacementStarted) => Some(Provisioning),
        (RollingBack, SliceEvent::RevertedToActive) => Some(Active),
        (RollingBack, SliceEvent::RollbackComplete) => Some(Retired),
        _ => None,
    }
}

/// Undo step for something a configuration acquired
#[derive(Debug, Clone, PartialEq)]
pub enum Compensation {
    ReleaseReservations(Vec<ReservationId>),
    TeardownTunnels(Vec<Tunnel>),
    RemovePolicies(Vec<BandwidthPolicy>),
}

impl Compensation {
    pub fn name(&self) -> &'static str {
        match self {
            Compensation::ReleaseReservations(_) => "release_reservations",
            Compensation::TeardownTunnels(_) => "teardown_tunnels",
            Compensation::RemovePolicies(_) => "remove_policies",
        }
    }

    /// Drop the parts also held by `keep`; None when nothing remains
    fn without_shared(self, keep: &Configuration) -> Option<Compensation> {
        let kept_vnis: BTreeSet<Vni> = keep.tunnels.iter().map(|t| t.vni).collect();
        let kept_policies: BTreeSet<(&str, &str)> = keep
            .policies
            .iter()
            .map(|p| (p.node.as_str(), p.interface.as_str()))
            .collect();
        let remaining = match self {
            Compensation::ReleaseReservations(ids) => Compensation::ReleaseReservations(
                ids.into_iter()
                    .filter(|id| !keep.reservations.contains(id))
                    .collect(),
            ),
            Compensation::TeardownTunnels(tunnels) => Compensation::TeardownTunnels(
                tunnels
                    .into_iter()
                    .filter(|t| !kept_vnis.contains(&t.vni))
                    .collect(),
            ),
            Compensation::RemovePolicies(policies) => Compensation::RemovePolicies(
                policies
                    .into_iter()
                    .filter(|p| !kept_policies.contains(&(p.node.as_str(), p.interface.as_str())))
                    .collect(),
            ),
        };
        (!remaining.is_empty()).then_some(remaining)
    }

    fn is_empty(&self) -> bool {
        match self {
            Compensation::ReleaseReservations(ids) => ids.is_empty(),
            Compensation::TeardownTunnels(tunnels) => tunnels.is_empty(),
            Compensation::RemovePolicies(policies) => policies.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Lifecycle,
    pub to: Lifecycle,
    pub event: String,
    pub at: DateTime<Utc>,
}

/// Resources of one placement generation
#[derive(Debug, Clone)]
struct Configuration {
    decision: PlacementDecision,
    reservations: Vec<ReservationId>,
    policies: Vec<BandwidthPolicy>,
    tunnels: Vec<Tunnel>,
    compensations: Vec<Compensation>,
}

impl Configuration {
    fn new(decision: PlacementDecision, reservations: &[Reservation]) -> Self {
        let ids: Vec<ReservationId> = reservations.iter().map(|r| r.id).collect();
        Self {
            decision,
            compensations: vec![Compensation::ReleaseReservations(ids.clone())],
            reservations: ids,
            policies: Vec::new(),
            tunnels: Vec::new(),
        }
    }
}

/// Lifecycle record of one slice
#[derive(Debug, Clone)]
pub struct SliceState {
    intent: QoSIntent,
    lifecycle: Lifecycle,
    current: Option<Configuration>,
    last_active: Option<Configuration>,
    last_measurement: Option<Measurement>,
    violations: ViolationWindow,
    degraded_violations: usize,
    history: Vec<TransitionRecord>,
}

impl SliceState {
    fn new(intent: QoSIntent, window: Duration) -> Self {
        Self {
            intent,
            lifecycle: Lifecycle::Planned,
            current: None,
            last_active: None,
            last_measurement: None,
            violations: ViolationWindow::new(window),
            degraded_violations: 0,
            history: Vec::new(),
        }
    }

    pub fn intent(&self) -> &QoSIntent {
        &self.intent
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn last_measurement(&self) -> Option<&Measurement> {
        self.last_measurement.as_ref()
    }

    pub fn violation_count(&self) -> usize {
        self.violations.len()
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn decision(&self) -> Option<&PlacementDecision> {
        self.current.as_ref().map(|c| &c.decision)
    }

    fn transition(
        &mut self,
        event: &SliceEvent,
        ledger: &CapacityLedger,
        history_limit: usize,
    ) -> Result<Lifecycle> {
        let from = self.lifecycle;
        let to = next_state(from, event).ok_or_else(|| SliceError::InvalidTransition {
            from: from.to_string(),
            event: event.name().to_string(),
        })?;

        match event {
            SliceEvent::ProvisioningComplete => {
                let held = self
                    .current
                    .as_ref()
                    .is_some_and(|c| c.reservations.iter().all(|id| ledger.is_held(*id)));
                if !held {
                    return Err(guard_failed(from, event));
                }
            }
            SliceEvent::RevertedToActive => {
                let held = self
                    .last_active
                    .as_ref()
                    .is_some_and(|c| c.reservations.iter().all(|id| ledger.is_held(*id)));
                if !held {
                    return Err(guard_failed(from, event));
                }
                self.current = self.last_active.take();
                self.violations.clear();
            }
            SliceEvent::RollbackComplete => {
                let pending = self
                    .current
                    .as_ref()
                    .is_some_and(|c| !c.compensations.is_empty());
                if pending || self.last_active.is_some() {
                    return Err(guard_failed(from, event));
                }
                self.current = None;
            }
            SliceEvent::ReplacementStarted => {
                self.last_active = self.current.take();
                self.violations.clear();
            }
            SliceEvent::ViolationThresholdExceeded => {
                self.degraded_violations = 0;
            }
            _ => {}
        }

        self.lifecycle = to;
        self.history.push(TransitionRecord {
            from,
            to,
            event: event.name().to_string(),
            at: Utc::now(),
        });
        if self.history.len() > history_limit {
            let excess = self.history.len() - history_limit;
            self.history.drain(..excess);
        }
        Ok(to)
    }
}

fn guard_failed(from: Lifecycle, event: &SliceEvent) -> SliceError {
    SliceError::InvalidTransition {
        from: from.to_string(),
        event: format!("{} (guard)", event.name()),
    }
}

/// Compensations a rollback must run, in execution order
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackPlan {
    pub intent_id: String,
    pub compensations: Vec<Compensation>,
    /// A previous active configuration is restored once the compensations ran
    pub revert: bool,
}

/// Declarative view of a slice for the packaging layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceResource {
    pub intent_id: String,
    pub lifecycle: Lifecycle,
    pub intent: QoSIntent,
    pub decision: Option<PlacementDecision>,
    pub policies: Vec<BandwidthPolicy>,
    pub tunnels: Vec<Tunnel>,
    pub last_measurement: Option<Measurement>,
    pub violation_count: usize,
    pub history: Vec<TransitionRecord>,
}

impl From<&SliceState> for SliceResource {
    fn from(state: &SliceState) -> Self {
        let current = state.current.as_ref();
        Self {
            intent_id: state.intent.id.clone(),
            lifecycle: state.lifecycle,
            intent: state.intent.clone(),
            decision: current.map(|c| c.decision.clone()),
            policies: current.map(|c| c.policies.clone()).unwrap_or_default(),
            tunnels: current.map(|c| c.tunnels.clone()).unwrap_or_default(),
            last_measurement: state.last_measurement.clone(),
            violation_count: state.violations.len(),
            history: state.history.clone(),
        }
    }
}

/// Contract breaches of one reading: (kind, observed, limit)
fn breaches(intent: &QoSIntent, m: &Measurement, floor_ratio: f64) -> Vec<(&'static str, f64, f64)> {
    let mut out = Vec::new();
    if m.latency_ms > intent.latency_ms {
        out.push(("latency", m.latency_ms, intent.latency_ms));
    }
    let loss_limit = intent.effective_loss_rate();
    if m.loss_rate > loss_limit {
        out.push(("loss", m.loss_rate, loss_limit));
    }
    if floor_ratio > 0.0 {
        let floor = intent.bandwidth_mbps * floor_ratio;
        if m.throughput_mbps < floor {
            out.push(("throughput", m.throughput_mbps, floor));
        }
    }
    out
}

pub struct SliceTracker {
    config: TrackerConfig,
    ledger: Arc<CapacityLedger>,
    slices: DashMap<String, SliceState>,
    logger: StructuredLogger,
    metrics: SliceMetrics,
}

impl SliceTracker {
    pub fn new(ledger: Arc<CapacityLedger>, config: TrackerConfig) -> Self {
        Self {
            config,
            ledger,
            slices: DashMap::new(),
            logger: StructuredLogger::new("tracker"),
            metrics: SliceMetrics::new(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Accept an intent in `Planned`; a retired slice with the same id is replaced
    pub fn register(&self, intent: QoSIntent) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.slices.entry(intent.id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().lifecycle != Lifecycle::Retired {
                    return Err(SliceError::DuplicateSlice(intent.id));
                }
                entry.insert(SliceState::new(intent, self.config.window()));
            }
            Entry::Vacant(entry) => {
                entry.insert(SliceState::new(intent, self.config.window()));
            }
        }
        Ok(())
    }

    /// Drop a registration that never got a placement
    pub fn discard(&self, intent_id: &str) -> Result<()> {
        let removed = self
            .slices
            .remove_if(intent_id, |_, s| s.lifecycle == Lifecycle::Planned);
        if removed.is_none() && self.slices.contains_key(intent_id) {
            return Err(SliceError::InvalidTransition {
                from: self.lifecycle(intent_id)?.to_string(),
                event: "discard".to_string(),
            });
        }
        Ok(())
    }

    pub fn transition(&self, intent_id: &str, event: SliceEvent) -> Result<Lifecycle> {
        let (from, to) = {
            let mut state = self.state_mut(intent_id)?;
            let from = state.lifecycle;
            let to = state.transition(&event, &self.ledger, self.config.history_limit)?;
            (from, to)
        };
        self.logger
            .log_transition(intent_id, from.as_str(), to.as_str(), event.name());
        if to == Lifecycle::Retired {
            self.metrics.forget_slice(intent_id);
        }
        self.refresh_active_gauge();
        Ok(to)
    }

    /// Start a new configuration for a slice in `Provisioning`
    pub fn begin_configuration(
        &self,
        intent_id: &str,
        decision: PlacementDecision,
        reservations: &[Reservation],
    ) -> Result<()> {
        let mut state = self.state_mut(intent_id)?;
        if state.lifecycle != Lifecycle::Provisioning || state.current.is_some() {
            return Err(SliceError::InvalidTransition {
                from: state.lifecycle.to_string(),
                event: "begin_configuration".to_string(),
            });
        }
        state.current = Some(Configuration::new(decision, reservations));
        Ok(())
    }

    /// Push an undo step onto the current configuration
    pub fn record_compensation(&self, intent_id: &str, compensation: Compensation) -> Result<()> {
        let mut state = self.state_mut(intent_id)?;
        let current = state
            .current
            .as_mut()
            .ok_or_else(|| no_configuration(intent_id))?;
        if !compensation.is_empty() {
            current.compensations.push(compensation);
        }
        Ok(())
    }

    /// Record the transport resources of the current configuration
    pub fn set_transport(
        &self,
        intent_id: &str,
        policies: Vec<BandwidthPolicy>,
        tunnels: Vec<Tunnel>,
    ) -> Result<()> {
        let mut state = self.state_mut(intent_id)?;
        let current = state
            .current
            .as_mut()
            .ok_or_else(|| no_configuration(intent_id))?;
        current.policies = policies;
        current.tunnels = tunnels;
        Ok(())
    }

    /// Take the compensations of the current configuration, newest first
    pub fn rollback_plan(&self, intent_id: &str) -> Result<RollbackPlan> {
        let mut state = self.state_mut(intent_id)?;
        if state.lifecycle != Lifecycle::RollingBack {
            return Err(SliceError::InvalidTransition {
                from: state.lifecycle.to_string(),
                event: "rollback_plan".to_string(),
            });
        }
        let revert = state.last_active.is_some();
        let taken = state
            .current
            .as_mut()
            .map(|c| std::mem::take(&mut c.compensations))
            .unwrap_or_default();
        let mut compensations: Vec<Compensation> = taken.into_iter().rev().collect();
        if let Some(keep) = &state.last_active {
            compensations = compensations
                .into_iter()
                .filter_map(|c| c.without_shared(keep))
                .collect();
        }
        Ok(RollbackPlan {
            intent_id: intent_id.to_string(),
            compensations,
            revert,
        })
    }

    /// Put back compensations a rollback could not run, given in execution order
    pub fn restore_compensations(&self, intent_id: &str, remaining: Vec<Compensation>) -> Result<()> {
        if remaining.is_empty() {
            return Ok(());
        }
        let mut state = self.state_mut(intent_id)?;
        let current = state
            .current
            .as_mut()
            .ok_or_else(|| no_configuration(intent_id))?;
        current.compensations.extend(remaining.into_iter().rev());
        Ok(())
    }

    /// Compensations releasing the configuration a successful re-placement superseded
    pub fn take_superseded(&self, intent_id: &str) -> Result<Vec<Compensation>> {
        let mut state = self.state_mut(intent_id)?;
        if !state.lifecycle.is_serving() {
            return Ok(Vec::new());
        }
        let Some(old) = state.last_active.take() else {
            return Ok(Vec::new());
        };
        let Some(current) = &state.current else {
            return Ok(Vec::new());
        };
        Ok(old
            .compensations
            .into_iter()
            .rev()
            .filter_map(|c| c.without_shared(current))
            .collect())
    }

    /// Feed a live reading; returns the new lifecycle when it caused a transition
    pub fn observe(&self, measurement: &Measurement) -> Result<Option<Lifecycle>> {
        let (from, events) = {
            let mut state = self.state_mut(&measurement.slice_id)?;
            state.last_measurement = Some(measurement.clone());
            self.metrics.record_measurement(
                &measurement.slice_id,
                measurement.latency_ms,
                measurement.throughput_mbps,
            );
            if !state.lifecycle.is_serving() {
                return Ok(None);
            }

            let found = breaches(&state.intent, measurement, self.config.throughput_floor_ratio);
            if found.is_empty() {
                return Ok(None);
            }
            let count = state.violations.record(measurement.observed_at);
            for (kind, observed, limit) in &found {
                self.metrics.inc_violation(&measurement.slice_id, kind);
                self.logger
                    .log_violation(&measurement.slice_id, kind, *observed, *limit, count);
            }

            let from = state.lifecycle;
            let mut events = Vec::new();
            match from {
                Lifecycle::Active if count >= self.config.violation_threshold => {
                    events.push(SliceEvent::ViolationThresholdExceeded);
                    if !self.config.replace_on_degradation
                        && self.config.degraded_grace_violations == 0
                    {
                        events.push(SliceEvent::SustainedDegradation);
                    }
                }
                Lifecycle::Degraded => {
                    state.degraded_violations += 1;
                    if !self.config.replace_on_degradation
                        && state.degraded_violations >= self.config.degraded_grace_violations
                    {
                        events.push(SliceEvent::SustainedDegradation);
                    }
                }
                _ => {}
            }
            (from, events)
        };

        if events.is_empty() {
            return Ok(None);
        }
        debug!(slice_id = %measurement.slice_id, from = %from, events = events.len(), "Violation window crossed");
        let mut to = from;
        for event in events {
            to = self.transition(&measurement.slice_id, event)?;
        }
        Ok(Some(to))
    }

    pub fn lifecycle(&self, intent_id: &str) -> Result<Lifecycle> {
        self.slices
            .get(intent_id)
            .map(|s| s.lifecycle)
            .ok_or_else(|| SliceError::UnknownSlice(intent_id.to_string()))
    }

    pub fn intent(&self, intent_id: &str) -> Result<QoSIntent> {
        self.slices
            .get(intent_id)
            .map(|s| s.intent.clone())
            .ok_or_else(|| SliceError::UnknownSlice(intent_id.to_string()))
    }

    /// Sites of the current configuration
    pub fn current_sites(&self, intent_id: &str) -> Result<Vec<String>> {
        let state = self
            .slices
            .get(intent_id)
            .ok_or_else(|| SliceError::UnknownSlice(intent_id.to_string()))?;
        Ok(state
            .decision()
            .map(|d| d.distinct_sites().into_iter().map(str::to_string).collect())
            .unwrap_or_default())
    }

    /// Generation of the newest configuration, current or superseded
    pub fn generation(&self, intent_id: &str) -> Result<u32> {
        let state = self
            .slices
            .get(intent_id)
            .ok_or_else(|| SliceError::UnknownSlice(intent_id.to_string()))?;
        Ok([state.current.as_ref(), state.last_active.as_ref()]
            .into_iter()
            .flatten()
            .map(|c| c.decision.generation)
            .max()
            .unwrap_or(0))
    }

    pub fn get(&self, intent_id: &str) -> Option<SliceResource> {
        self.slices.get(intent_id).map(|s| SliceResource::from(s.value()))
    }

    /// All slices sorted by id
    pub fn list(&self) -> Vec<SliceResource> {
        let mut out: Vec<SliceResource> = self
            .slices
            .iter()
            .map(|s| SliceResource::from(s.value()))
            .collect();
        out.sort_by(|a, b| a.intent_id.cmp(&b.intent_id));
        out
    }

    /// Ids of slices currently serving traffic
    pub fn serving(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .slices
            .iter()
            .filter(|s| s.lifecycle.is_serving())
            .map(|s| s.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    fn state_mut(
        &self,
        intent_id: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, SliceState>> {
        self.slices
            .get_mut(intent_id)
            .ok_or_else(|| SliceError::UnknownSlice(intent_id.to_string()))
    }

    fn refresh_active_gauge(&self) {
        let active = self
            .slices
            .iter()
            .filter(|s| s.lifecycle.is_serving())
            .count();
        self.metrics.set_slices_active(active as i64);
    }
}

fn no_configuration(intent_id: &str) -> SliceError {
    SliceError::InvalidTransition {
        from: "no_configuration".to_string(),
        event: format!("update {}", intent_id),
    }
}
