//! Transport QoS planner
//!
//! Turns a placement decision into per-site shaping policies and a tunnel per
//! site pair, and owns the tunnel registry and its VNI pool.

use super::vni::VniPool;
use super::TransportConfig;
use crate::error::{Result, SliceError};
use crate::ledger::CapacityLedger;
use crate::models::{
    BandwidthPolicy, FunctionRole, PlacementDecision, QoSIntent, Site, SiteId, Tunnel,
    TunnelState, Vni,
};
use crate::observability::{SliceMetrics, StructuredLogger};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Policies and tunnels realizing one slice's transport contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportPlan {
    pub slice_id: String,
    pub fingerprint: String,
    pub policies: Vec<BandwidthPolicy>,
    pub tunnels: Vec<Tunnel>,
}

impl TransportPlan {
    pub fn vnis(&self) -> Vec<Vni> {
        self.tunnels.iter().map(|t| t.vni).collect()
    }

    /// Nodes touched by this plan, sorted
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: BTreeSet<String> = self.policies.iter().map(|p| p.node.clone()).collect();
        for tunnel in &self.tunnels {
            nodes.insert(tunnel.endpoint_a.node.clone());
            nodes.insert(tunnel.endpoint_b.node.clone());
        }
        nodes.into_iter().collect()
    }
}

#[derive(Debug, Clone)]
struct TunnelRecord {
    tunnel: Tunnel,
    confirmed: BTreeSet<SiteId>,
}

pub struct TransportPlanner {
    ledger: Arc<CapacityLedger>,
    pool: VniPool,
    tunnels: DashMap<Vni, TunnelRecord>,
    plans: DashMap<String, TransportPlan>,
    config: TransportConfig,
    metrics: SliceMetrics,
    logger: StructuredLogger,
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    intent: &'a QoSIntent,
    sites: Vec<(&'a str, FunctionRole)>,
    mtu: u16,
}

impl TransportPlanner {
    pub fn new(ledger: Arc<CapacityLedger>, config: TransportConfig) -> Result<Self> {
        let pool = VniPool::new(config.vni_start, config.vni_end)?;
        Ok(Self {
            ledger,
            pool,
            tunnels: DashMap::new(),
            plans: DashMap::new(),
            config,
            metrics: SliceMetrics::new(),
            logger: StructuredLogger::new("planner"),
        })
    }

    pub fn pool(&self) -> &VniPool {
        &self.pool
    }

    /// Derive policies and tunnels for a decision
    ///
    /// Identical inputs return the cached plan. Live tunnels of the same slice
    /// between the same two sites are reused rather than reallocated.
    pub fn plan(&self, decision: &PlacementDecision, intent: &QoSIntent) -> Result<TransportPlan> {
        let fingerprint = self.fingerprint(decision, intent)?;
        if let Some(cached) = self.cached_plan(&intent.id, &fingerprint) {
            debug!(slice_id = %intent.id, fingerprint = %fingerprint, "Returning cached transport plan");
            return Ok(cached);
        }

        let sites = decision
            .distinct_sites()
            .into_iter()
            .map(|id| {
                self.ledger
                    .site(id)
                    .ok_or_else(|| SliceError::UnknownSite(id.to_string()))
            })
            .collect::<Result<Vec<Site>>>()?;

        let policies: Vec<BandwidthPolicy> =
            sites.iter().map(|site| derive_policy(site, intent)).collect();

        let mut tunnels = Vec::new();
        let mut taken: Vec<Vni> = Vec::new();
        for (a, b) in decision.site_pairs() {
            if let Some(existing) = self.live_tunnel(&intent.id, &a, &b) {
                tunnels.push(existing);
                continue;
            }
            let site_a = sites.iter().find(|s| s.id == a);
            let site_b = sites.iter().find(|s| s.id == b);
            let (Some(site_a), Some(site_b)) = (site_a, site_b) else {
                self.free_taken(&taken);
                return Err(SliceError::UnknownSite(format!("{}/{}", a, b)));
            };
            let vni = match self.pool.allocate() {
                Ok(vni) => vni,
                Err(e) => {
                    self.free_taken(&taken);
                    return Err(e);
                }
            };
            let tunnel = Tunnel {
                vni,
                slice_id: intent.id.clone(),
                endpoint_a: site_a.tunnel_endpoint(),
                endpoint_b: site_b.tunnel_endpoint(),
                mtu: self.config.mtu,
                state: TunnelState::Requested,
            };
            self.tunnels.insert(
                vni,
                TunnelRecord {
                    tunnel: tunnel.clone(),
                    confirmed: BTreeSet::new(),
                },
            );
            self.metrics
                .set_tunnel_state(vni, TunnelState::Requested.gauge_value());
            taken.push(vni);
            tunnels.push(tunnel);
        }
        self.metrics.set_vnis_allocated(self.pool.allocated() as i64);

        let plan = TransportPlan {
            slice_id: intent.id.clone(),
            fingerprint,
            policies,
            tunnels,
        };
        self.plans.insert(intent.id.clone(), plan.clone());
        debug!(
            slice_id = %intent.id,
            policies = plan.policies.len(),
            tunnels = plan.tunnels.len(),
            new_vnis = taken.len(),
            "Planned transport"
        );
        Ok(plan)
    }

    fn free_taken(&self, taken: &[Vni]) {
        for vni in taken {
            self.tunnels.remove(vni);
            self.pool.free(*vni);
        }
        self.metrics.set_vnis_allocated(self.pool.allocated() as i64);
    }

    fn fingerprint(&self, decision: &PlacementDecision, intent: &QoSIntent) -> Result<String> {
        let input = FingerprintInput {
            intent,
            sites: decision
                .sites
                .iter()
                .map(|a| (a.site_id.as_str(), a.role))
                .collect(),
            mtu: self.config.mtu,
        };
        let bytes = serde_json::to_vec(&input)
            .map_err(|e| SliceError::InvalidIntent(format!("unserializable intent: {}", e)))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Cached plan with tunnel states refreshed, if all its tunnels are still live
    fn cached_plan(&self, slice_id: &str, fingerprint: &str) -> Option<TransportPlan> {
        let mut plan = self
            .plans
            .get(slice_id)
            .filter(|p| p.fingerprint == fingerprint)
            .map(|p| p.clone())?;
        for tunnel in plan.tunnels.iter_mut() {
            let record = self.tunnels.get(&tunnel.vni)?;
            if record.tunnel.slice_id != slice_id || !is_live(record.tunnel.state) {
                return None;
            }
            tunnel.state = record.tunnel.state;
        }
        Some(plan)
    }

    fn live_tunnel(&self, slice_id: &str, a: &str, b: &str) -> Option<Tunnel> {
        let mut matches: Vec<Tunnel> = self
            .tunnels
            .iter()
            .filter(|r| {
                r.tunnel.slice_id == slice_id && is_live(r.tunnel.state) && r.tunnel.connects(a, b)
            })
            .map(|r| r.tunnel.clone())
            .collect();
        matches.sort_by_key(|t| t.vni);
        matches.into_iter().next()
    }

    /// Current plan of a slice
    pub fn plan_for(&self, slice_id: &str) -> Option<TransportPlan> {
        let mut plan = self.plans.get(slice_id).map(|p| p.clone())?;
        for tunnel in plan.tunnels.iter_mut() {
            if let Some(record) = self.tunnels.get(&tunnel.vni) {
                tunnel.state = record.tunnel.state;
            } else {
                tunnel.state = TunnelState::Released;
            }
        }
        Some(plan)
    }

    /// Forget the cached plan of a slice
    pub fn forget_plan(&self, slice_id: &str) {
        self.plans.remove(slice_id);
    }

    pub fn tunnel(&self, vni: Vni) -> Option<Tunnel> {
        self.tunnels.get(&vni).map(|r| r.tunnel.clone())
    }

    /// All registered tunnels of a slice, sorted by VNI
    pub fn tunnels_for(&self, slice_id: &str) -> Vec<Tunnel> {
        let mut tunnels: Vec<Tunnel> = self
            .tunnels
            .iter()
            .filter(|r| r.tunnel.slice_id == slice_id)
            .map(|r| r.tunnel.clone())
            .collect();
        tunnels.sort_by_key(|t| t.vni);
        tunnels
    }

    pub fn mark_up(&self, vni: Vni) -> Result<()> {
        let mut record = self
            .tunnels
            .get_mut(&vni)
            .ok_or_else(|| SliceError::UnknownSlice(format!("tunnel {}", vni)))?;
        match record.tunnel.state {
            TunnelState::Requested | TunnelState::Up => {
                record.tunnel.state = TunnelState::Up;
            }
            other => {
                return Err(SliceError::InvalidTransition {
                    from: other.to_string(),
                    event: "tunnel_up".to_string(),
                })
            }
        }
        let slice_id = record.tunnel.slice_id.clone();
        drop(record);
        self.metrics.set_tunnel_state(vni, TunnelState::Up.gauge_value());
        self.logger.log_tunnel(vni, &slice_id, "up");
        Ok(())
    }

    /// Start teardown; a tunnel already tearing down or gone is left alone
    pub fn begin_teardown(&self, vni: Vni) -> Result<()> {
        let Some(mut record) = self.tunnels.get_mut(&vni) else {
            return Ok(());
        };
        if is_live(record.tunnel.state) {
            record.tunnel.state = TunnelState::TearingDown;
            let slice_id = record.tunnel.slice_id.clone();
            drop(record);
            self.metrics
                .set_tunnel_state(vni, TunnelState::TearingDown.gauge_value());
            self.logger.log_tunnel(vni, &slice_id, "tearing_down");
        }
        Ok(())
    }

    /// Record one endpoint's teardown; returns true once the VNI is back in the pool
    pub fn confirm_teardown(&self, vni: Vni, site_id: &str) -> Result<bool> {
        let released = {
            let Some(mut record) = self.tunnels.get_mut(&vni) else {
                return Ok(false);
            };
            if record.tunnel.state != TunnelState::TearingDown {
                return Err(SliceError::InvalidTransition {
                    from: record.tunnel.state.to_string(),
                    event: "teardown_confirmed".to_string(),
                });
            }
            if record.tunnel.endpoint_a.site_id != site_id
                && record.tunnel.endpoint_b.site_id != site_id
            {
                return Err(SliceError::UnknownSite(site_id.to_string()));
            }
            record.confirmed.insert(site_id.to_string());
            let both = record.confirmed.contains(&record.tunnel.endpoint_a.site_id)
                && record.confirmed.contains(&record.tunnel.endpoint_b.site_id);
            if both {
                record.tunnel.state = TunnelState::Released;
                Some(record.tunnel.slice_id.clone())
            } else {
                None
            }
        };

        let Some(slice_id) = released else {
            return Ok(false);
        };
        self.tunnels.remove(&vni);
        self.pool.free(vni);
        self.metrics
            .set_tunnel_state(vni, TunnelState::Released.gauge_value());
        self.metrics.set_vnis_allocated(self.pool.allocated() as i64);
        self.logger.log_tunnel(vni, &slice_id, "released");
        Ok(true)
    }
}

fn is_live(state: TunnelState) -> bool {
    matches!(state, TunnelState::Requested | TunnelState::Up)
}

/// Shaping contract of a slice at one site
pub fn derive_policy(site: &Site, intent: &QoSIntent) -> BandwidthPolicy {
    let profile = intent.profile();
    BandwidthPolicy {
        slice_id: intent.id.clone(),
        site_id: site.id.clone(),
        node: site.node.name.clone(),
        interface: site.node.interface.clone(),
        guaranteed_mbps: intent.bandwidth_mbps,
        burst_mbps: intent.bandwidth_mbps * profile.burst_factor,
        priority_class: priority_class(profile.priority_class, intent.priority),
        latency_ms: intent.latency_ms,
        jitter_ms: intent.effective_jitter_ms(),
        loss_rate: intent.effective_loss_rate(),
    }
}

/// HTB priority: the profile class shifted by one per three priority steps
pub fn priority_class(base: u8, priority: u8) -> u8 {
    let shift = (priority as i32 - 5) / 3;
    (base as i32 - shift).clamp(0, 7) as u8
}
