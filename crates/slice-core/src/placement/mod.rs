//! Placement engine
//!
//! Maps a validated intent onto sites: hard filters on tier, latency and
//! capacity, a weighted score over the survivors, then a reservation of every
//! chosen site through the capacity ledger. A lost reservation race excludes
//! the exhausted site and retries with backoff.

mod scoring;

pub use scoring::{score_site, tier_policy, ScoringWeights, SiteScore, TierPolicy, TierRules};

use crate::backoff::Backoff;
use crate::error::{Result, SliceError};
use crate::ledger::{CapacityLedger, Reservation};
use crate::models::{
    FunctionRole, PlacementDecision, QoSIntent, Resources, Site, SiteAssignment, SiteId,
};
use crate::observability::{SliceMetrics, StructuredLogger};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

fn default_max_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementConfig {
    #[serde(default)]
    pub weights: ScoringWeights,
    #[serde(default)]
    pub rules: TierRules,
    /// Reservation attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            rules: TierRules::default(),
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
        }
    }
}

/// Per-call placement options
#[derive(Debug, Clone, Default)]
pub struct PlaceOptions {
    /// Sites never considered, e.g. the degraded sites during re-placement
    pub excluded_sites: BTreeSet<SiteId>,
    pub generation: u32,
}

impl PlaceOptions {
    pub fn excluding(sites: impl IntoIterator<Item = SiteId>, generation: u32) -> Self {
        Self {
            excluded_sites: sites.into_iter().collect(),
            generation,
        }
    }
}

/// A decision together with the reservations that back it
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub decision: PlacementDecision,
    pub reservations: Vec<Reservation>,
}

#[derive(Debug, Default)]
struct Rejections {
    excluded: usize,
    tier: usize,
    latency: usize,
    capacity: usize,
}

pub struct PlacementEngine {
    ledger: Arc<CapacityLedger>,
    config: PlacementConfig,
    metrics: SliceMetrics,
    logger: StructuredLogger,
}

impl PlacementEngine {
    pub fn new(ledger: Arc<CapacityLedger>, config: PlacementConfig) -> Self {
        Self {
            ledger,
            config,
            metrics: SliceMetrics::new(),
            logger: StructuredLogger::new("placement"),
        }
    }

    pub fn ledger(&self) -> &Arc<CapacityLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// Choose sites for an intent against the current ledger snapshot
    ///
    /// Pure with respect to the ledger: nothing is reserved.
    pub fn decide(&self, intent: &QoSIntent, options: &PlaceOptions) -> Result<PlacementDecision> {
        let sites = self.ledger.sites();
        let profile = intent.profile();
        let up_need = profile
            .user_plane_compute
            .with_bandwidth_mbps(intent.bandwidth_mbps);
        let cp_compute = profile.control_plane_compute;

        let user_plane = self.pick(&sites, intent, FunctionRole::UserPlane, options, |_| up_need)?;
        let control_plane = self.pick(&sites, intent, FunctionRole::ControlPlane, options, |site| {
            if site.id == user_plane.site_id {
                up_need + cp_compute
            } else {
                cp_compute.with_bandwidth_mbps(intent.bandwidth_mbps)
            }
        })?;

        let score = (user_plane.score + control_plane.score) / 2.0;
        Ok(PlacementDecision {
            intent_id: intent.id.clone(),
            sites: vec![user_plane, control_plane],
            score,
            created_at: Utc::now(),
            generation: options.generation,
        })
    }

    fn pick<F>(
        &self,
        sites: &[Site],
        intent: &QoSIntent,
        role: FunctionRole,
        options: &PlaceOptions,
        need: F,
    ) -> Result<SiteAssignment>
    where
        F: Fn(&Site) -> Resources,
    {
        let policy = tier_policy(intent, role, &self.config.rules);
        let mut rejections = Rejections::default();
        let mut best: Option<(f64, &Site)> = None;

        // sites are sorted by id, so keeping the first maximum breaks ties by lowest id
        for site in sites {
            if options.excluded_sites.contains(&site.id) {
                rejections.excluded += 1;
                continue;
            }
            if !policy.allows(site.tier) {
                rejections.tier += 1;
                continue;
            }
            if policy.latency_bound && site.latency_ms() > intent.latency_ms {
                rejections.latency += 1;
                continue;
            }
            if !need(site).fits_within(&site.available_capacity) {
                rejections.capacity += 1;
                continue;
            }
            let score = score_site(
                site,
                intent,
                &policy,
                &self.config.rules,
                &self.config.weights,
            );
            debug!(
                slice_id = %intent.id,
                role = %role,
                site = %site.id,
                latency_fit = score.latency_fit,
                cost_fit = score.cost_fit,
                reliability_fit = score.reliability_fit,
                total = score.total,
                "Scored candidate site"
            );
            match best {
                Some((top, _)) if score.total <= top => {}
                _ => best = Some((score.total, site)),
            }
        }

        match best {
            Some((score, site)) => Ok(SiteAssignment {
                site_id: site.id.clone(),
                role,
                tier: site.tier,
                score,
            }),
            None => Err(SliceError::ConstraintUnsatisfiable {
                intent_id: intent.id.clone(),
                reason: format!(
                    "no {} site among {}: {} excluded, {} wrong tier, {} over latency, {} without capacity",
                    role,
                    sites.len(),
                    rejections.excluded,
                    rejections.tier,
                    rejections.latency,
                    rejections.capacity
                ),
            }),
        }
    }

    /// Decide and reserve, retrying when another request wins a site first
    pub async fn place(
        &self,
        intent: &QoSIntent,
        options: &PlaceOptions,
        cancel: &CancellationToken,
    ) -> Result<Placement> {
        let start = Instant::now();
        let result = self.place_inner(intent, options, cancel).await;
        self.metrics
            .observe_placement_latency(start.elapsed().as_secs_f64());

        match &result {
            Ok(placement) => {
                let sites: Vec<String> = placement
                    .decision
                    .distinct_sites()
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                self.logger.log_placement(
                    &intent.id,
                    &sites,
                    placement.decision.score,
                    placement.decision.generation,
                );
            }
            Err(e) => {
                self.metrics.inc_placement_failure(e.code());
                self.logger.log_placement_rejected(&intent.id, &e.to_string());
            }
        }
        result
    }

    async fn place_inner(
        &self,
        intent: &QoSIntent,
        options: &PlaceOptions,
        cancel: &CancellationToken,
    ) -> Result<Placement> {
        intent.validate()?;
        let mut attempt_options = options.clone();
        let attempts = self.config.max_attempts.max(1);

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(SliceError::Cancelled);
            }
            let decision = self.decide(intent, &attempt_options)?;
            match self.reserve_decision(&decision, intent) {
                Ok(reservations) => {
                    return Ok(Placement {
                        decision,
                        reservations,
                    })
                }
                Err(SliceError::CapacityExhausted { site_id }) => {
                    debug!(
                        slice_id = %intent.id,
                        site = %site_id,
                        attempt = attempt + 1,
                        "Lost reservation race, retrying without site"
                    );
                    attempt_options.excluded_sites.insert(site_id);
                    if attempt + 1 < attempts {
                        self.config.backoff.wait(attempt, cancel).await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(SliceError::ConstraintUnsatisfiable {
            intent_id: intent.id.clone(),
            reason: format!("capacity lost to concurrent requests after {} attempts", attempts),
        })
    }

    /// Reserve every site of a decision, all or nothing
    fn reserve_decision(
        &self,
        decision: &PlacementDecision,
        intent: &QoSIntent,
    ) -> Result<Vec<Reservation>> {
        let mut held: Vec<Reservation> = Vec::new();
        for (site_id, resources) in site_requirements(decision, intent) {
            match self.ledger.reserve(&site_id, resources) {
                Ok(id) => held.push(Reservation {
                    id,
                    site_id,
                    resources,
                }),
                Err(e) => {
                    self.ledger.release_all(held.iter().map(|r| &r.id));
                    return Err(e);
                }
            }
        }
        Ok(held)
    }
}

/// Resources each distinct site of a decision must hold
///
/// Bandwidth is reserved once per site; compute sums over the roles it hosts.
pub fn site_requirements(decision: &PlacementDecision, intent: &QoSIntent) -> Vec<(SiteId, Resources)> {
    let profile = intent.profile();
    decision
        .distinct_sites()
        .into_iter()
        .map(|site_id| {
            let compute = decision
                .sites
                .iter()
                .filter(|a| a.site_id == site_id)
                .fold(Resources::default(), |acc, a| {
                    acc + match a.role {
                        FunctionRole::UserPlane => profile.user_plane_compute,
                        FunctionRole::ControlPlane => profile.control_plane_compute,
                    }
                });
            (
                site_id.to_string(),
                compute.with_bandwidth_mbps(intent.bandwidth_mbps),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeEndpoint, SliceType, Tier};
    use std::time::Duration;

    fn site(id: &str, tier: Tier, bandwidth_mbps: f64) -> Site {
        Site::new(
            id,
            tier,
            NodeEndpoint {
                name: format!("{}-node", id),
                address: "10.0.0.1".parse().unwrap(),
                interface: "eth0".into(),
                agent_url: None,
            },
            Resources::compute(16_000, 65_536).with_bandwidth_mbps(bandwidth_mbps),
        )
    }

    fn engine(sites: Vec<Site>) -> PlacementEngine {
        let ledger = Arc::new(CapacityLedger::with_sites(sites).unwrap());
        let config = PlacementConfig {
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(4)),
            ..PlacementConfig::default()
        };
        PlacementEngine::new(ledger, config)
    }

    fn topology() -> Vec<Site> {
        vec![
            site("edge-1", Tier::Edge, 50.0),
            site("regional-1", Tier::Regional, 1000.0),
            site("central-1", Tier::Central, 5000.0),
        ]
    }

    #[tokio::test]
    async fn test_urllc_lands_on_edge() {
        let engine = engine(topology());
        let intent = QoSIntent::new("urllc-1", SliceType::Urllc, 0.93, 6.3);
        let placement = engine
            .place(&intent, &PlaceOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        let up = placement.decision.site_for(FunctionRole::UserPlane).unwrap();
        assert_eq!(up.site_id, "edge-1");
        assert_eq!(up.tier, Tier::Edge);
        let cp = placement.decision.site_for(FunctionRole::ControlPlane).unwrap();
        assert_eq!(cp.site_id, "central-1");
        assert_eq!(placement.reservations.len(), 2);
        assert_eq!(engine.ledger().peek("edge-1").unwrap().bandwidth_kbps, 49_070);
    }

    #[tokio::test]
    async fn test_high_bandwidth_embb_goes_regional_when_edge_is_short() {
        let engine = engine(topology());
        let intent = QoSIntent::new("embb-1", SliceType::Embb, 100.0, 50.0);
        let placement = engine
            .place(&intent, &PlaceOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        let up = placement.decision.site_for(FunctionRole::UserPlane).unwrap();
        assert_eq!(up.site_id, "regional-1");
    }

    #[tokio::test]
    async fn test_oversized_request_is_unsatisfiable() {
        let engine = engine(topology());
        let intent = QoSIntent::new("huge", SliceType::Embb, 10_000.0, 100.0);
        let before: Vec<_> = engine.ledger().sites();
        let result = engine
            .place(&intent, &PlaceOptions::default(), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(SliceError::ConstraintUnsatisfiable { .. })
        ));
        assert_eq!(engine.ledger().sites(), before);
        assert_eq!(engine.ledger().reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_intent_reserves_nothing() {
        let engine = engine(topology());
        let intent = QoSIntent::new("bad", SliceType::Embb, 0.0, 50.0);
        let result = engine
            .place(&intent, &PlaceOptions::default(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SliceError::InvalidIntent(_))));
        assert_eq!(engine.ledger().reservation_count(), 0);
    }

    #[test]
    fn test_decision_is_deterministic() {
        let engine = engine(vec![
            site("edge-b", Tier::Edge, 100.0),
            site("edge-a", Tier::Edge, 100.0),
            site("central-1", Tier::Central, 100.0),
        ]);
        let intent = QoSIntent::new("urllc-1", SliceType::Urllc, 0.93, 6.3);
        let first = engine.decide(&intent, &PlaceOptions::default()).unwrap();
        for _ in 0..10 {
            let again = engine.decide(&intent, &PlaceOptions::default()).unwrap();
            assert_eq!(again.sites, first.sites);
            assert_eq!(again.score, first.score);
        }
        // identical sites tie; lowest id wins
        assert_eq!(first.sites[0].site_id, "edge-a");
    }

    #[test]
    fn test_excluded_sites_are_skipped() {
        let engine = engine(vec![
            site("edge-a", Tier::Edge, 100.0),
            site("edge-b", Tier::Edge, 100.0),
            site("central-1", Tier::Central, 100.0),
        ]);
        let intent = QoSIntent::new("urllc-1", SliceType::Urllc, 0.93, 6.3);
        let options = PlaceOptions::excluding(["edge-a".to_string()], 2);
        let decision = engine.decide(&intent, &options).unwrap();
        assert_eq!(decision.sites[0].site_id, "edge-b");
        assert_eq!(decision.generation, 2);
    }

    #[test]
    fn test_colocated_roles_share_bandwidth() {
        let engine = engine(vec![site("central-1", Tier::Central, 100.0)]);
        let intent = QoSIntent::new("embb-1", SliceType::Embb, 10.0, 40.0);
        let decision = engine.decide(&intent, &PlaceOptions::default()).unwrap();
        assert_eq!(decision.distinct_sites(), vec!["central-1"]);

        let reqs = site_requirements(&decision, &intent);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].1.bandwidth_kbps, 10_000);
        assert_eq!(reqs[0].1.cpu_millicores, 3000);
    }

    #[tokio::test]
    async fn test_concurrent_placements_respect_capacity() {
        let engine = Arc::new(engine(vec![
            site("edge-1", Tier::Edge, 10.0),
            site("edge-2", Tier::Edge, 10.0),
            site("central-1", Tier::Central, 10_000.0),
        ]));
        let mut handles = Vec::new();
        for i in 0..24 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                let intent = QoSIntent::new(format!("s-{}", i), SliceType::Urllc, 2.0, 6.3);
                engine
                    .place(&intent, &PlaceOptions::default(), &CancellationToken::new())
                    .await
            }));
        }
        let mut placed = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => placed += 1,
                Err(SliceError::ConstraintUnsatisfiable { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(placed, 10);
        for id in ["edge-1", "edge-2"] {
            assert!(engine.ledger().reserved(id).unwrap().bandwidth_kbps <= 10_000);
        }
    }
}
