//! Tier rules and site scoring

use crate::models::{FunctionRole, QoSIntent, Site, SliceType, Tier};
use serde::{Deserialize, Serialize};

fn third() -> f64 {
    1.0 / 3.0
}

/// Relative weight of each fit term; normalized by their sum
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    #[serde(default = "third")]
    pub latency: f64,
    #[serde(default = "third")]
    pub cost: f64,
    #[serde(default = "third")]
    pub reliability: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            latency: third(),
            cost: third(),
            reliability: third(),
        }
    }
}

impl ScoringWeights {
    fn normalized(&self) -> (f64, f64, f64) {
        let l = self.latency.max(0.0);
        let c = self.cost.max(0.0);
        let r = self.reliability.max(0.0);
        let sum = l + c + r;
        if sum <= f64::EPSILON {
            return (third(), third(), third());
        }
        (l / sum, c / sum, r / sum)
    }
}

/// Thresholds that map an intent to a latency class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierRules {
    /// eMBB at or below this latency is treated like URLLC
    #[serde(default = "default_latency_sensitive_ms")]
    pub latency_sensitive_ms: f64,
    /// eMBB at or above this bandwidth favours regional sites
    #[serde(default = "default_high_bandwidth_mbps")]
    pub high_bandwidth_mbps: f64,
    /// Tier fit of the preferred tier
    #[serde(default = "default_preferred_fit")]
    pub preferred_fit: f64,
    /// Tier fit of any other allowed tier
    #[serde(default = "default_allowed_fit")]
    pub allowed_fit: f64,
    /// Share of latency-fit taken by tier fit; the rest is latency headroom
    #[serde(default = "default_tier_share")]
    pub tier_share: f64,
}

fn default_latency_sensitive_ms() -> f64 {
    20.0
}

fn default_high_bandwidth_mbps() -> f64 {
    50.0
}

fn default_preferred_fit() -> f64 {
    1.0
}

fn default_allowed_fit() -> f64 {
    0.4
}

fn default_tier_share() -> f64 {
    0.7
}

impl Default for TierRules {
    fn default() -> Self {
        Self {
            latency_sensitive_ms: default_latency_sensitive_ms(),
            high_bandwidth_mbps: default_high_bandwidth_mbps(),
            preferred_fit: default_preferred_fit(),
            allowed_fit: default_allowed_fit(),
            tier_share: default_tier_share(),
        }
    }
}

/// Tiers a role may use and the one it prefers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPolicy {
    pub allowed: Vec<Tier>,
    pub preferred: Tier,
    /// Ranked between the preferred tier and the rest
    pub secondary: Option<Tier>,
    /// Whether site latency must stay within the intent latency
    pub latency_bound: bool,
}

impl TierPolicy {
    pub fn allows(&self, tier: Tier) -> bool {
        self.allowed.contains(&tier)
    }
}

/// Derive the tier policy for one function of an intent
pub fn tier_policy(intent: &QoSIntent, role: FunctionRole, rules: &TierRules) -> TierPolicy {
    if role == FunctionRole::ControlPlane {
        return TierPolicy {
            allowed: vec![Tier::Central, Tier::Regional, Tier::Edge],
            preferred: Tier::Central,
            secondary: Some(Tier::Regional),
            latency_bound: false,
        };
    }

    let latency_sensitive = match intent.slice_type {
        SliceType::Urllc => true,
        SliceType::Embb => intent.latency_ms <= rules.latency_sensitive_ms,
        SliceType::Mmtc => false,
    };

    if latency_sensitive {
        return TierPolicy {
            allowed: vec![Tier::Edge, Tier::Regional],
            preferred: Tier::Edge,
            secondary: None,
            latency_bound: true,
        };
    }

    let preferred = match intent.slice_type {
        SliceType::Embb if intent.bandwidth_mbps >= rules.high_bandwidth_mbps => Tier::Regional,
        SliceType::Mmtc => Tier::Edge,
        _ => Tier::Central,
    };
    TierPolicy {
        allowed: Tier::ALL.to_vec(),
        preferred,
        secondary: None,
        latency_bound: true,
    }
}

/// Breakdown of a site's score for one role
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiteScore {
    pub latency_fit: f64,
    pub cost_fit: f64,
    pub reliability_fit: f64,
    pub total: f64,
}

pub fn score_site(
    site: &Site,
    intent: &QoSIntent,
    policy: &TierPolicy,
    rules: &TierRules,
    weights: &ScoringWeights,
) -> SiteScore {
    let tier_fit = if site.tier == policy.preferred {
        rules.preferred_fit
    } else if policy.secondary == Some(site.tier) {
        (rules.preferred_fit + rules.allowed_fit) / 2.0
    } else {
        rules.allowed_fit
    };
    let headroom = if intent.latency_ms > 0.0 {
        ((intent.latency_ms - site.latency_ms()) / intent.latency_ms).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let share = rules.tier_share.clamp(0.0, 1.0);
    let latency_fit = share * tier_fit + (1.0 - share) * headroom;

    // Cost index is on a 0..=1 scale where 1 is the most expensive tier
    let cost_fit = (1.0 - site.cost_index()).clamp(0.0, 1.0);

    let required = intent.effective_reliability();
    let reliability_fit = if required > 0.0 {
        (site.reliability() / required).min(1.0)
    } else {
        1.0
    };

    let (wl, wc, wr) = weights.normalized();
    SiteScore {
        latency_fit,
        cost_fit,
        reliability_fit,
        total: wl * latency_fit + wc * cost_fit + wr * reliability_fit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeEndpoint, Resources};

    fn site(id: &str, tier: Tier) -> Site {
        Site::new(
            id,
            tier,
            NodeEndpoint {
                name: id.into(),
                address: "10.0.0.1".parse().unwrap(),
                interface: "eth0".into(),
                agent_url: None,
            },
            Resources::default(),
        )
    }

    #[test]
    fn test_tier_policy_by_slice_type() {
        let rules = TierRules::default();
        let urllc = QoSIntent::new("u", SliceType::Urllc, 0.93, 6.3);
        let p = tier_policy(&urllc, FunctionRole::UserPlane, &rules);
        assert_eq!(p.allowed, vec![Tier::Edge, Tier::Regional]);
        assert_eq!(p.preferred, Tier::Edge);

        let big = QoSIntent::new("b", SliceType::Embb, 100.0, 50.0);
        let p = tier_policy(&big, FunctionRole::UserPlane, &rules);
        assert_eq!(p.preferred, Tier::Regional);
        assert!(p.allows(Tier::Central));

        let quick = QoSIntent::new("q", SliceType::Embb, 10.0, 15.0);
        assert_eq!(
            tier_policy(&quick, FunctionRole::UserPlane, &rules).preferred,
            Tier::Edge
        );

        let plain = QoSIntent::new("p", SliceType::Embb, 10.0, 40.0);
        assert_eq!(
            tier_policy(&plain, FunctionRole::UserPlane, &rules).preferred,
            Tier::Central
        );

        let iot = QoSIntent::new("m", SliceType::Mmtc, 2.77, 15.7);
        assert_eq!(
            tier_policy(&iot, FunctionRole::UserPlane, &rules).preferred,
            Tier::Edge
        );

        let cp = tier_policy(&urllc, FunctionRole::ControlPlane, &rules);
        assert_eq!(cp.preferred, Tier::Central);
        assert!(!cp.latency_bound);
        assert_eq!(cp.secondary, Some(Tier::Regional));
    }

    #[test]
    fn test_preferred_tier_outranks_cheaper_tier() {
        let rules = TierRules::default();
        let weights = ScoringWeights::default();
        let intent = QoSIntent::new("b", SliceType::Embb, 100.0, 50.0);
        let policy = tier_policy(&intent, FunctionRole::UserPlane, &rules);

        let regional = score_site(&site("r", Tier::Regional), &intent, &policy, &rules, &weights);
        let central = score_site(&site("c", Tier::Central), &intent, &policy, &rules, &weights);
        assert!(regional.total > central.total);
        assert!(central.cost_fit > regional.cost_fit);
    }

    #[test]
    fn test_zero_weights_fall_back_to_equal() {
        let w = ScoringWeights {
            latency: 0.0,
            cost: 0.0,
            reliability: 0.0,
        };
        let (l, c, r) = w.normalized();
        assert!((l + c + r - 1.0).abs() < 1e-9);
    }
}
