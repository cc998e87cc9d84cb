//! Core data models for slice placement and transport QoS

use crate::error::{Result, SliceError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::ops::Add;

/// Site identifier
pub type SiteId = String;

/// VXLAN network identifier
pub type Vni = u32;

/// Accepted ranges for locally re-validated intent fields
pub mod limits {
    pub const BANDWIDTH_MBPS: (f64, f64) = (0.001, 10_000.0);
    pub const LATENCY_MS: (f64, f64) = (1.0, 1000.0);
    pub const PACKET_LOSS: (f64, f64) = (0.0, 1.0);
    pub const RELIABILITY: (f64, f64) = (0.90, 0.99999);
    pub const PRIORITY: (u8, u8) = (1, 10);
    pub const MAX_ID_LEN: usize = 63;
}

/// Network slice classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SliceType {
    #[serde(rename = "eMBB")]
    Embb,
    #[serde(rename = "URLLC")]
    Urllc,
    #[serde(rename = "mMTC")]
    Mmtc,
}

/// Default QoS and shaping parameters for a slice type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceProfile {
    pub bandwidth_mbps: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_rate: f64,
    pub reliability: f64,
    /// Ceiling over the guaranteed rate, as a multiple of it
    pub burst_factor: f64,
    /// HTB priority, 0 is served first
    pub priority_class: u8,
    pub user_plane_compute: Resources,
    pub control_plane_compute: Resources,
}

const EMBB_PROFILE: SliceProfile = SliceProfile {
    bandwidth_mbps: 4.57,
    latency_ms: 16.1,
    jitter_ms: 2.0,
    packet_loss_rate: 0.001,
    reliability: 0.999,
    burst_factor: 2.0,
    priority_class: 3,
    user_plane_compute: Resources::compute(2000, 4096),
    control_plane_compute: Resources::compute(1000, 2048),
};

const URLLC_PROFILE: SliceProfile = SliceProfile {
    bandwidth_mbps: 0.93,
    latency_ms: 6.3,
    jitter_ms: 1.0,
    packet_loss_rate: 0.00001,
    reliability: 0.99999,
    burst_factor: 1.2,
    priority_class: 1,
    user_plane_compute: Resources::compute(1000, 2048),
    control_plane_compute: Resources::compute(1000, 2048),
};

const MMTC_PROFILE: SliceProfile = SliceProfile {
    bandwidth_mbps: 2.77,
    latency_ms: 15.7,
    jitter_ms: 2.0,
    packet_loss_rate: 0.01,
    reliability: 0.99,
    burst_factor: 1.5,
    priority_class: 5,
    user_plane_compute: Resources::compute(500, 1024),
    control_plane_compute: Resources::compute(500, 1024),
};

impl SliceType {
    pub const ALL: [SliceType; 3] = [SliceType::Embb, SliceType::Urllc, SliceType::Mmtc];

    /// Default parameters for this slice type
    pub fn profile(self) -> &'static SliceProfile {
        match self {
            SliceType::Embb => &EMBB_PROFILE,
            SliceType::Urllc => &URLLC_PROFILE,
            SliceType::Mmtc => &MMTC_PROFILE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SliceType::Embb => "eMBB",
            SliceType::Urllc => "URLLC",
            SliceType::Mmtc => "mMTC",
        }
    }
}

impl fmt::Display for SliceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute and transport resources in integer units
///
/// Bandwidth is tracked in kbit/s so that reserve/release arithmetic is exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_millicores: u64,
    pub memory_mb: u64,
    pub bandwidth_kbps: u64,
}

impl Resources {
    pub const fn new(cpu_millicores: u64, memory_mb: u64, bandwidth_kbps: u64) -> Self {
        Self {
            cpu_millicores,
            memory_mb,
            bandwidth_kbps,
        }
    }

    /// Compute-only resources
    pub const fn compute(cpu_millicores: u64, memory_mb: u64) -> Self {
        Self::new(cpu_millicores, memory_mb, 0)
    }

    pub fn with_bandwidth_mbps(mut self, mbps: f64) -> Self {
        self.bandwidth_kbps = mbps_to_kbps(mbps);
        self
    }

    pub fn bandwidth_mbps(&self) -> f64 {
        self.bandwidth_kbps as f64 / 1000.0
    }

    /// True if every dimension of `self` fits inside `available`
    pub fn fits_within(&self, available: &Resources) -> bool {
        self.cpu_millicores <= available.cpu_millicores
            && self.memory_mb <= available.memory_mb
            && self.bandwidth_kbps <= available.bandwidth_kbps
    }

    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu_millicores: self.cpu_millicores.checked_sub(other.cpu_millicores)?,
            memory_mb: self.memory_mb.checked_sub(other.memory_mb)?,
            bandwidth_kbps: self.bandwidth_kbps.checked_sub(other.bandwidth_kbps)?,
        })
    }

    pub fn is_zero(&self) -> bool {
        *self == Resources::default()
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Resources) -> Resources {
        Resources {
            cpu_millicores: self.cpu_millicores.saturating_add(rhs.cpu_millicores),
            memory_mb: self.memory_mb.saturating_add(rhs.memory_mb),
            bandwidth_kbps: self.bandwidth_kbps.saturating_add(rhs.bandwidth_kbps),
        }
    }
}

/// Convert Mbit/s to kbit/s, rounding to the nearest kbit
pub fn mbps_to_kbps(mbps: f64) -> u64 {
    if !mbps.is_finite() || mbps <= 0.0 {
        return 0;
    }
    (mbps * 1000.0).round() as u64
}

fn default_priority() -> u8 {
    5
}

/// A validated QoS intent for one slice
///
/// Optional fields fall back to the slice-type profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QoSIntent {
    pub id: String,
    pub slice_type: SliceType,
    pub bandwidth_mbps: f64,
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_loss_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliability: Option<f64>,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

impl QoSIntent {
    /// Intent with only the mandatory fields set
    pub fn new(
        id: impl Into<String>,
        slice_type: SliceType,
        bandwidth_mbps: f64,
        latency_ms: f64,
    ) -> Self {
        Self {
            id: id.into(),
            slice_type,
            bandwidth_mbps,
            latency_ms,
            jitter_ms: None,
            packet_loss_rate: None,
            reliability: None,
            priority: default_priority(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = Some(reliability);
        self
    }

    pub fn with_packet_loss_rate(mut self, loss: f64) -> Self {
        self.packet_loss_rate = Some(loss);
        self
    }

    /// Re-validate documented ranges before any reservation is attempted
    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id)?;
        check_range("bandwidthMbps", self.bandwidth_mbps, limits::BANDWIDTH_MBPS)?;
        check_range("latencyMs", self.latency_ms, limits::LATENCY_MS)?;
        if let Some(jitter) = self.jitter_ms {
            check_range("jitterMs", jitter, (0.0, limits::LATENCY_MS.1))?;
        }
        if let Some(loss) = self.packet_loss_rate {
            check_range("packetLossRate", loss, limits::PACKET_LOSS)?;
        }
        if let Some(reliability) = self.reliability {
            check_range("reliability", reliability, limits::RELIABILITY)?;
        }
        let (lo, hi) = limits::PRIORITY;
        if !(lo..=hi).contains(&self.priority) {
            return Err(SliceError::InvalidIntent(format!(
                "priority {} outside {}..={}",
                self.priority, lo, hi
            )));
        }
        Ok(())
    }

    pub fn profile(&self) -> &'static SliceProfile {
        self.slice_type.profile()
    }

    pub fn bandwidth_kbps(&self) -> u64 {
        mbps_to_kbps(self.bandwidth_mbps)
    }

    pub fn effective_jitter_ms(&self) -> f64 {
        self.jitter_ms.unwrap_or(self.profile().jitter_ms)
    }

    pub fn effective_loss_rate(&self) -> f64 {
        self.packet_loss_rate
            .unwrap_or(self.profile().packet_loss_rate)
    }

    pub fn effective_reliability(&self) -> f64 {
        self.reliability.unwrap_or(self.profile().reliability)
    }
}

fn check_range(field: &str, value: f64, (lo, hi): (f64, f64)) -> Result<()> {
    if (lo..=hi).contains(&value) {
        Ok(())
    } else {
        Err(SliceError::InvalidIntent(format!(
            "{} {} outside {}..={}",
            field, value, lo, hi
        )))
    }
}

/// Slice identifiers end up in log lines, URLs and metric labels
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > limits::MAX_ID_LEN {
        return Err(SliceError::InvalidIntent(format!(
            "id must be 1..={} characters",
            limits::MAX_ID_LEN
        )));
    }
    let valid = id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !id.starts_with('-')
        && !id.ends_with('-');
    if !valid {
        return Err(SliceError::InvalidIntent(format!(
            "id {:?} must be lowercase alphanumeric with inner dashes",
            id
        )));
    }
    Ok(())
}

/// Deployment locality class of a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Edge,
    Regional,
    Central,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Edge, Tier::Regional, Tier::Central];

    pub fn default_latency_ms(self) -> f64 {
        match self {
            Tier::Edge => 2.0,
            Tier::Regional => 10.0,
            Tier::Central => 25.0,
        }
    }

    pub fn default_reliability(self) -> f64 {
        match self {
            Tier::Edge => 0.999,
            Tier::Regional => 0.9999,
            Tier::Central => 0.99999,
        }
    }

    /// Relative cost per unit of capacity, higher is more expensive
    pub fn default_cost_index(self) -> f64 {
        match self {
            Tier::Edge => 1.0,
            Tier::Regional => 0.6,
            Tier::Central => 0.3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Edge => "edge",
            Tier::Regional => "regional",
            Tier::Central => "central",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geographic placement of a site
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
}

/// Transport node serving a site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    /// Node name, also the key of its transport agent
    pub name: String,
    /// Underlay address used as VXLAN local/remote endpoint
    pub address: IpAddr,
    /// Physical interface carrying the overlay
    pub interface: String,
    /// Base URL of the node agent API when the node is remote
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_url: Option<String>,
}

/// A cluster site that can host slice functions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub tier: Tier,
    #[serde(default)]
    pub location: Location,
    pub node: NodeEndpoint,
    pub total_capacity: Resources,
    /// Maintained by the capacity ledger; ignored on registration
    #[serde(default)]
    pub available_capacity: Resources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_index: Option<f64>,
}

impl Site {
    pub fn new(
        id: impl Into<SiteId>,
        tier: Tier,
        node: NodeEndpoint,
        total_capacity: Resources,
    ) -> Self {
        Self {
            id: id.into(),
            tier,
            location: Location::default(),
            node,
            total_capacity,
            available_capacity: total_capacity,
            base_latency_ms: None,
            reliability: None,
            cost_index: None,
        }
    }

    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.base_latency_ms = Some(latency_ms);
        self
    }

    pub fn with_cost_index(mut self, cost_index: f64) -> Self {
        self.cost_index = Some(cost_index);
        self
    }

    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = Some(reliability);
        self
    }

    pub fn latency_ms(&self) -> f64 {
        self.base_latency_ms
            .unwrap_or_else(|| self.tier.default_latency_ms())
    }

    pub fn reliability(&self) -> f64 {
        self.reliability
            .unwrap_or_else(|| self.tier.default_reliability())
    }

    pub fn cost_index(&self) -> f64 {
        self.cost_index
            .unwrap_or_else(|| self.tier.default_cost_index())
    }

    pub fn tunnel_endpoint(&self) -> TunnelEndpoint {
        TunnelEndpoint {
            site_id: self.id.clone(),
            node: self.node.name.clone(),
            address: self.node.address,
            interface: self.node.interface.clone(),
        }
    }
}

/// Function a site hosts for a slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionRole {
    /// User-plane function; carries the slice traffic and the tier rules
    UserPlane,
    /// Control-plane functions for the slice
    ControlPlane,
}

impl fmt::Display for FunctionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionRole::UserPlane => f.write_str("user_plane"),
            FunctionRole::ControlPlane => f.write_str("control_plane"),
        }
    }
}

/// One (site, role) pair of a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteAssignment {
    pub site_id: SiteId,
    pub role: FunctionRole,
    pub tier: Tier,
    pub score: f64,
}

/// Output of the placement engine; superseded, never edited
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementDecision {
    pub intent_id: String,
    pub sites: Vec<SiteAssignment>,
    pub score: f64,
    pub created_at: DateTime<Utc>,
    /// Increments each time a slice is re-placed
    pub generation: u32,
}

impl PlacementDecision {
    pub fn site_for(&self, role: FunctionRole) -> Option<&SiteAssignment> {
        self.sites.iter().find(|a| a.role == role)
    }

    /// Sites of the decision in assignment order, without duplicates
    pub fn distinct_sites(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::with_capacity(self.sites.len());
        for assignment in &self.sites {
            if !out.contains(&assignment.site_id.as_str()) {
                out.push(&assignment.site_id);
            }
        }
        out
    }

    /// Unordered pairs of distinct sites, each pair sorted by site id
    pub fn site_pairs(&self) -> Vec<(String, String)> {
        let sites = self.distinct_sites();
        let mut pairs = Vec::new();
        for (i, a) in sites.iter().enumerate() {
            for b in &sites[i + 1..] {
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                pairs.push((lo.to_string(), hi.to_string()));
            }
        }
        pairs.sort();
        pairs
    }
}

/// Per-site shaping contract for one slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthPolicy {
    pub slice_id: String,
    pub site_id: SiteId,
    pub node: String,
    pub interface: String,
    pub guaranteed_mbps: f64,
    pub burst_mbps: f64,
    pub priority_class: u8,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loss_rate: f64,
}

/// One end of an overlay tunnel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelEndpoint {
    pub site_id: SiteId,
    pub node: String,
    pub address: IpAddr,
    pub interface: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Requested,
    Up,
    TearingDown,
    Released,
}

impl TunnelState {
    /// Numeric encoding used by the `tunnel_state` gauge
    pub fn gauge_value(self) -> f64 {
        match self {
            TunnelState::Requested => 0.0,
            TunnelState::Up => 1.0,
            TunnelState::TearingDown => 2.0,
            TunnelState::Released => 3.0,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Requested => "requested",
            TunnelState::Up => "up",
            TunnelState::TearingDown => "tearing_down",
            TunnelState::Released => "released",
        };
        f.write_str(s)
    }
}

/// Point-to-point VXLAN tunnel between two sites of a slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tunnel {
    pub vni: Vni,
    pub slice_id: String,
    pub endpoint_a: TunnelEndpoint,
    pub endpoint_b: TunnelEndpoint,
    pub mtu: u16,
    pub state: TunnelState,
}

impl Tunnel {
    pub fn interface_name(&self) -> String {
        tunnel_interface(self.vni)
    }

    /// (local, remote) endpoints as seen from `node`
    pub fn sides_for(&self, node: &str) -> Option<(&TunnelEndpoint, &TunnelEndpoint)> {
        if self.endpoint_a.node == node {
            Some((&self.endpoint_a, &self.endpoint_b))
        } else if self.endpoint_b.node == node {
            Some((&self.endpoint_b, &self.endpoint_a))
        } else {
            None
        }
    }

    pub fn connects(&self, a: &str, b: &str) -> bool {
        (self.endpoint_a.site_id == a && self.endpoint_b.site_id == b)
            || (self.endpoint_a.site_id == b && self.endpoint_b.site_id == a)
    }
}

/// Interface name for a VNI
pub fn tunnel_interface(vni: Vni) -> String {
    format!("vxlan{}", vni)
}

/// A live reading for one slice on one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub slice_id: String,
    pub node: String,
    pub throughput_mbps: f64,
    pub latency_ms: f64,
    pub loss_rate: f64,
    pub observed_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent() -> QoSIntent {
        QoSIntent::new("slice-a", SliceType::Urllc, 0.93, 6.3)
    }

    #[test]
    fn test_intent_deserializes_camel_case() {
        let json = r#"{"id":"cam-1","sliceType":"URLLC","bandwidthMbps":0.93,"latencyMs":6.3}"#;
        let parsed: QoSIntent = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.slice_type, SliceType::Urllc);
        assert_eq!(parsed.priority, 5);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_intent_rejects_unknown_slice_type() {
        let json = r#"{"id":"x","sliceType":"V2X","bandwidthMbps":1,"latencyMs":10}"#;
        assert!(serde_json::from_str::<QoSIntent>(json).is_err());
    }

    #[test]
    fn test_intent_range_validation() {
        assert!(intent().validate().is_ok());

        let mut bad = intent();
        bad.bandwidth_mbps = 0.0;
        assert!(matches!(bad.validate(), Err(SliceError::InvalidIntent(_))));

        let mut bad = intent();
        bad.latency_ms = 1000.5;
        assert!(bad.validate().is_err());

        let bad = intent().with_reliability(0.5);
        assert!(bad.validate().is_err());

        let bad = intent().with_priority(11);
        assert!(bad.validate().is_err());

        let mut bad = intent();
        bad.bandwidth_mbps = f64::NAN;
        assert!(bad.validate().is_err());

        let mut bad = intent();
        bad.id = "Bad Id".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_effective_values_fall_back_to_profile() {
        let i = intent();
        assert_eq!(i.effective_loss_rate(), 0.00001);
        assert_eq!(i.effective_reliability(), 0.99999);
        let i = i.with_packet_loss_rate(0.01);
        assert_eq!(i.effective_loss_rate(), 0.01);
    }

    #[test]
    fn test_resources_arithmetic() {
        let total = Resources::new(4000, 8192, 100_000);
        let need = Resources::compute(1000, 1024).with_bandwidth_mbps(0.93);
        assert_eq!(need.bandwidth_kbps, 930);
        assert!(need.fits_within(&total));
        let left = total.checked_sub(&need).unwrap();
        assert_eq!(left + need, total);
        assert!(Resources::new(1, 0, 0).checked_sub(&Resources::new(2, 0, 0)).is_none());
    }

    #[test]
    fn test_site_pairs_are_sorted_and_distinct() {
        let decision = PlacementDecision {
            intent_id: "s".into(),
            sites: vec![
                SiteAssignment {
                    site_id: "regional-1".into(),
                    role: FunctionRole::UserPlane,
                    tier: Tier::Regional,
                    score: 0.8,
                },
                SiteAssignment {
                    site_id: "central-1".into(),
                    role: FunctionRole::ControlPlane,
                    tier: Tier::Central,
                    score: 0.7,
                },
            ],
            score: 0.75,
            created_at: Utc::now(),
            generation: 1,
        };
        assert_eq!(
            decision.site_pairs(),
            vec![("central-1".to_string(), "regional-1".to_string())]
        );
        assert_eq!(decision.distinct_sites(), vec!["regional-1", "central-1"]);
    }
}
