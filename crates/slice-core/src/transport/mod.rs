//! Transport QoS planning: shaping policies, overlay tunnels and VNI allocation

mod planner;
mod vni;

pub use planner::{derive_policy, priority_class, TransportPlan, TransportPlanner};
pub use vni::{VniPool, DEFAULT_VNI_END, DEFAULT_VNI_START};

use crate::models::Vni;
use serde::{Deserialize, Serialize};

fn default_vni_start() -> Vni {
    DEFAULT_VNI_START
}

fn default_vni_end() -> Vni {
    DEFAULT_VNI_END
}

fn default_mtu() -> u16 {
    1450
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_vni_start")]
    pub vni_start: Vni,
    #[serde(default = "default_vni_end")]
    pub vni_end: Vni,
    /// Overlay MTU, leaving room for the VXLAN header on a 1500 byte underlay
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            vni_start: default_vni_start(),
            vni_end: default_vni_end(),
            mtu: default_mtu(),
        }
    }
}
