//! Core library for network slice placement and transport QoS
//!
//! This crate provides:
//! - Site capacity accounting with atomic reservations
//! - Tier-aware placement of slice functions onto sites
//! - Transport planning: HTB shaping policies and VXLAN tunnels
//! - Node agents enforcing policies and publishing live measurements
//! - Slice lifecycle tracking with compensating rollback
//! - Health checks and observability

pub mod agent;
pub mod backoff;
pub mod error;
pub mod health;
pub mod ledger;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod placement;
pub mod tracker;
pub mod transport;

pub use agent::{AgentRegistry, NodeAgent, RemoteAgent, TransportAgent};
pub use backoff::Backoff;
pub use error::{Result, SliceError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use ledger::{CapacityLedger, Reservation, ReservationId};
pub use models::*;
pub use observability::{SliceMetrics, StructuredLogger};
pub use orchestrator::{MeasurementPoller, Orchestrator, OrchestratorConfig};
pub use placement::{PlaceOptions, Placement, PlacementConfig, PlacementEngine};
pub use tracker::{Lifecycle, SliceEvent, SliceResource, SliceTracker, TrackerConfig};
pub use transport::{TransportConfig, TransportPlan, TransportPlanner};
