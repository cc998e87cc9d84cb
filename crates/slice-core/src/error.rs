//! Error types for slice placement and transport enforcement

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SliceError>;

#[derive(Debug, Error)]
pub enum SliceError {
    #[error("invalid intent: {0}")]
    InvalidIntent(String),

    #[error("no placement satisfies intent {intent_id}: {reason}")]
    ConstraintUnsatisfiable { intent_id: String, reason: String },

    #[error("capacity exhausted on site {site_id}")]
    CapacityExhausted { site_id: String },

    #[error("VNI pool exhausted ({capacity} identifiers)")]
    PoolExhausted { capacity: usize },

    #[error("apply failed on node {node}: {reason}")]
    ApplyFailed { node: String, reason: String },

    #[error("node {node} did not converge within {timeout_ms}ms")]
    ReconciliationTimeout { node: String, timeout_ms: u64 },

    #[error("invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("unknown site: {0}")]
    UnknownSite(String),

    #[error("unknown slice: {0}")]
    UnknownSlice(String),

    #[error("slice already exists: {0}")]
    DuplicateSlice(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("command rejected: {0}")]
    CommandRejected(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SliceError {
    /// Transient failures a caller may retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SliceError::CapacityExhausted { .. }
                | SliceError::ApplyFailed { .. }
                | SliceError::ReconciliationTimeout { .. }
                | SliceError::Io(_)
        )
    }

    /// Stable machine-readable code, used in API error bodies and metric labels
    pub fn code(&self) -> &'static str {
        match self {
            SliceError::InvalidIntent(_) => "invalid_intent",
            SliceError::ConstraintUnsatisfiable { .. } => "constraint_unsatisfiable",
            SliceError::CapacityExhausted { .. } => "capacity_exhausted",
            SliceError::PoolExhausted { .. } => "pool_exhausted",
            SliceError::ApplyFailed { .. } => "apply_failed",
            SliceError::ReconciliationTimeout { .. } => "reconciliation_timeout",
            SliceError::InvalidTransition { .. } => "invalid_transition",
            SliceError::UnknownSite(_) => "unknown_site",
            SliceError::UnknownSlice(_) => "unknown_slice",
            SliceError::DuplicateSlice(_) => "duplicate_slice",
            SliceError::Cancelled => "cancelled",
            SliceError::CommandRejected(_) => "command_rejected",
            SliceError::Configuration(_) => "configuration",
            SliceError::Io(_) => "io",
        }
    }
}
