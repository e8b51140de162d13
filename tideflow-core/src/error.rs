//! Typed error kinds for the processor runtime.
//!
//! Backpressure is deliberately absent: a refused outbox offer is a normal
//! signal to suspend, not an error.

use thiserror::Error;

/// Errors that terminate a local task or the whole job.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The processor broke the cooperative contract: a callback without
    /// progress, a duplicate snapshot key, a non-monotonic watermark, or an
    /// exceeded time budget under strict mode. Fatal to the job.
    #[error("contract violation in '{vertex}': {detail}")]
    ContractViolation { vertex: String, detail: String },

    /// Cluster membership changed during execution. The coordinator decides
    /// whether to restart from the last snapshot.
    #[error("cluster topology changed during job execution")]
    TopologyChanged,

    /// User-supplied code (key, timestamp or aggregation function) panicked.
    /// Fatal to the local task; completes the job handle with failure.
    #[error("user code fault in '{vertex}': {detail}")]
    UserCodeFault { vertex: String, detail: String },
}

impl EngineError {
    /// Shorthand for a [`EngineError::ContractViolation`].
    pub fn contract(vertex: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ContractViolation {
            vertex: vertex.into(),
            detail: detail.into(),
        }
    }
}
