//! Error taxonomy shared by every component (spec §7).
//!
//! Fetchers and the Merger classify failures into this enum before they
//! cross a component boundary; the Worker pool inspects `retryable()` to
//! decide whether to back off and retry or terminalize the job.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpenThreatError {
    #[error("transient upstream error: {0}")]
    TransientUpstream(String),

    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    NonRetryableConfig(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),
}

impl OpenThreatError {
    /// Whether a caller should retry the operation that produced this error.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            OpenThreatError::TransientUpstream(_)
                | OpenThreatError::RateLimited { .. }
                | OpenThreatError::StoreUnavailable(_)
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            OpenThreatError::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, OpenThreatError>;
