//! Retry error model.

use std::sync::Arc;

use thiserror::Error;

/// Failure reported by a retry template.
///
/// `Failed` and `Exhausted` are business outcomes of the retried operation.
/// `InconsistentState` and `CacheCapacityExceeded` mean the caller's key
/// identity is broken; they are never retried and must not be swallowed.
#[derive(Debug, Clone, Error)]
pub enum RetryError {
    /// The last failure of the operation, re-raised.
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),

    /// No attempts remain and there is no recovery path.
    #[error("retry exhausted after {attempts} attempts with no recovery path: {last:#}")]
    Exhausted {
        attempts: u32,
        last: Arc<anyhow::Error>,
    },

    #[error("inconsistent retry state for key {key}: {reason}")]
    InconsistentState { key: String, reason: String },

    #[error(
        "retry context cache capacity ({capacity}) exceeded; check the Eq/Hash implementation of the retry key"
    )]
    CacheCapacityExceeded { capacity: usize },

    #[error("retry context cache unavailable: {0}")]
    Cache(String),
}

impl RetryError {
    /// Whether this signals broken key identity or cache bookkeeping rather
    /// than a failure of the operation itself.
    pub fn is_consistency_failure(&self) -> bool {
        matches!(
            self,
            RetryError::InconsistentState { .. }
                | RetryError::CacheCapacityExceeded { .. }
                | RetryError::Cache(_)
        )
    }

    /// The underlying operation failure, if any.
    pub fn last_failure(&self) -> Option<&anyhow::Error> {
        match self {
            RetryError::Failed(e) | RetryError::Exhausted { last: e, .. } => Some(e),
            _ => None,
        }
    }
}
