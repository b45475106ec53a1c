//! Per-operation retry state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Child state kept by composite and classifier policies.
#[derive(Debug, Clone)]
pub(crate) enum PolicyState {
    Leaf,
    Composite(Vec<RetryContext>),
    Classified {
        current: Option<usize>,
        contexts: BTreeMap<usize, RetryContext>,
    },
}

/// State of one logical retryable operation.
///
/// Created fresh by [`RetryPolicy::open`](crate::RetryPolicy::open) unless a
/// stateful template resumes it from a [`RetryContextCache`](crate::RetryContextCache).
#[derive(Debug, Clone)]
pub struct RetryContext {
    retry_count: u32,
    last_failure: Option<Arc<anyhow::Error>>,
    parent: Option<Box<RetryContext>>,
    started_at: Instant,
    exhausted_only: bool,
    pub(crate) key_hash: Option<u64>,
    pub(crate) state: PolicyState,
}

impl RetryContext {
    pub(crate) fn new(parent: Option<&RetryContext>, state: PolicyState) -> Self {
        Self {
            retry_count: 0,
            last_failure: None,
            parent: parent.map(|p| Box::new(p.clone())),
            started_at: Instant::now(),
            exhausted_only: false,
            key_hash: None,
            state,
        }
    }

    /// Number of failures registered so far.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_failure(&self) -> Option<&anyhow::Error> {
        self.last_failure.as_deref()
    }

    pub(crate) fn last_failure_shared(&self) -> Option<Arc<anyhow::Error>> {
        self.last_failure.clone()
    }

    /// Context of the enclosing retry operation, when nested.
    pub fn parent(&self) -> Option<&RetryContext> {
        self.parent.as_deref()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Prevent further attempts regardless of what the policy says.
    pub fn set_exhausted_only(&mut self) {
        self.exhausted_only = true;
    }

    pub fn is_exhausted_only(&self) -> bool {
        self.exhausted_only
    }

    pub(crate) fn record_failure(&mut self, failure: Arc<anyhow::Error>) {
        self.retry_count += 1;
        self.last_failure = Some(failure);
    }
}
