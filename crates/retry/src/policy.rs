//! Retry policies.
//!
//! A closed set of variants behind one interface: `open`, `can_retry`,
//! `register_failure`, `close` and `handle_exhausted`. Composition happens
//! through the explicit `Composite` and `Classifier` variants; child state
//! lives inside the [`RetryContext`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::classifier::ErrorClassifier;
use crate::context::{PolicyState, RetryContext};
use crate::error::RetryError;

/// Default number of attempts for [`RetryPolicy::Simple`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// A single attempt, never retried.
    Never,
    /// Retry until the operation succeeds.
    Always,
    /// Up to `max_attempts` attempts while the last failure is retryable.
    Simple {
        max_attempts: u32,
        retryable: ErrorClassifier<bool>,
    },
    /// Retry while the operation has been running for at most `timeout`.
    Timeout { timeout: Duration },
    /// Pessimistic: every child must permit a retry. Optimistic: any child may.
    Composite {
        policies: Vec<RetryPolicy>,
        optimistic: bool,
    },
    /// Route each failure to the policy for its error category.
    Classifier(Box<ErrorClassifier<RetryPolicy>>),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::simple(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    pub fn simple(max_attempts: u32) -> Self {
        Self::Simple {
            max_attempts,
            retryable: ErrorClassifier::always(),
        }
    }

    pub fn simple_with(max_attempts: u32, retryable: ErrorClassifier<bool>) -> Self {
        Self::Simple {
            max_attempts,
            retryable,
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout }
    }

    pub fn composite(policies: Vec<RetryPolicy>) -> Self {
        Self::Composite {
            policies,
            optimistic: false,
        }
    }

    pub fn optimistic_composite(policies: Vec<RetryPolicy>) -> Self {
        Self::Composite {
            policies,
            optimistic: true,
        }
    }

    pub fn classifier(classifier: ErrorClassifier<RetryPolicy>) -> Self {
        Self::Classifier(Box::new(classifier))
    }

    /// Start a new retry operation.
    pub fn open(&self, parent: Option<&RetryContext>) -> RetryContext {
        let state = match self {
            RetryPolicy::Composite { policies, .. } => {
                PolicyState::Composite(policies.iter().map(|p| p.open(parent)).collect())
            }
            RetryPolicy::Classifier(_) => PolicyState::Classified {
                current: None,
                contexts: BTreeMap::new(),
            },
            _ => PolicyState::Leaf,
        };
        RetryContext::new(parent, state)
    }

    /// Whether another attempt is permitted.
    pub fn can_retry(&self, ctx: &RetryContext) -> bool {
        if ctx.is_exhausted_only() {
            return false;
        }
        match self {
            RetryPolicy::Never => ctx.last_failure().is_none(),
            RetryPolicy::Always => true,
            RetryPolicy::Simple {
                max_attempts,
                retryable,
            } => {
                let last_is_retryable = ctx.last_failure().is_none_or(|e| *retryable.classify(e));
                last_is_retryable && ctx.retry_count() < *max_attempts
            }
            RetryPolicy::Timeout { timeout } => ctx.elapsed() <= *timeout,
            RetryPolicy::Composite {
                policies,
                optimistic,
            } => match &ctx.state {
                PolicyState::Composite(children) => {
                    let mut pairs = policies.iter().zip(children);
                    if *optimistic {
                        pairs.any(|(p, c)| p.can_retry(c))
                    } else {
                        pairs.all(|(p, c)| p.can_retry(c))
                    }
                }
                _ => false,
            },
            RetryPolicy::Classifier(classifier) => match &ctx.state {
                PolicyState::Classified {
                    current: Some(index),
                    contexts,
                } => contexts
                    .get(index)
                    .is_some_and(|child| classifier.value_at(*index).can_retry(child)),
                _ => true,
            },
        }
    }

    /// Record a failed attempt.
    pub fn register_failure(&self, ctx: &mut RetryContext, failure: Arc<anyhow::Error>) {
        ctx.record_failure(failure.clone());
        match (self, &mut ctx.state) {
            (RetryPolicy::Composite { policies, .. }, PolicyState::Composite(children)) => {
                for (policy, child) in policies.iter().zip(children.iter_mut()) {
                    policy.register_failure(child, failure.clone());
                }
            }
            (RetryPolicy::Classifier(classifier), PolicyState::Classified { current, contexts }) => {
                let index = classifier.classify_index(&failure);
                let policy = classifier.value_at(index);
                let child = contexts.entry(index).or_insert_with(|| policy.open(None));
                policy.register_failure(child, failure);
                *current = Some(index);
            }
            _ => {}
        }
    }

    /// Release the operation's resources.
    pub fn close(&self, ctx: &mut RetryContext) {
        match (self, &mut ctx.state) {
            (RetryPolicy::Composite { policies, .. }, PolicyState::Composite(children)) => {
                for (policy, child) in policies.iter().zip(children.iter_mut()) {
                    policy.close(child);
                }
            }
            (RetryPolicy::Classifier(classifier), PolicyState::Classified { contexts, .. }) => {
                for (index, child) in contexts.iter_mut() {
                    classifier.value_at(*index).close(child);
                }
            }
            _ => {}
        }
    }

    /// Outcome when no attempts remain and no recovery path exists: the last
    /// failure is re-raised.
    pub fn handle_exhausted(&self, ctx: &RetryContext) -> RetryError {
        match ctx.last_failure_shared() {
            Some(last) => RetryError::Failed(last),
            None => RetryError::Exhausted {
                attempts: 0,
                last: Arc::new(anyhow::anyhow!("retry policy permitted no attempts")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ErrorMatcher;
    use proptest::prelude::*;

    #[derive(Debug, thiserror::Error)]
    #[error("connection reset")]
    struct Transient;

    #[derive(Debug, thiserror::Error)]
    #[error("constraint violated")]
    struct Permanent;

    fn fail(policy: &RetryPolicy, ctx: &mut RetryContext, err: impl Into<anyhow::Error>) {
        policy.register_failure(ctx, Arc::new(err.into()));
    }

    #[test]
    fn simple_policy_counts_attempts() {
        let policy = RetryPolicy::simple(3);
        let mut ctx = policy.open(None);

        assert!(policy.can_retry(&ctx));
        fail(&policy, &mut ctx, Transient);
        fail(&policy, &mut ctx, Transient);
        assert!(policy.can_retry(&ctx));
        fail(&policy, &mut ctx, Transient);
        assert!(!policy.can_retry(&ctx));
        assert_eq!(ctx.retry_count(), 3);
    }

    #[test]
    fn simple_policy_stops_on_non_retryable_error() {
        let policy = RetryPolicy::simple_with(
            5,
            ErrorClassifier::only([ErrorMatcher::of::<Transient>()]),
        );
        let mut ctx = policy.open(None);

        fail(&policy, &mut ctx, Transient);
        assert!(policy.can_retry(&ctx));
        fail(&policy, &mut ctx, Permanent);
        assert!(!policy.can_retry(&ctx));
    }

    #[test]
    fn never_allows_exactly_one_attempt() {
        let policy = RetryPolicy::Never;
        let mut ctx = policy.open(None);
        assert!(policy.can_retry(&ctx));
        fail(&policy, &mut ctx, Transient);
        assert!(!policy.can_retry(&ctx));
    }

    #[test]
    fn timeout_policy_expires() {
        let policy = RetryPolicy::timeout(Duration::from_millis(20));
        let ctx = policy.open(None);
        assert!(policy.can_retry(&ctx));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!policy.can_retry(&ctx));
    }

    #[test]
    fn pessimistic_composite_requires_all_children() {
        let policy = RetryPolicy::composite(vec![RetryPolicy::simple(1), RetryPolicy::Always]);
        let mut ctx = policy.open(None);

        assert!(policy.can_retry(&ctx));
        fail(&policy, &mut ctx, Transient);
        assert!(!policy.can_retry(&ctx));
    }

    #[test]
    fn optimistic_composite_requires_any_child() {
        let policy =
            RetryPolicy::optimistic_composite(vec![RetryPolicy::simple(1), RetryPolicy::simple(2)]);
        let mut ctx = policy.open(None);

        fail(&policy, &mut ctx, Transient);
        assert!(policy.can_retry(&ctx));
        fail(&policy, &mut ctx, Transient);
        assert!(!policy.can_retry(&ctx));
    }

    #[test]
    fn classifier_routes_to_policy_per_category() {
        let policy = RetryPolicy::classifier(
            ErrorClassifier::new(RetryPolicy::Never)
                .with_rule(ErrorMatcher::of::<Transient>(), RetryPolicy::simple(3)),
        );
        let mut ctx = policy.open(None);

        fail(&policy, &mut ctx, Transient);
        assert!(policy.can_retry(&ctx));

        fail(&policy, &mut ctx, Permanent);
        assert!(!policy.can_retry(&ctx));
        assert_eq!(ctx.retry_count(), 2);
    }

    #[test]
    fn handle_exhausted_reraises_last_failure() {
        let policy = RetryPolicy::simple(1);
        let mut ctx = policy.open(None);
        fail(&policy, &mut ctx, Permanent);

        let err = policy.handle_exhausted(&ctx);
        assert!(matches!(err, RetryError::Failed(_)));
        assert_eq!(err.to_string(), "constraint violated");
    }

    #[test]
    fn nested_context_keeps_parent() {
        let outer = RetryPolicy::simple(2);
        let mut parent = outer.open(None);
        fail(&outer, &mut parent, Transient);

        let inner = RetryPolicy::Never.open(Some(&parent));
        assert_eq!(inner.parent().map(RetryContext::retry_count), Some(1));
    }

    proptest! {
        #[test]
        fn simple_policy_permits_exactly_max_attempts(max_attempts in 1u32..20) {
            let policy = RetryPolicy::simple(max_attempts);
            let mut ctx = policy.open(None);
            let mut attempts = 0;
            while policy.can_retry(&ctx) {
                attempts += 1;
                fail(&policy, &mut ctx, Transient);
            }
            prop_assert_eq!(attempts, max_attempts);
        }
    }
}
