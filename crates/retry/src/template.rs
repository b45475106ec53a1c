//! Retry loops.
//!
//! [`RetryTemplate`] retries an operation in-process. [`StatefulRetryTemplate`]
//! is for operations whose "retry loop" is a sequence of separate invocations
//! (a chunk re-delivering the same item after a rollback): the context for
//! each item key lives in a [`RetryContextCache`] between invocations.

use std::collections::hash_map::DefaultHasher;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::cache::RetryContextCache;
use crate::classifier::ErrorClassifier;
use crate::context::RetryContext;
use crate::error::RetryError;
use crate::policy::RetryPolicy;

/// In-process retry loop.
#[derive(Debug, Clone, Default)]
pub struct RetryTemplate {
    policy: RetryPolicy,
    backoff: BackoffPolicy,
}

impl RetryTemplate {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            backoff: BackoffPolicy::none(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `callback` until it succeeds or the policy is exhausted, in which
    /// case the last failure is re-raised.
    pub fn execute<T, F>(&self, callback: F) -> Result<T, RetryError>
    where
        F: FnMut(&RetryContext) -> anyhow::Result<T>,
    {
        self.execute_in(None, callback)
    }

    /// As [`execute`](Self::execute), nested inside an enclosing retry operation.
    pub fn execute_in<T, F>(&self, parent: Option<&RetryContext>, callback: F) -> Result<T, RetryError>
    where
        F: FnMut(&RetryContext) -> anyhow::Result<T>,
    {
        let mut ctx = self.policy.open(parent);
        let result = self.run(&mut ctx, callback);
        self.policy.close(&mut ctx);
        result.map_err(|()| self.policy.handle_exhausted(&ctx))
    }

    /// Run `callback`; on exhaustion return whatever `recover` produces.
    pub fn execute_with_recovery<T, F, R>(&self, callback: F, recover: R) -> Result<T, RetryError>
    where
        F: FnMut(&RetryContext) -> anyhow::Result<T>,
        R: FnOnce(&RetryContext) -> anyhow::Result<T>,
    {
        let mut ctx = self.policy.open(None);
        let result = self.run(&mut ctx, callback);
        self.policy.close(&mut ctx);
        match result {
            Ok(value) => Ok(value),
            Err(()) => {
                info!(retry_count = ctx.retry_count(), "retry exhausted, recovering");
                recover(&ctx).map_err(|e| RetryError::Failed(Arc::new(e)))
            }
        }
    }

    fn run<T, F>(&self, ctx: &mut RetryContext, mut callback: F) -> Result<T, ()>
    where
        F: FnMut(&RetryContext) -> anyhow::Result<T>,
    {
        while self.policy.can_retry(ctx) {
            match callback(ctx) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    self.policy.register_failure(ctx, Arc::new(err));
                    debug!(
                        retry_count = ctx.retry_count(),
                        error = %describe(ctx),
                        "retryable operation failed"
                    );
                    if self.policy.can_retry(ctx) {
                        self.backoff.back_off(ctx.retry_count());
                    }
                }
            }
        }
        Err(())
    }
}

fn describe(ctx: &RetryContext) -> String {
    ctx.last_failure()
        .map(|e| format!("{e:#}"))
        .unwrap_or_default()
}

/// Identity and handling of one stateful retry operation.
#[derive(Debug, Clone)]
pub struct RetryState<K> {
    pub key: K,
    /// Start with a fresh context, ignoring any cached history for `key`.
    pub force_refresh: bool,
    /// Errors classified `true` are re-raised so the caller can roll back;
    /// the rest are retried in-process.
    pub rollback: ErrorClassifier<bool>,
}

impl<K> RetryState<K> {
    pub fn new(key: K) -> Self {
        Self {
            key,
            force_refresh: false,
            rollback: ErrorClassifier::always(),
        }
    }

    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn with_rollback(mut self, rollback: ErrorClassifier<bool>) -> Self {
        self.rollback = rollback;
        self
    }
}

/// Result of a stateful retry invocation that did not need a rollback.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success(T),
    /// Attempts were exhausted and the recovery callback produced a value.
    Recovered(T),
    /// Attempts were exhausted and there was no recovery, or it failed.
    Exhausted {
        attempts: u32,
        last: Option<Arc<anyhow::Error>>,
    },
}

impl<T> RetryOutcome<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            RetryOutcome::Success(v) | RetryOutcome::Recovered(v) => Some(v),
            RetryOutcome::Exhausted { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success(_))
    }
}

/// Retry across separate invocations for the same key.
pub struct StatefulRetryTemplate<K> {
    policy: RetryPolicy,
    backoff: BackoffPolicy,
    cache: Arc<dyn RetryContextCache<K>>,
}

impl<K> Clone for StatefulRetryTemplate<K> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            backoff: self.backoff.clone(),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<K> Debug for StatefulRetryTemplate<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulRetryTemplate")
            .field("policy", &self.policy)
            .field("backoff", &self.backoff)
            .field("cached", &self.cache.len())
            .finish()
    }
}

fn hash_of<K: Hash>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl<K> StatefulRetryTemplate<K>
where
    K: Hash + Eq + Clone + Debug,
{
    pub fn new(policy: RetryPolicy, cache: Arc<dyn RetryContextCache<K>>) -> Self {
        Self {
            policy,
            backoff: BackoffPolicy::none(),
            cache,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn cache(&self) -> &Arc<dyn RetryContextCache<K>> {
        &self.cache
    }

    /// Invoke `callback` for `state.key`.
    ///
    /// A failure that requires rollback is recorded in the cache and returned
    /// as `Err(RetryError::Failed)`; the next invocation for the same key
    /// resumes the recorded attempt count. When the policy is exhausted the
    /// key is evicted and `Exhausted` is returned.
    pub fn execute<T, F>(&self, state: &RetryState<K>, callback: F) -> Result<RetryOutcome<T>, RetryError>
    where
        F: FnMut(&RetryContext) -> anyhow::Result<T>,
    {
        self.execute_inner(state, callback, None::<fn(&RetryContext) -> anyhow::Result<T>>)
    }

    /// As [`execute`](Self::execute), calling `recover` on exhaustion.
    pub fn execute_with_recovery<T, F, R>(
        &self,
        state: &RetryState<K>,
        callback: F,
        recover: R,
    ) -> Result<RetryOutcome<T>, RetryError>
    where
        F: FnMut(&RetryContext) -> anyhow::Result<T>,
        R: FnOnce(&RetryContext) -> anyhow::Result<T>,
    {
        self.execute_inner(state, callback, Some(recover))
    }

    fn execute_inner<T, F, R>(
        &self,
        state: &RetryState<K>,
        mut callback: F,
        recover: Option<R>,
    ) -> Result<RetryOutcome<T>, RetryError>
    where
        F: FnMut(&RetryContext) -> anyhow::Result<T>,
        R: FnOnce(&RetryContext) -> anyhow::Result<T>,
    {
        let hash = hash_of(&state.key);
        let mut ctx = self.open(state, hash)?;

        loop {
            if !self.policy.can_retry(&ctx) {
                return self.exhausted(state, ctx, recover);
            }

            match callback(&ctx) {
                Ok(value) => {
                    self.cache.remove(&state.key)?;
                    self.policy.close(&mut ctx);
                    return Ok(RetryOutcome::Success(value));
                }
                Err(err) => {
                    let err = Arc::new(err);
                    self.register(state, &mut ctx, hash, Arc::clone(&err))?;
                    if *state.rollback.classify(&err) {
                        debug!(
                            key = ?state.key,
                            retry_count = ctx.retry_count(),
                            "stateful retry failed, rolling back"
                        );
                        return Err(RetryError::Failed(err));
                    }
                    if self.policy.can_retry(&ctx) {
                        self.backoff.back_off(ctx.retry_count());
                    }
                }
            }
        }
    }

    fn open(&self, state: &RetryState<K>, hash: u64) -> Result<RetryContext, RetryError> {
        let cached = if state.force_refresh {
            None
        } else {
            self.cache.get(&state.key)?
        };
        if let Some(ctx) = cached {
            if ctx.key_hash.is_some_and(|stored| stored != hash) {
                return Err(RetryError::InconsistentState {
                    key: format!("{:?}", state.key),
                    reason: "key hash changed between invocations".to_string(),
                });
            }
            return Ok(ctx);
        }

        let mut ctx = self.policy.open(None);
        ctx.key_hash = Some(hash);
        Ok(ctx)
    }

    fn register(
        &self,
        state: &RetryState<K>,
        ctx: &mut RetryContext,
        hash: u64,
        err: Arc<anyhow::Error>,
    ) -> Result<(), RetryError> {
        if hash_of(&state.key) != hash {
            return Err(RetryError::InconsistentState {
                key: format!("{:?}", state.key),
                reason: "key hash changed during the attempt".to_string(),
            });
        }
        if ctx.retry_count() > 0 && !self.cache.contains_key(&state.key)? {
            return Err(RetryError::InconsistentState {
                key: format!("{:?}", state.key),
                reason: "context with prior failures is missing from the cache".to_string(),
            });
        }

        self.policy.register_failure(ctx, err);
        self.cache.put(state.key.clone(), ctx.clone())
    }

    fn exhausted<T, R>(
        &self,
        state: &RetryState<K>,
        mut ctx: RetryContext,
        recover: Option<R>,
    ) -> Result<RetryOutcome<T>, RetryError>
    where
        R: FnOnce(&RetryContext) -> anyhow::Result<T>,
    {
        self.cache.remove(&state.key)?;
        self.policy.close(&mut ctx);

        let attempts = ctx.retry_count();
        let last = ctx.last_failure_shared();
        let Some(recover) = recover else {
            warn!(key = ?state.key, attempts, "retry exhausted with no recovery callback");
            return Ok(RetryOutcome::Exhausted { attempts, last });
        };

        match recover(&ctx) {
            Ok(value) => {
                info!(key = ?state.key, attempts, "retry exhausted, item recovered");
                Ok(RetryOutcome::Recovered(value))
            }
            Err(err) => {
                error!(key = ?state.key, attempts, error = %format!("{err:#}"), "recovery failed");
                Ok(RetryOutcome::Exhausted { attempts, last })
            }
        }
    }
}
