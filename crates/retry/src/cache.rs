//! Storage for stateful retry contexts between invocations.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use crate::context::RetryContext;
use crate::error::RetryError;

/// Default bound on the number of in-flight stateful retry keys.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Keyed store of retry contexts for stateful retry.
///
/// Shared by every worker that executes the same step, so implementations
/// must be safe for concurrent use.
pub trait RetryContextCache<K>: Send + Sync {
    fn get(&self, key: &K) -> Result<Option<RetryContext>, RetryError>;

    /// Insert or replace. Fails with `CacheCapacityExceeded` when a new key
    /// would push the cache past its capacity.
    fn put(&self, key: K, context: RetryContext) -> Result<(), RetryError>;

    fn remove(&self, key: &K) -> Result<(), RetryError>;

    fn contains_key(&self, key: &K) -> Result<bool, RetryError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, C> RetryContextCache<K> for Arc<C>
where
    C: RetryContextCache<K> + ?Sized,
{
    fn get(&self, key: &K) -> Result<Option<RetryContext>, RetryError> {
        (**self).get(key)
    }

    fn put(&self, key: K, context: RetryContext) -> Result<(), RetryError> {
        (**self).put(key, context)
    }

    fn remove(&self, key: &K) -> Result<(), RetryError> {
        (**self).remove(key)
    }

    fn contains_key(&self, key: &K) -> Result<bool, RetryError> {
        (**self).contains_key(key)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// Bounded in-memory cache.
#[derive(Debug)]
pub struct MapRetryContextCache<K> {
    capacity: usize,
    contexts: RwLock<HashMap<K, RetryContext>>,
}

impl<K> Default for MapRetryContextCache<K> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl<K> MapRetryContextCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            contexts: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn poisoned() -> RetryError {
    RetryError::Cache("lock poisoned".to_string())
}

impl<K> RetryContextCache<K> for MapRetryContextCache<K>
where
    K: Hash + Eq + Send + Sync,
{
    fn get(&self, key: &K) -> Result<Option<RetryContext>, RetryError> {
        let contexts = self.contexts.read().map_err(|_| poisoned())?;
        Ok(contexts.get(key).cloned())
    }

    fn put(&self, key: K, context: RetryContext) -> Result<(), RetryError> {
        let mut contexts = self.contexts.write().map_err(|_| poisoned())?;
        if !contexts.contains_key(&key) && contexts.len() >= self.capacity {
            return Err(RetryError::CacheCapacityExceeded {
                capacity: self.capacity,
            });
        }
        contexts.insert(key, context);
        Ok(())
    }

    fn remove(&self, key: &K) -> Result<(), RetryError> {
        let mut contexts = self.contexts.write().map_err(|_| poisoned())?;
        contexts.remove(key);
        Ok(())
    }

    fn contains_key(&self, key: &K) -> Result<bool, RetryError> {
        let contexts = self.contexts.read().map_err(|_| poisoned())?;
        Ok(contexts.contains_key(key))
    }

    fn len(&self) -> usize {
        self.contexts.read().map(|c| c.len()).unwrap_or(0)
    }
}
