//! Engine configuration.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use forgebatch_retry::DEFAULT_CAPACITY;

pub const ENV_COMMIT_INTERVAL: &str = "FORGEBATCH_COMMIT_INTERVAL";
pub const ENV_RETRY_LIMIT: &str = "FORGEBATCH_RETRY_LIMIT";
pub const ENV_SKIP_LIMIT: &str = "FORGEBATCH_SKIP_LIMIT";
pub const ENV_RETRY_CACHE_CAPACITY: &str = "FORGEBATCH_RETRY_CACHE_CAPACITY";
pub const ENV_NON_RESTARTABLE_JOBS: &str = "FORGEBATCH_NON_RESTARTABLE_JOBS";

/// Batch engine configuration.
///
/// Missing fields take their defaults when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Items per chunk
    pub commit_interval: usize,
    /// Attempts per item before it is skipped or recovered
    pub retry_limit: u32,
    /// Skips tolerated per step execution
    pub skip_limit: u64,
    /// Bound on in-flight stateful retry keys
    pub retry_cache_capacity: usize,
    /// Jobs that may not run again once an execution has COMPLETED
    pub non_restartable_jobs: BTreeSet<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            commit_interval: 10,
            retry_limit: 3,
            skip_limit: 0,
            retry_cache_capacity: DEFAULT_CAPACITY,
            non_restartable_jobs: BTreeSet::new(),
        }
    }
}

impl BatchConfig {
    pub fn with_commit_interval(mut self, commit_interval: usize) -> Self {
        self.commit_interval = commit_interval.max(1);
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_skip_limit(mut self, skip_limit: u64) -> Self {
        self.skip_limit = skip_limit;
        self
    }

    pub fn with_retry_cache_capacity(mut self, capacity: usize) -> Self {
        self.retry_cache_capacity = capacity;
        self
    }

    pub fn with_non_restartable(mut self, job_name: impl Into<String>) -> Self {
        self.non_restartable_jobs.insert(job_name.into());
        self
    }

    pub fn is_restartable(&self, job_name: &str) -> bool {
        !self.non_restartable_jobs.contains(job_name)
    }

    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: Self = serde_json::from_str(json)?;
        let interval = config.commit_interval;
        Ok(config.with_commit_interval(interval))
    }

    /// Read overrides from `FORGEBATCH_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`; malformed values keep the default.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_restartable_jobs = lookup(ENV_NON_RESTARTABLE_JOBS)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            commit_interval: parse_or(&lookup, ENV_COMMIT_INTERVAL, defaults.commit_interval).max(1),
            retry_limit: parse_or(&lookup, ENV_RETRY_LIMIT, defaults.retry_limit),
            skip_limit: parse_or(&lookup, ENV_SKIP_LIMIT, defaults.skip_limit),
            retry_cache_capacity: parse_or(
                &lookup,
                ENV_RETRY_CACHE_CAPACITY,
                defaults.retry_cache_capacity,
            ),
            non_restartable_jobs,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, default = %default, "ignoring malformed configuration value");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn reads_overrides() {
        let config = BatchConfig::from_env_with(lookup(&[
            (ENV_COMMIT_INTERVAL, "25"),
            (ENV_SKIP_LIMIT, "4"),
            (ENV_NON_RESTARTABLE_JOBS, "payroll, ledger-close ,"),
        ]));

        assert_eq!(config.commit_interval, 25);
        assert_eq!(config.skip_limit, 4);
        assert_eq!(config.retry_limit, 3);
        assert!(!config.is_restartable("payroll"));
        assert!(!config.is_restartable("ledger-close"));
        assert!(config.is_restartable("import"));
    }

    #[test]
    fn malformed_values_fall_back_to_defaults() {
        let config = BatchConfig::from_env_with(lookup(&[
            (ENV_COMMIT_INTERVAL, "lots"),
            (ENV_RETRY_LIMIT, "-1"),
        ]));

        assert_eq!(config, BatchConfig::default());
    }

    #[test]
    fn json_document_fills_missing_fields_with_defaults() {
        let config = BatchConfig::from_json(
            r#"{"commit_interval": 0, "non_restartable_jobs": ["payroll"]}"#,
        )
        .unwrap();

        assert_eq!(config.commit_interval, 1);
        assert_eq!(config.retry_cache_capacity, DEFAULT_CAPACITY);
        assert!(!config.is_restartable("payroll"));
        assert!(BatchConfig::from_json(r#"{"retry_limit": "three"}"#).is_err());
    }

    #[test]
    fn commit_interval_is_at_least_one() {
        assert_eq!(BatchConfig::default().with_commit_interval(0).commit_interval, 1);
        let config = BatchConfig::from_env_with(lookup(&[(ENV_COMMIT_INTERVAL, "0")]));
        assert_eq!(config.commit_interval, 1);
    }
}
