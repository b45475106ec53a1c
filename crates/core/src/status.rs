//! Lifecycle status and exit status of executions.
//!
//! `BatchStatus` is the lifecycle of a job or step execution and is ordered so
//! that reconciling a stale in-memory record against the persisted one can only
//! ever raise it. `ExitStatus` is the outcome reported to whoever launched the
//! job: a code plus a human-readable description.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job or step execution.
///
/// The declaration order is the upgrade order:
/// `STARTING < STARTED < STOPPING < STOPPED < COMPLETED < FAILED < ABANDONED < UNKNOWN`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
    Completed,
    Failed,
    Abandoned,
    /// Outcome cannot be trusted (e.g. bookkeeping failed after a commit).
    Unknown,
}

impl BatchStatus {
    /// Whether an execution in this status blocks a new execution of the same instance.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    /// Reconcile with another status, never lowering the current one.
    ///
    /// `UNKNOWN` is the maximum and therefore sticky.
    pub fn upgrade_to(self, other: BatchStatus) -> BatchStatus {
        self.max(other)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
            BatchStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome code plus description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    code: String,
    description: String,
}

impl ExitStatus {
    pub const EXECUTING: &'static str = "EXECUTING";
    pub const COMPLETED: &'static str = "COMPLETED";
    pub const NOOP: &'static str = "NOOP";
    pub const STOPPED: &'static str = "STOPPED";
    pub const FAILED: &'static str = "FAILED";
    pub const UNKNOWN: &'static str = "UNKNOWN";

    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: String::new(),
        }
    }

    pub fn executing() -> Self {
        Self::new(Self::EXECUTING)
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED)
    }

    pub fn noop() -> Self {
        Self::new(Self::NOOP)
    }

    pub fn stopped() -> Self {
        Self::new(Self::STOPPED)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED)
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Append to the description, separating entries with `"; "`.
    pub fn with_description(mut self, description: impl AsRef<str>) -> Self {
        let description = description.as_ref();
        if description.is_empty() {
            return self;
        }
        if self.description.is_empty() {
            self.description = description.to_string();
        } else if !self.description.contains(description) {
            self.description.push_str("; ");
            self.description.push_str(description);
        }
        self
    }

    /// Combine two exit statuses: the more severe code wins, descriptions are joined.
    pub fn and(self, other: ExitStatus) -> ExitStatus {
        let description = other.description.clone();
        let combined = if other.severity() > self.severity() {
            ExitStatus {
                code: other.code,
                description: self.description,
            }
        } else {
            self
        };
        combined.with_description(description)
    }

    pub fn is_running(&self) -> bool {
        self.code == Self::EXECUTING
    }

    fn severity(&self) -> u8 {
        match self.code.as_str() {
            Self::EXECUTING => 1,
            Self::COMPLETED => 2,
            Self::NOOP => 3,
            Self::STOPPED => 4,
            Self::FAILED => 5,
            Self::UNKNOWN => 6,
            _ => 7,
        }
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::executing()
    }
}

impl From<BatchStatus> for ExitStatus {
    fn from(status: BatchStatus) -> Self {
        match status {
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping => {
                ExitStatus::executing()
            }
            BatchStatus::Stopped => ExitStatus::stopped(),
            BatchStatus::Completed => ExitStatus::completed(),
            BatchStatus::Failed | BatchStatus::Abandoned => ExitStatus::failed(),
            BatchStatus::Unknown => ExitStatus::unknown(),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.description)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [BatchStatus; 8] = [
        BatchStatus::Starting,
        BatchStatus::Started,
        BatchStatus::Stopping,
        BatchStatus::Stopped,
        BatchStatus::Completed,
        BatchStatus::Failed,
        BatchStatus::Abandoned,
        BatchStatus::Unknown,
    ];

    #[test]
    fn upgrade_raises_to_stopping() {
        assert_eq!(
            BatchStatus::Started.upgrade_to(BatchStatus::Stopping),
            BatchStatus::Stopping
        );
    }

    #[test]
    fn unknown_is_sticky() {
        assert_eq!(
            BatchStatus::Unknown.upgrade_to(BatchStatus::Started),
            BatchStatus::Unknown
        );
    }

    #[test]
    fn running_statuses() {
        let running: Vec<_> = ALL.iter().copied().filter(|s| s.is_running()).collect();
        assert_eq!(
            running,
            vec![
                BatchStatus::Starting,
                BatchStatus::Started,
                BatchStatus::Stopping
            ]
        );
    }

    #[test]
    fn serializes_as_upper_case() {
        let json = serde_json::to_string(&BatchStatus::Stopping).unwrap();
        assert_eq!(json, "\"STOPPING\"");
    }

    #[test]
    fn and_keeps_more_severe_code_and_joins_descriptions() {
        let combined = ExitStatus::completed()
            .with_description("chunk ok")
            .and(ExitStatus::failed().with_description("listener blew up"));
        assert_eq!(combined.code(), ExitStatus::FAILED);
        assert_eq!(combined.description(), "chunk ok; listener blew up");

        let combined = ExitStatus::failed().and(ExitStatus::completed());
        assert_eq!(combined.code(), ExitStatus::FAILED);
    }

    #[test]
    fn custom_codes_outrank_builtin_codes() {
        let combined = ExitStatus::failed().and(ExitStatus::new("COMPLETED WITH SKIPS"));
        assert_eq!(combined.code(), "COMPLETED WITH SKIPS");
    }

    proptest! {
        /// Property: upgrading never lowers the current status and is idempotent.
        #[test]
        fn upgrade_is_monotonic(a in 0usize..8, b in 0usize..8) {
            let (current, persisted) = (ALL[a], ALL[b]);
            let upgraded = current.upgrade_to(persisted);
            prop_assert!(upgraded >= current);
            prop_assert!(upgraded >= persisted);
            prop_assert_eq!(upgraded.upgrade_to(persisted), upgraded);
        }
    }
}
