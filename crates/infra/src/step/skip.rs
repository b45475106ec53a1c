//! Skip decisions for items that could not be read or processed.

use thiserror::Error;

use forgebatch_retry::{ErrorClassifier, ErrorMatcher};

/// Raised when a skippable failure arrives after the limit is used up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("skip limit of {limit} exceeded: {cause}")]
pub struct SkipLimitExceeded {
    pub limit: u64,
    pub cause: String,
}

#[derive(Debug, Clone, Default)]
pub enum SkipPolicy {
    /// Every failure fails the step.
    #[default]
    Never,
    /// Every failure is skipped.
    Always,
    /// Skippable failures are skipped until `limit` skips have been counted.
    Limit {
        limit: u64,
        skippable: ErrorClassifier<bool>,
    },
}

impl SkipPolicy {
    /// Skip any failure, up to `limit` times.
    pub fn limit(limit: u64) -> Self {
        SkipPolicy::Limit {
            limit,
            skippable: ErrorClassifier::always(),
        }
    }

    /// Skip only failures matching `matchers`, up to `limit` times.
    pub fn limit_for(limit: u64, matchers: impl IntoIterator<Item = ErrorMatcher>) -> Self {
        SkipPolicy::Limit {
            limit,
            skippable: ErrorClassifier::only(matchers),
        }
    }

    /// `skip_count` is the number of skips already counted for the step.
    pub fn should_skip(&self, err: &anyhow::Error, skip_count: u64) -> Result<bool, SkipLimitExceeded> {
        match self {
            SkipPolicy::Never => Ok(false),
            SkipPolicy::Always => Ok(true),
            SkipPolicy::Limit { limit, skippable } => {
                if !*skippable.classify(err) {
                    Ok(false)
                } else if skip_count < *limit {
                    Ok(true)
                } else {
                    Err(SkipLimitExceeded {
                        limit: *limit,
                        cause: format!("{err:#}"),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("malformed line")]
    struct Malformed;

    #[test]
    fn limit_is_enforced() {
        let policy = SkipPolicy::limit(2);
        let err = anyhow::Error::new(Malformed);

        assert_eq!(policy.should_skip(&err, 0), Ok(true));
        assert_eq!(policy.should_skip(&err, 1), Ok(true));
        assert_eq!(
            policy.should_skip(&err, 2),
            Err(SkipLimitExceeded {
                limit: 2,
                cause: "malformed line".to_string()
            })
        );
    }

    #[test]
    fn non_skippable_errors_are_not_counted_against_the_limit() {
        let policy = SkipPolicy::limit_for(5, [ErrorMatcher::of::<Malformed>()]);

        assert_eq!(policy.should_skip(&anyhow::anyhow!("disk full"), 0), Ok(false));
        assert_eq!(policy.should_skip(&anyhow::Error::new(Malformed), 0), Ok(true));
    }
}
