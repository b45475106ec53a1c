//! Error classification by type, message or predicate.
//!
//! Failures reach the retry and skip machinery as `anyhow::Error`. A classifier
//! maps an error to a value (a bool for "retryable?", or a whole policy) by
//! walking an ordered list of rules; the first matching rule wins.

use std::fmt;
use std::sync::Arc;

/// Predicate over an error.
pub type ErrorPredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Matches an error or any error in its source chain.
#[derive(Clone)]
pub enum ErrorMatcher {
    Any,
    Type {
        name: &'static str,
        matches: fn(&anyhow::Error) -> bool,
    },
    MessageContains(String),
    Predicate(ErrorPredicate),
}

fn chain_contains<E>(err: &anyhow::Error) -> bool
where
    E: std::error::Error + Send + Sync + 'static,
{
    err.chain().any(|cause| cause.is::<E>())
}

impl ErrorMatcher {
    /// Match errors of type `E` anywhere in the chain.
    pub fn of<E>() -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Type {
            name: std::any::type_name::<E>(),
            matches: chain_contains::<E>,
        }
    }

    pub fn message_contains(fragment: impl Into<String>) -> Self {
        Self::MessageContains(fragment.into())
    }

    pub fn predicate(f: impl Fn(&anyhow::Error) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    pub fn matches(&self, err: &anyhow::Error) -> bool {
        match self {
            ErrorMatcher::Any => true,
            ErrorMatcher::Type { matches, .. } => matches(err),
            ErrorMatcher::MessageContains(fragment) => err
                .chain()
                .any(|cause| cause.to_string().contains(fragment.as_str())),
            ErrorMatcher::Predicate(f) => f(err),
        }
    }
}

impl fmt::Debug for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMatcher::Any => f.write_str("Any"),
            ErrorMatcher::Type { name, .. } => f.debug_tuple("Type").field(name).finish(),
            ErrorMatcher::MessageContains(s) => f.debug_tuple("MessageContains").field(s).finish(),
            ErrorMatcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Ordered rules mapping errors to values, with a default.
#[derive(Debug, Clone)]
pub struct ErrorClassifier<T> {
    rules: Vec<(ErrorMatcher, T)>,
    default: T,
}

impl<T> ErrorClassifier<T> {
    pub fn new(default: T) -> Self {
        Self {
            rules: Vec::new(),
            default,
        }
    }

    pub fn with_rule(mut self, matcher: ErrorMatcher, value: T) -> Self {
        self.rules.push((matcher, value));
        self
    }

    pub fn classify(&self, err: &anyhow::Error) -> &T {
        self.value_at(self.classify_index(err))
    }

    /// Index of the matching rule; `rule_count()` stands for the default.
    pub fn classify_index(&self, err: &anyhow::Error) -> usize {
        self.rules
            .iter()
            .position(|(matcher, _)| matcher.matches(err))
            .unwrap_or(self.rule_count())
    }

    pub fn value_at(&self, index: usize) -> &T {
        self.rules
            .get(index)
            .map(|(_, value)| value)
            .unwrap_or(&self.default)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl ErrorClassifier<bool> {
    /// Every error classifies as `true`.
    pub fn always() -> Self {
        Self::new(true)
    }

    /// Every error classifies as `false`.
    pub fn never() -> Self {
        Self::new(false)
    }

    /// Only the listed matchers classify as `true`.
    pub fn only(matchers: impl IntoIterator<Item = ErrorMatcher>) -> Self {
        matchers
            .into_iter()
            .fold(Self::never(), |c, m| c.with_rule(m, true))
    }

    /// Everything except the listed matchers classifies as `true`.
    pub fn except(matchers: impl IntoIterator<Item = ErrorMatcher>) -> Self {
        matchers
            .into_iter()
            .fold(Self::always(), |c, m| c.with_rule(m, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[derive(Debug, thiserror::Error)]
    #[error("deadlock detected")]
    struct Deadlock;

    #[derive(Debug, thiserror::Error)]
    #[error("bad record")]
    struct BadRecord;

    #[test]
    fn type_matcher_walks_the_chain() {
        let err = Err::<(), _>(Deadlock)
            .context("writing chunk")
            .unwrap_err();

        assert!(ErrorMatcher::of::<Deadlock>().matches(&err));
        assert!(!ErrorMatcher::of::<BadRecord>().matches(&err));
    }

    #[test]
    fn first_matching_rule_wins() {
        let classifier = ErrorClassifier::new("default")
            .with_rule(ErrorMatcher::of::<Deadlock>(), "transient")
            .with_rule(ErrorMatcher::Any, "fatal");

        assert_eq!(*classifier.classify(&anyhow::Error::new(Deadlock)), "transient");
        assert_eq!(*classifier.classify(&anyhow::Error::new(BadRecord)), "fatal");
        assert_eq!(classifier.classify_index(&anyhow::Error::new(BadRecord)), 1);
    }

    #[test]
    fn only_and_except() {
        let only = ErrorClassifier::only([ErrorMatcher::message_contains("deadlock")]);
        assert!(*only.classify(&anyhow::Error::new(Deadlock)));
        assert!(!*only.classify(&anyhow::anyhow!("disk full")));

        let except = ErrorClassifier::except([ErrorMatcher::of::<BadRecord>()]);
        assert!(!*except.classify(&anyhow::Error::new(BadRecord)));
        assert!(*except.classify(&anyhow::anyhow!("anything else")));
    }
}
