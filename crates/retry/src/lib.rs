//! Retry subsystem for the batch engine.
//!
//! - [`RetryPolicy`]: closed set of policy variants (never, always, simple,
//!   timeout, composite, classifier)
//! - [`RetryTemplate`]: in-process retry, optionally with recovery
//! - [`StatefulRetryTemplate`]: retry across separate invocations, keyed by
//!   item identity and backed by a [`RetryContextCache`]
//! - [`BackoffPolicy`]: pause between in-process attempts

pub mod backoff;
pub mod cache;
pub mod classifier;
pub mod context;
pub mod error;
pub mod policy;
pub mod template;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use cache::{MapRetryContextCache, RetryContextCache, DEFAULT_CAPACITY};
pub use classifier::{ErrorClassifier, ErrorMatcher, ErrorPredicate};
pub use context::RetryContext;
pub use error::RetryError;
pub use policy::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
pub use template::{RetryOutcome, RetryState, RetryTemplate, StatefulRetryTemplate};
