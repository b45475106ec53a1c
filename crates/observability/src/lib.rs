//! Tracing setup shared by batch binaries and tests.

/// Subscriber installation (filters, formatters).
pub mod tracing;

pub use crate::tracing::{init, init_for_tests};
