//! `forgebatch-core` — value types and execution records for the batch engine.
//!
//! This crate contains **pure domain** primitives (no storage, no IO): statuses,
//! parameters and the job key derived from them, execution contexts, and the
//! job/step execution records the repository persists.

pub mod context;
pub mod error;
pub mod execution;
pub mod id;
pub mod parameters;
pub mod status;
pub mod version;

pub use context::{ContextError, ContextValue, ExecutionContext};
pub use error::{DomainError, DomainResult};
pub use execution::{JobExecution, JobInstance, StepContribution, StepExecution};
pub use id::{JobExecutionId, JobInstanceId, StepExecutionId};
pub use parameters::{JobKey, JobParameter, JobParameters, JobParametersBuilder, ParameterValue};
pub use status::{BatchStatus, ExitStatus};
pub use version::ExpectedVersion;
