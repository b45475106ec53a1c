//! Chunk-oriented step execution.
//!
//! A [`ChunkStep`] reads items until its [`CompletionPolicy`] says the chunk
//! is complete, processes them, writes the chunk in one call and commits. Each
//! chunk is one transaction: a failure before commit rolls the whole chunk
//! back, a failure while recording progress after commit is fatal.

pub mod chunk;
pub mod completion;
pub mod item;
pub mod listener;
pub mod skip;
pub mod transaction;

pub use chunk::{ChunkStep, ChunkStepBuilder};
pub use completion::{ChunkProgress, CompletionPolicy};
pub use item::{
    ItemProcessor, ItemReader, ItemStream, ItemWriter, ListItemWriter, PassThroughItemProcessor,
    VecItemReader,
};
pub use listener::{StepExecutionListener, StopSignal};
pub use skip::{SkipLimitExceeded, SkipPolicy};
pub use transaction::{ResourcelessTransactionManager, Transaction, TransactionManager};

use thiserror::Error;

use forgebatch_core::StepExecution;
use forgebatch_retry::RetryError;

use crate::repository::RepositoryError;

/// Failure that escapes a step execution.
///
/// Ordinary processing failures do not show up here: they are recorded on
/// the [`StepExecution`] (status FAILED or STOPPED plus exit description).
#[derive(Debug, Error)]
pub enum StepError {
    /// Progress could not be recorded after a commit; the step is UNKNOWN.
    #[error("step outcome unknown: {0}")]
    Fatal(String),

    /// Stateful retry bookkeeping is broken for an item key.
    #[error(transparent)]
    RetryConsistency(RetryError),

    #[error("step is misconfigured: {0}")]
    Configuration(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// A unit of work executed by a job.
pub trait Step: Send {
    fn name(&self) -> &str;

    /// Run again even when the last execution of this step completed.
    fn allow_start_if_complete(&self) -> bool {
        false
    }

    /// Maximum number of executions of this step per job instance.
    fn start_limit(&self) -> usize {
        usize::MAX
    }

    /// Execute against a step execution created by the repository. The final
    /// status and exit status are recorded on `step`.
    fn execute(&mut self, step: &mut StepExecution) -> Result<(), StepError>;
}
