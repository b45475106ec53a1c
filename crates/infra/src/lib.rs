//! Batch runtime: execution repository, chunk-oriented steps and jobs.
//!
//! The repository owns every persisted execution record and enforces the
//! identity rules between job instances and executions. Steps report
//! progress through it after each committed chunk; jobs run steps in order
//! and use the recorded history to decide what a restart skips or resumes.

pub mod config;
pub mod job;
pub mod repository;
pub mod step;


pub use config::BatchConfig;
pub use job::{JobError, SimpleJob, SimpleJobBuilder};
pub use repository::{
    ContextOwner, ExecutionStore, InMemoryExecutionStore, JobRepository, RepositoryError,
    SimpleJobRepository, StoreError,
};
pub use step::{
    ChunkStep, ChunkStepBuilder, CompletionPolicy, ItemProcessor, ItemReader, ItemStream,
    ItemWriter, ListItemWriter, PassThroughItemProcessor, ResourcelessTransactionManager,
    SkipPolicy, Step, StepError, StepExecutionListener, StopSignal, TransactionManager,
    VecItemReader,
};
