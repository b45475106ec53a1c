//! Job repository: identity and lifecycle rules for execution records.
//!
//! The repository is the only component allowed to mutate persisted
//! execution state. It enforces the identity invariants (one instance per job
//! name and key, at most one running execution per instance) on top of an
//! [`ExecutionStore`] that only knows how to persist records.

pub mod in_memory;
pub mod simple;
pub mod store;

pub use in_memory::InMemoryExecutionStore;
pub use simple::SimpleJobRepository;
pub use store::{ContextOwner, ExecutionStore, StoreError};

use thiserror::Error;

use forgebatch_core::{
    ExecutionContext, JobExecution, JobInstance, JobParameters, StepExecution,
};

/// Repository operation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("a job execution for this job is already running: {0}")]
    AlreadyRunning(String),

    #[error("job instance already complete: {0}")]
    InstanceAlreadyComplete(String),

    #[error("job instance cannot be restarted: {0}")]
    Restart(String),

    #[error("job instance already exists: {0}")]
    DuplicateInstance(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("optimistic locking failure: {0}")]
    OptimisticLock(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for RepositoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => RepositoryError::NotFound(err.to_string()),
            StoreError::Duplicate(msg) => RepositoryError::DuplicateInstance(msg),
            StoreError::Concurrency(msg) => RepositoryError::OptimisticLock(msg),
            StoreError::Storage(msg) => RepositoryError::Storage(msg),
        }
    }
}

/// Operations the engine may perform against persisted execution state.
pub trait JobRepository: Send + Sync {
    fn is_job_instance_exists(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<bool, RepositoryError>;

    /// Fails with `DuplicateInstance` if the instance already exists.
    fn create_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobInstance, RepositoryError>;

    fn job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>, RepositoryError>;

    /// Create and persist a STARTING execution of `instance`.
    fn create_job_execution(
        &self,
        instance: &JobInstance,
        parameters: JobParameters,
        context: ExecutionContext,
    ) -> Result<JobExecution, RepositoryError>;

    /// Find or create the instance, then create an execution that carries
    /// the last execution's context forward.
    fn create_job_execution_by_name(
        &self,
        job_name: &str,
        parameters: JobParameters,
    ) -> Result<JobExecution, RepositoryError>;

    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, RepositoryError>;

    /// Executions of `instance` in creation order.
    fn job_executions(&self, instance: &JobInstance) -> Result<Vec<JobExecution>, RepositoryError>;

    /// Create and persist a STARTING step execution linked to `job_execution`.
    fn create_step_execution(
        &self,
        step_name: &str,
        job_execution: &mut JobExecution,
    ) -> Result<StepExecution, RepositoryError>;

    fn step_executions(
        &self,
        job_execution: &JobExecution,
    ) -> Result<Vec<StepExecution>, RepositoryError>;

    /// Persist a job execution after reconciling its status with the stored one.
    fn update_job_execution(&self, execution: &mut JobExecution) -> Result<(), RepositoryError>;

    /// Persist a step execution; sets `terminate_only` when its job is stopping.
    fn update_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError>;

    /// Persist the job execution's context if it is dirty.
    fn update_job_execution_context(
        &self,
        execution: &mut JobExecution,
    ) -> Result<(), RepositoryError>;

    /// Persist the step execution's context if it is dirty.
    fn update_step_execution_context(&self, step: &mut StepExecution) -> Result<(), RepositoryError>;

    fn step_execution_count(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<usize, RepositoryError>;

    fn last_step_execution(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError>;

    /// Raise the in-memory status to the persisted one if that is higher,
    /// and adopt the persisted version.
    fn synchronize_status(&self, execution: &mut JobExecution) -> Result<(), RepositoryError>;

    /// Cascading delete. Does not check whether the execution is running.
    fn delete_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError>;

    /// Cascading delete of the instance and all of its executions.
    fn delete_job_instance(&self, instance: &JobInstance) -> Result<(), RepositoryError>;
}
