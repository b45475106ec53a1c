//! Persistence contract required by the job repository.
//!
//! `ExecutionStore` is a data-access boundary with no identity rules of its
//! own beyond what it needs to guarantee atomically: instance key uniqueness,
//! the guarded insert of a job execution, and version checks on update. The
//! lifecycle rules live in [`SimpleJobRepository`](super::SimpleJobRepository).

use std::sync::Arc;

use thiserror::Error;

use forgebatch_core::{
    ExecutionContext, ExpectedVersion, JobExecution, JobExecutionId, JobInstance, JobInstanceId,
    JobKey, StepExecution, StepExecutionId,
};

/// Store operation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("duplicate {0}")]
    Duplicate(String),

    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Which execution an [`ExecutionContext`] belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContextOwner {
    Job(JobExecutionId),
    Step(StepExecutionId),
}

/// Storage backend for execution records.
///
/// Records are returned with their persisted execution context attached.
/// `update_*` calls persist everything except the context, which only moves
/// through [`save_execution_context`](Self::save_execution_context).
pub trait ExecutionStore: Send + Sync {
    fn find_job_instance(
        &self,
        job_name: &str,
        job_key: &JobKey,
    ) -> Result<Option<JobInstance>, StoreError>;

    fn get_job_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, StoreError>;

    /// Fails with `Duplicate` if an instance with the same name and key exists.
    fn create_job_instance(&self, instance: &JobInstance) -> Result<(), StoreError>;

    /// Executions of an instance in creation order.
    fn job_executions(&self, instance_id: JobInstanceId) -> Result<Vec<JobExecution>, StoreError>;

    /// Insert a new execution and its context.
    ///
    /// Atomically checks that the instance has exactly `expected` executions
    /// and none of them is running; fails with `Concurrency` otherwise.
    fn insert_job_execution(
        &self,
        execution: &mut JobExecution,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    /// Persist a job execution; rejects stale versions and bumps the version.
    fn update_job_execution(&self, execution: &mut JobExecution) -> Result<(), StoreError>;

    fn get_job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecution>, StoreError>;

    fn insert_step_execution(&self, step: &mut StepExecution) -> Result<(), StoreError>;

    /// Persist a step execution; rejects stale versions and bumps the version.
    fn update_step_execution(&self, step: &mut StepExecution) -> Result<(), StoreError>;

    fn get_step_execution(&self, id: StepExecutionId) -> Result<Option<StepExecution>, StoreError>;

    /// Steps of a job execution in creation order.
    fn step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>, StoreError>;

    fn save_execution_context(
        &self,
        owner: ContextOwner,
        context: &ExecutionContext,
    ) -> Result<(), StoreError>;

    fn load_execution_context(
        &self,
        owner: ContextOwner,
    ) -> Result<Option<ExecutionContext>, StoreError>;

    /// Remove a job execution with its steps and contexts.
    fn delete_job_execution(&self, id: JobExecutionId) -> Result<(), StoreError>;

    /// Remove an instance with all of its executions.
    fn delete_job_instance(&self, id: JobInstanceId) -> Result<(), StoreError>;
}

impl<S> ExecutionStore for Arc<S>
where
    S: ExecutionStore + ?Sized,
{
    fn find_job_instance(
        &self,
        job_name: &str,
        job_key: &JobKey,
    ) -> Result<Option<JobInstance>, StoreError> {
        (**self).find_job_instance(job_name, job_key)
    }

    fn get_job_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, StoreError> {
        (**self).get_job_instance(id)
    }

    fn create_job_instance(&self, instance: &JobInstance) -> Result<(), StoreError> {
        (**self).create_job_instance(instance)
    }

    fn job_executions(&self, instance_id: JobInstanceId) -> Result<Vec<JobExecution>, StoreError> {
        (**self).job_executions(instance_id)
    }

    fn insert_job_execution(
        &self,
        execution: &mut JobExecution,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        (**self).insert_job_execution(execution, expected)
    }

    fn update_job_execution(&self, execution: &mut JobExecution) -> Result<(), StoreError> {
        (**self).update_job_execution(execution)
    }

    fn get_job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecution>, StoreError> {
        (**self).get_job_execution(id)
    }

    fn insert_step_execution(&self, step: &mut StepExecution) -> Result<(), StoreError> {
        (**self).insert_step_execution(step)
    }

    fn update_step_execution(&self, step: &mut StepExecution) -> Result<(), StoreError> {
        (**self).update_step_execution(step)
    }

    fn get_step_execution(&self, id: StepExecutionId) -> Result<Option<StepExecution>, StoreError> {
        (**self).get_step_execution(id)
    }

    fn step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>, StoreError> {
        (**self).step_executions(job_execution_id)
    }

    fn save_execution_context(
        &self,
        owner: ContextOwner,
        context: &ExecutionContext,
    ) -> Result<(), StoreError> {
        (**self).save_execution_context(owner, context)
    }

    fn load_execution_context(
        &self,
        owner: ContextOwner,
    ) -> Result<Option<ExecutionContext>, StoreError> {
        (**self).load_execution_context(owner)
    }

    fn delete_job_execution(&self, id: JobExecutionId) -> Result<(), StoreError> {
        (**self).delete_job_execution(id)
    }

    fn delete_job_instance(&self, id: JobInstanceId) -> Result<(), StoreError> {
        (**self).delete_job_instance(id)
    }
}
