//! Execution records: job instances, job executions and step executions.
//!
//! ## Ownership
//!
//! A `JobExecution` owns the *handles* of its step executions
//! (`step_execution_ids`), and each `StepExecution` refers back to its parent
//! by id only. Loading the step executions of a job execution is a repository
//! query, which keeps the records free of cyclic references.
//!
//! Only the repository assigns ids and versions and persists these records;
//! the mutators here change in-memory state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::id::{JobExecutionId, JobInstanceId, StepExecutionId};
use crate::parameters::{JobKey, JobParameters};
use crate::status::{BatchStatus, ExitStatus};

/// Unique logical job: job name plus identifying parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: JobInstanceId,
    pub job_name: String,
    pub job_key: JobKey,
    pub created_at: DateTime<Utc>,
}

impl JobInstance {
    pub fn new(job_name: impl Into<String>, parameters: &JobParameters) -> Self {
        let job_name = job_name.into();
        let job_key = JobKey::generate(&job_name, parameters);
        Self {
            id: JobInstanceId::new(),
            job_name,
            job_key,
            created_at: Utc::now(),
        }
    }
}

/// One attempt to run a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: JobExecutionId,
    pub job_instance_id: JobInstanceId,
    pub job_name: String,
    pub parameters: JobParameters,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub execution_context: ExecutionContext,
    pub step_execution_ids: Vec<StepExecutionId>,
    pub failure_messages: Vec<String>,
    /// Optimistic locking version, assigned by the store.
    pub version: u64,
}

impl JobExecution {
    pub fn new(
        instance: &JobInstance,
        parameters: JobParameters,
        execution_context: ExecutionContext,
    ) -> Self {
        Self {
            id: JobExecutionId::new(),
            job_instance_id: instance.id,
            job_name: instance.job_name.clone(),
            parameters,
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            last_updated: None,
            execution_context,
            step_execution_ids: Vec::new(),
            failure_messages: Vec::new(),
            version: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    pub fn is_stopping(&self) -> bool {
        self.status == BatchStatus::Stopping
    }

    pub fn mark_started(&mut self) {
        self.status = BatchStatus::Started;
        self.start_time = Some(Utc::now());
    }

    /// Request a cooperative stop; running steps see it on their next update.
    pub fn stop(&mut self) {
        if self.is_running() {
            self.status = BatchStatus::Stopping;
        }
    }

    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    pub fn mark_ended(&mut self, status: BatchStatus, exit_status: ExitStatus) {
        self.status = status;
        self.exit_status = exit_status;
        self.end_time = Some(Utc::now());
    }

    pub fn add_failure(&mut self, message: impl Into<String>) {
        self.failure_messages.push(message.into());
    }
}

/// Per-chunk counters, applied to the step execution on commit or rollback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepContribution {
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
}

impl StepContribution {
    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }
}

/// One attempt to run a named step within a job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: StepExecutionId,
    pub job_execution_id: JobExecutionId,
    pub step_name: String,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub execution_context: ExecutionContext,
    pub failure_messages: Vec<String>,
    terminate_only: bool,
    /// Optimistic locking version, assigned by the store.
    pub version: u64,
}

impl StepExecution {
    pub fn new(step_name: impl Into<String>, job_execution_id: JobExecutionId) -> Self {
        Self {
            id: StepExecutionId::new(),
            job_execution_id,
            step_name: step_name.into(),
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            read_count: 0,
            write_count: 0,
            filter_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            commit_count: 0,
            rollback_count: 0,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            failure_messages: Vec::new(),
            terminate_only: false,
            version: 0,
        }
    }

    pub fn mark_started(&mut self) {
        self.status = BatchStatus::Started;
        self.start_time = Some(Utc::now());
    }

    /// Apply a committed chunk.
    pub fn apply(&mut self, contribution: &StepContribution) {
        self.read_count += contribution.read_count;
        self.write_count += contribution.write_count;
        self.filter_count += contribution.filter_count;
        self.read_skip_count += contribution.read_skip_count;
        self.process_skip_count += contribution.process_skip_count;
        self.write_skip_count += contribution.write_skip_count;
        self.commit_count += 1;
    }

    /// Apply a rolled-back chunk.
    ///
    /// Items already read and items already skipped are never delivered again,
    /// so their counts survive the rollback; writes and filters do not.
    pub fn apply_rollback(&mut self, contribution: &StepContribution) {
        self.read_count += contribution.read_count;
        self.read_skip_count += contribution.read_skip_count;
        self.process_skip_count += contribution.process_skip_count;
        self.rollback_count += 1;
    }

    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    pub fn is_terminate_only(&self) -> bool {
        self.terminate_only
    }

    /// Ask the chunk loop to stop at the next chunk boundary.
    pub fn set_terminate_only(&mut self) {
        self.terminate_only = true;
    }

    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    pub fn add_failure(&mut self, message: impl Into<String>) {
        self.failure_messages.push(message.into());
    }

    pub fn mark_ended(&mut self, status: BatchStatus, exit_status: ExitStatus) {
        self.status = status;
        self.exit_status = exit_status;
        self.end_time = Some(Utc::now());
    }

    pub fn summary(&self) -> String {
        format!(
            "{} [{}]: read={}, written={}, filtered={}, skipped={}, commits={}, rollbacks={}",
            self.step_name,
            self.status,
            self.read_count,
            self.write_count,
            self.filter_count,
            self.skip_count(),
            self.commit_count,
            self.rollback_count
        )
    }
}
