//! Ordered multi-step job with restart semantics.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, info_span, warn};

use forgebatch_core::{BatchStatus, ExitStatus, JobExecution, JobInstance, JobParameters};

use crate::repository::{JobRepository, RepositoryError};
use crate::step::{Step, StepError};

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("step '{0}' cannot be restarted from UNKNOWN status")]
    UnknownStepState(String),
}

/// Runs its steps in order, stopping at the first one that does not complete.
///
/// On a restart, steps whose last execution completed are skipped and a step
/// that did not complete resumes with its last ExecutionContext.
pub struct SimpleJob {
    name: String,
    steps: Vec<Box<dyn Step>>,
    repository: Arc<dyn JobRepository>,
}

impl std::fmt::Debug for SimpleJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleJob")
            .field("name", &self.name)
            .field("steps", &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

enum StepVerdict {
    Skipped,
    Completed(ExitStatus),
    /// The job ends with this status.
    Halt(BatchStatus, ExitStatus, Option<StepError>),
}

impl SimpleJob {
    pub fn builder(name: impl Into<String>, repository: Arc<dyn JobRepository>) -> SimpleJobBuilder {
        SimpleJobBuilder {
            name: name.into(),
            repository,
            steps: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create an execution for `parameters` and run it.
    pub fn run(&mut self, parameters: JobParameters) -> Result<JobExecution, JobError> {
        let mut execution = self
            .repository
            .create_job_execution_by_name(&self.name, parameters)?;
        self.execute(&mut execution)?;
        Ok(execution)
    }

    /// Run an execution created by the repository. The final status is
    /// recorded on `execution` even when an error is returned.
    pub fn execute(&mut self, execution: &mut JobExecution) -> Result<(), JobError> {
        let span = info_span!("job", job_name = %self.name, job_execution_id = %execution.id);
        let _guard = span.enter();

        let instance = self
            .repository
            .job_instance(&self.name, &execution.parameters)?
            .ok_or_else(|| {
                RepositoryError::NotFound(format!("job instance of {} for {}", self.name, execution.id))
            })?;

        execution.mark_started();
        self.repository.update_job_execution(execution)?;
        info!("job started");

        match self.run_steps(&instance, execution) {
            Ok((status, exit_status, escaped)) => {
                execution.mark_ended(status, exit_status);
                self.repository.update_job_execution_context(execution)?;
                self.repository.update_job_execution(execution)?;
                info!(status = %execution.status, exit_status = %execution.exit_status, "job finished");
                match escaped {
                    Some(err) => Err(err.into()),
                    None => Ok(()),
                }
            }
            Err(err) => {
                let description = err.to_string();
                execution.add_failure(description.clone());
                execution.mark_ended(
                    BatchStatus::Failed,
                    ExitStatus::failed().with_description(&description),
                );
                if let Err(update) = self.repository.update_job_execution(execution) {
                    warn!(error = %update, "could not record job failure");
                }
                warn!(error = %description, "job failed");
                Err(err)
            }
        }
    }

    fn run_steps(
        &mut self,
        instance: &JobInstance,
        execution: &mut JobExecution,
    ) -> Result<(BatchStatus, ExitStatus, Option<StepError>), JobError> {
        let mut exit_status = ExitStatus::noop();
        for step in &mut self.steps {
            self.repository.synchronize_status(execution)?;
            if execution.is_stopping() {
                info!(step_name = step.name(), "job stopped before step");
                return Ok((
                    BatchStatus::Stopped,
                    ExitStatus::stopped().with_description(format!("stopped before step {}", step.name())),
                    None,
                ));
            }

            match handle_step(self.repository.as_ref(), instance, execution, step.as_mut())? {
                StepVerdict::Skipped => {}
                StepVerdict::Completed(step_exit) => exit_status = step_exit,
                StepVerdict::Halt(status, exit, escaped) => return Ok((status, exit, escaped)),
            }
        }
        Ok((BatchStatus::Completed, exit_status, None))
    }
}

fn handle_step(
    repository: &dyn JobRepository,
    instance: &JobInstance,
    execution: &mut JobExecution,
    step: &mut dyn Step,
) -> Result<StepVerdict, JobError> {
    let name = step.name().to_string();
    let last = repository.last_step_execution(instance, &name)?;
    if let Some(last) = &last {
        match last.status {
            BatchStatus::Completed if !step.allow_start_if_complete() => {
                info!(step_name = %name, "step already complete, skipping");
                return Ok(StepVerdict::Skipped);
            }
            BatchStatus::Unknown => return Err(JobError::UnknownStepState(name)),
            _ => {}
        }
    }

    let count = repository.step_execution_count(instance, &name)?;
    if count >= step.start_limit() {
        let description = format!("start limit of {} exceeded for step {name}", step.start_limit());
        warn!(step_name = %name, count, "start limit exceeded");
        execution.add_failure(description.clone());
        return Ok(StepVerdict::Halt(
            BatchStatus::Failed,
            ExitStatus::failed().with_description(description),
            None,
        ));
    }

    let mut step_execution = repository.create_step_execution(&name, execution)?;
    if let Some(last) = last.filter(|last| last.status != BatchStatus::Completed) {
        step_execution.execution_context.replace_with(&last.execution_context);
        repository.update_step_execution_context(&mut step_execution)?;
        info!(step_name = %name, resumed_from = %last.id, "restoring step context");
    }

    let result = step.execute(&mut step_execution);
    if step_execution.status == BatchStatus::Completed {
        if let Err(err) = result {
            return Ok(StepVerdict::Halt(
                BatchStatus::Unknown,
                ExitStatus::unknown().with_description(err.to_string()),
                Some(err),
            ));
        }
        return Ok(StepVerdict::Completed(step_execution.exit_status));
    }
    match result {
        // The step gave up before it could record an outcome.
        Err(err) if step_execution.status.is_running() => {
            warn!(
                step_name = %name,
                status = %step_execution.status,
                error = %err,
                "step failed without recording an outcome"
            );
            let description = err.to_string();
            execution.add_failure(description.clone());
            Ok(StepVerdict::Halt(
                BatchStatus::Failed,
                ExitStatus::failed().with_description(description),
                Some(err),
            ))
        }
        result => Ok(StepVerdict::Halt(
            step_execution.status,
            step_execution.exit_status,
            result.err(),
        )),
    }
}

pub struct SimpleJobBuilder {
    name: String,
    repository: Arc<dyn JobRepository>,
    steps: Vec<Box<dyn Step>>,
}

impl SimpleJobBuilder {
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn build(self) -> SimpleJob {
        SimpleJob {
            name: self.name,
            steps: self.steps,
            repository: self.repository,
        }
    }
}
