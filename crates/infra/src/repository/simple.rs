use chrono::Utc;
use tracing::{debug, info};

use forgebatch_core::{
    BatchStatus, ExecutionContext, ExpectedVersion, JobExecution, JobInstance, JobKey,
    JobParameters, StepExecution,
};

use super::store::{ContextOwner, ExecutionStore, StoreError};
use super::{JobRepository, RepositoryError};
use crate::config::BatchConfig;

/// Job repository over any [`ExecutionStore`].
#[derive(Debug)]
pub struct SimpleJobRepository<S> {
    store: S,
    config: BatchConfig,
}

impl<S: ExecutionStore> SimpleJobRepository<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, BatchConfig::default())
    }

    pub fn with_config(store: S, config: BatchConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Set `terminate_only` when the step or its parent job is stopping.
    fn check_for_interruption(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        let job_stopping = self
            .store
            .get_job_execution(step.job_execution_id)?
            .is_some_and(|job| job.is_stopping());

        if (job_stopping || step.status == BatchStatus::Stopping) && !step.is_terminate_only() {
            info!(
                step_name = %step.step_name,
                step_execution_id = %step.id,
                "stop requested, step will terminate at the next chunk boundary"
            );
            step.set_terminate_only();
        }
        Ok(())
    }

    fn all_step_executions(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let mut steps = Vec::new();
        for execution in self.store.job_executions(instance.id)? {
            steps.extend(
                self.store
                    .step_executions(execution.id)?
                    .into_iter()
                    .filter(|s| s.step_name == step_name),
            );
        }
        Ok(steps)
    }
}

impl<S: ExecutionStore> JobRepository for SimpleJobRepository<S> {
    fn is_job_instance_exists(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<bool, RepositoryError> {
        Ok(self.job_instance(job_name, parameters)?.is_some())
    }

    fn create_job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobInstance, RepositoryError> {
        let instance = JobInstance::new(job_name, parameters);
        self.store.create_job_instance(&instance)?;
        info!(
            job_name,
            job_instance_id = %instance.id,
            job_key = %instance.job_key,
            "job instance created"
        );
        Ok(instance)
    }

    fn job_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>, RepositoryError> {
        let key = JobKey::generate(job_name, parameters);
        Ok(self.store.find_job_instance(job_name, &key)?)
    }

    fn create_job_execution(
        &self,
        instance: &JobInstance,
        parameters: JobParameters,
        context: ExecutionContext,
    ) -> Result<JobExecution, RepositoryError> {
        let existing = self.store.job_executions(instance.id)?;

        if let Some(running) = existing.iter().find(|e| e.is_running()) {
            return Err(RepositoryError::AlreadyRunning(format!(
                "job '{}' execution {} is {}",
                instance.job_name, running.id, running.status
            )));
        }
        if let Some(abandoned) = existing.iter().find(|e| e.status == BatchStatus::Abandoned) {
            return Err(RepositoryError::InstanceAlreadyComplete(format!(
                "job '{}' instance {} has an abandoned execution {}",
                instance.job_name, instance.id, abandoned.id
            )));
        }
        if !self.config.is_restartable(&instance.job_name)
            && existing.iter().any(|e| e.status == BatchStatus::Completed)
        {
            return Err(RepositoryError::InstanceAlreadyComplete(format!(
                "job '{}' is not restartable and instance {} has completed",
                instance.job_name, instance.id
            )));
        }
        if let Some(last) = existing.last().filter(|e| e.status == BatchStatus::Unknown) {
            return Err(RepositoryError::Restart(format!(
                "last execution {} of job '{}' ended UNKNOWN; resolve it before restarting",
                last.id, instance.job_name
            )));
        }

        let mut execution = JobExecution::new(instance, parameters, context);
        execution.last_updated = Some(Utc::now());
        let expected = ExpectedVersion::Exact(existing.len() as u64);
        match self.store.insert_job_execution(&mut execution, expected) {
            Ok(()) => {}
            Err(StoreError::Concurrency(msg)) => {
                return Err(RepositoryError::AlreadyRunning(format!(
                    "job '{}' was launched concurrently: {msg}",
                    instance.job_name
                )));
            }
            Err(e) => return Err(e.into()),
        }
        execution.execution_context.clear_dirty_flag();

        info!(
            job_name = %instance.job_name,
            job_instance_id = %instance.id,
            job_execution_id = %execution.id,
            attempt = existing.len() + 1,
            "job execution created"
        );
        Ok(execution)
    }

    fn create_job_execution_by_name(
        &self,
        job_name: &str,
        parameters: JobParameters,
    ) -> Result<JobExecution, RepositoryError> {
        let (instance, context) = match self.job_instance(job_name, &parameters)? {
            Some(instance) => {
                let context = self
                    .store
                    .job_executions(instance.id)?
                    .pop()
                    .map(|last| last.execution_context)
                    .unwrap_or_default();
                (instance, context)
            }
            None => (
                self.create_job_instance(job_name, &parameters)?,
                ExecutionContext::new(),
            ),
        };
        self.create_job_execution(&instance, parameters, context)
    }

    fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        match self.job_instance(job_name, parameters)? {
            Some(instance) => Ok(self.store.job_executions(instance.id)?.pop()),
            None => Ok(None),
        }
    }

    fn job_executions(&self, instance: &JobInstance) -> Result<Vec<JobExecution>, RepositoryError> {
        Ok(self.store.job_executions(instance.id)?)
    }

    fn create_step_execution(
        &self,
        step_name: &str,
        job_execution: &mut JobExecution,
    ) -> Result<StepExecution, RepositoryError> {
        let mut step = StepExecution::new(step_name, job_execution.id);
        step.last_updated = Some(Utc::now());
        self.store.insert_step_execution(&mut step)?;
        step.execution_context.clear_dirty_flag();
        job_execution.step_execution_ids.push(step.id);

        debug!(
            step_name,
            step_execution_id = %step.id,
            job_execution_id = %job_execution.id,
            "step execution created"
        );
        Ok(step)
    }

    fn step_executions(
        &self,
        job_execution: &JobExecution,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        Ok(self.store.step_executions(job_execution.id)?)
    }

    fn update_job_execution(&self, execution: &mut JobExecution) -> Result<(), RepositoryError> {
        self.synchronize_status(execution)?;
        execution.last_updated = Some(Utc::now());
        self.store.update_job_execution(execution)?;
        debug!(
            job_execution_id = %execution.id,
            status = %execution.status,
            version = execution.version,
            "job execution updated"
        );
        Ok(())
    }

    fn update_step_execution(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        step.last_updated = Some(Utc::now());
        self.store.update_step_execution(step)?;
        self.check_for_interruption(step)
    }

    fn update_job_execution_context(
        &self,
        execution: &mut JobExecution,
    ) -> Result<(), RepositoryError> {
        if !execution.execution_context.is_dirty() {
            return Ok(());
        }
        self.store
            .save_execution_context(ContextOwner::Job(execution.id), &execution.execution_context)?;
        execution.execution_context.clear_dirty_flag();
        Ok(())
    }

    fn update_step_execution_context(&self, step: &mut StepExecution) -> Result<(), RepositoryError> {
        if !step.execution_context.is_dirty() {
            return Ok(());
        }
        self.store
            .save_execution_context(ContextOwner::Step(step.id), &step.execution_context)?;
        step.execution_context.clear_dirty_flag();
        Ok(())
    }

    fn step_execution_count(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<usize, RepositoryError> {
        Ok(self.all_step_executions(instance, step_name)?.len())
    }

    fn last_step_execution(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        Ok(self
            .all_step_executions(instance, step_name)?
            .into_iter()
            .max_by_key(|s| (s.created_at, s.id)))
    }

    fn synchronize_status(&self, execution: &mut JobExecution) -> Result<(), RepositoryError> {
        let persisted = self
            .store
            .get_job_execution(execution.id)?
            .ok_or_else(|| RepositoryError::NotFound(format!("job execution {}", execution.id)))?;

        if persisted.version != execution.version {
            let before = execution.status;
            execution.upgrade_status(persisted.status);
            execution.version = persisted.version;
            if execution.status != before {
                debug!(
                    job_execution_id = %execution.id,
                    from = %before,
                    to = %execution.status,
                    "job execution status synchronized"
                );
            }
        }
        Ok(())
    }

    fn delete_job_execution(&self, execution: &JobExecution) -> Result<(), RepositoryError> {
        self.store.delete_job_execution(execution.id)?;
        Ok(())
    }

    fn delete_job_instance(&self, instance: &JobInstance) -> Result<(), RepositoryError> {
        self.store.delete_job_instance(instance.id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryExecutionStore;
    use forgebatch_core::{ExitStatus, ParameterValue};
    use std::sync::Arc;

    fn repository() -> SimpleJobRepository<Arc<InMemoryExecutionStore>> {
        SimpleJobRepository::new(Arc::new(InMemoryExecutionStore::new()))
    }

    fn params() -> JobParameters {
        JobParameters::builder().string("name", "foo").build().unwrap()
    }

    fn finish(repo: &impl JobRepository, execution: &mut JobExecution, status: BatchStatus) {
        execution.mark_ended(status, status.into());
        repo.update_job_execution(execution).unwrap();
    }

    #[test]
    fn second_instance_with_same_identity_is_duplicate() {
        let repo = repository();
        let a = JobParameters::builder()
            .string("name", "foo")
            .non_identifying("shouldfail", ParameterValue::Bool(true))
            .build()
            .unwrap();
        let b = JobParameters::builder()
            .string("name", "foo")
            .non_identifying("shouldfail", ParameterValue::Bool(false))
            .build()
            .unwrap();

        repo.create_job_instance("import", &a).unwrap();
        assert!(matches!(
            repo.create_job_instance("import", &b),
            Err(RepositoryError::DuplicateInstance(_))
        ));
        assert!(repo.is_job_instance_exists("import", &b).unwrap());
    }

    #[test]
    fn running_execution_blocks_a_new_one_until_it_ends() {
        let repo = repository();
        let instance = repo.create_job_instance("import", &params()).unwrap();
        let mut first = repo
            .create_job_execution(&instance, params(), ExecutionContext::new())
            .unwrap();
        assert_eq!(first.status, BatchStatus::Starting);

        let err = repo
            .create_job_execution(&instance, params(), ExecutionContext::new())
            .unwrap_err();
        assert!(matches!(err, RepositoryError::AlreadyRunning(_)));

        finish(&repo, &mut first, BatchStatus::Failed);
        let second = repo
            .create_job_execution(&instance, params(), ExecutionContext::new())
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(repo.job_executions(&instance).unwrap().len(), 2);
    }

    #[test]
    fn completed_non_restartable_instance_is_rejected() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let repo = SimpleJobRepository::with_config(
            store,
            BatchConfig::default().with_non_restartable("payroll"),
        );
        let instance = repo.create_job_instance("payroll", &params()).unwrap();
        let mut first = repo
            .create_job_execution(&instance, params(), ExecutionContext::new())
            .unwrap();
        finish(&repo, &mut first, BatchStatus::Completed);

        assert!(matches!(
            repo.create_job_execution(&instance, params(), ExecutionContext::new()),
            Err(RepositoryError::InstanceAlreadyComplete(_))
        ));
    }

    #[test]
    fn completed_restartable_instance_may_run_again() {
        let repo = repository();
        let instance = repo.create_job_instance("import", &params()).unwrap();
        let mut first = repo
            .create_job_execution(&instance, params(), ExecutionContext::new())
            .unwrap();
        finish(&repo, &mut first, BatchStatus::Completed);

        assert!(repo
            .create_job_execution(&instance, params(), ExecutionContext::new())
            .is_ok());
    }

    #[test]
    fn unknown_last_execution_blocks_restart() {
        let repo = repository();
        let instance = repo.create_job_instance("import", &params()).unwrap();
        let mut first = repo
            .create_job_execution(&instance, params(), ExecutionContext::new())
            .unwrap();
        finish(&repo, &mut first, BatchStatus::Unknown);

        assert!(matches!(
            repo.create_job_execution(&instance, params(), ExecutionContext::new()),
            Err(RepositoryError::Restart(_))
        ));
    }

    #[test]
    fn abandoned_execution_completes_the_instance() {
        let repo = repository();
        let instance = repo.create_job_instance("import", &params()).unwrap();
        let mut first = repo
            .create_job_execution(&instance, params(), ExecutionContext::new())
            .unwrap();
        finish(&repo, &mut first, BatchStatus::Abandoned);

        assert!(matches!(
            repo.create_job_execution(&instance, params(), ExecutionContext::new()),
            Err(RepositoryError::InstanceAlreadyComplete(_))
        ));
        assert!(matches!(
            repo.create_job_execution_by_name("import", params()),
            Err(RepositoryError::InstanceAlreadyComplete(_))
        ));
    }

    #[test]
    fn stopping_job_sets_terminate_only_on_step_update() {
        let repo = repository();
        let mut job = repo.create_job_execution_by_name("import", params()).unwrap();
        job.mark_started();
        repo.update_job_execution(&mut job).unwrap();
        let mut step = repo.create_step_execution("load", &mut job).unwrap();

        let mut operator_view = repo.get_last_job_execution("import", &params()).unwrap().unwrap();
        operator_view.stop();
        repo.update_job_execution(&mut operator_view).unwrap();

        assert!(!step.is_terminate_only());
        repo.update_step_execution(&mut step).unwrap();
        assert!(step.is_terminate_only());
        assert!(step.last_updated.is_some());
    }

    #[test]
    fn synchronize_status_only_raises() {
        let repo = repository();
        let mut job = repo.create_job_execution_by_name("import", params()).unwrap();
        job.mark_started();
        repo.update_job_execution(&mut job).unwrap();

        let mut stale = job.clone();
        job.stop();
        repo.update_job_execution(&mut job).unwrap();

        repo.synchronize_status(&mut stale).unwrap();
        assert_eq!(stale.status, BatchStatus::Stopping);
        assert_eq!(stale.version, job.version);

        let mut unknown = stale.clone();
        unknown.mark_ended(BatchStatus::Unknown, ExitStatus::unknown());
        repo.update_job_execution(&mut unknown).unwrap();
        stale.status = BatchStatus::Started;
        repo.synchronize_status(&mut stale).unwrap();
        assert_eq!(stale.status, BatchStatus::Unknown);
    }

    #[test]
    fn clean_context_is_not_persisted_again() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let repo = SimpleJobRepository::new(Arc::clone(&store));
        let mut job = repo.create_job_execution_by_name("import", params()).unwrap();
        let mut step = repo.create_step_execution("load", &mut job).unwrap();

        step.execution_context.put("offset", 10i64);
        repo.update_step_execution_context(&mut step).unwrap();
        let writes = store.context_write_count();
        assert!(!step.execution_context.is_dirty());

        repo.update_step_execution_context(&mut step).unwrap();
        assert_eq!(store.context_write_count(), writes);
        let stored = store
            .load_execution_context(ContextOwner::Step(step.id))
            .unwrap()
            .unwrap();
        assert_eq!(stored, step.execution_context);
    }

    #[test]
    fn resumed_execution_inherits_last_context() {
        let repo = repository();
        let mut first = repo.create_job_execution_by_name("import", params()).unwrap();
        first.execution_context.put("cursor", "page-7");
        repo.update_job_execution_context(&mut first).unwrap();
        finish(&repo, &mut first, BatchStatus::Failed);

        let second = repo.create_job_execution_by_name("import", params()).unwrap();
        assert_eq!(second.execution_context.get_string("cursor").unwrap(), "page-7");
        assert_eq!(second.job_instance_id, first.job_instance_id);
    }

    #[test]
    fn step_history_across_executions() {
        let repo = repository();
        let mut first = repo.create_job_execution_by_name("import", params()).unwrap();
        let mut step = repo.create_step_execution("load", &mut first).unwrap();
        step.execution_context.put("offset", 4i64);
        repo.update_step_execution_context(&mut step).unwrap();
        repo.create_step_execution("report", &mut first).unwrap();
        finish(&repo, &mut first, BatchStatus::Failed);

        let mut second = repo.create_job_execution_by_name("import", params()).unwrap();
        let retry = repo.create_step_execution("load", &mut second).unwrap();

        let instance = repo.job_instance("import", &params()).unwrap().unwrap();
        assert_eq!(repo.step_execution_count(&instance, "load").unwrap(), 2);
        assert_eq!(repo.step_execution_count(&instance, "report").unwrap(), 1);

        let last = repo.last_step_execution(&instance, "load").unwrap().unwrap();
        assert_eq!(last.id, retry.id);
        assert_eq!(second.step_execution_ids, vec![retry.id]);
    }

    #[test]
    fn deleting_an_execution_removes_its_steps() {
        let repo = repository();
        let mut job = repo.create_job_execution_by_name("import", params()).unwrap();
        repo.create_step_execution("load", &mut job).unwrap();

        repo.delete_job_execution(&job).unwrap();

        assert!(repo.step_executions(&job).unwrap().is_empty());
        assert!(repo.get_last_job_execution("import", &params()).unwrap().is_none());
    }
}
