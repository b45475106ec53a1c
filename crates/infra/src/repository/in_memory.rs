use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use forgebatch_core::{
    ExecutionContext, ExpectedVersion, JobExecution, JobExecutionId, JobInstance, JobInstanceId,
    JobKey, StepExecution, StepExecutionId,
};

use super::store::{ContextOwner, ExecutionStore, StoreError};

#[derive(Debug, Default)]
struct Tables {
    instances: HashMap<JobInstanceId, JobInstance>,
    instance_keys: HashMap<(String, JobKey), JobInstanceId>,
    job_executions: HashMap<JobExecutionId, JobExecution>,
    executions_by_instance: HashMap<JobInstanceId, Vec<JobExecutionId>>,
    step_executions: HashMap<StepExecutionId, StepExecution>,
    steps_by_job: HashMap<JobExecutionId, Vec<StepExecutionId>>,
    /// Contexts are held in their serialized form, like a real backend would.
    contexts: HashMap<ContextOwner, String>,
}

impl Tables {
    fn load_context(&self, owner: ContextOwner) -> Result<ExecutionContext, StoreError> {
        match self.contexts.get(&owner) {
            Some(json) => ExecutionContext::from_json(json)
                .map_err(|e| StoreError::Storage(e.to_string())),
            None => Ok(ExecutionContext::new()),
        }
    }

    fn attach_job(&self, stored: &JobExecution) -> Result<JobExecution, StoreError> {
        let mut execution = stored.clone();
        execution.execution_context = self.load_context(ContextOwner::Job(stored.id))?;
        execution.step_execution_ids = self
            .steps_by_job
            .get(&stored.id)
            .cloned()
            .unwrap_or_default();
        Ok(execution)
    }

    fn attach_step(&self, stored: &StepExecution) -> Result<StepExecution, StoreError> {
        let mut step = stored.clone();
        step.execution_context = self.load_context(ContextOwner::Step(stored.id))?;
        Ok(step)
    }

    fn remove_job_execution(&mut self, id: JobExecutionId) -> Option<JobExecution> {
        let removed = self.job_executions.remove(&id)?;
        for step_id in self.steps_by_job.remove(&id).unwrap_or_default() {
            self.step_executions.remove(&step_id);
            self.contexts.remove(&ContextOwner::Step(step_id));
        }
        self.contexts.remove(&ContextOwner::Job(id));
        if let Some(ids) = self.executions_by_instance.get_mut(&removed.job_instance_id) {
            ids.retain(|existing| *existing != id);
        }
        Some(removed)
    }
}

fn detached_context<T: Clone>(record: &T, clear: impl FnOnce(&mut T)) -> T {
    let mut stored = record.clone();
    clear(&mut stored);
    stored
}

/// In-memory execution store.
///
/// Intended for tests/dev. One lock guards all tables so multi-table
/// operations (guarded insert, cascading delete) are atomic.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    tables: RwLock<Tables>,
    context_writes: AtomicU64,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of execution context writes performed so far.
    pub fn context_write_count(&self) -> u64 {
        self.context_writes.load(Ordering::Relaxed)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    fn find_job_instance(
        &self,
        job_name: &str,
        job_key: &JobKey,
    ) -> Result<Option<JobInstance>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .instance_keys
            .get(&(job_name.to_string(), job_key.clone()))
            .and_then(|id| tables.instances.get(id))
            .cloned())
    }

    fn get_job_instance(&self, id: JobInstanceId) -> Result<Option<JobInstance>, StoreError> {
        Ok(self.read()?.instances.get(&id).cloned())
    }

    fn create_job_instance(&self, instance: &JobInstance) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let key = (instance.job_name.clone(), instance.job_key.clone());
        if tables.instance_keys.contains_key(&key) {
            return Err(StoreError::Duplicate(format!(
                "job instance '{}' with key {}",
                instance.job_name, instance.job_key
            )));
        }
        tables.instance_keys.insert(key, instance.id);
        tables.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    fn job_executions(&self, instance_id: JobInstanceId) -> Result<Vec<JobExecution>, StoreError> {
        let tables = self.read()?;
        let ids = tables
            .executions_by_instance
            .get(&instance_id)
            .cloned()
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| tables.job_executions.get(id))
            .map(|stored| tables.attach_job(stored))
            .collect()
    }

    fn insert_job_execution(
        &self,
        execution: &mut JobExecution,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if !tables.instances.contains_key(&execution.job_instance_id) {
            return Err(StoreError::not_found("job instance", execution.job_instance_id));
        }

        let existing = tables
            .executions_by_instance
            .get(&execution.job_instance_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let current = existing.len() as u64;
        if !expected.matches(current) {
            return Err(StoreError::Concurrency(format!(
                "expected {expected:?} executions, found {current}"
            )));
        }
        if let Some(running) = existing
            .iter()
            .filter_map(|id| tables.job_executions.get(id))
            .find(|e| e.is_running())
        {
            return Err(StoreError::Concurrency(format!(
                "job execution {} is still {}",
                running.id, running.status
            )));
        }

        let json = execution
            .execution_context
            .to_json()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        execution.version = 1;
        tables
            .contexts
            .insert(ContextOwner::Job(execution.id), json);
        tables
            .executions_by_instance
            .entry(execution.job_instance_id)
            .or_default()
            .push(execution.id);
        let stored = detached_context(&*execution, |e| {
            e.execution_context = ExecutionContext::new();
        });
        tables.job_executions.insert(execution.id, stored);
        self.context_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn update_job_execution(&self, execution: &mut JobExecution) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let stored = tables
            .job_executions
            .get_mut(&execution.id)
            .ok_or_else(|| StoreError::not_found("job execution", execution.id))?;
        ExpectedVersion::Exact(execution.version)
            .check(stored.version)
            .map_err(|e| StoreError::Concurrency(format!("job execution {}: {e}", execution.id)))?;

        execution.version += 1;
        *stored = detached_context(&*execution, |e| {
            e.execution_context = ExecutionContext::new();
        });
        Ok(())
    }

    fn get_job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecution>, StoreError> {
        let tables = self.read()?;
        tables
            .job_executions
            .get(&id)
            .map(|stored| tables.attach_job(stored))
            .transpose()
    }

    fn insert_step_execution(&self, step: &mut StepExecution) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if !tables.job_executions.contains_key(&step.job_execution_id) {
            return Err(StoreError::not_found("job execution", step.job_execution_id));
        }
        if tables.step_executions.contains_key(&step.id) {
            return Err(StoreError::Duplicate(format!("step execution {}", step.id)));
        }

        let json = step
            .execution_context
            .to_json()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        step.version = 1;
        tables.contexts.insert(ContextOwner::Step(step.id), json);
        tables
            .steps_by_job
            .entry(step.job_execution_id)
            .or_default()
            .push(step.id);
        let stored = detached_context(&*step, |s| {
            s.execution_context = ExecutionContext::new();
        });
        tables.step_executions.insert(step.id, stored);
        self.context_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn update_step_execution(&self, step: &mut StepExecution) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let stored = tables
            .step_executions
            .get_mut(&step.id)
            .ok_or_else(|| StoreError::not_found("step execution", step.id))?;
        ExpectedVersion::Exact(step.version)
            .check(stored.version)
            .map_err(|e| StoreError::Concurrency(format!("step execution {}: {e}", step.id)))?;

        step.version += 1;
        *stored = detached_context(&*step, |s| {
            s.execution_context = ExecutionContext::new();
        });
        Ok(())
    }

    fn get_step_execution(&self, id: StepExecutionId) -> Result<Option<StepExecution>, StoreError> {
        let tables = self.read()?;
        tables
            .step_executions
            .get(&id)
            .map(|stored| tables.attach_step(stored))
            .transpose()
    }

    fn step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>, StoreError> {
        let tables = self.read()?;
        let ids = tables
            .steps_by_job
            .get(&job_execution_id)
            .cloned()
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| tables.step_executions.get(id))
            .map(|stored| tables.attach_step(stored))
            .collect()
    }

    fn save_execution_context(
        &self,
        owner: ContextOwner,
        context: &ExecutionContext,
    ) -> Result<(), StoreError> {
        let json = context
            .to_json()
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let mut tables = self.write()?;
        let exists = match owner {
            ContextOwner::Job(id) => tables.job_executions.contains_key(&id),
            ContextOwner::Step(id) => tables.step_executions.contains_key(&id),
        };
        if !exists {
            return Err(StoreError::not_found("execution context owner", format!("{owner:?}")));
        }
        tables.contexts.insert(owner, json);
        self.context_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn load_execution_context(
        &self,
        owner: ContextOwner,
    ) -> Result<Option<ExecutionContext>, StoreError> {
        let tables = self.read()?;
        if !tables.contexts.contains_key(&owner) {
            return Ok(None);
        }
        tables.load_context(owner).map(Some)
    }

    fn delete_job_execution(&self, id: JobExecutionId) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables
            .remove_job_execution(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("job execution", id))
    }

    fn delete_job_instance(&self, id: JobInstanceId) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let instance = tables
            .instances
            .remove(&id)
            .ok_or_else(|| StoreError::not_found("job instance", id))?;
        for execution_id in tables.executions_by_instance.remove(&id).unwrap_or_default() {
            tables.remove_job_execution(execution_id);
        }
        tables
            .instance_keys
            .remove(&(instance.job_name, instance.job_key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgebatch_core::{BatchStatus, JobParameters};

    fn instance(store: &InMemoryExecutionStore) -> JobInstance {
        let params = JobParameters::builder().string("file", "a.csv").build().unwrap();
        let instance = JobInstance::new("import", &params);
        store.create_job_instance(&instance).unwrap();
        instance
    }

    fn execution(store: &InMemoryExecutionStore, instance: &JobInstance) -> JobExecution {
        let mut execution =
            JobExecution::new(instance, JobParameters::empty(), ExecutionContext::new());
        store
            .insert_job_execution(&mut execution, ExpectedVersion::Any)
            .unwrap();
        execution
    }

    #[test]
    fn duplicate_instance_is_rejected() {
        let store = InMemoryExecutionStore::new();
        let first = instance(&store);
        let again = JobInstance::new(
            "import",
            &JobParameters::builder().string("file", "a.csv").build().unwrap(),
        );

        assert!(matches!(
            store.create_job_instance(&again),
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(
            store.find_job_instance("import", &first.job_key).unwrap(),
            Some(first)
        );
    }

    #[test]
    fn insert_is_guarded_by_running_executions() {
        let store = InMemoryExecutionStore::new();
        let instance = instance(&store);
        let _running = execution(&store, &instance);

        let mut second =
            JobExecution::new(&instance, JobParameters::empty(), ExecutionContext::new());
        let err = store
            .insert_job_execution(&mut second, ExpectedVersion::Exact(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::Concurrency(_)));
    }

    #[test]
    fn insert_checks_expected_execution_count() {
        let store = InMemoryExecutionStore::new();
        let instance = instance(&store);
        let mut first = execution(&store, &instance);
        first.mark_ended(BatchStatus::Failed, BatchStatus::Failed.into());
        store.update_job_execution(&mut first).unwrap();

        let mut stale =
            JobExecution::new(&instance, JobParameters::empty(), ExecutionContext::new());
        assert!(matches!(
            store.insert_job_execution(&mut stale, ExpectedVersion::Exact(0)),
            Err(StoreError::Concurrency(_))
        ));
        store
            .insert_job_execution(&mut stale, ExpectedVersion::Exact(1))
            .unwrap();
        assert_eq!(store.job_executions(instance.id).unwrap().len(), 2);
    }

    #[test]
    fn stale_update_is_rejected() {
        let store = InMemoryExecutionStore::new();
        let instance = instance(&store);
        let mut execution = execution(&store, &instance);
        let mut stale = execution.clone();

        execution.mark_started();
        store.update_job_execution(&mut execution).unwrap();
        assert_eq!(execution.version, 2);

        stale.stop();
        assert!(matches!(
            store.update_job_execution(&mut stale),
            Err(StoreError::Concurrency(_))
        ));
    }

    #[test]
    fn update_does_not_touch_stored_context() {
        let store = InMemoryExecutionStore::new();
        let instance = instance(&store);
        let mut execution = execution(&store, &instance);

        execution.execution_context.put("offset", 3i64);
        store.update_job_execution(&mut execution).unwrap();
        let loaded = store.get_job_execution(execution.id).unwrap().unwrap();
        assert!(loaded.execution_context.is_empty());

        store
            .save_execution_context(ContextOwner::Job(execution.id), &execution.execution_context)
            .unwrap();
        let loaded = store.get_job_execution(execution.id).unwrap().unwrap();
        assert_eq!(loaded.execution_context.get_long("offset"), Ok(3));
    }

    #[test]
    fn non_finite_doubles_are_persisted_and_reloaded() {
        let store = InMemoryExecutionStore::new();
        let instance = instance(&store);
        let job = execution(&store, &instance);
        let mut step = StepExecution::new("score", job.id);
        store.insert_step_execution(&mut step).unwrap();

        step.execution_context.put("ratio", f64::NAN);
        step.execution_context.put("ceiling", f64::INFINITY);
        store
            .save_execution_context(ContextOwner::Step(step.id), &step.execution_context)
            .unwrap();

        let loaded = store.step_executions(job.id).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].execution_context.get_double("ratio").unwrap().is_nan());
        assert_eq!(
            loaded[0].execution_context.get_double("ceiling"),
            Ok(f64::INFINITY)
        );
    }

    #[test]
    fn deleting_an_instance_cascades() {
        let store = InMemoryExecutionStore::new();
        let instance = instance(&store);
        let job = execution(&store, &instance);
        let mut step = StepExecution::new("load", job.id);
        store.insert_step_execution(&mut step).unwrap();

        store.delete_job_instance(instance.id).unwrap();

        assert!(store.get_job_execution(job.id).unwrap().is_none());
        assert!(store.get_step_execution(step.id).unwrap().is_none());
        assert!(store
            .load_execution_context(ContextOwner::Step(step.id))
            .unwrap()
            .is_none());
        assert!(store
            .find_job_instance("import", &instance.job_key)
            .unwrap()
            .is_none());
    }

    #[test]
    fn steps_are_listed_with_their_parent() {
        let store = InMemoryExecutionStore::new();
        let instance = instance(&store);
        let job = execution(&store, &instance);
        for name in ["extract", "load"] {
            let mut step = StepExecution::new(name, job.id);
            store.insert_step_execution(&mut step).unwrap();
        }

        let names: Vec<_> = store
            .step_executions(job.id)
            .unwrap()
            .into_iter()
            .map(|s| s.step_name)
            .collect();
        assert_eq!(names, ["extract", "load"]);
        assert_eq!(
            store.get_job_execution(job.id).unwrap().unwrap().step_execution_ids.len(),
            2
        );
    }
}
