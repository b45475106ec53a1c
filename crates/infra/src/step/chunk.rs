use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn};

use forgebatch_core::{BatchStatus, ExitStatus, StepContribution, StepExecution};
use forgebatch_retry::{
    BackoffPolicy, ErrorClassifier, ErrorMatcher, MapRetryContextCache, RetryContext,
    RetryContextCache, RetryError, RetryOutcome, RetryPolicy, RetryState, RetryTemplate,
    StatefulRetryTemplate,
};

use super::completion::CompletionPolicy;
use super::item::{ItemProcessor, ItemReader, ItemWriter};
use super::listener::{StepExecutionListener, StopSignal};
use super::skip::SkipPolicy;
use super::transaction::{ResourcelessTransactionManager, TransactionManager};
use super::{Step, StepError};
use crate::config::BatchConfig;
use crate::repository::JobRepository;

type KeyFn<I> = Box<dyn Fn(&I) -> String + Send + Sync>;
type Recoverer<I, O> = Box<dyn FnMut(&I, &RetryContext) -> anyhow::Result<Option<O>> + Send>;

enum ChunkFailure {
    /// Stop requested; checked at chunk boundaries only.
    Interrupted,
    /// Stateful retry wants the chunk rolled back and its items delivered again.
    Redeliver(Arc<anyhow::Error>),
    Failed(anyhow::Error),
    Consistency(RetryError),
    /// Failure after commit; progress and committed data may disagree.
    Fatal(anyhow::Error),
}

enum Processed<O> {
    Output(O),
    Filtered,
    Skipped,
    Redeliver(Arc<anyhow::Error>),
}

/// Take back sole ownership of a shared failure, keeping its source chain.
fn unshare(cause: Arc<anyhow::Error>) -> anyhow::Error {
    Arc::try_unwrap(cause).unwrap_or_else(|shared| anyhow::anyhow!("{shared:#}"))
}

fn into_cause(err: RetryError) -> anyhow::Error {
    match err {
        RetryError::Failed(cause) | RetryError::Exhausted { last: cause, .. } => unshare(cause),
        other => anyhow::Error::new(other),
    }
}

/// Chunk-oriented step: read, process and write items in transactional chunks.
pub struct ChunkStep<I, O> {
    name: String,
    repository: Arc<dyn JobRepository>,
    reader: Box<dyn ItemReader<I> + Send>,
    processor: Box<dyn ItemProcessor<I, O> + Send>,
    writer: Box<dyn ItemWriter<O> + Send>,
    completion: CompletionPolicy,
    retry: RetryTemplate,
    stateful: Option<(StatefulRetryTemplate<String>, KeyFn<I>)>,
    rollback: ErrorClassifier<bool>,
    recoverer: Option<Recoverer<I, O>>,
    skip_policy: SkipPolicy,
    transaction_manager: Arc<dyn TransactionManager>,
    listeners: Vec<Arc<dyn StepExecutionListener>>,
    stop_signal: StopSignal,
    allow_start_if_complete: bool,
    start_limit: usize,
    /// Items rolled back for redelivery to the next chunk.
    pending: VecDeque<I>,
}

impl<I, O> std::fmt::Debug for ChunkStep<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStep")
            .field("name", &self.name)
            .field("completion", &self.completion)
            .field("retry", &self.retry)
            .field("stateful", &self.stateful.is_some())
            .field("skip_policy", &self.skip_policy)
            .finish_non_exhaustive()
    }
}

impl<I, O> ChunkStep<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn builder(name: impl Into<String>, repository: Arc<dyn JobRepository>) -> ChunkStepBuilder<I, O> {
        ChunkStepBuilder::new(name, repository)
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop_signal.clone()
    }

    fn run(&mut self, step: &mut StepExecution) -> Result<(), ChunkFailure> {
        for listener in &self.listeners {
            listener
                .before_step(step)
                .map_err(|e| ChunkFailure::Failed(e.context("before-step listener failed")))?;
        }
        self.reader
            .open(&mut step.execution_context)
            .map_err(|e| ChunkFailure::Failed(e.context("opening reader")))?;
        self.writer
            .open(&mut step.execution_context)
            .map_err(|e| ChunkFailure::Failed(e.context("opening writer")))?;
        self.pending.clear();

        loop {
            if step.is_terminate_only() || self.stop_signal.is_stopped() {
                return Err(ChunkFailure::Interrupted);
            }
            if self.chunk(step)? {
                return Ok(());
            }
        }
    }

    /// One transaction. Returns `true` once the reader is exhausted.
    fn chunk(&mut self, step: &mut StepExecution) -> Result<bool, ChunkFailure> {
        let tx = self
            .transaction_manager
            .begin()
            .map_err(|e| ChunkFailure::Failed(e.context("beginning transaction")))?;
        let mut contribution = StepContribution::default();

        match self.read_process_write(step, &mut contribution) {
            Ok(finished) => {
                self.transaction_manager
                    .commit(tx)
                    .map_err(|e| ChunkFailure::Fatal(e.context("commit failed")))?;
                step.apply(&contribution);
                self.record_progress(step)
                    .map_err(|e| ChunkFailure::Fatal(e.context("recording progress after commit")))?;
                debug!(
                    read = contribution.read_count,
                    written = contribution.write_count,
                    filtered = contribution.filter_count,
                    skipped = contribution.skip_count(),
                    commits = step.commit_count,
                    "chunk committed"
                );
                Ok(finished)
            }
            Err(failure) => {
                self.transaction_manager
                    .rollback(tx)
                    .map_err(|e| ChunkFailure::Fatal(e.context("rollback failed")))?;
                step.apply_rollback(&contribution);
                match failure {
                    ChunkFailure::Redeliver(cause) => {
                        debug!(
                            redelivered = self.pending.len(),
                            rollbacks = step.rollback_count,
                            error = %format!("{cause:#}"),
                            "chunk rolled back for retry"
                        );
                        Ok(false)
                    }
                    other => {
                        warn!(rollbacks = step.rollback_count, "chunk rolled back");
                        Err(other)
                    }
                }
            }
        }
    }

    fn read_process_write(
        &mut self,
        step: &StepExecution,
        contribution: &mut StepContribution,
    ) -> Result<bool, ChunkFailure> {
        let mut progress = self.completion.start();
        let mut inputs: Vec<I> = self.pending.drain(..).collect();
        for _ in &inputs {
            progress.record_item();
        }

        let mut exhausted = false;
        while !self.completion.is_complete(&progress) {
            match self.read_item(step, contribution)? {
                Some(item) => {
                    contribution.read_count += 1;
                    progress.record_item();
                    inputs.push(item);
                }
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        let mut outputs = Vec::with_capacity(inputs.len());
        let mut skipped = vec![false; inputs.len()];
        let mut redeliver = None;
        for (index, item) in inputs.iter().enumerate() {
            match self.process_item(item, step, contribution)? {
                Processed::Output(output) => outputs.push(output),
                Processed::Filtered => contribution.filter_count += 1,
                Processed::Skipped => skipped[index] = true,
                Processed::Redeliver(cause) => {
                    redeliver = Some(cause);
                    break;
                }
            }
        }
        if let Some(cause) = redeliver {
            self.pending = inputs
                .into_iter()
                .zip(skipped)
                .filter(|(_, skipped)| !skipped)
                .map(|(item, _)| item)
                .collect();
            return Err(ChunkFailure::Redeliver(cause));
        }

        if !outputs.is_empty() {
            let count = outputs.len();
            self.writer.write(&outputs).map_err(|e| {
                ChunkFailure::Failed(e.context(format!("writing chunk of {count} items")))
            })?;
            contribution.write_count += count as u64;
        }
        Ok(exhausted)
    }

    fn read_item(
        &mut self,
        step: &StepExecution,
        contribution: &mut StepContribution,
    ) -> Result<Option<I>, ChunkFailure> {
        loop {
            let reader = &mut self.reader;
            match self.retry.execute(|_| reader.read()) {
                Ok(item) => return Ok(item),
                Err(err) => {
                    let cause = into_cause(err);
                    if !self.should_skip(&cause, step, contribution)? {
                        return Err(ChunkFailure::Failed(cause.context("reading item")));
                    }
                    contribution.read_skip_count += 1;
                    warn!(error = %format!("{cause:#}"), "skipping unreadable item");
                }
            }
        }
    }

    fn process_item(
        &mut self,
        item: &I,
        step: &StepExecution,
        contribution: &mut StepContribution,
    ) -> Result<Processed<O>, ChunkFailure> {
        let processor = &mut self.processor;
        let outcome = match &self.stateful {
            None => match self.retry.execute(|_| processor.process(item)) {
                Ok(output) => RetryOutcome::Success(output),
                Err(err) => return self.skip_failed_item(into_cause(err), step, contribution),
            },
            Some((template, key)) => {
                let state = RetryState::new(key(item)).with_rollback(self.rollback.clone());
                let result = match self.recoverer.as_mut() {
                    Some(recover) => template.execute_with_recovery(
                        &state,
                        |_| processor.process(item),
                        |ctx| recover(item, ctx),
                    ),
                    None => template.execute(&state, |_| processor.process(item)),
                };
                match result {
                    Ok(outcome) => outcome,
                    Err(RetryError::Failed(cause)) => return Ok(Processed::Redeliver(cause)),
                    Err(err) if err.is_consistency_failure() => {
                        return Err(ChunkFailure::Consistency(err));
                    }
                    Err(err) => return Err(ChunkFailure::Failed(into_cause(err))),
                }
            }
        };

        match outcome {
            RetryOutcome::Success(Some(output)) => Ok(Processed::Output(output)),
            RetryOutcome::Success(None) => Ok(Processed::Filtered),
            RetryOutcome::Recovered(output) => {
                info!("item recovered after retry exhaustion");
                Ok(output.map_or(Processed::Filtered, Processed::Output))
            }
            RetryOutcome::Exhausted { attempts, last } => {
                let cause = last
                    .map(unshare)
                    .unwrap_or_else(|| anyhow::anyhow!("retry exhausted after {attempts} attempts"));
                self.skip_failed_item(cause, step, contribution)
            }
        }
    }

    fn skip_failed_item(
        &self,
        cause: anyhow::Error,
        step: &StepExecution,
        contribution: &mut StepContribution,
    ) -> Result<Processed<O>, ChunkFailure> {
        if !self.should_skip(&cause, step, contribution)? {
            return Err(ChunkFailure::Failed(cause.context("processing item")));
        }
        contribution.process_skip_count += 1;
        warn!(error = %format!("{cause:#}"), "skipping item that failed processing");
        Ok(Processed::Skipped)
    }

    fn should_skip(
        &self,
        cause: &anyhow::Error,
        step: &StepExecution,
        contribution: &StepContribution,
    ) -> Result<bool, ChunkFailure> {
        self.skip_policy
            .should_skip(cause, step.skip_count() + contribution.skip_count())
            .map_err(|e| ChunkFailure::Failed(anyhow::Error::new(e)))
    }

    fn record_progress(&mut self, step: &mut StepExecution) -> anyhow::Result<()> {
        self.reader.update(&mut step.execution_context)?;
        self.writer.update(&mut step.execution_context)?;
        self.repository.update_step_execution_context(step)?;
        self.repository.update_step_execution(step)?;
        Ok(())
    }

    fn close_streams(&mut self) -> anyhow::Result<()> {
        let reader = self.reader.close();
        let writer = self.writer.close();
        reader.and(writer)
    }

    fn notify_error(&self, step: &StepExecution, err: &anyhow::Error) {
        for listener in &self.listeners {
            listener.on_error(step, err);
        }
    }

    /// Status, exit status and the error to re-raise, if any.
    fn settle(
        &self,
        step: &mut StepExecution,
        result: Result<(), ChunkFailure>,
    ) -> (BatchStatus, ExitStatus, Option<StepError>) {
        let (failure, escaped) = match result {
            Ok(()) => return (BatchStatus::Completed, ExitStatus::completed(), None),
            Err(ChunkFailure::Interrupted) => {
                info!("step interrupted at chunk boundary");
                return (
                    BatchStatus::Stopped,
                    ExitStatus::stopped().with_description("step interrupted at a chunk boundary"),
                    None,
                );
            }
            Err(ChunkFailure::Redeliver(cause)) => ((BatchStatus::Failed, unshare(cause)), None),
            Err(ChunkFailure::Failed(err)) => ((BatchStatus::Failed, err), None),
            Err(ChunkFailure::Consistency(err)) => (
                (BatchStatus::Failed, anyhow::Error::new(err.clone())),
                Some(StepError::RetryConsistency(err)),
            ),
            Err(ChunkFailure::Fatal(err)) => {
                let message = format!("{err:#}");
                ((BatchStatus::Unknown, err), Some(StepError::Fatal(message)))
            }
        };

        let (status, err) = failure;
        let description = format!("{err:#}");
        error!(status = %status, error = %description, "step failed");
        self.notify_error(step, &err);
        step.add_failure(description.clone());
        (status, ExitStatus::from(status).with_description(description), escaped)
    }
}

impl<I, O> Step for ChunkStep<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn allow_start_if_complete(&self) -> bool {
        self.allow_start_if_complete
    }

    fn start_limit(&self) -> usize {
        self.start_limit
    }

    fn execute(&mut self, step: &mut StepExecution) -> Result<(), StepError> {
        let span = info_span!("step", step_name = %self.name, step_execution_id = %step.id);
        let _guard = span.enter();

        step.mark_started();
        self.repository.update_step_execution(step)?;
        info!("step started");

        let result = match (self.run(step), self.close_streams()) {
            (Ok(()), Err(e)) => Err(ChunkFailure::Failed(e.context("closing streams"))),
            (result, _) => result,
        };
        let (mut status, mut exit_status, escaped) = self.settle(step, result);

        step.status = status;
        for listener in &self.listeners {
            match listener.after_step(step) {
                Ok(Some(exit)) => exit_status = exit_status.and(exit),
                Ok(None) => {}
                Err(err) => {
                    let description = format!("after-step listener failed: {err:#}");
                    error!(error = %description, "step failed");
                    step.add_failure(description.clone());
                    status = status.upgrade_to(BatchStatus::Failed);
                    exit_status = exit_status.and(ExitStatus::failed().with_description(description));
                }
            }
        }
        step.mark_ended(status, exit_status);

        let persisted = self
            .repository
            .update_step_execution_context(step)
            .and_then(|()| self.repository.update_step_execution(step));
        if let Err(err) = persisted {
            error!(error = %err, "could not persist final step state");
            step.upgrade_status(BatchStatus::Unknown);
            step.exit_status = step
                .exit_status
                .clone()
                .and(ExitStatus::unknown().with_description(format!("final update failed: {err}")));
            return Err(StepError::Fatal(format!("final step update failed: {err}")));
        }

        info!(
            summary = %step.summary(),
            exit_status = %step.exit_status,
            "step finished"
        );
        match escaped {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Builder for [`ChunkStep`].
pub struct ChunkStepBuilder<I, O> {
    name: String,
    repository: Arc<dyn JobRepository>,
    reader: Option<Box<dyn ItemReader<I> + Send>>,
    processor: Option<Box<dyn ItemProcessor<I, O> + Send>>,
    writer: Option<Box<dyn ItemWriter<O> + Send>>,
    completion: CompletionPolicy,
    retry_policy: RetryPolicy,
    backoff: BackoffPolicy,
    retry_key: Option<KeyFn<I>>,
    retry_cache: Option<Arc<dyn RetryContextCache<String>>>,
    retry_cache_capacity: usize,
    rollback: ErrorClassifier<bool>,
    recoverer: Option<Recoverer<I, O>>,
    skip_policy: SkipPolicy,
    transaction_manager: Arc<dyn TransactionManager>,
    listeners: Vec<Arc<dyn StepExecutionListener>>,
    stop_signal: StopSignal,
    allow_start_if_complete: bool,
    start_limit: usize,
}

impl<I, O> ChunkStepBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new(name: impl Into<String>, repository: Arc<dyn JobRepository>) -> Self {
        let defaults = BatchConfig::default();
        Self {
            name: name.into(),
            repository,
            reader: None,
            processor: None,
            writer: None,
            completion: CompletionPolicy::ChunkSize(defaults.commit_interval),
            retry_policy: RetryPolicy::Never,
            backoff: BackoffPolicy::none(),
            retry_key: None,
            retry_cache: None,
            retry_cache_capacity: defaults.retry_cache_capacity,
            rollback: ErrorClassifier::always(),
            recoverer: None,
            skip_policy: SkipPolicy::Never,
            transaction_manager: Arc::new(ResourcelessTransactionManager::new()),
            listeners: Vec::new(),
            stop_signal: StopSignal::new(),
            allow_start_if_complete: false,
            start_limit: usize::MAX,
        }
    }

    /// Apply commit interval, retry limit, skip limit and cache capacity.
    pub fn config(mut self, config: &BatchConfig) -> Self {
        self.completion = CompletionPolicy::ChunkSize(config.commit_interval);
        self.retry_policy = RetryPolicy::simple(config.retry_limit);
        if config.skip_limit > 0 {
            self.skip_policy = SkipPolicy::limit(config.skip_limit);
        }
        self.retry_cache_capacity = config.retry_cache_capacity;
        self
    }

    pub fn reader(mut self, reader: impl ItemReader<I> + Send + 'static) -> Self {
        self.reader = Some(Box::new(reader));
        self
    }

    pub fn processor(mut self, processor: impl ItemProcessor<I, O> + Send + 'static) -> Self {
        self.processor = Some(Box::new(processor));
        self
    }

    pub fn writer(mut self, writer: impl ItemWriter<O> + Send + 'static) -> Self {
        self.writer = Some(Box::new(writer));
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.completion = CompletionPolicy::ChunkSize(size);
        self
    }

    pub fn completion_policy(mut self, policy: CompletionPolicy) -> Self {
        self.completion = policy;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn retry_limit(self, attempts: u32) -> Self {
        self.retry_policy(RetryPolicy::simple(attempts))
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Retry processing statefully, keyed by `key`: a failed item rolls the
    /// chunk back and its attempt count survives until it is redelivered.
    pub fn retry_key(mut self, key: impl Fn(&I) -> String + Send + Sync + 'static) -> Self {
        self.retry_key = Some(Box::new(key));
        self
    }

    pub fn retry_cache(mut self, cache: Arc<dyn RetryContextCache<String>>) -> Self {
        self.retry_cache = Some(cache);
        self
    }

    /// Failures matching `matchers` are retried in place instead of rolling
    /// the chunk back.
    pub fn no_rollback(mut self, matchers: impl IntoIterator<Item = ErrorMatcher>) -> Self {
        self.rollback = ErrorClassifier::except(matchers);
        self
    }

    /// Produce a replacement when an item's processing retries are exhausted.
    pub fn recoverer(
        mut self,
        recoverer: impl FnMut(&I, &RetryContext) -> anyhow::Result<Option<O>> + Send + 'static,
    ) -> Self {
        self.recoverer = Some(Box::new(recoverer));
        self
    }

    pub fn skip_policy(mut self, policy: SkipPolicy) -> Self {
        self.skip_policy = policy;
        self
    }

    pub fn skip_limit(self, limit: u64) -> Self {
        self.skip_policy(SkipPolicy::limit(limit))
    }

    pub fn transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = manager;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StepExecutionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn stop_signal(mut self, signal: StopSignal) -> Self {
        self.stop_signal = signal;
        self
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    pub fn start_limit(mut self, limit: usize) -> Self {
        self.start_limit = limit;
        self
    }

    pub fn build(self) -> Result<ChunkStep<I, O>, StepError> {
        let missing = |what: &str| StepError::Configuration(format!("step '{}' has no {what}", self.name));
        let reader = self.reader.ok_or_else(|| missing("reader"))?;
        let processor = self.processor.ok_or_else(|| missing("processor"))?;
        let writer = self.writer.ok_or_else(|| missing("writer"))?;

        let stateful = match self.retry_key {
            Some(key) => {
                let cache: Arc<dyn RetryContextCache<String>> = match self.retry_cache {
                    Some(cache) => cache,
                    None => Arc::new(MapRetryContextCache::with_capacity(self.retry_cache_capacity)),
                };
                let template = StatefulRetryTemplate::new(self.retry_policy.clone(), cache)
                    .with_backoff(self.backoff.clone());
                Some((template, key))
            }
            None => None,
        };

        Ok(ChunkStep {
            name: self.name,
            repository: self.repository,
            reader,
            processor,
            writer,
            completion: self.completion,
            retry: RetryTemplate::new(self.retry_policy).with_backoff(self.backoff),
            stateful,
            rollback: self.rollback,
            recoverer: self.recoverer,
            skip_policy: self.skip_policy,
            transaction_manager: self.transaction_manager,
            listeners: self.listeners,
            stop_signal: self.stop_signal,
            allow_start_if_complete: self.allow_start_if_complete,
            start_limit: self.start_limit,
            pending: VecDeque::new(),
        })
    }
}
