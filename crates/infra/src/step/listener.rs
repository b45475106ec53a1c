//! Step lifecycle callbacks and the cooperative stop signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use forgebatch_core::{ExitStatus, StepExecution};

/// Callbacks around a step execution.
pub trait StepExecutionListener: Send + Sync {
    /// Runs after the step is marked STARTED; an error fails the step.
    fn before_step(&self, _step: &mut StepExecution) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs once processing has finished. A returned exit status is combined
    /// with the step's own; an error fails the step even if processing
    /// succeeded.
    fn after_step(&self, _step: &StepExecution) -> anyhow::Result<Option<ExitStatus>> {
        Ok(None)
    }

    fn on_error(&self, _step: &StepExecution, _error: &anyhow::Error) {}
}

/// Cancellation token checked by the chunk loop at chunk boundaries.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
