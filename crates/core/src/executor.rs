//! Where partition-level work runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::PipelineError;

/// Runs one closure per partition input and returns the results in
/// partition order. Returning is the barrier: every partition has finished.
///
/// Each input must be handed to exactly one invocation of `work`.
pub trait Executor: Send + Sync {
    fn run_partitions<I, O, F>(&self, partitions: Vec<I>, work: F) -> Result<Vec<O>, PipelineError>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(usize, I) -> O + Send + Sync + 'static;
}

/// Runs partitions one after another on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialExecutor;

impl Executor for SequentialExecutor {
    fn run_partitions<I, O, F>(&self, partitions: Vec<I>, work: F) -> Result<Vec<O>, PipelineError>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(usize, I) -> O + Send + Sync + 'static,
    {
        Ok(partitions
            .into_iter()
            .enumerate()
            .map(|(index, input)| work(index, input))
            .collect())
    }
}

/// Best-effort stop signal shared by every worker of a run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
