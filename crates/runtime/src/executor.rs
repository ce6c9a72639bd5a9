//! Hosts pipeline partitions on timely worker threads.

use std::sync::{Arc, Mutex};

use tracing::debug;

use tally_core::{Executor, PipelineError};

/// Runs partitions on a pool of timely workers in this process.
///
/// Worker `w` of `n` takes partitions `w, w + n, w + 2n, ...`, so each
/// partition is processed by exactly one worker. Joining the worker guards
/// is the barrier.
#[derive(Debug, Clone, Copy)]
pub struct TimelyExecutor {
    workers: usize,
}

impl TimelyExecutor {
    pub fn new(workers: usize) -> Self {
        Self { workers: workers.max(1) }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Executor for TimelyExecutor {
    fn run_partitions<I, O, F>(&self, partitions: Vec<I>, work: F) -> Result<Vec<O>, PipelineError>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(usize, I) -> O + Send + Sync + 'static,
    {
        let count = partitions.len();
        if count == 0 {
            return Ok(Vec::new());
        }
        let workers = self.workers.min(count);
        let slots: Arc<Vec<Mutex<Option<I>>>> =
            Arc::new(partitions.into_iter().map(|p| Mutex::new(Some(p))).collect());

        let guards = timely::execute(timely::Config::process(workers), move |worker| {
            let index = worker.index();
            let peers = worker.peers();
            let mut done = Vec::new();
            for partition in (index..count).step_by(peers) {
                let taken = match slots[partition].lock() {
                    Ok(mut slot) => slot.take(),
                    Err(poisoned) => poisoned.into_inner().take(),
                };
                // a missing input shows up as a short result count below
                let Some(input) = taken else { continue };
                debug!(worker = index, partition, "partition picked up");
                done.push((partition, work(partition, input)));
            }
            done
        })
        .map_err(PipelineError::Runtime)?;

        let mut results: Vec<(usize, O)> = Vec::with_capacity(count);
        for joined in guards.join() {
            results.extend(joined.map_err(PipelineError::Runtime)?);
        }
        if results.len() != count {
            return Err(PipelineError::Runtime(format!(
                "expected {count} partition results, got {}",
                results.len()
            )));
        }
        results.sort_by_key(|(partition, _)| *partition);
        Ok(results.into_iter().map(|(_, out)| out).collect())
    }
}
