//! Runtime collaborators for Tally: tracing bootstrap, timely-hosted
//! execution, metrics, CSV ingestion and text output.

use anyhow::{anyhow, Result};
use tracing::{info, Level};

pub mod executor;
pub mod ingest;
pub mod metrics;
pub mod sink;

pub use executor::TimelyExecutor;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_max_level(Level::INFO)
        .try_init();
}

/// Start a single-process timely runtime and execute the provided closure once per worker.
pub fn start_runtime<F>(workers: usize, f: F) -> Result<()>
where
    F: Fn(usize, &mut timely::worker::Worker<timely::communication::allocator::Generic>) + Send + Sync + 'static,
{
    info!(%workers, "starting timely runtime");
    timely::execute(timely::Config::process(workers.max(1)), move |worker| {
        let index = worker.index();
        f(index, worker);
    })
    .map_err(|e| anyhow!("timely runtime failed: {e}"))?;
    Ok(())
}
