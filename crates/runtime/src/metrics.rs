use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use tally_core::{Counter, Metrics};

#[derive(Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    records_in: AtomicU64,
    records_skipped: AtomicU64,
    contributions: AtomicU64,
    combine_errors: AtomicU64,
    distinct_keys: AtomicU64,
    format_errors: AtomicU64,
    partials_discarded: AtomicU64,
    malformed_rows: AtomicU64,
}

impl MetricsInner {
    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::RecordsIn => &self.records_in,
            Counter::RecordsSkipped => &self.records_skipped,
            Counter::Contributions => &self.contributions,
            Counter::CombineErrors => &self.combine_errors,
            Counter::DistinctKeys => &self.distinct_keys,
            Counter::FormatErrors => &self.format_errors,
            Counter::PartialsDiscarded => &self.partials_discarded,
            Counter::MalformedRows => &self.malformed_rows,
        }
    }
}

impl Metrics for MetricsRegistry {
    fn inc(&self, counter: Counter, delta: u64) {
        self.inner.counter(counter).fetch_add(delta, Ordering::Relaxed);
    }
}

impl MetricsRegistry {
    pub fn get(&self, counter: Counter) -> u64 {
        self.inner.counter(counter).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_in: self.get(Counter::RecordsIn),
            records_skipped: self.get(Counter::RecordsSkipped),
            contributions: self.get(Counter::Contributions),
            combine_errors: self.get(Counter::CombineErrors),
            distinct_keys: self.get(Counter::DistinctKeys),
            format_errors: self.get(Counter::FormatErrors),
            partials_discarded: self.get(Counter::PartialsDiscarded),
            malformed_rows: self.get(Counter::MalformedRows),
        }
    }

    pub fn clear(&self) {
        for counter in Counter::ALL {
            self.inner.counter(counter).store(0, Ordering::Relaxed);
        }
    }

    /// Logs the current counters and resets them.
    pub fn dump_and_clear(&self, label: &str, elapsed: Option<Duration>) -> MetricsSnapshot {
        let snapshot = self.snapshot();
        info!(metrics = %snapshot.to_json_line(label, elapsed), "metrics dump");
        self.clear();
        snapshot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub records_in: u64,
    pub records_skipped: u64,
    pub contributions: u64,
    pub combine_errors: u64,
    pub distinct_keys: u64,
    pub format_errors: u64,
    pub partials_discarded: u64,
    pub malformed_rows: u64,
}

impl MetricsSnapshot {
    pub fn to_json_line(&self, label: &str, elapsed: Option<Duration>) -> String {
        #[derive(Serialize)]
        struct Snapshot<'a> {
            label: &'a str,
            #[serde(flatten)]
            counters: &'a MetricsSnapshot,
            elapsed_ms: Option<u128>,
        }

        let payload = Snapshot {
            label,
            counters: self,
            elapsed_ms: elapsed.map(|d| d.as_millis()),
        };
        serde_json::to_string(&payload).unwrap_or_else(|_| String::from("{}"))
    }
}

pub struct StageTimer {
    start: Instant,
}

impl StageTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
