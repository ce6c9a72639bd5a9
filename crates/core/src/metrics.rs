//! Counter interface handed to every pipeline stage.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    RecordsIn,
    RecordsSkipped,
    Contributions,
    CombineErrors,
    DistinctKeys,
    FormatErrors,
    PartialsDiscarded,
    MalformedRows,
}

impl Counter {
    pub const ALL: [Counter; 8] = [
        Counter::RecordsIn,
        Counter::RecordsSkipped,
        Counter::Contributions,
        Counter::CombineErrors,
        Counter::DistinctKeys,
        Counter::FormatErrors,
        Counter::PartialsDiscarded,
        Counter::MalformedRows,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Counter::RecordsIn => "records_in",
            Counter::RecordsSkipped => "records_skipped",
            Counter::Contributions => "contributions",
            Counter::CombineErrors => "combine_errors",
            Counter::DistinctKeys => "distinct_keys",
            Counter::FormatErrors => "format_errors",
            Counter::PartialsDiscarded => "partials_discarded",
            Counter::MalformedRows => "malformed_rows",
        }
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sink for pipeline counters. Implementations must tolerate concurrent
/// increments from every worker.
pub trait Metrics: Send + Sync {
    fn inc(&self, counter: Counter, delta: u64);
}

/// Discards every increment.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn inc(&self, _counter: Counter, _delta: u64) {}
}
