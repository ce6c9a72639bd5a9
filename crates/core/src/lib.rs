//! Core of Tally: group records by key, reduce per key, keep the top K.

pub mod combine;
pub mod config;
pub mod error;
pub mod executor;
pub mod format;
pub mod metrics;
pub mod partition;
pub mod pipeline;
pub mod ratings;
pub mod topk;
pub mod transform;

pub use combine::{Aggregate, CombineErrorPolicy, Combiner, Monoid, OverflowPolicy, PartialAggregates, Sum};
pub use config::PipelineConfig;
pub use error::{CombineError, ConfigError, FormatError, PipelineError};
pub use executor::{CancelToken, Executor, SequentialExecutor};
pub use format::{Formatter, JsonFormatter, Layout};
pub use metrics::{Counter, Metrics, NoopMetrics};
pub use partition::Repartitioner;
pub use pipeline::{Pipeline, PipelineBuilder};
pub use topk::{by_total_descending, Comparator, RankedEntry, TopKSelector};
pub use transform::{Extracted, KeyExtractor, Transform};
