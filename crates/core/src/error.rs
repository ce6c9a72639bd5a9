use thiserror::Error;

/// Invalid pipeline configuration. Always fatal, raised before any record is read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("top-k must be non-negative, got {0}")]
    InvalidTopK(i64),
    #[error("partition count must be at least 1, got {0}")]
    InvalidPartitions(i64),
    #[error("chunk size must be at least 1, got {0}")]
    InvalidChunkSize(i64),
    #[error("no {0} supplied")]
    MissingOperator(&'static str),
    #[error("invalid configuration file: {0}")]
    Parse(String),
}

/// Failure of the combine operator while reducing contributions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CombineError {
    #[error("overflow combining {left} and {right}")]
    Overflow { left: String, right: String },
    #[error("combine operator failed: {0}")]
    Operator(String),
}

/// Failure to serialize a single ranked entry.
#[derive(Debug, Error)]
#[error("rank {rank}: {source}")]
pub struct FormatError {
    pub rank: usize,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Combine(#[from] CombineError),
    #[error("pipeline cancelled")]
    Cancelled,
    #[error("execution substrate failed: {0}")]
    Runtime(String),
}
