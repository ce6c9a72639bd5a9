use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::combine::{CombineErrorPolicy, OverflowPolicy};
use crate::error::ConfigError;

pub const DEFAULT_TOP_K: i64 = 1000;
pub const DEFAULT_PARTITIONS: i64 = 4;
pub const DEFAULT_CHUNK_SIZE: i64 = 4096;

/// Values accepted from the outside world. Counts stay signed here so a
/// negative value from a file or flag surfaces as a `ConfigError` instead of
/// a parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub top_k: i64,
    pub partitions: i64,
    /// Records dealt to each partition per round; bounds how much raw input
    /// is held at once.
    pub chunk_size: i64,
    pub overflow: OverflowPolicy,
    pub on_combine_error: CombineErrorPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            partitions: DEFAULT_PARTITIONS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            overflow: OverflowPolicy::default(),
            on_combine_error: CombineErrorPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn top_k(&self) -> Result<usize, ConfigError> {
        usize::try_from(self.top_k).map_err(|_| ConfigError::InvalidTopK(self.top_k))
    }

    pub fn partitions(&self) -> Result<usize, ConfigError> {
        match usize::try_from(self.partitions) {
            Ok(p) if p >= 1 => Ok(p),
            _ => Err(ConfigError::InvalidPartitions(self.partitions)),
        }
    }

    pub fn chunk_size(&self) -> Result<usize, ConfigError> {
        match usize::try_from(self.chunk_size) {
            Ok(c) if c >= 1 => Ok(c),
            _ => Err(ConfigError::InvalidChunkSize(self.chunk_size)),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.top_k()?;
        self.partitions()?;
        self.chunk_size()?;
        Ok(())
    }
}
