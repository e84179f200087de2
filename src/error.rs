use crate::cache::TileKey;
use thiserror::Error;

/// Failures of a tile task that are expected to resolve themselves on a later frame.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{task} is waiting for tile {dependency}")]
    DependencyNotReady { task: String, dependency: TileKey },
    #[error("tile {tile} is not available, its cache is saturated")]
    CacheSaturated { tile: TileKey },
    #[error("{task} lost its slot to an eviction")]
    Detached { task: String },
}

impl TaskError {
    /// Whether the task should be retried later.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TaskError::Detached { .. })
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read the configuration file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse the configuration")]
    Parse(#[from] ron::error::SpannedError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
