// iterstream-core/src/error.rs

use std::fmt;

use thiserror::Error;

/// The partitioning dimension a split stage covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitDimension {
    /// Per-process data-loading workers.
    Worker,
    /// Distributed ranks.
    Rank,
}

impl fmt::Display for SplitDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitDimension::Worker => f.write_str("worker"),
            SplitDimension::Rank => f.write_str("rank"),
        }
    }
}

#[derive(Error, Debug)]
pub enum IterStreamError {

    #[error("Invalid step: offset {offset} must be below stride {stride} and stride must be at least 1")]
    InvalidStep {
        offset: usize,
        stride: usize,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Pipeline was not split by {dimension}; apply split_by_{dimension} before exporting or disable the {dimension} check")]
    MissingSplit {
        dimension: SplitDimension,
    },

    #[error("Mapping function failed at position {position}")]
    Map {
        position: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Mapping worker was lost before producing position {position}")]
    MapWorkerLost {
        position: u64,
    },

    #[error("Exhaustible source was already consumed")]
    SourceConsumed,

    #[error("Source error: {message}")]
    Source {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Loader worker {worker_id} failed: {message}")]
    Loader {
        worker_id: usize,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, IterStreamError>;

// Convenience constructors
impl IterStreamError {

    pub fn invalid_step(offset: usize, stride: usize) -> Self {
        Self::InvalidStep { offset, stride }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn missing_split(dimension: SplitDimension) -> Self {
        Self::MissingSplit { dimension }
    }

    pub fn map(position: u64, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Map {
            position,
            source: source.into(),
        }
    }

    pub fn map_worker_lost(position: u64) -> Self {
        Self::MapWorkerLost { position }
    }

    pub fn source(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
            source: None,
        }
    }

    pub fn source_with(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Source {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn loader(worker_id: usize, message: impl Into<String>) -> Self {
        Self::Loader {
            worker_id,
            message: message.into(),
        }
    }

    /// Returns the missing dimension if this is an enforcement failure.
    pub fn missing_dimension(&self) -> Option<SplitDimension> {
        match self {
            Self::MissingSplit { dimension } => Some(*dimension),
            _ => None,
        }
    }
}
