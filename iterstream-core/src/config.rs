// iterstream-core/src/config.rs

//! Configuration for pipelines, export checks and the loader.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::error::{IterStreamError, Result};

// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterStreamConfig {
    pub async_map: AsyncMapConfig,
    pub export: ExportConfig,
    pub loader: LoaderConfig,
}

/// What the concurrent mapping stage does after the mapping function fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Yield the error, cancel in-flight work and end the stream.
    #[default]
    Stop,
    /// Yield the error at its position and keep mapping later items.
    Continue,
}

/// Where the concurrent mapping stage runs the mapping function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapExecutor {
    /// A pool of `workers` threads.
    #[default]
    Threads,
    /// On the pulling thread, one item at a time.
    Inline,
}

impl FromStr for FailurePolicy {
    type Err = IterStreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "stop" => Ok(Self::Stop),
            "continue" => Ok(Self::Continue),
            _ => Err(IterStreamError::config(format!(
                "unknown failure policy: '{s}'. Expected 'stop' or 'continue'"
            ))),
        }
    }
}

impl FromStr for MapExecutor {
    type Err = IterStreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "threads" => Ok(Self::Threads),
            "inline" => Ok(Self::Inline),
            _ => Err(IterStreamError::config(format!(
                "unknown map executor: '{s}'. Expected 'threads' or 'inline'"
            ))),
        }
    }
}

/// Concurrent mapping stage options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncMapConfig {
    /// Number of pool threads.
    pub workers: usize,
    /// Maximum items submitted but not yet yielded. Defaults to twice `workers`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
    /// Behaviour after a mapping failure.
    pub failure_policy: FailurePolicy,
    /// Pool or inline execution.
    pub executor: MapExecutor,
}

impl Default for AsyncMapConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_in_flight: None,
            failure_policy: FailurePolicy::Stop,
            executor: MapExecutor::Threads,
        }
    }
}

impl AsyncMapConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn max_in_flight(mut self, window: usize) -> Self {
        self.max_in_flight = Some(window);
        self
    }

    #[must_use]
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    #[must_use]
    pub fn executor(mut self, executor: MapExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// The effective in-flight window.
    pub fn window(&self) -> usize {
        self.max_in_flight
            .unwrap_or_else(|| self.workers.saturating_mul(2))
            .max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(IterStreamError::config(
                "async_map.workers must be greater than 0",
            ));
        }
        if let Some(window) = self.max_in_flight {
            if window < self.workers {
                return Err(IterStreamError::config(format!(
                    "async_map.max_in_flight ({window}) must be at least async_map.workers ({})",
                    self.workers
                )));
            }
        }
        Ok(())
    }
}

/// Export adapter checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    // Fail the first pull unless a worker split was applied.
    pub enforce_worker_check: bool,
    // Fail the first pull unless a rank split was applied.
    pub enforce_rank_check: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enforce_worker_check: true,
            enforce_rank_check: true,
        }
    }
}

impl ExportConfig {
    /// Both checks waived.
    pub fn unchecked() -> Self {
        Self {
            enforce_worker_check: false,
            enforce_rank_check: false,
        }
    }
}

/// Loader options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    // Number of worker threads; 0 iterates on the calling thread.
    pub num_workers: usize,
    // Items each worker may buffer ahead of the consumer.
    pub prefetch_per_worker: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            prefetch_per_worker: 2,
        }
    }
}

impl LoaderConfig {
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefetch_per_worker == 0 {
            return Err(IterStreamError::config(
                "loader.prefetch_per_worker must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl FromStr for IterStreamConfig {
    type Err = IterStreamError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| IterStreamError::config_with_source("failed to parse TOML config", e))
    }
}

impl IterStreamConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            IterStreamError::config_with_source(
                format!("failed to read config file '{}'", path.display()),
                e,
            )
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `ITERSTREAM_` and use
    // underscores to separate nested fields. For example:
    // - `ITERSTREAM_ASYNC_MAP_WORKERS` overrides `async_map.workers`
    // - `ITERSTREAM_EXPORT_ENFORCE_RANK_CHECK` overrides `export.enforce_rank_check`
    // - `ITERSTREAM_LOADER_NUM_WORKERS` overrides `loader.num_workers`
    // Values that fail to parse are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Async map overrides
        if let Some(v) = env_parse("ITERSTREAM_ASYNC_MAP_WORKERS") {
            self.async_map.workers = v;
        }
        if let Some(v) = env_parse("ITERSTREAM_ASYNC_MAP_MAX_IN_FLIGHT") {
            self.async_map.max_in_flight = Some(v);
        }
        if let Some(v) = env_parse("ITERSTREAM_ASYNC_MAP_FAILURE_POLICY") {
            self.async_map.failure_policy = v;
        }
        if let Some(v) = env_parse("ITERSTREAM_ASYNC_MAP_EXECUTOR") {
            self.async_map.executor = v;
        }

        // Export overrides
        if let Some(v) = env_parse("ITERSTREAM_EXPORT_ENFORCE_WORKER_CHECK") {
            self.export.enforce_worker_check = v;
        }
        if let Some(v) = env_parse("ITERSTREAM_EXPORT_ENFORCE_RANK_CHECK") {
            self.export.enforce_rank_check = v;
        }

        // Loader overrides
        if let Some(v) = env_parse("ITERSTREAM_LOADER_NUM_WORKERS") {
            self.loader.num_workers = v;
        }
        if let Some(v) = env_parse("ITERSTREAM_LOADER_PREFETCH_PER_WORKER") {
            self.loader.prefetch_per_worker = v;
        }

        self
    }

    // Validate all configuration values.
    pub fn validate(&self) -> Result<()> {
        self.async_map.validate()?;
        self.loader.validate()?;
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|val| val.trim().parse().ok())
}
