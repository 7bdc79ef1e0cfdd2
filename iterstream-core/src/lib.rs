// iterstream-core/src/lib.rs

//! IterStream - Core Library
//!
//! This crate provides lazily composed streaming pipelines for feeding
//! training loops, including rank and worker sharding without a coordinator,
//! an order-preserving concurrent mapping stage, and an export adapter that
//! refuses to hand an unsplit pipeline to a multi-worker loader.

pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use config::{AsyncMapConfig, ExportConfig, FailurePolicy, IterStreamConfig, LoaderConfig, MapExecutor};
pub use error::{IterStreamError, Result, SplitDimension};

pub mod sharding;
pub use sharding::{
    DistributedRuntime, EnvDistributed, ExecutionContext, NoWorkers, NotDistributed,
    PartitionContext, ShardIdentity, SplitByRank, SplitByWorker, StaticDistributed, Stepper,
    WorkerInfo, WorkerInfoProvider,
};

pub mod pipeline;
pub use pipeline::{source, AsyncMap, Composable, ItemStream, PipelineIter, SourceKind, Stage, StageEnv};

pub mod export;
pub use export::{CheckedIter, LoaderIterable};

pub mod loader;
pub use loader::{DataLoader, LoaderIter};
