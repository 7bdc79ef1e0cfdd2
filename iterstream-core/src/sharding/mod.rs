// iterstream-core/src/sharding/mod.rs

//! Coordinator-free sharding across ranks and workers.
//!
//! Every process applies the same [`Stepper`] arithmetic with its own
//! identity, so the `world_size * num_workers` execution contexts each own a
//! disjoint, order-preserving slice of the source and together cover it
//! exactly once. Identity comes from an injected [`ExecutionContext`] and is
//! read at the first pull of a split stage.
//!
//! # Example
//!
//! ```
//! use iterstream_core::{source, ExecutionContext, WorkerInfo};
//!
//! let exec = ExecutionContext::local()
//!     .with_rank(1, 2)
//!     .with_worker_info(WorkerInfo::new(0, 2));
//! let shard = source((0..12).collect::<Vec<u32>>())
//!     .with_execution_context(exec)
//!     .split_by_rank()
//!     .split_by_worker()
//!     .collect()
//!     .unwrap();
//! assert_eq!(shard, vec![1, 5, 9]);
//! ```

mod context;
mod split;
mod stepper;

pub use context::{
    DistributedRuntime, EnvDistributed, ExecutionContext, NoWorkers, NotDistributed,
    PartitionContext, ShardIdentity, StaticDistributed, WorkerInfo, WorkerInfoProvider,
};
pub use split::{SplitByRank, SplitByWorker, SplitStream};
pub use stepper::{Step, Stepper};
