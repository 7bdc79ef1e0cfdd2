// iterstream-core/src/sharding/context.rs

//! Partition bookkeeping and execution identity.
//!
//! A [`PartitionContext`] records which split dimensions a pipeline instance
//! has applied. An [`ExecutionContext`] answers "who am I" for the current
//! process: its distributed rank and its data-loading worker slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::SplitDimension;

/// Shared record of which split dimensions have been applied.
///
/// Cloning yields another handle to the same flags. Once a flag is set it is
/// never cleared for the lifetime of the context.
#[derive(Debug, Clone, Default)]
pub struct PartitionContext {
    flags: Arc<PartitionFlags>,
}

#[derive(Debug, Default)]
struct PartitionFlags {
    worker_split_applied: AtomicBool,
    rank_split_applied: AtomicBool,
}

impl PartitionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a dimension as applied.
    pub fn mark(&self, dimension: SplitDimension) {
        self.flag(dimension).store(true, Ordering::Release);
    }

    /// Returns true if the dimension has been applied.
    pub fn is_applied(&self, dimension: SplitDimension) -> bool {
        self.flag(dimension).load(Ordering::Acquire)
    }

    pub fn worker_split_applied(&self) -> bool {
        self.is_applied(SplitDimension::Worker)
    }

    pub fn rank_split_applied(&self) -> bool {
        self.is_applied(SplitDimension::Rank)
    }

    /// Returns an independent context carrying the current flag values.
    pub fn snapshot(&self) -> Self {
        let copy = Self::new();
        for dimension in [SplitDimension::Worker, SplitDimension::Rank] {
            if self.is_applied(dimension) {
                copy.mark(dimension);
            }
        }
        copy
    }

    /// Returns true if both handles point at the same flags.
    pub fn same_instance(&self, other: &PartitionContext) -> bool {
        Arc::ptr_eq(&self.flags, &other.flags)
    }

    fn flag(&self, dimension: SplitDimension) -> &AtomicBool {
        match dimension {
            SplitDimension::Worker => &self.flags.worker_split_applied,
            SplitDimension::Rank => &self.flags.rank_split_applied,
        }
    }
}

/// Position of the current process along one split dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardIdentity {
    pub index: usize,
    pub count: usize,
}

impl ShardIdentity {
    /// The identity of a process that is alone in its dimension.
    pub const SOLE: ShardIdentity = ShardIdentity { index: 0, count: 1 };

    pub fn new(index: usize, count: usize) -> Self {
        Self { index, count }
    }

    /// Returns true if a split with this identity is the identity transform.
    pub fn is_sole(&self) -> bool {
        self.count == 1
    }
}

/// Distributed process-group facts.
pub trait DistributedRuntime: Send + Sync {
    /// Whether a process group has been initialized.
    fn is_initialized(&self) -> bool;

    /// Rank of this process. Only meaningful when initialized.
    fn rank(&self) -> usize;

    /// Number of ranks. Only meaningful when initialized.
    fn world_size(&self) -> usize;

    /// `(rank, world_size)` as one consistent answer, or `None` when no
    /// group is initialized.
    fn identity(&self) -> Option<(usize, usize)> {
        if !self.is_initialized() {
            return None;
        }
        Some((self.rank(), self.world_size()))
    }
}

/// A process that never joined a process group.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotDistributed;

impl DistributedRuntime for NotDistributed {
    fn is_initialized(&self) -> bool {
        false
    }

    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }
}

/// A fixed rank within a fixed world size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticDistributed {
    pub rank: usize,
    pub world_size: usize,
}

impl StaticDistributed {
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self { rank, world_size }
    }
}

impl DistributedRuntime for StaticDistributed {
    fn is_initialized(&self) -> bool {
        true
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}

/// Reads rank and world size from the `RANK` / `WORLD_SIZE` environment
/// variables exported by common launchers.
///
/// The variables are read on every query, so the answer reflects the
/// environment at first pull rather than at construction. Missing or
/// unparsable variables report an uninitialized group.
#[derive(Debug, Clone)]
pub struct EnvDistributed {
    rank_var: String,
    world_size_var: String,
}

impl Default for EnvDistributed {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvDistributed {
    pub fn new() -> Self {
        Self::with_vars("RANK", "WORLD_SIZE")
    }

    pub fn with_vars(rank_var: impl Into<String>, world_size_var: impl Into<String>) -> Self {
        Self {
            rank_var: rank_var.into(),
            world_size_var: world_size_var.into(),
        }
    }

    fn read(&self) -> Option<(usize, usize)> {
        let rank = std::env::var(&self.rank_var).ok()?.trim().parse().ok()?;
        let world_size = std::env::var(&self.world_size_var).ok()?.trim().parse().ok()?;
        Some((rank, world_size))
    }
}

impl DistributedRuntime for EnvDistributed {
    fn is_initialized(&self) -> bool {
        self.read().is_some()
    }

    fn rank(&self) -> usize {
        self.read().map(|(rank, _)| rank).unwrap_or(0)
    }

    fn world_size(&self) -> usize {
        self.read().map(|(_, world_size)| world_size).unwrap_or(1)
    }

    fn identity(&self) -> Option<(usize, usize)> {
        self.read()
    }
}

/// Identity of a data-loading worker inside one consumer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerInfo {
    pub id: usize,
    pub num_workers: usize,
}

impl WorkerInfo {
    pub fn new(id: usize, num_workers: usize) -> Self {
        Self { id, num_workers }
    }
}

/// Source of per-process worker identity.
pub trait WorkerInfoProvider: Send + Sync {
    /// Returns `None` when not running inside a data-loading worker.
    fn current_worker_info(&self) -> Option<WorkerInfo>;
}

/// The main process of a consumer, outside any worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWorkers;

impl WorkerInfoProvider for NoWorkers {
    fn current_worker_info(&self) -> Option<WorkerInfo> {
        None
    }
}

impl WorkerInfoProvider for WorkerInfo {
    fn current_worker_info(&self) -> Option<WorkerInfo> {
        Some(*self)
    }
}

/// Injected execution identity for a pipeline instance.
///
/// Split stages hold on to this and query it at their first pull.
#[derive(Clone)]
pub struct ExecutionContext {
    distributed: Arc<dyn DistributedRuntime>,
    worker: Arc<dyn WorkerInfoProvider>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::local()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("rank", &self.rank_identity())
            .field("worker", &self.worker_identity())
            .finish()
    }
}

impl ExecutionContext {
    /// A single non-distributed process with no workers.
    pub fn local() -> Self {
        Self {
            distributed: Arc::new(NotDistributed),
            worker: Arc::new(NoWorkers),
        }
    }

    pub fn new(
        distributed: Arc<dyn DistributedRuntime>,
        worker: Arc<dyn WorkerInfoProvider>,
    ) -> Self {
        Self { distributed, worker }
    }

    #[must_use]
    pub fn with_distributed(mut self, distributed: Arc<dyn DistributedRuntime>) -> Self {
        self.distributed = distributed;
        self
    }

    #[must_use]
    pub fn with_worker(mut self, worker: Arc<dyn WorkerInfoProvider>) -> Self {
        self.worker = worker;
        self
    }

    /// Shorthand for a fixed rank in a fixed world.
    #[must_use]
    pub fn with_rank(self, rank: usize, world_size: usize) -> Self {
        self.with_distributed(Arc::new(StaticDistributed::new(rank, world_size)))
    }

    /// Shorthand for a fixed worker slot.
    #[must_use]
    pub fn with_worker_info(self, info: WorkerInfo) -> Self {
        self.with_worker(Arc::new(info))
    }

    /// `(rank, world_size)`, or `(0, 1)` when no group is initialized.
    pub fn rank_identity(&self) -> ShardIdentity {
        match self.distributed.identity() {
            Some((rank, world_size)) => ShardIdentity::new(rank, world_size),
            None => ShardIdentity::SOLE,
        }
    }

    /// `(worker_id, worker_count)`, or `(0, 1)` outside a worker.
    pub fn worker_identity(&self) -> ShardIdentity {
        match self.worker.current_worker_info() {
            Some(info) => ShardIdentity::new(info.id, info.num_workers),
            None => ShardIdentity::SOLE,
        }
    }

    pub fn identity(&self, dimension: SplitDimension) -> ShardIdentity {
        match dimension {
            SplitDimension::Worker => self.worker_identity(),
            SplitDimension::Rank => self.rank_identity(),
        }
    }
}
