// iterstream-core/src/sharding/split.rs

use crate::error::{Result, SplitDimension};
use crate::pipeline::{ItemStream, Stage, StageEnv};

use super::context::{ExecutionContext, PartitionContext};
use super::stepper::{Step, Stepper};

/// Keeps the share of the stream owned by the current data-loading worker.
///
/// Outside a worker the split is the identity transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitByWorker;

/// Keeps the share of the stream owned by the current distributed rank.
///
/// Without an initialized process group the split is the identity transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplitByRank;

impl<T: Send + 'static> Stage<T, T> for SplitByWorker {
    fn apply(&self, upstream: ItemStream<T>, env: &StageEnv) -> ItemStream<T> {
        Box::new(SplitStream::new(SplitDimension::Worker, upstream, env))
    }
}

impl<T: Send + 'static> Stage<T, T> for SplitByRank {
    fn apply(&self, upstream: ItemStream<T>, env: &StageEnv) -> ItemStream<T> {
        Box::new(SplitStream::new(SplitDimension::Rank, upstream, env))
    }
}

impl<T: Send + 'static> Stage<T, T> for Stepper {
    fn apply(&self, upstream: ItemStream<T>, _env: &StageEnv) -> ItemStream<T> {
        Box::new(Stepper::apply(*self, upstream))
    }
}

enum SplitState<T> {
    /// Identity not yet resolved.
    Pending(ItemStream<T>),
    Active(Step<ItemStream<T>>),
    Done,
}

/// Stream for one split dimension.
///
/// Identity is resolved at the first pull, not when the stage is built,
/// because worker identity only exists once the consumer has spawned its
/// workers. The partition flag is set once the stepper is in place.
pub struct SplitStream<T> {
    dimension: SplitDimension,
    state: SplitState<T>,
    partition: PartitionContext,
    execution: ExecutionContext,
}

impl<T> SplitStream<T> {
    pub fn new(dimension: SplitDimension, upstream: ItemStream<T>, env: &StageEnv) -> Self {
        Self {
            dimension,
            state: SplitState::Pending(upstream),
            partition: env.partition.clone(),
            execution: env.execution.clone(),
        }
    }

    fn resolve(&self) -> Result<Stepper> {
        let identity = self.execution.identity(self.dimension);
        let stepper = Stepper::for_identity(identity)?;
        tracing::debug!(
            dimension = %self.dimension,
            index = identity.index,
            count = identity.count,
            "resolved split identity"
        );
        self.partition.mark(self.dimension);
        Ok(stepper)
    }
}

impl<T> Drop for SplitStream<T> {
    fn drop(&mut self) {
        // Dropped before its first pull: nothing passed through unsplit.
        if let SplitState::Pending(_) = self.state {
            self.partition.mark(self.dimension);
        }
    }
}

impl<T> Iterator for SplitStream<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if let SplitState::Pending(_) = self.state {
            if let SplitState::Pending(upstream) = std::mem::replace(&mut self.state, SplitState::Done) {
                match self.resolve() {
                    Ok(stepper) => self.state = SplitState::Active(stepper.apply(upstream)),
                    Err(e) => return Some(Err(e)),
                }
            }
        }

        match &mut self.state {
            SplitState::Active(step) => step.next(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::error::IterStreamError;
    use crate::pipeline::{source, Composable};
    use crate::sharding::WorkerInfo;

    fn samples() -> Vec<u32> {
        (0..100).collect()
    }

    #[test]
    fn test_degenerate_split_is_identity() {
        let out = source(samples()).split_by_rank().split_by_worker().collect().unwrap();
        assert_eq!(out, samples());
    }

    #[test]
    fn test_multi_rank_split() {
        let world_size = 4;
        let mut union = Vec::new();
        for rank in 0..world_size {
            let out = source(samples())
                .with_execution_context(ExecutionContext::local().with_rank(rank, world_size))
                .split_by_rank()
                .collect()
                .unwrap();
            let expected: Vec<u32> = samples().into_iter().skip(rank).step_by(world_size).collect();
            assert_eq!(out.len(), 25);
            assert_eq!(out, expected);
            union.extend(out);
        }
        union.sort_unstable();
        assert_eq!(union, samples());
    }

    fn shard(
        rank: usize,
        world_size: usize,
        worker: usize,
        num_workers: usize,
        rank_first: bool,
        len: u32,
    ) -> Vec<u32> {
        let exec = ExecutionContext::local()
            .with_rank(rank, world_size)
            .with_worker_info(WorkerInfo::new(worker, num_workers));
        let base = source((0..len).collect::<Vec<u32>>()).with_execution_context(exec);
        let pipeline: Composable<u32> = if rank_first {
            base.split_by_rank().split_by_worker()
        } else {
            base.split_by_worker().split_by_rank()
        };
        pipeline.collect().unwrap()
    }

    #[test]
    fn test_two_dimensional_coverage_either_order() {
        for len in [0u32, 1, 7, 23, 100] {
            for world_size in 1..5 {
                for num_workers in 1..5 {
                    for rank_first in [true, false] {
                        let mut seen = HashSet::new();
                        let mut total = 0;
                        for rank in 0..world_size {
                            for worker in 0..num_workers {
                                let out = shard(rank, world_size, worker, num_workers, rank_first, len);
                                assert!(out.windows(2).all(|w| w[0] < w[1]));
                                total += out.len();
                                seen.extend(out);
                            }
                        }
                        assert_eq!(total, len as usize);
                        assert_eq!(seen.len(), len as usize);
                    }
                }
            }
        }
    }

    #[test]
    fn test_identity_resolved_at_first_pull() {
        let exec = ExecutionContext::local().with_rank(1, 2);
        let pipeline = source(samples()).with_execution_context(exec).split_by_rank();

        let mut iter = pipeline.iter();
        assert!(!pipeline.partition_context().rank_split_applied());
        assert_eq!(iter.next().unwrap().unwrap(), 1);
        assert!(pipeline.partition_context().rank_split_applied());
    }

    #[test]
    fn test_invalid_identity_is_config_error() {
        let exec = ExecutionContext::local().with_rank(4, 4);
        let mut iter = source(samples()).with_execution_context(exec).split_by_rank().iter();
        assert!(matches!(
            iter.next(),
            Some(Err(IterStreamError::InvalidStep { offset: 4, stride: 4 }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_unpulled_split_marks_on_drop() {
        let pipeline = source(samples()).split_by_rank().split_by_worker().take(0);
        let mut iter = pipeline.iter();
        assert!(iter.next().is_none());
        assert!(pipeline.partition_context().rank_split_applied());
        assert!(pipeline.partition_context().worker_split_applied());
    }

    #[test]
    fn test_split_on_empty_source_still_marks() {
        let pipeline = source(Vec::<u32>::new()).split_by_worker();
        assert!(pipeline.collect().unwrap().is_empty());
        assert!(pipeline.partition_context().worker_split_applied());
    }
}
