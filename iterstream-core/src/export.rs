// iterstream-core/src/export.rs

//! Export adapter for multi-worker consumers.
//!
//! A [`LoaderIterable`] is what a loader drives: each worker forks it with its
//! own identity and pulls from the fork. The first pull verifies that the
//! pipeline was split along every dimension the [`ExportConfig`] enforces;
//! an unsplit pipeline would hand every worker the full stream.

use crate::config::ExportConfig;
use crate::error::{IterStreamError, Result, SplitDimension};
use crate::pipeline::{Composable, PipelineIter};
use crate::sharding::{ExecutionContext, PartitionContext};

pub struct LoaderIterable<T> {
    pipeline: Composable<T>,
    config: ExportConfig,
}

impl<T> Clone for LoaderIterable<T> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            config: self.config,
        }
    }
}

impl<T> std::fmt::Debug for LoaderIterable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderIterable")
            .field("pipeline", &self.pipeline)
            .field("config", &self.config)
            .finish()
    }
}

impl<T: Send + 'static> LoaderIterable<T> {
    pub fn new(pipeline: Composable<T>, config: ExportConfig) -> Self {
        Self { pipeline, config }
    }

    /// Starts one pass. The split checks run on the first pull.
    pub fn iter(&self) -> CheckedIter<T> {
        CheckedIter {
            inner: self.pipeline.iter(),
            partition: self.pipeline.partition_context().clone(),
            config: self.config,
            state: CheckState::Pending,
        }
    }

    /// Pulls every item, stopping at the first error.
    pub fn collect(&self) -> Result<Vec<T>> {
        self.iter().collect()
    }

    /// The copy a worker runs: independent partition flags and the given
    /// identity.
    pub fn fork(&self, execution: ExecutionContext) -> Self {
        Self {
            pipeline: self.pipeline.fork().with_execution_context(execution),
            config: self.config,
        }
    }

    pub fn config(&self) -> ExportConfig {
        self.config
    }

    pub fn pipeline(&self) -> &Composable<T> {
        &self.pipeline
    }

    pub fn into_pipeline(self) -> Composable<T> {
        self.pipeline
    }
}

impl<T: Send + 'static> IntoIterator for &LoaderIterable<T> {
    type Item = Result<T>;
    type IntoIter = CheckedIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckState {
    Pending,
    Passed,
    Failed,
}

/// Iterator returned by [`LoaderIterable::iter`].
pub struct CheckedIter<T> {
    inner: PipelineIter<T>,
    partition: PartitionContext,
    config: ExportConfig,
    state: CheckState,
}

impl<T> CheckedIter<T> {
    /// Worker first, so a pipeline with neither split reports the worker.
    fn missing(&self) -> Option<SplitDimension> {
        if self.config.enforce_worker_check && !self.partition.worker_split_applied() {
            return Some(SplitDimension::Worker);
        }
        if self.config.enforce_rank_check && !self.partition.rank_split_applied() {
            return Some(SplitDimension::Rank);
        }
        None
    }
}

impl<T> Iterator for CheckedIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            CheckState::Passed => self.inner.next(),
            CheckState::Failed => None,
            CheckState::Pending => {
                // Splits mark their flag on their own first pull, so the
                // check has to follow one upstream pull.
                let first = self.inner.next();
                match self.missing() {
                    None => {
                        self.state = CheckState::Passed;
                        first
                    }
                    Some(dimension) => {
                        self.state = CheckState::Failed;
                        tracing::error!(%dimension, "exported pipeline is missing a split");
                        match first {
                            // A split that failed to resolve never marks its
                            // flag; its error is the root cause.
                            Some(Err(e @ IterStreamError::InvalidStep { .. })) => Some(Err(e)),
                            _ => Some(Err(IterStreamError::missing_split(dimension))),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::source;
    use crate::sharding::WorkerInfo;

    fn samples() -> Composable<u32> {
        source((0..20).collect())
    }

    fn first_error(iterable: &LoaderIterable<u32>) -> Option<SplitDimension> {
        let mut iter = iterable.iter();
        let dimension = match iter.next() {
            Some(Err(e)) => e.missing_dimension(),
            _ => None,
        };
        assert!(iter.next().is_none());
        dimension
    }

    #[test]
    fn test_both_splits_pass() {
        let iterable = samples().split_by_rank().split_by_worker().to_loader_iterable();
        assert_eq!(iterable.collect().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_rank_only_reports_worker() {
        let iterable = samples().split_by_rank().to_loader_iterable();
        assert_eq!(first_error(&iterable), Some(SplitDimension::Worker));
    }

    #[test]
    fn test_worker_only_reports_rank() {
        let iterable = samples().split_by_worker().to_loader_iterable();
        assert_eq!(first_error(&iterable), Some(SplitDimension::Rank));
    }

    #[test]
    fn test_neither_reports_worker_first() {
        let iterable = samples().map(|x| x + 1).to_loader_iterable();
        assert_eq!(first_error(&iterable), Some(SplitDimension::Worker));
    }

    #[test]
    fn test_waived_checks() {
        let iterable = samples().to_loader_iterable_with(ExportConfig::unchecked());
        assert_eq!(iterable.collect().unwrap(), (0..20).collect::<Vec<_>>());

        let iterable = samples().split_by_worker().to_loader_iterable_with(ExportConfig {
            enforce_worker_check: true,
            enforce_rank_check: false,
        });
        assert_eq!(iterable.collect().unwrap().len(), 20);
    }

    #[test]
    fn test_empty_split_pipeline_passes() {
        let iterable = source(Vec::<u32>::new())
            .split_by_worker()
            .split_by_rank()
            .to_loader_iterable();
        assert!(iterable.collect().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_identity_surfaces_before_missing_split() {
        let iterable = samples()
            .split_by_worker()
            .split_by_rank()
            .to_loader_iterable()
            .fork(ExecutionContext::local().with_worker_info(WorkerInfo::new(3, 2)));
        let mut iter = iterable.iter();
        assert!(matches!(
            iter.next(),
            Some(Err(IterStreamError::InvalidStep { offset: 3, stride: 2 }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_split_then_take_zero_passes() {
        let iterable = samples()
            .split_by_worker()
            .split_by_rank()
            .take(0)
            .to_loader_iterable();
        assert!(iterable.collect().unwrap().is_empty());
    }

    #[test]
    fn test_upstream_error_does_not_hide_missing_split() {
        let items: Vec<std::result::Result<u32, std::io::Error>> = vec![
            Err(std::io::Error::new(std::io::ErrorKind::Other, "transient")),
            Ok(1),
        ];
        let iterable = Composable::from_fallible(items).to_loader_iterable();
        assert_eq!(first_error(&iterable), Some(SplitDimension::Worker));
    }

    #[test]
    fn test_fork_runs_worker_share() {
        let iterable = samples().split_by_rank().split_by_worker().to_loader_iterable();
        let worker = iterable.fork(
            ExecutionContext::local()
                .with_rank(1, 2)
                .with_worker_info(WorkerInfo::new(0, 2)),
        );
        assert_eq!(worker.collect().unwrap(), vec![1, 5, 9, 13, 17]);
        assert!(!iterable.pipeline().partition_context().rank_split_applied());
    }
}
