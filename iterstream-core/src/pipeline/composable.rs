// iterstream-core/src/pipeline/composable.rs

use std::sync::{Arc, Mutex};

use crate::config::{AsyncMapConfig, ExportConfig};
use crate::error::{IterStreamError, Result};
use crate::export::LoaderIterable;
use crate::sharding::{ExecutionContext, PartitionContext, SplitByRank, SplitByWorker};

use super::async_map::AsyncMap;
use super::stages::{Batched, Filter, Flatten, Map, Take, TryMap, ZipIndex};
use super::traits::{ItemStream, SourceKind, Stage, StageEnv};

type Recipe<T> = Arc<dyn Fn(&StageEnv) -> ItemStream<T> + Send + Sync>;

/// A chain of lazy stages over a source.
///
/// A `Composable` is a description: nothing is pulled until it is iterated.
/// Each call to [`Composable::iter`] instantiates the whole chain, so a
/// pipeline over a restartable source can be iterated repeatedly. All stages
/// of one pipeline share a single [`PartitionContext`]; composing a stage
/// hands the same context to the new pipeline.
///
/// ```
/// use iterstream_core::Composable;
///
/// let out = Composable::from_vec((0..23).collect::<Vec<u32>>())
///     .map(|x| x * 2)
///     .batched(5)
///     .collect()
///     .unwrap();
/// assert_eq!(out.len(), 5);
/// assert_eq!(out[4], vec![40, 42, 44]);
/// ```
pub struct Composable<T> {
    recipe: Recipe<T>,
    kind: SourceKind,
    partition: PartitionContext,
    execution: ExecutionContext,
}

impl<T> Clone for Composable<T> {
    /// Clones share the partition context with the original.
    fn clone(&self) -> Self {
        Self {
            recipe: self.recipe.clone(),
            kind: self.kind,
            partition: self.partition.clone(),
            execution: self.execution.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Composable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composable")
            .field("kind", &self.kind)
            .field("partition", &self.partition)
            .field("execution", &self.execution)
            .finish()
    }
}

/// Creates a restartable pipeline over a list.
pub fn source<T>(items: Vec<T>) -> Composable<T>
where
    T: Clone + Send + Sync + 'static,
{
    Composable::from_vec(items)
}

impl<T: Send + 'static> Composable<T> {
    fn from_recipe(recipe: Recipe<T>, kind: SourceKind) -> Self {
        Self {
            recipe,
            kind,
            partition: PartitionContext::new(),
            execution: ExecutionContext::local(),
        }
    }

    /// Restartable source backed by a list. Every iteration replays it.
    pub fn from_vec(items: Vec<T>) -> Self
    where
        T: Clone + Sync,
    {
        let items = Arc::new(items);
        let recipe: Recipe<T> = Arc::new(move |_env: &StageEnv| {
            let items = items.clone();
            let len = items.len();
            Box::new((0..len).map(move |i| Ok(items[i].clone()))) as ItemStream<T>
        });
        Self::from_recipe(recipe, SourceKind::Restartable)
    }

    /// Restartable source that calls `factory` for a fresh iterator on every
    /// instantiation, the way a storage driver reopens its stream.
    pub fn from_fn<F, I>(factory: F) -> Self
    where
        F: Fn() -> I + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let recipe: Recipe<T> = Arc::new(move |_env: &StageEnv| {
            Box::new(factory().into_iter().map(Ok)) as ItemStream<T>
        });
        Self::from_recipe(recipe, SourceKind::Restartable)
    }

    /// Exhaustible source. A second instantiation yields `SourceConsumed`.
    pub fn from_exhaustible<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let stream: ItemStream<T> = Box::new(iter.into_iter().map(Ok));
        Self::from_stream(stream)
    }

    /// Exhaustible source whose items may fail. Failures surface as
    /// `IterStreamError::Source` at their position.
    pub fn from_fallible<I, E>(iter: I) -> Self
    where
        I: IntoIterator<Item = std::result::Result<T, E>>,
        I::IntoIter: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let stream: ItemStream<T> = Box::new(
            iter.into_iter()
                .map(|item| item.map_err(|e| IterStreamError::source_with("upstream item failed", e))),
        );
        Self::from_stream(stream)
    }

    fn from_stream(stream: ItemStream<T>) -> Self {
        let slot = Mutex::new(Some(stream));
        let recipe: Recipe<T> = Arc::new(move |_env: &StageEnv| {
            let taken = slot.lock().ok().and_then(|mut guard| guard.take());
            taken.unwrap_or_else(|| Box::new(std::iter::once(Err(IterStreamError::SourceConsumed))))
        });
        Self::from_recipe(recipe, SourceKind::Exhaustible)
    }

    /// Attaches a stage, returning the extended pipeline.
    ///
    /// Nothing is pulled here; the stage runs when the result is iterated.
    pub fn compose<U, S>(self, stage: S) -> Composable<U>
    where
        U: Send + 'static,
        S: Stage<T, U>,
    {
        let upstream = self.recipe;
        let recipe: Recipe<U> = Arc::new(move |env: &StageEnv| stage.apply((upstream)(env), env));
        Composable {
            recipe,
            kind: self.kind,
            partition: self.partition,
            execution: self.execution,
        }
    }

    pub fn map<U, F>(self, func: F) -> Composable<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.compose(Map::new(func))
    }

    /// Like [`Composable::map`] for fallible functions. A failure becomes an
    /// `IterStreamError::Map` at its position and iteration continues.
    pub fn try_map<U, E, F>(self, func: F) -> Composable<U>
    where
        U: Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
        F: Fn(T) -> std::result::Result<U, E> + Send + Sync + 'static,
    {
        self.compose(TryMap::new(func))
    }

    pub fn filter<F>(self, predicate: F) -> Composable<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.compose(Filter::new(predicate))
    }

    pub fn flatten<U>(self) -> Composable<U>
    where
        U: Send + 'static,
        T: IntoIterator<Item = U>,
        T::IntoIter: Send + 'static,
    {
        self.compose(Flatten)
    }

    pub fn take(self, n: usize) -> Composable<T> {
        self.compose(Take::new(n))
    }

    /// Groups consecutive items into batches of `size`. The final batch may
    /// be shorter. A zero size fails at first pull.
    pub fn batched(self, size: usize) -> Composable<Vec<T>> {
        self.compose(Batched::new(size))
    }

    pub fn zip_index(self) -> Composable<(usize, T)> {
        self.compose(ZipIndex)
    }

    /// Keeps only this worker's share of the stream.
    pub fn split_by_worker(self) -> Composable<T> {
        self.compose(SplitByWorker)
    }

    /// Keeps only this rank's share of the stream.
    pub fn split_by_rank(self) -> Composable<T> {
        self.compose(SplitByRank)
    }

    /// Maps items on a thread pool with the default [`AsyncMapConfig`],
    /// keeping input order.
    pub fn async_map<U, F>(self, func: F) -> Composable<U>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.async_map_with(func, AsyncMapConfig::default())
    }

    pub fn async_map_with<U, F>(self, func: F, config: AsyncMapConfig) -> Composable<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.compose(AsyncMap::infallible(func, config))
    }

    /// Pool-backed [`Composable::try_map`].
    pub fn try_async_map<U, E, F>(self, func: F, config: AsyncMapConfig) -> Composable<U>
    where
        U: Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
        F: Fn(T) -> std::result::Result<U, E> + Send + Sync + 'static,
    {
        self.compose(AsyncMap::new(func, config))
    }

    /// Wraps the pipeline for a multi-worker loader with both split checks on.
    pub fn to_loader_iterable(self) -> LoaderIterable<T> {
        self.to_loader_iterable_with(ExportConfig::default())
    }

    pub fn to_loader_iterable_with(self, config: ExportConfig) -> LoaderIterable<T> {
        LoaderIterable::new(self, config)
    }

    /// Sets the identity split stages will query.
    #[must_use]
    pub fn with_execution_context(mut self, execution: ExecutionContext) -> Self {
        self.execution = execution;
        self
    }

    /// Returns an independent copy with its own partition context.
    ///
    /// This is what a freshly spawned worker reconstructs: the same stages
    /// over the same source, with partition flags copied rather than shared.
    pub fn fork(&self) -> Self {
        Self {
            recipe: self.recipe.clone(),
            kind: self.kind,
            partition: self.partition.snapshot(),
            execution: self.execution.clone(),
        }
    }

    /// Instantiates the chain. No item is pulled until the result is.
    pub fn iter(&self) -> PipelineIter<T> {
        let env = StageEnv::new(self.partition.clone(), self.execution.clone());
        PipelineIter {
            inner: (self.recipe)(&env),
        }
    }

    /// Pulls every item into a vector, stopping at the first error.
    ///
    /// Never returns on an infinite source.
    pub fn collect(&self) -> Result<Vec<T>> {
        self.iter().collect()
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn is_restartable(&self) -> bool {
        self.kind == SourceKind::Restartable
    }

    pub fn partition_context(&self) -> &PartitionContext {
        &self.partition
    }

    pub fn execution_context(&self) -> &ExecutionContext {
        &self.execution
    }
}

/// One live instantiation of a pipeline.
pub struct PipelineIter<T> {
    inner: ItemStream<T>,
}

impl<T> PipelineIter<T> {
    pub fn into_stream(self) -> ItemStream<T> {
        self.inner
    }
}

impl<T> Iterator for PipelineIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl<T: Send + 'static> IntoIterator for Composable<T> {
    type Item = Result<T>;
    type IntoIter = PipelineIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, T: Send + 'static> IntoIterator for &'a Composable<T> {
    type Item = Result<T>;
    type IntoIter = PipelineIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
