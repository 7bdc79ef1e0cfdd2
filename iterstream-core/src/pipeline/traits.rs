// iterstream-core/src/pipeline/traits.rs

use crate::error::Result;
use crate::sharding::{ExecutionContext, PartitionContext};

/// A lazily evaluated stream of fallible items.
pub type ItemStream<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

/// Whether a source can be iterated more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Every instantiation replays the source from the start.
    Restartable,
    /// The source can be consumed exactly once.
    Exhaustible,
}

/// Shared state handed to every stage of one pipeline instance.
#[derive(Debug, Clone, Default)]
pub struct StageEnv {
    pub partition: PartitionContext,
    pub execution: ExecutionContext,
}

impl StageEnv {
    pub fn new(partition: PartitionContext, execution: ExecutionContext) -> Self {
        Self {
            partition,
            execution,
        }
    }
}

/// One lazy transform in a pipeline.
///
/// `apply` is called when a pipeline is instantiated for iteration and must
/// not pull from `upstream`; all work happens as the returned stream is pulled.
/// A stage may be applied many times (once per instantiation), so it is
/// borrowed rather than consumed.
pub trait Stage<A, B>: Send + Sync + 'static {
    fn apply(&self, upstream: ItemStream<A>, env: &StageEnv) -> ItemStream<B>;
}

impl<A, B, F> Stage<A, B> for F
where
    F: Fn(ItemStream<A>, &StageEnv) -> ItemStream<B> + Send + Sync + 'static,
{
    fn apply(&self, upstream: ItemStream<A>, env: &StageEnv) -> ItemStream<B> {
        self(upstream, env)
    }
}
