// iterstream-core/src/pipeline/stages.rs

//! Ordinary single-threaded stages.

use std::sync::Arc;

use crate::error::{IterStreamError, Result};

use super::traits::{ItemStream, Stage, StageEnv};

/// Applies a function to every item. Errors pass through untouched.
pub struct Map<F> {
    func: Arc<F>,
}

impl<F> Map<F> {
    pub fn new(func: F) -> Self {
        Self { func: Arc::new(func) }
    }
}

impl<T, U, F> Stage<T, U> for Map<F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
{
    fn apply(&self, upstream: ItemStream<T>, _env: &StageEnv) -> ItemStream<U> {
        let func = self.func.clone();
        Box::new(upstream.map(move |item| item.map(|value| func(value))))
    }
}

/// Applies a fallible function, reporting failures at their input position.
pub struct TryMap<F> {
    func: Arc<F>,
}

impl<F> TryMap<F> {
    pub fn new(func: F) -> Self {
        Self { func: Arc::new(func) }
    }
}

impl<T, U, E, F> Stage<T, U> for TryMap<F>
where
    T: Send + 'static,
    U: Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    F: Fn(T) -> std::result::Result<U, E> + Send + Sync + 'static,
{
    fn apply(&self, upstream: ItemStream<T>, _env: &StageEnv) -> ItemStream<U> {
        let func = self.func.clone();
        Box::new(upstream.enumerate().map(move |(position, item)| {
            let value = item?;
            func(value).map_err(|e| IterStreamError::map(position as u64, e))
        }))
    }
}

/// Drops items the predicate rejects.
pub struct Filter<F> {
    predicate: Arc<F>,
}

impl<F> Filter<F> {
    pub fn new(predicate: F) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }
}

impl<T, F> Stage<T, T> for Filter<F>
where
    T: Send + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn apply(&self, upstream: ItemStream<T>, _env: &StageEnv) -> ItemStream<T> {
        let predicate = self.predicate.clone();
        Box::new(upstream.filter(move |item| match item {
            Ok(value) => predicate(value),
            Err(_) => true,
        }))
    }
}

/// Yields at most `n` items.
///
/// Upstream is dropped as soon as the budget is spent, so stages above it
/// release their resources without being pulled again.
#[derive(Debug, Clone, Copy)]
pub struct Take {
    n: usize,
}

impl Take {
    pub fn new(n: usize) -> Self {
        Self { n }
    }
}

impl<T: Send + 'static> Stage<T, T> for Take {
    fn apply(&self, upstream: ItemStream<T>, _env: &StageEnv) -> ItemStream<T> {
        Box::new(TakeIter {
            upstream: Some(upstream),
            remaining: self.n,
        })
    }
}

struct TakeIter<T> {
    upstream: Option<ItemStream<T>>,
    remaining: usize,
}

impl<T> Iterator for TakeIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            self.upstream = None;
            return None;
        }
        match self.upstream.as_mut()?.next() {
            Some(item) => {
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.upstream = None;
                }
                Some(item)
            }
            None => {
                self.upstream = None;
                None
            }
        }
    }
}

/// Pairs each item with its index in this stage's input.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipIndex;

impl<T: Send + 'static> Stage<T, (usize, T)> for ZipIndex {
    fn apply(&self, upstream: ItemStream<T>, _env: &StageEnv) -> ItemStream<(usize, T)> {
        Box::new(
            upstream
                .enumerate()
                .map(|(index, item)| item.map(|value| (index, value))),
        )
    }
}

/// Flattens items that are themselves iterable.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

impl<T, U> Stage<T, U> for Flatten
where
    T: IntoIterator<Item = U> + Send + 'static,
    T::IntoIter: Send + 'static,
    U: Send + 'static,
{
    fn apply(&self, upstream: ItemStream<T>, _env: &StageEnv) -> ItemStream<U> {
        Box::new(FlattenIter {
            upstream,
            current: None,
        })
    }
}

struct FlattenIter<T: IntoIterator> {
    upstream: ItemStream<T>,
    current: Option<T::IntoIter>,
}

impl<T: IntoIterator> Iterator for FlattenIter<T> {
    type Item = Result<T::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(inner) = self.current.as_mut() {
                if let Some(value) = inner.next() {
                    return Some(Ok(value));
                }
                self.current = None;
            }
            match self.upstream.next()? {
                Ok(nested) => self.current = Some(nested.into_iter()),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Groups consecutive items into vectors of `size`.
///
/// The last batch holds whatever remains and may be shorter. An upstream
/// error is yielded as soon as it is seen; the partial batch collected so far
/// is kept and continues filling afterwards.
#[derive(Debug, Clone, Copy)]
pub struct Batched {
    size: usize,
}

impl Batched {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl<T: Send + 'static> Stage<T, Vec<T>> for Batched {
    fn apply(&self, upstream: ItemStream<T>, _env: &StageEnv) -> ItemStream<Vec<T>> {
        if self.size == 0 {
            return Box::new(std::iter::once(Err(IterStreamError::config(
                "batch size must be greater than 0",
            ))));
        }
        Box::new(BatchedIter {
            upstream,
            size: self.size,
            buffer: Vec::with_capacity(self.size),
            exhausted: false,
        })
    }
}

struct BatchedIter<T> {
    upstream: ItemStream<T>,
    size: usize,
    buffer: Vec<T>,
    exhausted: bool,
}

impl<T> Iterator for BatchedIter<T> {
    type Item = Result<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.exhausted {
            match self.upstream.next() {
                Some(Ok(value)) => {
                    self.buffer.push(value);
                    if self.buffer.len() == self.size {
                        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.size));
                        return Some(Ok(batch));
                    }
                }
                Some(Err(e)) => return Some(Err(e)),
                None => self.exhausted = true,
            }
        }

        if self.buffer.is_empty() {
            None
        } else {
            Some(Ok(std::mem::take(&mut self.buffer)))
        }
    }
}
