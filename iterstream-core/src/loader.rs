// iterstream-core/src/loader.rs

//! Multi-worker consumer for exported pipelines.
//!
//! `DataLoader` drives a [`LoaderIterable`] the way a training loop's data
//! loader does: each worker runs its own fork of the pipeline with an
//! injected [`WorkerInfo`], and the consumer takes items from the workers in
//! turn. Without workers the pipeline runs on the calling thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tokio::sync::mpsc;

use crate::config::LoaderConfig;
use crate::error::{IterStreamError, Result};
use crate::export::{CheckedIter, LoaderIterable};
use crate::sharding::WorkerInfo;

pub struct DataLoader<T> {
    dataset: LoaderIterable<T>,
    config: LoaderConfig,
}

impl<T: Send + 'static> DataLoader<T> {
    pub fn new(dataset: LoaderIterable<T>, num_workers: usize) -> Self {
        Self::with_config(dataset, LoaderConfig::with_workers(num_workers))
    }

    pub fn with_config(dataset: LoaderIterable<T>, config: LoaderConfig) -> Self {
        Self { dataset, config }
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn validate(&self) -> Result<()> {
        self.config.validate()?;
        if self.config.num_workers > 0 && !self.dataset.pipeline().is_restartable() {
            return Err(IterStreamError::config(
                "an exhaustible source cannot be shared between loader workers",
            ));
        }
        Ok(())
    }

    /// The pipeline copy worker `id` runs.
    fn worker_dataset(&self, id: usize) -> LoaderIterable<T> {
        let execution = self
            .dataset
            .pipeline()
            .execution_context()
            .clone()
            .with_worker_info(WorkerInfo::new(id, self.config.num_workers));
        self.dataset.fork(execution)
    }

    /// Starts one pass over the dataset.
    ///
    /// With workers, items come round-robin: worker 0's first item, then
    /// worker 1's, and so on, skipping workers that have finished. The first
    /// error from any worker is yielded and ends the pass.
    pub fn iter(&self) -> Result<LoaderIter<T>> {
        self.validate()?;

        if self.config.num_workers == 0 {
            let execution = self.dataset.pipeline().execution_context().clone();
            return Ok(LoaderIter {
                inner: LoaderIterInner::InProcess(self.dataset.fork(execution).iter()),
            });
        }

        let workers = self.config.num_workers;
        let stop_flag = Arc::new(AtomicBool::new(false));
        let mut receivers = Vec::with_capacity(workers);
        let mut threads = Vec::with_capacity(workers);

        for id in 0..workers {
            let (tx, rx) = channel::bounded(self.config.prefetch_per_worker);
            let dataset = self.worker_dataset(id);
            let stop_flag_clone = stop_flag.clone();

            let spawned = thread::Builder::new()
                .name(format!("iterstream-loader-{id}"))
                .spawn(move || run_worker(id, dataset, tx, stop_flag_clone));

            match spawned {
                Ok(handle) => {
                    receivers.push(Some(rx));
                    threads.push(handle);
                }
                Err(e) => {
                    // Dropping the partial set stops and joins what started.
                    drop(WorkerSet {
                        receivers,
                        current: 0,
                        remaining: 0,
                        stop_flag,
                        threads,
                    });
                    return Err(IterStreamError::config_with_source(
                        "failed to spawn loader worker",
                        e,
                    ));
                }
            }
        }

        tracing::debug!(workers, prefetch = self.config.prefetch_per_worker, "started loader workers");

        Ok(LoaderIter {
            inner: LoaderIterInner::Workers(WorkerSet {
                receivers,
                current: 0,
                remaining: workers,
                stop_flag,
                threads,
            }),
        })
    }

    /// Runs the workers as blocking tasks on the current tokio runtime.
    ///
    /// Items arrive in completion order across workers, not round-robin.
    /// Each worker stops after sending its first error. A worker that panics
    /// sends a `Loader` error before its sender is dropped.
    pub async fn spawn(&self) -> Result<mpsc::Receiver<Result<T>>> {
        self.validate()?;

        let workers = self.config.num_workers.max(1);
        let (tx, rx) = mpsc::channel(self.config.prefetch_per_worker * workers);

        if self.config.num_workers == 0 {
            let execution = self.dataset.pipeline().execution_context().clone();
            let dataset = self.dataset.fork(execution);
            tokio::task::spawn_blocking(move || forward_blocking(0, dataset, tx));
            return Ok(rx);
        }

        for id in 0..workers {
            let tx = tx.clone();
            let dataset = self.worker_dataset(id);
            tokio::task::spawn_blocking(move || forward_blocking(id, dataset, tx));
        }

        Ok(rx)
    }

    /// Collects a whole pass, failing on the first error.
    ///
    /// Use [`DataLoader::spawn`] for streaming access.
    pub async fn load_all(&self) -> Result<Vec<T>> {
        let mut rx = self.spawn().await?;
        let mut items = Vec::new();

        while let Some(result) = rx.recv().await {
            items.push(result?);
        }

        Ok(items)
    }
}

fn run_worker<T: Send + 'static>(
    id: usize,
    dataset: LoaderIterable<T>,
    tx: Sender<Result<T>>,
    stop_flag: Arc<AtomicBool>,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        for item in dataset.iter() {
            if stop_flag.load(Ordering::Relaxed) {
                return;
            }
            let failed = item.is_err();
            if tx.send(item).is_err() || failed {
                return; // Consumer gone, or error delivered
            }
        }
    }));

    if outcome.is_err() {
        tracing::warn!(worker_id = id, "loader worker panicked");
        let _ = tx.send(Err(IterStreamError::loader(id, "worker panicked")));
    }
}

fn forward_blocking<T: Send + 'static>(
    id: usize,
    dataset: LoaderIterable<T>,
    tx: mpsc::Sender<Result<T>>,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        for item in dataset.iter() {
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                return;
            }
        }
    }));

    if outcome.is_err() {
        tracing::warn!(worker_id = id, "loader worker panicked");
        let _ = tx.blocking_send(Err(IterStreamError::loader(id, "worker panicked")));
    }
}

/// Iterator returned by [`DataLoader::iter`].
pub struct LoaderIter<T> {
    inner: LoaderIterInner<T>,
}

enum LoaderIterInner<T> {
    InProcess(CheckedIter<T>),
    Workers(WorkerSet<T>),
}

impl<T> Iterator for LoaderIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            LoaderIterInner::InProcess(iter) => iter.next(),
            LoaderIterInner::Workers(set) => set.next_round_robin(),
        }
    }
}

struct WorkerSet<T> {
    /// One slot per worker; `None` once that worker is exhausted.
    receivers: Vec<Option<Receiver<Result<T>>>>,
    current: usize,
    remaining: usize,
    stop_flag: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl<T> WorkerSet<T> {
    fn next_round_robin(&mut self) -> Option<Result<T>> {
        while self.remaining > 0 {
            let index = self.current;
            self.current = (self.current + 1) % self.receivers.len();

            let Some(rx) = &self.receivers[index] else {
                continue;
            };

            match rx.recv() {
                Ok(Ok(item)) => return Some(Ok(item)),
                Ok(Err(e)) => {
                    self.shutdown();
                    return Some(Err(e));
                }
                Err(_) => {
                    // Disconnected: the worker finished its share
                    self.receivers[index] = None;
                    self.remaining -= 1;
                }
            }
        }
        None
    }

    fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.remaining = 0;
        // Unblocks workers waiting on a full channel
        self.receivers.clear();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("loader worker thread panicked during shutdown");
            }
        }
    }
}

impl<T> Drop for WorkerSet<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
