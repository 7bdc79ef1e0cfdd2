// iterstream-core/src/pipeline/async_map.rs

//! Order-preserving concurrent mapping.
//!
//! Items pulled from upstream are submitted to a fixed pool of threads. Each
//! submission gets its own single-slot reply channel, and the reply channels
//! are queued in submission order, so results come back in input order even
//! when the pool finishes them out of order.
//!
//! At most `max_in_flight` items are submitted ahead of the consumer, which
//! bounds memory use no matter how slow the consumer is.
//!
//! When the mapping function fails for an item, the failure is yielded at
//! that item's position as `IterStreamError::Map` (or `MapWorkerLost` if the
//! function panicked). Earlier results are unaffected. What happens next
//! depends on [`FailurePolicy`]:
//!
//! - `Stop`: submitted work that has not yet started is cancelled, the pool is
//!   joined, and the stream ends.
//! - `Continue`: items already submitted complete normally and mapping goes on.
//!
//! The pool is started at the first pull and released when the stream is
//! exhausted, stopped, or dropped. Release joins the pool threads, so a
//! mapping call that never returns blocks the release.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use crate::config::{AsyncMapConfig, FailurePolicy, MapExecutor};
use crate::error::{IterStreamError, Result};

use super::traits::{ItemStream, Stage, StageEnv};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type MapFn<T, U> = Arc<dyn Fn(T) -> std::result::Result<U, BoxError> + Send + Sync>;

/// Stage running a mapping function on a thread pool.
pub struct AsyncMap<T, U> {
    func: MapFn<T, U>,
    config: AsyncMapConfig,
}

impl<T, U> AsyncMap<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    /// Creates the stage from a fallible function.
    pub fn new<E, F>(func: F, config: AsyncMapConfig) -> Self
    where
        E: Into<BoxError> + 'static,
        F: Fn(T) -> std::result::Result<U, E> + Send + Sync + 'static,
    {
        let func: MapFn<T, U> = Arc::new(move |item: T| func(item).map_err(Into::<BoxError>::into));
        Self { func, config }
    }

    /// Creates the stage from a function that cannot fail.
    pub fn infallible<F>(func: F, config: AsyncMapConfig) -> Self
    where
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let func: MapFn<T, U> = Arc::new(move |item: T| Ok::<U, BoxError>(func(item)));
        Self { func, config }
    }

    pub fn config(&self) -> &AsyncMapConfig {
        &self.config
    }
}

impl<T, U> Stage<T, U> for AsyncMap<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn apply(&self, upstream: ItemStream<T>, _env: &StageEnv) -> ItemStream<U> {
        Box::new(AsyncMapStream::new(upstream, self.func.clone(), self.config.clone()))
    }
}

struct Job<T, U> {
    position: u64,
    item: T,
    reply: Sender<Result<U>>,
}

enum Slot<U> {
    /// An upstream error, passed through at its position.
    Upstream(IterStreamError),
    /// The job could not be queued.
    Lost(u64),
    InFlight { position: u64, reply: Receiver<Result<U>> },
}

/// Threads plus the job queue feeding them.
struct WorkerPool<T, U> {
    jobs: Option<Sender<Job<T, U>>>,
    stop_flag: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl<T, U> WorkerPool<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn start(func: MapFn<T, U>, workers: usize, window: usize) -> Result<Self> {
        let (jobs_tx, jobs_rx) = channel::bounded::<Job<T, U>>(window);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let mut pool = Self {
            jobs: Some(jobs_tx),
            stop_flag: stop_flag.clone(),
            handles: Vec::with_capacity(workers),
        };

        for index in 0..workers {
            let jobs_rx = jobs_rx.clone();
            let func = func.clone();
            let stop_flag = stop_flag.clone();
            let handle = thread::Builder::new()
                .name(format!("iterstream-map-{index}"))
                .spawn(move || run_worker(jobs_rx, func, stop_flag))
                .map_err(|e| IterStreamError::config_with_source("failed to spawn mapping worker", e))?;
            pool.handles.push(handle);
        }

        tracing::debug!(workers, window, "started mapping pool");
        Ok(pool)
    }

    /// Queues a job. Returns the job back if every worker is gone.
    fn submit(&self, job: Job<T, U>) -> std::result::Result<(), Job<T, U>> {
        match &self.jobs {
            Some(jobs) => jobs.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }
}

impl<T, U> Drop for WorkerPool<T, U> {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.jobs.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        tracing::debug!("stopped mapping pool");
    }
}

fn run_worker<T, U>(jobs: Receiver<Job<T, U>>, func: MapFn<T, U>, stop_flag: Arc<AtomicBool>) {
    while let Ok(job) = jobs.recv() {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }

        let Job {
            position,
            item,
            reply,
        } = job;
        let result = match panic::catch_unwind(AssertUnwindSafe(|| func(item))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(IterStreamError::map(position, e)),
            Err(_) => Err(IterStreamError::map_worker_lost(position)),
        };
        // The consumer may have gone away; nothing to do then.
        let _ = reply.send(result);
    }
}

struct AsyncMapStream<T, U> {
    upstream: ItemStream<T>,
    func: MapFn<T, U>,
    config: AsyncMapConfig,
    pool: Option<WorkerPool<T, U>>,
    pending: VecDeque<Slot<U>>,
    position: u64,
    upstream_done: bool,
    started: bool,
    stopped: bool,
}

impl<T, U> AsyncMapStream<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn new(upstream: ItemStream<T>, func: MapFn<T, U>, config: AsyncMapConfig) -> Self {
        Self {
            upstream,
            func,
            config,
            pool: None,
            pending: VecDeque::new(),
            position: 0,
            upstream_done: false,
            started: false,
            stopped: false,
        }
    }

    fn start(&mut self) -> Result<()> {
        self.started = true;
        self.config.validate()?;
        if self.config.executor == MapExecutor::Threads {
            self.pool = Some(WorkerPool::start(
                self.func.clone(),
                self.config.workers,
                self.config.window(),
            )?);
        }
        Ok(())
    }

    /// Pulls from upstream until the in-flight window is full.
    fn fill(&mut self) {
        let window = self.config.window();
        while !self.upstream_done && self.pending.len() < window {
            let position = self.position;
            match self.upstream.next() {
                Some(Ok(item)) => {
                    self.position += 1;
                    let slot = self.submit(position, item);
                    self.pending.push_back(slot);
                }
                Some(Err(e)) => {
                    self.position += 1;
                    self.pending.push_back(Slot::Upstream(e));
                }
                None => self.upstream_done = true,
            }
        }
    }

    fn submit(&mut self, position: u64, item: T) -> Slot<U> {
        let pool = match &self.pool {
            Some(pool) => pool,
            None => return Slot::Lost(position),
        };
        let (reply, receiver) = channel::bounded(1);
        match pool.submit(Job {
            position,
            item,
            reply,
        }) {
            Ok(()) => Slot::InFlight {
                position,
                reply: receiver,
            },
            Err(_) => Slot::Lost(position),
        }
    }

    // Both return the next result and whether this stage produced it.

    fn next_inline(&mut self) -> Option<(Result<U>, bool)> {
        let position = self.position;
        let item = self.upstream.next()?;
        self.position += 1;
        let value = match item {
            Ok(value) => value,
            Err(e) => return Some((Err(e), false)),
        };
        let result = match panic::catch_unwind(AssertUnwindSafe(|| (self.func)(value))) {
            Ok(Ok(mapped)) => Ok(mapped),
            Ok(Err(e)) => Err(IterStreamError::map(position, e)),
            Err(_) => Err(IterStreamError::map_worker_lost(position)),
        };
        Some((result, true))
    }

    fn next_pooled(&mut self) -> Option<(Result<U>, bool)> {
        self.fill();
        match self.pending.pop_front() {
            Some(Slot::Upstream(e)) => Some((Err(e), false)),
            Some(Slot::Lost(position)) => Some((Err(IterStreamError::map_worker_lost(position)), true)),
            Some(Slot::InFlight { position, reply }) => {
                let result = reply
                    .recv()
                    .unwrap_or_else(|_| Err(IterStreamError::map_worker_lost(position)));
                Some((result, true))
            }
            None => {
                self.release();
                None
            }
        }
    }

    /// Drops queued work and joins the pool.
    fn release(&mut self) {
        self.pending.clear();
        self.pool = None;
    }
}

impl<T, U> Iterator for AsyncMapStream<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    type Item = Result<U>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped {
            return None;
        }
        if !self.started {
            if let Err(e) = self.start() {
                self.stopped = true;
                return Some(Err(e));
            }
        }

        let (result, mapped_here) = match self.config.executor {
            MapExecutor::Threads => self.next_pooled()?,
            MapExecutor::Inline => self.next_inline()?,
        };

        if mapped_here && result.is_err() && self.config.failure_policy == FailurePolicy::Stop {
            tracing::debug!("mapping failed, stopping stream");
            self.stopped = true;
            self.release();
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::Hasher;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use twox_hash::XxHash64;

    use crate::pipeline::{source, Composable};

    fn jitter(x: u64) -> Duration {
        let mut hasher = XxHash64::with_seed(7);
        hasher.write_u64(x);
        Duration::from_millis(hasher.finish() % 15)
    }

    #[test]
    fn test_preserves_order_under_random_delays() {
        let out = source((0..10u64).collect::<Vec<_>>())
            .async_map_with(
                |x| {
                    thread::sleep(jitter(x));
                    x * 2
                },
                AsyncMapConfig::with_workers(4),
            )
            .collect()
            .unwrap();
        assert_eq!(out, (0..10).map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_reverse_completion_order() {
        // Earlier items sleep longest, so completions arrive backwards.
        let out = source((0..8u64).collect::<Vec<_>>())
            .async_map_with(
                |x| {
                    thread::sleep(Duration::from_millis((8 - x) * 5));
                    x
                },
                AsyncMapConfig::with_workers(8),
            )
            .collect()
            .unwrap();
        assert_eq!(out, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_in_flight_window_bounds_upstream_pulls() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = pulls.clone();
        let pipeline = Composable::from_fn(move || {
            let counter = counter.clone();
            (0u64..).inspect(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
        .async_map_with(|x| x + 1, AsyncMapConfig::with_workers(2).max_in_flight(3));

        let mut iter = pipeline.iter();
        assert_eq!(pulls.load(Ordering::SeqCst), 0);
        assert_eq!(iter.next().unwrap().unwrap(), 1);
        assert_eq!(pulls.load(Ordering::SeqCst), 3);
        assert_eq!(iter.next().unwrap().unwrap(), 2);
        assert_eq!(pulls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_stop_policy_ends_after_failure() {
        let out: Vec<_> = source((0..10u32).collect::<Vec<_>>())
            .try_async_map(
                |x| if x == 3 { Err("bad item") } else { Ok(x) },
                AsyncMapConfig::with_workers(3),
            )
            .iter()
            .collect();
        assert_eq!(out.len(), 4);
        assert_eq!(out[..3].iter().map(|r| *r.as_ref().unwrap()).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(matches!(out[3], Err(IterStreamError::Map { position: 3, .. })));
    }

    #[test]
    fn test_continue_policy_keeps_going() {
        let config = AsyncMapConfig::with_workers(3).failure_policy(FailurePolicy::Continue);
        let out: Vec<_> = source((0..10u32).collect::<Vec<_>>())
            .try_async_map(|x| if x % 4 == 1 { Err("bad item") } else { Ok(x) }, config)
            .iter()
            .collect();
        assert_eq!(out.len(), 10);
        for (position, result) in out.iter().enumerate() {
            if position % 4 == 1 {
                assert!(matches!(result, Err(IterStreamError::Map { position: p, .. }) if *p == position as u64));
            } else {
                assert_eq!(*result.as_ref().unwrap(), position as u32);
            }
        }
    }

    #[test]
    fn test_panic_is_reported_at_position() {
        let config = AsyncMapConfig::with_workers(2).failure_policy(FailurePolicy::Continue);
        let out: Vec<_> = source((0..4u32).collect::<Vec<_>>())
            .async_map_with(
                |x| {
                    if x == 2 {
                        panic!("mapping exploded");
                    }
                    x
                },
                config,
            )
            .iter()
            .collect();
        assert_eq!(out.len(), 4);
        assert!(matches!(out[2], Err(IterStreamError::MapWorkerLost { position: 2 })));
        assert_eq!(*out[3].as_ref().unwrap(), 3);
    }

    #[test]
    fn test_upstream_errors_pass_through_in_place() {
        let items: Vec<std::result::Result<u32, std::io::Error>> = vec![
            Ok(1),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "bad record")),
            Ok(3),
        ];
        let out: Vec<_> = Composable::from_fallible(items)
            .async_map(|x| x * 10)
            .iter()
            .collect();
        assert_eq!(out.len(), 3);
        assert_eq!(*out[0].as_ref().unwrap(), 10);
        assert!(matches!(out[1], Err(IterStreamError::Source { .. })));
        assert_eq!(*out[2].as_ref().unwrap(), 30);
    }

    #[test]
    fn test_upstream_map_error_does_not_stop() {
        let out: Vec<_> = source(vec![1i32, -1, 2])
            .try_map(|x| if x < 0 { Err("negative") } else { Ok(x) })
            .async_map(|x| x * 10)
            .iter()
            .collect();
        assert_eq!(out.len(), 3);
        assert!(matches!(out[1], Err(IterStreamError::Map { position: 1, .. })));
        assert_eq!(*out[2].as_ref().unwrap(), 20);
    }

    #[test]
    fn test_drop_mid_stream_releases_pool() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let pipeline = Composable::from_fn(|| 0u64..).async_map_with(
            move |x| {
                counter.fetch_add(1, Ordering::SeqCst);
                x
            },
            AsyncMapConfig::with_workers(2).max_in_flight(4),
        );

        let mut iter = pipeline.iter();
        assert_eq!(iter.next().unwrap().unwrap(), 0);
        assert_eq!(iter.next().unwrap().unwrap(), 1);
        drop(iter);

        // Pool is joined on drop, so no more calls can happen afterwards.
        let after_drop = calls.load(Ordering::SeqCst);
        assert!(after_drop <= 6);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), after_drop);
    }

    #[test]
    fn test_inline_executor() {
        let config = AsyncMapConfig::default().executor(MapExecutor::Inline);
        let out = source(vec![1, 2, 3])
            .async_map_with(|x| x + 1, config)
            .collect()
            .unwrap();
        assert_eq!(out, vec![2, 3, 4]);
    }

    #[test]
    fn test_zero_workers_fails_at_first_pull() {
        let pipeline = source(vec![1, 2, 3]).async_map_with(|x| x, AsyncMapConfig::with_workers(0));
        let mut iter = pipeline.iter();
        assert!(matches!(iter.next(), Some(Err(IterStreamError::Config { .. }))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_rebuilt_in_worker_thread() {
        // The stage is rebuilt from its description on another thread, the
        // way a spawned loader worker reconstructs the pipeline.
        let pipeline = source((0..20u32).collect::<Vec<_>>()).async_map(|x| x * 2);
        let forked = pipeline.fork();
        let handle = thread::spawn(move || forked.collect().unwrap());
        let out = handle.join().unwrap();
        assert_eq!(out, pipeline.collect().unwrap());
    }
}
