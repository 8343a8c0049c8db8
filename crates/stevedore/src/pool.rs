//! Fixed-size worker pool with runtime sub-job dispatch.
//!
//! Two channels feed the workers: the bounded *main* queue carries
//! top-level input, the unbounded *sub-job* queue receives what batch
//! expansion produces while it runs. A pump task forwards sub-jobs into the
//! main queue so workers only ever dequeue from one place, and polls an
//! idle counter to detect drain: input exhausted, every worker idle, both
//! queues empty. Workers enqueueing sub-jobs never block, so a pool whose
//! every worker is expanding cannot deadlock on its own output.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{client::StorageResolver, config::EngineConfig, handler, job::Job};

/// Cadence of the pump's idle poll.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, typed_builder::TypedBuilder)]
pub struct PoolParams {
    /// Degree of parallelism.
    #[builder(default = 256)]
    pub workers: usize,
    /// Main queue capacity; feeding applies backpressure beyond it.
    #[builder(default = 1024)]
    pub queue_capacity: usize,
}

impl Default for PoolParams {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl From<&EngineConfig> for PoolParams {
    fn from(config: &EngineConfig) -> Self {
        Self {
            workers: config.workers,
            queue_capacity: config.queue_capacity,
        }
    }
}

/// Totals of one pool run. Sub-jobs count individually; a skip is not a
/// failure. The caller maps `failed > 0` to its exit code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl RunSummary {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl Counters {
    pub(crate) fn add_completed(&self, n: u64) {
        self.completed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_failed(&self, n: u64) {
        self.failed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_skipped(&self, n: u64) {
        self.skipped.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RunSummary {
        RunSummary {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Everything a handler needs, injected instead of global.
#[derive(Debug, Clone)]
pub(crate) struct JobContext {
    pub(crate) resolver: StorageResolver,
    pub(crate) cancel: CancellationToken,
    pub(crate) counters: Arc<Counters>,
}

pub struct WorkerPool {
    main_tx: async_channel::Sender<Job>,
    feeding_done: Arc<AtomicBool>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    workers: Vec<JoinHandle<()>>,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    #[must_use]
    pub fn new(resolver: StorageResolver, params: &PoolParams, cancel: CancellationToken) -> Self {
        let worker_count = params.workers.max(1);
        let (main_tx, main_rx) = async_channel::bounded(params.queue_capacity.max(1));
        let (sub_tx, sub_rx) = async_channel::unbounded();

        let idle = Arc::new(AtomicUsize::new(0));
        let feeding_done = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());
        let ctx = JobContext {
            resolver,
            cancel: cancel.clone(),
            counters: Arc::clone(&counters),
        };

        let workers = (0..worker_count)
            .map(|_| {
                tokio::spawn(worker_loop(
                    ctx.clone(),
                    main_rx.clone(),
                    sub_tx.clone(),
                    Arc::clone(&idle),
                ))
            })
            .collect();
        drop(sub_tx);

        let pump = tokio::spawn(pump_loop(
            main_tx.clone(),
            sub_rx,
            idle,
            worker_count,
            Arc::clone(&feeding_done),
            cancel.clone(),
        ));

        Self {
            main_tx,
            feeding_done,
            cancel,
            counters,
            workers,
            pump,
        }
    }

    /// Submit one job and wait until it and all its transitive sub-jobs
    /// have drained.
    pub async fn run(self, job: Job) -> RunSummary {
        self.run_stream(futures::stream::iter(std::iter::once(job)))
            .await
    }

    /// Feed a stream of jobs into the pool, then wait for drain. Returns
    /// when the stream is exhausted (or cancellation fired) and no job or
    /// sub-job remains in flight.
    pub async fn run_stream(self, jobs: impl Stream<Item = Job>) -> RunSummary {
        futures::pin_mut!(jobs);
        loop {
            let job = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                job = jobs.next() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            if self.main_tx.send(job).await.is_err() {
                break;
            }
        }
        self.feeding_done.store(true, Ordering::SeqCst);

        for worker in self.workers {
            let _ = worker.await;
        }
        let _ = self.pump.await;
        self.counters.snapshot()
    }
}

async fn worker_loop(
    ctx: JobContext,
    main_rx: async_channel::Receiver<Job>,
    sub_tx: async_channel::Sender<Job>,
    idle: Arc<AtomicUsize>,
) {
    loop {
        idle.fetch_add(1, Ordering::SeqCst);
        let received = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => return,
            received = main_rx.recv() => received,
        };
        idle.fetch_sub(1, Ordering::SeqCst);

        match received {
            Ok(job) => handler::run_job(&ctx, job, &sub_tx).await,
            Err(_closed) => return,
        }
    }
}

async fn pump_loop(
    main_tx: async_channel::Sender<Job>,
    sub_rx: async_channel::Receiver<Job>,
    idle: Arc<AtomicUsize>,
    worker_count: usize,
    feeding_done: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut quiet_ticks = 0u32;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                main_tx.close();
                return;
            }
            received = sub_rx.recv() => match received {
                Ok(job) => {
                    quiet_ticks = 0;
                    // The forward can block on a full main queue; racing the
                    // token keeps cancellation from stranding the pump there.
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            main_tx.close();
                            return;
                        }
                        sent = main_tx.send(job) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                // Every worker has exited and dropped its sender.
                Err(_closed) => {
                    main_tx.close();
                    return;
                }
            },
            _ = tick.tick() => {
                let drained = feeding_done.load(Ordering::SeqCst)
                    && idle.load(Ordering::SeqCst) == worker_count
                    && sub_rx.is_empty()
                    && main_tx.is_empty();
                if drained {
                    quiet_ticks += 1;
                } else {
                    quiet_ticks = 0;
                }
                // A second consecutive quiet poll closes the window on a
                // job dequeued between the idle load and the busy mark.
                if quiet_ticks >= 2 {
                    main_tx.close();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_params_defaults() {
        let params = PoolParams::default();
        assert_eq!(params.workers, 256);
        assert_eq!(params.queue_capacity, 1024);
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = Counters::default();
        counters.add_completed(3);
        counters.add_failed(1);
        counters.add_skipped(2);
        let summary = counters.snapshot();
        assert_eq!(
            summary,
            RunSummary {
                completed: 3,
                failed: 1,
                skipped: 2
            }
        );
        assert!(!summary.is_clean());
        assert!(RunSummary::default().is_clean());
    }
}
