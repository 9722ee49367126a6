//! Event loop (C7): the public surface of the execution layer. Owns N
//! workers' SPSC producer ends and the dispatch policy that feeds them.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::aggregator::Aggregator;
use crate::request::RequestSpec;
use crate::spsc::{self, Producer};
use crate::transfer::Outcome;
use crate::worker::{Job, StopMode, Worker, WorkerConfig};

/// Spin-then-yield bound before the dispatcher escalates to a short sleep
/// while a worker's SPSC stays full (§4.6 "backs off rather than dropping").
const DISPATCH_SPIN_ITERS: u32 = 128;

pub struct EventLoopConfig {
    pub worker_count: usize,
    pub concurrency_per_worker: usize,
    pub save_timing_breakdown: bool,
    pub queue_capacity: usize,
    /// Grace window each worker escalates a graceful stop to forced after.
    pub stop_grace: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            concurrency_per_worker: 64,
            save_timing_breakdown: false,
            queue_capacity: 1024,
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// A collection of workers plus the submission policy in front of them.
/// Every worker is constructed without its own rate limiter: `constant_rps`
/// gates admission at the run controller, upstream of `submit` (see
/// DESIGN.md); the other modes never rate-gate by RPS at all.
pub struct EventLoop {
    producers: Vec<Producer<Job>>,
    stop_tx: watch::Sender<StopMode>,
    worker_tasks: Mutex<Vec<JoinHandle<(u64, u64)>>>,
    next_request_id: AtomicU64,
    round_robin: AtomicUsize,
    aggregator: Aggregator,
}

impl EventLoop {
    pub fn start(
        config: EventLoopConfig,
        client: Client,
        aggregator: Aggregator,
        aggregator_tx: mpsc::Sender<Outcome>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(StopMode::Running);
        let mut producers = Vec::with_capacity(config.worker_count);
        let mut worker_tasks = Vec::with_capacity(config.worker_count);

        for id in 0..config.worker_count.max(1) {
            let (producer, consumer) = spsc::channel::<Job>(config.queue_capacity);
            let worker = Worker::new(
                WorkerConfig {
                    id,
                    concurrency_share: config.concurrency_per_worker.max(1),
                    save_timing_breakdown: config.save_timing_breakdown,
                },
                client.clone(),
                consumer,
                None,
                aggregator_tx.clone(),
                stop_rx.clone(),
            );
            let grace = config.stop_grace;
            worker_tasks.push(tokio::spawn(async move { worker.run(grace).await }));
            producers.push(producer);
        }

        Self {
            producers,
            stop_tx,
            worker_tasks: Mutex::new(worker_tasks),
            next_request_id: AtomicU64::new(0),
            round_robin: AtomicUsize::new(0),
            aggregator,
        }
    }

    /// Dispatches `spec` to a worker and returns a future resolving to its
    /// outcome. Records the admission with the aggregator at the point the
    /// job actually enters a worker's queue, matching the glossary's
    /// definition of "admission."
    pub fn submit(&self, spec: Arc<RequestSpec>) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let idx = self.worker_index_for(&spec);
        let job = Job {
            request_id,
            spec,
            completion: Some(tx),
        };
        self.dispatch(idx, job);
        self.aggregator.record_admission();
        rx
    }

    /// Round-robin by submission order, with worker affinity per
    /// connection target when the host is known -- a hostname hash keeps
    /// repeated requests to the same host on the same worker so its
    /// `reqwest::Client` can reuse keep-alive connections.
    fn worker_index_for(&self, spec: &RequestSpec) -> usize {
        match spec.host() {
            Some(host) => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                host.hash(&mut hasher);
                (hasher.finish() as usize) % self.producers.len()
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % self.producers.len(),
        }
    }

    fn dispatch(&self, idx: usize, mut job: Job) {
        loop {
            match self.producers[idx].try_push(job) {
                Ok(()) => return,
                Err(returned) => {
                    job = returned;
                    for _ in 0..DISPATCH_SPIN_ITERS {
                        std::hint::spin_loop();
                    }
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Requests currently admitted but not yet outcome-published, summed
    /// across the process (active in-flight plus still-queued).
    pub fn active_and_pending(&self) -> u64 {
        self.aggregator
            .total_admitted()
            .saturating_sub(self.aggregator.total_outcomes())
    }

    pub fn pending(&self) -> usize {
        self.producers.iter().map(|p| p.len()).sum()
    }

    pub fn worker_count(&self) -> usize {
        self.producers.len()
    }

    /// A cheap clone of the stop signal. A run controller holds onto this
    /// independently of the `EventLoop`'s own lifetime so a second
    /// `POST /runs/{id}/stop` can escalate an in-progress graceful stop to
    /// forced without needing to re-borrow the event loop itself.
    pub fn stop_handle(&self) -> watch::Sender<StopMode> {
        self.stop_tx.clone()
    }

    /// Waits for every worker task to exit, returning each one's final
    /// `(total_created, total_reused)` handle-pool tally (§8 property 8).
    /// Safe to call more than once: the second call simply finds nothing
    /// left to await.
    pub async fn join(&self) -> Vec<(u64, u64)> {
        let tasks: Vec<_> = self.worker_tasks.lock().await.drain(..).collect();
        let mut tallies = Vec::with_capacity(tasks.len());
        for task in tasks {
            tallies.push(task.await.unwrap_or((0, 0)));
        }
        tallies
    }

    /// Signals every worker to stop, then waits for each to exit.
    pub async fn stop(&self, wait_for_pending: bool) -> Vec<(u64, u64)> {
        let mode = if wait_for_pending {
            StopMode::Graceful
        } else {
            StopMode::Forced
        };
        let _ = self.stop_tx.send(mode);
        self.join().await
    }
}
