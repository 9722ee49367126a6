//! Worker (C6): owns one I/O multiplexer, one handle pool, an optional
//! per-worker rate-limiter view, and one SPSC consumer end.
//!
//! §4.5.1 concretizes the "native I/O multiplexer" as a bounded
//! `tokio::task::JoinSet<(Outcome, TransferHandle)>`: registering a
//! transfer is spawning it onto the set (up to the worker's concurrency
//! share), polling the multiplexer is `join_next_with_id` under a bounded
//! timeout, reaping is consuming the finished values it yields. The
//! transport is one shared `reqwest::Client` per worker; hyper's own pool
//! beneath it stands in for socket-level handle reuse, while [`HandlePool`]
//! reuses the higher-level [`TransferHandle`] scratch state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::errors::ErrorKind;
use crate::handle_pool::{HandlePool, TransferHandle};
use crate::rate_limiter::UnlockedRateLimiter;
use crate::request::RequestSpec;
use crate::spsc::Consumer;
use crate::transfer::{Outcome, TimingBreakdown};

/// Maximum response body retained on a published [`Outcome`]. Bounds
/// per-request memory at high throughput; full `bytes_received` counts are
/// unaffected, only the captured copy is truncated.
const MAX_CAPTURED_BODY_BYTES: usize = 64 * 1024;

/// Jobs are drained from the SPSC in batches no larger than this, bounded
/// further by the worker's remaining concurrency share.
const ADMISSION_BATCH: usize = 128;

/// Bounded poll timeout for the multiplexer (tens of ms per §4.5 step 4).
const POLL_TIMEOUT: Duration = Duration::from_millis(20);

/// One request handed to a worker's queue. Carries an optional completion
/// channel so `EventLoop::submit` can return a future (§4.6, §9
/// "Callbacks vs. futures").
pub struct Job {
    pub request_id: u64,
    pub spec: Arc<RequestSpec>,
    pub completion: Option<oneshot::Sender<Outcome>>,
}

/// Stop signal a run controller drives a worker with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Running,
    /// Finish in-flight and already-queued work; escalates to `Forced`
    /// automatically once `deadline` passes.
    Graceful,
    /// Cancel everything immediately.
    Forced,
}

struct ActiveEntry {
    request_id: u64,
    start: Instant,
    start_unix_ms: u64,
    callback: Option<oneshot::Sender<Outcome>>,
}

/// Configuration fixed for a worker's lifetime.
pub struct WorkerConfig {
    pub id: usize,
    pub concurrency_share: usize,
    pub save_timing_breakdown: bool,
}

/// Owns one logical multiplexer and drains its SPSC queue to completion.
pub struct Worker {
    config: WorkerConfig,
    client: Client,
    handle_pool: HandlePool,
    consumer: Consumer<Job>,
    limiter: Option<UnlockedRateLimiter>,
    aggregator_tx: mpsc::Sender<Outcome>,
    pending: VecDeque<Job>,
    active: JoinSet<(Outcome, TransferHandle)>,
    active_meta: HashMap<tokio::task::Id, ActiveEntry>,
    stop_rx: watch::Receiver<StopMode>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        client: Client,
        consumer: Consumer<Job>,
        limiter: Option<UnlockedRateLimiter>,
        aggregator_tx: mpsc::Sender<Outcome>,
        stop_rx: watch::Receiver<StopMode>,
    ) -> Self {
        Self {
            config,
            client,
            handle_pool: HandlePool::new(),
            consumer,
            limiter,
            aggregator_tx,
            pending: VecDeque::new(),
            active: JoinSet::new(),
            active_meta: HashMap::new(),
            stop_rx,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Runs until the SPSC is drained and stop is forced, or until a
    /// graceful stop's grace window elapses (whichever first). Returns the
    /// handle pool's final counters for leak-checking (§8 property 8).
    pub async fn run(mut self, grace: Duration) -> (u64, u64) {
        let mut grace_deadline: Option<Instant> = None;

        loop {
            let mode = *self.stop_rx.borrow();
            if mode == StopMode::Graceful && grace_deadline.is_none() {
                grace_deadline = Some(Instant::now() + grace);
            }
            let forced = mode == StopMode::Forced
                || grace_deadline.map(|d| Instant::now() >= d).unwrap_or(false);

            if forced {
                self.cancel_all().await;
                break;
            }

            if mode == StopMode::Running {
                self.admit_from_queue();
            }
            // In Graceful mode, stop pulling *new* submissions: the
            // dispatcher stops calling submit() once stop is requested, so
            // the SPSC simply drains to empty; what remains in `pending`
            // and `active` still runs to completion.
            self.dispatch_pending();

            if mode != StopMode::Running && self.pending.is_empty() && self.active.is_empty() {
                break;
            }

            self.poll_once().await;
        }

        (self.handle_pool.total_created(), self.handle_pool.total_reused())
    }

    fn admit_from_queue(&mut self) {
        let room = self
            .config
            .concurrency_share
            .saturating_sub(self.active.len() + self.pending.len());
        if room == 0 {
            return;
        }
        let batch = room.min(ADMISSION_BATCH);
        let mut drained = Vec::with_capacity(batch);
        self.consumer.drain_into(&mut drained, batch);
        self.pending.extend(drained);
    }

    /// Admits queued jobs into the multiplexer, rate-limiting if
    /// configured. A job that fails `try_acquire_unlocked` is pushed back
    /// to the front of `pending` -- "re-queue the job at the head" (§4.5
    /// step 2) -- and admission stops for this tick.
    fn dispatch_pending(&mut self) {
        while self.active.len() < self.config.concurrency_share {
            let Some(job) = self.pending.pop_front() else {
                break;
            };

            if let Some(limiter) = self.limiter.as_mut() {
                if !limiter.try_acquire_unlocked() {
                    self.pending.push_front(job);
                    break;
                }
            }

            self.spawn_transfer(job);
        }
    }

    fn spawn_transfer(&mut self, job: Job) {
        let handle = self.handle_pool.acquire();
        let client = self.client.clone();
        let spec = job.spec.clone();
        let save_timing_breakdown = self.config.save_timing_breakdown;
        let start = Instant::now();
        let start_unix_ms = unix_millis_now();

        let abort_handle = self.active.spawn(async move {
            execute_transfer(client, handle, job.request_id, spec, save_timing_breakdown).await
        });

        self.active_meta.insert(
            abort_handle.id(),
            ActiveEntry {
                request_id: job.request_id,
                start,
                start_unix_ms,
                callback: job.completion,
            },
        );
    }

    /// Polls the multiplexer with a bounded timeout, reaping whatever
    /// completed (§4.5 steps 4-5).
    async fn poll_once(&mut self) {
        if self.active.is_empty() {
            tokio::time::sleep(POLL_TIMEOUT).await;
            return;
        }

        match tokio::time::timeout(POLL_TIMEOUT, self.active.join_next_with_id()).await {
            Ok(Some(Ok((id, (outcome, handle))))) => {
                self.active_meta.remove(&id);
                self.handle_pool.release(handle);
                self.publish(outcome, None);
            }
            Ok(Some(Err(join_err))) => {
                let id = join_err.id();
                if let Some(meta) = self.active_meta.remove(&id) {
                    warn!(request_id = meta.request_id, error = %join_err, "transfer task panicked");
                    let outcome = Outcome {
                        request_id: meta.request_id,
                        start_time_unix_ms: meta.start_unix_ms,
                        status_code: 0,
                        latency_ms: meta.start.elapsed().as_secs_f64() * 1000.0,
                        error_kind: ErrorKind::Internal,
                        timing: TimingBreakdown::default(),
                        bytes_sent: 0,
                        bytes_received: 0,
                        captured_request_headers: None,
                        captured_response_headers: None,
                        captured_response_body: None,
                    };
                    self.publish(outcome, meta.callback);
                }
            }
            Ok(None) | Err(_) => {
                // Nothing finished within the poll window; loop again.
            }
        }
    }

    fn publish(&self, outcome: Outcome, callback: Option<oneshot::Sender<Outcome>>) {
        if let Err(e) = self.aggregator_tx.try_send(outcome.clone()) {
            warn!(error = %e, "aggregator ingress full or closed, falling back to blocking send");
            let tx = self.aggregator_tx.clone();
            let outcome_for_send = outcome.clone();
            tokio::spawn(async move {
                let _ = tx.send(outcome_for_send).await;
            });
        }
        if let Some(cb) = callback {
            let _ = cb.send(outcome);
        }
    }

    /// Forced stop: abort every active transfer and synthesize `cancelled`
    /// outcomes for it and for everything still only queued. A cancelled
    /// transfer's [`TransferHandle`] is dropped with the aborted task
    /// rather than released -- `HandlePool::net_allocated` then correctly
    /// reflects the still-outstanding handle (§8 property 8).
    async fn cancel_all(&mut self) {
        for job in self.pending.drain(..) {
            let outcome = Outcome::cancelled(job.request_id, unix_millis_now(), 0.0);
            let callback = job.completion;
            if let Err(e) = self.aggregator_tx.try_send(outcome.clone()) {
                debug!(error = %e, "aggregator ingress busy on cancellation, dropping live update");
            }
            if let Some(cb) = callback {
                let _ = cb.send(outcome);
            }
        }

        if self.active.is_empty() {
            return;
        }
        self.active.abort_all();
        while let Some(res) = self.active.join_next_with_id().await {
            let id = match &res {
                Ok((id, _)) => *id,
                Err(join_err) => join_err.id(),
            };
            let Some(meta) = self.active_meta.remove(&id) else {
                continue;
            };
            let outcome = Outcome::cancelled(
                meta.request_id,
                meta.start_unix_ms,
                meta.start.elapsed().as_secs_f64() * 1000.0,
            );
            if let Err(e) = self.aggregator_tx.try_send(outcome.clone()) {
                debug!(error = %e, "aggregator ingress busy on cancellation, dropping live update");
            }
            if let Some(cb) = meta.callback {
                let _ = cb.send(outcome);
            }
        }
    }
}

fn build_request(
    client: &Client,
    spec: &RequestSpec,
) -> Result<reqwest::RequestBuilder, ErrorKind> {
    let url = reqwest::Url::parse(&spec.url).map_err(|_| ErrorKind::InvalidUrl)?;
    let mut builder = client.request(spec.method.as_reqwest(), url);
    builder = builder.timeout(Duration::from_millis(spec.timeout_ms.max(1)));

    for (name, value) in &spec.headers {
        builder = builder.header(name, value);
    }

    builder = match &spec.auth {
        crate::request::AuthDescriptor::None => builder,
        crate::request::AuthDescriptor::Bearer { token } => builder.bearer_auth(token),
        crate::request::AuthDescriptor::Basic { user, pass } => {
            builder.basic_auth(user, Some(pass.clone()))
        }
        crate::request::AuthDescriptor::ApiKey {
            name,
            value,
            location,
        } => match location {
            crate::request::ApiKeyLocation::Header => builder.header(name, value),
            crate::request::ApiKeyLocation::Query => builder.query(&[(name, value)]),
        },
    };

    if let Some(body) = &spec.body {
        if let Some(mime) = spec.body_mime {
            builder = builder.header("Content-Type", mime.content_type());
        }
        builder = builder.body(body.clone());
    }

    Ok(builder)
}

/// Drives one transfer to completion and hands the (now-idle)
/// [`TransferHandle`] back so the caller can release it to the pool.
async fn execute_transfer(
    client: Client,
    mut handle: TransferHandle,
    request_id: u64,
    spec: Arc<RequestSpec>,
    save_timing_breakdown: bool,
) -> (Outcome, TransferHandle) {
    handle.state.begin(request_id, spec.clone(), save_timing_breakdown);
    let start = Instant::now();
    let start_unix_ms = unix_millis_now();
    let bytes_sent = spec.body.as_ref().map(|b| b.len() as u64).unwrap_or(0);

    let request = match build_request(&client, &spec) {
        Ok(r) => r,
        Err(kind) => {
            return (
                Outcome {
                    request_id,
                    start_time_unix_ms: start_unix_ms,
                    status_code: 0,
                    latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                    error_kind: kind,
                    timing: TimingBreakdown::default(),
                    bytes_sent: 0,
                    bytes_received: 0,
                    captured_request_headers: None,
                    captured_response_headers: None,
                    captured_response_body: None,
                },
                handle,
            );
        }
    };

    let outcome = match request.send().await {
        Ok(response) => {
            // reqwest doesn't expose per-phase dns/connect/tls timestamps;
            // everything up to response headers folds into first_byte_ms.
            let first_byte_ms = start.elapsed().as_secs_f64() * 1000.0;
            let status_code = response.status().as_u16();
            let response_headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
                .collect();

            match response.bytes().await {
                Ok(body) => {
                    let total_ms = start.elapsed().as_secs_f64() * 1000.0;
                    let download_ms = (total_ms - first_byte_ms).max(0.0);
                    let captured_len = body.len().min(MAX_CAPTURED_BODY_BYTES);

                    Outcome {
                        request_id,
                        start_time_unix_ms: start_unix_ms,
                        status_code,
                        latency_ms: total_ms,
                        error_kind: ErrorKind::None,
                        timing: TimingBreakdown {
                            dns_ms: 0.0,
                            connect_ms: 0.0,
                            tls_ms: 0.0,
                            first_byte_ms,
                            download_ms,
                            total_ms,
                        },
                        bytes_sent,
                        bytes_received: body.len() as u64,
                        captured_request_headers: Some(spec.headers.clone()),
                        captured_response_headers: Some(response_headers),
                        captured_response_body: Some(body[..captured_len].to_vec()),
                    }
                }
                Err(e) => transport_error_outcome(request_id, start_unix_ms, start, &e),
            }
        }
        Err(e) => transport_error_outcome(request_id, start_unix_ms, start, &e),
    };

    (outcome, handle)
}

fn transport_error_outcome(
    request_id: u64,
    start_unix_ms: u64,
    start: Instant,
    error: &reqwest::Error,
) -> Outcome {
    Outcome {
        request_id,
        start_time_unix_ms: start_unix_ms,
        status_code: 0,
        latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        error_kind: ErrorKind::from_reqwest_error(error),
        timing: TimingBreakdown::default(),
        bytes_sent: 0,
        bytes_received: 0,
        captured_request_headers: None,
        captured_response_headers: None,
        captured_response_body: None,
    }
}

fn unix_millis_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
