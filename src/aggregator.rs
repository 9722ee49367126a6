//! Metrics aggregator (C9).
//!
//! Single-writer model: every worker holds a clone of a bounded
//! `tokio::sync::mpsc::Sender<Outcome>`; one dedicated task per run drains
//! the matching `Receiver` and is the only writer to the histograms and
//! sample buffer. Cumulative counters are plain `AtomicU64`s so readers
//! (the live stream, the HTTP API, the final report) can take a
//! copy-on-read [`Snapshot`] without taking the aggregator task's lock at
//! all -- per §5's "one lock acquisition per outcome at most" on the
//! ingress side, and none at all on the read side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::ErrorKind;
use crate::percentiles::{LatencyReport, LatencySummary};
use crate::run_profile::RetentionConfig;
use crate::transfer::Outcome;

/// Ingress channel capacity. Generous relative to any single worker's
/// admission batch size so a momentary aggregator stall applies
/// backpressure to workers (via the bounded mpsc) rather than ever
/// dropping an outcome.
const INGRESS_CAPACITY: usize = 65_536;

/// Bounded ring of periodic cumulative-counter readings, used to compute
/// windowed rate metrics (`current_rps`, `send_rate`, `throughput_bps`,
/// `backpressure`) without storing a timestamp per outcome.
const SAMPLE_RING_CAPACITY: usize = 600; // 250ms tick * 600 = 150s of history

#[derive(Clone, Copy)]
struct RingSample {
    at: Instant,
    admitted: u64,
    completed: u64,
    errored: u64,
    bytes_in: u64,
    bytes_out: u64,
}

struct SampleRing {
    buf: std::collections::VecDeque<RingSample>,
}

impl SampleRing {
    fn new() -> Self {
        Self {
            buf: std::collections::VecDeque::with_capacity(SAMPLE_RING_CAPACITY),
        }
    }

    fn push(&mut self, sample: RingSample) {
        if self.buf.len() == SAMPLE_RING_CAPACITY {
            self.buf.pop_front();
        }
        self.buf.push_back(sample);
    }

    /// The most recent sample at or before `window_ago` before `now`, used
    /// as the baseline for a windowed-rate computation.
    fn baseline(&self, now: Instant, window: std::time::Duration) -> Option<RingSample> {
        let cutoff = now.checked_sub(window)?;
        self.buf.iter().rev().find(|s| s.at <= cutoff).copied()
    }
}

/// Bounded per-request trace capture, governed by [`RetentionConfig`].
struct SampleBuffer {
    errors: Vec<Outcome>,
    slow: Vec<Outcome>,
    success: Vec<Outcome>,
    retention: RetentionConfig,
}

impl SampleBuffer {
    fn new(retention: RetentionConfig) -> Self {
        Self {
            errors: Vec::new(),
            slow: Vec::new(),
            success: Vec::new(),
            retention,
        }
    }

    /// Applies the sampling policy from §4.9: errors always captured (up to
    /// `M_err`); slow outcomes always captured (up to `M_slow`); otherwise
    /// successful outcomes are captured with probability
    /// `success_sample_rate/100` (up to `M_ok`). An outcome is stored at
    /// most once, under the first bucket it qualifies for -- error, then
    /// slow, then sampled-success.
    fn maybe_capture(&mut self, outcome: &Outcome) {
        if outcome.is_error() {
            if self.errors.len() < self.retention.max_error_samples {
                self.errors.push(outcome.clone());
            }
            return;
        }
        if outcome.latency_ms >= self.retention.slow_threshold_ms {
            if self.slow.len() < self.retention.max_slow_samples {
                self.slow.push(outcome.clone());
            }
            return;
        }
        if self.success.len() < self.retention.max_success_samples {
            let roll: u8 = rand::thread_rng().gen_range(0..100);
            if roll < self.retention.success_sample_rate {
                self.success.push(outcome.clone());
            }
        }
    }

    fn all(&self) -> Vec<Outcome> {
        let mut all = Vec::with_capacity(self.errors.len() + self.slow.len() + self.success.len());
        all.extend(self.errors.iter().cloned());
        all.extend(self.slow.iter().cloned());
        all.extend(self.success.iter().cloned());
        all
    }
}

/// Shared, lock-light counters plus the lock-guarded histograms/sample
/// buffer. Readers go through `Aggregator`'s methods; only the ingestion
/// task (spawned by [`Aggregator::spawn`]) ever locks `inner`.
struct Shared {
    started_at: Instant,
    total_completed: AtomicU64,
    total_errored: AtomicU64,
    total_admitted: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    latency_sum_ms_bits: AtomicU64, // f64 bit pattern accumulator, see `add_latency`
    inner: Mutex<Inner>,
}

struct Inner {
    status_histogram: HashMap<u16, u64>,
    error_histogram: HashMap<ErrorKind, u64>,
    latency: LatencySummary,
    ring: SampleRing,
    samples: SampleBuffer,
}

fn add_latency_ms(shared: &Shared, ms: f64) {
    // AtomicU64 has no float add; accumulate under a CAS loop on the bit
    // pattern. Contended only by the single ingestion task in practice.
    let mut current = shared.latency_sum_ms_bits.load(Ordering::Relaxed);
    loop {
        let current_f = f64::from_bits(current);
        let next = (current_f + ms).to_bits();
        match shared.latency_sum_ms_bits.compare_exchange_weak(
            current,
            next,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

/// Point-in-time read of aggregator counters, used by the live stream
/// (§4.8) and the HTTP API. Cheap to construct: no histogram queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp_unix_ms: u64,
    pub elapsed_seconds: f64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub current_rps: f64,
    pub avg_latency_ms: f64,
    pub active_connections: u64,
    pub send_rate: f64,
    pub throughput_bps: f64,
    pub backpressure: f64,
}

/// Final, stable-after-freeze statistical report (§3 "Outcome record" /
/// §4.9 "Final report is assembled once at end-of-run").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub total_requests: u64,
    pub successful: u64,
    pub errored: u64,
    pub status_code_histogram: HashMap<u16, u64>,
    pub error_kind_histogram: HashMap<ErrorKind, u64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub latency: LatencyReport,
    pub elapsed_seconds: f64,
}

/// Handle to a run's metrics aggregator. Cheap to clone (an `Arc` around
/// the shared counters); every worker and the run controller hold a clone
/// alongside their own `mpsc::Sender<Outcome>`.
#[derive(Clone)]
pub struct Aggregator {
    shared: std::sync::Arc<Shared>,
}

impl Aggregator {
    /// Spawns the aggregator's ingestion task and returns the handle plus
    /// the `Sender` workers publish outcomes through.
    pub fn spawn(retention: RetentionConfig) -> (Self, mpsc::Sender<Outcome>) {
        let shared = std::sync::Arc::new(Shared {
            started_at: Instant::now(),
            total_completed: AtomicU64::new(0),
            total_errored: AtomicU64::new(0),
            total_admitted: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            latency_sum_ms_bits: AtomicU64::new(0.0f64.to_bits()),
            inner: Mutex::new(Inner {
                status_histogram: HashMap::new(),
                error_histogram: HashMap::new(),
                latency: LatencySummary::new(),
                ring: SampleRing::new(),
                samples: SampleBuffer::new(retention),
            }),
        });

        let (tx, mut rx) = mpsc::channel::<Outcome>(INGRESS_CAPACITY);
        let aggregator = Aggregator {
            shared: shared.clone(),
        };

        tokio::spawn(async move {
            while let Some(outcome) = rx.recv().await {
                Self::ingest(&shared, outcome);
            }
            debug!("aggregator ingestion task exiting: all senders dropped");
        });

        (aggregator, tx)
    }

    /// Records one admitted request (called by the run controller /
    /// event loop at admission time, independent of the outcome path).
    pub fn record_admission(&self) {
        self.shared.total_admitted.fetch_add(1, Ordering::Relaxed);
    }

    fn ingest(shared: &Shared, outcome: Outcome) {
        if outcome.is_error() {
            shared.total_errored.fetch_add(1, Ordering::Relaxed);
        } else {
            shared.total_completed.fetch_add(1, Ordering::Relaxed);
        }
        shared.bytes_in.fetch_add(outcome.bytes_received, Ordering::Relaxed);
        shared.bytes_out.fetch_add(outcome.bytes_sent, Ordering::Relaxed);
        add_latency_ms(shared, outcome.latency_ms);

        let mut inner = shared.inner.lock().unwrap();
        *inner.status_histogram.entry(outcome.status_code).or_insert(0) += 1;
        *inner.error_histogram.entry(outcome.error_kind).or_insert(0) += 1;
        inner.latency.record_ms(outcome.latency_ms);
        inner.samples.maybe_capture(&outcome);
    }

    /// Pushes a cumulative-counter reading into the ring buffer used for
    /// windowed rate computation. Called by the live stream's tick task
    /// (§4.8) on the same cadence it emits snapshots.
    pub fn tick_sample(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.ring.push(RingSample {
            at: Instant::now(),
            admitted: self.shared.total_admitted.load(Ordering::Relaxed),
            completed: self.shared.total_completed.load(Ordering::Relaxed),
            errored: self.shared.total_errored.load(Ordering::Relaxed),
            bytes_in: self.shared.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.shared.bytes_out.load(Ordering::Relaxed),
        });
    }

    pub fn total_completed(&self) -> u64 {
        self.shared.total_completed.load(Ordering::Relaxed)
    }

    pub fn total_errored(&self) -> u64 {
        self.shared.total_errored.load(Ordering::Relaxed)
    }

    pub fn total_admitted(&self) -> u64 {
        self.shared.total_admitted.load(Ordering::Relaxed)
    }

    /// `total_completed + total_errored`: the outcomes counter that must
    /// equal `total_admitted` at end-of-run (invariant in §3/§8).
    pub fn total_outcomes(&self) -> u64 {
        self.total_completed() + self.total_errored()
    }

    /// Point-in-time, copy-on-read snapshot (§4.8). `window` is the
    /// sliding window over which rate metrics are computed (1s per spec).
    pub fn snapshot(&self, window: std::time::Duration) -> Snapshot {
        let now = Instant::now();
        let total_completed = self.total_completed();
        let total_errored = self.total_errored();
        let total_admitted = self.total_admitted();
        let bytes_in = self.shared.bytes_in.load(Ordering::Relaxed);
        let bytes_out = self.shared.bytes_out.load(Ordering::Relaxed);

        let (current_rps, send_rate, throughput_bps) = {
            let inner = self.shared.inner.lock().unwrap();
            match inner.ring.baseline(now, window) {
                Some(baseline) => {
                    let dt = now.duration_since(baseline.at).as_secs_f64().max(1e-6);
                    let completed_delta =
                        (total_completed + total_errored).saturating_sub(baseline.completed + baseline.errored);
                    let admitted_delta = total_admitted.saturating_sub(baseline.admitted);
                    let bytes_delta = (bytes_in + bytes_out)
                        .saturating_sub(baseline.bytes_in + baseline.bytes_out);
                    (
                        completed_delta as f64 / dt,
                        admitted_delta as f64 / dt,
                        bytes_delta as f64 / dt,
                    )
                }
                None => (0.0, 0.0, 0.0),
            }
        };

        let total_outcomes = total_completed + total_errored;
        let active_connections = total_admitted.saturating_sub(total_outcomes);
        let backpressure = if total_admitted == 0 {
            0.0
        } else {
            (total_admitted.saturating_sub(total_outcomes) as f64 / total_admitted.max(1) as f64)
                .clamp(0.0, 1.0)
        };

        let avg_latency_ms = if total_outcomes == 0 {
            0.0
        } else {
            f64::from_bits(self.shared.latency_sum_ms_bits.load(Ordering::Relaxed)) / total_outcomes as f64
        };

        Snapshot {
            timestamp_unix_ms: unix_millis_now(),
            elapsed_seconds: now.duration_since(self.shared.started_at).as_secs_f64(),
            total_requests: total_outcomes,
            total_errors: total_errored,
            current_rps,
            avg_latency_ms,
            active_connections,
            send_rate,
            throughput_bps,
            backpressure,
        }
    }

    /// Assembles the final report once at end-of-run. Stable thereafter:
    /// nothing in the aggregator is mutated after the run transitions out
    /// of `running`.
    pub fn report(&self, percentiles: &[f64]) -> Report {
        let inner = self.shared.inner.lock().unwrap();
        Report {
            total_requests: self.total_completed() + self.total_errored(),
            successful: self.total_completed(),
            errored: self.total_errored(),
            status_code_histogram: inner.status_histogram.clone(),
            error_kind_histogram: inner.error_histogram.clone(),
            bytes_sent: self.shared.bytes_out.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_in.load(Ordering::Relaxed),
            latency: inner.latency.report(percentiles),
            elapsed_seconds: Instant::now().duration_since(self.shared.started_at).as_secs_f64(),
        }
    }

    /// Sampled per-request traces captured under the retention policy
    /// (`GET /runs/{id}/results`).
    pub fn samples(&self) -> Vec<Outcome> {
        self.shared.inner.lock().unwrap().samples.all()
    }
}

fn unix_millis_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_else(|e| {
            warn!(error = %e, "system clock before unix epoch");
            0
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TimingBreakdown;

    fn success(request_id: u64, latency_ms: f64) -> Outcome {
        Outcome {
            request_id,
            start_time_unix_ms: 0,
            status_code: 200,
            latency_ms,
            error_kind: ErrorKind::None,
            timing: TimingBreakdown::default(),
            bytes_sent: 100,
            bytes_received: 1000,
            captured_request_headers: None,
            captured_response_headers: None,
            captured_response_body: None,
        }
    }

    fn error(request_id: u64, kind: ErrorKind) -> Outcome {
        Outcome {
            request_id,
            start_time_unix_ms: 0,
            status_code: 0,
            latency_ms: 5.0,
            error_kind: kind,
            timing: TimingBreakdown::default(),
            bytes_sent: 0,
            bytes_received: 0,
            captured_request_headers: None,
            captured_response_headers: None,
            captured_response_body: None,
        }
    }

    #[tokio::test]
    async fn total_requests_equals_successful_plus_errored() {
        let (agg, tx) = Aggregator::spawn(RetentionConfig::default());
        for i in 0..10u64 {
            agg.record_admission();
            tx.send(success(i, 5.0)).await.unwrap();
        }
        for i in 10..13u64 {
            agg.record_admission();
            tx.send(error(i, ErrorKind::Timeout)).await.unwrap();
        }
        drop(tx);
        // Give the ingestion task a chance to drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let report = agg.report(&[50.0, 99.0]);
        assert_eq!(report.total_requests, report.successful + report.errored);
        assert_eq!(report.successful, 10);
        assert_eq!(report.errored, 3);
    }

    #[tokio::test]
    async fn error_outcomes_are_always_captured_up_to_cap() {
        let mut retention = RetentionConfig::default();
        retention.max_error_samples = 2;
        let (agg, tx) = Aggregator::spawn(retention);
        for i in 0..5u64 {
            agg.record_admission();
            tx.send(error(i, ErrorKind::Connect)).await.unwrap();
        }
        drop(tx);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(agg.samples().len(), 2);
    }

    #[tokio::test]
    async fn backpressure_is_bounded_zero_to_one() {
        let (agg, tx) = Aggregator::spawn(RetentionConfig::default());
        for i in 0..5u64 {
            agg.record_admission();
            if i < 2 {
                tx.send(success(i, 1.0)).await.unwrap();
            }
        }
        drop(tx);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        agg.tick_sample();
        let snap = agg.snapshot(std::time::Duration::from_secs(1));
        assert!((0.0..=1.0).contains(&snap.backpressure));
    }

    #[tokio::test]
    async fn snapshot_counters_are_monotonic_over_time() {
        let (agg, tx) = Aggregator::spawn(RetentionConfig::default());
        agg.tick_sample();
        let first = agg.snapshot(std::time::Duration::from_secs(1));
        for i in 0..5u64 {
            agg.record_admission();
            tx.send(success(i, 1.0)).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        agg.tick_sample();
        let second = agg.snapshot(std::time::Duration::from_secs(1));
        assert!(second.total_requests >= first.total_requests);
        assert!(second.elapsed_seconds >= first.elapsed_seconds);
    }
}
