//! Run controller (C8): translates a run profile into a submission
//! schedule against an [`EventLoop`], enforces the end condition, and owns
//! the run's terminal-status state machine.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::aggregator::Aggregator;
use crate::event_loop::{EventLoop, EventLoopConfig};
use crate::live_stream::{LiveStream, DEFAULT_TICK};
use crate::rate_limiter::RateLimiter;
use crate::request::RequestSpec;
use crate::run_profile::RunMode;
use crate::run_profile::RunProfile;
use crate::worker::StopMode;

/// A run's lifecycle state. `Pending` is transient (set at construction,
/// before the supervisor task has run its first tick); every other state
/// but `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Stopped | RunStatus::Failed)
    }
}

/// Result of a `request_stop` call, distinguishing the first call
/// (graceful), a second call on an in-progress stop (forced escalation),
/// and a call against an already-terminal run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AcceptedGraceful,
    EscalatedForced,
    AlreadyTerminal,
}

/// Owns one run end-to-end: its event loop, its aggregator, its live
/// stream, and the background task driving admission per the run's mode.
pub struct RunController {
    id: Uuid,
    profile: RunProfile,
    aggregator: Aggregator,
    live_stream: LiveStream,
    status_tx: watch::Sender<RunStatus>,
    stop_tx: watch::Sender<StopMode>,
    stop_requested: AtomicBool,
    started_at: Instant,
}

impl RunController {
    /// Builds every piece of the pipeline for one run and spawns the
    /// supervisor task that drives it to completion. Returns immediately;
    /// the run transitions to `running` from within the spawned task.
    pub fn start(
        id: Uuid,
        profile: RunProfile,
        request_spec: RequestSpec,
        client: Client,
        event_loop_config: EventLoopConfig,
    ) -> Arc<RunController> {
        let (aggregator, aggregator_tx) = Aggregator::spawn(profile.retention);
        let (terminal_tx, terminal_rx) = watch::channel(false);
        let live_stream = LiveStream::spawn(aggregator.clone(), DEFAULT_TICK, terminal_rx);

        let event_loop = Arc::new(EventLoop::start(
            event_loop_config,
            client,
            aggregator.clone(),
            aggregator_tx,
        ));
        let stop_tx = event_loop.stop_handle();
        let (status_tx, _status_rx) = watch::channel(RunStatus::Pending);

        let controller = Arc::new(RunController {
            id,
            profile,
            aggregator,
            live_stream,
            status_tx,
            stop_tx,
            stop_requested: AtomicBool::new(false),
            started_at: Instant::now(),
        });

        let supervisor = controller.clone();
        let spec = Arc::new(request_spec);
        tokio::spawn(async move {
            supervisor.run_supervisor(spec, event_loop, terminal_tx).await;
        });

        controller
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn profile(&self) -> &RunProfile {
        &self.profile
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn live_stream(&self) -> &LiveStream {
        &self.live_stream
    }

    pub fn status(&self) -> RunStatus {
        *self.status_tx.borrow()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// `POST /runs/{id}/stop`: first call requests a graceful stop; a
    /// second call (while the first is still draining) escalates to
    /// forced. A call against an already-terminal run is a no-op reported
    /// back to the caller rather than silently accepted.
    pub fn request_stop(&self) -> StopOutcome {
        if self.status().is_terminal() {
            return StopOutcome::AlreadyTerminal;
        }
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            let _ = self.stop_tx.send(StopMode::Forced);
            StopOutcome::EscalatedForced
        } else {
            let _ = self.stop_tx.send(StopMode::Graceful);
            StopOutcome::AcceptedGraceful
        }
    }

    /// Awaits the run reaching a terminal status. Used by tests and by any
    /// caller that wants to block until a run's final report is stable.
    pub async fn wait_until_terminal(&self) {
        let mut rx = self.status_tx.subscribe();
        loop {
            if rx.borrow().is_terminal() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn run_supervisor(
        self: Arc<Self>,
        spec: Arc<RequestSpec>,
        event_loop: Arc<EventLoop>,
        terminal_tx: watch::Sender<bool>,
    ) {
        let _ = self.status_tx.send(RunStatus::Running);
        info!(run_id = %self.id, mode = self.profile.mode.label(), "run started");
        let stop_rx = self.stop_tx.subscribe();

        match self.profile.mode {
            RunMode::ConstantRps {
                target_rps,
                duration_seconds,
            } => {
                drive_constant_rps(
                    &event_loop,
                    &spec,
                    target_rps,
                    Duration::from_secs(duration_seconds),
                    stop_rx.clone(),
                )
                .await;
            }
            RunMode::ConstantConcurrency {
                concurrency,
                duration_seconds,
            } => {
                drive_constant_concurrency(
                    event_loop.clone(),
                    spec.clone(),
                    concurrency,
                    Duration::from_secs(duration_seconds),
                    stop_rx.clone(),
                )
                .await;
            }
            RunMode::Iterations {
                iterations,
                concurrency,
            } => {
                drive_iterations(event_loop.clone(), spec.clone(), iterations, concurrency, stop_rx.clone())
                    .await;
            }
            RunMode::RampUp {
                concurrency,
                ramp_duration_seconds,
                duration_seconds,
            } => {
                drive_ramp_up(
                    event_loop.clone(),
                    spec.clone(),
                    concurrency,
                    Duration::from_secs(ramp_duration_seconds),
                    Duration::from_secs(duration_seconds),
                    stop_rx.clone(),
                )
                .await;
            }
        }

        // The admission loop only stops early on an explicit stop signal;
        // a natural end (duration/iterations exhausted) still needs a
        // graceful drain of whatever is in flight. Never downgrade an
        // already-forced stop back to graceful.
        if *self.stop_tx.borrow() == StopMode::Running {
            let _ = self.stop_tx.send(StopMode::Graceful);
        }
        event_loop.join().await;

        let final_status = if self.stop_requested.load(Ordering::Relaxed) {
            RunStatus::Stopped
        } else {
            RunStatus::Completed
        };
        let _ = self.status_tx.send(final_status);
        let _ = terminal_tx.send(true);
        info!(run_id = %self.id, status = ?final_status, "run finished");
    }
}

async fn drive_constant_rps(
    event_loop: &EventLoop,
    spec: &Arc<RequestSpec>,
    target_rps: f64,
    duration: Duration,
    mut stop_rx: watch::Receiver<StopMode>,
) {
    let limiter = RateLimiter::with_default_burst(target_rps.max(0.0));
    let deadline = Instant::now() + duration;
    loop {
        if *stop_rx.borrow() != StopMode::Running || Instant::now() >= deadline {
            break;
        }
        tokio::select! {
            _ = limiter.acquire() => {
                let _ = event_loop.submit(spec.clone());
            }
            _ = stop_rx.changed() => {}
        }
    }
}

async fn drive_constant_concurrency(
    event_loop: Arc<EventLoop>,
    spec: Arc<RequestSpec>,
    concurrency: usize,
    duration: Duration,
    stop_rx: watch::Receiver<StopMode>,
) {
    let deadline = Instant::now() + duration;
    let mut lanes = tokio::task::JoinSet::new();
    for _ in 0..concurrency.max(1) {
        let event_loop = event_loop.clone();
        let spec = spec.clone();
        let mut stop_rx = stop_rx.clone();
        lanes.spawn(async move {
            loop {
                if *stop_rx.borrow() != StopMode::Running || Instant::now() >= deadline {
                    break;
                }
                let rx = event_loop.submit(spec.clone());
                tokio::select! {
                    _ = rx => {}
                    _ = stop_rx.changed() => { break; }
                }
            }
        });
    }
    while lanes.join_next().await.is_some() {}
}

async fn drive_iterations(
    event_loop: Arc<EventLoop>,
    spec: Arc<RequestSpec>,
    iterations: u64,
    concurrency: usize,
    stop_rx: watch::Receiver<StopMode>,
) {
    let remaining = Arc::new(AtomicI64::new(iterations as i64));
    let lane_count = concurrency.max(1).min(iterations.max(1) as usize);
    let mut lanes = tokio::task::JoinSet::new();
    for _ in 0..lane_count {
        let event_loop = event_loop.clone();
        let spec = spec.clone();
        let remaining = remaining.clone();
        let mut stop_rx = stop_rx.clone();
        lanes.spawn(async move {
            loop {
                if *stop_rx.borrow() != StopMode::Running {
                    break;
                }
                if remaining.fetch_sub(1, Ordering::Relaxed) <= 0 {
                    break;
                }
                let rx = event_loop.submit(spec.clone());
                tokio::select! {
                    _ = rx => {}
                    _ = stop_rx.changed() => { break; }
                }
            }
        });
    }
    while lanes.join_next().await.is_some() {}
}

async fn drive_ramp_up(
    event_loop: Arc<EventLoop>,
    spec: Arc<RequestSpec>,
    concurrency: usize,
    ramp_duration: Duration,
    hold_duration: Duration,
    stop_rx: watch::Receiver<StopMode>,
) {
    let start = Instant::now();
    let total_deadline = start + ramp_duration + hold_duration;
    let mut lanes = tokio::task::JoinSet::new();
    let mut spawned = 0usize;
    let mut tick = tokio::time::interval(Duration::from_millis(100));

    loop {
        tick.tick().await;
        if *stop_rx.borrow() != StopMode::Running || Instant::now() >= total_deadline {
            break;
        }
        let elapsed = start.elapsed();
        let target = if elapsed < ramp_duration {
            ((concurrency as f64) * elapsed.as_secs_f64() / ramp_duration.as_secs_f64().max(1e-6)).ceil()
                as usize
        } else {
            concurrency
        };
        while spawned < target.min(concurrency) {
            let event_loop = event_loop.clone();
            let spec = spec.clone();
            let mut stop_rx = stop_rx.clone();
            lanes.spawn(async move {
                loop {
                    if *stop_rx.borrow() != StopMode::Running || Instant::now() >= total_deadline {
                        break;
                    }
                    let rx = event_loop.submit(spec.clone());
                    tokio::select! {
                        _ = rx => {}
                        _ = stop_rx.changed() => { break; }
                    }
                }
            });
            spawned += 1;
        }
    }

    while lanes.join_next().await.is_some() {}
}
