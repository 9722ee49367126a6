//! Live stream (C10): a periodic snapshot emitter with a completion
//! sentinel and reconnection support.
//!
//! Transport-agnostic: this module owns the ticking and the
//! `tokio::sync::broadcast` fan-out; `api.rs` wraps a subscription into an
//! `axum::response::sse::Sse` response. A lagging SSE subscriber is simply
//! dropped by the broadcast channel and must re-subscribe -- "reconnection
//! re-subscribes from the current snapshot; there is no gap-fill" (§4.8).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::aggregator::{Aggregator, Snapshot};

/// Default live-stream tick, per §4.8.
pub const DEFAULT_TICK: Duration = Duration::from_millis(250);
/// Window used for the rate metrics embedded in each snapshot.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// One event on the live stream: a periodic metrics snapshot, or the
/// terminal sentinel sent exactly once when the run reaches a terminal
/// state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Metrics(Snapshot),
    Complete(Snapshot),
}

/// Bounded broadcast fan-out of a run's live metrics, plus the recorded
/// sample history a completed run replays through `GET /runs/{id}/stats`.
pub struct LiveStream {
    tx: broadcast::Sender<StreamEvent>,
    recorded: Arc<Mutex<Vec<Snapshot>>>,
}

/// Recorded-sample history is unbounded in principle but a run's lifetime
/// bounds it in practice (one entry per tick); cap defensively so a
/// pathologically long run cannot grow memory without limit.
const MAX_RECORDED_SNAPSHOTS: usize = 100_000;

impl LiveStream {
    /// Spawns the ticking task. `terminal` flips to `true` exactly once,
    /// when the owning run controller has observed the run's end
    /// condition; the tick task then emits one final snapshot as
    /// `Complete` and exits.
    pub fn spawn(aggregator: Aggregator, tick: Duration, mut terminal: watch::Receiver<bool>) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        let recorded = Arc::new(Mutex::new(Vec::new()));

        let tx_task = tx.clone();
        let recorded_task = recorded.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let snapshot = sample(&aggregator);
                        push_recorded(&recorded_task, snapshot.clone());
                        let _ = tx_task.send(StreamEvent::Metrics(snapshot));
                    }
                    changed = terminal.changed() => {
                        if changed.is_err() {
                            // Sender dropped without ever signaling
                            // completion -- still emit a terminal event so
                            // subscribers don't hang.
                            let snapshot = sample(&aggregator);
                            push_recorded(&recorded_task, snapshot.clone());
                            let _ = tx_task.send(StreamEvent::Complete(snapshot));
                            break;
                        }
                        if *terminal.borrow() {
                            let snapshot = sample(&aggregator);
                            push_recorded(&recorded_task, snapshot.clone());
                            let _ = tx_task.send(StreamEvent::Complete(snapshot));
                            debug!("live stream emitted terminal complete event");
                            break;
                        }
                    }
                }
            }
        });

        Self { tx, recorded }
    }

    /// A fresh subscription, "re-subscribing from the current snapshot."
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    /// The full recorded sample history, for `GET /runs/{id}/stats`
    /// replay against a completed run.
    pub fn recorded_snapshots(&self) -> Vec<Snapshot> {
        self.recorded.lock().unwrap().clone()
    }
}

fn sample(aggregator: &Aggregator) -> Snapshot {
    aggregator.tick_sample();
    aggregator.snapshot(RATE_WINDOW)
}

fn push_recorded(recorded: &Arc<Mutex<Vec<Snapshot>>>, snapshot: Snapshot) {
    let mut guard = recorded.lock().unwrap();
    if guard.len() >= MAX_RECORDED_SNAPSHOTS {
        guard.remove(0);
    }
    guard.push(snapshot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_profile::RetentionConfig;

    #[tokio::test]
    async fn emits_a_terminal_complete_event_on_signal() {
        let (aggregator, _tx) = Aggregator::spawn(RetentionConfig::default());
        let (terminal_tx, terminal_rx) = watch::channel(false);
        let stream = LiveStream::spawn(aggregator, Duration::from_millis(20), terminal_rx);
        let mut sub = stream.subscribe();

        terminal_tx.send(true).unwrap();

        let mut saw_complete = false;
        for _ in 0..20 {
            match tokio::time::timeout(Duration::from_millis(200), sub.recv()).await {
                Ok(Ok(StreamEvent::Complete(_))) => {
                    saw_complete = true;
                    break;
                }
                Ok(Ok(StreamEvent::Metrics(_))) => continue,
                _ => break,
            }
        }
        assert!(saw_complete, "expected a terminal complete event");
    }

    #[tokio::test]
    async fn recorded_snapshots_accumulate_across_ticks() {
        let (aggregator, _tx) = Aggregator::spawn(RetentionConfig::default());
        let (_terminal_tx, terminal_rx) = watch::channel(false);
        let stream = LiveStream::spawn(aggregator, Duration::from_millis(10), terminal_rx);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(stream.recorded_snapshots().len() >= 2);
    }
}
