//! Run profile: the user-facing knobs a run controller (C8) translates into
//! a scheduling contract, plus the data-capture/retention knobs the
//! aggregator (C9) enforces.

use serde::{Deserialize, Serialize};

/// Default latency percentiles reported in the final report when the
/// caller does not specify a custom set.
pub const DEFAULT_PERCENTILES: [f64; 6] = [50.0, 75.0, 90.0, 95.0, 99.0, 99.9];

/// Admission policy a run is driven by. Modeled as a tagged variant rather
/// than a polymorphic hierarchy: there are exactly four, and they are
/// small and closed (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunMode {
    /// Admit at exactly `target_rps` for `duration_seconds`.
    ConstantRps {
        target_rps: f64,
        duration_seconds: u64,
    },
    /// Maintain `concurrency` in-flight transfers for `duration_seconds`.
    ConstantConcurrency {
        concurrency: usize,
        duration_seconds: u64,
    },
    /// Admit exactly `iterations` requests, up to `concurrency` in flight.
    Iterations { iterations: u64, concurrency: usize },
    /// Linear ramp from 0 to `concurrency` over `ramp_duration_seconds`,
    /// then hold at `concurrency` for `duration_seconds`.
    RampUp {
        concurrency: usize,
        ramp_duration_seconds: u64,
        duration_seconds: u64,
    },
}

impl RunMode {
    pub fn label(&self) -> &'static str {
        match self {
            RunMode::ConstantRps { .. } => "constant_rps",
            RunMode::ConstantConcurrency { .. } => "constant_concurrency",
            RunMode::Iterations { .. } => "iterations",
            RunMode::RampUp { .. } => "ramp_up",
        }
    }
}

/// Data-capture knobs governing what the aggregator retains per request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// 0-100. Probability a successful outcome is captured into the trace
    /// sample buffer.
    #[serde(default = "default_success_sample_rate")]
    pub success_sample_rate: u8,
    /// Outcomes at or above this latency are always captured (up to cap).
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: f64,
    /// Whether per-request timing breakdowns are retained on captured
    /// traces (dns/connect/tls/first_byte/download split) or only the
    /// total.
    #[serde(default)]
    pub save_timing_breakdown: bool,
    #[serde(default = "default_cap")]
    pub max_error_samples: usize,
    #[serde(default = "default_cap")]
    pub max_success_samples: usize,
    #[serde(default = "default_cap")]
    pub max_slow_samples: usize,
}

fn default_success_sample_rate() -> u8 {
    10
}
fn default_slow_threshold_ms() -> f64 {
    1000.0
}
fn default_cap() -> usize {
    1000
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            success_sample_rate: default_success_sample_rate(),
            slow_threshold_ms: default_slow_threshold_ms(),
            save_timing_breakdown: false,
            max_error_samples: default_cap(),
            max_success_samples: default_cap(),
            max_slow_samples: default_cap(),
        }
    }
}

/// A complete run profile: the admission policy plus retention and the
/// percentile set reported in the final report. Immutable once a run
/// starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunProfile {
    pub mode: RunMode,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<f64>,
}

fn default_percentiles() -> Vec<f64> {
    DEFAULT_PERCENTILES.to_vec()
}

impl RunProfile {
    /// Duration of the "hold" phase, used for end-of-run timing in every
    /// mode except `Iterations` (which ends on count, not time).
    pub fn duration_seconds(&self) -> Option<u64> {
        match self.mode {
            RunMode::ConstantRps {
                duration_seconds, ..
            }
            | RunMode::ConstantConcurrency {
                duration_seconds, ..
            }
            | RunMode::RampUp {
                duration_seconds, ..
            } => Some(duration_seconds),
            RunMode::Iterations { .. } => None,
        }
    }

    pub fn concurrency(&self) -> usize {
        match self.mode {
            RunMode::ConstantConcurrency { concurrency, .. }
            | RunMode::Iterations { concurrency, .. }
            | RunMode::RampUp { concurrency, .. } => concurrency,
            // constant_rps is not concurrency-bounded; size workers'
            // in-flight maps generously relative to the target rate.
            RunMode::ConstantRps { target_rps, .. } => (target_rps.ceil() as usize).max(1),
        }
    }
}
