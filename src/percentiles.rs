//! Latency quantile tracking (part of C9).
//!
//! Backed by `hdrhistogram::Histogram<u64>`, the same choice the prior
//! tool's `PercentileTracker` made: a fixed-granularity log-linear
//! histogram gives a bounded-memory structure whose relative error is
//! bounded by its significant-digit count (3 digits here, comfortably
//! under the 1% bound §4.9/§9 require), so callers only ever see the
//! query interface. Latencies are recorded in microseconds internally and
//! reported in milliseconds.

use hdrhistogram::Histogram;

const LOWEST_DISCERNIBLE_VALUE_US: u64 = 1;
const HIGHEST_TRACKABLE_VALUE_US: u64 = 60_000_000; // 60s
const SIGNIFICANT_DIGITS: u8 = 3;

/// Streaming latency summary supporting insertion and quantile queries
/// over every completed request in a run. One instance per run, owned by
/// the aggregator.
pub struct LatencySummary {
    histogram: Histogram<u64>,
}

impl LatencySummary {
    pub fn new() -> Self {
        let histogram = Histogram::new_with_bounds(
            LOWEST_DISCERNIBLE_VALUE_US,
            HIGHEST_TRACKABLE_VALUE_US,
            SIGNIFICANT_DIGITS,
        )
        .expect("valid hdrhistogram bounds");
        Self { histogram }
    }

    /// Records one latency sample, in milliseconds. Out-of-range samples
    /// are clamped rather than rejected: a single pathological timing must
    /// never abort a run.
    pub fn record_ms(&mut self, latency_ms: f64) {
        let us = (latency_ms * 1000.0).round().max(0.0) as u64;
        let us = us.clamp(LOWEST_DISCERNIBLE_VALUE_US, HIGHEST_TRACKABLE_VALUE_US);
        let _ = self.histogram.record(us);
    }

    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    /// Arbitrary percentile query, `p` in `[0, 100]`.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.histogram.is_empty() {
            return 0.0;
        }
        self.histogram.value_at_quantile(p / 100.0) as f64 / 1000.0
    }

    pub fn p50(&self) -> f64 {
        self.percentile(50.0)
    }
    pub fn p75(&self) -> f64 {
        self.percentile(75.0)
    }
    pub fn p90(&self) -> f64 {
        self.percentile(90.0)
    }
    pub fn p95(&self) -> f64 {
        self.percentile(95.0)
    }
    pub fn p99(&self) -> f64 {
        self.percentile(99.0)
    }
    pub fn p999(&self) -> f64 {
        self.percentile(99.9)
    }
    pub fn median(&self) -> f64 {
        self.p50()
    }

    pub fn min(&self) -> f64 {
        if self.histogram.is_empty() {
            0.0
        } else {
            self.histogram.min() as f64 / 1000.0
        }
    }

    pub fn max(&self) -> f64 {
        if self.histogram.is_empty() {
            0.0
        } else {
            self.histogram.max() as f64 / 1000.0
        }
    }

    pub fn avg(&self) -> f64 {
        if self.histogram.is_empty() {
            0.0
        } else {
            self.histogram.mean() / 1000.0
        }
    }

    /// Freezes the histogram's summary fields into a `LatencyReport` over
    /// the given percentile set, for embedding in the final report.
    pub fn report(&self, percentiles: &[f64]) -> LatencyReport {
        LatencyReport {
            count: self.count(),
            min_ms: self.min(),
            max_ms: self.max(),
            avg_ms: self.avg(),
            median_ms: self.median(),
            percentiles: percentiles
                .iter()
                .map(|&p| (p, self.percentile(p)))
                .collect(),
        }
    }
}

impl Default for LatencySummary {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen latency summary embedded in the final report.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LatencyReport {
    pub count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub median_ms: f64,
    /// `(percentile, value_ms)` pairs, in the order the run profile requested.
    pub percentiles: Vec<(f64, f64)>,
}
