//! Transfer state (C5) and outcome records.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
use crate::request::RequestSpec;

/// Per-request timing breakdown, all fields in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimingBreakdown {
    pub dns_ms: f64,
    pub connect_ms: f64,
    pub tls_ms: f64,
    pub first_byte_ms: f64,
    pub download_ms: f64,
    pub total_ms: f64,
}

/// One in-flight request, exclusively owned by the worker that acquired it
/// from the moment of acquisition until the corresponding outcome has been
/// published to the aggregator.
#[derive(Debug, Default)]
pub struct TransferState {
    pub request_id: u64,
    pub spec: Option<Arc<RequestSpec>>,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Vec<u8>,
    pub error_message: Option<String>,
    pub start: Option<Instant>,
    pub timing: TimingBreakdown,
    pub save_timing_breakdown: bool,
}

impl TransferState {
    pub fn begin(&mut self, request_id: u64, spec: Arc<RequestSpec>, save_timing_breakdown: bool) {
        self.request_id = request_id;
        self.spec = Some(spec);
        self.start = Some(Instant::now());
        self.save_timing_breakdown = save_timing_breakdown;
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start
            .map(|s| s.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }
}

/// Final record of a transfer, exactly one per admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub request_id: u64,
    pub start_time_unix_ms: u64,
    /// 0 indicates a network/transport error (see `error_kind`).
    pub status_code: u16,
    pub latency_ms: f64,
    pub error_kind: ErrorKind,
    pub timing: TimingBreakdown,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    #[serde(default)]
    pub captured_request_headers: Option<Vec<(String, String)>>,
    #[serde(default)]
    pub captured_response_headers: Option<Vec<(String, String)>>,
    #[serde(default)]
    pub captured_response_body: Option<Vec<u8>>,
}

impl Outcome {
    pub fn is_error(&self) -> bool {
        self.error_kind != ErrorKind::None
    }

    pub fn cancelled(request_id: u64, start_time_unix_ms: u64, latency_ms: f64) -> Self {
        Self {
            request_id,
            start_time_unix_ms,
            status_code: 0,
            latency_ms,
            error_kind: ErrorKind::Cancelled,
            timing: TimingBreakdown::default(),
            bytes_sent: 0,
            bytes_received: 0,
            captured_request_headers: None,
            captured_response_headers: None,
            captured_response_body: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_state_begin_sets_fields() {
        let mut state = TransferState::default();
        let spec = Arc::new(RequestSpec {
            method: crate::request::Method::Get,
            url: "http://localhost/".into(),
            headers: vec![],
            body: None,
            body_mime: None,
            auth: Default::default(),
            timeout_ms: 1000,
        });
        state.begin(7, spec, true);
        assert_eq!(state.request_id, 7);
        assert!(state.start.is_some());
        assert!(state.elapsed_ms() >= 0.0);
    }

    #[test]
    fn cancelled_outcome_has_zero_status_and_cancelled_kind() {
        let outcome = Outcome::cancelled(3, 0, 150.0);
        assert_eq!(outcome.status_code, 0);
        assert_eq!(outcome.error_kind, ErrorKind::Cancelled);
        assert!(outcome.is_error());
    }

    #[test]
    fn success_outcome_is_not_an_error() {
        let outcome = Outcome {
            request_id: 1,
            start_time_unix_ms: 0,
            status_code: 200,
            latency_ms: 5.0,
            error_kind: ErrorKind::None,
            timing: TimingBreakdown::default(),
            bytes_sent: 10,
            bytes_received: 100,
            captured_request_headers: None,
            captured_response_headers: None,
            captured_response_body: None,
        };
        assert!(!outcome.is_error());
    }
}
