//! Scenario 4 (timeout): a slow server against a tight per-request
//! timeout should surface almost every outcome as `timeout`/status 0.

mod common;

use std::time::Duration;

use loadgend::errors::ErrorKind;
use loadgend::event_loop::EventLoopConfig;
use loadgend::run_controller::{RunController, RunStatus};
use loadgend::run_profile::{RetentionConfig, RunMode, RunProfile};
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn tight_timeout_against_slow_server_surfaces_timeout_outcomes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let profile = RunProfile {
        mode: RunMode::ConstantConcurrency {
            concurrency: 5,
            duration_seconds: 3,
        },
        retention: RetentionConfig::default(),
        percentiles: vec![50.0],
    };

    let controller = RunController::start(
        Uuid::new_v4(),
        profile,
        common::get_spec(server.uri(), 300),
        reqwest::Client::new(),
        EventLoopConfig {
            worker_count: 2,
            concurrency_per_worker: 16,
            ..Default::default()
        },
    );

    tokio::time::timeout(Duration::from_secs(15), controller.wait_until_terminal())
        .await
        .expect("run should not lock up waiting on a slow server");
    assert_eq!(controller.status(), RunStatus::Completed);

    let report = controller.aggregator().report(&[50.0]);
    assert!(report.total_requests > 0);
    let timeouts = *report
        .error_kind_histogram
        .get(&ErrorKind::Timeout)
        .unwrap_or(&0);
    let ratio = timeouts as f64 / report.total_requests as f64;
    assert!(
        ratio >= 0.95,
        "expected at least 95% timeouts, got {timeouts}/{}",
        report.total_requests
    );
}
