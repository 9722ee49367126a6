//! Scenario 1 (echo burst): a loopback mock server answering fast, driven
//! at a constant rate. Scaled down from the literal 10k rps / 5s so the
//! suite stays fast; the shape of the assertions is unchanged.

mod common;

use std::time::Duration;

use loadgend::event_loop::EventLoopConfig;
use loadgend::run_controller::{RunController, RunStatus};
use loadgend::run_profile::{RetentionConfig, RunMode, RunProfile};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn echo_burst_hits_target_throughput_with_no_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fast"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let profile = RunProfile {
        mode: RunMode::ConstantRps {
            target_rps: 200.0,
            duration_seconds: 2,
        },
        retention: RetentionConfig::default(),
        percentiles: vec![50.0, 99.0],
    };

    let controller = RunController::start(
        Uuid::new_v4(),
        profile,
        common::get_spec(format!("{}/fast", server.uri()), 2000),
        reqwest::Client::new(),
        EventLoopConfig {
            worker_count: 4,
            concurrency_per_worker: 64,
            ..Default::default()
        },
    );

    tokio::time::timeout(Duration::from_secs(10), controller.wait_until_terminal())
        .await
        .expect("run should finish well within the timeout");

    assert_eq!(controller.status(), RunStatus::Completed);

    let report = controller.aggregator().report(&[50.0, 99.0]);
    assert_eq!(report.errored, 0);
    // Two seconds at 200 rps: allow generous scheduling slack either way.
    assert!(
        report.total_requests >= 300 && report.total_requests <= 500,
        "expected roughly 400 requests, got {}",
        report.total_requests
    );
    assert!(
        report.latency.median_ms < 50.0,
        "p50 too high for a near-instant mock: {}",
        report.latency.median_ms
    );
}
