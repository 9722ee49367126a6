//! Scenario 5 (graceful stop): a stop mid-run with `wait_for_pending`
//! semantics (graceful) should drain in-flight transfers rather than
//! cancel them, so no `cancelled` outcomes appear when the server
//! responds well within the grace window.

mod common;

use std::time::Duration;

use loadgend::errors::ErrorKind;
use loadgend::event_loop::EventLoopConfig;
use loadgend::run_controller::{RunController, RunStatus, StopOutcome};
use loadgend::run_profile::{RetentionConfig, RunMode, RunProfile};
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn graceful_stop_drains_in_flight_transfers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(100)))
        .mount(&server)
        .await;

    let profile = RunProfile {
        mode: RunMode::ConstantRps {
            target_rps: 50.0,
            duration_seconds: 60,
        },
        retention: RetentionConfig::default(),
        percentiles: vec![50.0],
    };

    let controller = RunController::start(
        Uuid::new_v4(),
        profile,
        common::get_spec(server.uri(), 2000),
        reqwest::Client::new(),
        EventLoopConfig {
            worker_count: 2,
            concurrency_per_worker: 64,
            ..Default::default()
        },
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(controller.request_stop(), StopOutcome::AcceptedGraceful);

    tokio::time::timeout(Duration::from_secs(5), controller.wait_until_terminal())
        .await
        .expect("graceful stop should finish within its grace window");
    assert_eq!(controller.status(), RunStatus::Stopped);

    let report = controller.aggregator().report(&[50.0]);
    assert_eq!(report.total_requests, report.successful + report.errored);
    let cancelled = *report.error_kind_histogram.get(&ErrorKind::Cancelled).unwrap_or(&0);
    assert_eq!(
        cancelled, 0,
        "a fast server responding well within the grace window should leave nothing cancelled"
    );
}
