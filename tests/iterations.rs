//! Scenario 3 (iterations): exactly N outcomes, completed status.

mod common;

use std::time::Duration;

use loadgend::event_loop::EventLoopConfig;
use loadgend::run_controller::{RunController, RunStatus};
use loadgend::run_profile::{RetentionConfig, RunMode, RunProfile};
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn iterations_produce_exact_outcome_count() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let profile = RunProfile {
        mode: RunMode::Iterations {
            iterations: 1000,
            concurrency: 50,
        },
        retention: RetentionConfig::default(),
        percentiles: vec![50.0, 99.0],
    };

    let controller = RunController::start(
        Uuid::new_v4(),
        profile,
        common::get_spec(server.uri(), 2000),
        reqwest::Client::new(),
        EventLoopConfig {
            worker_count: 4,
            concurrency_per_worker: 64,
            ..Default::default()
        },
    );

    tokio::time::timeout(Duration::from_secs(15), controller.wait_until_terminal())
        .await
        .expect("1000 iterations against a fast mock should complete well within 15s");

    assert_eq!(controller.status(), RunStatus::Completed);
    let report = controller.aggregator().report(&[50.0, 99.0]);
    assert_eq!(report.total_requests, 1000);
    assert_eq!(report.successful, 1000);
    assert_eq!(report.errored, 0);
}
