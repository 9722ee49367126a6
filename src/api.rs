//! HTTP API (C11): the axum router the rest of the daemon is wired behind.
//! Translates the seven endpoints of the external interface into calls
//! against a [`RunRegistry`] of [`RunController`]s.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::ApiError;
use crate::event_loop::EventLoopConfig;
use crate::live_stream::StreamEvent;
use crate::request::RequestSpec;
use crate::run_controller::{RunController, StopOutcome};
use crate::run_profile::RunProfile;

/// Owns every active and completed run for the process's lifetime, keyed
/// by `runId` ("the API-layer map from `runId` to its owning
/// `RunController`/`Aggregator` pair", §9.1 glossary).
pub struct RunRegistry {
    runs: RwLock<HashMap<Uuid, Arc<RunController>>>,
    client: Client,
    config: Config,
}

impl RunRegistry {
    pub fn new(client: Client, config: Config) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            client,
            config,
        }
    }

    pub async fn start_run(
        &self,
        profile: RunProfile,
        spec: RequestSpec,
        worker_count: Option<usize>,
        concurrency_per_worker: Option<usize>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let event_loop_config = EventLoopConfig {
            worker_count: worker_count.unwrap_or(self.config.default_worker_count),
            concurrency_per_worker: concurrency_per_worker
                .unwrap_or(self.config.default_concurrency_per_worker),
            ..Default::default()
        };
        let controller = RunController::start(id, profile, spec, self.client.clone(), event_loop_config);
        self.runs.write().await.insert(id, controller);
        id
    }

    pub async fn get(&self, id: Uuid) -> Result<Arc<RunController>, ApiError> {
        self.runs.read().await.get(&id).cloned().ok_or(ApiError::RunNotFound(id))
    }

    /// Requests a graceful stop of every non-terminal run. Used by the
    /// daemon's signal handler (SIGINT/SIGTERM request graceful stop of
    /// all runs, §6).
    pub async fn request_stop_all(&self) {
        for controller in self.runs.read().await.values() {
            controller.request_stop();
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => axum::http::StatusCode::BAD_REQUEST,
            ApiError::RunNotFound(_) => axum::http::StatusCode::NOT_FOUND,
            ApiError::RunAlreadyTerminal(_) => axum::http::StatusCode::CONFLICT,
            ApiError::Internal(_) => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        };
        let kind = match &self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::RunNotFound(_) => "run_not_found",
            ApiError::RunAlreadyTerminal(_) => "run_already_terminal",
            ApiError::Internal(_) => "internal",
        };
        let body = Json(ErrorBody {
            error: self.to_string(),
            kind: kind.to_string(),
        });
        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: String,
}

#[derive(Deserialize)]
struct StartRunRequest {
    profile: RunProfile,
    request: RequestSpec,
    #[serde(default)]
    worker_count: Option<usize>,
    #[serde(default)]
    concurrency_per_worker: Option<usize>,
}

#[derive(Serialize)]
struct StartRunResponse {
    run_id: Uuid,
}

#[derive(Serialize)]
struct StopResponse {
    accepted: bool,
    forced: bool,
}

pub fn build_router(registry: Arc<RunRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/runs", post(start_run))
        .route("/runs/:id/stop", post(stop_run))
        .route("/runs/:id/metrics/live", get(metrics_live))
        .route("/runs/:id/stats", get(stats))
        .route("/runs/:id/report", get(report))
        .route("/runs/:id/results", get(results))
        .with_state(registry)
}

async fn health() -> &'static str {
    "ok"
}

async fn start_run(
    State(registry): State<Arc<RunRegistry>>,
    Json(body): Json<StartRunRequest>,
) -> Result<Json<StartRunResponse>, ApiError> {
    if body.profile.percentiles.is_empty() {
        return Err(ApiError::BadRequest("percentiles must not be empty".into()));
    }
    let run_id = registry
        .start_run(body.profile, body.request, body.worker_count, body.concurrency_per_worker)
        .await;
    Ok(Json(StartRunResponse { run_id }))
}

async fn stop_run(
    State(registry): State<Arc<RunRegistry>>,
    Path(id): Path<Uuid>,
) -> Result<Json<StopResponse>, ApiError> {
    let controller = registry.get(id).await?;
    match controller.request_stop() {
        StopOutcome::AcceptedGraceful => Ok(Json(StopResponse {
            accepted: true,
            forced: false,
        })),
        StopOutcome::EscalatedForced => Ok(Json(StopResponse {
            accepted: true,
            forced: true,
        })),
        StopOutcome::AlreadyTerminal => Err(ApiError::RunAlreadyTerminal(id)),
    }
}

async fn metrics_live(
    State(registry): State<Arc<RunRegistry>>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let controller = registry.get(id).await?;
    let receiver = controller.live_stream().subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(receiver)
        .filter_map(|item| item.ok())
        .map(|event| Ok(to_sse_event(event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn stats(
    State(registry): State<Arc<RunRegistry>>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let controller = registry.get(id).await?;
    let recorded = controller.live_stream().recorded_snapshots();
    let last = recorded
        .last()
        .cloned()
        .unwrap_or_else(|| controller.aggregator().snapshot(std::time::Duration::from_secs(1)));

    let events: Vec<StreamEvent> = recorded
        .into_iter()
        .map(StreamEvent::Metrics)
        .chain(std::iter::once(StreamEvent::Complete(last)))
        .collect();

    let stream = tokio_stream::iter(events).map(|event| Ok(to_sse_event(event)));
    Ok(Sse::new(stream))
}

async fn report(
    State(registry): State<Arc<RunRegistry>>,
    Path(id): Path<Uuid>,
) -> Result<Json<crate::aggregator::Report>, ApiError> {
    let controller = registry.get(id).await?;
    let percentiles = controller.profile().percentiles.clone();
    Ok(Json(controller.aggregator().report(&percentiles)))
}

async fn results(
    State(registry): State<Arc<RunRegistry>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<crate::transfer::Outcome>>, ApiError> {
    let controller = registry.get(id).await?;
    Ok(Json(controller.aggregator().samples()))
}

fn to_sse_event(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Metrics(snapshot) => Event::default()
            .event("metrics")
            .json_data(&snapshot)
            .unwrap_or_else(|_| Event::default().event("metrics").data("{}")),
        StreamEvent::Complete(snapshot) => Event::default()
            .event("complete")
            .json_data(&snapshot)
            .unwrap_or_else(|_| Event::default().event("complete").data("{}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn router() -> Router {
        let registry = Arc::new(RunRegistry::new(Client::new(), test_config()));
        build_router(registry)
    }

    fn test_config() -> Config {
        Config {
            listen_port: None,
            skip_tls_verify: false,
            client_cert_path: None,
            client_key_path: None,
            default_worker_count: 2,
            default_concurrency_per_worker: 8,
        }
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let response = router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_run_id_is_404_with_typed_error_body() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri(format!("/runs/{}/report", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_run_then_stop_round_trips() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let registry = Arc::new(RunRegistry::new(Client::new(), test_config()));
        let app = build_router(registry.clone());

        let body = serde_json::json!({
            "profile": {
                "mode": { "mode": "iterations", "iterations": 5, "concurrency": 2 },
                "percentiles": [50.0, 99.0]
            },
            "request": {
                "method": "GET",
                "url": server.uri(),
                "timeout_ms": 2000
            }
        });

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: StartRunResponse = serde_json::from_slice(&bytes).unwrap();

        let controller = registry.get(parsed.run_id).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), controller.wait_until_terminal())
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/runs/{}/report", parsed.run_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
