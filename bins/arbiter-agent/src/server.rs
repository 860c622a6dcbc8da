// HTTP surface: the companion ingestion listener plus editor-facing control
// routes, all on one loopback port.
use crate::ingest::Pipeline;
use crate::runner::RunController;
use arbiter_common::events::UiEvent;
use arbiter_common::types::{PendingSubmission, Problem};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Header marking the out-of-band submission-echo client. Requests carrying
/// it clear the pending submission slot after the echo.
pub const SUBMISSION_ECHO_HEADER: &str = "x-submission-echo";

pub struct AppState {
    pub pipeline: Pipeline,
    pub runner: Arc<RunController>,
    pub pending: Mutex<Option<PendingSubmission>>,
    pub events: UnboundedSender<UiEvent>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", any(companion))
        .route("/health", get(health))
        .route("/contest", post(start_contest).delete(stop_contest))
        .route("/submission", post(store_submission))
        .route("/run", post(run_all))
        .route("/run/:test_id", post(run_single))
        .route("/stop", post(stop_run))
        .with_state(state)
}

/// The companion surface. Every response, whatever the request carried,
/// echoes the pending submission record first; the body, if any, is then
/// parsed and routed.
async fn companion(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let echo = {
        let mut slot = state.pending.lock().await;
        if headers.contains_key(SUBMISSION_ECHO_HEADER) {
            let taken = slot.take();
            let echo = PendingSubmission::echo(taken.as_ref());
            if let Some(record) = taken {
                info!(problem = %record.problem_name, "pending submission delivered");
                let _ = state.events.send(UiEvent::SubmitFinished);
            }
            echo
        } else {
            PendingSubmission::echo(slot.as_ref())
        }
    };

    state.pipeline.handle_body(&body).await;
    Json(echo)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[derive(Debug, serde::Deserialize)]
pub struct StartContestRequest {
    pub contest_id: String,
    pub expected_count: usize,
}

/// POST /contest - start a collection session and drive it to
/// materialization once it resolves.
async fn start_contest(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartContestRequest>,
) -> impl IntoResponse {
    let rx = match state
        .pipeline
        .collector
        .start(req.contest_id.clone(), req.expected_count)
        .await
    {
        Ok(rx) => rx,
        Err(e) => {
            warn!(contest_id = %req.contest_id, error = %e, "refused to start collection");
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": e.to_string() })),
            );
        }
    };

    let contest_id = req.contest_id.clone();
    let driver = state.clone();
    tokio::spawn(async move {
        let payloads = match rx.await {
            Ok(payloads) => payloads,
            Err(_) => {
                debug!(contest_id = %contest_id, "collection session dropped before resolving");
                return;
            }
        };
        driver.pipeline.collector.begin_processing().await;
        if let Err(e) = driver
            .pipeline
            .mat
            .commit_contest(&contest_id, payloads)
            .await
        {
            warn!(contest_id = %contest_id, error = %e, "contest materialization failed");
            let _ = driver.events.send(UiEvent::Error {
                message: format!("Could not set up contest {}: {}", contest_id, e),
            });
        }
        driver.pipeline.collector.stop().await;
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "contest_id": req.contest_id,
            "expected_count": req.expected_count,
            "status": "collecting",
        })),
    )
}

/// DELETE /contest - clear the active collection session, if any.
async fn stop_contest(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.pipeline.collector.stop().await;
    StatusCode::NO_CONTENT
}

/// POST /submission - store the pending submission record. Last writer
/// wins; at most one record exists at a time.
async fn store_submission(
    State(state): State<Arc<AppState>>,
    Json(record): Json<PendingSubmission>,
) -> impl IntoResponse {
    info!(problem = %record.problem_name, "pending submission stored");
    *state.pending.lock().await = Some(record);
    StatusCode::NO_CONTENT
}

/// POST /run - compile and run every test of the posted problem, stopping
/// on the first failure.
async fn run_all(
    State(state): State<Arc<AppState>>,
    Json(problem): Json<Problem>,
) -> impl IntoResponse {
    match state.runner.run_all(&problem).await {
        Some(report) => Json(serde_json::json!(report)).into_response(),
        None => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "not-started" })),
        )
            .into_response(),
    }
}

/// POST /run/:test_id - judge a single test of the posted problem.
async fn run_single(
    State(state): State<Arc<AppState>>,
    Path(test_id): Path<Uuid>,
    Json(problem): Json<Problem>,
) -> impl IntoResponse {
    match state.runner.run_single(&problem, test_id).await {
        Ok(result) => Json(serde_json::json!(result)).into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// POST /stop - ask the in-flight run to halt.
async fn stop_run(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.runner.is_running() {
        debug!("stop requested with no run in flight");
    }
    state.runner.stop();
    StatusCode::NO_CONTENT
}
