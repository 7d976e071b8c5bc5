//! Run status, history and control endpoints.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tfci::config::ServerConfig;
use tfci::core::types::{RunId, RunKind, RunRecord, Trigger};
use tfci::registry::{Registry, RegistryError};

use crate::error::ApiError;
use crate::server::RouteTable;
use crate::state::AppState;

/// Upper bound on `GET /runs?limit=`.
const MAX_PAGE: usize = 500;

pub fn register(
    registry: &Registry<RouteTable>,
    _config: &ServerConfig,
) -> Result<(), RegistryError> {
    registry.register("runs", |table: &mut RouteTable| {
        table
            .route("/health", get(health))
            .route("/status", get(status))
            .route("/run", post(request_run))
            .route("/runs", get(list_runs))
            .route("/runs/{id}", get(get_run))
            .route("/runs/{id}/log", get(get_log))
            .route("/runs/{id}/cancel", post(cancel_run));
    })
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    latest: Option<RunRecord>,
    history: Vec<RunRecord>,
    running: Option<RunRecord>,
    queued: Vec<RunRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    degraded: Option<String>,
}

/// GET /status - latest run, recent history and scheduler occupancy.
///
/// Persistence failures do not fail the request; they are reported in `degraded`.
async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let store = state.store();
    Json(StatusResponse {
        latest: store.latest(),
        history: store.list(state.config.provisioner.history_limit, 0),
        running: state.scheduler.running(),
        queued: state.scheduler.queued(),
        degraded: store.degraded(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RunRequest {
    kind: RunKind,
}

#[derive(Debug, Serialize)]
struct RunAccepted {
    id: RunId,
}

/// POST /run - request a manual run. An empty body requests a plan.
async fn request_run(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<RunAccepted>), ApiError> {
    let request: RunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RunRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::bad_request(format!("invalid run request: {err}")))?
    };

    let scheduler = state.scheduler.clone();
    let id = tokio::task::spawn_blocking(move || {
        scheduler.request_run(request.kind, Trigger::Manual)
    })
    .await
    .map_err(|err| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            format!("run request task failed: {err}"),
        )
    })??;

    Ok((StatusCode::ACCEPTED, Json(RunAccepted { id })))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RunsPage {
    runs: Vec<RunRecord>,
    total: usize,
}

/// GET /runs - history page, newest first.
async fn list_runs(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Json<RunsPage> {
    let limit = page
        .limit
        .unwrap_or(state.config.provisioner.history_limit)
        .min(MAX_PAGE);
    let store = state.store();
    Json(RunsPage {
        runs: store.list(limit, page.offset.unwrap_or(0)),
        total: store.len(),
    })
}

/// GET /runs/{id}
async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
) -> Result<Json<RunRecord>, ApiError> {
    state
        .store()
        .get(id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("run {id} not found")))
}

/// GET /runs/{id}/log - combined provisioner output so far.
async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
) -> Result<String, ApiError> {
    let store = state.store();
    if store.get(id).is_none() {
        return Err(ApiError::not_found(format!("run {id} not found")));
    }
    Ok(store.read_log(id)?)
}

/// POST /runs/{id}/cancel - cancel a run that has not started.
async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
) -> Result<Json<RunRecord>, ApiError> {
    let scheduler = state.scheduler.clone();
    let record = tokio::task::spawn_blocking(move || scheduler.cancel(id))
        .await
        .map_err(|err| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                format!("cancel task failed: {err}"),
            )
        })??;
    Ok(Json(record))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;
    use tfci::core::types::{RunKind, Trigger};
    use tfci::test_support::{ScriptedProvisioner, TestCheckout};

    use crate::routes::testing::{TestApp, body_json, body_text};

    const WAIT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn health_is_ok() {
        let app = TestApp::new(ScriptedProvisioner::new(vec![]));
        let response = app.get("/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn status_on_empty_state() {
        let app = TestApp::new(ScriptedProvisioner::new(vec![]));
        let response = app.get("/status").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert!(body["latest"].is_null());
        assert_eq!(body["history"], serde_json::json!([]));
        assert!(body["running"].is_null());
        assert!(body.get("degraded").is_none());
    }

    #[tokio::test]
    async fn manual_plan_shows_up_as_latest() {
        let app = TestApp::new(ScriptedProvisioner::new(vec![0]));

        let response = app.post("/run", r#"{"kind":"Plan"}"#).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["id"], 1);
        assert!(app.scheduler().wait_idle(WAIT));

        let body = body_json(app.get("/status").await).await;
        assert_eq!(body["latest"]["id"], 1);
        assert_eq!(body["latest"]["kind"], "Plan");
        assert_eq!(body["latest"]["status"], "Succeeded");
        assert_eq!(body["history"].as_array().expect("history").len(), 1);
    }

    #[tokio::test]
    async fn empty_body_requests_a_plan() {
        let app = TestApp::new(ScriptedProvisioner::new(vec![]));
        let response = app.post("/run", "").await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(app.scheduler().wait_idle(WAIT));
        assert_eq!(app.provisioner.calls(), vec![(1, RunKind::Plan)]);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let app = TestApp::new(ScriptedProvisioner::new(vec![]));
        let response = app.post("/run", r#"{"kind":"Destroy"}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "BAD_REQUEST");
        assert!(app.scheduler().store().is_empty());
    }

    #[tokio::test]
    async fn busy_scheduler_returns_conflict() {
        let app = TestApp::new(ScriptedProvisioner::held(vec![]));
        let first = app.post("/run", r#"{"kind":"Plan"}"#).await;
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let busy = app.post("/run", r#"{"kind":"Apply"}"#).await;
        assert_eq!(busy.status(), StatusCode::CONFLICT);
        let body = body_json(busy).await;
        assert_eq!(body["error"]["code"], "RUN_IN_PROGRESS");
        assert_eq!(app.scheduler().store().len(), 1);

        let status = body_json(app.get("/status").await).await;
        assert_eq!(status["running"]["id"], 1);
        assert_eq!(status["running"]["status"], "Running");

        app.provisioner.release();
        assert!(app.scheduler().wait_idle(WAIT));
    }

    #[tokio::test]
    async fn run_detail_log_and_missing_run() {
        let app = TestApp::new(ScriptedProvisioner::new(vec![1]));
        app.post("/run", r#"{"kind":"Apply"}"#).await;
        assert!(app.scheduler().wait_idle(WAIT));

        let detail = body_json(app.get("/runs/1").await).await;
        assert_eq!(detail["status"], "Failed");
        assert_eq!(detail["exitCode"], 1);

        let log = body_text(app.get("/runs/1/log").await).await;
        assert!(log.contains("scripted Apply for run 1"));

        let missing = app.get("/runs/42").await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(missing).await["error"]["code"], "NOT_FOUND");
        assert_eq!(app.get("/runs/42/log").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn history_pages_newest_first() {
        let app = TestApp::new(ScriptedProvisioner::new(vec![]));
        for _ in 0..3 {
            app.post("/run", "").await;
            assert!(app.scheduler().wait_idle(WAIT));
        }

        let page = body_json(app.get("/runs?limit=2&offset=1").await).await;
        assert_eq!(page["total"], 3);
        let ids: Vec<u64> = page["runs"]
            .as_array()
            .expect("runs")
            .iter()
            .map(|run| run["id"].as_u64().expect("id"))
            .collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[tokio::test]
    async fn cancel_pending_run_over_http() {
        let app = TestApp::new(ScriptedProvisioner::held(vec![]));
        app.post("/run", "").await;
        let queued = app
            .scheduler()
            .request_run(RunKind::Apply, Trigger::ChangeDetected)
            .expect("queue");

        let running = app.post("/runs/1/cancel", "").await;
        assert_eq!(running.status(), StatusCode::CONFLICT);

        let cancelled = app.post(&format!("/runs/{queued}/cancel"), "").await;
        assert_eq!(cancelled.status(), StatusCode::OK);
        assert_eq!(body_json(cancelled).await["status"], "Cancelled");

        app.provisioner.release();
        assert!(app.scheduler().wait_idle(WAIT));
    }

    #[tokio::test]
    async fn disabled_plans_are_accepted_without_running() {
        let mut checkout = TestCheckout::new();
        checkout.config.run_plan_enabled = false;
        let app = TestApp::with_checkout(checkout, ScriptedProvisioner::new(vec![]));

        let response = app.post("/run", r#"{"kind":"Plan"}"#).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let status = body_json(app.get("/status").await).await;
        assert_eq!(status["latest"]["status"], "Succeeded");
        assert!(app.provisioner.calls().is_empty());
    }

    #[tokio::test]
    async fn status_reports_degraded_store_and_stays_up() {
        let app = TestApp::new(ScriptedProvisioner::held(vec![]));
        let accepted = app.post("/run", "").await;
        assert_eq!(accepted.status(), StatusCode::ACCEPTED);

        let blocker = app.state.config.state_dir.join("runs.json.tmp");
        std::fs::create_dir(&blocker).expect("block index writes");
        app.provisioner.release();
        for _ in 0..100 {
            if app.state.store().degraded().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let response = app.get("/status").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["degraded"].is_string(), "degraded in {body}");
        assert_eq!(body["running"]["id"], 1);

        std::fs::remove_dir(&blocker).expect("unblock index writes");
        assert!(app.scheduler().wait_idle(WAIT));
        let body = body_json(app.get("/status").await).await;
        assert!(body.get("degraded").is_none());
        assert_eq!(body["latest"]["status"], "Succeeded");
    }
}
