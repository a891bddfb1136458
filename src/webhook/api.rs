//! Axum router for webhook ingress and run control.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::service::RunService;
use super::WebhookIngress;
use crate::error::ApiError;
use crate::model::TriggeredBy;

pub struct AppState {
    pub ingress: Arc<WebhookIngress>,
    pub runs: Arc<RunService>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/projects/:project_id/runs", post(create_run))
        .route(
            "/api/v1/projects/:project_id/webhook/:start_step_id",
            post(webhook_trigger),
        )
        .route("/api/v1/runs/:run_id", get(get_run))
        .route("/api/v1/runs/:run_id/cancel", post(cancel_run))
        .route("/api/v1/runs/:run_id/resume", post(resume_run))
        .route(
            "/api/v1/runs/:run_id/steps/:step_id/execute",
            post(execute_step),
        )
        .with_state(state)
}

#[derive(Deserialize)]
struct CreateRunBody {
    #[serde(default)]
    input: Value,
    start_step_id: Option<Uuid>,
    triggered_by: Option<TriggeredBy>,
    version: Option<i32>,
}

async fn create_run(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Json(body): Json<CreateRunBody>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .runs
        .create_run(
            project_id,
            body.start_step_id,
            body.triggered_by.unwrap_or(TriggeredBy::Manual),
            body.version,
            body.input,
        )
        .await?;
    Ok(Json(json!({
        "run_id": run.id,
        "run_number": run.run_number,
        "status": run.status,
    })))
}

async fn webhook_trigger(
    State(state): State<Arc<AppState>>,
    Path((project_id, start_step_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let accepted = state
        .ingress
        .handle(
            project_id,
            start_step_id,
            header("x-webhook-signature"),
            header("x-webhook-timestamp"),
            header("x-idempotency-key"),
            &body,
        )
        .await?;
    Ok(Json(json!({
        "run_id": accepted.run_id,
        "status": "pending",
    })))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let (run, step_runs) = state.runs.get_run(run_id).await?;
    Ok(Json(json!({
        "run": run,
        "step_runs": step_runs,
    })))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.runs.cancel_run(run_id).await?;
    Ok(Json(json!({"run_id": run.id, "status": run.status})))
}

#[derive(Deserialize)]
struct ResumeBody {
    from_step_id: Uuid,
    input_override: Option<Value>,
}

async fn resume_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<Uuid>,
    Json(body): Json<ResumeBody>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .runs
        .resume_run(run_id, body.from_step_id, body.input_override)
        .await?;
    Ok(Json(json!({"run_id": run.id, "status": run.status})))
}

#[derive(Deserialize, Default)]
struct ExecuteStepBody {
    input: Option<Value>,
}

async fn execute_step(
    State(state): State<Arc<AppState>>,
    Path((run_id, step_id)): Path<(Uuid, Uuid)>,
    body: Option<Json<ExecuteStepBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let input = body.and_then(|Json(b)| b.input);
    let run = state
        .runs
        .execute_single_step(run_id, step_id, input)
        .await?;
    Ok(Json(json!({"run_id": run.id, "status": run.status})))
}
