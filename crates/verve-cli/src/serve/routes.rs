//! HTTP handlers: a thin adapter binding the REST surface to the
//! lifecycle service.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use verve_core::creds::HostCredentials;
use verve_core::reconciler::{self, CodeHost};
use verve_core::service::{
    CompletionReport, NewTask, ServiceError, TaskService, CLAIM_POLL_TIMEOUT,
};
use verve_db::models::Task;
use verve_db::store::{StartOver, TaskUpdate};

// ---------------------------------------------------------------------------
// State and error type
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TaskService>,
    pub creds: Arc<dyn HostCredentials>,
    pub host: Option<Arc<dyn CodeHost>>,
}

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        error!(error = %format!("{err:#}"), "internal server error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound => Self {
                status: StatusCode::NOT_FOUND,
                message: "not found".into(),
            },
            ServiceError::Conflict(message) => Self {
                status: StatusCode::CONFLICT,
                message,
            },
            ServiceError::Invalid(message) => Self {
                status: StatusCode::BAD_REQUEST,
                message,
            },
            ServiceError::Internal(e) => Self::internal(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request/response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ReadyRequest {
    pub ready: bool,
}

#[derive(Debug, Deserialize)]
pub struct DependencyRequest {
    pub depends_on: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CloseRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub instructions: String,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub feedback: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsRequest {
    pub attempt: i32,
    pub logs: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub running: bool,
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    /// Comma-separated repo ids to restrict the claim scan.
    #[serde(default)]
    pub repos: Option<String>,
}

/// Claimed task plus the credentials the worker needs for it.
#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub task: Task,
    pub github_token: String,
    pub repo_full_name: String,
}

// ---------------------------------------------------------------------------
// Task CRUD
// ---------------------------------------------------------------------------

pub async fn create_task(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
    Json(new): Json<NewTask>,
) -> Result<impl IntoResponse, AppError> {
    let task = state.service.create_task(&repo_id, new).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn list_repo_tasks(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
) -> Result<Json<Vec<Task>>, AppError> {
    Ok(Json(state.service.list_by_repo(&repo_id).await?))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.service.get_task(&id).await?))
}

pub async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<TaskUpdate>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.service.update_task(&id, update).await?))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.service.delete_task(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Operator controls
// ---------------------------------------------------------------------------

pub async fn set_ready(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReadyRequest>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.service.set_ready(&id, body.ready).await?))
}

pub async fn remove_dependency(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DependencyRequest>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(
        state.service.remove_dependency(&id, &body.depends_on).await?,
    ))
}

pub async fn close_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<CloseRequest>>,
) -> Result<Json<Task>, AppError> {
    let reason = body.map(|Json(b)| b.reason).unwrap_or_default();
    Ok(Json(state.service.close_task(&id, &reason).await?))
}

pub async fn stop_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.service.stop_task(&id, "").await?))
}

pub async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RetryRequest>>,
) -> Result<Json<Task>, AppError> {
    let instructions = body.map(|Json(b)| b.instructions).unwrap_or_default();
    Ok(Json(state.service.manual_retry(&id, &instructions).await?))
}

pub async fn start_over(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<StartOver>>,
) -> Result<Json<Task>, AppError> {
    let params = body.map(|Json(b)| b).unwrap_or_default();
    // The response is the pre-reset snapshot so the caller can close the
    // abandoned PR externally.
    Ok(Json(state.service.start_over(&id, params).await?))
}

pub async fn feedback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FeedbackRequest>,
) -> Result<Json<Task>, AppError> {
    if body.feedback.trim().is_empty() {
        return Err(AppError::bad_request("feedback must not be empty"));
    }
    Ok(Json(state.service.feedback(&id, &body.feedback).await?))
}

/// On-demand reconcile of a single task against its PR.
pub async fn sync_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    let Some(host) = &state.host else {
        return Err(AppError::bad_request("code host is not configured"));
    };
    let task = state.service.get_task(&id).await?;
    if task.pr_number > 0 {
        reconciler::sync_task(&state.service, host.as_ref(), state.creds.as_ref(), &task)
            .await
            .map_err(AppError::internal)?;
    }
    Ok(Json(state.service.get_task(&id).await?))
}

// ---------------------------------------------------------------------------
// Worker surface
// ---------------------------------------------------------------------------

pub async fn poll(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
) -> Result<axum::response::Response, AppError> {
    let repos: Option<Vec<String>> = query.repos.map(|csv| {
        csv.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    });

    let claimed = state
        .service
        .claim(repos.as_deref(), CLAIM_POLL_TIMEOUT)
        .await?;

    match claimed {
        None => Ok(StatusCode::NO_CONTENT.into_response()),
        Some(task) => {
            let creds = state
                .creds
                .for_repo(&task.repo_id)
                .await
                .map_err(AppError::internal)?;
            Ok(Json(PollResponse {
                task,
                github_token: creds.token,
                repo_full_name: creds.repo_full_name,
            })
            .into_response())
        }
    }
}

pub async fn append_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<LogsRequest>,
) -> Result<StatusCode, AppError> {
    if body.attempt < 1 {
        return Err(AppError::bad_request("attempt must be >= 1"));
    }
    state.service.append_logs(&id, body.attempt, &body.logs).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let running = state.service.heartbeat(&id).await?;
    Ok(Json(HeartbeatResponse { running }))
}

pub async fn complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(report): Json<CompletionReport>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.service.report_completion(&id, &report).await?))
}
