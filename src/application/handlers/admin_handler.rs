use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{error, info};

use super::AppState;
use crate::application::orchestrator::{LaneStats, WorkerInfo};
use crate::domain::entities::task::{Lane, TaskKind, TaskRecord, TaskStatus};
use crate::domain::errors::DispatchError;

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

fn internal(err: DispatchError) -> ApiError {
    error!(error = %err, "Admin request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, err.public_message())
}

/// Task as exposed to operators; lease tokens stay internal
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskView {
    pub id: String,
    pub lane: Lane,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<TaskRecord> for TaskView {
    fn from(task: TaskRecord) -> Self {
        Self {
            id: task.id,
            lane: task.lane,
            kind: task.kind,
            status: task.status,
            priority: task.priority,
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            next_run_at: task.next_run_at,
            lease_owner: task.lease_owner,
            cancel_requested: task.cancel_requested,
            last_error: task.last_error,
            created_at: task.created_at,
            finished_at: task.finished_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub lane: Lane,
    pub purged: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheClearResponse {
    pub credentials_cleared: usize,
    pub positions_cleared: usize,
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /admin/tasks/:id
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    match state.orchestrator.task(&id).await.map_err(internal)? {
        Some(task) => Ok(Json(task.into())),
        None => Err(api_error(StatusCode::NOT_FOUND, "Task not found")),
    }
}

/// POST /admin/tasks/:id/retry
pub async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    if state.orchestrator.retry(&id).await.map_err(internal)? {
        info!(task_id = %id, "Task retry requested by operator");
        Ok(Json(ActionResponse {
            success: true,
            message: "Task requeued".to_string(),
        }))
    } else {
        Err(api_error(
            StatusCode::CONFLICT,
            "Task not found, running, or already succeeded",
        ))
    }
}

/// POST /admin/tasks/:id/cancel
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    if state.orchestrator.cancel(&id).await.map_err(internal)? {
        info!(task_id = %id, "Task cancel requested by operator");
        Ok(Json(ActionResponse {
            success: true,
            message: "Task cancelled".to_string(),
        }))
    } else {
        Err(api_error(
            StatusCode::CONFLICT,
            "Task not found or already finished",
        ))
    }
}

/// GET /admin/queues
pub async fn queue_stats(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, LaneStats>>, ApiError> {
    let stats = state.orchestrator.queue_stats().await.map_err(internal)?;
    Ok(Json(
        stats
            .into_iter()
            .map(|(lane, s)| (lane.as_str().to_string(), s))
            .collect(),
    ))
}

/// DELETE /admin/queues/:lane
pub async fn purge_queue(
    State(state): State<AppState>,
    Path(lane): Path<String>,
) -> Result<Json<PurgeResponse>, ApiError> {
    let lane: Lane = lane
        .parse()
        .map_err(|_| api_error(StatusCode::NOT_FOUND, "Unknown lane"))?;
    let purged = state.orchestrator.purge(lane).await.map_err(internal)?;
    Ok(Json(PurgeResponse { lane, purged }))
}

/// GET /admin/workers
pub async fn workers(State(state): State<AppState>) -> Json<Vec<WorkerInfo>> {
    Json(state.orchestrator.worker_health())
}

/// POST /admin/cache/clear
pub async fn clear_cache(State(state): State<AppState>) -> Json<CacheClearResponse> {
    let credentials_cleared = state.vault.clear_cache();
    let positions_cleared = state.cache.len();
    state.cache.clear();
    info!(credentials_cleared, positions_cleared, "Caches cleared by operator");
    Json(CacheClearResponse {
        credentials_cleared,
        positions_cleared,
    })
}
