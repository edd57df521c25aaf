use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{path_id, AppState};
use crate::auth::UserPrincipal;
use crate::error::{FleetError, Result};
use crate::tasks::{Task, TaskResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub prompt: String,
}

pub async fn create_task(
    State(state): State<AppState>,
    Extension(user): Extension<UserPrincipal>,
    payload: std::result::Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Task>)> {
    let Json(body) = payload.map_err(|e| FleetError::Validation(e.body_text()))?;
    let task = state.tasks.create_task(Some(user.user_id), &body.prompt).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn get_task(
    State(state): State<AppState>,
    path: std::result::Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Task>> {
    Ok(Json(state.tasks.get_task(path_id(path)?).await?))
}

pub async fn get_task_result(
    State(state): State<AppState>,
    path: std::result::Result<Path<Uuid>, PathRejection>,
) -> Result<Json<TaskResult>> {
    Ok(Json(state.tasks.get_task_result(path_id(path)?).await?))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Extension(user): Extension<UserPrincipal>,
    path: std::result::Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Task>> {
    let id = path_id(path)?;
    let task = state.tasks.cancel_task(id).await?;
    tracing::info!(task_id = %id, user = %user.handle, status = %task.status, "Task cancel requested");
    Ok(Json(task))
}
