use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{path_id, AppState};
use crate::auth::{NodePrincipal, UserPrincipal};
use crate::error::{FleetError, Result};
use crate::protocol::{
    CapabilityReport, ConfigAck, JobResponse, NodeConfiguration, RegistrationRequest,
    RegistrationResponse, RenewRequest, RenewResponse,
};
use crate::registry::Node;
use crate::scheduler::Completion;

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| FleetError::Validation(e.body_text()))
}

/// 201 for a new node, 200 when an existing slug re-registers.
pub async fn register(
    State(state): State<AppState>,
    payload: std::result::Result<Json<RegistrationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegistrationResponse>)> {
    let request = body(payload)?;
    let registration = state
        .registry
        .register(&request.psk, request.capability, Utc::now())
        .await?;
    let status = if registration.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(registration.response)))
}

pub async fn report_capability(
    State(state): State<AppState>,
    Extension(node): Extension<NodePrincipal>,
    payload: std::result::Result<Json<CapabilityReport>, JsonRejection>,
) -> Result<StatusCode> {
    let report = body(payload)?;
    state
        .registry
        .report_capability(node.node_id, report, Utc::now())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn node_config(
    State(state): State<AppState>,
    Extension(node): Extension<NodePrincipal>,
) -> Result<Json<NodeConfiguration>> {
    let config = state
        .registry
        .node_config(node.node_id, state.scheduler.lease_ttl(), Utc::now())
        .await?;
    Ok(Json(config))
}

pub async fn ack_config(
    State(state): State<AppState>,
    Extension(node): Extension<NodePrincipal>,
    payload: std::result::Result<Json<ConfigAck>, JsonRejection>,
) -> Result<StatusCode> {
    let ack = body(payload)?;
    state
        .registry
        .acknowledge_config(node.node_id, ack, Utc::now())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn lease(
    State(state): State<AppState>,
    Extension(node): Extension<NodePrincipal>,
) -> Result<Response> {
    let grant = state
        .scheduler
        .lease_next(node.node_id, Utc::now(), state.scheduler.lease_ttl())
        .await?;
    Ok(match grant {
        Some(grant) => Json(grant).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

pub async fn renew(
    State(state): State<AppState>,
    Extension(node): Extension<NodePrincipal>,
    path: std::result::Result<Path<Uuid>, PathRejection>,
    payload: std::result::Result<Json<RenewRequest>, JsonRejection>,
) -> Result<Json<RenewResponse>> {
    let job_id = path_id(path)?;
    let request = body(payload)?;
    let lease_expires_at = state
        .scheduler
        .renew_lease(
            job_id,
            &request.lease_id,
            node.node_id,
            Utc::now(),
            state.scheduler.lease_ttl(),
        )
        .await?;
    Ok(Json(RenewResponse { lease_expires_at }))
}

/// Accepts any JSON object with a `lease_id`; a `result` that does not
/// parse is recorded as a failed job rather than rejected.
pub async fn complete(
    State(state): State<AppState>,
    Extension(node): Extension<NodePrincipal>,
    path: std::result::Result<Path<Uuid>, PathRejection>,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>> {
    let job_id = path_id(path)?;
    let mut raw = body(payload)?;
    let lease_id = raw
        .get("lease_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| FleetError::Validation("lease_id is required".to_string()))?
        .to_string();

    let completion = match raw.get_mut("result").map(Value::take) {
        None | Some(Value::Null) => Completion::Malformed("result is missing".to_string()),
        Some(result) => match serde_json::from_value::<JobResponse>(result) {
            Ok(response) => Completion::Reported(response),
            Err(e) => Completion::Malformed(e.to_string()),
        },
    };

    let job = state
        .scheduler
        .complete_lease(job_id, &lease_id, node.node_id, completion, Utc::now())
        .await?;
    Ok(Json(json!({
        "job_id": job.id,
        "task_id": job.task_id,
        "status": job.status,
    })))
}

pub async fn list_nodes(State(state): State<AppState>) -> Result<Json<Vec<Node>>> {
    Ok(Json(state.registry.list_nodes().await?))
}

pub async fn drain_node(
    State(state): State<AppState>,
    Extension(user): Extension<UserPrincipal>,
    path: std::result::Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Node>> {
    let node_id = path_id(path)?;
    let node = state.registry.drain(node_id, Utc::now()).await?;
    tracing::info!(node_id = %node_id, user = %user.handle, "Drain requested");
    Ok(Json(node))
}
