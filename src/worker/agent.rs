//! Node Agent: the HTTP surface a node manager exposes for direct job runs.
//!
//! Routes:
//! - `POST /v1/worker/jobs:run` - run one Job Request synchronously (bearer auth)
//! - `GET  /healthz` - process liveness
//! - `GET  /readyz` - container runtime reachable

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::executor::{SandboxExecutor, TEARDOWN_BUDGET};
use crate::auth::{bearer_token, psk_matches};
use crate::config::HttpConfig;
use crate::error::{FleetError, Result};
use crate::protocol::{JobRequest, JobResponse};
use crate::server::with_http_layers;

#[derive(Clone)]
pub struct AgentState {
    pub executor: Arc<SandboxExecutor>,
    pub worker_token: Arc<str>,
    /// Cancelled on process shutdown; running jobs are torn down with it.
    pub shutdown: CancellationToken,
    /// Transport write timeout. A run that could outlast it is refused up front.
    pub write_timeout: Duration,
}

pub fn router(state: AgentState, http: &HttpConfig) -> Router {
    let jobs = Router::new()
        .route("/v1/worker/jobs:run", post(run_job))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_worker_token,
        ));

    let app = Router::new()
        .merge(jobs)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state);
    with_http_layers(app, http)
}

async fn require_worker_token(
    State(state): State<AgentState>,
    request: Request,
    next: Next,
) -> Result<Response> {
    let token = bearer_token(request.headers())?;
    if !psk_matches(token, &state.worker_token) {
        tracing::warn!("Node agent request with invalid bearer token");
        return Err(FleetError::Unauthorized("invalid bearer token".to_string()));
    }
    Ok(next.run(request).await)
}

async fn run_job(
    State(state): State<AgentState>,
    payload: std::result::Result<Json<JobRequest>, JsonRejection>,
) -> Result<Json<JobResponse>> {
    let Json(request) = payload.map_err(|e| FleetError::Validation(e.body_text()))?;
    request.validate()?;
    let timeout = state.executor.effective_timeout(request.sandbox.timeout_seconds);
    if timeout + TEARDOWN_BUDGET >= state.write_timeout {
        return Err(FleetError::Validation(format!(
            "timeout_seconds {} leaves no room under the node agent's {}s write timeout",
            timeout.as_secs(),
            state.write_timeout.as_secs()
        )));
    }

    // Runs in its own task so a dropped connection still reaches the
    // executor's cleanup through the cancel token.
    let cancel = state.shutdown.child_token();
    let _on_drop = cancel.clone().drop_guard();
    let executor = state.executor.clone();
    let job_id = request.job_id;
    let response = tokio::spawn(async move { executor.execute(&request, cancel).await })
        .await
        .map_err(|e| FleetError::Internal(format!("job {job_id} execution task: {e}")))?;
    Ok(Json(response))
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn readyz(State(state): State<AgentState>) -> Response {
    match state.executor.readiness().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready" }))).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Runtime not ready");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "not_ready", "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
