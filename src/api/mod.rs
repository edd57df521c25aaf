//! Orchestrator HTTP API.
//!
//! Routes:
//! - `GET  /healthz` - liveness
//! - `GET  /readyz` - store reachable and at least one dispatchable node
//! - `POST /v1/nodes/register` - PSK registration, returns a node token
//! - node bearer: capability reports, lease, renew, complete
//! - user bearer: tasks and node administration

pub mod middleware;
pub mod nodes;
pub mod tasks;

use std::sync::Arc;

use axum::extract::rejection::PathRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use crate::auth::TokenIssuer;
use crate::config::HttpConfig;
use crate::error::{FleetError, Result};
use crate::ratelimit::RateLimiter;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::server::with_http_layers;
use crate::store::Store;
use crate::tasks::TaskService;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub scheduler: Scheduler,
    pub registry: Registry,
    pub tasks: TaskService,
    pub tokens: Arc<TokenIssuer>,
    pub limiter: Arc<RateLimiter>,
}

fn path_id(path: std::result::Result<Path<Uuid>, PathRejection>) -> Result<Uuid> {
    path.map(|Path(id)| id)
        .map_err(|e| FleetError::Validation(format!("invalid id: {}", e.body_text())))
}

async fn readyz(State(state): State<AppState>) -> Response {
    match state.registry.dispatchable_nodes().await {
        Ok(0) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "reason": "no dispatchable nodes: register a sandbox-capable node and apply its config",
            })),
        )
            .into_response(),
        Ok(count) => Json(json!({ "status": "ready", "dispatchable_nodes": count })).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            e.into_response()
        }
    }
}

pub fn router(state: AppState, http: &HttpConfig) -> Router {
    let user_routes = Router::new()
        .route("/v1/tasks", post(tasks::create_task))
        .route("/v1/tasks/{id}", get(tasks::get_task))
        .route("/v1/tasks/{id}/result", get(tasks::get_task_result))
        .route("/v1/tasks/{id}/cancel", post(tasks::cancel_task))
        .route("/v1/nodes", get(nodes::list_nodes))
        .route("/v1/nodes/{id}/drain", post(nodes::drain_node))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_user,
        ));

    let node_routes = Router::new()
        .route("/v1/nodes/capability", post(nodes::report_capability))
        .route(
            "/v1/nodes/config",
            get(nodes::node_config).post(nodes::ack_config),
        )
        .route("/v1/nodes/jobs:lease", post(nodes::lease))
        .route("/v1/nodes/jobs/{job_id}/renew", post(nodes::renew))
        .route("/v1/nodes/jobs/{job_id}/complete", post(nodes::complete))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_node,
        ));

    let app = Router::new()
        .route("/healthz", get(|| async { Json(json!({ "status": "ok" })) }))
        .route("/readyz", get(readyz))
        .route("/v1/nodes/register", post(nodes::register))
        .merge(user_routes)
        .merge(node_routes)
        .with_state(state);
    with_http_layers(app, http)
}
