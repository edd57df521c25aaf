use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

use sandbox_fleet::config::{HttpConfig, SandboxConfig};
use sandbox_fleet::worker::agent;
use sandbox_fleet::worker::{AgentState, SandboxExecutor};

const WORKER_TOKEN: &str = "worker-secret";

fn create_test_app(config: SandboxConfig) -> Router {
    let http = HttpConfig::node_agent();
    let state = AgentState {
        executor: Arc::new(SandboxExecutor::new(config)),
        worker_token: Arc::from(WORKER_TOKEN),
        shutdown: CancellationToken::new(),
        write_timeout: http.write_timeout,
    };
    agent::router(state, &http)
}

async fn run(app: &Router, token: Option<&str>, body: String) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/worker/jobs:run")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let response = app
        .clone()
        .oneshot(builder.body(Body::from(body)).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn job(command: Value) -> String {
    json!({
        "version": 1,
        "task_id": Uuid::new_v4(),
        "job_id": Uuid::new_v4(),
        "sandbox": { "image": "alpine:latest", "command": command, "network_policy": "none" }
    })
    .to_string()
}

#[tokio::test]
async fn test_run_requires_the_worker_token() {
    let app = create_test_app(SandboxConfig::direct());

    let (status, body) = run(&app, None, job(json!(["echo", "hi"]))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["type"], "auth");

    let (status, _) = run(&app, Some("nope"), job(json!(["echo", "hi"]))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_run_rejects_invalid_requests() {
    let app = create_test_app(SandboxConfig::direct());

    let (status, body) = run(&app, Some(WORKER_TOKEN), "{not json".to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "validation");

    let (status, _) = run(&app, Some(WORKER_TOKEN), job(json!([]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut wrong_version: Value = serde_json::from_str(&job(json!(["true"]))).unwrap();
    wrong_version["version"] = json!(2);
    let (status, _) = run(&app, Some(WORKER_TOKEN), wrong_version.to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_run_executes_the_job() {
    let app = create_test_app(SandboxConfig::direct());
    let request = job(json!(["sh", "-c", "echo from-agent"]));
    let sent: Value = serde_json::from_str(&request).unwrap();

    let (status, body) = run(&app, Some(WORKER_TOKEN), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);
    assert_eq!(body["job_id"], sent["job_id"]);
    assert_eq!(body["task_id"], sent["task_id"]);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["exit_code"], 0);
    assert_eq!(body["stdout"], "from-agent\n");
    assert_eq!(body["truncated"]["stdout"], false);
}

#[tokio::test]
async fn test_run_reports_process_failure_as_ok() {
    let app = create_test_app(SandboxConfig::direct());
    let (status, body) = run(&app, Some(WORKER_TOKEN), job(json!(["sh", "-c", "exit 7"]))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["exit_code"], 7);
}

#[tokio::test]
async fn test_health_and_readiness() {
    let app = create_test_app(SandboxConfig::direct());
    let response = app
        .clone()
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app
        .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let broken = create_test_app(SandboxConfig {
        runtime_binary: Some("/nonexistent/docker".to_string()),
        ..SandboxConfig::default()
    });
    let response = broken
        .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_run_rejects_timeout_beyond_the_write_deadline() {
    let app = create_test_app(SandboxConfig::direct());
    let mut request: Value = serde_json::from_str(&job(json!(["true"]))).unwrap();
    request["sandbox"]["timeout_seconds"] = json!(3600);

    let (status, body) = run(&app, Some(WORKER_TOKEN), request.to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "validation");

    // Just under the deadline once teardown is counted.
    request["sandbox"]["timeout_seconds"] = json!(300);
    let (status, body) = run(&app, Some(WORKER_TOKEN), request.to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
}
