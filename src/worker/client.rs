use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{FleetError, Problem, Result};
use crate::protocol::{
    CapabilityReport, CompletionRequest, ConfigAck, JobResponse, LeaseGrant, NodeConfiguration,
    RegistrationRequest, RegistrationResponse, RenewRequest, RenewResponse,
};

#[derive(Debug, Clone)]
struct Session {
    node_id: Uuid,
    token: String,
    expires_at: DateTime<Utc>,
}

/// HTTP client for the orchestrator's node-facing endpoints.
///
/// Holds the node token from the last registration and registers again
/// whenever the orchestrator answers 401.
pub struct OrchestratorClient {
    http: reqwest::Client,
    base_url: String,
    psk: String,
    session: Mutex<Option<Session>>,
    /// Most recent capability report, replayed on re-registration.
    last_report: Mutex<Option<CapabilityReport>>,
}

impl OrchestratorClient {
    pub fn new(base_url: impl Into<String>, psk: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FleetError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            psk: psk.into(),
            session: Mutex::new(None),
            last_report: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn node_id(&self) -> Option<Uuid> {
        self.session.lock().as_ref().map(|s| s.node_id)
    }

    pub fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.session.lock().as_ref().map(|s| s.expires_at)
    }

    /// Registers with the PSK and stores the returned node token.
    pub async fn register(&self, report: CapabilityReport) -> Result<RegistrationResponse> {
        let body = RegistrationRequest {
            psk: self.psk.clone(),
            capability: report.clone(),
        };
        let resp = self
            .http
            .post(self.url("/v1/nodes/register"))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            return Err(problem_error(resp, None).await);
        }
        let registration: RegistrationResponse = resp
            .json()
            .await
            .map_err(|e| FleetError::Upstream(format!("registration response: {e}")))?;

        *self.session.lock() = Some(Session {
            node_id: registration.node.id,
            token: registration.auth.node_jwt.clone(),
            expires_at: registration.auth.expires_at,
        });
        *self.last_report.lock() = Some(report);
        tracing::info!(
            node_id = %registration.node.id,
            status = %registration.node.status,
            token_expires_at = %registration.auth.expires_at,
            "Registered with orchestrator"
        );
        Ok(registration)
    }

    async fn reregister(&self) -> Result<()> {
        let report = self.last_report.lock().clone().ok_or_else(|| {
            FleetError::Unauthorized("node has not registered yet".to_string())
        })?;
        let report = CapabilityReport {
            reported_at: Utc::now(),
            ..report
        };
        self.register(report).await.map(|_| ())
    }

    fn token(&self) -> Result<String> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.token.clone())
            .ok_or_else(|| FleetError::Unauthorized("node has not registered yet".to_string()))
    }

    /// POSTs with the node token, re-registering once if the token is rejected.
    async fn post_authed<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let resp = self.post_once(path, body).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        tracing::warn!(path, "Node token rejected, re-registering");
        self.reregister().await?;
        self.post_once(path, body).await
    }

    async fn get_authed(&self, path: &str) -> Result<reqwest::Response> {
        let resp = self.get_once(path).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        tracing::warn!(path, "Node token rejected, re-registering");
        self.reregister().await?;
        self.get_once(path).await
    }

    async fn get_once(&self, path: &str) -> Result<reqwest::Response> {
        self.http
            .get(self.url(path))
            .bearer_auth(self.token()?)
            .send()
            .await
            .map_err(transport)
    }

    async fn post_once<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        self.http
            .post(self.url(path))
            .bearer_auth(self.token()?)
            .json(body)
            .send()
            .await
            .map_err(transport)
    }

    pub async fn report_capability(&self, report: CapabilityReport) -> Result<()> {
        let resp = self.post_authed("/v1/nodes/capability", &report).await?;
        if !resp.status().is_success() {
            return Err(problem_error(resp, None).await);
        }
        *self.last_report.lock() = Some(report);
        Ok(())
    }

    /// Fetches the configuration assigned to this node.
    pub async fn fetch_config(&self) -> Result<NodeConfiguration> {
        let resp = self.get_authed("/v1/nodes/config").await?;
        if !resp.status().is_success() {
            return Err(problem_error(resp, None).await);
        }
        let config: NodeConfiguration = resp
            .json()
            .await
            .map_err(|e| FleetError::Upstream(format!("config response: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn ack_config(&self, ack: &ConfigAck) -> Result<()> {
        let resp = self.post_authed("/v1/nodes/config", ack).await?;
        if !resp.status().is_success() {
            return Err(problem_error(resp, None).await);
        }
        Ok(())
    }

    /// Asks for the next job. `None` when the queue has nothing for this node.
    pub async fn lease(&self) -> Result<Option<LeaseGrant>> {
        let resp = self
            .post_authed("/v1/nodes/jobs:lease", &serde_json::json!({}))
            .await?;
        match resp.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => resp
                .json()
                .await
                .map(Some)
                .map_err(|e| FleetError::Upstream(format!("lease response: {e}"))),
            _ => Err(problem_error(resp, None).await),
        }
    }

    pub async fn renew(&self, job_id: Uuid, lease_id: &str) -> Result<DateTime<Utc>> {
        let resp = self
            .post_authed(
                &format!("/v1/nodes/jobs/{job_id}/renew"),
                &RenewRequest {
                    lease_id: lease_id.to_string(),
                },
            )
            .await?;
        if !resp.status().is_success() {
            return Err(problem_error(resp, Some(job_id)).await);
        }
        let renewed: RenewResponse = resp
            .json()
            .await
            .map_err(|e| FleetError::Upstream(format!("renew response: {e}")))?;
        Ok(renewed.lease_expires_at)
    }

    pub async fn complete(&self, lease_id: &str, result: JobResponse) -> Result<()> {
        let job_id = result.job_id;
        let resp = self
            .post_authed(
                &format!("/v1/nodes/jobs/{job_id}/complete"),
                &CompletionRequest {
                    lease_id: lease_id.to_string(),
                    result,
                },
            )
            .await?;
        if !resp.status().is_success() {
            return Err(problem_error(resp, Some(job_id)).await);
        }
        Ok(())
    }
}

fn transport(e: reqwest::Error) -> FleetError {
    FleetError::Upstream(format!("orchestrator unreachable: {e}"))
}

/// Maps an error response back onto a [`FleetError`].
async fn problem_error(resp: reqwest::Response, job_id: Option<Uuid>) -> FleetError {
    let status = resp.status();
    let (detail, retryable) = match resp.json::<Problem>().await {
        Ok(problem) => (problem.detail, problem.retryable),
        Err(_) => (status.to_string(), false),
    };
    match (status, job_id) {
        (StatusCode::BAD_REQUEST, _) => FleetError::Validation(detail),
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => FleetError::Unauthorized(detail),
        (StatusCode::NOT_FOUND, _) => FleetError::NotFound(detail),
        (StatusCode::TOO_MANY_REQUESTS, _) => FleetError::RateLimited(detail),
        (StatusCode::CONFLICT, Some(job_id)) if retryable => FleetError::LeaseConflict(job_id),
        (StatusCode::CONFLICT, Some(job_id)) => FleetError::LeaseLost {
            job_id,
            reason: detail,
        },
        _ => FleetError::Upstream(format!("{status}: {detail}")),
    }
}
