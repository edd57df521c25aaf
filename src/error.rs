use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded for {0}")]
    RateLimited(String),

    /// Conditional update lost a race; retried internally up to a bound.
    #[error("Lease conflict on job {0}")]
    LeaseConflict(Uuid),

    /// The caller's lease is no longer current (reaped, cancelled, or superseded).
    ///
    /// Served as 409 with `retryable: false` rather than a 401-equivalent:
    /// the node's credentials are still valid, only the lease is gone. The
    /// node client maps a 409 on heartbeat or completion back to this variant
    /// and abandons the job.
    #[error("Lease on job {job_id} is no longer held: {reason}")]
    LeaseLost { job_id: Uuid, reason: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Executor error: {0}")]
    Executor(String),

    /// The orchestrator could not be reached or answered with a server error.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;

impl FleetError {
    /// Machine-readable kind, used as the problem `type` and in audit entries.
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::Validation(_) => "validation",
            FleetError::Unauthorized(_) => "auth",
            FleetError::NotFound(_) => "not_found",
            FleetError::RateLimited(_) => "rate_limited",
            FleetError::LeaseConflict(_) | FleetError::LeaseLost { .. } => "lease_conflict",
            FleetError::StoreUnavailable(_) => "store_unavailable",
            FleetError::InvariantViolation(_) => "invariant_violation",
            FleetError::Executor(_) => "executor_failure",
            FleetError::Upstream(_) => "upstream",
            FleetError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            FleetError::Validation(_) => StatusCode::BAD_REQUEST,
            FleetError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            FleetError::NotFound(_) => StatusCode::NOT_FOUND,
            FleetError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            FleetError::LeaseConflict(_) | FleetError::LeaseLost { .. } => StatusCode::CONFLICT,
            FleetError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            FleetError::Upstream(_) => StatusCode::BAD_GATEWAY,
            FleetError::InvariantViolation(_)
            | FleetError::Executor(_)
            | FleetError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::LeaseConflict(_)
                | FleetError::StoreUnavailable(_)
                | FleetError::Upstream(_)
        )
    }
}

/// Problem-details body returned for every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    /// Set when the same request may succeed if sent again.
    #[serde(default)]
    pub retryable: bool,
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "Request failed");
        }
        let problem = Problem {
            kind: self.kind().to_string(),
            title: status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            status: status.as_u16(),
            detail: self.to_string(),
            retryable: self.is_retryable(),
        };
        let body = serde_json::to_vec(&problem).unwrap_or_default();
        (
            status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            body,
        )
            .into_response()
    }
}
