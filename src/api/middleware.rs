use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use serde_json::json;

use super::AppState;
use crate::audit::{AuditEntry, AuditKind};
use crate::auth::bearer_token;
use crate::error::{FleetError, Result};
use crate::ratelimit::RateLimitResult;

async fn audit_auth_failure(state: &AppState, path: &str, error: &FleetError) {
    tracing::warn!(path, error = %error, "Rejected bearer credential");
    state
        .store
        .record_audit(AuditEntry::new(
            AuditKind::AuthFailure,
            path,
            json!({ "reason": error.to_string() }),
            Utc::now(),
        ))
        .await;
}

/// Requires a user access token from an active user, then applies the
/// per-user rate limit. Inserts [`crate::auth::UserPrincipal`].
pub async fn require_user(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let path = request.uri().path().to_string();
    let verified = bearer_token(request.headers()).and_then(|t| state.tokens.verify_user(t));
    let principal = match verified {
        Ok(principal) => principal,
        Err(e) => {
            audit_auth_failure(&state, &path, &e).await;
            return Err(e);
        }
    };

    match state.store.user(principal.user_id).await? {
        Some(user) if user.value.is_active => {}
        _ => {
            let e = FleetError::Unauthorized("unknown or inactive user".to_string());
            audit_auth_failure(&state, &path, &e).await;
            return Err(e);
        }
    }

    if let RateLimitResult::Limited { retry_after } =
        state.limiter.check(&principal.user_id.to_string())
    {
        tracing::debug!(user_id = %principal.user_id, retry_after_ms = retry_after.as_millis() as u64, "Rate limited");
        return Err(FleetError::RateLimited(format!(
            "user {}; retry in {}s",
            principal.user_id,
            retry_after.as_secs().max(1)
        )));
    }

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

/// Requires a node token for a node that still exists. Records the call as
/// liveness (reviving `inactive` nodes). Inserts [`crate::auth::NodePrincipal`].
pub async fn require_node(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let path = request.uri().path().to_string();
    let verified = bearer_token(request.headers()).and_then(|t| state.tokens.verify_node(t));
    let principal = match verified {
        Ok(principal) => principal,
        Err(e) => {
            audit_auth_failure(&state, &path, &e).await;
            return Err(e);
        }
    };

    let node = match state.registry.touch(principal.node_id, Utc::now()).await {
        Ok(node) => node,
        Err(FleetError::NotFound(_)) => {
            let e = FleetError::Unauthorized("unknown node".to_string());
            audit_auth_failure(&state, &path, &e).await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };
    if node.slug != principal.slug {
        let e = FleetError::Unauthorized("token slug does not match node".to_string());
        audit_auth_failure(&state, &path, &e).await;
        return Err(e);
    }

    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}
