//! Bearer credentials.
//!
//! Three namespaces that never overlap:
//! - user access tokens (HS256, audience [`USER_AUDIENCE`], `token_type = access`)
//! - node tokens (HS256, audience [`NODE_AUDIENCE`], `token_type = node`)
//! - the registration PSK, accepted only by node registration

use axum::http::{header, HeaderMap};
use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::{FleetError, Result};
use crate::store::{Store, Txn};

pub const USER_AUDIENCE: &str = "fleet-api";
pub const NODE_AUDIENCE: &str = "fleet-nodes";

pub const ADMIN_HANDLE: &str = "admin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub handle: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Node,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub token_type: TokenType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_slug: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPrincipal {
    pub user_id: Uuid,
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePrincipal {
    pub node_id: Uuid,
    pub slug: String,
}

/// A minted token and when it stops being accepted.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    access_ttl: TimeDelta,
    node_ttl: TimeDelta,
}

impl TokenIssuer {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            issuer: config.issuer.clone(),
            access_ttl: config.access_token_ttl,
            node_ttl: config.node_token_ttl,
        }
    }

    fn sign(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| FleetError::Internal(format!("sign token: {e}")))
    }

    fn verify(&self, token: &str, audience: &str, token_type: TokenType) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience]);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "sub", "aud", "iss"]);

        let claims = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| {
                let reason = match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => "token expired",
                    jsonwebtoken::errors::ErrorKind::InvalidAudience => "token not valid here",
                    jsonwebtoken::errors::ErrorKind::InvalidIssuer => "unknown issuer",
                    jsonwebtoken::errors::ErrorKind::InvalidSignature => "bad signature",
                    _ => "malformed token",
                };
                FleetError::Unauthorized(reason.to_string())
            })?
            .claims;
        if claims.token_type != token_type {
            return Err(FleetError::Unauthorized("wrong token type".to_string()));
        }
        Ok(claims)
    }

    pub fn issue_user(&self, user: &User, now: DateTime<Utc>) -> Result<IssuedToken> {
        let expires_at = now + self.access_ttl;
        let token = self.sign(&Claims {
            sub: user.id.to_string(),
            iss: self.issuer.clone(),
            aud: USER_AUDIENCE.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            token_type: TokenType::Access,
            handle: Some(user.handle.clone()),
            node_slug: None,
        })?;
        Ok(IssuedToken { token, expires_at })
    }

    pub fn issue_node(&self, node_id: Uuid, slug: &str, now: DateTime<Utc>) -> Result<IssuedToken> {
        let expires_at = now + self.node_ttl;
        let token = self.sign(&Claims {
            sub: node_id.to_string(),
            iss: self.issuer.clone(),
            aud: NODE_AUDIENCE.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            token_type: TokenType::Node,
            handle: None,
            node_slug: Some(slug.to_string()),
        })?;
        Ok(IssuedToken { token, expires_at })
    }

    pub fn verify_user(&self, token: &str) -> Result<UserPrincipal> {
        let claims = self.verify(token, USER_AUDIENCE, TokenType::Access)?;
        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| FleetError::Unauthorized("malformed subject".to_string()))?;
        Ok(UserPrincipal {
            user_id,
            handle: claims.handle.unwrap_or_default(),
        })
    }

    pub fn verify_node(&self, token: &str) -> Result<NodePrincipal> {
        let claims = self.verify(token, NODE_AUDIENCE, TokenType::Node)?;
        let node_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| FleetError::Unauthorized("malformed subject".to_string()))?;
        let slug = claims
            .node_slug
            .ok_or_else(|| FleetError::Unauthorized("node token without slug".to_string()))?;
        Ok(NodePrincipal { node_id, slug })
    }
}

/// Compares digests so the comparison time does not depend on the key.
pub fn psk_matches(given: &str, expected: &str) -> bool {
    !expected.is_empty() && Sha256::digest(given.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| FleetError::Unauthorized("missing bearer token".to_string()))?
        .to_str()
        .map_err(|_| FleetError::Unauthorized("malformed authorization header".to_string()))?;
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(token.trim())
        }
        _ => Err(FleetError::Unauthorized("expected a bearer token".to_string())),
    }
}

/// Creates the `admin` user on first start and returns it.
pub async fn ensure_admin(store: &Store, now: DateTime<Utc>) -> Result<User> {
    if let Some(existing) = store.user_by_handle(ADMIN_HANDLE).await? {
        return Ok(existing.value);
    }
    let user = User {
        id: Uuid::new_v4(),
        handle: ADMIN_HANDLE.to_string(),
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    let mut txn = Txn::new();
    txn.insert_user(&user)?;
    if store.commit(txn).await? {
        tracing::info!(user_id = %user.id, "Bootstrap admin user created");
        return Ok(user);
    }
    // Another instance created it first.
    store
        .user_by_handle(ADMIN_HANDLE)
        .await?
        .map(|v| v.value)
        .ok_or_else(|| FleetError::Internal("admin user vanished after conflict".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(&AuthConfig {
            jwt_secret: "unit-test-secret".to_string(),
            ..Default::default()
        })
    }

    fn user() -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            handle: "alice".to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn user_and_node_tokens_are_not_interchangeable() {
        let tokens = issuer();
        let now = Utc::now();
        let user_token = tokens.issue_user(&user(), now).unwrap().token;
        let node_token = tokens.issue_node(Uuid::new_v4(), "n1", now).unwrap().token;

        assert!(tokens.verify_user(&user_token).is_ok());
        assert!(tokens.verify_node(&node_token).is_ok());
        assert!(matches!(
            tokens.verify_node(&user_token),
            Err(FleetError::Unauthorized(_))
        ));
        assert!(matches!(
            tokens.verify_user(&node_token),
            Err(FleetError::Unauthorized(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let tokens = issuer();
        let long_ago = Utc::now() - TimeDelta::days(3);
        let token = tokens.issue_node(Uuid::new_v4(), "n1", long_ago).unwrap().token;
        let err = tokens.verify_node(&token).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let other = TokenIssuer::new(&AuthConfig {
            jwt_secret: "someone-else".to_string(),
            ..Default::default()
        });
        let token = other.issue_user(&user(), Utc::now()).unwrap().token;
        assert!(issuer().verify_user(&token).is_err());
    }

    #[test]
    fn psk_comparison() {
        assert!(psk_matches("s3cret", "s3cret"));
        assert!(!psk_matches("s3cret ", "s3cret"));
        assert!(!psk_matches("", ""));
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "abc");
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(bearer_token(&headers).is_err());
    }
}
