//! Authentication extractor.
//!
//! Browsers cannot set headers on a WebSocket upgrade, so the token is read
//! from a `Bearer` authorization header or, failing that, from the `token`
//! query parameter.

use axum::{
    extract::{FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts},
};
use serde::Deserialize;

use crate::error::AppError;
use crate::AppState;

/// What a connection is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Presented the configured service secret
    Service,
    /// No secret is configured; anyone may connect
    Anonymous,
}

/// Authenticated caller extracted from the request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub role: Role,
}

impl AuthUser {
    /// Service tokens skip rule evaluation.
    pub fn skips_rules(&self) -> bool {
        self.role == Role::Service
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Check a presented token against the configured secret.
pub fn authorize(secret: Option<&str>, token: Option<&str>) -> Result<AuthUser, AppError> {
    match (secret, token) {
        (None, _) => Ok(AuthUser {
            role: Role::Anonymous,
        }),
        (Some(secret), Some(token)) if !token.is_empty() && token == secret => Ok(AuthUser {
            role: Role::Service,
        }),
        (Some(_), _) => Err(AppError::Unauthorized),
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header_token = match parts.headers.get(AUTHORIZATION) {
            Some(value) => {
                let header = value.to_str().map_err(|_| AppError::Unauthorized)?;
                let token = header
                    .strip_prefix("Bearer ")
                    .ok_or_else(|| AppError::BadRequest("Invalid authorization header format".into()))?;
                Some(token.to_string())
            }
            None => None,
        };
        let token = match header_token {
            Some(token) => Some(token),
            None => Query::<TokenQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(q)| q.token),
        };

        let user = authorize(state.config.auth_secret.as_deref(), token.as_deref());
        if user.is_err() {
            tracing::warn!(uri = %parts.uri.path(), "Rejected unauthenticated request");
        }
        user
    }
}
