//! Bearer-token check and request-time authentication errors
//!
//! The bearer check is the only place an inbound request is rejected for
//! lack of valid credentials. It asks the route's bound [`Manager`] and, on
//! success, attaches an [`AuthenticatedSession`] to the request extensions.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::manager::Manager;
use crate::session::AuthenticatedSession;

/// Why a request was refused before reaching the upstream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No `Authorization` header
    #[error("authorization field missing")]
    AuthorizationFieldMissing,

    /// `Authorization` is not `Bearer <token>`
    #[error("bearer token malformed")]
    BearerMalformed,

    /// The bound manager does not know the token
    #[error("access token not authorized")]
    AccessTokenNotAuthorized,

    /// `client_id` has no registered secret
    #[error("invalid client ID")]
    InvalidClientId,

    /// Request budget exhausted
    #[error("rate limit exceeded")]
    RateLimited {
        /// Seconds until the caller may retry
        retry_after: u64,
    },
}

impl AuthError {
    /// Stable machine-readable code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthorizationFieldMissing => "authorization_field_missing",
            Self::BearerMalformed => "bearer_token_malformed",
            Self::AccessTokenNotAuthorized => "access_token_not_authorized",
            Self::InvalidClientId => "invalid_client_id",
            Self::RateLimited { .. } => "rate_limited",
        }
    }

    /// HTTP status sent to the caller
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthorizationFieldMissing | Self::BearerMalformed | Self::InvalidClientId => {
                StatusCode::BAD_REQUEST
            }
            Self::AccessTokenNotAuthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let mut response = error_response(self.status(), self.code(), &self.to_string());
        let headers = response.headers_mut();
        match self {
            Self::AccessTokenNotAuthorized => {
                headers.insert(header::WWW_AUTHENTICATE, header::HeaderValue::from_static("Bearer"));
            }
            Self::RateLimited { retry_after } => {
                headers.insert(header::RETRY_AFTER, header::HeaderValue::from(retry_after));
            }
            _ => {}
        }
        response
    }
}

/// JSON error body `{"error": code, "error_description": message}`
pub(crate) fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "error_description": message
        })),
    )
        .into_response()
}

/// Extract the token from an `Authorization: Bearer <token>` value.
///
/// The value must be exactly two space-separated parts, the first equal to
/// `Bearer` ignoring case.
pub fn parse_bearer(value: &str) -> Result<&str, AuthError> {
    let mut parts = value.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() => {
            Ok(token)
        }
        _ => Err(AuthError::BearerMalformed),
    }
}

/// Resolve the caller's session from request headers
pub async fn authenticate(
    manager: &dyn Manager,
    headers: &HeaderMap,
) -> Result<AuthenticatedSession, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::AuthorizationFieldMissing)?;
    let value = value.to_str().map_err(|_| AuthError::BearerMalformed)?;
    let token = parse_bearer(value)?;

    let session = manager
        .is_key_authorised(token)
        .await
        .ok_or(AuthError::AccessTokenNotAuthorized)?;

    Ok(AuthenticatedSession {
        session,
        access_token: token.to_string(),
    })
}

/// Bearer-check middleware
pub async fn bearer_check(
    State(manager): State<Arc<dyn Manager>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    match authenticate(manager.as_ref(), request.headers()).await {
        Ok(authenticated) => {
            debug!(
                path = %path,
                server = %authenticated.session.server_name,
                client = %authenticated.session.client_id,
                "Authenticated request"
            );
            request.extensions_mut().insert(authenticated);
            next.run(request).await
        }
        Err(e) => {
            debug!(path = %path, reason = e.code(), "Request rejected");
            e.into_response()
        }
    }
}
