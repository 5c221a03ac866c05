//! Token removal on the revocation endpoint

use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use super::auth::error_response;
use crate::manager::Manager;

/// Largest revocation form the gateway buffers
const MAX_FORM_BYTES: usize = 64 * 1024;

/// `access_token` from a URL-encoded form (body or query string)
pub(crate) fn access_token_from_form(form: &[u8]) -> Option<String> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(form).ok()?;
    pairs
        .into_iter()
        .find_map(|(key, value)| (key == "access_token").then_some(value))
        .filter(|token| !token.is_empty())
}

/// Revoke middleware.
///
/// The upstream revocation endpoint runs first. Afterwards, when the original
/// request carried no `Authorization` header and named an `access_token`,
/// that token is removed from the bound manager. The removal is detached
/// from the response.
pub async fn revoke_token(
    State(manager): State<Arc<dyn Manager>>,
    request: Request,
    next: Next,
) -> Response {
    let had_authorization = request.headers().contains_key(header::AUTHORIZATION);
    let (parts, body) = request.into_parts();

    let bytes = match to_bytes(body, MAX_FORM_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "Unreadable revocation request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "revocation request body could not be read",
            );
        }
    };

    let token = access_token_from_form(&bytes).or_else(|| {
        parts
            .uri
            .query()
            .and_then(|q| access_token_from_form(q.as_bytes()))
    });

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;

    if had_authorization {
        return response;
    }
    if let Some(token) = token {
        let write = manager.remove(&token);
        tokio::spawn(async move {
            if let Err(e) = write.wait().await {
                debug!(error = %e, "Token removal after revocation failed");
            }
        });
        debug!(strategy = %manager.strategy(), "Revoked token removed");
    }

    response
}
