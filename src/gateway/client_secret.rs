//! Client-secret injection for public clients
//!
//! A public client sends `?client_id=X` without a secret; the gateway adds
//! `Authorization: Basic base64(X:secret)` before forwarding so the
//! provider's token endpoint sees an authenticated client.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderValue, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};

use super::auth::AuthError;

/// Client id to client secret, shared by every route of one server
pub type ClientSecrets = Arc<HashMap<String, String>>;

/// `client_id` query parameter, if present and non-empty
pub(crate) fn client_id_from_query(query: Option<&str>) -> Option<String> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query?).ok()?;
    pairs
        .into_iter()
        .find_map(|(key, value)| (key == "client_id").then_some(value))
        .filter(|id| !id.is_empty())
}

/// `Basic` credential for `client_id:secret`
#[must_use]
pub fn basic_credential(client_id: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{client_id}:{secret}")))
}

/// Client-secret middleware
pub async fn inject_client_secret(
    State(secrets): State<ClientSecrets>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.headers().contains_key(header::AUTHORIZATION) {
        return next.run(request).await;
    }

    let Some(client_id) = client_id_from_query(request.uri().query()) else {
        return next.run(request).await;
    };

    let Some(secret) = secrets.get(&client_id) else {
        debug!(client = %client_id, "Unknown client id");
        return AuthError::InvalidClientId.into_response();
    };

    match HeaderValue::from_str(&basic_credential(&client_id, secret)) {
        Ok(value) => {
            request.headers_mut().insert(header::AUTHORIZATION, value);
            debug!(client = %client_id, "Injected client credentials");
            next.run(request).await
        }
        Err(e) => {
            warn!(client = %client_id, error = %e, "Client credentials are not a valid header");
            AuthError::InvalidClientId.into_response()
        }
    }
}
