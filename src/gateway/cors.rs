//! CORS layer built from a server's [`CorsPolicy`]

use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer, ExposeHeaders};
use tracing::warn;

use crate::oauth::CorsPolicy;

/// Translate `policy` into a [`CorsLayer`].
///
/// Wildcards are mirrored from the request when credentials are allowed,
/// since browsers reject `*` together with credentials. Unparseable entries
/// are logged and ignored.
#[must_use]
pub fn cors_layer(policy: &CorsPolicy) -> CorsLayer {
    let credentials = policy.allow_credentials;

    let origins = if policy.allowed_origins.is_empty() || policy.allowed_origins.iter().any(|o| o == "*") {
        if credentials {
            AllowOrigin::mirror_request()
        } else {
            AllowOrigin::from(Any)
        }
    } else {
        AllowOrigin::list(parse_all::<HeaderValue>(&policy.allowed_origins, "origin"))
    };

    let methods = if policy.allowed_methods.is_empty() {
        if credentials {
            AllowMethods::mirror_request()
        } else {
            AllowMethods::from(Any)
        }
    } else {
        AllowMethods::list(parse_all::<Method>(&policy.allowed_methods, "method"))
    };

    let headers = if policy.allowed_headers.is_empty() {
        if credentials {
            AllowHeaders::mirror_request()
        } else {
            AllowHeaders::from(Any)
        }
    } else {
        AllowHeaders::list(parse_all::<HeaderName>(&policy.allowed_headers, "header"))
    };

    let mut layer = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(credentials);

    if !policy.exposed_headers.is_empty() {
        layer = layer.expose_headers(ExposeHeaders::list(parse_all::<HeaderName>(
            &policy.exposed_headers,
            "exposed header",
        )));
    }
    if let Some(max_age) = policy.max_age {
        layer = layer.max_age(Duration::from_secs(max_age));
    }
    layer
}

fn parse_all<T: std::str::FromStr>(values: &[String], what: &str) -> Vec<T> {
    values
        .iter()
        .filter_map(|v| match v.parse::<T>() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                warn!(value = %v, kind = what, "Ignoring invalid CORS entry");
                None
            }
        })
        .collect()
}
