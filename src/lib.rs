//! OAuth Gateway Library
//!
//! OAuth2 gateway component: validates bearer tokens on protected APIs,
//! proxies IdP endpoints, and captures the tokens those endpoints issue.
//!
//! # Features
//!
//! - **Token strategies**: `storage` (captured sessions), `jwt` (local
//!   signature check) and `auth` (remote introspection)
//! - **Token capture**: tokens issued by an upstream token endpoint are stored
//!   with the TTL the IdP granted
//! - **Client secrets**: public clients get the Basic credentials registered
//!   for their `client_id` injected on the way upstream
//! - **Revocation**: revoking a token upstream also forgets the local session
//! - **Hot reload**: OAuth server definitions reload from a watched directory
//! - **Stores**: in-memory or Redis, both with per-key TTL

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod oauth;
pub mod session;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to setup tracing: {e}")))
}
