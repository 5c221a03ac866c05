//! Per-caller request rate limiting for protected APIs
//!
//! Two backends share one middleware: a process-local `governor` limiter,
//! and the fixed-window [`StoreRateLimiter`] counting in the shared store so
//! several gateway instances see the same budget.
//!
//! Budgets are counted per registered listen path, never per request path,
//! and per caller identity. The middleware runs behind the bearer check, so
//! the identity is the authenticated session's client id (or a digest of its
//! token), which keeps the key space bounded by the sessions that exist.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::clock::Clock;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::auth::AuthError;
use crate::Result;
use crate::config::{RateLimitBackend, RateLimitConfig};
use crate::session::AuthenticatedSession;
use crate::store::{Store, StoreRateLimiter};

/// Rate limiter shared by every protected API route
pub enum RouteRateLimiter {
    /// In-process token bucket
    Local(DefaultKeyedRateLimiter<String>),
    /// Fixed window counted in the shared store
    Store(StoreRateLimiter),
}

impl RouteRateLimiter {
    /// Limiter from configuration; `None` when disabled or the limit is 0
    pub fn from_config(config: &RateLimitConfig, store: &Arc<dyn Store>) -> Option<Arc<Self>> {
        if !config.enabled {
            return None;
        }
        let per_minute = NonZeroU32::new(config.requests_per_minute)?;
        let limiter = match config.backend {
            RateLimitBackend::Local => Self::Local(RateLimiter::keyed(Quota::per_minute(per_minute))),
            RateLimitBackend::Store => Self::Store(StoreRateLimiter::new(
                Arc::clone(store),
                config.prefix.clone(),
                u64::from(per_minute.get()),
                Duration::from_secs(60),
            )),
        };
        Some(Arc::new(limiter))
    }

    /// Record one hit for `key`; `Ok(None)` when allowed, otherwise the
    /// number of seconds to wait.
    pub async fn hit(&self, key: &str) -> Result<Option<u64>> {
        match self {
            Self::Local(limiter) => Ok(limiter.check_key(&key.to_string()).err().map(|not_until| {
                let wait = not_until.wait_time_from(limiter.clock().now());
                wait.as_secs().max(1)
            })),
            Self::Store(limiter) => {
                let decision = limiter.check(key).await?;
                Ok((!decision.allowed).then(|| limiter.window().as_secs().max(1)))
            }
        }
    }

    /// Forget local buckets that have refilled completely. Store counters
    /// carry their own TTL and are left alone.
    pub fn retain_recent(&self) {
        if let Self::Local(limiter) = self {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }
}

/// Middleware state: the shared limiter bound to one route's listen path
#[derive(Clone)]
pub struct RouteBudget {
    limiter: Arc<RouteRateLimiter>,
    listen_path: Arc<str>,
}

impl RouteBudget {
    /// Count hits on `listen_path` against `limiter`
    #[must_use]
    pub fn new(limiter: Arc<RouteRateLimiter>, listen_path: &str) -> Self {
        Self {
            limiter,
            listen_path: Arc::from(listen_path),
        }
    }

    /// Key a request is counted under
    fn key(&self, request: &Request) -> String {
        format!("{}|{}", self.listen_path, caller_identity(request))
    }
}

/// Short digest of a credential, so raw tokens never become key names
fn digest(credential: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential);
    let hash = hasher.finalize();
    format!("{hash:x}")[..16].to_string()
}

/// Who a request is counted as
fn caller_identity(request: &Request) -> String {
    if let Some(authenticated) = request.extensions().get::<AuthenticatedSession>() {
        if authenticated.session.client_id.is_empty() {
            return format!("token:{}", digest(authenticated.access_token.as_bytes()));
        }
        return format!("client:{}", authenticated.session.client_id);
    }
    match request.headers().get(header::AUTHORIZATION) {
        Some(value) => format!("token:{}", digest(value.as_bytes())),
        None => "anonymous".to_string(),
    }
}

/// Rate-limit middleware. A failing store lets the request through.
pub async fn rate_limit(State(budget): State<RouteBudget>, request: Request, next: Next) -> Response {
    let key = budget.key(&request);
    match budget.limiter.hit(&key).await {
        Ok(None) => next.run(request).await,
        Ok(Some(retry_after)) => {
            debug!(route = %budget.listen_path, retry_after, "Rate limit exceeded");
            AuthError::RateLimited { retry_after }.into_response()
        }
        Err(e) => {
            warn!(error = %e, "Rate limit check failed, allowing request");
            next.run(request).await
        }
    }
}
