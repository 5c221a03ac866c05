//! Rate-limiter adapter over a [`Store`]
//!
//! Counters live in the same backend as cached tokens, under their own key
//! prefix, so a Redis deployment shares request budgets across instances.

use std::sync::Arc;
use std::time::Duration;

use super::Store;
use crate::Result;

/// Outcome of one rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request fits in the current window
    pub allowed: bool,
    /// Hits counted in the current window, this one included
    pub count: u64,
    /// Configured limit per window
    pub limit: u64,
}

impl RateLimitDecision {
    /// Hits left in the current window
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }
}

/// Fixed-window counter limiter backed by a shared [`Store`].
pub struct StoreRateLimiter {
    store: Arc<dyn Store>,
    prefix: String,
    limit: u64,
    window: Duration,
}

impl StoreRateLimiter {
    /// Allow `limit` hits per `window` for every key under `prefix`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, prefix: impl Into<String>, limit: u64, window: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            limit,
            window,
        }
    }

    /// Storage key used for a client key
    #[must_use]
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Count one hit for `key`.
    pub async fn check(&self, key: &str) -> Result<RateLimitDecision> {
        let ttl = self.window.as_secs().max(1);
        let count = self.store.increment(&self.storage_key(key), ttl).await?;
        Ok(RateLimitDecision {
            allowed: count <= self.limit,
            count,
            limit: self.limit,
        })
    }

    /// Window length, for `Retry-After`
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }
}
