//! Key-value storage with TTL semantics
//!
//! The [`Store`] trait is the only place token state lives. Two backends are
//! provided:
//!
//! - [`InMemoryStore`]: one `Mutex<HashMap>` for the whole map, expiry checked
//!   lazily on access. Meant for tests and single-instance deployments.
//! - [`RedisStore`]: pooled connections to a Redis server, probed with `PING`
//!   at construction.
//!
//! A TTL of zero always means "does not expire". Existence and retrieval are
//! separate calls and may race under concurrent writers.

mod memory;
mod rate_limit;
mod redis_store;

pub use memory::InMemoryStore;
pub use rate_limit::{RateLimitDecision, StoreRateLimiter};
pub use redis_store::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{Error, Result};

/// TTL-aware key-value storage shared by token managers and rate limiting.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Whether `key` currently holds a value
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Value stored under `key`; [`Error::NotFound`] when absent
    async fn get(&self, key: &str) -> Result<String>;

    /// Store `value` under `key` for `ttl_seconds` (0 = forever)
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()>;

    /// Delete `key`; deleting a missing key is not an error
    async fn remove(&self, key: &str) -> Result<()>;

    /// Drop expired entries a backend keeps until touched; returns how many
    /// went. Backends that expire keys themselves report 0.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }

    /// Increment the counter at `key`, creating it with `ttl_seconds` on the
    /// first hit of a window. Returns the new count.
    ///
    /// The default implementation is a plain read-modify-write and gives no
    /// atomicity guarantee; backends override it where they can do better.
    async fn increment(&self, key: &str, ttl_seconds: u64) -> Result<u64> {
        let current = match self.get(key).await {
            Ok(raw) => raw
                .parse::<u64>()
                .map_err(|e| Error::Storage(format!("counter {key} is not numeric: {e}")))?,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };
        let next = current + 1;
        self.set(key, &next.to_string(), ttl_seconds).await?;
        Ok(next)
    }
}

/// Build a store from a DSN: `memory://` or `redis://...` / `rediss://...`.
pub async fn connect(dsn: &str, pool_size: usize, timeout: Duration) -> Result<Arc<dyn Store>> {
    let scheme = dsn.split("://").next().unwrap_or_default();
    match scheme {
        "memory" => {
            tracing::info!("Using in-memory token store");
            Ok(Arc::new(InMemoryStore::new()))
        }
        "redis" | "rediss" => {
            let store = RedisStore::connect(dsn, pool_size, timeout).await?;
            Ok(Arc::new(store))
        }
        other => Err(Error::Config(format!("Unsupported storage DSN scheme: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory_dsn() {
        let store = connect("memory://localhost", 1, Duration::from_secs(1))
            .await
            .unwrap();
        store.set("k", "v", 0).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let err = connect("mongodb://localhost", 1, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
