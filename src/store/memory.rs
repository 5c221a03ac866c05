//! In-memory store guarded by a single mutex

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::Store;
use crate::{Error, Result};

/// A stored value with optional expiry
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: String, ttl_seconds: u64) -> Self {
        let expires_at = (ttl_seconds > 0).then(|| Instant::now() + Duration::from_secs(ttl_seconds));
        Self { value, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Process-local [`Store`]; every operation takes the one lock.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries (expired ones are dropped first)
    #[must_use]
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !e.is_expired());
        entries.len()
    }

    /// Whether the store holds no live entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a live entry, evicting it if it has expired.
    fn live_value(entries: &mut HashMap<String, Entry>, key: &str) -> Option<String> {
        if entries.get(key).is_some_and(Entry::is_expired) {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|e| e.value.clone())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key).is_some())
    }

    async fn get(&self, key: &str) -> Result<String> {
        let mut entries = self.entries.lock();
        Self::live_value(&mut entries, key).ok_or_else(|| Error::not_found(key))
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), Entry::new(value.to_string(), ttl_seconds));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired());
        Ok(before - entries.len())
    }

    async fn increment(&self, key: &str, ttl_seconds: u64) -> Result<u64> {
        let mut entries = self.entries.lock();
        let current = match Self::live_value(&mut entries, key) {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| Error::Storage(format!("counter {key} is not numeric: {e}")))?,
            None => 0,
        };
        let next = current + 1;
        match entries.get_mut(key) {
            // keep the window's original expiry
            Some(entry) => entry.value = next.to_string(),
            None => {
                entries.insert(key.to_string(), Entry::new(next.to_string(), ttl_seconds));
            }
        }
        Ok(next)
    }
}
