//! Cache-backed token manager

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Manager, PendingWrite, Strategy, WriteFailureSink, WriteOp, report_failure};
use crate::session::Session;
use crate::store::Store;

/// Keeps sessions in the shared [`Store`], keyed by access token.
///
/// `set` and `remove` run on a background task so the request that triggered
/// them never waits on the store.
pub struct StorageManager {
    store: Arc<dyn Store>,
    failures: Option<WriteFailureSink>,
}

impl StorageManager {
    /// Create a manager over `store`
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            failures: None,
        }
    }

    /// Report failed background writes on `sink`
    #[must_use]
    pub fn with_failure_sink(mut self, sink: WriteFailureSink) -> Self {
        self.failures = Some(sink);
        self
    }
}

#[async_trait]
impl Manager for StorageManager {
    fn set(&self, access_token: &str, session: &Session, ttl_seconds: u64) -> PendingWrite {
        let value = match session.to_json() {
            Ok(v) => v,
            Err(e) => return PendingWrite::ready(Err(e)),
        };

        let store = Arc::clone(&self.store);
        let failures = self.failures.clone();
        let key = access_token.to_string();
        PendingWrite::spawned(tokio::spawn(async move {
            let result = store.set(&key, &value, ttl_seconds).await;
            match &result {
                Ok(()) => debug!(ttl_seconds, "Session stored"),
                Err(e) => report_failure(failures.as_ref(), WriteOp::Set, &key, e),
            }
            result
        }))
    }

    async fn is_key_authorised(&self, access_token: &str) -> Option<Session> {
        match self.store.exists(access_token).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                debug!(error = %e, "Token existence check failed");
                return None;
            }
        }

        let raw = match self.store.get(access_token).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "Token lookup failed");
                return None;
            }
        };

        match Session::from_json(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                debug!(error = %e, "Stored session is unreadable");
                None
            }
        }
    }

    fn remove(&self, access_token: &str) -> PendingWrite {
        let store = Arc::clone(&self.store);
        let failures = self.failures.clone();
        let key = access_token.to_string();
        PendingWrite::spawned(tokio::spawn(async move {
            let result = store.remove(&key).await;
            if let Err(e) = &result {
                report_failure(failures.as_ref(), WriteOp::Remove, &key, e);
            }
            result
        }))
    }

    fn strategy(&self) -> Strategy {
        Strategy::Storage
    }
}
