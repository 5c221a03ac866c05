//! Access-token managers
//!
//! A [`Manager`] answers "is this access token valid, and which session does
//! it carry?". Three strategies exist, selected once per OAuth server when
//! its definition is loaded:
//!
//! - [`StorageManager`]: sessions cached in the shared [`Store`](crate::store::Store)
//! - [`JwtManager`]: stateless validation of signed claims
//! - [`IntrospectionManager`]: a remote introspection call per check
//!
//! Writes (`set`/`remove`) return a [`PendingWrite`]. Dropping it keeps the
//! write off the request path; awaiting it yields the outcome.

mod factory;
mod introspection;
mod jwt;
mod storage;

pub use factory::{ManagerFactory, SigningMethod, Strategy, parse_jwt_settings};
pub use introspection::IntrospectionManager;
pub use jwt::JwtManager;
pub use storage::StorageManager;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::session::Session;
use crate::{Error, Result};

/// Token validation capability shared by all strategies.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    /// Record `session` under `access_token` for `ttl_seconds` (0 = forever).
    fn set(&self, access_token: &str, session: &Session, ttl_seconds: u64) -> PendingWrite;

    /// The session carried by `access_token`, or `None` when it is not
    /// authorised. Backend failures also yield `None`.
    async fn is_key_authorised(&self, access_token: &str) -> Option<Session>;

    /// Forget `access_token`.
    fn remove(&self, access_token: &str) -> PendingWrite;

    /// Strategy this manager implements
    fn strategy(&self) -> Strategy;
}

/// Kind of write reported to a failure sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    /// Session persistence
    Set,
    /// Token removal (revoke)
    Remove,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set => f.write_str("set"),
            Self::Remove => f.write_str("remove"),
        }
    }
}

/// A detached write that did not succeed
#[derive(Debug, Clone)]
pub struct WriteFailure {
    /// Operation that failed
    pub op: WriteOp,
    /// Store key (the access token)
    pub key: String,
    /// Rendered error
    pub error: String,
}

/// Bounded channel receiving [`WriteFailure`]s from background writes.
pub type WriteFailureSink = mpsc::Sender<WriteFailure>;

/// Handle on a token write.
///
/// Dropping the handle detaches the write; it still runs to completion and
/// any failure is logged (and sent to the configured sink, if any).
#[must_use = "drop the handle to detach the write, or await `wait()` for its outcome"]
pub struct PendingWrite {
    inner: Pending,
}

enum Pending {
    Ready(Result<()>),
    Spawned(JoinHandle<Result<()>>),
}

impl PendingWrite {
    /// A write that already finished (or had nothing to do)
    pub fn ready(result: Result<()>) -> Self {
        Self {
            inner: Pending::Ready(result),
        }
    }

    /// A write running on a background task
    pub fn spawned(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            inner: Pending::Spawned(handle),
        }
    }

    /// Wait for the write to finish.
    pub async fn wait(self) -> Result<()> {
        match self.inner {
            Pending::Ready(result) => result,
            Pending::Spawned(handle) => handle
                .await
                .map_err(|e| Error::Internal(format!("token write task failed: {e}")))?,
        }
    }
}

/// Log a failed background write and forward it to `sink` without blocking.
pub(crate) fn report_failure(sink: Option<&WriteFailureSink>, op: WriteOp, key: &str, error: &Error) {
    warn!(op = %op, error = %error, "Token write failed");
    if let Some(sink) = sink {
        let failure = WriteFailure {
            op,
            key: key.to_string(),
            error: error.to_string(),
        };
        if sink.try_send(failure).is_err() {
            warn!(op = %op, "Write failure channel full or closed, dropping report");
        }
    }
}
