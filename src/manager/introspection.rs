//! Remote-introspection token manager

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONNECTION;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Manager, PendingWrite, Strategy};
use crate::session::Session;
use crate::{Error, Result};

/// Introspection endpoint reply; only `active` is load-bearing
#[derive(Debug, Deserialize)]
struct IntrospectionReply {
    active: bool,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    exp: Option<u64>,
}

/// Asks a remote endpoint about every token. No caching.
pub struct IntrospectionManager {
    server_name: String,
    url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl IntrospectionManager {
    /// Build a manager calling `url` with a per-call deadline of `timeout`.
    ///
    /// # Errors
    ///
    /// [`Error::IntrospectionUrlMissing`] when `url` is empty.
    pub fn new(
        server_name: impl Into<String>,
        url: impl Into<String>,
        http: reqwest::Client,
        timeout: Duration,
    ) -> Result<Self> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(Error::IntrospectionUrlMissing);
        }
        Ok(Self {
            server_name: server_name.into(),
            url,
            http,
            timeout,
        })
    }

    /// Introspection URL this manager calls
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn introspect(&self, access_token: &str) -> Result<IntrospectionReply> {
        let response = self
            .http
            .get(&self.url)
            .bearer_auth(access_token)
            .header(CONNECTION, "close")
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::IntrospectionRejected(response.status()));
        }

        Ok(response.json::<IntrospectionReply>().await?)
    }
}

#[async_trait]
impl Manager for IntrospectionManager {
    fn set(&self, _access_token: &str, _session: &Session, _ttl_seconds: u64) -> PendingWrite {
        // the provider owns token state
        PendingWrite::ready(Ok(()))
    }

    async fn is_key_authorised(&self, access_token: &str) -> Option<Session> {
        let reply = match tokio::time::timeout(self.timeout, self.introspect(access_token)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(server = %self.server_name, error = %e, "Token introspection failed");
                return None;
            }
            Err(_) => {
                warn!(server = %self.server_name, timeout = ?self.timeout, "Token introspection timed out");
                return None;
            }
        };

        if !reply.active {
            debug!(server = %self.server_name, "Token reported inactive");
            return None;
        }

        let expires_in = reply
            .exp
            .map(|exp| {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO)
                    .as_secs();
                exp.saturating_sub(now)
            })
            .unwrap_or_default();

        Some(Session {
            server_name: self.server_name.clone(),
            expires_in,
            client_id: reply.client_id.unwrap_or_default(),
            access_token: access_token.to_string(),
            token_type: reply.token_type.unwrap_or_else(|| "Bearer".to_string()),
        })
    }

    fn remove(&self, _access_token: &str) -> PendingWrite {
        PendingWrite::ready(Ok(()))
    }

    fn strategy(&self) -> Strategy {
        Strategy::Auth
    }
}
