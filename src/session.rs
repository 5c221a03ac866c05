//! Session records and the typed request context
//!
//! A [`Session`] is what the gateway knows about one issued access token.
//! It is serialized as JSON into the key-value store under the access token
//! itself; there is no secondary index.

use serde::{Deserialize, Serialize};

/// One issued access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Name of the OAuth server that issued the token
    #[serde(rename = "server_id", default)]
    pub server_name: String,
    /// Remaining lifetime in seconds at issuance (0 = no expiry)
    #[serde(default)]
    pub expires_in: u64,
    /// OAuth client the token was issued to
    #[serde(rename = "oauth_client_id", default)]
    pub client_id: String,
    /// The access token (storage key)
    pub access_token: String,
    /// Token type, usually `Bearer`
    #[serde(default)]
    pub token_type: String,
}

impl Session {
    /// Serialize to the string form kept in the store
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the string form kept in the store
    pub fn from_json(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Credentials resolved by the bearer check, attached to the request
/// extensions for downstream stages.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    /// Session returned by the bound token manager
    pub session: Session,
    /// Raw access token taken from the `Authorization` header
    pub access_token: String,
}
