//! Error types for the OAuth gateway

use std::io;

use thiserror::Error;

/// Result type alias for the OAuth gateway
pub type Result<T> = std::result::Result<T, Error>;

/// OAuth gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token strategy name is not one of `storage`, `jwt`, `auth`
    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    /// JWT strategy settings carry no usable signing secret
    #[error("secret missing")]
    SecretMissing,

    /// Introspection strategy has no URL to call
    #[error("introspection URL missing")]
    IntrospectionUrlMissing,

    /// Introspection endpoint answered with a non-success status
    #[error("introspection endpoint answered {0}")]
    IntrospectionRejected(reqwest::StatusCode),

    /// Lookup miss (store key, repository entry)
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage backend failure that is not a plain miss
    #[error("Storage error: {0}")]
    Storage(String),

    /// Redis protocol / connection error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a not-found error for `what`
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// `true` for lookup misses
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
