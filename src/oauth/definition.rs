//! OAuth server and protected API definitions
//!
//! These types map directly to the YAML/JSON definition files and to the
//! inline `servers`/`apis` configuration sections.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One protected upstream authentication provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthServer {
    /// Opaque identifier
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    /// Unique name; empty means "not found"
    #[serde(default)]
    pub name: String,

    /// Provider endpoints proxied by the gateway
    #[serde(default)]
    pub endpoints: Endpoints,

    /// Client management endpoints
    #[serde(default)]
    pub client_endpoints: ClientEndpoints,

    /// Public client id to client secret
    #[serde(default)]
    pub client_secrets: HashMap<String, String>,

    /// How access tokens issued by this server are validated
    #[serde(default)]
    pub token_strategy: TokenStrategy,

    /// CORS policy applied to every provider endpoint
    #[serde(default)]
    pub cors: CorsPolicy,

    /// Creation timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl OAuthServer {
    /// A definition with `name` and every other field defaulted
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            endpoints: Endpoints::default(),
            client_endpoints: ClientEndpoints::default(),
            client_secrets: HashMap::new(),
            token_strategy: TokenStrategy::default(),
            cors: CorsPolicy::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Every configured endpoint paired with its role
    pub fn roles(&self) -> impl Iterator<Item = (EndpointRole, &Endpoint)> {
        [
            (EndpointRole::Authorize, self.endpoints.authorize.as_ref()),
            (EndpointRole::Token, self.endpoints.token.as_ref()),
            (EndpointRole::Info, self.endpoints.info.as_ref()),
            (EndpointRole::Revoke, self.endpoints.revoke.as_ref()),
            (EndpointRole::CreateClient, self.client_endpoints.create.as_ref()),
            (EndpointRole::RemoveClient, self.client_endpoints.remove.as_ref()),
        ]
        .into_iter()
        .filter_map(|(role, endpoint)| endpoint.map(|e| (role, e)))
    }
}

/// Provider endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoints {
    /// Authorization endpoint
    #[serde(default)]
    pub authorize: Option<Endpoint>,
    /// Token endpoint; responses are inspected for new tokens
    #[serde(default)]
    pub token: Option<Endpoint>,
    /// Token info / introspection endpoint
    #[serde(default)]
    pub info: Option<Endpoint>,
    /// Revocation endpoint
    #[serde(default)]
    pub revoke: Option<Endpoint>,
}

/// Client management endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientEndpoints {
    /// Create a client
    #[serde(default)]
    pub create: Option<Endpoint>,
    /// Remove a client
    #[serde(default)]
    pub remove: Option<Endpoint>,
}

/// A proxied endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Path the gateway listens on
    pub listen_path: String,
    /// Absolute upstream URL requests are forwarded to
    pub upstream_url: String,
    /// Allowed methods (empty = any)
    #[serde(default)]
    pub methods: Vec<String>,
    /// Remove the listen path before forwarding
    #[serde(default = "default_strip_path")]
    pub strip_path: bool,
}

fn default_strip_path() -> bool {
    true
}

impl Endpoint {
    /// Endpoint listening on `listen_path`, forwarding to `upstream_url`
    #[must_use]
    pub fn new(listen_path: impl Into<String>, upstream_url: impl Into<String>) -> Self {
        Self {
            listen_path: listen_path.into(),
            upstream_url: upstream_url.into(),
            methods: Vec::new(),
            strip_path: true,
        }
    }

    /// Non-empty listen path without embedded whitespace
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.listen_path.is_empty() && !self.listen_path.chars().any(char::is_whitespace)
    }
}

/// Role an endpoint plays for its server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    /// Authorization endpoint
    Authorize,
    /// Token endpoint
    Token,
    /// Token info endpoint
    Info,
    /// Revocation endpoint
    Revoke,
    /// Client creation
    CreateClient,
    /// Client removal
    RemoveClient,
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Authorize => "authorize",
            Self::Token => "token",
            Self::Info => "info",
            Self::Revoke => "revoke",
            Self::CreateClient => "create_client",
            Self::RemoveClient => "remove_client",
        };
        f.write_str(name)
    }
}

/// Token validation strategy and its strategy-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenStrategy {
    /// `storage`, `jwt` or `auth`
    #[serde(default = "default_strategy_name")]
    pub name: String,
    /// Parsed by the strategy itself
    #[serde(default)]
    pub settings: serde_json::Value,
}

fn default_strategy_name() -> String {
    "storage".to_string()
}

impl Default for TokenStrategy {
    fn default() -> Self {
        Self {
            name: default_strategy_name(),
            settings: serde_json::Value::Null,
        }
    }
}

/// Cross-origin policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorsPolicy {
    /// Enable CORS handling
    #[serde(default)]
    pub enabled: bool,
    /// Allowed origins (`*` = any)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Allowed methods (empty = any)
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    /// Allowed request headers (empty = any)
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    /// Headers exposed to the browser
    #[serde(default)]
    pub exposed_headers: Vec<String>,
    /// Allow credentials
    #[serde(default)]
    pub allow_credentials: bool,
    /// Preflight cache lifetime in seconds
    #[serde(default)]
    pub max_age: Option<u64>,
}

/// An upstream API protected by an OAuth server's tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiDefinition {
    /// API name (logging only)
    pub name: String,
    /// Path the gateway listens on
    pub listen_path: String,
    /// Upstream base URL
    pub upstream_url: String,
    /// Allowed methods (empty = any)
    #[serde(default)]
    pub methods: Vec<String>,
    /// Remove the listen path before forwarding
    #[serde(default = "default_strip_path")]
    pub strip_path: bool,
    /// Name of the OAuth server whose tokens are accepted
    pub oauth_server: String,
}

impl ApiDefinition {
    /// The API as a proxied endpoint
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            listen_path: self.listen_path.clone(),
            upstream_url: self.upstream_url.clone(),
            methods: self.methods.clone(),
            strip_path: self.strip_path,
        }
    }
}
