//! Strategy selection and manager construction

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{
    IntrospectionManager, JwtManager, Manager, StorageManager, WriteFailureSink,
};
use crate::oauth::OAuthServer;
use crate::store::Store;
use crate::{Error, Result};

/// Token validation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Sessions cached in the shared store
    Storage,
    /// Stateless signed claims
    Jwt,
    /// Remote introspection
    Auth,
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "storage" => Ok(Self::Storage),
            "jwt" => Ok(Self::Jwt),
            "auth" => Ok(Self::Auth),
            _ => Err(Error::UnknownStrategy(name.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage => f.write_str("storage"),
            Self::Jwt => f.write_str("jwt"),
            Self::Auth => f.write_str("auth"),
        }
    }
}

/// One accepted JWT signing method
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SigningMethod {
    /// Algorithm name, e.g. `HS256` or `RS256`
    pub alg: String,
    /// Shared secret (HMAC) or PEM public key
    pub key: String,
}

#[derive(Deserialize)]
struct LegacySecret {
    secret: String,
}

/// Parse JWT settings in either accepted shape:
///
/// - `{"secret": "..."}`, implying HS256
/// - `[{"alg": "...", "key": "..."}, ...]`
///
/// # Errors
///
/// [`Error::SecretMissing`] when neither shape matches or no key is present.
pub fn parse_jwt_settings(settings: &Value) -> Result<Vec<SigningMethod>> {
    if let Ok(methods) = serde_json::from_value::<Vec<SigningMethod>>(settings.clone()) {
        if !methods.is_empty() && methods.iter().all(|m| !m.key.is_empty()) {
            return Ok(methods);
        }
        return Err(Error::SecretMissing);
    }

    match serde_json::from_value::<LegacySecret>(settings.clone()) {
        Ok(legacy) if !legacy.secret.is_empty() => Ok(vec![SigningMethod {
            alg: "HS256".to_string(),
            key: legacy.secret,
        }]),
        _ => Err(Error::SecretMissing),
    }
}

#[derive(Deserialize)]
struct IntrospectionSettings {
    #[serde(default)]
    url: Option<String>,
}

/// Builds the [`Manager`] bound to an OAuth server definition
#[derive(Clone)]
pub struct ManagerFactory {
    store: Arc<dyn Store>,
    http: reqwest::Client,
    introspection_timeout: Duration,
    failures: Option<WriteFailureSink>,
}

impl ManagerFactory {
    /// Factory sharing `store` and `http` across every manager it builds
    #[must_use]
    pub fn new(store: Arc<dyn Store>, http: reqwest::Client, introspection_timeout: Duration) -> Self {
        Self {
            store,
            http,
            introspection_timeout,
            failures: None,
        }
    }

    /// Report failed background writes of storage managers on `sink`
    #[must_use]
    pub fn with_failure_sink(mut self, sink: WriteFailureSink) -> Self {
        self.failures = Some(sink);
        self
    }

    /// Shared store handed to storage managers
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Build the manager for `server`'s configured strategy.
    ///
    /// # Errors
    ///
    /// Unknown strategy names and strategy construction failures.
    pub fn build_for(&self, server: &OAuthServer) -> Result<Arc<dyn Manager>> {
        let kind = server.token_strategy.name.parse::<Strategy>()?;
        self.build(kind, server)
    }

    /// Build a manager of `kind` from `server`'s strategy settings.
    ///
    /// # Errors
    ///
    /// [`Error::SecretMissing`] and [`Error::IntrospectionUrlMissing`] from
    /// the respective constructors.
    pub fn build(&self, kind: Strategy, server: &OAuthServer) -> Result<Arc<dyn Manager>> {
        debug!(server = %server.name, strategy = %kind, "Building token manager");
        let settings = &server.token_strategy.settings;

        match kind {
            Strategy::Storage => {
                let mut manager = StorageManager::new(Arc::clone(&self.store));
                if let Some(sink) = &self.failures {
                    manager = manager.with_failure_sink(sink.clone());
                }
                Ok(Arc::new(manager))
            }
            Strategy::Jwt => {
                let methods = parse_jwt_settings(settings)?;
                Ok(Arc::new(JwtManager::new(&server.name, &methods)?))
            }
            Strategy::Auth => {
                let url = serde_json::from_value::<IntrospectionSettings>(settings.clone())
                    .ok()
                    .and_then(|s| s.url)
                    .filter(|u| !u.is_empty())
                    .or_else(|| server.endpoints.info.as_ref().map(|e| e.upstream_url.clone()))
                    .unwrap_or_default();
                Ok(Arc::new(IntrospectionManager::new(
                    &server.name,
                    url,
                    self.http.clone(),
                    self.introspection_timeout,
                )?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::Endpoint;
    use crate::store::InMemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn factory() -> ManagerFactory {
        ManagerFactory::new(
            Arc::new(InMemoryStore::new()),
            reqwest::Client::new(),
            Duration::from_secs(1),
        )
    }

    fn server(strategy: &str, settings: Value) -> OAuthServer {
        let mut server = OAuthServer::named("svc");
        server.token_strategy.name = strategy.to_string();
        server.token_strategy.settings = settings;
        server
    }

    #[test]
    fn test_parse_strategy_is_case_insensitive() {
        assert_eq!("storage".parse::<Strategy>().unwrap(), Strategy::Storage);
        assert_eq!("JWT".parse::<Strategy>().unwrap(), Strategy::Jwt);
        assert_eq!("Auth".parse::<Strategy>().unwrap(), Strategy::Auth);
    }

    #[test]
    fn test_parse_unknown_strategy() {
        let err = "ldap".parse::<Strategy>().unwrap_err();
        assert!(matches!(err, Error::UnknownStrategy(ref name) if name == "ldap"));
        assert_eq!(err.to_string(), "unknown strategy: ldap");
    }

    #[test]
    fn test_jwt_settings_legacy_form() {
        let methods = parse_jwt_settings(&json!({ "secret": "k" })).unwrap();
        assert_eq!(
            methods,
            vec![SigningMethod {
                alg: "HS256".to_string(),
                key: "k".to_string()
            }]
        );
    }

    #[test]
    fn test_jwt_settings_list_form() {
        let methods = parse_jwt_settings(&json!([
            { "alg": "HS512", "key": "a" },
            { "alg": "HS256", "key": "b" }
        ]))
        .unwrap();
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0].alg, "HS512");
    }

    #[test]
    fn test_jwt_settings_unrecognised_shape() {
        for settings in [json!({}), json!(null), json!({ "secret": "" }), json!([]), json!("k")] {
            assert!(
                matches!(parse_jwt_settings(&settings), Err(Error::SecretMissing)),
                "accepted {settings}"
            );
        }
    }

    #[test]
    fn test_build_each_strategy() {
        let factory = factory();

        let storage = factory.build_for(&server("storage", Value::Null)).unwrap();
        assert_eq!(storage.strategy(), Strategy::Storage);

        let jwt = factory.build_for(&server("jwt", json!({ "secret": "k" }))).unwrap();
        assert_eq!(jwt.strategy(), Strategy::Jwt);

        let auth = factory
            .build_for(&server("auth", json!({ "url": "http://idp/introspect" })))
            .unwrap();
        assert_eq!(auth.strategy(), Strategy::Auth);
    }

    #[test]
    fn test_build_propagates_construction_errors() {
        let factory = factory();
        assert!(matches!(
            factory.build_for(&server("jwt", json!({}))),
            Err(Error::SecretMissing)
        ));
        assert!(matches!(
            factory.build_for(&server("auth", json!({}))),
            Err(Error::IntrospectionUrlMissing)
        ));
        assert!(matches!(
            factory.build_for(&server("bogus", Value::Null)),
            Err(Error::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_introspection_url_falls_back_to_info_endpoint() {
        let mut def = server("auth", Value::Null);
        def.endpoints.info = Some(Endpoint::new("/svc/info", "http://idp/info"));
        assert!(factory().build_for(&def).is_ok());
    }
}
