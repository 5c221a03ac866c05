//! Configuration management

use std::{path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::oauth::{ApiDefinition, OAuthServer};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Token store configuration
    pub storage: StorageConfig,
    /// Definition repository configuration
    pub repository: RepositoryConfig,
    /// Token handling configuration
    pub oauth: OAuthConfig,
    /// Rate limiting for protected APIs
    pub rate_limit: RateLimitConfig,
    /// Inline OAuth server definitions
    pub servers: Vec<OAuthServer>,
    /// Protected API definitions
    pub apis: Vec<ApiDefinition>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // OAUTH_GATEWAY_STORAGE__DSN=redis://... overrides storage.dsn
        figment = figment.merge(Env::prefixed("OAUTH_GATEWAY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can run with
    pub fn validate(&self) -> Result<()> {
        if self.storage.pool_size == 0 {
            return Err(Error::Config("storage.pool_size must be at least 1".to_string()));
        }
        if self.oauth.write_failure_buffer == 0 {
            return Err(Error::Config(
                "oauth.write_failure_buffer must be at least 1".to_string(),
            ));
        }
        if self.servers.iter().any(|s| s.name.is_empty()) {
            return Err(Error::Config("every inline server needs a name".to_string()));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Token store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `memory://` or `redis://host:port/db`
    pub dsn: String,
    /// Redis connection pool size
    pub pool_size: usize,
    /// Connect / checkout timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: "memory://".to_string(),
            pool_size: 16,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Definition repository configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Directory of `*.json` / `*.yaml` server definitions
    pub directory: Option<PathBuf>,
    /// Reload when files in `directory` change
    pub watch: bool,
    /// Also reload on a fixed interval
    #[serde(with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
}

/// Token handling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Deadline for one introspection call
    #[serde(with = "humantime_serde")]
    pub introspection_timeout: Duration,
    /// Deadline for buffering a token response
    #[serde(with = "humantime_serde")]
    pub capture_timeout: Duration,
    /// Capacity of the failed-write report channel
    pub write_failure_buffer: usize,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            introspection_timeout: Duration::from_secs(5),
            capture_timeout: Duration::from_secs(10),
            write_failure_buffer: 256,
        }
    }
}

/// Where rate-limit counters live
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitBackend {
    /// In-process, per gateway instance
    #[default]
    Local,
    /// Shared store, across instances
    Store,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting on protected APIs
    pub enabled: bool,
    /// Counter backend
    pub backend: RateLimitBackend,
    /// Requests per minute per caller
    pub requests_per_minute: u32,
    /// Key prefix for counters in the shared store
    pub prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: RateLimitBackend::Local,
            requests_per_minute: 600,
            prefix: "rate-limit:".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage.dsn, "memory://");
        assert!(!config.rate_limit.enabled);
        assert!(config.repository.directory.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
server:
  port: 9000
storage:
  dsn: "redis://localhost:6379/0"
  timeout: 250ms
repository:
  directory: /etc/oauth-gateway/servers
  watch: true
  poll_interval: 1m
rate_limit:
  enabled: true
  backend: store
  requests_per_minute: 30
servers:
  - name: svc
    client_secrets:
      abc: s3cr3t
apis:
  - name: orders
    listen_path: /orders
    upstream_url: http://orders.internal
    oauth_server: svc
"#
        )
        .unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.timeout, Duration::from_millis(250));
        assert_eq!(config.repository.poll_interval, Some(Duration::from_secs(60)));
        assert_eq!(config.rate_limit.backend, RateLimitBackend::Store);
        assert_eq!(config.servers[0].client_secrets["abc"], "s3cr3t");
        assert_eq!(config.apis[0].oauth_server, "svc");
        assert!(config.apis[0].strip_path);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/gateway.yaml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let mut config = Config::default();
        config.storage.pool_size = 0;
        assert!(config.validate().is_err());
    }
}
