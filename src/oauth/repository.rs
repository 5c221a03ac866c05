//! OAuth server definition storage

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::OAuthServer;
use crate::{Error, Result};

/// Where OAuth server definitions come from
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    /// Every definition, ordered by name
    async fn find_all(&self) -> Result<Vec<OAuthServer>>;

    /// Definition called `name`; [`Error::NotFound`] when absent
    async fn find_by_name(&self, name: &str) -> Result<OAuthServer>;

    /// Definition whose token endpoint upstream URL equals `url` exactly
    async fn find_by_token_url(&self, url: &str) -> Result<OAuthServer>;

    /// Insert or replace a definition
    async fn add(&self, server: OAuthServer) -> Result<()>;

    /// Delete the definition called `name`
    async fn remove(&self, name: &str) -> Result<()>;
}

/// Definitions held in process memory, keyed by name
#[derive(Default)]
pub struct InMemoryRepository {
    servers: RwLock<HashMap<String, OAuthServer>>,
}

impl InMemoryRepository {
    /// Empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository holding `servers`; later duplicates replace earlier ones
    #[must_use]
    pub fn with_servers(servers: impl IntoIterator<Item = OAuthServer>) -> Self {
        let repo = Self::new();
        repo.replace_all(servers);
        repo
    }

    /// Swap the whole content in one step
    pub fn replace_all(&self, servers: impl IntoIterator<Item = OAuthServer>) {
        let map = servers.into_iter().map(|s| (s.name.clone(), s)).collect();
        *self.servers.write() = map;
    }

    /// Number of definitions
    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    /// No definitions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn find_all(&self) -> Result<Vec<OAuthServer>> {
        let mut servers: Vec<_> = self.servers.read().values().cloned().collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }

    async fn find_by_name(&self, name: &str) -> Result<OAuthServer> {
        self.servers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("OAuth server '{name}'")))
    }

    async fn find_by_token_url(&self, url: &str) -> Result<OAuthServer> {
        self.servers
            .read()
            .values()
            .find(|s| {
                s.endpoints
                    .token
                    .as_ref()
                    .is_some_and(|t| t.upstream_url == url)
            })
            .cloned()
            .ok_or_else(|| Error::not_found(format!("OAuth server with token URL '{url}'")))
    }

    async fn add(&self, server: OAuthServer) -> Result<()> {
        if server.name.is_empty() {
            return Err(Error::Config("OAuth server name must not be empty".to_string()));
        }
        self.servers.write().insert(server.name.clone(), server);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match self.servers.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::not_found(format!("OAuth server '{name}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::Endpoint;
    use pretty_assertions::assert_eq;

    fn server(name: &str, token_url: &str) -> OAuthServer {
        let mut server = OAuthServer::named(name);
        server.endpoints.token = Some(Endpoint::new(format!("/{name}/token"), token_url));
        server
    }

    #[tokio::test]
    async fn test_find_by_name() {
        let repo = InMemoryRepository::with_servers([server("svc", "http://idp/token")]);

        assert_eq!(repo.find_by_name("svc").await.unwrap().name, "svc");
        assert!(repo.find_by_name("other").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_find_by_token_url_is_exact() {
        let repo = InMemoryRepository::with_servers([
            server("a", "http://idp-a/token"),
            server("b", "http://idp-b/token"),
        ]);

        assert_eq!(
            repo.find_by_token_url("http://idp-b/token").await.unwrap().name,
            "b"
        );
        assert!(repo.find_by_token_url("http://idp-b/token/").await.is_err());
        assert!(repo.find_by_token_url("http://idp-b").await.is_err());
    }

    #[tokio::test]
    async fn test_add_replaces_and_remove_deletes() {
        let repo = InMemoryRepository::new();
        repo.add(server("svc", "http://old/token")).await.unwrap();
        repo.add(server("svc", "http://new/token")).await.unwrap();
        assert_eq!(repo.len(), 1);
        assert!(repo.find_by_token_url("http://new/token").await.is_ok());

        repo.remove("svc").await.unwrap();
        assert!(repo.is_empty());
        assert!(repo.remove("svc").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_add_rejects_unnamed() {
        let repo = InMemoryRepository::new();
        assert!(repo.add(OAuthServer::named("")).await.is_err());
    }

    #[tokio::test]
    async fn test_find_all_is_sorted() {
        let repo = InMemoryRepository::with_servers([
            server("zeta", "http://z/token"),
            server("alpha", "http://a/token"),
        ]);
        let names: Vec<_> = repo
            .find_all()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
