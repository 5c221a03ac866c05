//! Directory-backed definition repository

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{InMemoryRepository, OAuthServer, Repository};
use crate::{Error, Result};

/// Definitions read from `*.json`, `*.yaml` and `*.yml` files under a
/// directory (recursively), one server per file.
///
/// The files are read into memory by [`refresh`](Self::refresh); lookups
/// never touch the disk. Definitions passed as `seed` are always present and
/// are overridden by a file defining the same name.
pub struct FileRepository {
    directory: PathBuf,
    seed: Vec<OAuthServer>,
    inner: InMemoryRepository,
    sources: RwLock<HashMap<String, PathBuf>>,
}

impl FileRepository {
    /// Open `directory` and load it once.
    ///
    /// # Errors
    ///
    /// Fails when the directory does not exist or cannot be listed.
    pub async fn open(directory: impl Into<PathBuf>, seed: Vec<OAuthServer>) -> Result<Self> {
        let repo = Self {
            directory: directory.into(),
            seed,
            inner: InMemoryRepository::new(),
            sources: RwLock::new(HashMap::new()),
        };
        repo.refresh().await?;
        Ok(repo)
    }

    /// Watched directory
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Re-read the directory, replacing the in-memory content.
    ///
    /// Unreadable or invalid files are logged and skipped. Returns the
    /// number of definitions now held.
    pub async fn refresh(&self) -> Result<usize> {
        let dir = &self.directory;
        if !dir.is_dir() {
            return Err(Error::Config(format!(
                "Definitions directory does not exist: {}",
                dir.display()
            )));
        }

        let mut loaded = Vec::new();
        load_recursive(dir, &mut loaded).await?;

        let mut servers: HashMap<String, OAuthServer> = self
            .seed
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();
        let mut sources = HashMap::new();
        for (path, server) in loaded {
            if let Some(previous) = sources.insert(server.name.clone(), path.clone()) {
                warn!(
                    server = %server.name,
                    first = %previous.display(),
                    second = %path.display(),
                    "Duplicate OAuth server name, later file wins"
                );
            }
            servers.insert(server.name.clone(), server);
        }

        let count = servers.len();
        self.inner.replace_all(servers.into_values());
        *self.sources.write() = sources;

        info!(count, path = %dir.display(), "Loaded OAuth server definitions");
        Ok(count)
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.sources
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.directory.join(format!("{name}.json")))
    }
}

/// Whether `path` looks like a definition file
pub(crate) fn is_definition_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "json" || ext == "yaml" || ext == "yml")
}

async fn load_recursive(root: &Path, out: &mut Vec<(PathBuf, OAuthServer)>) -> Result<()> {
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::Config(format!("Failed to read directory {}: {e}", dir.display())))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Config(format!("Failed to read directory entry: {e}")))?
        {
            let path = entry.path();

            if path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'))
            {
                continue;
            }

            if path.is_dir() {
                pending.push(path);
            } else if is_definition_file(&path) {
                match parse_file(&path).await {
                    Ok(server) => {
                        debug!(server = %server.name, path = %path.display(), "Loaded definition");
                        out.push((path, server));
                    }
                    Err(e) => {
                        warn!(error = %e, path = %path.display(), "Skipping invalid definition file");
                    }
                }
            }
        }
    }

    // read_dir order is platform-defined; keep duplicate resolution stable
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(())
}

async fn parse_file(path: &Path) -> Result<OAuthServer> {
    let raw = tokio::fs::read_to_string(path).await?;
    let server: OAuthServer = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&raw)?
    } else {
        serde_yaml::from_str(&raw)?
    };
    if server.name.is_empty() {
        return Err(Error::Config("definition has no name".to_string()));
    }
    Ok(server)
}

#[async_trait]
impl Repository for FileRepository {
    async fn find_all(&self) -> Result<Vec<OAuthServer>> {
        self.inner.find_all().await
    }

    async fn find_by_name(&self, name: &str) -> Result<OAuthServer> {
        self.inner.find_by_name(name).await
    }

    async fn find_by_token_url(&self, url: &str) -> Result<OAuthServer> {
        self.inner.find_by_token_url(url).await
    }

    /// Writes the definition to its file (`<name>.json` for new servers)
    async fn add(&self, server: OAuthServer) -> Result<()> {
        if server.name.is_empty() {
            return Err(Error::Config("OAuth server name must not be empty".to_string()));
        }
        let path = self.path_for(&server.name);
        let body = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::to_string_pretty(&server)?
        } else {
            serde_yaml::to_string(&server)?
        };
        tokio::fs::write(&path, body).await?;

        self.sources.write().insert(server.name.clone(), path);
        self.inner.add(server).await
    }

    /// Deletes the definition's file, if it came from one
    async fn remove(&self, name: &str) -> Result<()> {
        let source = self.sources.write().remove(name);
        if let Some(path) = source {
            tokio::fs::remove_file(&path).await?;
        }
        self.inner.remove(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const YAML_DEF: &str = r"
name: svc
endpoints:
  token:
    listen_path: /svc/token
    upstream_url: http://idp.local/token
";

    #[tokio::test]
    async fn test_loads_json_and_yaml() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("svc.yaml"), YAML_DEF).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(
            dir.path().join("nested/other.json"),
            r#"{"name": "other", "token_strategy": {"name": "jwt", "settings": {"secret": "k"}}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let repo = FileRepository::open(dir.path(), Vec::new()).await.unwrap();

        let names: Vec<_> = repo.find_all().await.unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["other".to_string(), "svc".to_string()]);
        assert_eq!(
            repo.find_by_token_url("http://idp.local/token").await.unwrap().name,
            "svc"
        );
    }

    #[tokio::test]
    async fn test_invalid_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("svc.yaml"), YAML_DEF).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("unnamed.yml"), "client_secrets: {}").unwrap();

        let repo = FileRepository::open(dir.path(), Vec::new()).await.unwrap();
        assert_eq!(repo.find_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = FileRepository::open(dir.path().join("absent"), Vec::new()).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_refresh_picks_up_changes() {
        let dir = TempDir::new().unwrap();
        let repo = FileRepository::open(dir.path(), Vec::new()).await.unwrap();
        assert!(repo.find_all().await.unwrap().is_empty());

        std::fs::write(dir.path().join("svc.yaml"), YAML_DEF).unwrap();
        assert_eq!(repo.refresh().await.unwrap(), 1);

        std::fs::remove_file(dir.path().join("svc.yaml")).unwrap();
        assert_eq!(repo.refresh().await.unwrap(), 0);
        assert!(repo.find_by_name("svc").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_seed_is_kept_and_overridden_by_files() {
        let dir = TempDir::new().unwrap();
        let mut seeded = OAuthServer::named("svc");
        seeded.client_secrets.insert("abc".to_string(), "seed".to_string());

        let repo = FileRepository::open(dir.path(), vec![seeded, OAuthServer::named("inline")])
            .await
            .unwrap();
        assert_eq!(repo.find_by_name("svc").await.unwrap().client_secrets["abc"], "seed");

        std::fs::write(dir.path().join("svc.yaml"), YAML_DEF).unwrap();
        repo.refresh().await.unwrap();
        assert!(repo.find_by_name("svc").await.unwrap().client_secrets.is_empty());
        assert!(repo.find_by_name("inline").await.is_ok());
    }

    #[tokio::test]
    async fn test_add_and_remove_write_through() {
        let dir = TempDir::new().unwrap();
        let repo = FileRepository::open(dir.path(), Vec::new()).await.unwrap();

        repo.add(OAuthServer::named("fresh")).await.unwrap();
        let file = dir.path().join("fresh.json");
        assert!(file.exists());

        // survives a re-read
        repo.refresh().await.unwrap();
        assert!(repo.find_by_name("fresh").await.is_ok());

        repo.remove("fresh").await.unwrap();
        assert!(!file.exists());
    }
}
