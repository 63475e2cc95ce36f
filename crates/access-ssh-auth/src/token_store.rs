//! Token cache storage
//!
//! A key-value cache of bearer tokens keyed by `oauth|team|app|host`. The
//! in-memory store suits tests and ephemeral hosts; the file store persists
//! tokens as a JSON map under the user's home directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use access_ssh_proto::Failure;
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Persistent (or not) cache of bearer tokens
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn read_token(&self, key: &str) -> Result<Option<String>, Failure>;
    async fn write_token(&self, token: &str, key: &str) -> Result<(), Failure>;
    async fn remove_token(&self, key: &str) -> Result<(), Failure>;
}

/// Token store backed by a map in memory
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: RwLock<HashMap<String, String>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, mostly useful in tests
    pub fn with_tokens<I, K, V>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let tokens = tokens
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        Self {
            tokens: RwLock::new(tokens),
        }
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn read_token(&self, key: &str) -> Result<Option<String>, Failure> {
        Ok(self.tokens.read().await.get(key).cloned())
    }

    async fn write_token(&self, token: &str, key: &str) -> Result<(), Failure> {
        self.tokens
            .write()
            .await
            .insert(key.to_string(), token.to_string());
        Ok(())
    }

    async fn remove_token(&self, key: &str) -> Result<(), Failure> {
        self.tokens.write().await.remove(key);
        Ok(())
    }
}

/// Token store persisted as a JSON object in a single file
///
/// Every operation re-reads the file so several processes sharing the cache
/// see each other's writes. Writes go through a temporary file and a rename.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Default location: `~/.access-ssh/tokens.json`
    pub fn default_path() -> Result<PathBuf, Failure> {
        let home = dirs::home_dir()
            .ok_or_else(|| Failure::configuration("failed to get home directory"))?;
        Ok(home.join(".access-ssh").join("tokens.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HashMap<String, String>, Failure> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(json) if json.trim().is_empty() => Ok(HashMap::new()),
            Ok(json) => serde_json::from_str(&json).map_err(|e| {
                Failure::internal(format!(
                    "failed to parse token cache {}: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(Failure::internal(format!(
                "failed to read token cache {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn persist(&self, tokens: &HashMap<String, String>) -> Result<(), Failure> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Failure::internal(format!(
                    "failed to create token cache directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let json = serde_json::to_string_pretty(tokens).map_err(Failure::internal)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(|e| {
            Failure::internal(format!(
                "failed to write token cache {}: {}",
                tmp.display(),
                e
            ))
        })?;
        restrict_permissions(&tmp).await?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            Failure::internal(format!(
                "failed to replace token cache {}: {}",
                self.path.display(),
                e
            ))
        })?;

        debug!("Persisted {} cached token(s) to {}", tokens.len(), self.path.display());
        Ok(())
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), Failure> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(|e| Failure::internal(format!("failed to restrict token cache: {}", e)))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), Failure> {
    Ok(())
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn read_token(&self, key: &str) -> Result<Option<String>, Failure> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn write_token(&self, token: &str, key: &str) -> Result<(), Failure> {
        let _guard = self.lock.lock().await;
        let mut tokens = self.load().await?;
        tokens.insert(key.to_string(), token.to_string());
        self.persist(&tokens).await
    }

    async fn remove_token(&self, key: &str) -> Result<(), Failure> {
        let _guard = self.lock.lock().await;
        let mut tokens = self.load().await?;
        if tokens.remove(key).is_some() {
            self.persist(&tokens).await?;
        }
        Ok(())
    }
}
