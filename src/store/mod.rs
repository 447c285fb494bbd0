//! Durable configuration storage.
//!
//! ## Architecture
//!
//! ```text
//! KvStore (string key → string value)
//! ├── SqliteStore      # sqlite:// URLs, `config(key, value)` table
//! └── MemoryStore      # tests
//!
//! StoreConfig          # typed view with per-field validation
//! SecretStore          # master key read/write paths via the agent
//! ```

mod config;
mod secret;
mod sqlite;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

use crate::error::{RelayError, Result};

pub use config::{ClientToken, StoreConfig, FIELDS};
pub use secret::SecretStore;
pub use sqlite::SqliteStore;

/// Generic string key/value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

pub type SharedKvStore = Arc<dyn KvStore>;

/// Open the store named by `url`. Only `sqlite://` URLs are supported.
pub async fn connect(url: &str) -> Result<SharedKvStore> {
    let path = sqlite_path(url)?;
    Ok(Arc::new(SqliteStore::open(path).await?))
}

fn sqlite_path(url: &str) -> Result<PathBuf> {
    let parsed = Url::parse(url).map_err(|e| RelayError::invalid_config("db_url", e.to_string()))?;
    if parsed.scheme() != "sqlite" {
        return Err(RelayError::UnsupportedBackend(parsed.scheme().to_string()));
    }

    // `sqlite://relative.db` puts the name in the host slot.
    let raw = match parsed.host_str() {
        Some(host) if !host.is_empty() => format!("{}{}", host, parsed.path()),
        _ => parsed.path().to_string(),
    };
    let decoded = urlencoding::decode(&raw)
        .map_err(|e| RelayError::invalid_config("db_url", e.to_string()))?;
    if decoded.is_empty() || decoded == "/" {
        return Err(RelayError::invalid_config("db_url", "missing database path"));
    }
    Ok(PathBuf::from(decoded.into_owned()))
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
