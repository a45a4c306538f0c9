//! Key-value store abstraction behind the proxy.
//!
//! Implementations:
//! - `InMemoryStore` - For testing and embedding
//! - `FileStore` (in storage-daemon) - JSON file per store, written atomically
//!
//! Stores are obtained through a `StoreFactory` using the `StoreConfig` the
//! client supplies during the handshake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Default namespace name when the client does not supply one.
pub const DEFAULT_NAME: &str = "localforage";

/// Default store name within a namespace.
pub const DEFAULT_STORE_NAME: &str = "keyvaluepairs";

/// Longest accepted namespace or store name, in bytes.
pub const MAX_NAME_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Quota exceeded: store is limited to {limit} entries")]
    QuotaExceeded { limit: usize },

    #[error("Invalid store config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Store selection sent by the client in reply to the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Namespace (database) name
    #[serde(default = "default_name")]
    pub name: String,
    /// Store within the namespace
    #[serde(default = "default_store_name", alias = "store")]
    pub store_name: String,
    /// Human-readable description, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_store_name() -> String {
    DEFAULT_STORE_NAME.to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            store_name: default_store_name(),
            description: None,
        }
    }
}

impl StoreConfig {
    pub fn new(name: impl Into<String>, store_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store_name: store_name.into(),
            description: None,
        }
    }

    /// Config for a named store in the default namespace.
    pub fn store(store_name: impl Into<String>) -> Self {
        Self {
            store_name: store_name.into(),
            ..Self::default()
        }
    }

    /// Decode a handshake reply. `null` selects the defaults.
    pub fn from_reply(payload: Value) -> serde_json::Result<Self> {
        if payload.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(payload)
    }

    /// Check that both names are usable as path components.
    pub fn validate(&self) -> Result<()> {
        validate_name("name", &self.name)?;
        validate_name("storeName", &self.store_name)
    }
}

fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(StoreError::InvalidConfig(format!("{} must not be empty", field)));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(StoreError::InvalidConfig(format!(
            "{} exceeds {} bytes",
            field, MAX_NAME_LEN
        )));
    }
    if value == "." || value.contains("..") {
        return Err(StoreError::InvalidConfig(format!(
            "{} must not contain '..': {}",
            field, value
        )));
    }
    if value.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return Err(StoreError::InvalidConfig(format!(
            "{} contains a path separator or control character",
            field
        )));
    }
    Ok(())
}

/// Asynchronous key-value store the proxy delegates to.
///
/// Keys are ordered; `key_at` and `keys` follow that order.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Value stored under `key`, or `None` if absent
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Insert or replace the value under `key`
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove `key` if present (absent keys are not an error)
    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every entry
    async fn clear(&self) -> Result<()>;

    /// Number of entries
    async fn count(&self) -> Result<usize>;

    /// Key at ordinal position `index`, or `None` if out of range
    async fn key_at(&self, index: usize) -> Result<Option<String>>;

    /// All keys in order
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Obtains or creates store instances by config.
///
/// Opening the same `(name, store_name)` pair twice must yield the same
/// underlying data.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn open(&self, config: &StoreConfig) -> Result<Arc<dyn KeyValueStore>>;
}

/// In-memory store for testing and embedding.
pub struct InMemoryStore {
    entries: RwLock<BTreeMap<String, Value>>,
    /// Maximum number of entries (None = unlimited)
    limit: Option<usize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            limit: None,
        }
    }

    /// Create a store that refuses to grow beyond `limit` entries.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            limit: Some(limit),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(limit) = self.limit {
            // Overwriting an existing key never grows the store
            if !entries.contains_key(key) && entries.len() >= limit {
                return Err(StoreError::QuotaExceeded { limit });
            }
        }
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }

    async fn key_at(&self, index: usize) -> Result<Option<String>> {
        Ok(self.entries.read().await.keys().nth(index).cloned())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

/// Factory handing out shared in-memory stores, one per `(name, store_name)`.
///
/// Stores live as long as the factory: the map holds their only copy of the data.
pub struct InMemoryStoreFactory {
    stores: Mutex<HashMap<(String, String), Arc<InMemoryStore>>>,
    limit: Option<usize>,
}

impl InMemoryStoreFactory {
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            limit: None,
        }
    }

    /// Factory whose stores are each limited to `limit` entries.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            limit: Some(limit),
        }
    }

    /// Store previously opened for `config`, if any.
    pub async fn get(&self, config: &StoreConfig) -> Option<Arc<InMemoryStore>> {
        let key = (config.name.clone(), config.store_name.clone());
        self.stores.lock().await.get(&key).cloned()
    }

    /// Number of distinct stores opened so far.
    pub async fn open_count(&self) -> usize {
        self.stores.lock().await.len()
    }
}

impl Default for InMemoryStoreFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreFactory for InMemoryStoreFactory {
    async fn open(&self, config: &StoreConfig) -> Result<Arc<dyn KeyValueStore>> {
        config.validate()?;

        let key = (config.name.clone(), config.store_name.clone());
        let mut stores = self.stores.lock().await;
        let store: Arc<dyn KeyValueStore> = stores
            .entry(key)
            .or_insert_with(|| {
                Arc::new(match self.limit {
                    Some(limit) => InMemoryStore::with_limit(limit),
                    None => InMemoryStore::new(),
                })
            })
            .clone();
        Ok(store)
    }
}
