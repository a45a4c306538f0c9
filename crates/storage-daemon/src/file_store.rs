//! File-backed key-value stores.
//!
//! Each store is a single JSON file at `<root>/<name>/<storeName>.json`:
//!
//! ```json
//! { "version": 1, "entries": { "key": <value>, ... } }
//! ```
//!
//! The file is read once when the store is opened. Every mutation writes the
//! full contents to a sibling temp file and renames it into place, so a crash
//! never leaves a half-written store behind.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use storage_core::store::Result;
use storage_core::{KeyValueStore, StoreConfig, StoreError, StoreFactory};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;

type Entries = BTreeMap<String, Value>;

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile<E> {
    version: u32,
    entries: E,
}

fn io_error(err: io::Error) -> StoreError {
    StoreError::Io(err.to_string())
}

/// A key-value store persisted as one JSON file.
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<Entries>,
}

impl FileStore {
    /// Open the store at `path`, loading existing entries if the file exists.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let entries = match fs::read(&path).await {
            Ok(bytes) => decode(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Entries::new(),
            Err(e) => return Err(io_error(e)),
        };
        debug!("Opened {} ({} entries)", path.display(), entries.len());

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the entries, persist it, then publish it.
    ///
    /// `change` returns false when it left the entries untouched, in which
    /// case nothing is written. If the write fails the in-memory state is
    /// left as it was.
    async fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Entries) -> bool,
    {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();
        if !change(&mut next) {
            return Ok(());
        }

        self.persist(&next).await?;
        *entries = next;
        Ok(())
    }

    async fn persist(&self, entries: &Entries) -> Result<()> {
        let contents = serde_json::to_vec_pretty(&StoreFile {
            version: FORMAT_VERSION,
            entries,
        })
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents).await.map_err(io_error)?;
        fs::rename(&tmp, &self.path).await.map_err(io_error)
    }
}

fn decode(bytes: &[u8]) -> Result<Entries> {
    let file: StoreFile<Entries> =
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))?;
    if file.version != FORMAT_VERSION {
        return Err(StoreError::Serialization(format!(
            "unsupported store file version {}",
            file.version
        )));
    }
    Ok(file.entries)
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.update(|entries| {
            entries.insert(key.to_string(), value);
            true
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.update(|entries| entries.remove(key).is_some()).await
    }

    async fn clear(&self) -> Result<()> {
        self.update(|entries| {
            let changed = !entries.is_empty();
            entries.clear();
            changed
        })
        .await
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

/// Hands out one shared `FileStore` per `(name, storeName)` under a root dir.
///
/// Only weak handles are kept: a store no proxy uses is closed, and the next
/// open reloads it from its file.
pub struct FileStoreFactory {
    root: PathBuf,
    stores: Mutex<HashMap<(String, String), Weak<FileStore>>>,
}

impl FileStoreFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// File backing the store selected by `config`.
    pub fn path_for(&self, config: &StoreConfig) -> PathBuf {
        self.root
            .join(&config.name)
            .join(format!("{}.json", config.store_name))
    }

    /// Number of stores currently open.
    pub async fn open_count(&self) -> usize {
        self.stores
            .lock()
            .await
            .values()
            .filter(|store| store.strong_count() > 0)
            .count()
    }
}

#[async_trait]
impl StoreFactory for FileStoreFactory {
    async fn open(&self, config: &StoreConfig) -> Result<Arc<dyn KeyValueStore>> {
        config.validate()?;

        let key = (config.name.clone(), config.store_name.clone());
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(&key).and_then(Weak::upgrade) {
            let store: Arc<dyn KeyValueStore> = store;
            return Ok(store);
        }
        stores.retain(|_, store| store.strong_count() > 0);

        let store = Arc::new(FileStore::open(self.path_for(config)).await?);
        info!("Opened store {}/{} at {}", config.name, config.store_name, store.path().display());
        stores.insert(key, Arc::downgrade(&store));

        let store: Arc<dyn KeyValueStore> = store;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    // ==================== FileStore ====================

    #[tokio::test]
    async fn test_missing_file_opens_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("none.json")).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 0);
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ns").join("prefs.json");

        let store = FileStore::open(path.clone()).await.unwrap();
        store.set("b", json!([1, 2])).await.unwrap();
        store.set("a", json!({ "x": true })).await.unwrap();
        store.set("gone", json!(0)).await.unwrap();
        store.remove("gone").await.unwrap();
        drop(store);

        let reopened = FileStore::open(path).await.unwrap();
        assert_eq!(reopened.keys().await.unwrap(), vec!["a", "b"]);
        assert_eq!(reopened.get("b").await.unwrap(), Some(json!([1, 2])));
        assert_eq!(reopened.key_at(0).await.unwrap().as_deref(), Some("a"));
        assert_eq!(reopened.key_at(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");

        let store = FileStore::open(path.clone()).await.unwrap();
        store.set("k", json!("v")).await.unwrap();

        let written: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, json!({ "version": 1, "entries": { "k": "v" } }));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_clear_empties_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");

        let store = FileStore::open(path.clone()).await.unwrap();
        store.set("a", json!(1)).await.unwrap();
        store.clear().await.unwrap();
        drop(store);

        let reopened = FileStore::open(path).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_noop_mutations_do_not_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");

        let store = FileStore::open(path.clone()).await.unwrap();
        store.remove("absent").await.unwrap();
        store.clear().await.unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let result = FileStore::open(path).await;
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_unknown_version_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, br#"{"version":2,"entries":{}}"#).unwrap();

        let result = FileStore::open(path).await;
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        let parent = dir.path().join("ns");
        let store = FileStore::open(parent.join("store.json")).await.unwrap();

        // The parent directory is now a regular file, so every write fails
        std::fs::write(&parent, b"").unwrap();
        let result = store.set("a", json!(1)).await;

        assert!(matches!(result, Err(StoreError::Io(_))));
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    // ==================== FileStoreFactory ====================

    #[tokio::test]
    async fn test_factory_lays_out_files_by_config() {
        let dir = TempDir::new().unwrap();
        let factory = FileStoreFactory::new(dir.path());

        let store = factory.open(&StoreConfig::new("app", "prefs")).await.unwrap();
        store.set("k", json!(1)).await.unwrap();

        assert!(dir.path().join("app").join("prefs.json").exists());
        assert_eq!(
            factory.path_for(&StoreConfig::default()),
            dir.path().join("localforage").join("keyvaluepairs.json")
        );
    }

    #[tokio::test]
    async fn test_factory_shares_open_stores() {
        let dir = TempDir::new().unwrap();
        let factory = FileStoreFactory::new(dir.path());

        let first = factory.open(&StoreConfig::store("shared")).await.unwrap();
        let second = factory.open(&StoreConfig::store("shared")).await.unwrap();
        first.set("k", json!("v")).await.unwrap();

        assert_eq!(second.get("k").await.unwrap(), Some(json!("v")));
        assert_eq!(factory.open_count().await, 1);

        let _other = factory.open(&StoreConfig::store("other")).await.unwrap();
        assert_eq!(factory.open_count().await, 2);
    }

    #[tokio::test]
    async fn test_factory_releases_unused_stores() {
        let dir = TempDir::new().unwrap();
        let factory = FileStoreFactory::new(dir.path());
        let config = StoreConfig::store("released");

        let store = factory.open(&config).await.unwrap();
        store.set("k", json!(1)).await.unwrap();
        drop(store);
        assert_eq!(factory.open_count().await, 0);

        // Opening another store prunes the dead entry
        let _other = factory.open(&StoreConfig::store("other")).await.unwrap();
        assert_eq!(factory.stores.lock().await.len(), 1);

        let reopened = factory.open(&config).await.unwrap();
        assert_eq!(reopened.get("k").await.unwrap(), Some(json!(1)));
        assert_eq!(factory.open_count().await, 2);
    }

    #[tokio::test]
    async fn test_factory_rejects_path_escaping_names() {
        let dir = TempDir::new().unwrap();
        let factory = FileStoreFactory::new(dir.path());

        for config in [
            StoreConfig::new("..", "x"),
            StoreConfig::new("app", "../../etc"),
            StoreConfig::new("a/b", "x"),
            StoreConfig::new("", "x"),
        ] {
            let result = factory.open(&config).await;
            assert!(
                matches!(result, Err(StoreError::InvalidConfig(_))),
                "{config:?} should be rejected"
            );
        }
        assert_eq!(factory.open_count().await, 0);
    }

    #[tokio::test]
    async fn test_factory_reports_corrupt_store() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::write(dir.path().join("app").join("bad.json"), b"[]").unwrap();

        let factory = FileStoreFactory::new(dir.path());
        let result = factory.open(&StoreConfig::new("app", "bad")).await;

        assert!(matches!(result, Err(StoreError::Serialization(_))));
        assert_eq!(factory.open_count().await, 0);
    }
}
