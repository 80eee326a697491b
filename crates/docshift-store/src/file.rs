//! JSON-on-disk document store
//!
//! Layout under the root directory:
//! - `store.toml` - declared indexes, service versions and limits
//! - `<collection>.json` - every document of one collection
//!
//! Reads are served from memory. After each successful commit the touched
//! collections are rewritten atomically (temp file + rename), so a crash
//! never leaves a half-written collection behind.

use crate::document::{DocKey, Document, KeyRange};
use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::store::{DocumentStore, ServiceInfo, StoreLimits};
use crate::transaction::{CommitReceipt, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "store.toml";

/// Store-level metadata kept next to the collection files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStoreManifest {
    /// Index names per collection
    pub indexes: BTreeMap<String, Vec<String>>,
    /// Versions of dependent services
    pub services: BTreeMap<String, String>,
    /// Request ceilings (defaults when absent)
    pub limits: Option<StoreLimits>,
}

/// Document store persisted as JSON files
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    inner: MemoryStore,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    /// Open (or create) a store rooted at `root`
    ///
    /// # Errors
    /// - `StoreError::Io` if the directory or a file cannot be read
    /// - `StoreError::Serialization` if a file is malformed
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        let manifest_path = root.join(MANIFEST_FILE);
        let manifest = if tokio::fs::try_exists(&manifest_path).await? {
            let raw = tokio::fs::read_to_string(&manifest_path).await?;
            toml::from_str::<FileStoreManifest>(&raw)
                .map_err(|e| StoreError::Serialization(format!("{}: {e}", manifest_path.display())))?
        } else {
            FileStoreManifest::default()
        };

        let inner = MemoryStore::with_limits(manifest.limits.unwrap_or_default());
        for (collection, names) in &manifest.indexes {
            for name in names {
                inner.add_index(collection, name);
            }
        }
        for (name, version) in &manifest.services {
            inner.set_service(name, version);
        }

        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(collection) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = tokio::fs::read(&path).await?;
            let docs: Vec<Document> = serde_json::from_slice(&raw)
                .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display())))?;
            tracing::debug!(collection, documents = docs.len(), "loaded collection");
            inner.restore(collection, docs);
        }

        Ok(Self {
            root,
            inner,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Underlying in-memory state
    #[inline]
    #[must_use]
    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    /// Write the current manifest (indexes, services, limits) to disk
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the file cannot be written
    pub async fn save_manifest(&self) -> Result<(), StoreError> {
        let manifest = FileStoreManifest {
            indexes: self.inner.indexes(),
            services: self.inner.services(),
            limits: Some(self.inner.limits()),
        };
        let raw = toml::to_string_pretty(&manifest)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&self.root.join(MANIFEST_FILE), raw.as_bytes()).await
    }

    /// Insert documents directly and persist them
    ///
    /// # Errors
    /// Returns `StoreError` if the collection name is invalid or the file
    /// cannot be written
    pub async fn seed(
        &self,
        collection: &str,
        documents: impl IntoIterator<Item = Document>,
    ) -> Result<(), StoreError> {
        validate_collection_name(collection)?;
        let _guard = self.write_lock.lock().await;
        self.inner.seed(collection, documents);
        self.persist(collection).await
    }

    async fn persist(&self, collection: &str) -> Result<(), StoreError> {
        let docs = self.inner.snapshot(collection);
        let raw = serde_json::to_vec_pretty(&docs)?;
        write_atomic(&self.root.join(format!("{collection}.json")), &raw).await
    }
}

fn validate_collection_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidRequest(format!(
            "collection name '{name}' must be non-empty ASCII alphanumerics, '_' or '-'"
        )))
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait::async_trait]
impl DocumentStore for FileStore {
    fn limits(&self) -> StoreLimits {
        self.inner.limits()
    }

    async fn ping(&self) -> Result<ServiceInfo, StoreError> {
        let mut info = self.inner.ping().await?;
        info.name = "docshift-file".to_string();
        Ok(info)
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list_indexes(collection).await
    }

    async fn get(&self, collection: &str, key: &DocKey) -> Result<Option<Document>, StoreError> {
        self.inner.get(collection, key).await
    }

    async fn scan(
        &self,
        collection: &str,
        range: &KeyRange,
        after: Option<&DocKey>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        self.inner.scan(collection, range, after, limit).await
    }

    async fn keys(&self, collection: &str) -> Result<Vec<DocKey>, StoreError> {
        self.inner.keys(collection).await
    }

    async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        self.inner.count(collection).await
    }

    async fn commit(&self, txn: Transaction) -> Result<CommitReceipt, StoreError> {
        let touched = txn.collections();
        for collection in &touched {
            validate_collection_name(collection)?;
        }
        let _guard = self.write_lock.lock().await;
        let receipt = self.inner.commit(txn).await?;
        for collection in &touched {
            self.persist(collection).await?;
        }
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ShapeVersion;
    use serde_json::json;

    #[tokio::test]
    async fn documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            let txn = Transaction::new()
                .put("trades", Document::new("t1", ShapeVersion(1), json!({"owner": "a"})));
            store.commit(txn).await.unwrap();
        }

        let reopened = FileStore::open(dir.path()).await.unwrap();
        let doc = reopened.get("trades", &"t1".into()).await.unwrap().unwrap();
        assert_eq!(doc.body, json!({"owner": "a"}));
        assert!(doc.revision > 0);

        // revisions keep increasing after reopen
        let txn = Transaction::new()
            .put("trades", Document::new("t2", ShapeVersion(1), json!({})));
        let receipt = reopened.commit(txn).await.unwrap();
        assert!(receipt.revision > doc.revision);
    }

    #[tokio::test]
    async fn manifest_round_trips_indexes_and_services() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.memory().add_index("trades", "by_owner");
            store.memory().set_service("search", "2.3.0");
            store.save_manifest().await.unwrap();
        }

        let reopened = FileStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.list_indexes("trades").await.unwrap(),
            vec!["by_owner".to_string()]
        );
        let info = reopened.ping().await.unwrap();
        assert_eq!(info.services.get("search").map(String::as_str), Some("2.3.0"));
    }

    #[tokio::test]
    async fn rejects_path_like_collection_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let txn = Transaction::new()
            .put("../escape", Document::new("x", ShapeVersion(1), json!({})));
        assert!(matches!(
            store.commit(txn).await,
            Err(StoreError::InvalidRequest(_))
        ));
    }
}
