//! In-memory [`VersionStore`] implementation for tests and dry runs.
//!
//! Documents live in a `Vec` behind `std::sync::RwLock`, so `find` returns
//! them in insertion order like the SQLite backend.

use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{DocFilter, Document, VersionStore};

pub struct InMemoryStore {
    docs: RwLock<Vec<Document>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VersionStore for InMemoryStore {
    async fn find_one(&self, filter: &DocFilter) -> Result<Option<Document>> {
        let docs = self.docs.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(docs.iter().find(|d| filter.matches(d)).cloned())
    }

    async fn find(&self, filter: &DocFilter) -> Result<Vec<Document>> {
        let docs = self.docs.read().map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(docs.iter().filter(|d| filter.matches(d)).cloned().collect())
    }

    async fn insert_one(&self, doc: Document) -> Result<String> {
        let mut docs = self.docs.write().map_err(|_| anyhow!("store lock poisoned"))?;
        if docs.iter().any(|d| d.id == doc.id) {
            bail!("Document id already exists: {}", doc.id);
        }
        let id = doc.id.clone();
        docs.push(doc);
        Ok(id)
    }

    async fn update_many(&self, filter: &DocFilter, set: &Map<String, Value>) -> Result<u64> {
        let mut docs = self.docs.write().map_err(|_| anyhow!("store lock poisoned"))?;
        let mut updated = 0u64;
        for doc in docs.iter_mut().filter(|d| filter.matches(d)) {
            for (key, value) in set {
                doc.data.insert(key.clone(), value.clone());
            }
            updated += 1;
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{latest_version, DocType};
    use serde_json::json;

    fn version(parent: &str, n: u32) -> Document {
        let mut data = Map::new();
        data.insert("version".to_string(), json!(n));
        data.insert("pending".to_string(), json!(true));
        Document::new(DocType::Version, Some(parent), format!("v{:03}", n), data)
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = InMemoryStore::new();
        store.insert_one(version("s1", 1)).await.unwrap();
        store.insert_one(version("s1", 2)).await.unwrap();
        store.insert_one(version("s2", 1)).await.unwrap();

        let s1 = store
            .find(&DocFilter::of(DocType::Version).id_parent("s1"))
            .await
            .unwrap();
        assert_eq!(s1.len(), 2);
        assert_eq!(s1[0].name, "v001");
        assert_eq!(latest_version(&store, "s1").await.unwrap(), Some(2));
        assert_eq!(latest_version(&store, "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = InMemoryStore::new();
        let doc = version("s1", 1);
        store.insert_one(doc.clone()).await.unwrap();
        assert!(store.insert_one(doc).await.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_update_many() {
        let store = InMemoryStore::new();
        store.insert_one(version("s1", 1)).await.unwrap();
        store.insert_one(version("s1", 2)).await.unwrap();

        let mut set = Map::new();
        set.insert("pending".to_string(), json!(false));
        let n = store
            .update_many(&DocFilter::of(DocType::Version).id_parent("s1"), &set)
            .await
            .unwrap();
        assert_eq!(n, 2);

        let still_pending = store
            .find(&DocFilter::default().data_eq("pending", json!(true)))
            .await
            .unwrap();
        assert!(still_pending.is_empty());
    }
}
