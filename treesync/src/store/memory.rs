//! In-process object store
//!
//! Behaves like a bucket with per-object user metadata. Listings return the
//! stored metadata, so enumeration needs no extra HEAD requests.

use std::collections::BTreeMap;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;

use super::{GetObject, ObjectClient, ObjectInfo, ObjectSummary, StoreError};
use crate::metadata::MetadataMap;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    metadata: MetadataMap,
    last_modified: SystemTime,
}

impl StoredObject {
    fn info(&self, key: &str) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            size: self.data.len() as u64,
            last_modified: self.last_modified,
            metadata: self.metadata.clone(),
        }
    }
}

/// Memory-backed [`ObjectClient`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object with an explicit last-modified time
    ///
    /// Stands in for objects written by other tools.
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>, metadata: MetadataMap, last_modified: SystemTime) {
        self.objects.write().insert(
            key.into(),
            StoredObject {
                data: data.into(),
                metadata,
                last_modified,
            },
        );
    }

    /// Content of an object
    pub fn data(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).map(|o| o.data.clone())
    }

    /// Properties of an object
    pub fn info(&self, key: &str) -> Option<ObjectInfo> {
        self.objects.read().get(key).map(|o| o.info(key))
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectClient for MemoryStore {
    fn list(&self, prefix: &str) -> BoxStream<'_, Result<ObjectSummary, StoreError>> {
        let wanted = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix.trim_end_matches('/'))
        };

        let summaries: Vec<_> = self
            .objects
            .read()
            .range(wanted.clone()..)
            .take_while(|(key, _)| key.starts_with(&wanted))
            .map(|(key, object)| {
                Ok(ObjectSummary {
                    key: key.clone(),
                    size: object.data.len() as u64,
                    last_modified: object.last_modified,
                    metadata: Some(object.metadata.clone()),
                })
            })
            .collect();

        stream::iter(summaries).boxed()
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError> {
        Ok(self.info(key))
    }

    async fn get(&self, key: &str) -> Result<GetObject, StoreError> {
        let object = self
            .objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let info = object.info(key);
        let body = stream::iter(vec![Ok(object.data)]).boxed();
        Ok(GetObject { info, body })
    }

    async fn put(&self, key: &str, body: Bytes, metadata: MetadataMap) -> Result<(), StoreError> {
        self.insert(key, body, metadata, SystemTime::now());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.objects.write().remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_list_is_scoped_to_prefix_segment() {
        let store = MemoryStore::new();
        store.put("dir/a", Bytes::from_static(b"a"), MetadataMap::new()).await.unwrap();
        store.put("dir/sub/b", Bytes::from_static(b"bb"), MetadataMap::new()).await.unwrap();
        store.put("dirty", Bytes::from_static(b"c"), MetadataMap::new()).await.unwrap();

        let listed: Vec<ObjectSummary> = store.list("dir").try_collect().await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["dir/a", "dir/sub/b"]);
        assert_eq!(listed[1].size, 2);

        let all: Vec<ObjectSummary> = store.list("").try_collect().await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_get_put_delete() {
        let store = MemoryStore::new();
        let mut metadata = MetadataMap::new();
        metadata.insert("mode".to_string(), "0600".to_string());
        store.put("k", Bytes::from_static(b"hello"), metadata.clone()).await.unwrap();

        let object = store.get("k").await.unwrap();
        assert_eq!(object.info.metadata, metadata);
        let chunks: Vec<Bytes> = object.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello");

        store.delete("k").await.unwrap();
        assert!(store.head("k").await.unwrap().is_none());
        assert!(store.delete("k").await.unwrap_err().is_not_found());
        assert!(store.get("k").await.is_err());
    }
}
