//! Object storage seam
//!
//! The engine only talks to object storage through [`ObjectClient`]. Keys
//! are plain `/`-separated strings; listing a prefix `p` returns the objects
//! below `p/`, listing the empty prefix returns the whole bucket.

use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, TryStreamExt};

use crate::metadata::MetadataMap;

pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

pub use memory::MemoryStore;
#[cfg(feature = "s3")]
pub use s3::{S3Config, S3Store};

/// Name of the zero-byte object standing in for a directory
pub const DIRECTORY_MARKER: &str = ".treesync-dir";

/// Errors reported by an object store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Object does not exist
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Backend failure (network, auth, throttling, ...)
    #[error("{0}")]
    Backend(String),

    /// IO errors while streaming a body
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn backend(error: impl std::fmt::Display) -> Self {
        Self::Backend(error.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// One object as returned by a listing
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: SystemTime,
    /// User metadata, when the backend returns it with listings
    pub metadata: Option<MetadataMap>,
}

/// Object properties returned by HEAD and GET
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: SystemTime,
    pub metadata: MetadataMap,
}

/// A streamed object body
pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, StoreError>>;

/// A fetched object: properties plus a streamed body
pub struct GetObject {
    pub info: ObjectInfo,
    pub body: ByteStream,
}

impl std::fmt::Debug for GetObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetObject").field("info", &self.info).finish_non_exhaustive()
    }
}

/// Object storage client used by the enumerator and the transfer engine
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// List every object below `prefix`, in any order
    fn list(&self, prefix: &str) -> BoxStream<'_, std::result::Result<ObjectSummary, StoreError>>;

    /// Fetch properties and user metadata; `None` if the object does not exist
    async fn head(&self, key: &str) -> std::result::Result<Option<ObjectInfo>, StoreError>;

    /// Fetch an object
    async fn get(&self, key: &str) -> std::result::Result<GetObject, StoreError>;

    /// Create or replace an object with the given user metadata
    async fn put(&self, key: &str, body: Bytes, metadata: MetadataMap) -> std::result::Result<(), StoreError>;

    /// Create or replace an object from a streamed body
    ///
    /// Nothing is stored if the body yields an error. The default collects
    /// the body and calls [`ObjectClient::put`].
    async fn put_stream(
        &self,
        key: &str,
        body: ByteStream,
        metadata: MetadataMap,
    ) -> std::result::Result<(), StoreError> {
        let chunks: Vec<Bytes> = body.try_collect().await?;
        self.put(key, Bytes::from(chunks.concat()), metadata).await
    }

    /// Delete an object
    async fn delete(&self, key: &str) -> std::result::Result<(), StoreError>;
}
