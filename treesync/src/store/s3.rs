//! S3-compatible object storage backed by `object_store`

use std::borrow::Cow;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{
    Attribute, AttributeValue, Attributes, GetOptions, GetResult, ObjectStore, PutOptions, PutPayload, RetryConfig,
    WriteMultipart,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ByteStream, GetObject, ObjectClient, ObjectInfo, ObjectSummary, StoreError};
use crate::metadata::MetadataMap;

/// Multipart parts uploaded concurrently per object
const PARTS_IN_FLIGHT: usize = 4;

/// Connection settings for an S3-compatible endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Endpoint URL, e.g. `http://localhost:9000`; `None` uses AWS
    pub endpoint: Option<String>,
    /// Region name
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Retries per request before giving up
    pub max_retries: usize,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
            max_retries: 3,
        }
    }
}

/// [`ObjectClient`] over any `object_store` backend, S3 in practice
#[derive(Debug, Clone)]
pub struct S3Store {
    inner: Arc<dyn ObjectStore>,
}

impl S3Store {
    /// Connect to `bucket` with the given settings
    pub fn new(config: &S3Config, bucket: &str) -> Result<Self, StoreError> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(&config.region)
            .with_retry(RetryConfig {
                max_retries: config.max_retries,
                ..Default::default()
            });

        if let Some(endpoint) = &config.endpoint {
            debug!(endpoint = %endpoint, "using custom S3 endpoint");
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"))
                .with_virtual_hosted_style_request(false);
        }
        if let Some(key_id) = &config.access_key_id {
            builder = builder.with_access_key_id(key_id);
        }
        if let Some(secret) = &config.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }

        let store = builder.build().map_err(StoreError::backend)?;
        Ok(Self::from_object_store(Arc::new(store)))
    }

    /// Wrap an existing `object_store` backend
    pub fn from_object_store(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }
}

fn store_error(error: object_store::Error) -> StoreError {
    match error {
        object_store::Error::NotFound { path, .. } => StoreError::NotFound(path),
        other => StoreError::backend(other),
    }
}

fn user_metadata(attributes: &Attributes) -> MetadataMap {
    attributes
        .iter()
        .filter_map(|(attribute, value)| match attribute {
            Attribute::Metadata(key) => Some((key.to_string(), value.as_ref().to_string())),
            _ => None,
        })
        .collect()
}

fn attributes(metadata: MetadataMap) -> Attributes {
    let mut attributes = Attributes::new();
    for (name, value) in metadata {
        attributes.insert(Attribute::Metadata(Cow::Owned(name)), AttributeValue::from(value));
    }
    attributes
}

fn object_info(result: &GetResult) -> ObjectInfo {
    ObjectInfo {
        key: result.meta.location.to_string(),
        size: result.meta.size,
        last_modified: SystemTime::from(result.meta.last_modified),
        metadata: user_metadata(&result.attributes),
    }
}

#[async_trait]
impl ObjectClient for S3Store {
    fn list(&self, prefix: &str) -> BoxStream<'_, Result<ObjectSummary, StoreError>> {
        let prefix = (!prefix.is_empty()).then(|| Path::from(prefix));
        self.inner
            .list(prefix.as_ref())
            .map(|meta| {
                let meta = meta.map_err(store_error)?;
                Ok(ObjectSummary {
                    key: meta.location.to_string(),
                    size: meta.size,
                    last_modified: SystemTime::from(meta.last_modified),
                    // Listings carry no user metadata, it takes a HEAD per object
                    metadata: None,
                })
            })
            .boxed()
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError> {
        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        match self.inner.get_opts(&Path::from(key), options).await {
            Ok(result) => Ok(Some(object_info(&result))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(store_error(e)),
        }
    }

    async fn get(&self, key: &str) -> Result<GetObject, StoreError> {
        let result = self
            .inner
            .get_opts(&Path::from(key), GetOptions::default())
            .await
            .map_err(store_error)?;

        let info = object_info(&result);
        let body = result.into_stream().map_err(store_error).boxed();
        Ok(GetObject { info, body })
    }

    async fn put(&self, key: &str, body: Bytes, metadata: MetadataMap) -> Result<(), StoreError> {
        let options = PutOptions {
            attributes: attributes(metadata),
            ..Default::default()
        };
        self.inner
            .put_opts(&Path::from(key), PutPayload::from(body), options)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn put_stream(&self, key: &str, mut body: ByteStream, metadata: MetadataMap) -> Result<(), StoreError> {
        let upload = self
            .inner
            .put_multipart_opts(&Path::from(key), attributes(metadata).into())
            .await
            .map_err(store_error)?;
        let mut writer = WriteMultipart::new(upload);

        let streamed = async {
            while let Some(chunk) = body.try_next().await? {
                writer.wait_for_capacity(PARTS_IN_FLIGHT).await.map_err(store_error)?;
                writer.put(chunk);
            }
            Ok::<_, StoreError>(())
        }
        .await;

        match streamed {
            Ok(()) => {
                writer.finish().await.map_err(store_error)?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    warn!(key, error = %abort, "failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(&Path::from(key)).await.map_err(store_error)
    }
}
