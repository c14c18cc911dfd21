//! Storage traits describing the key-value and blob adapters.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tracing::warn;

/// Chunked blob content, pulled lazily by the consumer.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BlobError>> + Send>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("key `{key}` holds a value of the wrong type")]
    WrongType { key: String },
    #[error("stored value under `{key}` is corrupt: {message}")]
    Corrupt { key: String, message: String },
}

impl StoreError {
    pub fn from_backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn wrong_type(key: impl Into<String>) -> Self {
        Self::WrongType { key: key.into() }
    }

    pub fn corrupt(key: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            key: key.into(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid blob name `{0}`")]
    InvalidName(String),
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// String and hash operations over an externally synchronized store.
///
/// Keys and fields are UTF-8; values are opaque bytes (JSON where
/// structured). Every operation is atomic per key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> Result<(), StoreError>;

    /// Set `field` only when absent. Returns whether the value was written.
    async fn hsetnx(&self, key: &str, field: &str, value: Bytes) -> Result<bool, StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Bytes>, StoreError>;

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Bytes)>, StoreError>;

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Fetch several fields at once; the result lines up with `fields`.
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Bytes>>, StoreError>;

    /// Remove `field`. Returns whether it existed.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError>;
}

/// Tarball content addressed by filename.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn write(&self, name: &str, data: Bytes) -> Result<(), BlobError>;

    async fn read_stream(&self, name: &str) -> Result<ByteStream, BlobError>;

    async fn exists(&self, name: &str) -> Result<bool, BlobError>;

    /// Remove the blob. Missing blobs are treated as success.
    async fn remove(&self, name: &str) -> Result<(), BlobError>;
}

/// Read a string key during request handling. Store failures are logged
/// and reported as a miss.
pub(crate) async fn get_best_effort(
    store: &dyn KeyValueStore,
    key: &str,
    source: &'static str,
) -> Option<Bytes> {
    match store.get(key).await {
        Ok(value) => value,
        Err(err) => {
            warn!(
                target = "regcache::store",
                source,
                key,
                error = %err,
                "store read failed; treating as missing"
            );
            None
        }
    }
}

/// Like [`get_best_effort`] for values that must be UTF-8 (etags, filenames).
pub(crate) async fn get_string_best_effort(
    store: &dyn KeyValueStore,
    key: &str,
    source: &'static str,
) -> Option<String> {
    let bytes = get_best_effort(store, key, source).await?;
    match String::from_utf8(bytes.to_vec()) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                target = "regcache::store",
                source,
                key,
                error = %err,
                "stored value is not UTF-8; treating as missing"
            );
            None
        }
    }
}
