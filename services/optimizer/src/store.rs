//! Object store capability used by every stage.

use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;

/// A single object write
#[derive(Debug, Clone, PartialEq)]
pub struct PutObject {
    pub bucket: String,
    pub key: String,
    pub body: Bytes,
    pub content_type: String,
    pub cache_control: String,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object's full contents
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError>;

    /// Write an object, replacing any previous object at the same key
    async fn put(&self, object: PutObject) -> Result<(), StoreError>;

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError>;

    /// Time-limited GET URL, if the backend supports presigning
    async fn presign_get(
        &self,
        _bucket: &str,
        _key: &str,
        _expires_in: Duration,
    ) -> Result<Option<String>, StoreError> {
        Ok(None)
    }
}
