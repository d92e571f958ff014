//! Storage seams: a key-value record store and an object store.

use async_trait::async_trait;
use thiserror::Error;

/// Table names used in the record store.
pub mod tables {
    pub const FACES: &str = "faces";
    pub const MATCHES: &str = "matches";
    pub const LINKED_IDENTITIES: &str = "linked_identities";
    pub const CAPTURE_VIDEOS: &str = "capture_videos";
    pub const DEVICE_FINGERPRINTS: &str = "device_fingerprints";
    pub const PHOTOS: &str = "photos";
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record store: {0}")]
    Backend(String),
    #[error("object store: {0}")]
    Object(String),
    #[error("invalid identity id {0:?}")]
    InvalidIdentity(String),
    #[error("invalid photo id {0:?}")]
    InvalidPhoto(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable key-value record store. Items are JSON documents addressed by
/// `(table, key)`; `put` on an existing key replaces the item.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, table: &str, key: &str, item: serde_json::Value) -> Result<(), StoreError>;

    async fn get(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Every item in `table` whose key starts with `key_prefix`, in key order.
    async fn list(&self, table: &str, key_prefix: &str) -> Result<Vec<serde_json::Value>, StoreError>;
}

/// Blob storage returning a URL for each stored object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, StoreError>;
}
