use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of a container listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// Object-storage client used by every stage of a pass.
///
/// Listings are returned sorted by name. Listing a container that does not
/// exist yields an empty listing; every other operation on a missing object
/// or container returns `StorageError::NotFound`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(
        &self,
        account: &str,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<ObjectInfo>, StorageError>;

    async fn get(&self, account: &str, container: &str, name: &str)
        -> Result<Bytes, StorageError>;

    async fn put(
        &self,
        account: &str,
        container: &str,
        name: &str,
        data: Bytes,
    ) -> Result<(), StorageError>;

    async fn delete(&self, account: &str, container: &str, name: &str)
        -> Result<(), StorageError>;

    /// Create a container if it does not already exist.
    async fn create_container(&self, account: &str, container: &str) -> Result<(), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("storage returned status {status} for {path}")]
    Status { status: u16, path: String },

    #[error("storage error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}
