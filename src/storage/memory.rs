use super::traits::{ObjectInfo, ObjectStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

type ContainerKey = (String, String);

/// In-process object store. Objects live only as long as the store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    containers: Mutex<BTreeMap<ContainerKey, BTreeMap<String, StoredObject>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object with an explicit modification time.
    pub fn insert(
        &self,
        account: &str,
        container: &str,
        name: &str,
        data: impl Into<Bytes>,
        last_modified: DateTime<Utc>,
    ) {
        let mut containers = self.lock();
        containers
            .entry((account.to_string(), container.to_string()))
            .or_default()
            .insert(
                name.to_string(),
                StoredObject {
                    data: data.into(),
                    last_modified,
                },
            );
    }

    /// Names currently stored in a container.
    pub fn names(&self, account: &str, container: &str) -> Vec<String> {
        self.lock()
            .get(&(account.to_string(), container.to_string()))
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, account: &str, container: &str, name: &str) -> bool {
        self.lock()
            .get(&(account.to_string(), container.to_string()))
            .is_some_and(|objects| objects.contains_key(name))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ContainerKey, BTreeMap<String, StoredObject>>> {
        // A poisoned lock only means another test thread panicked mid-insert
        self.containers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(
        &self,
        account: &str,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<ObjectInfo>, StorageError> {
        let containers = self.lock();
        let Some(objects) = containers.get(&(account.to_string(), container.to_string())) else {
            return Ok(Vec::new());
        };

        Ok(objects
            .iter()
            .filter(|(name, _)| prefix.map_or(true, |p| name.starts_with(p)))
            .map(|(name, object)| ObjectInfo {
                name: name.clone(),
                size: object.data.len() as u64,
                last_modified: Some(object.last_modified),
                etag: None,
            })
            .collect())
    }

    async fn get(&self, account: &str, container: &str, name: &str) -> Result<Bytes, StorageError> {
        self.lock()
            .get(&(account.to_string(), container.to_string()))
            .and_then(|objects| objects.get(name))
            .map(|object| object.data.clone())
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}/{}", account, container, name)))
    }

    async fn put(
        &self,
        account: &str,
        container: &str,
        name: &str,
        data: Bytes,
    ) -> Result<(), StorageError> {
        let mut containers = self.lock();
        let Some(objects) = containers.get_mut(&(account.to_string(), container.to_string())) else {
            return Err(StorageError::NotFound(format!("{}/{}", account, container)));
        };
        objects.insert(
            name.to_string(),
            StoredObject {
                data,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, account: &str, container: &str, name: &str) -> Result<(), StorageError> {
        let mut containers = self.lock();
        containers
            .get_mut(&(account.to_string(), container.to_string()))
            .and_then(|objects| objects.remove(name))
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}/{}", account, container, name)))
    }

    async fn create_container(&self, account: &str, container: &str) -> Result<(), StorageError> {
        self.lock()
            .entry((account.to_string(), container.to_string()))
            .or_default();
        Ok(())
    }
}
