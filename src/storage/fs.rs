use super::traits::{ObjectInfo, ObjectStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

const TMP_DIR: &str = ".tmp";

/// Object store laid out on a local directory tree.
///
/// Objects live at `<root>/<account>/<container>/<name>`; a `/` in an object
/// name becomes a subdirectory. Writes go to `<root>/<account>/.tmp` first and
/// are renamed into place, so readers never observe a partial object.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn container_path(&self, account: &str, container: &str) -> Result<PathBuf, StorageError> {
        check_segment(account)?;
        check_segment(container)?;
        Ok(self.root.join(account).join(container))
    }

    fn object_path(&self, account: &str, container: &str, name: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(name);
        let safe = !name.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(StorageError::Backend(format!("invalid object name '{}'", name)));
        }
        Ok(self.container_path(account, container)?.join(relative))
    }
}

fn check_segment(segment: &str) -> Result<(), StorageError> {
    if segment.is_empty() || segment.contains('/') || segment == "." || segment == ".." {
        return Err(StorageError::Backend(format!(
            "invalid account or container name '{}'",
            segment
        )));
    }
    Ok(())
}

fn map_not_found(e: std::io::Error, what: impl Into<String>) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::NotFound(what.into())
    } else {
        StorageError::Io(e)
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn list(
        &self,
        account: &str,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<ObjectInfo>, StorageError> {
        let base = self.container_path(account, container)?;
        if !tokio::fs::try_exists(&base).await? {
            return Ok(Vec::new());
        }

        let mut objects = Vec::new();
        let mut pending = vec![base.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&base) else {
                    continue;
                };
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                if prefix.map_or(false, |p| !name.starts_with(p)) {
                    continue;
                }

                let last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);
                objects.push(ObjectInfo {
                    name,
                    size: metadata.len(),
                    last_modified,
                    etag: None,
                });
            }
        }

        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn get(&self, account: &str, container: &str, name: &str) -> Result<Bytes, StorageError> {
        let path = self.object_path(account, container, name)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| map_not_found(e, format!("{}/{}/{}", account, container, name)))?;
        Ok(Bytes::from(data))
    }

    async fn put(
        &self,
        account: &str,
        container: &str,
        name: &str,
        data: Bytes,
    ) -> Result<(), StorageError> {
        let container_path = self.container_path(account, container)?;
        if !tokio::fs::try_exists(&container_path).await? {
            return Err(StorageError::NotFound(format!("{}/{}", account, container)));
        }

        let path = self.object_path(account, container, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_dir = self.root.join(account).join(TMP_DIR);
        tokio::fs::create_dir_all(&tmp_dir).await?;
        let tmp_path = tmp_dir.join(Uuid::new_v4().to_string());

        tokio::fs::write(&tmp_path, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, account: &str, container: &str, name: &str) -> Result<(), StorageError> {
        let path = self.object_path(account, container, name)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| map_not_found(e, format!("{}/{}/{}", account, container, name)))
    }

    async fn create_container(&self, account: &str, container: &str) -> Result<(), StorageError> {
        let path = self.container_path(account, container)?;
        tokio::fs::create_dir_all(&path).await?;
        Ok(())
    }
}
