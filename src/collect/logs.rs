//! Shipping local log files into a plugin's source container.
//!
//! Files under the plugin's `log_dir` whose relative path matches its
//! filename pattern are uploaded as `YYYY/MM/DD/HH/<digest>.gz`, gzipped on
//! the way unless they already are. The digest covers the file's bytes, so
//! shipping the same file twice overwrites one object.

use crate::config::processor::ProcessorConfig;
use crate::source::matcher::FilenameMatcher;
use crate::source::window::WindowBounds;
use crate::storage::traits::{ObjectStore, StorageError};
use async_compression::tokio::write::GzipEncoder;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ShipError {
    #[error("plugin '{0}' has no log_dir")]
    NoLogDir(String),

    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to create container '{container}': {source}")]
    CreateContainer {
        container: String,
        source: StorageError,
    },

    #[error("failed to upload {path} as '{name}': {source}")]
    Upload {
        path: PathBuf,
        name: String,
        source: StorageError,
    },
}

/// What `logroll ship` prints for each plugin.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShipReport {
    pub plugin: String,
    pub found: usize,
    pub matched: usize,
    pub too_new: usize,
    pub empty: usize,
    pub unreadable: usize,
    pub uploaded: Vec<String>,
    pub unlinked: usize,
    pub unlink_failed: usize,
}

#[derive(Debug)]
struct LocalFile {
    relative: String,
    path: PathBuf,
    modified: Option<DateTime<Utc>>,
}

pub struct LogShipper {
    store: Arc<dyn ObjectStore>,
    config: ProcessorConfig,
    log_dir: PathBuf,
}

impl LogShipper {
    pub fn new(store: Arc<dyn ObjectStore>, config: &ProcessorConfig) -> Result<Self, ShipError> {
        let log_dir = config
            .options
            .log_dir
            .clone()
            .ok_or_else(|| ShipError::NoLogDir(config.name.clone()))?;

        Ok(Self {
            store,
            config: config.clone(),
            log_dir,
        })
    }

    /// Upload every matching file old enough to be complete.
    ///
    /// A file that cannot be read is skipped. A failed upload stops the run
    /// and leaves that file and every later one in place. Files are removed
    /// only after their upload succeeded, and only with `unlink_log`.
    pub async fn ship(&self, now: DateTime<Utc>) -> Result<ShipReport, ShipError> {
        let mut report = ShipReport {
            plugin: self.config.name.clone(),
            ..Default::default()
        };

        let files = self.local_files().await?;
        report.found = files.len();

        let cutoff = WindowBounds::for_config(&self.config, now).cutoff;
        let mut eligible = Vec::new();
        for file in files {
            let Some(matched) = self.matcher().parse(&file.relative) else {
                continue;
            };
            report.matched += 1;
            if file.modified.map_or(true, |modified| modified > cutoff) {
                debug!(file = %file.relative, "Skipping log still within new_log_cutoff");
                report.too_new += 1;
                continue;
            }
            eligible.push((file, matched.timestamp));
        }

        if eligible.is_empty() {
            warn!(
                plugin = %self.config.name,
                log_dir = %self.log_dir.display(),
                pattern = %self.matcher().as_str(),
                "No files ready to ship"
            );
            return Ok(report);
        }

        let account = &self.config.source_account;
        let container = &self.config.source_container;
        self.store
            .create_container(account, container)
            .await
            .map_err(|source| {
                error!(account = %account, container = %container, error = %source, "Unable to create container");
                ShipError::CreateContainer {
                    container: container.clone(),
                    source,
                }
            })?;

        for (file, timestamp) in eligible {
            let data = match tokio::fs::read(&file.path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(file = %file.path.display(), error = %e, "Failed to read log file, skipping");
                    report.unreadable += 1;
                    continue;
                }
            };
            if data.is_empty() {
                debug!(file = %file.relative, "Log is empty, skipping");
                report.empty += 1;
                continue;
            }

            let digest: String = Sha256::digest(&data).iter().map(|b| format!("{:02x}", b)).collect();
            let name = format!("{}/{}.gz", timestamp.path_prefix(), digest);
            let body = if file.relative.ends_with(".gz") {
                data
            } else {
                gzip(&data).await.map_err(|source| ShipError::Read {
                    path: file.path.clone(),
                    source,
                })?
            };

            self.store
                .put(account, container, &name, Bytes::from(body))
                .await
                .map_err(|source| {
                    error!(file = %file.path.display(), error = %source, "Upload of log failed");
                    ShipError::Upload {
                        path: file.path.clone(),
                        name: name.clone(),
                        source,
                    }
                })?;
            debug!(file = %file.relative, object = %name, "Uploaded log");
            report.uploaded.push(name);

            if self.config.unlink_log {
                match tokio::fs::remove_file(&file.path).await {
                    Ok(()) => report.unlinked += 1,
                    Err(e) => {
                        warn!(file = %file.path.display(), error = %e, "Failed to remove shipped log");
                        report.unlink_failed += 1;
                    }
                }
            }
        }

        info!(
            plugin = %self.config.name,
            uploaded = report.uploaded.len(),
            too_new = report.too_new,
            unlinked = report.unlinked,
            container = %container,
            "Shipping complete"
        );
        Ok(report)
    }

    fn matcher(&self) -> &FilenameMatcher {
        self.config.log_matcher.as_ref().unwrap_or(&self.config.matcher)
    }

    /// Every regular file under `log_dir`, by path relative to it. Hidden
    /// entries, such as collector working directories, are left out.
    async fn local_files(&self) -> Result<Vec<LocalFile>, ShipError> {
        let read_error = |path: &Path, source: io::Error| ShipError::Read {
            path: path.to_path_buf(),
            source,
        };

        let mut files = Vec::new();
        let mut pending = vec![self.log_dir.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| read_error(&dir, e))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| read_error(&dir, e))? {
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let path = entry.path();
                let metadata = entry.metadata().await.map_err(|e| read_error(&path, e))?;
                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.log_dir) else {
                    continue;
                };
                let relative = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push(LocalFile {
                    relative,
                    modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                    path,
                });
            }
        }

        files.sort_by(|a, b| a.relative.cmp(&b.relative));
        Ok(files)
    }
}

async fn gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzipEncoder::new(Vec::new());
    encoder.write_all(data).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::processor::test_support::processor_config;
    use crate::plugin::decode_object;
    use crate::storage::memory::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    const PATTERN: &str = r"(?P<year>[0-9]{4})(?P<month>[0-1][0-9])(?P<day>[0-3][0-9])(?P<hour>[0-2][0-9]).*$";

    fn config(dir: &TempDir) -> ProcessorConfig {
        let mut config = processor_config("access");
        config.matcher = FilenameMatcher::new(PATTERN).unwrap();
        config.options.log_dir = Some(dir.path().to_path_buf());
        config
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::hours(1)
    }

    fn write(dir: &TempDir, name: &str, data: &[u8]) {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, data).unwrap();
    }

    #[tokio::test]
    async fn test_ships_matching_files_gzipped() {
        let dir = TempDir::new().unwrap();
        write(&dir, "2024031512-proxy01.log", b"line one\n");
        write(&dir, "nested/2024031513-proxy01.log", b"line two\n");
        write(&dir, "notes.txt", b"not a log\n");
        write(&dir, ".account-stats_tmp/2024031512-partial", b"half\n");

        let store = Arc::new(MemoryStore::new());
        let shipper = LogShipper::new(store.clone(), &config(&dir)).unwrap();
        let report = shipper.ship(later()).await.unwrap();

        assert_eq!(report.found, 3);
        assert_eq!(report.matched, 1);
        assert_eq!(report.uploaded.len(), 1);
        let name = &report.uploaded[0];
        assert!(name.starts_with("2024/03/15/12/"), "{}", name);
        assert!(name.ends_with(".gz"));

        let data = store.get("AUTH_test", "log_data", name).await.unwrap();
        let decoded = decode_object(name, data).await.unwrap();
        assert_eq!(&decoded[..], b"line one\n");
        // Kept without unlink_log
        assert!(dir.path().join("2024031512-proxy01.log").exists());
    }

    #[tokio::test]
    async fn test_nested_paths_match_against_relative_name() {
        let dir = TempDir::new().unwrap();
        write(&dir, "2024/03/15/12/proxy01.gz", b"\x1f\x8b already compressed");
        let mut config = config(&dir);
        config.matcher = FilenameMatcher::new(
            r"(?P<year>[0-9]{4})/(?P<month>[0-9]{2})/(?P<day>[0-9]{2})/(?P<hour>[0-9]{2})/.*\.gz$",
        )
        .unwrap();

        let store = Arc::new(MemoryStore::new());
        let report = LogShipper::new(store.clone(), &config).unwrap().ship(later()).await.unwrap();

        assert_eq!(report.uploaded.len(), 1);
        let data = store.get("AUTH_test", "log_data", &report.uploaded[0]).await.unwrap();
        // Already gzipped files are uploaded as they are
        assert_eq!(&data[..], b"\x1f\x8b already compressed");
    }

    #[tokio::test]
    async fn test_local_pattern_overrides_object_pattern() {
        let dir = TempDir::new().unwrap();
        write(&dir, "stats-2024031512_0af3", b"\"AUTH_a\",1,2,3\n");
        let mut config = config(&dir);
        config.matcher = FilenameMatcher::new(
            r"(?P<year>[0-9]{4})/(?P<month>[0-9]{2})/(?P<day>[0-9]{2})/(?P<hour>[0-9]{2})/.*\.gz$",
        )
        .unwrap();
        config.log_matcher = Some(
            FilenameMatcher::new(
                r"stats-(?P<year>[0-9]{4})(?P<month>[0-9]{2})(?P<day>[0-9]{2})(?P<hour>[0-9]{2})_.*$",
            )
            .unwrap(),
        );

        let store = Arc::new(MemoryStore::new());
        let report = LogShipper::new(store.clone(), &config).unwrap().ship(later()).await.unwrap();

        assert_eq!(report.uploaded.len(), 1);
        // Shipped names are what the plugin's own pass picks up
        let shipped = config.matcher.parse(&report.uploaded[0]).unwrap();
        assert_eq!(shipped.timestamp.to_string(), "2024031512");
    }

    #[tokio::test]
    async fn test_new_files_wait_for_cutoff() {
        let dir = TempDir::new().unwrap();
        write(&dir, "2024031512-proxy01.log", b"line\n");
        let mut config = config(&dir);
        config.new_log_cutoff = Duration::from_secs(7200);

        let store = Arc::new(MemoryStore::new());
        let report = LogShipper::new(store.clone(), &config).unwrap().ship(Utc::now()).await.unwrap();

        assert_eq!(report.too_new, 1);
        assert!(report.uploaded.is_empty());
        assert!(store.names("AUTH_test", "log_data").is_empty());
    }

    #[tokio::test]
    async fn test_unlink_after_upload_and_skip_empty() {
        let dir = TempDir::new().unwrap();
        write(&dir, "2024031512-proxy01.log", b"line\n");
        write(&dir, "2024031512-proxy02.log", b"");
        let mut config = config(&dir);
        config.unlink_log = true;

        let store = Arc::new(MemoryStore::new());
        let report = LogShipper::new(store.clone(), &config).unwrap().ship(later()).await.unwrap();

        assert_eq!(report.uploaded.len(), 1);
        assert_eq!(report.empty, 1);
        assert_eq!(report.unlinked, 1);
        assert!(!dir.path().join("2024031512-proxy01.log").exists());
        assert!(dir.path().join("2024031512-proxy02.log").exists());
    }

    /// Accepts containers but refuses every write.
    #[derive(Default)]
    struct ReadOnlyStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl ObjectStore for ReadOnlyStore {
        async fn list(
            &self,
            account: &str,
            container: &str,
            prefix: Option<&str>,
        ) -> Result<Vec<crate::storage::traits::ObjectInfo>, StorageError> {
            self.inner.list(account, container, prefix).await
        }

        async fn get(&self, account: &str, container: &str, name: &str) -> Result<Bytes, StorageError> {
            self.inner.get(account, container, name).await
        }

        async fn put(
            &self,
            _account: &str,
            container: &str,
            _name: &str,
            _data: Bytes,
        ) -> Result<(), StorageError> {
            Err(StorageError::Backend(format!("{} is read-only", container)))
        }

        async fn delete(&self, account: &str, container: &str, name: &str) -> Result<(), StorageError> {
            self.inner.delete(account, container, name).await
        }

        async fn create_container(&self, account: &str, container: &str) -> Result<(), StorageError> {
            self.inner.create_container(account, container).await
        }
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_file() {
        let dir = TempDir::new().unwrap();
        write(&dir, "2024031512-proxy01.log", b"line\n");
        let mut config = config(&dir);
        config.unlink_log = true;

        let store = Arc::new(ReadOnlyStore::default());
        let err = LogShipper::new(store, &config).unwrap().ship(later()).await.unwrap_err();

        assert!(matches!(err, ShipError::Upload { .. }));
        assert!(dir.path().join("2024031512-proxy01.log").exists());
    }

    #[tokio::test]
    async fn test_requires_log_dir() {
        let mut config = processor_config("access");
        config.options.log_dir = None;
        let err = LogShipper::new(Arc::new(MemoryStore::new()), &config).err().unwrap();
        assert!(matches!(err, ShipError::NoLogDir(_)));
    }
}
