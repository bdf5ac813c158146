//! Writing aggregated windows to the destination container.
//!
//! Output names are derived from the window and the set of contributing raw
//! objects, so uploading the same sources twice overwrites the same object
//! with identical bytes.

use crate::aggregate::{AggregationRow, WindowRollup};
use crate::source::matcher::LogTimestamp;
use crate::storage::traits::{ObjectStore, StorageError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const DIGEST_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to create container '{container}': {source}")]
    CreateContainer {
        container: String,
        source: StorageError,
    },

    #[error("failed to serialize output for window {window}: {source}")]
    Serialize {
        window: LogTimestamp,
        source: serde_json::Error,
    },

    #[error("failed to write '{name}': {source}")]
    Write { name: String, source: StorageError },

    #[error("failed to remove superseded output '{name}': {source}")]
    Supersede { name: String, source: StorageError },

    #[error("output '{name}' was removed by a concurrent pass")]
    Removed { name: String },
}

pub type Result<T> = std::result::Result<T, UploadError>;

/// Serialized form of one window's output object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDocument {
    pub plugin: String,
    pub window: LogTimestamp,
    pub sources: Vec<String>,
    pub rows: Vec<AggregationRow>,
}

impl OutputDocument {
    pub fn new(plugin: &str, rollup: &WindowRollup) -> Self {
        let mut rows = rollup.rows.clone();
        rows.sort();
        Self {
            plugin: plugin.to_string(),
            window: rollup.window,
            sources: rollup.sources.iter().cloned().collect(),
            rows,
        }
    }

    pub fn to_bytes(&self) -> std::result::Result<Bytes, serde_json::Error> {
        let mut data = serde_json::to_vec_pretty(self)?;
        data.push(b'\n');
        Ok(Bytes::from(data))
    }
}

// Only the source list is needed to decide whether an output is superseded
#[derive(Deserialize)]
struct OutputSources {
    sources: Vec<String>,
}

/// Proof that every window of a pass was durably written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitToken {
    /// Names of the written output objects, in window order.
    pub outputs: Vec<String>,
    pub windows: Vec<LogTimestamp>,
    /// Orphaned outputs of earlier uncommitted passes that were removed.
    pub superseded: Vec<String>,
}

/// Prefix under which every output of one window lives.
pub fn window_prefix(plugin: &str, window: LogTimestamp) -> String {
    format!("{}/{}/", plugin, window.path_prefix())
}

/// `<plugin>/<YYYY>/<MM>/<DD>/<HH>/<digest>.json`
pub fn output_name(plugin: &str, window: LogTimestamp, sources: &BTreeSet<String>) -> String {
    let mut hasher = Sha256::new();
    for source in sources {
        hasher.update(source.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}.json", window_prefix(plugin, window), &hex[..DIGEST_LEN])
}

pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    account: String,
    container: String,
    plugin: String,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, account: &str, container: &str, plugin: &str) -> Self {
        Self {
            store,
            account: account.to_string(),
            container: container.to_string(),
            plugin: plugin.to_string(),
        }
    }

    /// Write one output object per window, then remove outputs of earlier
    /// passes that covered any of the same sources but were never committed.
    ///
    /// Any failure aborts the upload; objects already written stay in place
    /// and are overwritten or superseded by the next pass. An output that
    /// another pass over the same window removed as superseded also aborts
    /// the upload, so nothing is committed against a missing object.
    pub async fn upload(&self, rollups: &[WindowRollup]) -> Result<CommitToken> {
        let mut token = CommitToken::default();
        if rollups.is_empty() {
            return Ok(token);
        }

        self.store
            .create_container(&self.account, &self.container)
            .await
            .map_err(|source| UploadError::CreateContainer {
                container: self.container.clone(),
                source,
            })?;

        for rollup in rollups {
            let name = output_name(&self.plugin, rollup.window, &rollup.sources);
            let data = OutputDocument::new(&self.plugin, rollup)
                .to_bytes()
                .map_err(|source| UploadError::Serialize {
                    window: rollup.window,
                    source,
                })?;

            self.store
                .put(&self.account, &self.container, &name, data)
                .await
                .map_err(|source| UploadError::Write {
                    name: name.clone(),
                    source,
                })?;
            debug!(
                output = %name,
                window = %rollup.window,
                rows = rollup.rows.len(),
                sources = rollup.sources.len(),
                "Wrote output object"
            );

            let superseded = self.remove_superseded(rollup, &name).await?;
            token.superseded.extend(superseded);
            token.outputs.push(name);
            token.windows.push(rollup.window);
        }

        self.verify_outputs(&token).await?;

        info!(
            outputs = token.outputs.len(),
            superseded = token.superseded.len(),
            container = %self.container,
            "Upload complete"
        );
        Ok(token)
    }

    async fn remove_superseded(&self, rollup: &WindowRollup, written: &str) -> Result<Vec<String>> {
        let prefix = window_prefix(&self.plugin, rollup.window);
        let listing = self
            .store
            .list(&self.account, &self.container, Some(&prefix))
            .await
            .map_err(|source| UploadError::Supersede {
                name: prefix.clone(),
                source,
            })?;

        // Already replaced by another pass; removing the replacement too
        // would leave the window empty
        if !listing.iter().any(|info| info.name == written) {
            warn!(output = %written, window = %rollup.window, "Output removed by another pass, not committing");
            return Err(UploadError::Removed {
                name: written.to_string(),
            });
        }

        let mut removed = Vec::new();
        for info in listing {
            if info.name == written || !info.name.ends_with(".json") {
                continue;
            }

            let data = match self.store.get(&self.account, &self.container, &info.name).await {
                Ok(data) => data,
                Err(e) if e.is_not_found() => continue,
                Err(source) => {
                    return Err(UploadError::Supersede {
                        name: info.name,
                        source,
                    })
                }
            };
            let existing: OutputSources = match serde_json::from_slice(&data) {
                Ok(existing) => existing,
                Err(e) => {
                    warn!(output = %info.name, error = %e, "Ignoring unreadable object in output prefix");
                    continue;
                }
            };

            if !existing.sources.iter().any(|s| rollup.sources.contains(s)) {
                continue;
            }

            match self.store.delete(&self.account, &self.container, &info.name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(source) => {
                    return Err(UploadError::Supersede {
                        name: info.name,
                        source,
                    })
                }
            }
            info!(output = %info.name, replaced_by = %written, "Removed superseded output");
            removed.push(info.name);
        }
        Ok(removed)
    }

    async fn verify_outputs(&self, token: &CommitToken) -> Result<()> {
        for (name, window) in token.outputs.iter().zip(&token.windows) {
            let prefix = window_prefix(&self.plugin, *window);
            let listing = self
                .store
                .list(&self.account, &self.container, Some(&prefix))
                .await
                .map_err(|source| UploadError::Supersede {
                    name: prefix.clone(),
                    source,
                })?;

            if !listing.iter().any(|info| &info.name == name) {
                warn!(output = %name, window = %window, "Output removed by another pass, not committing");
                return Err(UploadError::Removed { name: name.clone() });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{RecordKey, TrafficClass};
    use crate::storage::memory::MemoryStore;
    use std::collections::BTreeMap;

    fn window() -> LogTimestamp {
        LogTimestamp::new(2024, 3, 15, 12)
    }

    fn rollup(sources: &[&str], requests: u64) -> WindowRollup {
        let sources: BTreeSet<String> = sources.iter().map(|s| s.to_string()).collect();
        WindowRollup {
            window: window(),
            rows: vec![AggregationRow {
                key: RecordKey {
                    window: window(),
                    account: "AUTH_a".to_string(),
                    container: Some("c1".to_string()),
                    traffic_class: TrafficClass::Public,
                },
                measures: BTreeMap::from([("requests".to_string(), requests)]),
                sources: sources.clone(),
            }],
            sources,
        }
    }

    fn uploader(store: &Arc<MemoryStore>) -> Uploader {
        Uploader::new(store.clone(), "AUTH_test", "rollups", "access")
    }

    #[test]
    fn test_output_name_depends_only_on_source_set() {
        let a: BTreeSet<String> = ["x".to_string(), "y".to_string()].into();
        let b: BTreeSet<String> = ["y".to_string(), "x".to_string()].into();
        let c: BTreeSet<String> = ["x".to_string()].into();

        let name = output_name("access", window(), &a);
        assert!(name.starts_with("access/2024/03/15/12/"));
        assert!(name.ends_with(".json"));
        assert_eq!(name.len(), "access/2024/03/15/12/".len() + DIGEST_LEN + ".json".len());
        assert_eq!(name, output_name("access", window(), &b));
        assert_ne!(name, output_name("access", window(), &c));
    }

    #[tokio::test]
    async fn test_upload_creates_container_and_writes_document() {
        let store = Arc::new(MemoryStore::new());
        let token = uploader(&store).upload(&[rollup(&["s1", "s2"], 3)]).await.unwrap();

        assert_eq!(token.outputs.len(), 1);
        assert_eq!(token.windows, vec![window()]);
        let data = store.get("AUTH_test", "rollups", &token.outputs[0]).await.unwrap();
        let doc: OutputDocument = serde_json::from_slice(&data).unwrap();
        assert_eq!(doc.plugin, "access");
        assert_eq!(doc.sources, vec!["s1", "s2"]);
        assert_eq!(doc.rows[0].measures["requests"], 3);
    }

    #[tokio::test]
    async fn test_reupload_is_byte_identical() {
        let store = Arc::new(MemoryStore::new());
        let first = uploader(&store).upload(&[rollup(&["s1"], 1)]).await.unwrap();
        let before = store.get("AUTH_test", "rollups", &first.outputs[0]).await.unwrap();

        let second = uploader(&store).upload(&[rollup(&["s1"], 1)]).await.unwrap();
        let after = store.get("AUTH_test", "rollups", &second.outputs[0]).await.unwrap();

        assert_eq!(first.outputs, second.outputs);
        assert_eq!(before, after);
        assert!(second.superseded.is_empty());
        assert_eq!(store.names("AUTH_test", "rollups").len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_orphan_is_superseded() {
        let store = Arc::new(MemoryStore::new());
        // An earlier pass wrote {s1} but never committed it
        let orphan = uploader(&store).upload(&[rollup(&["s1"], 1)]).await.unwrap();
        // A committed output for different sources in the same window
        let committed = uploader(&store).upload(&[rollup(&["s0"], 5)]).await.unwrap();

        let token = uploader(&store).upload(&[rollup(&["s1", "s2"], 2)]).await.unwrap();

        assert_eq!(token.superseded, orphan.outputs);
        let names = store.names("AUTH_test", "rollups");
        assert!(names.contains(&committed.outputs[0]));
        assert!(names.contains(&token.outputs[0]));
        assert_eq!(names.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_upload_touches_nothing() {
        let store = Arc::new(MemoryStore::new());
        let token = uploader(&store).upload(&[]).await.unwrap();
        assert_eq!(token, CommitToken::default());
        assert!(store.list("AUTH_test", "rollups", None).await.unwrap().is_empty());
    }
}
