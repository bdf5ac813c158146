use super::traits::{ObjectStore, StorageError};
use crate::source::matcher::LogTimestamp;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Marker serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid marker version {found} for plugin '{plugin}' (expected {})", CURRENT_VERSION)]
    InvalidVersion { plugin: String, found: u32 },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Per-plugin record of which raw objects have been fully processed.
///
/// `processed` only holds objects inside the lookback range; anything older is
/// outside every future candidate window and is summarised by `watermark`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedMarker {
    pub version: u32,
    pub plugin: String,
    pub watermark: Option<LogTimestamp>,
    #[serde(default)]
    pub processed: BTreeMap<String, LogTimestamp>,
    #[serde(default)]
    pub failures: BTreeMap<String, FailureRecord>,
    pub updated_at: Option<DateTime<Utc>>,
    pub committed_by: Option<String>,
    #[serde(default)]
    pub last_outputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: LogTimestamp,
    pub attempts: u32,
    pub first_failed: DateTime<Utc>,
    pub last_failed: DateTime<Utc>,
    pub last_error: String,
}

/// Everything a successful pass records in the marker.
#[derive(Debug, Clone)]
pub struct MarkerUpdate {
    pub newly_processed: Vec<(String, LogTimestamp)>,
    /// Highest timestamp of the contiguous successful prefix of the pass.
    pub new_watermark: Option<LogTimestamp>,
    /// Objects that failed to parse, with the error message.
    pub failed: Vec<(String, LogTimestamp, String)>,
    pub outputs: Vec<String>,
    /// Entries older than this are outside the lookback range and dropped.
    pub lookback_floor: LogTimestamp,
    pub now: DateTime<Utc>,
}

impl ProcessedMarker {
    pub fn empty(plugin: &str) -> Self {
        Self {
            version: CURRENT_VERSION,
            plugin: plugin.to_string(),
            watermark: None,
            processed: BTreeMap::new(),
            failures: BTreeMap::new(),
            updated_at: None,
            committed_by: None,
            last_outputs: Vec::new(),
        }
    }

    pub fn is_processed(&self, name: &str) -> bool {
        self.processed.contains_key(name)
    }

    /// Apply a pass's results. The watermark never moves backwards.
    pub fn apply(&mut self, update: MarkerUpdate) {
        for (name, timestamp) in update.newly_processed {
            self.failures.remove(&name);
            self.processed.insert(name, timestamp);
        }

        for (name, timestamp, error) in update.failed {
            let record = self.failures.entry(name).or_insert_with(|| FailureRecord {
                timestamp,
                attempts: 0,
                first_failed: update.now,
                last_failed: update.now,
                last_error: String::new(),
            });
            record.attempts += 1;
            record.last_failed = update.now;
            record.last_error = error;
        }

        self.watermark = match (self.watermark, update.new_watermark) {
            (Some(old), Some(new)) => Some(old.max(new)),
            (old, new) => old.or(new),
        };

        let floor = update.lookback_floor;
        self.processed.retain(|_, ts| *ts >= floor);
        self.failures.retain(|_, record| record.timestamp >= floor);

        self.last_outputs = update.outputs;
        self.updated_at = Some(update.now);
        self.committed_by = hostname::get()
            .ok()
            .map(|h| h.to_string_lossy().into_owned());
    }

    /// Objects that have failed at least `threshold` times in a row.
    pub fn persistent_failures(&self, threshold: u32) -> impl Iterator<Item = (&String, &FailureRecord)> {
        self.failures
            .iter()
            .filter(move |(_, record)| record.attempts >= threshold)
    }
}

/// Durable marker storage, one small JSON object per plugin.
pub struct ProgressStore {
    store: Arc<dyn ObjectStore>,
    account: String,
    container: String,
}

impl ProgressStore {
    pub fn new(store: Arc<dyn ObjectStore>, account: &str, container: &str) -> Self {
        Self {
            store,
            account: account.to_string(),
            container: container.to_string(),
        }
    }

    pub fn marker_name(plugin: &str) -> String {
        format!("{}.processed.json", plugin)
    }

    /// Load a plugin's marker; a plugin that never committed gets an empty one.
    pub async fn load(&self, plugin: &str) -> Result<ProcessedMarker> {
        let name = Self::marker_name(plugin);
        let data = match self.store.get(&self.account, &self.container, &name).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                tracing::info!(plugin = %plugin, "No marker found, starting from empty");
                return Ok(ProcessedMarker::empty(plugin));
            }
            Err(e) => return Err(e.into()),
        };

        let marker: ProcessedMarker = serde_json::from_slice(&data)?;
        if marker.version != CURRENT_VERSION {
            return Err(CheckpointError::InvalidVersion {
                plugin: plugin.to_string(),
                found: marker.version,
            });
        }

        tracing::debug!(
            plugin = %plugin,
            watermark = ?marker.watermark.map(|w| w.to_string()),
            processed = marker.processed.len(),
            "Loaded marker"
        );
        Ok(marker)
    }

    /// Apply `update` to `marker` and persist the result.
    ///
    /// The stored marker is replaced in a single write, so a failure leaves
    /// the previous marker intact.
    pub async fn commit(
        &self,
        marker: &ProcessedMarker,
        update: MarkerUpdate,
    ) -> Result<ProcessedMarker> {
        let mut next = marker.clone();
        next.apply(update);

        let data = serde_json::to_vec_pretty(&next)?;
        self.store
            .create_container(&self.account, &self.container)
            .await?;
        self.store
            .put(
                &self.account,
                &self.container,
                &Self::marker_name(&next.plugin),
                Bytes::from(data),
            )
            .await?;

        tracing::info!(
            plugin = %next.plugin,
            watermark = ?next.watermark.map(|w| w.to_string()),
            processed = next.processed.len(),
            "Marker committed"
        );
        Ok(next)
    }

    /// Every marker stored in the marker container.
    pub async fn load_all(&self) -> Result<Vec<ProcessedMarker>> {
        let mut markers = Vec::new();
        for info in self.store.list(&self.account, &self.container, None).await? {
            let Some(plugin) = info.name.strip_suffix(".processed.json") else {
                continue;
            };
            markers.push(self.load(plugin).await?);
        }
        Ok(markers)
    }
}
