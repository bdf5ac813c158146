use crate::config::Config;
use crate::source::matcher::LogTimestamp;
use crate::storage::checkpoint::{CheckpointError, ProcessedMarker, ProgressStore};
use crate::storage::traits::ObjectStore;
use crate::storage::build_store;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// What `logroll status` prints for each stored marker.
#[derive(Debug, Serialize)]
pub struct MarkerSummary {
    pub plugin: String,
    pub configured: bool,
    pub watermark: Option<LogTimestamp>,
    pub processed: usize,
    pub failing: usize,
    pub persistent_failures: Vec<FailureSummary>,
    pub updated_at: Option<DateTime<Utc>>,
    pub committed_by: Option<String>,
    pub last_outputs: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FailureSummary {
    pub object: String,
    pub attempts: u32,
    pub last_error: String,
}

impl MarkerSummary {
    fn new(marker: &ProcessedMarker, configured: bool, threshold: u32) -> Self {
        Self {
            plugin: marker.plugin.clone(),
            configured,
            watermark: marker.watermark,
            processed: marker.processed.len(),
            failing: marker.failures.len(),
            persistent_failures: marker
                .persistent_failures(threshold)
                .map(|(name, record)| FailureSummary {
                    object: name.clone(),
                    attempts: record.attempts,
                    last_error: record.last_error.clone(),
                })
                .collect(),
            updated_at: marker.updated_at,
            committed_by: marker.committed_by.clone(),
            last_outputs: marker.last_outputs.clone(),
        }
    }
}

/// Summaries of every marker in the marker container.
pub async fn collect(
    store: Arc<dyn ObjectStore>,
    config: &Config,
) -> Result<Vec<MarkerSummary>, CheckpointError> {
    let global = &config.global;
    let progress = ProgressStore::new(store, &global.swift_account, &global.marker_container);

    Ok(progress
        .load_all()
        .await?
        .iter()
        .map(|marker| {
            MarkerSummary::new(
                marker,
                config.plugins.contains_key(&marker.plugin),
                global.failure_warn_threshold,
            )
        })
        .collect())
}

pub async fn status(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = build_store(&config.global.storage)?;
    let summaries = collect(store, config).await?;
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}
