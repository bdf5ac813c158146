//! One pass per configured plugin.
//!
//! A pass moves through `Listing -> Parsing -> Aggregating -> Uploading ->
//! Committing -> Deleting`. Failures while listing, uploading or committing
//! abort the pass with the marker untouched; per-object failures are recorded
//! and retried on a later pass. Cancellation is honoured up to the start of
//! uploading.

use super::channel::outcome_channel;
use super::runner::{run_folder, run_workers, FoldResult};
use crate::aggregate::{Aggregator, TrafficClassifier};
use crate::config::processor::ProcessorConfig;
use crate::config::{ConfigError, GlobalConfig};
use crate::plugin::PluginRegistry;
use crate::source::matcher::LogTimestamp;
use crate::source::window::{self, RawLogObject, Selection, WindowBounds};
use crate::storage::checkpoint::{CheckpointError, MarkerUpdate, ProgressStore};
use crate::storage::traits::{ObjectStore, StorageError};
use crate::upload::{UploadError, Uploader};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to load marker: {0}")]
    Marker(#[source] CheckpointError),

    #[error("failed to list source container: {0}")]
    List(#[source] StorageError),

    #[error("failed to write output: {0}")]
    Write(#[from] UploadError),

    #[error("failed to commit marker: {0}")]
    Commit(#[source] CheckpointError),

    #[error("pass cancelled during {phase}")]
    Cancelled { phase: RunPhase },

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Listing,
    Parsing,
    Aggregating,
    Uploading,
    Committing,
    Deleting,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Listing => "listing",
            RunPhase::Parsing => "parsing",
            RunPhase::Aggregating => "aggregating",
            RunPhase::Uploading => "uploading",
            RunPhase::Committing => "committing",
            RunPhase::Deleting => "deleting",
            RunPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Counts reported at the end of a pass.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub plugin: String,
    pub run_id: Uuid,
    pub phase: RunPhase,
    pub listed: usize,
    pub matched: usize,
    pub selected: usize,
    pub too_old: usize,
    pub too_new: usize,
    pub already_processed: usize,
    pub deferred: usize,
    pub parsed: usize,
    pub failed: usize,
    pub committed: usize,
    pub unlinked: usize,
    pub unlink_failed: usize,
    pub outputs: Vec<String>,
    pub superseded: Vec<String>,
    pub watermark: Option<LogTimestamp>,
}

impl RunReport {
    fn new(plugin: &str, run_id: Uuid) -> Self {
        Self {
            plugin: plugin.to_string(),
            run_id,
            phase: RunPhase::Idle,
            listed: 0,
            matched: 0,
            selected: 0,
            too_old: 0,
            too_new: 0,
            already_processed: 0,
            deferred: 0,
            parsed: 0,
            failed: 0,
            committed: 0,
            unlinked: 0,
            unlink_failed: 0,
            outputs: Vec::new(),
            superseded: Vec::new(),
            watermark: None,
        }
    }

    fn record_selection(&mut self, selection: &Selection) {
        self.listed = selection.listed;
        self.matched = selection.matched;
        self.selected = selection.candidates.len();
        self.too_old = selection.too_old;
        self.too_new = selection.too_new;
        self.already_processed = selection.already_processed;
        self.deferred = selection.deferred;
    }
}

/// Outcome of one plugin's pass within `run_all`.
#[derive(Debug)]
pub struct PluginOutcome {
    pub plugin: String,
    pub result: Result<RunReport, RunError>,
}

pub struct Orchestrator {
    store: Arc<dyn ObjectStore>,
    progress: ProgressStore,
    registry: PluginRegistry,
    workers: usize,
    failure_warn_threshold: u32,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn ObjectStore>, global: &GlobalConfig, registry: PluginRegistry) -> Self {
        let progress = ProgressStore::new(store.clone(), &global.swift_account, &global.marker_container);
        Self {
            store,
            progress,
            registry,
            workers: global.workers,
            failure_warn_threshold: global.failure_warn_threshold,
        }
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    /// Run every plugin concurrently, one task per plugin.
    pub async fn run_all(
        self: Arc<Self>,
        processors: Vec<ProcessorConfig>,
        now: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Vec<PluginOutcome> {
        let handles: Vec<_> = processors
            .into_iter()
            .map(|config| {
                let this = self.clone();
                let cancel = cancel.clone();
                let plugin = config.name.clone();
                let handle = tokio::spawn(async move { this.run_plugin(&config, now, &cancel).await });
                (plugin, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (plugin, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(RunError::Join(e)),
            };
            if let Err(e) = &result {
                error!(plugin = %plugin, error = %e, "Plugin pass failed");
            }
            outcomes.push(PluginOutcome { plugin, result });
        }
        outcomes
    }

    /// Run a single pass for one plugin.
    pub async fn run_plugin(
        &self,
        config: &ProcessorConfig,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("plugin_run", plugin = %config.name, %run_id);
        self.pass(config, now, cancel, run_id).instrument(span).await
    }

    async fn pass(
        &self,
        config: &ProcessorConfig,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        run_id: Uuid,
    ) -> Result<RunReport, RunError> {
        let processor = self.registry.create(&config.class_path, &config.options)?;
        let mut report = RunReport::new(&config.name, run_id);
        let bounds = WindowBounds::for_config(config, now);

        report.phase = RunPhase::Listing;
        check_cancelled(cancel, report.phase)?;
        let marker = self.progress.load(&config.name).await.map_err(RunError::Marker)?;
        let selection = window::scan(self.store.as_ref(), config, &marker, now)
            .await
            .map_err(RunError::List)?;
        report.record_selection(&selection);
        info!(
            listed = selection.listed,
            matched = selection.matched,
            selected = selection.candidates.len(),
            too_old = selection.too_old,
            too_new = selection.too_new,
            already_processed = selection.already_processed,
            deferred = selection.deferred,
            floor = %bounds.floor,
            ceiling = %bounds.ceiling,
            "Listing complete"
        );

        let candidates = selection.candidates;
        if candidates.is_empty() {
            report.phase = RunPhase::Done;
            report.watermark = marker.watermark;
            info!("No new objects to process");
            return Ok(report);
        }

        if !config.processable {
            // Recorded as seen so they are not relisted, but never aggregated
            check_cancelled(cancel, report.phase)?;
            report.phase = RunPhase::Committing;
            let update = MarkerUpdate {
                newly_processed: candidates.iter().map(|c| (c.name.clone(), c.timestamp)).collect(),
                new_watermark: candidates.last().map(|c| c.timestamp),
                failed: Vec::new(),
                outputs: Vec::new(),
                lookback_floor: bounds.floor,
                now,
            };
            let committed = self.progress.commit(&marker, update).await.map_err(RunError::Commit)?;
            report.committed = candidates.len();
            report.watermark = committed.watermark;
            report.phase = RunPhase::Done;
            info!(recorded = report.committed, "Recorded objects for non-processable plugin");
            return Ok(report);
        }

        report.phase = RunPhase::Parsing;
        check_cancelled(cancel, report.phase)?;
        let (tx, rx) = outcome_channel(self.workers);
        let folder = tokio::spawn(run_folder(
            rx,
            Aggregator::new(TrafficClassifier::new(&config.options)),
        ));
        let workers = run_workers(
            self.store.as_ref(),
            processor.as_ref(),
            &config.source_account,
            &candidates,
            self.workers,
            tx,
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                folder.abort();
                warn!(phase = %report.phase, "Pass cancelled, discarding partial aggregation");
                return Err(RunError::Cancelled { phase: report.phase });
            }
            _ = workers => {}
        }
        let FoldResult {
            aggregator,
            succeeded,
            failures,
            ..
        } = folder.await?;

        report.phase = RunPhase::Aggregating;
        report.parsed = succeeded.len();
        report.failed = failures.len();
        let new_watermark = contiguous_watermark(
            marker
                .processed
                .iter()
                .map(|(name, ts)| (*ts, name.as_str()))
                .chain(
                    candidates
                        .iter()
                        .filter(|c| succeeded.contains(&c.name))
                        .map(|c| (c.timestamp, c.name.as_str())),
                ),
            failures.iter().map(|f| (f.object.timestamp, f.object.name.as_str())),
        );
        let rollups = aggregator.into_windows();
        debug!(windows = rollups.len(), watermark = ?new_watermark.map(|w| w.to_string()), "Aggregation complete");

        report.phase = RunPhase::Uploading;
        check_cancelled(cancel, report.phase)?;
        let uploader = Uploader::new(
            self.store.clone(),
            &config.dest_account,
            &config.dest_container,
            &config.name,
        );
        let token = uploader.upload(&rollups).await?;
        report.outputs = token.outputs.clone();
        report.superseded = token.superseded.clone();

        report.phase = RunPhase::Committing;
        let processed: Vec<&RawLogObject> = candidates
            .iter()
            .filter(|c| succeeded.contains(&c.name))
            .collect();
        let update = MarkerUpdate {
            newly_processed: processed.iter().map(|c| (c.name.clone(), c.timestamp)).collect(),
            new_watermark,
            failed: failures
                .iter()
                .map(|f| (f.object.name.clone(), f.object.timestamp, f.error.to_string()))
                .collect(),
            outputs: token.outputs,
            lookback_floor: bounds.floor,
            now,
        };
        let committed = self.progress.commit(&marker, update).await.map_err(RunError::Commit)?;
        report.committed = processed.len();
        report.watermark = committed.watermark;

        for (name, record) in committed.persistent_failures(self.failure_warn_threshold) {
            warn!(
                object = %name,
                attempts = record.attempts,
                first_failed = %record.first_failed,
                last_error = %record.last_error,
                "Object keeps failing to process"
            );
        }

        if config.unlink_log {
            report.phase = RunPhase::Deleting;
            for object in &processed {
                match self
                    .store
                    .delete(&config.source_account, &object.container, &object.name)
                    .await
                {
                    Ok(()) => report.unlinked += 1,
                    Err(e) if e.is_not_found() => {
                        debug!(object = %object.name, "Raw object already removed");
                        report.unlinked += 1;
                    }
                    Err(e) => {
                        warn!(object = %object.name, error = %e, "Failed to delete processed raw object");
                        report.unlink_failed += 1;
                    }
                }
            }
        }

        report.phase = RunPhase::Done;
        info!(
            selected = report.selected,
            parsed = report.parsed,
            failed = report.failed,
            committed = report.committed,
            outputs = report.outputs.len(),
            unlinked = report.unlinked,
            unlink_failed = report.unlink_failed,
            watermark = ?report.watermark.map(|w| w.to_string()),
            "Pass complete"
        );
        Ok(report)
    }
}

fn check_cancelled(cancel: &CancellationToken, phase: RunPhase) -> Result<(), RunError> {
    if cancel.is_cancelled() {
        warn!(phase = %phase, "Pass cancelled before completion");
        return Err(RunError::Cancelled { phase });
    }
    Ok(())
}

/// Highest timestamp of the processed objects that sort, by (timestamp,
/// name), before the first object still failing.
fn contiguous_watermark<'a>(
    processed: impl Iterator<Item = (LogTimestamp, &'a str)>,
    failed: impl Iterator<Item = (LogTimestamp, &'a str)>,
) -> Option<LogTimestamp> {
    let first_failure = failed.min();
    processed
        .filter(|entry| first_failure.map_or(true, |failure| *entry < failure))
        .map(|(timestamp, _)| timestamp)
        .max()
}
