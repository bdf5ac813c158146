//! Candidate selection for one plugin pass.
//!
//! Decides which raw objects in the source container are eligible: matched
//! by the filename pattern, inside the lookback range, old enough to be
//! complete, and not already recorded in the plugin's marker.

use crate::config::processor::ProcessorConfig;
use crate::source::matcher::LogTimestamp;
use crate::storage::checkpoint::ProcessedMarker;
use crate::storage::traits::{ObjectInfo, ObjectStore, StorageError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// One raw log artifact found in the source container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLogObject {
    pub container: String,
    pub name: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub timestamp: LogTimestamp,
    pub extras: BTreeMap<String, String>,
}

impl Ord for RawLogObject {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for RawLogObject {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Time bounds of a pass, derived from "now" and the plugin's settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    /// Earliest eligible window (inclusive).
    pub floor: LogTimestamp,
    /// Latest eligible window (inclusive).
    pub ceiling: LogTimestamp,
    /// Objects modified after this instant may still be in flight.
    pub cutoff: DateTime<Utc>,
}

impl WindowBounds {
    pub fn new(now: DateTime<Utc>, lookback_hours: u32, new_log_cutoff: std::time::Duration) -> Self {
        let oldest = now - ChronoDuration::hours(i64::from(lookback_hours));
        let cutoff = now
            - ChronoDuration::from_std(new_log_cutoff).unwrap_or_else(|_| ChronoDuration::zero());

        Self {
            floor: LogTimestamp::ceil(oldest),
            ceiling: LogTimestamp::floor(cutoff),
            cutoff,
        }
    }

    pub fn for_config(config: &ProcessorConfig, now: DateTime<Utc>) -> Self {
        Self::new(now, config.lookback_hours, config.new_log_cutoff)
    }

    fn classify(&self, timestamp: LogTimestamp, last_modified: Option<DateTime<Utc>>) -> Eligibility {
        if timestamp < self.floor {
            Eligibility::TooOld
        } else if timestamp > self.ceiling || last_modified.is_some_and(|lm| lm > self.cutoff) {
            Eligibility::TooNew
        } else {
            Eligibility::Eligible
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eligibility {
    Eligible,
    TooOld,
    TooNew,
}

/// Outcome of candidate selection, with counts for the run report.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Sorted by (timestamp, name).
    pub candidates: Vec<RawLogObject>,
    pub listed: usize,
    pub matched: usize,
    pub too_old: usize,
    pub too_new: usize,
    pub already_processed: usize,
    /// Eligible objects held back by `lookback_window`.
    pub deferred: usize,
}

/// Pick the eligible objects from a container listing.
pub fn select_candidates(
    config: &ProcessorConfig,
    marker: &ProcessedMarker,
    listing: Vec<ObjectInfo>,
    now: DateTime<Utc>,
) -> Selection {
    let bounds = WindowBounds::for_config(config, now);
    let mut selection = Selection {
        listed: listing.len(),
        ..Default::default()
    };

    let mut candidates = Vec::new();
    for info in listing {
        let Some(matched) = config.matcher.parse(&info.name) else {
            continue;
        };
        selection.matched += 1;

        match bounds.classify(matched.timestamp, info.last_modified) {
            Eligibility::TooOld => {
                selection.too_old += 1;
                continue;
            }
            Eligibility::TooNew => {
                selection.too_new += 1;
                continue;
            }
            Eligibility::Eligible => {}
        }

        if marker.is_processed(&info.name) {
            selection.already_processed += 1;
            continue;
        }

        candidates.push(RawLogObject {
            container: config.source_container.clone(),
            name: info.name,
            size: info.size,
            last_modified: info.last_modified,
            timestamp: matched.timestamp,
            extras: matched.extras,
        });
    }

    candidates.sort();

    // Retries of earlier failures ride along without using up the window
    // budget, so an object that keeps failing cannot hold back new hours
    if let Some(max_windows) = config.lookback_window {
        let allowed: BTreeSet<LogTimestamp> = candidates
            .iter()
            .filter(|c| !marker.failures.contains_key(&c.name))
            .map(|c| c.timestamp)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .take(max_windows as usize)
            .collect();
        let before = candidates.len();
        candidates
            .retain(|c| marker.failures.contains_key(&c.name) || allowed.contains(&c.timestamp));
        selection.deferred = before - candidates.len();
    }

    selection.candidates = candidates;
    selection
}

/// List the plugin's source container and select candidates from it.
pub async fn scan(
    store: &dyn ObjectStore,
    config: &ProcessorConfig,
    marker: &ProcessedMarker,
    now: DateTime<Utc>,
) -> Result<Selection, StorageError> {
    let listing = store
        .list(&config.source_account, &config.source_container, None)
        .await?;
    Ok(select_candidates(config, marker, listing, now))
}
