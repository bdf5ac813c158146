//! Folding parsed records into per-key totals.
//!
//! Rows are keyed by (window, account, container, traffic class). Measures
//! sum, so the result depends only on the set of folded objects and never on
//! the order they arrive in.

pub mod classify;

use crate::plugin::ParsedRecord;
use crate::source::matcher::LogTimestamp;
use crate::source::window::RawLogObject;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub use classify::{TrafficClass, TrafficClassifier};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub window: LogTimestamp,
    pub account: String,
    pub container: Option<String>,
    pub traffic_class: TrafficClass,
}

/// Merged totals for one key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregationRow {
    #[serde(flatten)]
    pub key: RecordKey,
    pub measures: BTreeMap<String, u64>,
    /// Raw objects that contributed to this row.
    pub sources: BTreeSet<String>,
}

impl AggregationRow {
    fn new(key: RecordKey) -> Self {
        Self {
            key,
            measures: BTreeMap::new(),
            sources: BTreeSet::new(),
        }
    }
}

/// Everything aggregated for one hourly window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRollup {
    pub window: LogTimestamp,
    /// Every object folded into this window, including ones with no records.
    pub sources: BTreeSet<String>,
    pub rows: Vec<AggregationRow>,
}

/// One object's records, already summed per key.
#[derive(Debug, Clone)]
struct Contribution {
    window: LogTimestamp,
    totals: BTreeMap<RecordKey, BTreeMap<String, u64>>,
}

/// Accumulates contributions keyed by raw object name, so an object is
/// counted once however many times it arrives.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    classifier: TrafficClassifier,
    objects: BTreeMap<String, Contribution>,
}

impl Aggregator {
    pub fn new(classifier: TrafficClassifier) -> Self {
        Self {
            classifier,
            objects: BTreeMap::new(),
        }
    }

    /// Fold one object's records. Returns false, folding nothing, if the
    /// object was already folded.
    pub fn fold(&mut self, object: &RawLogObject, records: Vec<ParsedRecord>) -> bool {
        if self.objects.contains_key(&object.name) {
            return false;
        }

        let mut contribution = Contribution {
            window: object.timestamp,
            totals: BTreeMap::new(),
        };
        for record in records {
            let key = RecordKey {
                window: object.timestamp,
                traffic_class: self.classifier.classify(record.client_ip, record.lb_ip),
                account: record.account,
                container: record.container,
            };
            let measures = contribution.totals.entry(key).or_default();
            for (name, value) in record.measures {
                let total = measures.entry(name).or_insert(0);
                *total = total.saturating_add(value);
            }
        }

        self.objects.insert(object.name.clone(), contribution);
        true
    }

    /// Merge another aggregator's objects into this one. Objects already
    /// folded here are skipped.
    pub fn merge(&mut self, other: Aggregator) {
        for (name, contribution) in other.objects {
            self.objects.entry(name).or_insert(contribution);
        }
    }

    pub fn is_folded(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Current totals, sorted by key.
    pub fn rows(&self) -> Vec<AggregationRow> {
        let mut rows: BTreeMap<RecordKey, AggregationRow> = BTreeMap::new();
        for (name, contribution) in &self.objects {
            for (key, measures) in &contribution.totals {
                let row = rows
                    .entry(key.clone())
                    .or_insert_with(|| AggregationRow::new(key.clone()));
                for (measure, value) in measures {
                    let total = row.measures.entry(measure.clone()).or_insert(0);
                    *total = total.saturating_add(*value);
                }
                row.sources.insert(name.clone());
            }
        }
        rows.into_values().collect()
    }

    /// Finish aggregation, one rollup per window in ascending order.
    pub fn into_windows(self) -> Vec<WindowRollup> {
        let mut windows: BTreeMap<LogTimestamp, WindowRollup> = BTreeMap::new();
        for (name, contribution) in &self.objects {
            windows
                .entry(contribution.window)
                .or_insert_with(|| WindowRollup {
                    window: contribution.window,
                    sources: BTreeSet::new(),
                    rows: Vec::new(),
                })
                .sources
                .insert(name.clone());
        }
        for row in self.rows() {
            if let Some(rollup) = windows.get_mut(&row.key.window) {
                rollup.rows.push(row);
            }
        }
        windows.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::processor::PluginOptions;
    use std::net::IpAddr;

    fn object(name: &str, hour: u32) -> RawLogObject {
        RawLogObject {
            container: "log_data".to_string(),
            name: name.to_string(),
            size: 0,
            last_modified: None,
            timestamp: LogTimestamp::new(2024, 3, 15, hour),
            extras: BTreeMap::new(),
        }
    }

    fn record(account: &str, container: Option<&str>, origin: &str, requests: u64, bytes: u64) -> ParsedRecord {
        let mut record = ParsedRecord::new(account, container.map(str::to_string))
            .with_measure("requests", requests)
            .with_measure("bytes_out", bytes);
        record.client_ip = Some(origin.parse::<IpAddr>().unwrap());
        record
    }

    fn classifier() -> TrafficClassifier {
        TrafficClassifier::new(&PluginOptions {
            service_ips: vec!["10.0.0.1".parse().unwrap()],
            ..Default::default()
        })
    }

    fn inputs() -> Vec<(RawLogObject, Vec<ParsedRecord>)> {
        vec![
            (
                object("2024031512-shard1", 12),
                vec![
                    record("AUTH_a", Some("c1"), "1.2.3.4", 1, 100),
                    record("AUTH_a", Some("c1"), "10.0.0.1", 1, 50),
                ],
            ),
            (
                object("2024031512-shard2", 12),
                vec![record("AUTH_a", Some("c1"), "5.6.7.8", 2, 10)],
            ),
            (
                object("2024031513-shard1", 13),
                vec![record("AUTH_b", None, "1.2.3.4", 1, 1)],
            ),
        ]
    }

    fn totals(aggregator: &Aggregator) -> Vec<(RecordKey, BTreeMap<String, u64>)> {
        aggregator
            .rows()
            .into_iter()
            .map(|row| (row.key, row.measures))
            .collect()
    }

    #[test]
    fn test_same_key_from_two_shards_merges() {
        let mut aggregator = Aggregator::new(classifier());
        for (object, records) in inputs() {
            assert!(aggregator.fold(&object, records));
        }

        let windows = aggregator.into_windows();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].window, LogTimestamp::new(2024, 3, 15, 12));
        assert_eq!(windows[0].sources.len(), 2);

        let public = windows[0]
            .rows
            .iter()
            .find(|r| r.key.traffic_class == TrafficClass::Public)
            .unwrap();
        assert_eq!(public.measures["requests"], 3);
        assert_eq!(public.measures["bytes_out"], 110);
        assert_eq!(public.sources.len(), 2);

        let servicenet = windows[0]
            .rows
            .iter()
            .find(|r| r.key.traffic_class == TrafficClass::Servicenet)
            .unwrap();
        assert_eq!(servicenet.measures["bytes_out"], 50);

        assert_eq!(windows[1].rows.len(), 1);
        assert_eq!(windows[1].rows[0].key.container, None);
    }

    #[test]
    fn test_duplicate_object_is_folded_once() {
        let mut aggregator = Aggregator::new(classifier());
        let (object, records) = inputs().remove(1);
        assert!(aggregator.fold(&object, records.clone()));
        assert!(!aggregator.fold(&object, records));

        let row = aggregator.rows().remove(0);
        assert_eq!(row.measures["requests"], 2);
        assert_eq!(aggregator.object_count(), 1);
    }

    #[test]
    fn test_fold_order_does_not_matter() {
        let mut forward = Aggregator::new(classifier());
        for (object, records) in inputs() {
            forward.fold(&object, records);
        }

        let mut backward = Aggregator::new(classifier());
        for (object, records) in inputs().into_iter().rev() {
            backward.fold(&object, records);
        }

        assert_eq!(totals(&forward), totals(&backward));
        assert_eq!(forward.into_windows(), backward.into_windows());
    }

    #[test]
    fn test_merging_partitions_in_either_order() {
        let build = |range: std::ops::Range<usize>| {
            let mut aggregator = Aggregator::new(classifier());
            for (object, records) in inputs().drain(range) {
                aggregator.fold(&object, records);
            }
            aggregator
        };

        let mut left_first = build(0..1);
        left_first.merge(build(1..3));
        let mut right_first = build(1..3);
        right_first.merge(build(0..1));

        assert_eq!(totals(&left_first), totals(&right_first));
        assert_eq!(left_first.object_count(), 3);
    }

    #[test]
    fn test_merge_skips_objects_already_folded() {
        let mut a = Aggregator::new(classifier());
        let mut b = Aggregator::new(classifier());
        for (object, records) in inputs() {
            a.fold(&object, records.clone());
            b.fold(&object, records);
        }
        let expected = totals(&a);
        a.merge(b);
        assert_eq!(totals(&a), expected);
    }

    #[test]
    fn test_huge_measures_saturate() {
        let mut aggregator = Aggregator::new(classifier());
        aggregator.fold(
            &object("2024031512-shard1", 12),
            vec![
                record("AUTH_a", Some("c1"), "1.2.3.4", 1, u64::MAX - 1),
                record("AUTH_a", Some("c1"), "1.2.3.4", 1, 10),
            ],
        );
        aggregator.fold(
            &object("2024031512-shard2", 12),
            vec![record("AUTH_a", Some("c1"), "1.2.3.4", 1, u64::MAX)],
        );

        let row = aggregator.rows().remove(0);
        assert_eq!(row.measures["bytes_out"], u64::MAX);
        assert_eq!(row.measures["requests"], 3);
    }

    #[test]
    fn test_object_without_records_still_counts_as_source() {
        let mut aggregator = Aggregator::new(classifier());
        aggregator.fold(&object("2024031512-empty", 12), Vec::new());

        let windows = aggregator.into_windows();
        assert_eq!(windows.len(), 1);
        assert!(windows[0].rows.is_empty());
        assert!(windows[0].sources.contains("2024031512-empty"));
    }
}
