use super::channel::{OutcomeReceiver, OutcomeSender};
use crate::aggregate::Aggregator;
use crate::plugin::{decode_object, LogProcessor, ParseError, ParsedRecord};
use crate::source::window::RawLogObject;
use crate::storage::traits::{ObjectStore, StorageError};
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why one raw object could not be processed. Never fatal for the pass.
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] StorageError),

    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),
}

/// Result of fetching and parsing one candidate, sent from a worker to the
/// folding task.
#[derive(Debug)]
pub struct ObjectOutcome {
    pub object: RawLogObject,
    pub result: Result<Vec<ParsedRecord>, ObjectError>,
}

#[derive(Debug)]
pub struct ObjectFailure {
    pub object: RawLogObject,
    pub error: ObjectError,
}

/// State handed back by the folding task once every outcome is in.
#[derive(Debug)]
pub struct FoldResult {
    pub aggregator: Aggregator,
    /// Names of objects that parsed and were folded.
    pub succeeded: BTreeSet<String>,
    pub failures: Vec<ObjectFailure>,
    pub records: usize,
}

/// Fetch and parse candidates with at most `workers` in flight, sending each
/// outcome to the folding task as it completes.
pub async fn run_workers(
    store: &dyn ObjectStore,
    processor: &dyn LogProcessor,
    account: &str,
    candidates: &[RawLogObject],
    workers: usize,
    output: OutcomeSender,
) {
    let mut outcomes = stream::iter(candidates.iter().cloned())
        .map(|object| async move {
            let result = fetch_and_parse(store, processor, account, &object).await;
            ObjectOutcome { object, result }
        })
        .buffer_unordered(workers.max(1));

    while let Some(outcome) = outcomes.next().await {
        if output.send(outcome).await.is_err() {
            warn!("Outcome channel closed, stopping workers");
            break;
        }
    }
}

async fn fetch_and_parse(
    store: &dyn ObjectStore,
    processor: &dyn LogProcessor,
    account: &str,
    object: &RawLogObject,
) -> Result<Vec<ParsedRecord>, ObjectError> {
    let data = store.get(account, &object.container, &object.name).await?;
    let data = decode_object(&object.name, data).await?;
    let records = processor.parse(object, &data)?;
    debug!(object = %object.name, records = records.len(), "Parsed object");
    Ok(records)
}

/// Single writer of the aggregation: folds outcomes until every worker is done.
pub async fn run_folder(mut input: OutcomeReceiver, mut aggregator: Aggregator) -> FoldResult {
    let mut succeeded = BTreeSet::new();
    let mut failures = Vec::new();
    let mut records = 0usize;

    while let Some(outcome) = input.recv().await {
        match outcome.result {
            Ok(parsed) => {
                records += parsed.len();
                if aggregator.fold(&outcome.object, parsed) {
                    succeeded.insert(outcome.object.name);
                } else {
                    debug!(object = %outcome.object.name, "Object already folded, ignoring duplicate");
                }
            }
            Err(error) => {
                warn!(
                    object = %outcome.object.name,
                    error = %error,
                    "Failed to process object, will retry next pass"
                );
                failures.push(ObjectFailure {
                    object: outcome.object,
                    error,
                });
            }
        }
    }

    info!(
        folded = succeeded.len(),
        failed = failures.len(),
        records,
        "Folding complete"
    );

    FoldResult {
        aggregator,
        succeeded,
        failures,
        records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::TrafficClassifier;
    use crate::pipeline::outcome_channel;
    use crate::plugin::stats::StatsLogProcessor;
    use crate::source::matcher::LogTimestamp;
    use crate::storage::memory::MemoryStore;
    use std::collections::BTreeMap;

    fn object(name: &str) -> RawLogObject {
        RawLogObject {
            container: "account_stats".to_string(),
            name: name.to_string(),
            size: 0,
            last_modified: None,
            timestamp: LogTimestamp::new(2024, 3, 15, 12),
            extras: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_workers_feed_single_folder() {
        let store = MemoryStore::new();
        let modified = chrono::Utc::now();
        store.insert("AUTH_test", "account_stats", "a", "\"AUTH_a\",1,2,3\n", modified);
        store.insert("AUTH_test", "account_stats", "b", "\"AUTH_a\",1,5,5\n", modified);
        store.insert("AUTH_test", "account_stats", "c", "not,a,number,row\n", modified);
        let candidates = vec![object("a"), object("b"), object("c"), object("missing")];

        let (tx, rx) = outcome_channel(1);
        let folder = tokio::spawn(run_folder(rx, Aggregator::new(TrafficClassifier::default())));
        run_workers(&store, &StatsLogProcessor::new(), "AUTH_test", &candidates, 3, tx).await;
        let result = folder.await.unwrap();

        assert_eq!(result.succeeded, BTreeSet::from(["a".to_string(), "b".to_string()]));
        assert_eq!(result.records, 2);
        assert_eq!(result.failures.len(), 2);
        assert!(result
            .failures
            .iter()
            .any(|f| f.object.name == "missing" && matches!(f.error, ObjectError::Fetch(_))));
        assert!(result
            .failures
            .iter()
            .any(|f| f.object.name == "c" && matches!(f.error, ObjectError::Parse(_))));

        let rows = result.aggregator.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].measures["object_count"], 7);
    }
}
