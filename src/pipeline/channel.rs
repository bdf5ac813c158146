//! Bounded hand-off between fetch/parse workers and the folding task.

use super::runner::ObjectOutcome;
use tokio::sync::mpsc;

pub type OutcomeSender = mpsc::Sender<ObjectOutcome>;
pub type OutcomeReceiver = mpsc::Receiver<ObjectOutcome>;

/// Outcomes buffered per worker before workers wait on the folder.
const OUTCOMES_PER_WORKER: usize = 2;

pub fn outcome_channel(workers: usize) -> (OutcomeSender, OutcomeReceiver) {
    mpsc::channel(workers.max(1) * OUTCOMES_PER_WORKER)
}
