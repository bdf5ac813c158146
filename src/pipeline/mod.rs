pub mod channel;
pub mod orchestrator;
pub mod runner;

pub use channel::{outcome_channel, OutcomeReceiver, OutcomeSender};
pub use orchestrator::{Orchestrator, PluginOutcome, RunError, RunPhase, RunReport};
pub use runner::{run_folder, run_workers, FoldResult, ObjectError, ObjectOutcome};
