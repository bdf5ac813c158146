use crate::config::{Config, ConfigError};
use crate::pipeline::{Orchestrator, PluginOutcome};
use crate::plugin::PluginRegistry;
use crate::storage::{build_store, StorageError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Run one pass for each selected plugin. Returns true if every pass
/// succeeded.
pub async fn run(
    config: &Config,
    plugins: &[String],
    now: Option<DateTime<Utc>>,
) -> Result<bool, CliRunError> {
    let registry = PluginRegistry::with_builtins();
    let processors = config.select_processors(&registry, plugins)?;
    let store = build_store(&config.global.storage)?;
    let orchestrator = Arc::new(Orchestrator::new(store, &config.global, registry));

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(watch_for_cancel(cancel.clone(), config.global.run_timeout));

    let now = now.unwrap_or_else(Utc::now);
    info!(
        plugins = processors.len(),
        now = %now,
        workers = config.global.workers,
        "Starting passes"
    );

    let outcomes = orchestrator.run_all(processors, now, cancel).await;
    watcher.abort();

    Ok(report(&outcomes))
}

async fn watch_for_cancel(cancel: CancellationToken, timeout: Option<Duration>) {
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, cancelling passes");
        }
        _ = deadline => {
            warn!(timeout = ?timeout, "Run timeout reached, cancelling passes");
        }
    }
    cancel.cancel();
}

fn report(outcomes: &[PluginOutcome]) -> bool {
    let mut all_ok = true;
    for outcome in outcomes {
        match &outcome.result {
            Ok(report) => match serde_json::to_string(report) {
                Ok(line) => println!("{}", line),
                Err(e) => error!(plugin = %outcome.plugin, error = %e, "Failed to serialize run report"),
            },
            Err(e) => {
                all_ok = false;
                eprintln!("{}: pass failed: {}", outcome.plugin, e);
            }
        }
    }

    info!(
        plugins = outcomes.len(),
        failed = outcomes.iter().filter(|o| o.result.is_err()).count(),
        "All passes finished"
    );
    all_ok
}
