use super::{local_targets, print_report};
use crate::cli::run::CliRunError;
use crate::collect::LogShipper;
use crate::config::Config;
use crate::storage::build_store;
use chrono::{DateTime, Utc};
use tracing::{error, info};

/// Upload local log files for each selected plugin. Without `--plugin`,
/// every section with a `log_dir` ships. Returns true if every plugin
/// shipped without error.
pub async fn ship(
    config: &Config,
    plugins: &[String],
    now: Option<DateTime<Utc>>,
) -> Result<bool, CliRunError> {
    let targets = local_targets(config, plugins, |p| p.options.log_dir.is_some())?;
    if targets.is_empty() {
        info!("No plugin has a log_dir, nothing to ship");
        return Ok(true);
    }
    let store = build_store(&config.global.storage)?;
    let now = now.unwrap_or_else(Utc::now);

    let mut all_ok = true;
    for processor in &targets {
        let result = match LogShipper::new(store.clone(), processor) {
            Ok(shipper) => shipper.ship(now).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(report) => print_report(&processor.name, &report),
            Err(e) => {
                all_ok = false;
                error!(plugin = %processor.name, error = %e, "Shipping failed");
                eprintln!("{}: ship failed: {}", processor.name, e);
            }
        }
    }
    Ok(all_ok)
}
