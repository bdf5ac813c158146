use super::{local_targets, print_report};
use crate::cli::run::CliRunError;
use crate::collect::{DatabaseStatsCollector, StatsKind};
use crate::config::Config;
use chrono::{DateTime, Utc};
use tracing::{error, info};

/// Write one stats file per selected stats plugin. Without `--plugin`, every
/// stats section with a `log_dir` is collected. Returns true if every
/// collection succeeded.
pub async fn collect(
    config: &Config,
    plugins: &[String],
    now: Option<DateTime<Utc>>,
) -> Result<bool, CliRunError> {
    let targets = local_targets(config, plugins, |p| {
        StatsKind::for_class_path(&p.class_path).is_some() && p.options.log_dir.is_some()
    })?;
    let now = now.unwrap_or_else(Utc::now);
    if targets.is_empty() {
        info!("No stats plugin has a log_dir, nothing to collect");
    }

    let mut all_ok = true;
    for processor in &targets {
        let result = match DatabaseStatsCollector::new(processor) {
            Ok(collector) => collector.collect(now).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(report) => print_report(&processor.name, &report),
            Err(e) => {
                all_ok = false;
                error!(plugin = %processor.name, error = %e, "Stats collection failed");
                eprintln!("{}: collect failed: {}", processor.name, e);
            }
        }
    }
    Ok(all_ok)
}
