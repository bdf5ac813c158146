pub mod collect;
pub mod config;
pub mod run;
pub mod ship;
pub mod status;

use crate::config::{Config, ConfigError, ProcessorConfig};
use crate::plugin::PluginRegistry;

/// Sections a local step acts on: the named ones, or else every section
/// `applies` accepts.
fn local_targets(
    config: &Config,
    plugins: &[String],
    applies: impl Fn(&ProcessorConfig) -> bool,
) -> Result<Vec<ProcessorConfig>, ConfigError> {
    let processors = config.select_processors(&PluginRegistry::with_builtins(), plugins)?;
    if plugins.is_empty() {
        Ok(processors.into_iter().filter(|p| applies(p)).collect())
    } else {
        Ok(processors)
    }
}

fn print_report<T: serde::Serialize>(plugin: &str, report: &T) {
    match serde_json::to_string(report) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::error!(plugin = %plugin, error = %e, "Failed to serialize report"),
    }
}
