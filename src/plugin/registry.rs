use super::access::AccessLogProcessor;
use super::stats::{ContainerStatsProcessor, StatsLogProcessor};
use super::LogProcessor;
use crate::config::processor::PluginOptions;
use crate::config::ConfigError;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type ProcessorFactory = Arc<dyn Fn(&PluginOptions) -> Arc<dyn LogProcessor> + Send + Sync>;

/// Resolves a section's `class_path` to a processor implementation.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, ProcessorFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in processors under their short names and
    /// their legacy dotted class paths.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        let access: ProcessorFactory = Arc::new(access_processor);
        registry.register("access", access.clone());
        registry.register("slogging.access_processor.AccessLogProcessor", access);

        let stats: ProcessorFactory = Arc::new(stats_processor);
        registry.register("stats", stats.clone());
        registry.register("slogging.stats_processor.StatsLogProcessor", stats);

        let container_stats: ProcessorFactory = Arc::new(container_stats_processor);
        registry.register("container_stats", container_stats.clone());
        registry.register(
            "slogging.stats_processor.ContainerStatsProcessor",
            container_stats,
        );

        registry
    }

    pub fn register(&mut self, class_path: &str, factory: ProcessorFactory) {
        self.factories.insert(class_path.to_string(), factory);
    }

    pub fn contains(&self, class_path: &str) -> bool {
        self.factories.contains_key(class_path)
    }

    pub fn class_paths(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn create(
        &self,
        class_path: &str,
        options: &PluginOptions,
    ) -> Result<Arc<dyn LogProcessor>, ConfigError> {
        self.factories
            .get(class_path)
            .map(|factory| factory(options))
            .ok_or_else(|| ConfigError::UnknownPlugin(class_path.to_string()))
    }
}

fn access_processor(_options: &PluginOptions) -> Arc<dyn LogProcessor> {
    Arc::new(AccessLogProcessor::new())
}

fn stats_processor(_options: &PluginOptions) -> Arc<dyn LogProcessor> {
    Arc::new(StatsLogProcessor::new())
}

fn container_stats_processor(options: &PluginOptions) -> Arc<dyn LogProcessor> {
    Arc::new(ContainerStatsProcessor::new(&options.metadata_keys))
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("class_paths", &self.class_paths())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_resolve_by_both_names() {
        let registry = PluginRegistry::with_builtins();
        for class_path in [
            "access",
            "stats",
            "container_stats",
            "slogging.access_processor.AccessLogProcessor",
            "slogging.stats_processor.StatsLogProcessor",
            "slogging.stats_processor.ContainerStatsProcessor",
        ] {
            assert!(registry.contains(class_path), "{}", class_path);
            assert!(registry.create(class_path, &PluginOptions::default()).is_ok());
        }
    }

    #[test]
    fn test_unknown_class_path() {
        let registry = PluginRegistry::with_builtins();
        let err = registry
            .create("nope.Processor", &PluginOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::UnknownPlugin(name) if name == "nope.Processor"));
    }
}
