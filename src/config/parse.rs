use super::processor::ProcessorConfig;
use super::types::*;
use crate::config::{env_var_pattern, expand_env_vars, expand_tilde};
use crate::plugin::registry::PluginRegistry;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),
}

/// Load, expand and validate a config file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    // YAML errors are reported against the file they came from
    parse_config_str(&yaml).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parse and validate configuration from a YAML string.
pub fn parse_config_str(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    expand_paths(&mut config);

    validate_config(&config)?;
    Ok(config)
}

impl Config {
    /// Build the validated processor config for every plugin section.
    pub fn processors(&self, registry: &PluginRegistry) -> Result<Vec<ProcessorConfig>, ConfigError> {
        let mut errors = Vec::new();
        let processors: Vec<ProcessorConfig> = self
            .plugins
            .iter()
            .filter_map(|(name, section)| {
                ProcessorConfig::from_section(name, section, &self.global, Some(registry), &mut errors)
            })
            .collect();

        if errors.is_empty() {
            Ok(processors)
        } else {
            Err(ConfigError::ValidationList(errors))
        }
    }

    /// Processor configs for the named plugins only, in the order given.
    pub fn select_processors(
        &self,
        registry: &PluginRegistry,
        names: &[String],
    ) -> Result<Vec<ProcessorConfig>, ConfigError> {
        let all = self.processors(registry)?;
        if names.is_empty() {
            return Ok(all);
        }

        names
            .iter()
            .map(|name| {
                all.iter()
                    .find(|p| &p.name == name)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownPlugin(name.clone()))
            })
            .collect()
    }
}

/// Any `$env{NAME}` still present after expansion names an unset variable.
fn check_unexpanded_vars(yaml: &str) -> Result<(), ConfigError> {
    let unset: BTreeSet<&str> = env_var_pattern()
        .captures_iter(yaml)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();

    if unset.is_empty() {
        return Ok(());
    }

    Err(ConfigError::Validation(format!(
        "environment variables are not set: {}",
        unset.into_iter().collect::<Vec<_>>().join(", ")
    )))
}

fn expand_paths(config: &mut Config) {
    if let StorageConfig::Filesystem { root } = &mut config.global.storage {
        *root = expand_tilde(root);
    }
    if let Some(log_dir) = &mut config.global.log_dir {
        *log_dir = expand_tilde(log_dir);
    }
    for section in config.plugins.values_mut() {
        section.devices = expand_tilde(&section.devices);
        if let Some(log_dir) = &mut section.log_dir {
            *log_dir = expand_tilde(log_dir);
        }
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_global(&config.global, &mut errors);

    if config.plugins.is_empty() {
        errors.push("config must define at least one plugin section under 'plugins'".to_string());
    }

    // class_path is resolved later against the registry the caller runs with
    for (name, section) in &config.plugins {
        ProcessorConfig::from_section(name, section, &config.global, None, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_global(global: &GlobalConfig, errors: &mut Vec<String>) {
    if global.swift_account.is_empty() {
        errors.push("global.swift_account cannot be empty".to_string());
    }
    if global.marker_container.is_empty() {
        errors.push("global.marker_container cannot be empty".to_string());
    }
    if global.workers == 0 {
        errors.push("global.workers must be greater than 0".to_string());
    }
    if global.failure_warn_threshold == 0 {
        errors.push("global.failure_warn_threshold must be greater than 0".to_string());
    }
    if let Some(level) = &global.log_level {
        let known = ["trace", "debug", "info", "warn", "warning", "error"];
        if !known.contains(&level.to_lowercase().as_str()) {
            errors.push(format!("global.log_level '{}' is not a known level", level));
        }
    }

    match &global.storage {
        StorageConfig::Filesystem { root } => {
            if root.as_os_str().is_empty() {
                errors.push("global.storage.root cannot be empty".to_string());
            }
        }
        StorageConfig::Swift {
            storage_url,
            auth_token,
            ..
        } => {
            if storage_url.is_empty() {
                errors.push("global.storage.storage_url cannot be empty".to_string());
            }
            if auth_token.is_empty() {
                errors.push("global.storage.auth_token cannot be empty".to_string());
            }
        }
    }
}
