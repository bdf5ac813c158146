use super::types::{GlobalConfig, PluginSection};
use crate::plugin::registry::PluginRegistry;
use crate::source::matcher::FilenameMatcher;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Plugin-specific settings handed to the plugin factory, the classifier and
/// the local collect and ship steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginOptions {
    pub log_dir: Option<PathBuf>,
    pub devices: PathBuf,
    pub mount_check: bool,
    pub service_ips: Vec<IpAddr>,
    pub lb_private_ips: Vec<IpAddr>,
    pub metadata_keys: Vec<String>,
}

/// Validated, immutable settings for one plugin section.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub name: String,
    pub class_path: String,
    pub source_account: String,
    pub source_container: String,
    pub dest_account: String,
    pub dest_container: String,
    pub matcher: FilenameMatcher,
    /// Matches local files to ship; falls back to `matcher`.
    pub log_matcher: Option<FilenameMatcher>,
    pub lookback_hours: u32,
    /// Maximum number of hourly windows processed per pass.
    pub lookback_window: Option<u32>,
    pub new_log_cutoff: Duration,
    pub unlink_log: bool,
    pub processable: bool,
    pub options: PluginOptions,
}

impl ProcessorConfig {
    /// Build a processor config, appending every problem found to `errors`.
    ///
    /// `class_path` is only checked when a registry is given. Returns None if
    /// any problem was found for this section.
    pub fn from_section(
        name: &str,
        section: &PluginSection,
        global: &GlobalConfig,
        registry: Option<&PluginRegistry>,
        errors: &mut Vec<String>,
    ) -> Option<Self> {
        let prefix = format!("plugin '{}'", name);
        let start = errors.len();

        if name.is_empty() || name.contains('/') {
            errors.push(format!("{}: plugin names must be non-empty and contain no '/'", prefix));
        }

        if let Some(registry) = registry {
            if !registry.contains(&section.class_path) {
                errors.push(format!(
                    "{}: unknown class_path '{}' (known: {})",
                    prefix,
                    section.class_path,
                    registry.class_paths().join(", ")
                ));
            }
        }

        let account = section
            .swift_account
            .clone()
            .unwrap_or_else(|| global.swift_account.clone());
        if account.is_empty() {
            errors.push(format!("{}: swift_account is empty", prefix));
        }
        if section.source_container.is_empty() {
            errors.push(format!("{}: source_container is empty", prefix));
        }
        if section.container_name.is_empty() {
            errors.push(format!("{}: container_name is empty", prefix));
        }

        if section.lookback_hours == 0 {
            errors.push(format!("{}: lookback_hours must be greater than 0", prefix));
        }
        if section.lookback_window == Some(0) {
            errors.push(format!("{}: lookback_window must be greater than 0 when set", prefix));
        }
        if section.unlink_log && !section.processable {
            errors.push(format!(
                "{}: unlink_log requires processable (raw objects would be deleted unaggregated)",
                prefix
            ));
        }

        let matcher = match FilenameMatcher::new(&section.source_filename_pattern) {
            Ok(matcher) => Some(matcher),
            Err(e) => {
                errors.push(format!(
                    "{}: invalid source_filename_pattern '{}': {}",
                    prefix, section.source_filename_pattern, e
                ));
                None
            }
        };

        let log_matcher = match section.log_filename_pattern.as_deref().map(FilenameMatcher::new) {
            None => None,
            Some(Ok(matcher)) => Some(matcher),
            Some(Err(e)) => {
                errors.push(format!(
                    "{}: invalid log_filename_pattern '{}': {}",
                    prefix,
                    section.log_filename_pattern.as_deref().unwrap_or_default(),
                    e
                ));
                None
            }
        };

        let service_ips = parse_ips(&prefix, "service_ips", &section.service_ips, errors);
        let lb_private_ips = parse_ips(&prefix, "lb_private_ips", &section.lb_private_ips, errors);

        if errors.len() > start {
            return None;
        }

        Some(Self {
            name: name.to_string(),
            class_path: section.class_path.clone(),
            source_account: account.clone(),
            source_container: section.source_container.clone(),
            dest_account: account,
            dest_container: section.container_name.clone(),
            matcher: matcher?,
            log_matcher,
            lookback_hours: section.lookback_hours,
            lookback_window: section.lookback_window,
            new_log_cutoff: Duration::from_secs(section.new_log_cutoff),
            unlink_log: section.unlink_log,
            processable: section.processable,
            options: PluginOptions {
                log_dir: section.log_dir.clone(),
                devices: section.devices.clone(),
                mount_check: section.mount_check,
                service_ips,
                lb_private_ips,
                metadata_keys: section.metadata_keys.clone(),
            },
        })
    }
}

fn parse_ips(prefix: &str, field: &str, values: &[String], errors: &mut Vec<String>) -> Vec<IpAddr> {
    values
        .iter()
        .filter_map(|value| match value.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                errors.push(format!("{}: {} contains invalid address '{}'", prefix, field, value));
                None
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub const ACCESS_PATTERN: &str =
        r"(?P<year>[0-9]{4})(?P<month>[0-1][0-9])(?P<day>[0-3][0-9])(?P<hour>[0-2][0-9]).*$";

    pub fn processor_config(name: &str) -> ProcessorConfig {
        ProcessorConfig {
            name: name.to_string(),
            class_path: "access".to_string(),
            source_account: "AUTH_test".to_string(),
            source_container: "log_data".to_string(),
            dest_account: "AUTH_test".to_string(),
            dest_container: "rollups".to_string(),
            matcher: FilenameMatcher::new(ACCESS_PATTERN).unwrap(),
            log_matcher: None,
            lookback_hours: 120,
            lookback_window: None,
            new_log_cutoff: Duration::from_secs(0),
            unlink_log: false,
            processable: true,
            options: PluginOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::StorageConfig;

    fn global() -> GlobalConfig {
        serde_yaml::from_str(
            "swift_account: AUTH_ops\nstorage:\n  backend: filesystem\n  root: /tmp/objects\n",
        )
        .unwrap()
    }

    fn section() -> PluginSection {
        serde_yaml::from_str(&format!(
            "class_path: access\nsource_container: log_data\ncontainer_name: rollups\nsource_filename_pattern: '{}'\n",
            test_support::ACCESS_PATTERN
        ))
        .unwrap()
    }

    #[test]
    fn test_valid_section() {
        let mut errors = Vec::new();
        let config = ProcessorConfig::from_section(
            "access",
            &section(),
            &global(),
            Some(&PluginRegistry::with_builtins()),
            &mut errors,
        )
        .unwrap();

        assert!(errors.is_empty());
        assert_eq!(config.source_account, "AUTH_ops");
        assert_eq!(config.dest_container, "rollups");
        assert_eq!(config.new_log_cutoff, Duration::from_secs(7200));
        assert!(matches!(global().storage, StorageConfig::Filesystem { .. }));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut section = section();
        section.class_path = "nope.Processor".to_string();
        section.source_filename_pattern = r"(?P<year>\d{4})".to_string();
        section.lookback_hours = 0;
        section.service_ips = vec!["10.0.0.300".to_string()];
        section.unlink_log = true;
        section.processable = false;

        let mut errors = Vec::new();
        let config = ProcessorConfig::from_section(
            "access",
            &section,
            &global(),
            Some(&PluginRegistry::with_builtins()),
            &mut errors,
        );

        assert!(config.is_none());
        assert_eq!(errors.len(), 5, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("unknown class_path")));
        assert!(errors.iter().any(|e| e.contains("missing 'month'")));
        assert!(errors.iter().any(|e| e.contains("10.0.0.300")));
    }

    #[test]
    fn test_account_override() {
        let mut section = section();
        section.swift_account = Some("AUTH_other".to_string());
        let mut errors = Vec::new();
        let config = ProcessorConfig::from_section(
            "access",
            &section,
            &global(),
            Some(&PluginRegistry::with_builtins()),
            &mut errors,
        )
        .unwrap();
        assert_eq!(config.source_account, "AUTH_other");
        assert_eq!(config.dest_account, "AUTH_other");
    }

    #[test]
    fn test_log_filename_pattern() {
        let mut section = section();
        section.log_filename_pattern =
            Some(r"stats-(?P<year>\d{4})(?P<month>\d{2})(?P<day>\d{2})(?P<hour>\d{2})_".to_string());
        let mut errors = Vec::new();
        let config =
            ProcessorConfig::from_section("access", &section, &global(), None, &mut errors).unwrap();
        let local = config.log_matcher.unwrap().parse("stats-2024031512_abc").unwrap();
        assert_eq!(local.timestamp.to_string(), "2024031512");

        section.log_filename_pattern = Some(r"stats-(?P<year>\d{4})".to_string());
        let mut errors = Vec::new();
        assert!(ProcessorConfig::from_section("access", &section, &global(), None, &mut errors).is_none());
        assert!(errors[0].contains("log_filename_pattern"), "{:?}", errors);
    }
}
