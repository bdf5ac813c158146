pub mod generate;
pub mod parse;
pub mod processor;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub use parse::{load_config, parse_config_str, ConfigError};
pub use processor::{PluginOptions, ProcessorConfig};
pub use types::{Config, GlobalConfig, PluginSection, StorageConfig};

const SYSTEM_CONFIG: &str = "/etc/logroll/config.yml";

/// Matches `$env{NAME}` references in raw config text.
pub(crate) fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern compiles")
    })
}

/// Replace `$env{NAME}` with the variable's value. Unset variables are left
/// in place so validation can name them.
pub fn expand_env_vars(text: &str) -> String {
    env_var_pattern()
        .replace_all(text, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Replace a leading `~` component with the home directory, if known.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) if rest.as_os_str().is_empty() => home,
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Where a config is looked for when `--config` is not given, in order.
pub fn default_config_paths() -> Vec<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".config/logroll/config.yml"))
        .into_iter()
        .chain(std::iter::once(PathBuf::from(SYSTEM_CONFIG)))
        .collect()
}

/// An explicit path always wins; otherwise the first default that exists.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(expand_tilde(path)),
        None => default_config_paths().into_iter().find(|path| path.exists()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars_single() {
        std::env::set_var("LOGROLL_TEST_VAR", "test_value");
        let result = expand_env_vars("token: $env{LOGROLL_TEST_VAR}");
        assert_eq!(result, "token: test_value");
        std::env::remove_var("LOGROLL_TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_unset() {
        let result = expand_env_vars("path/$env{LOGROLL_NONEXISTENT_VAR}/file");
        assert_eq!(result, "path/$env{LOGROLL_NONEXISTENT_VAR}/file");
    }

    #[test]
    fn test_expand_env_vars_repeated() {
        std::env::set_var("LOGROLL_TEST_REPEATED", "x");
        let result = expand_env_vars("$env{LOGROLL_TEST_REPEATED}/$env{LOGROLL_TEST_REPEATED}");
        assert_eq!(result, "x/x");
    }

    #[test]
    fn test_expand_tilde_with_path() {
        let expanded = expand_tilde(Path::new("~/objects"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("objects"));
        }
    }

    #[test]
    fn test_expand_tilde_leaves_other_paths() {
        assert_eq!(expand_tilde(Path::new("/srv/node")), Path::new("/srv/node"));
        assert_eq!(expand_tilde(Path::new("~other/x")), Path::new("~other/x"));
    }

    #[test]
    fn test_system_config_is_last_default() {
        assert_eq!(default_config_paths().last(), Some(&PathBuf::from(SYSTEM_CONFIG)));
    }

    #[test]
    fn test_explicit_config_path_wins() {
        let resolved = resolve_config_path(Some(Path::new("/opt/logroll.yml")));
        assert_eq!(resolved, Some(PathBuf::from("/opt/logroll.yml")));
    }
}
