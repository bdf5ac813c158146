use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub global: GlobalConfig,
    /// One entry per configured plugin section, keyed by plugin name.
    pub plugins: BTreeMap<String, PluginSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub swift_account: String,
    pub storage: StorageConfig,
    #[serde(default = "default_marker_container")]
    pub marker_container: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default, with = "humantime_serde")]
    pub run_timeout: Option<Duration>,
    #[serde(default = "default_failure_warn_threshold")]
    pub failure_warn_threshold: u32,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_facility: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

fn default_marker_container() -> String {
    "log_processing_data".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_failure_warn_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    Filesystem {
        root: PathBuf,
    },
    Swift {
        storage_url: String,
        auth_token: String,
        #[serde(default = "default_storage_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
}

fn default_storage_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSection {
    pub class_path: String,
    /// Overrides the global account for this plugin.
    #[serde(default)]
    pub swift_account: Option<String>,
    pub source_container: String,
    /// Destination container for aggregated output.
    pub container_name: String,
    pub source_filename_pattern: String,
    /// Pattern for local file names under `log_dir`, when they differ from
    /// the stored object names.
    #[serde(default)]
    pub log_filename_pattern: Option<String>,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,
    #[serde(default)]
    pub lookback_window: Option<u32>,
    /// Seconds a raw object must age before it is eligible.
    #[serde(default = "default_new_log_cutoff")]
    pub new_log_cutoff: u64,
    #[serde(default)]
    pub unlink_log: bool,
    #[serde(default = "default_true")]
    pub processable: bool,
    /// Local staging directory: stats files are collected into it and log
    /// files are shipped from it.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Storage node device root walked by the stats collector.
    #[serde(default = "default_devices")]
    pub devices: PathBuf,
    #[serde(default = "default_true")]
    pub mount_check: bool,
    #[serde(default, with = "string_list")]
    pub service_ips: Vec<String>,
    #[serde(default, with = "string_list")]
    pub lb_private_ips: Vec<String>,
    #[serde(default, with = "string_list")]
    pub metadata_keys: Vec<String>,
}

fn default_lookback_hours() -> u32 {
    120
}

fn default_new_log_cutoff() -> u64 {
    7200
}

fn default_true() -> bool {
    true
}

fn default_devices() -> PathBuf {
    PathBuf::from("/srv/node")
}

// Lists accept either a YAML sequence or a comma-separated string
mod string_list {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrString {
        List(Vec<String>),
        Csv(String),
    }

    pub fn serialize<S>(values: &[String], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(values)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let values = match ListOrString::deserialize(deserializer)? {
            ListOrString::List(list) => list,
            ListOrString::Csv(csv) => csv.split(',').map(str::to_string).collect(),
        };

        Ok(values
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect())
    }
}
