//! Account and container usage gathered from storage node databases.
//!
//! Every `.db` file under `<devices>/<device>/accounts` (or `containers`) is
//! read once and summarized as one CSV row. A run writes a single file into
//! the plugin's `log_dir`, named `stats-YYYYMMDDHH_<digest>` for accounts or
//! `container-stats-YYYYMMDDHH_<digest>` for containers. The layout is the
//! one the stats processors parse.

use crate::config::processor::ProcessorConfig;
use crate::plugin::quote;
use crate::plugin::stats::{title_case, META_PREFIX};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const CONTAINER_HEADER: &str = "Account Hash,Container Name,Object Count,Bytes Used";

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("plugin '{0}' does not read database stats")]
    NotStats(String),

    #[error("plugin '{0}' has no log_dir")]
    NoLogDir(String),

    #[error("failed to read devices directory {path}: {source}")]
    Devices { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("stats collection task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsKind {
    Account,
    Container,
}

impl StatsKind {
    /// Database kind summarized for a plugin, by its class path.
    pub fn for_class_path(class_path: &str) -> Option<Self> {
        match class_path {
            "stats" | "slogging.stats_processor.StatsLogProcessor" => Some(StatsKind::Account),
            "container_stats" | "slogging.stats_processor.ContainerStatsProcessor" => {
                Some(StatsKind::Container)
            }
            _ => None,
        }
    }

    fn data_dir(self) -> &'static str {
        match self {
            StatsKind::Account => "accounts",
            StatsKind::Container => "containers",
        }
    }

    fn filename_prefix(self) -> &'static str {
        match self {
            StatsKind::Account => "stats-",
            StatsKind::Container => "container-stats-",
        }
    }
}

impl fmt::Display for StatsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsKind::Account => write!(f, "account"),
            StatsKind::Container => write!(f, "container"),
        }
    }
}

/// What `logroll collect` prints for each plugin.
#[derive(Debug, Clone, Serialize)]
pub struct CollectReport {
    pub plugin: String,
    pub kind: StatsKind,
    pub path: PathBuf,
    pub devices: usize,
    pub unmounted: usize,
    pub databases: usize,
    pub rows: usize,
    pub unreadable: usize,
}

#[derive(Debug, Clone)]
pub struct DatabaseStatsCollector {
    plugin: String,
    kind: StatsKind,
    devices: PathBuf,
    mount_check: bool,
    log_dir: PathBuf,
    /// `X-Container-Meta-<Key>` names reported as set/unset columns.
    metadata_headers: Vec<String>,
}

impl DatabaseStatsCollector {
    pub fn new(config: &ProcessorConfig) -> Result<Self, CollectError> {
        let kind = StatsKind::for_class_path(&config.class_path)
            .ok_or_else(|| CollectError::NotStats(config.name.clone()))?;
        let log_dir = config
            .options
            .log_dir
            .clone()
            .ok_or_else(|| CollectError::NoLogDir(config.name.clone()))?;

        let metadata_headers = match kind {
            StatsKind::Account => Vec::new(),
            StatsKind::Container => config
                .options
                .metadata_keys
                .iter()
                .map(|key| key.trim())
                .filter(|key| !key.is_empty())
                .map(|key| format!("{}{}", META_PREFIX, title_case(key)))
                .collect(),
        };

        Ok(Self {
            plugin: config.name.clone(),
            kind,
            devices: config.options.devices.clone(),
            mount_check: config.options.mount_check,
            log_dir,
            metadata_headers,
        })
    }

    pub fn kind(&self) -> StatsKind {
        self.kind
    }

    /// Summarize every database and write one stats file named after the
    /// hour of `now`. Unreadable databases are logged and skipped.
    pub async fn collect(&self, now: DateTime<Utc>) -> Result<CollectReport, CollectError> {
        let collector = self.clone();
        tokio::task::spawn_blocking(move || collector.collect_blocking(now)).await?
    }

    fn collect_blocking(&self, now: DateTime<Utc>) -> Result<CollectReport, CollectError> {
        info!(plugin = %self.plugin, kind = %self.kind, devices = %self.devices.display(), "Gathering stats");

        let filename = format!("{}{}_", self.kind.filename_prefix(), now.format("%Y%m%d%H"));
        let working_dir = self.log_dir.join(format!(".{}-stats_tmp", self.kind));
        let _ = fs::remove_dir_all(&working_dir);
        fs::create_dir_all(&working_dir).map_err(|source| CollectError::Write {
            path: working_dir.clone(),
            source,
        })?;

        let result = self.write_stats(&working_dir.join(&filename), &filename);
        let _ = fs::remove_dir_all(&working_dir);

        if let Ok(report) = &result {
            info!(
                plugin = %self.plugin,
                path = %report.path.display(),
                databases = report.databases,
                rows = report.rows,
                unreadable = report.unreadable,
                unmounted = report.unmounted,
                "Gathering stats complete"
            );
        }
        result
    }

    fn write_stats(&self, tmp_path: &Path, filename: &str) -> Result<CollectReport, CollectError> {
        let write_error = |source: io::Error| CollectError::Write {
            path: tmp_path.to_path_buf(),
            source,
        };

        let mut out = BufWriter::new(File::create(tmp_path).map_err(write_error)?);
        out.write_all(self.header().as_bytes()).map_err(write_error)?;

        let mut report = CollectReport {
            plugin: self.plugin.clone(),
            kind: self.kind,
            path: PathBuf::new(),
            devices: 0,
            unmounted: 0,
            databases: 0,
            rows: 0,
            unreadable: 0,
        };
        let mut hasher = Sha256::new();

        for device in self.device_names()? {
            let device_path = self.devices.join(&device);
            if self.mount_check && !is_mount(&device_path) {
                error!(device = %device, "Device is not mounted, skipping");
                report.unmounted += 1;
                continue;
            }
            report.devices += 1;

            let db_dir = device_path.join(self.kind.data_dir());
            if !db_dir.is_dir() {
                debug!(path = %db_dir.display(), "Path does not exist, skipping");
                continue;
            }

            for db_path in find_databases(&db_dir) {
                report.databases += 1;
                match self.row(&db_path) {
                    Ok(Some(line)) => {
                        out.write_all(line.as_bytes()).map_err(write_error)?;
                        hasher.update(line.as_bytes());
                        report.rows += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        info!(db = %db_path.display(), error = %e, "Error accessing db");
                        report.unreadable += 1;
                    }
                }
            }
        }

        out.flush().map_err(write_error)?;
        drop(out);

        let digest: String = hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect();
        let path = self.log_dir.join(format!("{}{}", filename, digest));
        fs::rename(tmp_path, &path).map_err(|source| CollectError::Write {
            path: path.clone(),
            source,
        })?;
        report.path = path;
        Ok(report)
    }

    fn header(&self) -> String {
        match self.kind {
            StatsKind::Account => String::new(),
            StatsKind::Container => {
                let mut header = CONTAINER_HEADER.to_string();
                for name in &self.metadata_headers {
                    header.push(',');
                    header.push_str(name);
                }
                header.push('\n');
                header
            }
        }
    }

    fn device_names(&self) -> Result<Vec<String>, CollectError> {
        let entries = fs::read_dir(&self.devices).map_err(|source| CollectError::Devices {
            path: self.devices.clone(),
            source,
        })?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    /// One CSV row for a database, or None if it is marked deleted.
    fn row(&self, db_path: &Path) -> rusqlite::Result<Option<String>> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        match self.kind {
            StatsKind::Account => account_row(&conn),
            StatsKind::Container => self.container_row(&conn),
        }
    }

    fn container_row(&self, conn: &Connection) -> rusqlite::Result<Option<String>> {
        let with_metadata = !self.metadata_headers.is_empty();
        let sql = if with_metadata {
            "SELECT account, container, object_count, bytes_used, put_timestamp, delete_timestamp, metadata \
             FROM container_stat"
        } else {
            "SELECT account, container, object_count, bytes_used, put_timestamp, delete_timestamp, NULL \
             FROM container_stat"
        };

        let Some(stat) = conn
            .query_row(sql, [], |row| {
                Ok(ContainerStat {
                    account: row.get(0)?,
                    container: row.get(1)?,
                    object_count: row.get(2)?,
                    bytes_used: row.get(3)?,
                    put_timestamp: row.get(4)?,
                    delete_timestamp: row.get(5)?,
                    metadata: row.get(6)?,
                })
            })
            .optional()?
        else {
            return Ok(None);
        };

        if stat.object_count == 0 && is_after(&stat.delete_timestamp, &stat.put_timestamp) {
            return Ok(None);
        }

        let mut line = format!(
            "\"{}\",\"{}\",{},{}",
            stat.account,
            quote(&stat.container),
            stat.object_count,
            stat.bytes_used
        );
        if with_metadata {
            let metadata = parse_metadata(stat.metadata.as_deref());
            for name in &self.metadata_headers {
                line.push(',');
                if metadata.get(name).is_some_and(|set| *set) {
                    line.push('1');
                }
            }
        }
        line.push('\n');
        Ok(Some(line))
    }
}

struct ContainerStat {
    account: String,
    container: String,
    object_count: i64,
    bytes_used: i64,
    put_timestamp: Option<String>,
    delete_timestamp: Option<String>,
    metadata: Option<String>,
}

fn account_row(conn: &Connection) -> rusqlite::Result<Option<String>> {
    let row = conn
        .query_row(
            "SELECT account, container_count, object_count, bytes_used, put_timestamp, delete_timestamp, status \
             FROM account_stat",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((account, containers, objects, bytes, put_ts, delete_ts, status)) = row else {
        return Ok(None);
    };
    let deleted = status.as_deref() == Some("DELETED")
        || (containers == 0 && is_after(&delete_ts, &put_ts));
    if deleted {
        return Ok(None);
    }

    Ok(Some(format!("\"{}\",{},{},{}\n", account, containers, objects, bytes)))
}

/// Timestamps are stored as decimal seconds in text columns.
fn is_after(a: &Option<String>, b: &Option<String>) -> bool {
    let seconds = |ts: &Option<String>| {
        ts.as_deref()
            .and_then(|ts| ts.trim().parse::<f64>().ok())
            .unwrap_or(0.0)
    };
    seconds(a) > seconds(b)
}

/// Container metadata is a JSON object of `name -> [value, timestamp]`. A
/// key counts as set when its value is a non-empty string.
fn parse_metadata(raw: Option<&str>) -> BTreeMap<String, bool> {
    let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
        return BTreeMap::new();
    };
    match serde_json::from_str::<BTreeMap<String, serde_json::Value>>(raw) {
        Ok(entries) => entries
            .into_iter()
            .map(|(name, entry)| {
                let set = entry
                    .get(0)
                    .and_then(|value| value.as_str())
                    .is_some_and(|value| !value.is_empty());
                (name, set)
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "Ignoring unreadable container metadata");
            BTreeMap::new()
        }
    }
}

/// Every `.db` file below `dir`, sorted by path.
fn find_databases(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Failed to read database directory");
                continue;
            }
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "db") {
                found.push(path);
            }
        }
    }

    found.sort();
    found
}

/// A device counts as mounted when it sits on a different filesystem than
/// its parent directory.
#[cfg(unix)]
fn is_mount(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let (Ok(metadata), Ok(parent)) = (fs::symlink_metadata(path), fs::metadata(path.join(".."))) else {
        return false;
    };
    if metadata.file_type().is_symlink() {
        return false;
    }
    metadata.dev() != parent.dev() || metadata.ino() == parent.ino()
}

#[cfg(not(unix))]
fn is_mount(path: &Path) -> bool {
    path.is_dir()
}
