//! Local steps that feed the source containers: summarizing storage node
//! databases into stats files, and shipping local log files.

pub mod db_stats;
pub mod logs;

pub use db_stats::{CollectError, CollectReport, DatabaseStatsCollector, StatsKind};
pub use logs::{LogShipper, ShipError, ShipReport};
