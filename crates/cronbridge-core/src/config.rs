use chrono::{Datelike, NaiveDate, Utc};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::types::CatalogEntry;

// Hook names and storage keys shared by every crate in the workspace.
pub const QUEUE_RUNNER_HOOK: &str = "queue_run";
pub const QUEUE_RUNNER_SCHEDULE: &str = "every_minute";
pub const MANIFEST_CACHE_KEY: &str = "poll_manifest";
pub const LEGACY_MANIFEST_OPTION: &str = "cron";
pub const SCHEMA_VERSION_OPTION: &str = "cronbridge_version";
pub const RECONCILED_SCHEDULES_OPTION: &str = "queue_cron_schedules";
/// Group recorded on queue actions created by routing poll tasks.
pub const POLL_ROUTED_GROUP: &str = "poll";

pub const DEFAULT_MINIMUM_INTERVAL: u64 = 5 * 60;
pub const DEFAULT_RUN_TIME_LIMIT: u64 = 60;
pub const DEFAULT_CLEANUP_RETENTION: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_CLEANUP_BATCH_SIZE: u32 = 100;
const DAY_IN_SECONDS: u64 = 24 * 60 * 60;

/// Top-level config (cronbridge.toml + CRONBRIDGE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Which scheduler's operations get re-issued against the other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    #[default]
    Off,
    /// Poll scheduler operations are redirected to the queue scheduler.
    PollToQueue,
    /// Queue scheduler operations are redirected to the poll scheduler.
    QueueToPoll,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheMode {
    /// Manifest reads/writes are served by the table-backed cache.
    #[default]
    Enabled,
    /// Copy the cached manifest back to the legacy option and stop caching.
    Revert,
    Disabled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub mode: CacheMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// When true the poll scheduler is not run on inbound requests; an
    /// external trigger (`cronbridge run`/`daemon`) drives it instead.
    #[serde(default = "bool_true")]
    pub disable_trigger: bool,
    /// Floor for recurring intervals, in seconds. 0 disables the floor.
    #[serde(default = "default_minimum_interval")]
    pub minimum_interval: u64,
    /// Extra catalog entries, overriding built-ins with the same name.
    #[serde(default = "default_schedules")]
    pub schedules: Vec<CatalogEntry>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            disable_trigger: true,
            minimum_interval: DEFAULT_MINIMUM_INTERVAL,
            schedules: default_schedules(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Stops the queue runner from being attached to the poll scheduler.
    #[serde(default)]
    pub disable_runner: bool,
    /// Seconds a single queue run may spend claiming actions.
    #[serde(default = "default_run_time_limit")]
    pub run_time_limit: u64,
    /// Finished actions older than this (seconds) are purged.
    #[serde(default = "default_cleanup_retention")]
    pub cleanup_retention_period: u64,
    #[serde(default = "default_cleanup_batch_size")]
    pub cleanup_batch_size: u32,
    /// Include failed actions in the purge.
    #[serde(default = "bool_true")]
    pub cleanup_failed: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            disable_runner: false,
            run_time_limit: DEFAULT_RUN_TIME_LIMIT,
            cleanup_retention_period: DEFAULT_CLEANUP_RETENTION,
            cleanup_batch_size: DEFAULT_CLEANUP_BATCH_SIZE,
            cleanup_failed: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log scheduler faults (failed reschedule/unschedule/execution).
    #[serde(default)]
    pub log_errors: bool,
    /// Trace every scheduling intent at debug level.
    #[serde(default)]
    pub debug: bool,
}

fn bool_true() -> bool {
    true
}
fn default_minimum_interval() -> u64 {
    DEFAULT_MINIMUM_INTERVAL
}
fn default_run_time_limit() -> u64 {
    DEFAULT_RUN_TIME_LIMIT
}
fn default_cleanup_retention() -> u64 {
    DEFAULT_CLEANUP_RETENTION
}
fn default_cleanup_batch_size() -> u32 {
    DEFAULT_CLEANUP_BATCH_SIZE
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronbridge/cronbridge.db", home)
}

/// "monthly", sized to the number of days in the current month.
pub fn default_schedules() -> Vec<CatalogEntry> {
    let days = days_in_current_month();
    vec![CatalogEntry::new(
        "monthly",
        days as u64 * DAY_IN_SECONDS,
        format!("Monthly ({days} days)"),
    )]
}

fn days_in_current_month() -> u32 {
    let today = Utc::now().date_naive();
    let (year, month) = if today.month() == 12 {
        (today.year() + 1, 1)
    } else {
        (today.year(), today.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first_of_next| first_of_next.pred_opt())
        .map(|last| last.day())
        .unwrap_or(30)
}

impl BridgeConfig {
    /// Load config from a TOML file with CRONBRIDGE_* env var overrides.
    ///
    /// Nested keys are separated by a double underscore, e.g.
    /// `CRONBRIDGE_ROUTING__DIRECTION=queue-to-poll`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        if !std::path::Path::new(&path).exists() {
            debug!(%path, "config file not found, using defaults and environment");
        }

        let config: BridgeConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CRONBRIDGE_").split("__"))
            .extract()
            .map_err(|e| BridgeError::Config(e.to_string()))?;

        config.validate()?;
        info!(
            %path,
            direction = ?config.routing.direction,
            cache = ?config.cache.mode,
            "config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(bad) = self.poll.schedules.iter().find(|s| s.interval_secs == 0) {
            return Err(BridgeError::Config(format!(
                "schedule '{}' has a zero interval",
                bad.name
            )));
        }
        if self.queue.run_time_limit == 0 {
            return Err(BridgeError::Config(
                "queue.run_time_limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cronbridge/cronbridge.toml", home)
}
