//! Worker configuration
//!
//! Every setting comes from, in order of precedence: a command line flag, an
//! environment variable, the TOML file named by `--config`, the default.
//!
//! | Flag | Environment | Default |
//! |------|-------------|---------|
//! | `--addr` | `SWEEPER_ADDR` | `localhost:6379` |
//! | `--password` | `SWEEPER_PASSWORD` | none |
//! | `--db` | `SWEEPER_DB` | `0` |
//! | `--interval` (ms) | `SWEEPER_INTERVAL_MS` | `300` |
//! | `--data-dir` | `SWEEPER_DATA_DIR` | `.` |
//! | `--fsync` | `SWEEPER_FSYNC` | `never` |
//! | `--notify-repair` | `SWEEPER_NOTIFY_REPAIR` | `merge` |
//! | `--max-retries` | `SWEEPER_MAX_RETRIES` | `3` |
//! | `--log-format` | `SWEEPER_LOG_FORMAT` | `text` |
//! | `--config` | `SWEEPER_CONFIG` | none |
//!
//! `-addr`, `-password`, `-db` and `-interval` are also accepted with a single dash.

use clap::Parser;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backlog::FsyncPolicy;
use crate::notify::RepairMode;
use crate::observability::LogFormat;
use crate::store::ConnectOptions;
use crate::sweeper::{RetryConfig, SweepSettings};

pub const DEFAULT_ADDR: &str = "localhost:6379";
pub const DEFAULT_INTERVAL_MS: u64 = 300;
pub const DEFAULT_DATA_DIR: &str = ".";

// TigerStyle: Explicit limits with _MAX suffix
pub const DB_INDEX_MAX: u32 = 1023;
pub const INTERVAL_MS_MAX: u64 = 60_000;
pub const MAX_RETRIES_MAX: u32 = 10;

/// Flags that may be written with a single leading dash.
const SINGLE_DASH_LONGS: [&str; 4] = ["addr", "password", "db", "interval"];

#[derive(Debug, Default, Parser)]
#[command(
    name = "expiry-sweeper",
    version,
    about = "Records expired-key events and lazily reclaims the keys every night"
)]
pub struct Args {
    /// Store address (host:port)
    #[arg(long, env = "SWEEPER_ADDR")]
    pub addr: Option<String>,

    /// Password sent with AUTH
    #[arg(long, env = "SWEEPER_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Database index to watch
    #[arg(long, env = "SWEEPER_DB")]
    pub db: Option<u32>,

    /// Pause between two TYPE calls, in milliseconds
    #[arg(long, env = "SWEEPER_INTERVAL_MS", value_name = "MS")]
    pub interval: Option<u64>,

    /// Directory holding the backlog and snapshot files
    #[arg(long, env = "SWEEPER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "SWEEPER_FSYNC", value_enum)]
    pub fsync: Option<FsyncPolicy>,

    /// How to repair notify-keyspace-events when expired events are off
    #[arg(long, env = "SWEEPER_NOTIFY_REPAIR", value_enum)]
    pub notify_repair: Option<RepairMode>,

    /// Retries per key for transient store errors
    #[arg(long, env = "SWEEPER_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    #[arg(long, env = "SWEEPER_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,

    /// TOML file with defaults for any of the settings above
    #[arg(long, env = "SWEEPER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Sweep once right away and exit instead of running nightly
    #[arg(long)]
    pub run_once: bool,
}

/// Rewrite `-addr`, `-addr=x` and friends to their double-dash form.
///
/// The program name and anything after `--` are left alone.
pub fn normalize_single_dash_longs<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut after_separator = false;
    args.into_iter()
        .enumerate()
        .map(|(index, arg)| {
            if index == 0 || after_separator {
                return arg;
            }
            let Some(text) = arg.to_str() else {
                return arg;
            };
            if text == "--" {
                after_separator = true;
                return arg;
            }
            let Some(rest) = text.strip_prefix('-').filter(|r| !r.starts_with('-')) else {
                return arg;
            };
            let name = rest.split_once('=').map_or(rest, |(name, _)| name);
            if SINGLE_DASH_LONGS.contains(&name) {
                OsString::from(format!("-{}", text))
            } else {
                arg
            }
        })
        .collect()
}

/// Contents of the `--config` file. Unknown keys are rejected.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub addr: Option<String>,
    pub password: Option<String>,
    pub db: Option<u32>,
    pub interval_ms: Option<u64>,
    pub data_dir: Option<PathBuf>,
    pub fsync: Option<FsyncPolicy>,
    pub notify_repair: Option<RepairMode>,
    pub max_retries: Option<u32>,
    pub log_format: Option<LogFormat>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{name} is {value}, maximum is {max}")]
    OutOfRange {
        name: &'static str,
        value: u64,
        max: u64,
    },
    #[error("{name} must not be empty")]
    Empty { name: &'static str },
}

/// Fully resolved settings.
///
/// TigerStyle Invariants:
/// - store.db <= DB_INDEX_MAX
/// - sweep.interval <= INTERVAL_MS_MAX
/// - sweep.retry.max_retries <= MAX_RETRIES_MAX
/// - store.addr is not empty
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub store: ConnectOptions,
    pub data_dir: PathBuf,
    pub fsync: FsyncPolicy,
    pub notify_repair: RepairMode,
    pub sweep: SweepSettings,
    pub log_format: LogFormat,
    pub run_once: bool,
}

impl WorkerConfig {
    /// Resolve `args`, reading the `--config` file if one is named.
    pub fn resolve(args: Args) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::from_sources(args, file)
    }

    /// Merge flags/env with file values and validate the result.
    pub fn from_sources(args: Args, file: FileConfig) -> Result<Self, ConfigError> {
        let addr = args
            .addr
            .or(file.addr)
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());
        if addr.trim().is_empty() {
            return Err(ConfigError::Empty { name: "addr" });
        }

        let db = args.db.or(file.db).unwrap_or(0);
        check_max("db", u64::from(db), u64::from(DB_INDEX_MAX))?;

        let interval_ms = args
            .interval
            .or(file.interval_ms)
            .unwrap_or(DEFAULT_INTERVAL_MS);
        check_max("interval", interval_ms, INTERVAL_MS_MAX)?;

        let max_retries = args
            .max_retries
            .or(file.max_retries)
            .unwrap_or(RetryConfig::DEFAULT.max_retries);
        check_max(
            "max-retries",
            u64::from(max_retries),
            u64::from(MAX_RETRIES_MAX),
        )?;

        // An empty password means no AUTH.
        let password = args
            .password
            .or(file.password)
            .filter(|password| !password.is_empty());

        let config = WorkerConfig {
            store: ConnectOptions { addr, password, db },
            data_dir: args
                .data_dir
                .or(file.data_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            fsync: args.fsync.or(file.fsync).unwrap_or_default(),
            notify_repair: args.notify_repair.or(file.notify_repair).unwrap_or_default(),
            sweep: SweepSettings {
                interval: Duration::from_millis(interval_ms),
                retry: RetryConfig::DEFAULT.with_max_retries(max_retries),
            },
            log_format: args.log_format.or(file.log_format).unwrap_or_default(),
            run_once: args.run_once,
        };
        config.verify_invariants();
        Ok(config)
    }

    /// TigerStyle: Verify all struct invariants hold
    #[inline]
    pub fn verify_invariants(&self) {
        debug_assert!(
            self.store.db <= DB_INDEX_MAX,
            "Invariant: db {} exceeds max {}",
            self.store.db,
            DB_INDEX_MAX
        );
        debug_assert!(
            self.sweep.interval <= Duration::from_millis(INTERVAL_MS_MAX),
            "Invariant: interval {:?} exceeds max {}ms",
            self.sweep.interval,
            INTERVAL_MS_MAX
        );
        debug_assert!(
            self.sweep.retry.max_retries <= MAX_RETRIES_MAX,
            "Invariant: max_retries {} exceeds max {}",
            self.sweep.retry.max_retries,
            MAX_RETRIES_MAX
        );
        debug_assert!(!self.store.addr.is_empty(), "Invariant: addr must be set");
    }
}

fn check_max(name: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::OutOfRange { name, value, max });
    }
    Ok(())
}
