//! Runtime configuration
//!
//! All tunables live in [`RollupConfig`]. Values come from defaults, a JSON
//! document, or `ROLLUP_*` environment variables. Nothing else in the crate
//! reads the environment.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::RollupError;

/// Default gap below which adjacent sleep intervals join one session
pub const DEFAULT_SLEEP_GAP_MINUTES: u32 = 30;

/// Longest history, in days, any window or baseline may reach back
pub const MAX_HISTORY_DAYS: u32 = 3650;

/// Widest hourly view
pub const MAX_HOURLY_WINDOW_HOURS: u32 = 24 * 31;

/// Parse an optional environment variable, keeping `$default` when unset.
macro_rules! parse_env {
    ($var_name:expr, $ty:ty, $default:expr) => {
        match env::var($var_name) {
            Ok(raw) => raw
                .trim()
                .parse::<$ty>()
                .map_err(|e| RollupError::Config(format!("Invalid {}: {}", $var_name, e)))?,
            Err(_) => $default,
        }
    };
}

/// Baseline period that "today" is compared against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BaselinePolicy {
    /// The previous UTC day
    #[default]
    Yesterday,
    /// Mean of the available daily values over the preceding `days` days
    TrailingMean { days: u32 },
}

impl BaselinePolicy {
    /// Number of whole days before today the policy reads
    pub fn lookback_days(&self) -> u32 {
        match self {
            BaselinePolicy::Yesterday => 1,
            BaselinePolicy::TrailingMean { days } => *days,
        }
    }
}

impl FromStr for BaselinePolicy {
    type Err = RollupError;

    /// Accepts `yesterday` or `trailing:<days>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("yesterday") {
            return Ok(BaselinePolicy::Yesterday);
        }
        if let Some(days) = s.strip_prefix("trailing:") {
            let days = days
                .parse::<u32>()
                .map_err(|e| RollupError::Config(format!("Invalid trailing days: {e}")))?;
            if days == 0 || days > MAX_HISTORY_DAYS {
                return Err(RollupError::Config(format!(
                    "trailing baseline days must be within 1..={MAX_HISTORY_DAYS}"
                )));
            }
            return Ok(BaselinePolicy::TrailingMean { days });
        }
        Err(RollupError::Config(format!("Unknown baseline policy: {s}")))
    }
}

/// Strongly typed configuration, immutable after loading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    /// SQLite database holding the sample log
    pub database_path: PathBuf,
    /// Sleep intervals closer than this join one session
    pub sleep_gap_minutes: u32,
    /// Width of the hourly view
    pub hourly_window_hours: u32,
    /// Daily view length when the caller does not choose one
    pub default_days: u32,
    /// Largest daily view a snapshot may request
    pub max_days: u32,
    pub baseline: BaselinePolicy,
    /// Directory for durable client snapshots
    pub cache_dir: PathBuf,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("rollup.db"),
            sleep_gap_minutes: DEFAULT_SLEEP_GAP_MINUTES,
            hourly_window_hours: 24,
            default_days: 7,
            max_days: 90,
            baseline: BaselinePolicy::Yesterday,
            cache_dir: PathBuf::from(".rollup-cache"),
        }
    }
}

impl RollupConfig {
    /// Load configuration from `ROLLUP_*` environment variables.
    ///
    /// Optional:
    /// - `ROLLUP_DATABASE_PATH` (default: `rollup.db`)
    /// - `ROLLUP_SLEEP_GAP_MINUTES` (default: 30)
    /// - `ROLLUP_HOURLY_WINDOW_HOURS` (default: 24)
    /// - `ROLLUP_DEFAULT_DAYS` (default: 7)
    /// - `ROLLUP_MAX_DAYS` (default: 90)
    /// - `ROLLUP_BASELINE` – `yesterday` or `trailing:<days>` (default: yesterday)
    /// - `ROLLUP_CACHE_DIR` (default: `.rollup-cache`)
    pub fn from_env() -> Result<Self, RollupError> {
        let defaults = Self::default();

        let config = Self {
            database_path: env::var("ROLLUP_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            sleep_gap_minutes: parse_env!(
                "ROLLUP_SLEEP_GAP_MINUTES",
                u32,
                defaults.sleep_gap_minutes
            ),
            hourly_window_hours: parse_env!(
                "ROLLUP_HOURLY_WINDOW_HOURS",
                u32,
                defaults.hourly_window_hours
            ),
            default_days: parse_env!("ROLLUP_DEFAULT_DAYS", u32, defaults.default_days),
            max_days: parse_env!("ROLLUP_MAX_DAYS", u32, defaults.max_days),
            baseline: parse_env!("ROLLUP_BASELINE", BaselinePolicy, defaults.baseline),
            cache_dir: env::var("ROLLUP_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON document; missing keys keep defaults
    pub fn from_json(json: &str) -> Result<Self, RollupError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RollupError> {
        if self.hourly_window_hours == 0 || self.hourly_window_hours > MAX_HOURLY_WINDOW_HOURS {
            return Err(RollupError::Config(format!(
                "hourly_window_hours must be within 1..={MAX_HOURLY_WINDOW_HOURS}"
            )));
        }
        if self.default_days == 0 || self.max_days == 0 {
            return Err(RollupError::Config("day windows must be positive".into()));
        }
        if self.max_days > MAX_HISTORY_DAYS {
            return Err(RollupError::Config(format!(
                "max_days ({}) exceeds {MAX_HISTORY_DAYS}",
                self.max_days
            )));
        }
        if self.default_days > self.max_days {
            return Err(RollupError::Config(format!(
                "default_days ({}) exceeds max_days ({})",
                self.default_days, self.max_days
            )));
        }
        if self.baseline.lookback_days() == 0 {
            return Err(RollupError::Config("baseline must look back at least one day".into()));
        }
        if self.baseline.lookback_days() > MAX_HISTORY_DAYS {
            return Err(RollupError::Config(format!(
                "baseline lookback ({}) exceeds {MAX_HISTORY_DAYS} days",
                self.baseline.lookback_days()
            )));
        }
        Ok(())
    }

    pub fn sleep_gap(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.sleep_gap_minutes))
    }

    /// Log the effective configuration
    pub fn log_config(&self) {
        tracing::info!("Configuration loaded:");
        tracing::info!("  database_path       : {}", self.database_path.display());
        tracing::info!("  sleep_gap_minutes   : {}", self.sleep_gap_minutes);
        tracing::info!("  hourly_window_hours : {}", self.hourly_window_hours);
        tracing::info!("  default_days        : {}", self.default_days);
        tracing::info!("  max_days            : {}", self.max_days);
        tracing::info!("  baseline            : {:?}", self.baseline);
        tracing::info!("  cache_dir           : {}", self.cache_dir.display());
    }
}
