//! Error types for Synheart Rollup

use thiserror::Error;

/// Errors that can occur while storing, aggregating or assembling metrics
#[derive(Debug, Error)]
pub enum RollupError {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse export: {0}")]
    ParseError(String),

    #[error("Unknown metric type: {0}")]
    UnknownMetricType(String),

    #[error("Invalid window: {0}")]
    InvalidWindow(String),

    #[error("Requested {requested} days, supported range is 1..={max}")]
    InvalidDays { requested: u32, max: u32 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Corrupt stored sample: {0}")]
    CorruptSample(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Reasons a single sample is rejected at ingestion.
///
/// Rejections are recorded per item in the batch result; they never abort
/// the rest of the batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Missing identity: {0} is empty")]
    MissingIdentity(&'static str),

    #[error("Value is not a finite number")]
    NonFiniteValue,

    #[error("Cumulative metric {metric} has negative value {value}")]
    NegativeCumulative { metric: String, value: f64 },

    #[error("{metric} value {value} outside physiological range {min}..={max}")]
    OutOfRange {
        metric: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Interval ends before it starts")]
    InvertedInterval,

    #[error("Sleep interval has zero length")]
    EmptySleepInterval,

    #[error("Storage rejected sample: {0}")]
    Storage(String),
}
