//! Apple Health export document
//!
//! The JSON produced by the companion iOS app: one export per device upload,
//! carrying HealthKit samples as loosely typed records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Metadata;

/// Fields every export must carry
pub const REQUIRED_FIELDS: [&str; 3] = ["deviceId", "exportTimestamp", "metrics"];

/// Top-level export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppleHealthExport {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub export_timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_range: Option<DataRange>,
    pub metrics: Vec<HealthMetric>,
}

/// Optional range the export claims to cover
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRange {
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

/// One HealthKit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetric {
    /// HealthKit identifier or iOS display name
    #[serde(rename = "type")]
    pub metric_type: String,
    /// Number for quantities; number or label for sleep categories
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub unit: Option<String>,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub source_app: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl HealthMetric {
    /// Device name recorded by HealthKit, if any
    pub fn device(&self) -> Option<&str> {
        self.metadata.get("device").and_then(|v| v.as_str())
    }
}

/// Problems with an export document or one of its records
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExportError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field 'metrics' is not a list")]
    MetricsNotList,

    #[error("Unparseable date '{0}'")]
    InvalidDate(String),

    #[error("Record ends before it starts")]
    InvertedRange,

    #[error("Non-numeric value for {0}")]
    NonNumericValue(String),
}

/// Parse the timestamp spellings HealthKit exports use
pub fn parse_health_date(raw: &str) -> Result<DateTime<Utc>, ExportError> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S %z"))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ExportError::InvalidDate(raw.to_string()))
}

/// Check the required shape of a raw export before deserializing it
pub fn validate_export(value: &serde_json::Value) -> Result<(), ExportError> {
    for field in REQUIRED_FIELDS {
        if value.get(field).is_none() {
            return Err(ExportError::MissingField(field));
        }
    }
    if !value["metrics"].is_array() {
        return Err(ExportError::MetricsNotList);
    }
    Ok(())
}
