//! Adapter from Apple Health exports to sample candidates
//!
//! HealthKit records are mapped to [`MetricType`] by identifier or iOS
//! display name. Records of unsupported types are counted and skipped; a
//! malformed record is reported by index without failing the export.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::RollupError;
use crate::schema::export::*;
use crate::types::{MetricType, SampleCandidate, SleepStage};

const SLEEP_VALUE_PREFIX: &str = "HKCategoryValueSleepAnalysis";

/// Kind of device an export came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    AppleWatch,
    Iphone,
    Unknown,
}

impl DeviceKind {
    fn from_name(name: &str) -> Self {
        if name.contains("Apple Watch") {
            DeviceKind::AppleWatch
        } else if name.contains("iPhone") {
            DeviceKind::Iphone
        } else {
            DeviceKind::Unknown
        }
    }
}

/// Device summary of one export
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportDeviceInfo {
    pub device_id: String,
    pub device_type: DeviceKind,
    /// Distinct device names seen in record metadata, sorted
    pub devices_used: Vec<String>,
}

/// A record that could not be converted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportIssue {
    pub index: usize,
    #[serde(serialize_with = "serialize_display")]
    pub error: ExportError,
}

fn serialize_display<S: serde::Serializer>(
    error: &ExportError,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// Result of converting an export
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversionReport {
    pub candidates: Vec<SampleCandidate>,
    /// Records of types this pipeline does not track
    pub skipped_unknown: usize,
    pub unknown_types: BTreeSet<String>,
    /// Records without a value
    pub skipped_empty: usize,
    pub issues: Vec<ExportIssue>,
}

impl ConversionReport {
    /// Candidates per metric type, for logging
    pub fn counts(&self) -> BTreeMap<MetricType, usize> {
        let mut counts = BTreeMap::new();
        for candidate in &self.candidates {
            *counts.entry(candidate.metric_type).or_insert(0) += 1;
        }
        counts
    }
}

/// Adapter for Apple Health exports
pub struct AppleHealthAdapter;

impl AppleHealthAdapter {
    /// Parse an export document, checking its required fields first
    pub fn parse(json: &str) -> Result<AppleHealthExport, RollupError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        validate_export(&value).map_err(|e| RollupError::ParseError(e.to_string()))?;
        let export = serde_json::from_value(value)?;
        Ok(export)
    }

    /// Parse NDJSON (one [`SampleCandidate`] per line)
    pub fn parse_candidates_ndjson(ndjson: &str) -> Result<Vec<SampleCandidate>, RollupError> {
        let mut candidates = Vec::new();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<SampleCandidate>(trimmed) {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => {
                    return Err(RollupError::ParseError(format!(
                        "Failed to parse line {}: {}",
                        line_num + 1,
                        e
                    )));
                }
            }
        }
        Ok(candidates)
    }

    /// Map a HealthKit identifier or display name to a metric type
    pub fn map_type(raw: &str) -> Option<MetricType> {
        let metric = match raw.trim() {
            "HKQuantityTypeIdentifierHeartRate" | "Heart Rate" => MetricType::HeartRate,
            "HKQuantityTypeIdentifierRestingHeartRate" | "Resting Heart Rate" => {
                MetricType::RestingHeartRate
            }
            "HKQuantityTypeIdentifierStepCount" | "Step Count" | "Steps" => MetricType::Steps,
            "HKQuantityTypeIdentifierActiveEnergyBurned" | "Active Energy" => MetricType::Calories,
            "HKQuantityTypeIdentifierDistanceWalkingRunning" | "Walking/Running Distance" => {
                MetricType::Distance
            }
            "HKQuantityTypeIdentifierFlightsClimbed" | "Flights Climbed" => {
                MetricType::FlightsClimbed
            }
            "HKQuantityTypeIdentifierVO2Max" | "VO2 Max" => MetricType::Vo2Max,
            "HKCategoryTypeIdentifierSleepAnalysis"
            | "HKQuantityTypeIdentifierSleepAnalysis"
            | "Sleep Analysis" => MetricType::Sleep,
            "HKWorkoutTypeIdentifier" | "Workouts" | "Workout" => MetricType::Workout,
            // Already-normalized names pass through
            other => return other.parse().ok(),
        };
        Some(metric)
    }

    /// Convert every record of an export into candidates
    pub fn to_candidates(export: &AppleHealthExport) -> ConversionReport {
        let mut report = ConversionReport::default();

        for (index, record) in export.metrics.iter().enumerate() {
            let Some(metric) = Self::map_type(&record.metric_type) else {
                report.skipped_unknown += 1;
                report.unknown_types.insert(record.metric_type.clone());
                continue;
            };
            if record.value.as_ref().map_or(true, |v| v.is_null()) {
                report.skipped_empty += 1;
                continue;
            }

            match Self::convert(metric, record) {
                Ok(candidate) => report.candidates.push(candidate),
                Err(error) => report.issues.push(ExportIssue { index, error }),
            }
        }

        if !report.unknown_types.is_empty() {
            tracing::debug!(
                skipped = report.skipped_unknown,
                types = ?report.unknown_types,
                "Skipped unsupported HealthKit types"
            );
        }
        report
    }

    /// Device type and distinct device names of an export
    pub fn extract_device_info(export: &AppleHealthExport) -> ExportDeviceInfo {
        let devices: BTreeSet<&str> = export.metrics.iter().filter_map(|m| m.device()).collect();
        let device_type = devices
            .iter()
            .map(|name| DeviceKind::from_name(name))
            .find(|kind| *kind != DeviceKind::Unknown)
            .unwrap_or(DeviceKind::Unknown);

        ExportDeviceInfo {
            device_id: export.device_id.clone(),
            device_type,
            devices_used: devices.into_iter().map(str::to_string).collect(),
        }
    }

    fn convert(metric: MetricType, record: &HealthMetric) -> Result<SampleCandidate, ExportError> {
        let start = parse_health_date(&record.start_date)?;
        let end = parse_health_date(&record.end_date)?;
        if end < start {
            return Err(ExportError::InvertedRange);
        }

        let mut candidate = if metric == MetricType::Sleep {
            SampleCandidate::sleep_stage(sleep_stage(record), start, end)
        } else {
            let value = record
                .value
                .as_ref()
                .and_then(|v| v.as_f64())
                .ok_or_else(|| ExportError::NonNumericValue(metric.to_string()))?;
            let (value, unit) = normalize_unit(metric, value, record.unit.as_deref());
            quantity(metric, value, unit, start, end)
        };

        if let Some(app) = &record.source_app {
            candidate = candidate.with_source_app(app.clone());
        }
        for (key, value) in &record.metadata {
            candidate.metadata.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Ok(candidate)
    }
}

fn quantity(
    metric: MetricType,
    value: f64,
    unit: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> SampleCandidate {
    if start == end {
        SampleCandidate::point(metric, value, unit, start)
    } else {
        SampleCandidate::interval(metric, value, unit, start, end)
    }
}

/// Stage of a sleep record: metadata label, then value label or code.
/// Sleep quantities in hours are unstaged sleep.
fn sleep_stage(record: &HealthMetric) -> SleepStage {
    let from_metadata = record
        .metadata
        .get("stage")
        .and_then(|v| v.as_str())
        .and_then(SleepStage::from_label);
    if let Some(stage) = from_metadata {
        return stage;
    }

    let staged_unit = matches!(record.unit.as_deref(), None | Some("") | Some("stage"));
    let from_value = match &record.value {
        Some(serde_json::Value::String(label)) => {
            SleepStage::from_label(label.strip_prefix(SLEEP_VALUE_PREFIX).unwrap_or(label))
        }
        Some(value) if staged_unit => value.as_f64().and_then(SleepStage::from_category_code),
        _ => None,
    };
    from_value.unwrap_or(SleepStage::AsleepUnspecified)
}

/// Convert HealthKit units to the unit each metric is stored in
fn normalize_unit(metric: MetricType, value: f64, unit: Option<&str>) -> (f64, &'static str) {
    let unit = unit.unwrap_or("").trim();
    let value = match (metric, unit) {
        (MetricType::Distance, "m") => value / 1000.0,
        (MetricType::Distance, "mi") => value * 1.609_344,
        (MetricType::Calories, "kJ") => value / 4.184,
        (MetricType::Workout, "s") => value / 60.0,
        (MetricType::Workout, "hr") => value * 60.0,
        _ => value,
    };
    (value, metric.default_unit())
}
