//! Core types for the Synheart Rollup pipeline
//!
//! This module defines the data structures that flow through each stage:
//! producer candidates, stored samples, derived rollup buckets and sleep
//! sessions, per-metric summaries, and the snapshot delivered to clients.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::{RollupError, ValidationError};

/// Open key/value metadata attached to a sample
pub type Metadata = HashMap<String, serde_json::Value>;

/// Physiological heart-rate bounds accepted at ingestion (bpm)
pub const HEART_RATE_RANGE: (f64, f64) = (30.0, 250.0);

/// Wearable metric kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    HeartRate,
    RestingHeartRate,
    Steps,
    Calories,
    Distance,
    FlightsClimbed,
    #[serde(rename = "vo2_max")]
    Vo2Max,
    Sleep,
    Workout,
}

/// How samples of a metric combine inside a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationKind {
    /// Summed quantities (steps, calories, ...); buckets carry a total
    Cumulative,
    /// Instantaneous rates (heart rate, VO2 max); no meaningful total
    Rate,
    /// Stage intervals stitched into sessions before bucketing
    Sleep,
}

impl MetricType {
    pub const ALL: [MetricType; 9] = [
        MetricType::HeartRate,
        MetricType::RestingHeartRate,
        MetricType::Steps,
        MetricType::Calories,
        MetricType::Distance,
        MetricType::FlightsClimbed,
        MetricType::Vo2Max,
        MetricType::Sleep,
        MetricType::Workout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::HeartRate => "heart_rate",
            MetricType::RestingHeartRate => "resting_heart_rate",
            MetricType::Steps => "steps",
            MetricType::Calories => "calories",
            MetricType::Distance => "distance",
            MetricType::FlightsClimbed => "flights_climbed",
            MetricType::Vo2Max => "vo2_max",
            MetricType::Sleep => "sleep",
            MetricType::Workout => "workout",
        }
    }

    pub fn aggregation(&self) -> AggregationKind {
        match self {
            MetricType::Steps
            | MetricType::Calories
            | MetricType::Distance
            | MetricType::FlightsClimbed
            | MetricType::Workout => AggregationKind::Cumulative,
            MetricType::HeartRate | MetricType::RestingHeartRate | MetricType::Vo2Max => {
                AggregationKind::Rate
            }
            MetricType::Sleep => AggregationKind::Sleep,
        }
    }

    /// Unit used when no sample supplies one
    pub fn default_unit(&self) -> &'static str {
        match self {
            MetricType::HeartRate | MetricType::RestingHeartRate => "bpm",
            MetricType::Steps | MetricType::FlightsClimbed => "count",
            MetricType::Calories => "kcal",
            MetricType::Distance => "km",
            MetricType::Vo2Max => "mL/kg/min",
            MetricType::Sleep => "hr",
            MetricType::Workout => "min",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = RollupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricType::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| RollupError::UnknownMetricType(s.to_string()))
    }
}

/// A reading as delivered by the device-data producer, before identity
/// stamping and deduplication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleCandidate {
    pub metric_type: MetricType,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    /// Dedup timestamp (usually equal to `start_time`)
    pub timestamp: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_app: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: Metadata,
}

impl SampleCandidate {
    /// Point-in-time reading (start == end == timestamp)
    pub fn point(metric_type: MetricType, value: f64, unit: &str, at: DateTime<Utc>) -> Self {
        Self::interval(metric_type, value, unit, at, at)
    }

    /// Reading spanning an interval, keyed by its start
    pub fn interval(
        metric_type: MetricType,
        value: f64,
        unit: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            metric_type,
            value,
            unit: unit.to_string(),
            timestamp: start,
            start_time: start,
            end_time: end,
            source_app: None,
            metadata: Metadata::new(),
        }
    }

    /// Sleep stage interval; the stage label travels in metadata
    pub fn sleep_stage(stage: SleepStage, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::interval(MetricType::Sleep, stage.category_code(), "stage", start, end)
            .with_metadata("stage", serde_json::Value::from(stage.as_str()))
    }

    pub fn with_source_app(mut self, source_app: impl Into<String>) -> Self {
        self.source_app = Some(source_app.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// One stored wearable reading. Append-only: never mutated once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub patient_id: String,
    pub device_id: String,
    pub metric_type: MetricType,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_app: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: Metadata,
    pub recorded_at: DateTime<Utc>,
}

impl MetricSample {
    /// Stamp a producer candidate with identity and ingestion time
    pub fn from_candidate(
        patient_id: &str,
        device_id: &str,
        candidate: SampleCandidate,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            device_id: device_id.to_string(),
            metric_type: candidate.metric_type,
            value: candidate.value,
            unit: candidate.unit,
            timestamp: candidate.timestamp,
            start_time: candidate.start_time,
            end_time: candidate.end_time,
            source_app: candidate.source_app,
            metadata: candidate.metadata,
            recorded_at,
        }
    }

    /// Reject samples that cannot be meaningfully stored or aggregated
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.patient_id.trim().is_empty() {
            return Err(ValidationError::MissingIdentity("patient_id"));
        }
        if self.device_id.trim().is_empty() {
            return Err(ValidationError::MissingIdentity("device_id"));
        }
        if !self.value.is_finite() {
            return Err(ValidationError::NonFiniteValue);
        }
        if self.end_time < self.start_time {
            return Err(ValidationError::InvertedInterval);
        }

        match self.metric_type.aggregation() {
            AggregationKind::Cumulative if self.value < 0.0 => {
                Err(ValidationError::NegativeCumulative {
                    metric: self.metric_type.to_string(),
                    value: self.value,
                })
            }
            AggregationKind::Sleep if self.end_time == self.start_time => {
                Err(ValidationError::EmptySleepInterval)
            }
            _ => match self.metric_type {
                MetricType::HeartRate | MetricType::RestingHeartRate => {
                    let (min, max) = HEART_RATE_RANGE;
                    if self.value < min || self.value > max {
                        Err(ValidationError::OutOfRange {
                            metric: self.metric_type.to_string(),
                            value: self.value,
                            min,
                            max,
                        })
                    } else {
                        Ok(())
                    }
                }
                _ => Ok(()),
            },
        }
    }

    /// Interval length in hours
    pub fn duration_hours(&self) -> f64 {
        (self.end_time - self.start_time).num_milliseconds() as f64 / 3_600_000.0
    }

    /// Sleep stage carried by a sleep sample, if any
    pub fn sleep_stage(&self) -> Option<SleepStage> {
        if self.metric_type != MetricType::Sleep {
            return None;
        }
        self.metadata
            .get("stage")
            .and_then(|v| v.as_str())
            .and_then(SleepStage::from_label)
            .or_else(|| SleepStage::from_category_code(self.value))
    }
}

/// Rollup bucket width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    pub fn step(&self) -> Duration {
        match self {
            Granularity::Hour => Duration::hours(1),
            Granularity::Day => Duration::days(1),
        }
    }

    /// Start of the UTC bucket containing `ts`
    pub fn floor(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        // UTC rounding to whole hours/days cannot overflow for chrono's range
        ts.duration_trunc(self.step()).unwrap_or(ts)
    }
}

/// A time-windowed aggregate derived from raw samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupBucket {
    pub metric_type: MetricType,
    pub bucket_start: DateTime<Utc>,
    pub granularity: Granularity,
    /// Sum of values; absent for rate metrics
    pub total: Option<f64>,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: u32,
}

/// Sleep stage classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepStage {
    InBed,
    Awake,
    Core,
    Deep,
    Rem,
    AsleepUnspecified,
}

impl SleepStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SleepStage::InBed => "in_bed",
            SleepStage::Awake => "awake",
            SleepStage::Core => "core",
            SleepStage::Deep => "deep",
            SleepStage::Rem => "rem",
            SleepStage::AsleepUnspecified => "asleep",
        }
    }

    /// Parse a stage label; accepts HealthKit spellings as well
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "in_bed" | "inbed" => Some(SleepStage::InBed),
            "awake" => Some(SleepStage::Awake),
            "core" | "light" | "asleepcore" | "asleep_core" => Some(SleepStage::Core),
            "deep" | "asleepdeep" | "asleep_deep" => Some(SleepStage::Deep),
            "rem" | "asleeprem" | "asleep_rem" => Some(SleepStage::Rem),
            "asleep" | "asleepunspecified" | "asleep_unspecified" => {
                Some(SleepStage::AsleepUnspecified)
            }
            _ => None,
        }
    }

    /// HealthKit sleep-analysis category value
    pub fn from_category_code(code: f64) -> Option<Self> {
        if code.fract() != 0.0 {
            return None;
        }
        match code as i64 {
            0 => Some(SleepStage::InBed),
            1 => Some(SleepStage::AsleepUnspecified),
            2 => Some(SleepStage::Awake),
            3 => Some(SleepStage::Core),
            4 => Some(SleepStage::Deep),
            5 => Some(SleepStage::Rem),
            _ => None,
        }
    }

    pub fn category_code(&self) -> f64 {
        match self {
            SleepStage::InBed => 0.0,
            SleepStage::AsleepUnspecified => 1.0,
            SleepStage::Awake => 2.0,
            SleepStage::Core => 3.0,
            SleepStage::Deep => 4.0,
            SleepStage::Rem => 5.0,
        }
    }
}

/// Hours spent in each sleep stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageDurations {
    pub awake: f64,
    pub rem: f64,
    pub core: f64,
    pub deep: f64,
}

impl StageDurations {
    /// Credit `hours` to a stage. Unspecified sleep counts as core;
    /// in-bed time is not a stage.
    pub fn add(&mut self, stage: SleepStage, hours: f64) {
        match stage {
            SleepStage::Awake => self.awake += hours,
            SleepStage::Rem => self.rem += hours,
            SleepStage::Core | SleepStage::AsleepUnspecified => self.core += hours,
            SleepStage::Deep => self.deep += hours,
            SleepStage::InBed => {}
        }
    }

    pub fn merge(&mut self, other: &StageDurations) {
        self.awake += other.awake;
        self.rem += other.rem;
        self.core += other.core;
        self.deep += other.deep;
    }

    /// Sum of all non-awake stages
    pub fn asleep(&self) -> f64 {
        self.rem + self.core + self.deep
    }
}

/// Sleep session stitched from near-contiguous stage samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepSession {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub stage_durations: StageDurations,
    /// Session span (hours)
    pub time_in_bed: f64,
    /// Non-awake stage time (hours), never more than `time_in_bed`
    pub time_asleep: f64,
}

/// Hourly and daily rollups for one metric
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub hourly: Vec<RollupBucket>,
    pub daily: Vec<RollupBucket>,
}

impl MetricSeries {
    pub fn is_empty(&self) -> bool {
        self.hourly.is_empty() && self.daily.is_empty()
    }
}

/// Sleep-specific summary detail for the current day
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SleepDetail {
    pub time_in_bed: f64,
    pub time_asleep: f64,
    pub stage_durations: StageDurations,
    pub sessions: Vec<SleepSession>,
}

/// "Today vs baseline" summary for one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    /// Total for cumulative metrics, average for rate metrics, asleep hours for sleep
    pub value: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub count: u32,
    pub baseline: Option<f64>,
    /// Signed, rounded percent change vs baseline; `None` when the baseline is zero or absent
    pub change_percent: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep: Option<SleepDetail>,
}

/// Most recent reading of a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestValue {
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_app: Option<String>,
}

/// Per-device sync bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSync {
    pub device_id: String,
    pub last_sync: DateTime<Utc>,
    pub data_points_synced: u64,
}

/// Device metadata included in a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(alias = "total_metric_count")]
    pub total_metrics: u64,
    #[serde(default)]
    pub devices: Vec<DeviceSync>,
}

/// Token identifying one consistent read; strictly increasing
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(pub u64);

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One atomically produced bundle of summary, time series and device data.
///
/// Immutable once built; a newer snapshot replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComprehensiveSnapshot {
    pub patient_id: String,
    pub generated_at: DateTime<Utc>,
    pub generation_id: GenerationId,
    pub days: u32,
    pub summary: BTreeMap<MetricType, MetricSummary>,
    pub time_series: BTreeMap<MetricType, MetricSeries>,
    #[serde(default)]
    pub latest_values: BTreeMap<MetricType, LatestValue>,
    pub device_info: DeviceInfo,
}

impl ComprehensiveSnapshot {
    pub fn summary_for(&self, metric: MetricType) -> Option<&MetricSummary> {
        self.summary.get(&metric)
    }

    pub fn series_for(&self, metric: MetricType) -> Option<&MetricSeries> {
        self.time_series.get(&metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 12, h, m, 0).unwrap()
    }

    fn sample(metric: MetricType, value: f64) -> MetricSample {
        MetricSample::from_candidate(
            "patient-1",
            "watch-1",
            SampleCandidate::point(metric, value, metric.default_unit(), at(8, 0)),
            at(9, 0),
        )
    }

    #[test]
    fn test_metric_type_names() {
        for metric in MetricType::ALL {
            assert_eq!(metric.as_str().parse::<MetricType>().unwrap(), metric);
            let json = serde_json::to_string(&metric).unwrap();
            assert_eq!(json, format!("\"{}\"", metric.as_str()));
        }
        assert!("blood_pressure".parse::<MetricType>().is_err());
    }

    #[test]
    fn test_aggregation_kinds() {
        assert_eq!(MetricType::Steps.aggregation(), AggregationKind::Cumulative);
        assert_eq!(MetricType::FlightsClimbed.aggregation(), AggregationKind::Cumulative);
        assert_eq!(MetricType::HeartRate.aggregation(), AggregationKind::Rate);
        assert_eq!(MetricType::Vo2Max.aggregation(), AggregationKind::Rate);
        assert_eq!(MetricType::Sleep.aggregation(), AggregationKind::Sleep);
    }

    #[test]
    fn test_granularity_floor() {
        let ts = Utc.with_ymd_and_hms(2025, 11, 12, 13, 47, 12).unwrap();
        assert_eq!(Granularity::Hour.floor(ts), at(13, 0));
        assert_eq!(Granularity::Day.floor(ts), at(0, 0));
    }

    #[test]
    fn test_validation_rules() {
        assert!(sample(MetricType::Steps, 120.0).validate().is_ok());
        assert!(sample(MetricType::HeartRate, 72.0).validate().is_ok());

        assert!(matches!(
            sample(MetricType::Steps, -5.0).validate(),
            Err(ValidationError::NegativeCumulative { .. })
        ));
        assert!(matches!(
            sample(MetricType::HeartRate, 400.0).validate(),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert_eq!(
            sample(MetricType::Calories, f64::NAN).validate(),
            Err(ValidationError::NonFiniteValue)
        );

        let mut orphan = sample(MetricType::Steps, 1.0);
        orphan.device_id = "  ".to_string();
        assert_eq!(
            orphan.validate(),
            Err(ValidationError::MissingIdentity("device_id"))
        );

        let mut inverted = sample(MetricType::Distance, 1.0);
        inverted.end_time = inverted.start_time - Duration::minutes(1);
        assert_eq!(inverted.validate(), Err(ValidationError::InvertedInterval));

        let empty_sleep = sample(MetricType::Sleep, 3.0);
        assert_eq!(
            empty_sleep.validate(),
            Err(ValidationError::EmptySleepInterval)
        );
    }

    #[test]
    fn test_sleep_stage_resolution() {
        let candidate = SampleCandidate::sleep_stage(SleepStage::Deep, at(1, 0), at(2, 0));
        let stored = MetricSample::from_candidate("p", "d", candidate, at(9, 0));
        assert_eq!(stored.sleep_stage(), Some(SleepStage::Deep));
        assert!((stored.duration_hours() - 1.0).abs() < 1e-9);

        // Falls back to the HealthKit category code when no label is present
        let coded = MetricSample::from_candidate(
            "p",
            "d",
            SampleCandidate::interval(MetricType::Sleep, 5.0, "", at(1, 0), at(1, 30)),
            at(9, 0),
        );
        assert_eq!(coded.sleep_stage(), Some(SleepStage::Rem));

        assert_eq!(SleepStage::from_label("AsleepCore"), Some(SleepStage::Core));
        assert_eq!(SleepStage::from_label("in bed"), Some(SleepStage::InBed));
        assert_eq!(SleepStage::from_label("napping"), None);
        assert_eq!(SleepStage::from_category_code(2.5), None);
    }

    #[test]
    fn test_stage_durations() {
        let mut durations = StageDurations::default();
        durations.add(SleepStage::Core, 2.0);
        durations.add(SleepStage::AsleepUnspecified, 0.5);
        durations.add(SleepStage::Awake, 0.25);
        durations.add(SleepStage::InBed, 8.0);
        durations.add(SleepStage::Rem, 1.0);

        assert_eq!(durations.core, 2.5);
        assert_eq!(durations.awake, 0.25);
        assert_eq!(durations.asleep(), 3.5);
    }

    #[test]
    fn test_device_info_accepts_legacy_count_name() {
        let info: DeviceInfo =
            serde_json::from_str(r#"{"last_sync": null, "total_metric_count": 100}"#).unwrap();
        assert_eq!(info.total_metrics, 100);
        assert!(info.devices.is_empty());
    }
}
