//! Snapshot assembly
//!
//! Builds a [`ComprehensiveSnapshot`] from one [`SampleView`]. Every field of
//! the snapshot is derived from that single read, so all of them share the
//! view's generation id. Any failure aborts the build; no partially filled
//! snapshot is ever returned.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::aggregation::{AggregationEngine, RollupWindows};
use crate::config::{RollupConfig, MAX_HISTORY_DAYS};
use crate::error::RollupError;
use crate::store::{SampleStore, SampleView};
use crate::summary::SummaryCalculator;
use crate::types::{ComprehensiveSnapshot, LatestValue, MetricSample, MetricType};

/// Assembles snapshots from the sample store
#[derive(Clone)]
pub struct SnapshotAssembler {
    store: Arc<dyn SampleStore>,
    engine: AggregationEngine,
    summary: SummaryCalculator,
    config: RollupConfig,
}

impl SnapshotAssembler {
    pub fn new(store: Arc<dyn SampleStore>, config: RollupConfig) -> Self {
        Self {
            store,
            engine: AggregationEngine::from_config(&config),
            summary: SummaryCalculator::new(config.baseline),
            config,
        }
    }

    pub fn config(&self) -> &RollupConfig {
        &self.config
    }

    /// Snapshot of `patient_id` with `days` days of daily history, as of now
    pub fn get_comprehensive_snapshot(
        &self,
        patient_id: &str,
        days: u32,
    ) -> Result<ComprehensiveSnapshot, RollupError> {
        self.snapshot_at(patient_id, days, Utc::now())
    }

    /// Snapshot with windows anchored at `as_of`
    pub fn snapshot_at(
        &self,
        patient_id: &str,
        days: u32,
        as_of: DateTime<Utc>,
    ) -> Result<ComprehensiveSnapshot, RollupError> {
        let max = self.config.max_days.min(MAX_HISTORY_DAYS);
        if days == 0 || days > max {
            return Err(RollupError::InvalidDays {
                requested: days,
                max,
            });
        }

        let windows = RollupWindows::from_config(as_of, days, &self.config)?;
        let scan = windows.scan();
        let view = self.store.read_view(patient_id, scan.start, scan.end)?;

        let snapshot = self.assemble(view, days, &windows);
        tracing::info!(
            patient_id,
            days,
            generation_id = %snapshot.generation_id,
            total_metrics = snapshot.device_info.total_metrics,
            backend = self.store.backend_name(),
            "Assembled snapshot"
        );
        Ok(snapshot)
    }

    fn assemble(
        &self,
        view: SampleView,
        days: u32,
        windows: &RollupWindows,
    ) -> ComprehensiveSnapshot {
        let rollups = self.engine.rollup_all(&view.samples, windows);
        let summary = self.summary.summarize(&rollups, windows);
        let latest_values = latest_values(&view.samples);
        let time_series = rollups.into_time_series(windows.daily);

        ComprehensiveSnapshot {
            patient_id: view.patient_id,
            generated_at: view.read_at,
            generation_id: view.generation_id,
            days,
            summary,
            time_series,
            latest_values,
            device_info: view.device_info,
        }
    }
}

/// Most recent reading of each metric, by end time
pub fn latest_values(samples: &[MetricSample]) -> BTreeMap<MetricType, LatestValue> {
    let mut latest: BTreeMap<MetricType, &MetricSample> = BTreeMap::new();
    for sample in samples {
        latest
            .entry(sample.metric_type)
            .and_modify(|current| {
                if sample.end_time >= current.end_time {
                    *current = sample;
                }
            })
            .or_insert(sample);
    }

    latest
        .into_iter()
        .map(|(metric, sample)| {
            let unit = if sample.unit.is_empty() {
                metric.default_unit().to_string()
            } else {
                sample.unit.clone()
            };
            (
                metric,
                LatestValue {
                    value: sample.value,
                    unit,
                    timestamp: sample.end_time,
                    source_app: sample.source_app.clone(),
                },
            )
        })
        .collect()
}
