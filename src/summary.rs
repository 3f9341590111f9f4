//! Summary calculation
//!
//! Derives the "today vs baseline" view of every metric from a
//! [`RollupSet`]. The baseline is either yesterday's daily value or the mean
//! of the available daily values over a trailing window.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::aggregation::{RollupSet, RollupWindows};
use crate::config::BaselinePolicy;
use crate::types::{AggregationKind, MetricSummary, MetricType, RollupBucket, SleepDetail};

/// Percent change of `current` relative to `baseline`, rounded half away
/// from zero.
///
/// Undefined (`None`) when either side is missing or the baseline is zero.
pub fn change_percent(current: Option<f64>, baseline: Option<f64>) -> Option<i64> {
    match (current, baseline) {
        (Some(curr), Some(base)) if base != 0.0 => {
            let pct = ((curr - base) / base) * 100.0;
            pct.is_finite().then(|| pct.round() as i64)
        }
        _ => None,
    }
}

/// Value a daily bucket contributes: total for summed metrics, average for rates
fn bucket_value(kind: AggregationKind, bucket: &RollupBucket) -> f64 {
    match kind {
        AggregationKind::Cumulative | AggregationKind::Sleep => bucket.total.unwrap_or(0.0),
        AggregationKind::Rate => bucket.avg,
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Per-metric summary calculator
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryCalculator {
    policy: BaselinePolicy,
}

impl SummaryCalculator {
    pub fn new(policy: BaselinePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> BaselinePolicy {
        self.policy
    }

    /// Summaries for every metric type
    pub fn summarize(
        &self,
        rollups: &RollupSet,
        windows: &RollupWindows,
    ) -> BTreeMap<MetricType, MetricSummary> {
        MetricType::ALL
            .iter()
            .map(|&metric| (metric, self.summarize_metric(rollups, windows, metric)))
            .collect()
    }

    pub fn summarize_metric(
        &self,
        rollups: &RollupSet,
        windows: &RollupWindows,
        metric: MetricType,
    ) -> MetricSummary {
        let kind = metric.aggregation();
        let today = rollups.daily_bucket(metric, windows.today.start);
        let baseline = self.baseline(rollups, windows, metric);

        let value = match (today, kind) {
            (Some(bucket), _) => Some(bucket_value(kind, bucket)),
            // Nothing recorded today counts as zero for summed metrics once
            // there is history to compare against
            (None, AggregationKind::Cumulative | AggregationKind::Sleep) if baseline.is_some() => {
                Some(0.0)
            }
            (None, _) => None,
        };

        let sleep = (kind == AggregationKind::Sleep).then(|| self.sleep_detail(rollups, windows));

        MetricSummary {
            value,
            min: today.map(|b| b.min),
            max: today.map(|b| b.max),
            count: today.map_or(0, |b| b.count),
            baseline,
            change_percent: change_percent(value, baseline),
            sleep,
        }
    }

    fn baseline(
        &self,
        rollups: &RollupSet,
        windows: &RollupWindows,
        metric: MetricType,
    ) -> Option<f64> {
        let kind = metric.aggregation();
        let day_value = |day: DateTime<Utc>| {
            rollups
                .daily_bucket(metric, day)
                .map(|b| bucket_value(kind, b))
        };

        match self.policy {
            BaselinePolicy::Yesterday => windows.baseline_days().next().and_then(day_value),
            BaselinePolicy::TrailingMean { .. } => {
                let values: Vec<f64> = windows.baseline_days().filter_map(day_value).collect();
                mean(&values)
            }
        }
    }

    fn sleep_detail(&self, rollups: &RollupSet, windows: &RollupWindows) -> SleepDetail {
        let mut detail = SleepDetail::default();
        for session in rollups.sessions_in(windows.today) {
            detail.time_in_bed += session.time_in_bed;
            detail.time_asleep += session.time_asleep;
            detail.stage_durations.merge(&session.stage_durations);
            detail.sessions.push(session.clone());
        }
        detail
    }
}
