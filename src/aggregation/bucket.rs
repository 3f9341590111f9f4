//! Sparse bucket accumulation

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::TimeWindow;
use crate::types::{Granularity, MetricType, RollupBucket};

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    sum: f64,
    min: f64,
    max: f64,
    count: u32,
}

impl Accumulator {
    fn new(value: f64) -> Self {
        Self {
            sum: value,
            min: value,
            max: value,
            count: 1,
        }
    }

    fn push(&mut self, value: f64) {
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.count += 1;
    }
}

/// Buckets of one metric at one granularity, restricted to a window.
///
/// Only buckets that receive at least one value exist.
#[derive(Debug, Clone)]
pub(crate) struct BucketSet {
    metric: MetricType,
    granularity: Granularity,
    window: TimeWindow,
    with_total: bool,
    buckets: BTreeMap<DateTime<Utc>, Accumulator>,
}

impl BucketSet {
    pub(crate) fn new(
        metric: MetricType,
        granularity: Granularity,
        window: TimeWindow,
        with_total: bool,
    ) -> Self {
        Self {
            metric,
            granularity,
            window,
            with_total,
            buckets: BTreeMap::new(),
        }
    }

    /// Add a value keyed by `ts`; values outside the window are ignored
    pub(crate) fn push(&mut self, ts: DateTime<Utc>, value: f64) {
        if !self.window.contains(ts) {
            return;
        }
        self.buckets
            .entry(self.granularity.floor(ts))
            .and_modify(|acc| acc.push(value))
            .or_insert_with(|| Accumulator::new(value));
    }

    /// Ordered buckets
    pub(crate) fn finish(self) -> Vec<RollupBucket> {
        let Self {
            metric,
            granularity,
            with_total,
            buckets,
            ..
        } = self;

        buckets
            .into_iter()
            .map(|(bucket_start, acc)| RollupBucket {
                metric_type: metric,
                bucket_start,
                granularity,
                total: with_total.then_some(acc.sum),
                avg: acc.sum / f64::from(acc.count),
                min: acc.min,
                max: acc.max,
                count: acc.count,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 12, h, m, 0).unwrap()
    }

    fn day() -> TimeWindow {
        TimeWindow::new(at(0, 0), at(0, 0) + chrono::Duration::days(1))
    }

    #[test]
    fn test_cumulative_buckets() {
        let mut set = BucketSet::new(MetricType::Steps, Granularity::Hour, day(), true);
        set.push(at(0, 5), 10.0);
        set.push(at(0, 45), 20.0);
        set.push(at(1, 10), 5.0);

        let buckets = set.finish();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket_start, at(0, 0));
        assert_eq!(buckets[0].total, Some(30.0));
        assert_eq!(buckets[0].avg, 15.0);
        assert_eq!(buckets[0].min, 10.0);
        assert_eq!(buckets[0].max, 20.0);
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[1].total, Some(5.0));
        assert_eq!(buckets[1].count, 1);
    }

    #[test]
    fn test_rate_buckets_have_no_total() {
        let mut set = BucketSet::new(MetricType::HeartRate, Granularity::Day, day(), false);
        set.push(at(8, 0), 60.0);
        set.push(at(9, 0), 80.0);

        let buckets = set.finish();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].total, None);
        assert_eq!(buckets[0].avg, 70.0);
    }

    #[test]
    fn test_window_is_half_open() {
        let window = TimeWindow::new(at(1, 0), at(2, 0));
        let mut set = BucketSet::new(MetricType::Steps, Granularity::Hour, window, true);
        set.push(at(0, 59), 1.0);
        set.push(at(1, 0), 2.0);
        set.push(at(2, 0), 4.0);

        let buckets = set.finish();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].total, Some(2.0));
    }
}
