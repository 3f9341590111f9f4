//! Aggregation engine
//!
//! Turns committed samples into hourly and daily [`RollupBucket`]s. Two
//! semantics apply, picked by [`MetricType::aggregation`]:
//!
//! - cumulative metrics carry `total = Σ value` plus per-sample avg/min/max
//! - rate metrics carry avg/min/max only
//!
//! Sleep is stitched into [`SleepSession`]s first. Sleep buckets group
//! sessions by the UTC hour/day of their start, with `total` holding the
//! summed `time_asleep`.
//!
//! All bucket boundaries are UTC. Buckets are sparse: a window with no
//! samples yields an empty sequence, not an error.

mod bucket;
mod sleep;

pub use sleep::stitch_sessions;

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

use crate::config::{BaselinePolicy, RollupConfig};
use crate::error::RollupError;
use crate::types::{
    AggregationKind, Granularity, MetricSample, MetricSeries, MetricType, RollupBucket,
    SleepSession,
};
use bucket::BucketSet;

/// Half-open UTC interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Smallest window covering both
    pub fn union(&self, other: &TimeWindow) -> TimeWindow {
        TimeWindow {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Every window one snapshot build needs, derived from a single instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupWindows {
    pub as_of: DateTime<Utc>,
    /// `hourly_hours` hours ending at the close of the current hour
    pub hourly: TimeWindow,
    /// `days` UTC days ending at the close of today
    pub daily: TimeWindow,
    pub today: TimeWindow,
    /// Days before today read by the baseline policy
    pub baseline: TimeWindow,
}

impl RollupWindows {
    pub fn new(
        as_of: DateTime<Utc>,
        days: u32,
        hourly_hours: u32,
        baseline: BaselinePolicy,
    ) -> Result<Self, RollupError> {
        if days == 0 || hourly_hours == 0 {
            return Err(RollupError::InvalidWindow(format!(
                "days ({days}) and hourly hours ({hourly_hours}) must be positive"
            )));
        }

        let hour_end = shift(Granularity::Hour.floor(as_of), Duration::hours(1))?;
        let today_start = Granularity::Day.floor(as_of);
        let today_end = shift(today_start, Duration::days(1))?;

        Ok(Self {
            as_of,
            hourly: TimeWindow::new(
                shift(hour_end, -Duration::hours(i64::from(hourly_hours)))?,
                hour_end,
            ),
            daily: TimeWindow::new(shift(today_end, -Duration::days(i64::from(days)))?, today_end),
            today: TimeWindow::new(today_start, today_end),
            baseline: TimeWindow::new(
                shift(today_start, -Duration::days(i64::from(baseline.lookback_days())))?,
                today_start,
            ),
        })
    }

    pub fn from_config(
        as_of: DateTime<Utc>,
        days: u32,
        config: &RollupConfig,
    ) -> Result<Self, RollupError> {
        Self::new(as_of, days, config.hourly_window_hours, config.baseline)
    }

    /// Range the daily buckets must cover for both display and baseline
    pub fn daily_analysis(&self) -> TimeWindow {
        self.daily.union(&self.baseline).union(&self.today)
    }

    /// Range of samples to read. Reaches one extra day back so a session
    /// that started just before the analysis range is stitched whole.
    pub fn scan(&self) -> TimeWindow {
        let covered = self.daily_analysis().union(&self.hourly);
        let start = covered
            .start
            .checked_sub_signed(Duration::days(1))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        TimeWindow::new(start, covered.end)
    }

    /// Start of each baseline day, most recent first
    pub fn baseline_days(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let days = (self.baseline.end - self.baseline.start).num_days();
        (1..=days).map(move |n| self.today.start - Duration::days(n))
    }
}

fn shift(from: DateTime<Utc>, by: Duration) -> Result<DateTime<Utc>, RollupError> {
    from.checked_add_signed(by).ok_or_else(|| {
        RollupError::InvalidWindow(format!("{from} shifted by {by} is out of range"))
    })
}

/// Output of one aggregation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RollupSet {
    /// Every metric type, possibly with empty series
    pub series: BTreeMap<MetricType, MetricSeries>,
    pub sleep_sessions: Vec<SleepSession>,
}

impl RollupSet {
    pub fn daily_bucket(&self, metric: MetricType, day_start: DateTime<Utc>) -> Option<&RollupBucket> {
        self.series
            .get(&metric)?
            .daily
            .iter()
            .find(|b| b.bucket_start == day_start)
    }

    /// Sessions that started inside `window`
    pub fn sessions_in(&self, window: TimeWindow) -> impl Iterator<Item = &SleepSession> {
        self.sleep_sessions
            .iter()
            .filter(move |s| window.contains(s.start_time))
    }

    /// Time series for delivery, keeping only daily buckets inside `daily`
    pub fn into_time_series(self, daily: TimeWindow) -> BTreeMap<MetricType, MetricSeries> {
        self.series
            .into_iter()
            .map(|(metric, mut series)| {
                series.daily.retain(|b| daily.contains(b.bucket_start));
                (metric, series)
            })
            .collect()
    }
}

/// Rollup computation over in-memory sample slices
#[derive(Debug, Clone)]
pub struct AggregationEngine {
    sleep_gap: Duration,
}

impl Default for AggregationEngine {
    fn default() -> Self {
        Self::from_config(&RollupConfig::default())
    }
}

impl AggregationEngine {
    pub fn new(sleep_gap: Duration) -> Self {
        Self { sleep_gap }
    }

    pub fn from_config(config: &RollupConfig) -> Self {
        Self::new(config.sleep_gap())
    }

    pub fn sleep_gap(&self) -> Duration {
        self.sleep_gap
    }

    /// Ordered buckets of one metric within `[window_start, window_end)`
    pub fn rollup(
        &self,
        samples: &[MetricSample],
        metric: MetricType,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<RollupBucket>, RollupError> {
        if window_end < window_start {
            return Err(RollupError::InvalidWindow(format!(
                "window end {window_end} precedes start {window_start}"
            )));
        }
        let window = TimeWindow::new(window_start, window_end);

        let buckets = match metric.aggregation() {
            AggregationKind::Sleep => {
                let sessions = self.sessions(samples);
                session_buckets(&sessions, granularity, window)
            }
            kind => {
                let mut set =
                    BucketSet::new(metric, granularity, window, kind == AggregationKind::Cumulative);
                for sample in samples.iter().filter(|s| s.metric_type == metric) {
                    set.push(sample.timestamp, sample.value);
                }
                set.finish()
            }
        };
        Ok(buckets)
    }

    /// Stitch the sleep samples among `samples` into sessions
    pub fn sessions(&self, samples: &[MetricSample]) -> Vec<SleepSession> {
        stitch_sessions(samples, self.sleep_gap)
    }

    /// Hourly and daily series for every metric in one pass over `samples`.
    ///
    /// Daily buckets span [`RollupWindows::daily_analysis`] so the summary can
    /// read its baseline days from the same result.
    pub fn rollup_all(&self, samples: &[MetricSample], windows: &RollupWindows) -> RollupSet {
        let analysis = windows.daily_analysis();

        let mut sets: BTreeMap<MetricType, (BucketSet, BucketSet)> = MetricType::ALL
            .iter()
            .filter(|m| m.aggregation() != AggregationKind::Sleep)
            .map(|&m| {
                let with_total = m.aggregation() == AggregationKind::Cumulative;
                (
                    m,
                    (
                        BucketSet::new(m, Granularity::Hour, windows.hourly, with_total),
                        BucketSet::new(m, Granularity::Day, analysis, with_total),
                    ),
                )
            })
            .collect();
        let mut sleep_samples = Vec::new();

        for sample in samples {
            if sample.metric_type.aggregation() == AggregationKind::Sleep {
                sleep_samples.push(sample);
            } else if let Some((hourly, daily)) = sets.get_mut(&sample.metric_type) {
                hourly.push(sample.timestamp, sample.value);
                daily.push(sample.timestamp, sample.value);
            }
        }

        let sleep_sessions = stitch_sessions(sleep_samples, self.sleep_gap);

        let mut series: BTreeMap<MetricType, MetricSeries> = sets
            .into_iter()
            .map(|(metric, (hourly, daily))| {
                (
                    metric,
                    MetricSeries {
                        hourly: hourly.finish(),
                        daily: daily.finish(),
                    },
                )
            })
            .collect();
        series.insert(
            MetricType::Sleep,
            MetricSeries {
                hourly: session_buckets(&sleep_sessions, Granularity::Hour, windows.hourly),
                daily: session_buckets(&sleep_sessions, Granularity::Day, analysis),
            },
        );

        tracing::debug!(
            samples = samples.len(),
            sleep_sessions = sleep_sessions.len(),
            "Aggregated samples"
        );

        RollupSet {
            series,
            sleep_sessions,
        }
    }
}

fn session_buckets(
    sessions: &[SleepSession],
    granularity: Granularity,
    window: TimeWindow,
) -> Vec<RollupBucket> {
    let mut set = BucketSet::new(MetricType::Sleep, granularity, window, true);
    for session in sessions {
        set.push(session.start_time, session.time_asleep);
    }
    set.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SampleCandidate, SleepStage};
    use chrono::TimeZone;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, d, h, m, 0).unwrap()
    }

    fn sample(candidate: SampleCandidate) -> MetricSample {
        MetricSample::from_candidate("patient-1", "watch-1", candidate, at(12, 12, 0))
    }

    fn steps(value: f64, ts: DateTime<Utc>) -> MetricSample {
        sample(SampleCandidate::point(MetricType::Steps, value, "count", ts))
    }

    fn windows(as_of: DateTime<Utc>, days: u32) -> RollupWindows {
        RollupWindows::new(as_of, days, 24, BaselinePolicy::Yesterday).unwrap()
    }

    #[test]
    fn test_steps_hourly_and_daily() {
        let samples = vec![
            steps(10.0, at(12, 0, 5)),
            steps(20.0, at(12, 0, 45)),
            steps(5.0, at(12, 1, 10)),
        ];
        let engine = AggregationEngine::default();

        let hourly = engine
            .rollup(&samples, MetricType::Steps, at(12, 0, 0), at(13, 0, 0), Granularity::Hour)
            .unwrap();
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[0].bucket_start, at(12, 0, 0));
        assert_eq!(hourly[0].total, Some(30.0));
        assert_eq!(hourly[0].count, 2);
        assert_eq!(hourly[1].bucket_start, at(12, 1, 0));
        assert_eq!(hourly[1].total, Some(5.0));
        assert_eq!(hourly[1].count, 1);

        let daily = engine
            .rollup(&samples, MetricType::Steps, at(12, 0, 0), at(13, 0, 0), Granularity::Day)
            .unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].total, Some(35.0));
    }

    #[test]
    fn test_empty_window_is_not_an_error() {
        let engine = AggregationEngine::default();
        let buckets = engine
            .rollup(&[], MetricType::HeartRate, at(12, 0, 0), at(13, 0, 0), Granularity::Hour)
            .unwrap();
        assert!(buckets.is_empty());

        assert!(matches!(
            engine.rollup(&[], MetricType::Steps, at(13, 0, 0), at(12, 0, 0), Granularity::Day),
            Err(RollupError::InvalidWindow(_))
        ));
    }

    #[test]
    fn test_hourly_totals_sum_to_daily_total() {
        let samples: Vec<MetricSample> = (0..24)
            .flat_map(|h| {
                [
                    steps(f64::from(h) * 1.5 + 0.1, at(12, h, 3)),
                    steps(7.3, at(12, h, 41)),
                ]
            })
            .collect();
        let engine = AggregationEngine::default();
        let set = engine.rollup_all(&samples, &windows(at(12, 23, 30), 7));

        let series = &set.series[&MetricType::Steps];
        let hourly_sum: f64 = series.hourly.iter().filter_map(|b| b.total).sum();
        let daily_total = set
            .daily_bucket(MetricType::Steps, at(12, 0, 0))
            .and_then(|b| b.total)
            .unwrap();
        assert_eq!(series.hourly.len(), 24);
        assert!((hourly_sum - daily_total).abs() < 1e-9);
    }

    #[test]
    fn test_rollup_all_matches_single_series() {
        let samples = vec![
            steps(10.0, at(11, 9, 0)),
            steps(20.0, at(12, 9, 0)),
            sample(SampleCandidate::point(MetricType::HeartRate, 62.0, "bpm", at(12, 8, 0))),
            sample(SampleCandidate::point(MetricType::HeartRate, 88.0, "bpm", at(12, 8, 30))),
        ];
        let engine = AggregationEngine::default();
        let w = windows(at(12, 10, 0), 7);
        let set = engine.rollup_all(&samples, &w);

        for metric in [MetricType::Steps, MetricType::HeartRate] {
            let hourly = engine
                .rollup(&samples, metric, w.hourly.start, w.hourly.end, Granularity::Hour)
                .unwrap();
            assert_eq!(set.series[&metric].hourly, hourly);
        }

        let hr = &set.series[&MetricType::HeartRate].hourly[0];
        assert_eq!(hr.total, None);
        assert_eq!(hr.avg, 75.0);
        assert_eq!((hr.min, hr.max), (62.0, 88.0));

        // Every metric is present even without data
        assert_eq!(set.series.len(), MetricType::ALL.len());
        assert!(set.series[&MetricType::Vo2Max].is_empty());
    }

    #[test]
    fn test_sleep_buckets_follow_session_start_day() {
        let samples = vec![
            sample(SampleCandidate::sleep_stage(SleepStage::Core, at(11, 23, 0), at(12, 3, 0))),
            sample(SampleCandidate::sleep_stage(SleepStage::Awake, at(12, 3, 0), at(12, 3, 30))),
            sample(SampleCandidate::sleep_stage(SleepStage::Deep, at(12, 3, 30), at(12, 6, 0))),
        ];
        let engine = AggregationEngine::default();
        let set = engine.rollup_all(&samples, &windows(at(12, 10, 0), 7));

        assert_eq!(set.sleep_sessions.len(), 1);
        let daily = &set.series[&MetricType::Sleep].daily;
        assert_eq!(daily.len(), 1);
        // Belongs to the 11th, the day the session started
        assert_eq!(daily[0].bucket_start, at(11, 0, 0));
        assert_eq!(daily[0].total, Some(6.5));
        assert_eq!(daily[0].count, 1);

        for session in &set.sleep_sessions {
            assert!(session.time_asleep <= session.time_in_bed);
        }
    }

    #[test]
    fn test_windows_layout() {
        let w = RollupWindows::new(at(12, 10, 20), 7, 24, BaselinePolicy::TrailingMean { days: 14 })
            .unwrap();

        assert_eq!(w.hourly, TimeWindow::new(at(11, 11, 0), at(12, 11, 0)));
        assert_eq!(w.daily, TimeWindow::new(at(6, 0, 0), at(13, 0, 0)));
        assert_eq!(w.today, TimeWindow::new(at(12, 0, 0), at(13, 0, 0)));
        assert_eq!(w.baseline.start, Utc.with_ymd_and_hms(2025, 10, 29, 0, 0, 0).unwrap());
        assert_eq!(w.daily_analysis().start, w.baseline.start);
        assert_eq!(w.scan().start, w.baseline.start - Duration::days(1));
        assert_eq!(w.baseline_days().next(), Some(at(11, 0, 0)));
        assert_eq!(w.baseline_days().count(), 14);

        assert!(RollupWindows::new(at(12, 0, 0), 0, 24, BaselinePolicy::Yesterday).is_err());
    }

    #[test]
    fn test_out_of_range_windows_are_rejected() {
        let huge_days = RollupWindows::new(at(12, 10, 0), u32::MAX, 24, BaselinePolicy::Yesterday);
        assert!(matches!(huge_days, Err(RollupError::InvalidWindow(_))));

        let huge_baseline = RollupWindows::new(
            at(12, 10, 0),
            7,
            24,
            BaselinePolicy::TrailingMean { days: u32::MAX },
        );
        assert!(matches!(huge_baseline, Err(RollupError::InvalidWindow(_))));

        let end_of_time = RollupWindows::new(DateTime::<Utc>::MAX_UTC, 1, 1, BaselinePolicy::Yesterday);
        assert!(matches!(end_of_time, Err(RollupError::InvalidWindow(_))));
    }

    #[test]
    fn test_time_series_trimmed_to_display_days() {
        let samples = vec![steps(10.0, at(5, 9, 0)), steps(20.0, at(12, 9, 0))];
        let engine = AggregationEngine::default();
        let w = RollupWindows::new(at(12, 10, 0), 1, 24, BaselinePolicy::TrailingMean { days: 7 })
            .unwrap();
        let set = engine.rollup_all(&samples, &w);

        assert!(set.daily_bucket(MetricType::Steps, at(5, 0, 0)).is_some());
        let series = set.into_time_series(w.daily);
        assert_eq!(series[&MetricType::Steps].daily.len(), 1);
        assert_eq!(series[&MetricType::Steps].daily[0].bucket_start, at(12, 0, 0));
    }
}
