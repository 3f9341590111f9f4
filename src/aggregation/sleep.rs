//! Sleep session stitching
//!
//! Sleep arrives as fragmented stage intervals. Intervals whose gap to the
//! running session is strictly below the configured threshold join it;
//! overlapping intervals (negative gap) always join.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::types::{MetricSample, MetricType, SleepSession, SleepStage, StageDurations};

/// Union of one stage's intervals, fed in start order
struct StageCover {
    run: Option<(DateTime<Utc>, DateTime<Utc>)>,
    covered: Duration,
}

impl Default for StageCover {
    fn default() -> Self {
        Self {
            run: None,
            covered: Duration::zero(),
        }
    }
}

impl StageCover {
    fn add(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        match self.run.as_mut() {
            Some((_, run_end)) if start <= *run_end => *run_end = (*run_end).max(end),
            _ => {
                if let Some((run_start, run_end)) = self.run.replace((start, end)) {
                    self.covered = self.covered + (run_end - run_start);
                }
            }
        }
    }

    fn hours(&self) -> f64 {
        let open = self.run.map_or(Duration::zero(), |(start, end)| end - start);
        (self.covered + open).num_milliseconds() as f64 / 3_600_000.0
    }
}

struct OpenSession {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    stages: HashMap<SleepStage, StageCover>,
}

impl OpenSession {
    fn new(sample: &MetricSample) -> Self {
        let mut session = Self {
            start: sample.start_time,
            end: sample.end_time,
            stages: HashMap::new(),
        };
        session.credit(sample);
        session
    }

    fn extend(&mut self, sample: &MetricSample) {
        self.end = self.end.max(sample.end_time);
        self.credit(sample);
    }

    fn credit(&mut self, sample: &MetricSample) {
        let stage = match sample.sleep_stage() {
            Some(SleepStage::InBed) => return,
            // Reported together with core, so overlaps between them count once
            Some(SleepStage::AsleepUnspecified) => SleepStage::Core,
            Some(stage) => stage,
            None => {
                tracing::debug!(
                    start = %sample.start_time,
                    "Sleep sample without a stage only extends the session span"
                );
                return;
            }
        };
        self.stages
            .entry(stage)
            .or_default()
            .add(sample.start_time, sample.end_time);
    }

    fn close(self) -> SleepSession {
        let time_in_bed = (self.end - self.start).num_milliseconds() as f64 / 3_600_000.0;
        let mut stage_durations = StageDurations::default();
        for (stage, cover) in &self.stages {
            stage_durations.add(*stage, cover.hours());
        }
        // Different stages reported for the same minutes still overlap
        let time_asleep = stage_durations.asleep().min(time_in_bed);
        SleepSession {
            start_time: self.start,
            end_time: self.end,
            stage_durations,
            time_in_bed,
            time_asleep,
        }
    }
}

/// Merge sleep-stage samples into sessions ordered by start time.
///
/// Non-sleep samples are ignored.
pub fn stitch_sessions<'a, I>(samples: I, gap: Duration) -> Vec<SleepSession>
where
    I: IntoIterator<Item = &'a MetricSample>,
{
    let mut intervals: Vec<&MetricSample> = samples
        .into_iter()
        .filter(|s| s.metric_type == MetricType::Sleep)
        .collect();
    intervals.sort_by_key(|s| (s.start_time, s.end_time));

    let mut sessions = Vec::new();
    let mut open: Option<OpenSession> = None;

    for sample in intervals {
        match open.as_mut() {
            Some(session) if sample.start_time - session.end < gap => session.extend(sample),
            _ => {
                if let Some(done) = open.replace(OpenSession::new(sample)) {
                    sessions.push(done.close());
                }
            }
        }
    }
    if let Some(done) = open {
        sessions.push(done.close());
    }

    sessions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SampleCandidate, SleepStage};
    use chrono::TimeZone;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, d, h, m, 0).unwrap()
    }

    fn stage(stage: SleepStage, start: DateTime<Utc>, end: DateTime<Utc>) -> MetricSample {
        MetricSample::from_candidate(
            "patient-1",
            "watch-1",
            SampleCandidate::sleep_stage(stage, start, end),
            end,
        )
    }

    #[test]
    fn test_contiguous_stages_form_one_session() {
        let samples = vec![
            stage(SleepStage::Core, at(11, 23, 0), at(12, 1, 0)),
            stage(SleepStage::Deep, at(12, 1, 0), at(12, 2, 30)),
            stage(SleepStage::Awake, at(12, 2, 30), at(12, 3, 0)),
            stage(SleepStage::Rem, at(12, 3, 10), at(12, 4, 10)),
        ];

        let sessions = stitch_sessions(&samples, Duration::minutes(30));

        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert_eq!(s.start_time, at(11, 23, 0));
        assert_eq!(s.end_time, at(12, 4, 10));
        assert!((s.stage_durations.core - 2.0).abs() < 1e-9);
        assert!((s.stage_durations.deep - 1.5).abs() < 1e-9);
        assert!((s.stage_durations.awake - 0.5).abs() < 1e-9);
        assert!((s.stage_durations.rem - 1.0).abs() < 1e-9);
        assert!((s.time_asleep - 4.5).abs() < 1e-9);
        assert!((s.time_in_bed - (5.0 + 10.0 / 60.0)).abs() < 1e-9);
    }

    #[test]
    fn test_gap_threshold_is_strict() {
        let samples = vec![
            stage(SleepStage::Core, at(12, 1, 0), at(12, 2, 0)),
            // Exactly 30 minutes later: a new session
            stage(SleepStage::Core, at(12, 2, 30), at(12, 3, 0)),
            // 29 minutes later: joins the second session
            stage(SleepStage::Rem, at(12, 3, 29), at(12, 4, 0)),
        ];

        let sessions = stitch_sessions(&samples, Duration::minutes(30));
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1].start_time, at(12, 2, 30));
        assert_eq!(sessions[1].end_time, at(12, 4, 0));

        let wider = stitch_sessions(&samples, Duration::minutes(31));
        assert_eq!(wider.len(), 1);
    }

    #[test]
    fn test_overlapping_sources_count_each_minute_once() {
        // Watch and phone report the same night
        let samples = vec![
            stage(SleepStage::Core, at(12, 0, 0), at(12, 6, 0)),
            stage(SleepStage::AsleepUnspecified, at(12, 0, 15), at(12, 5, 45)),
            stage(SleepStage::Deep, at(12, 6, 0), at(12, 7, 0)),
            stage(SleepStage::Deep, at(12, 6, 30), at(12, 7, 30)),
        ];

        let sessions = stitch_sessions(&samples, Duration::minutes(30));
        assert_eq!(sessions.len(), 1);
        let s = &sessions[0];
        assert_eq!(s.time_in_bed, 7.5);
        assert_eq!(s.stage_durations.core, 6.0);
        assert_eq!(s.stage_durations.deep, 1.5);
        assert_eq!(s.stage_durations.asleep(), s.time_in_bed);
        assert_eq!(s.time_asleep, 7.5);
    }

    #[test]
    fn test_conflicting_stages_keep_asleep_within_span() {
        let samples = vec![
            stage(SleepStage::Core, at(12, 0, 0), at(12, 2, 0)),
            stage(SleepStage::Rem, at(12, 1, 0), at(12, 2, 0)),
        ];

        let sessions = stitch_sessions(&samples, Duration::minutes(30));
        assert_eq!(sessions[0].stage_durations.asleep(), 3.0);
        assert_eq!(sessions[0].time_asleep, 2.0);
        assert!(sessions[0].stage_durations.core <= sessions[0].time_in_bed);
        assert!(sessions[0].stage_durations.rem <= sessions[0].time_in_bed);
    }

    #[test]
    fn test_in_bed_extends_span_only() {
        let samples = vec![
            stage(SleepStage::InBed, at(12, 22, 0), at(12, 23, 0)),
            stage(SleepStage::Deep, at(12, 23, 0), at(13, 1, 0)),
        ];

        let sessions = stitch_sessions(samples.iter(), Duration::minutes(30));
        assert_eq!(sessions[0].time_in_bed, 3.0);
        assert_eq!(sessions[0].time_asleep, 2.0);
        assert_eq!(sessions[0].stage_durations.awake, 0.0);
    }

    #[test]
    fn test_empty_input() {
        let none: Vec<MetricSample> = Vec::new();
        assert!(stitch_sessions(&none, Duration::minutes(30)).is_empty());
    }
}
