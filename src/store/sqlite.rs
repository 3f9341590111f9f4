//! SQLite sample store
//!
//! The dedup key is a `UNIQUE` constraint and inserts use
//! `ON CONFLICT DO NOTHING`, so two racing inserts of the same sample resolve
//! inside SQLite: one row changes, the other reports zero changes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::Duration;

use super::{GenerationClock, InsertOutcome, SampleStore, SampleView};
use crate::error::RollupError;
use crate::types::{DeviceInfo, DeviceSync, Metadata, MetricSample, MetricType};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS metric_samples (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id     TEXT    NOT NULL,
    device_id      TEXT    NOT NULL,
    metric_type    TEXT    NOT NULL,
    timestamp_us   INTEGER NOT NULL,
    value          REAL    NOT NULL,
    unit           TEXT    NOT NULL,
    start_us       INTEGER NOT NULL,
    end_us         INTEGER NOT NULL,
    source_app     TEXT,
    metadata       TEXT    NOT NULL DEFAULT '{}',
    recorded_at_us INTEGER NOT NULL,
    UNIQUE (patient_id, device_id, metric_type, timestamp_us)
);

CREATE INDEX IF NOT EXISTS idx_metric_samples_patient_ts
    ON metric_samples (patient_id, timestamp_us);

CREATE TABLE IF NOT EXISTS device_sync (
    patient_id         TEXT    NOT NULL,
    device_id          TEXT    NOT NULL,
    last_sync_us       INTEGER NOT NULL,
    data_points_synced INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (patient_id, device_id)
);
"#;

/// Row as stored, before domain conversion
struct StoredRow {
    patient_id: String,
    device_id: String,
    metric_type: String,
    timestamp_us: i64,
    value: f64,
    unit: String,
    start_us: i64,
    end_us: i64,
    source_app: Option<String>,
    metadata: String,
    recorded_at_us: i64,
}

impl StoredRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            patient_id: row.get(0)?,
            device_id: row.get(1)?,
            metric_type: row.get(2)?,
            timestamp_us: row.get(3)?,
            value: row.get(4)?,
            unit: row.get(5)?,
            start_us: row.get(6)?,
            end_us: row.get(7)?,
            source_app: row.get(8)?,
            metadata: row.get(9)?,
            recorded_at_us: row.get(10)?,
        })
    }

    fn into_sample(self) -> Result<MetricSample, RollupError> {
        let metadata: Metadata = serde_json::from_str(&self.metadata)?;
        Ok(MetricSample {
            metric_type: self.metric_type.parse::<MetricType>()?,
            timestamp: from_micros(self.timestamp_us)?,
            start_time: from_micros(self.start_us)?,
            end_time: from_micros(self.end_us)?,
            recorded_at: from_micros(self.recorded_at_us)?,
            patient_id: self.patient_id,
            device_id: self.device_id,
            value: self.value,
            unit: self.unit,
            source_app: self.source_app,
            metadata,
        })
    }
}

fn from_micros(us: i64) -> Result<DateTime<Utc>, RollupError> {
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| RollupError::CorruptSample(format!("timestamp {us} out of range")))
}

/// SQLite-backed [`SampleStore`]
pub struct SqliteSampleStore {
    conn: Mutex<Connection>,
    clock: GenerationClock,
}

impl std::fmt::Debug for SqliteSampleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSampleStore").finish_non_exhaustive()
    }
}

impl SqliteSampleStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RollupError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        tracing::debug!(path = %path.as_ref().display(), journal_mode = %mode, "Opened sample store");
        Self::with_connection(conn)
    }

    /// Private in-memory database, mainly for tests and one-shot tools
    pub fn open_in_memory() -> Result<Self, RollupError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RollupError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock: GenerationClock::new(),
        })
    }
}

impl SampleStore for SqliteSampleStore {
    fn insert(&self, sample: &MetricSample) -> Result<InsertOutcome, RollupError> {
        let metadata = serde_json::to_string(&sample.metadata)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            INSERT INTO metric_samples (
                patient_id, device_id, metric_type, timestamp_us,
                value, unit, start_us, end_us,
                source_app, metadata, recorded_at_us
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT (patient_id, device_id, metric_type, timestamp_us) DO NOTHING
            "#,
            params![
                sample.patient_id,
                sample.device_id,
                sample.metric_type.as_str(),
                sample.timestamp.timestamp_micros(),
                sample.value,
                sample.unit,
                sample.start_time.timestamp_micros(),
                sample.end_time.timestamp_micros(),
                sample.source_app,
                metadata,
                sample.recorded_at.timestamp_micros(),
            ],
        )?;

        Ok(if changed == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    fn record_sync(
        &self,
        patient_id: &str,
        device_id: &str,
        at: DateTime<Utc>,
        inserted: u64,
    ) -> Result<(), RollupError> {
        let inserted = i64::try_from(inserted).unwrap_or(i64::MAX);
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO device_sync (patient_id, device_id, last_sync_us, data_points_synced)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (patient_id, device_id) DO UPDATE SET
                last_sync_us       = max(last_sync_us, excluded.last_sync_us),
                data_points_synced = data_points_synced + excluded.data_points_synced
            "#,
            params![patient_id, device_id, at.timestamp_micros(), inserted],
        )?;
        Ok(())
    }

    fn read_view(
        &self,
        patient_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<SampleView, RollupError> {
        if to < from {
            return Err(RollupError::InvalidWindow(format!(
                "window end {to} precedes start {from}"
            )));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let read_at = Utc::now();
        let generation_id = self.clock.next(read_at);

        let rows = {
            let mut stmt = tx.prepare(
                r#"
                SELECT patient_id, device_id, metric_type, timestamp_us,
                       value, unit, start_us, end_us,
                       source_app, metadata, recorded_at_us
                FROM metric_samples
                WHERE patient_id = ?1 AND timestamp_us >= ?2 AND timestamp_us < ?3
                ORDER BY timestamp_us, id
                "#,
            )?;
            let rows = stmt.query_map(
                params![patient_id, from.timestamp_micros(), to.timestamp_micros()],
                StoredRow::from_row,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let total: i64 = tx.query_row(
            "SELECT COUNT(*) FROM metric_samples WHERE patient_id = ?1",
            params![patient_id],
            |row| row.get(0),
        )?;

        let device_rows = {
            let mut stmt = tx.prepare(
                r#"
                SELECT device_id, last_sync_us, data_points_synced
                FROM device_sync
                WHERE patient_id = ?1
                ORDER BY device_id
                "#,
            )?;
            let rows = stmt.query_map(params![patient_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        tx.commit()?;
        drop(conn);

        let samples = rows
            .into_iter()
            .map(StoredRow::into_sample)
            .collect::<Result<Vec<_>, _>>()?;

        let mut devices = Vec::with_capacity(device_rows.len());
        for (device_id, last_sync_us, points) in device_rows {
            devices.push(DeviceSync {
                device_id,
                last_sync: from_micros(last_sync_us)?,
                data_points_synced: u64::try_from(points).unwrap_or(0),
            });
        }

        let device_info = DeviceInfo {
            last_sync: devices.iter().map(|d| d.last_sync).max(),
            total_metrics: u64::try_from(total).unwrap_or(0),
            devices,
        };

        Ok(SampleView {
            patient_id: patient_id.to_string(),
            generation_id,
            read_at,
            samples,
            device_info,
        })
    }

    fn count(&self, patient_id: &str) -> Result<u64, RollupError> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM metric_samples WHERE patient_id = ?1",
            params![patient_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SampleCandidate;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 12, h, m, 0).unwrap()
    }

    fn heart_rate(value: f64, ts: DateTime<Utc>) -> MetricSample {
        MetricSample::from_candidate(
            "patient-1",
            "watch-1",
            SampleCandidate::point(MetricType::HeartRate, value, "bpm", ts)
                .with_source_app("com.apple.health")
                .with_metadata("device", serde_json::json!("Apple Watch")),
            at(12, 0),
        )
    }

    #[test]
    fn test_duplicate_key_is_reported_not_stored() {
        let store = SqliteSampleStore::open_in_memory().unwrap();
        let sample = heart_rate(70.0, at(8, 0));

        assert_eq!(store.insert(&sample).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(&sample).unwrap(), InsertOutcome::Duplicate);

        // Same key with a different value is still the same sample
        let mut changed = sample.clone();
        changed.value = 99.0;
        assert_eq!(store.insert(&changed).unwrap(), InsertOutcome::Duplicate);

        assert_eq!(store.count("patient-1").unwrap(), 1);
    }

    #[test]
    fn test_dedup_key_components() {
        let store = SqliteSampleStore::open_in_memory().unwrap();
        let base = heart_rate(70.0, at(8, 0));
        store.insert(&base).unwrap();

        let mut other_device = base.clone();
        other_device.device_id = "phone-1".to_string();
        let mut other_metric = base.clone();
        other_metric.metric_type = MetricType::RestingHeartRate;
        let other_time = heart_rate(70.0, at(8, 1));

        for sample in [&other_device, &other_metric, &other_time] {
            assert_eq!(store.insert(sample).unwrap(), InsertOutcome::Inserted);
        }
        assert_eq!(store.count("patient-1").unwrap(), 4);
    }

    #[test]
    fn test_read_view_round_trips_samples_in_window() {
        let store = SqliteSampleStore::open_in_memory().unwrap();
        // Inserted out of order
        store.insert(&heart_rate(80.0, at(10, 0))).unwrap();
        store.insert(&heart_rate(60.0, at(6, 0))).unwrap();
        store.insert(&heart_rate(70.0, at(8, 0))).unwrap();
        store.record_sync("patient-1", "watch-1", at(10, 5), 3).unwrap();

        let view = store.read_view("patient-1", at(7, 0), at(11, 0)).unwrap();

        let values: Vec<f64> = view.samples.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![70.0, 80.0]);
        assert_eq!(view.samples[0], heart_rate(70.0, at(8, 0)));
        assert_eq!(view.device_info.total_metrics, 3);
        assert_eq!(view.device_info.last_sync, Some(at(10, 5)));
        assert_eq!(view.device_info.devices[0].data_points_synced, 3);
    }

    #[test]
    fn test_read_view_generations_increase() {
        let store = SqliteSampleStore::open_in_memory().unwrap();
        let first = store.read_view("patient-1", at(0, 0), at(23, 0)).unwrap();
        let second = store.read_view("patient-1", at(0, 0), at(23, 0)).unwrap();
        assert!(second.generation_id > first.generation_id);
        assert!(first.samples.is_empty());
        assert_eq!(first.device_info.last_sync, None);
    }

    #[test]
    fn test_record_sync_accumulates() {
        let store = SqliteSampleStore::open_in_memory().unwrap();
        store.record_sync("patient-1", "watch-1", at(9, 0), 10).unwrap();
        store.record_sync("patient-1", "watch-1", at(8, 0), 5).unwrap();

        let view = store.read_view("patient-1", at(0, 0), at(23, 0)).unwrap();
        let device = &view.device_info.devices[0];
        assert_eq!(device.data_points_synced, 15);
        // An older sync time never moves last_sync backwards
        assert_eq!(device.last_sync, at(9, 0));
    }

    #[test]
    fn test_rejects_inverted_window() {
        let store = SqliteSampleStore::open_in_memory().unwrap();
        assert!(matches!(
            store.read_view("patient-1", at(9, 0), at(8, 0)),
            Err(RollupError::InvalidWindow(_))
        ));
    }

    #[test]
    fn test_concurrent_identical_inserts_resolve_once() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteSampleStore::open(dir.path().join("samples.db")).unwrap());
        let sample = heart_rate(70.0, at(8, 0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let sample = sample.clone();
                std::thread::spawn(move || store.insert(&sample).unwrap())
            })
            .collect();

        let outcomes: Vec<InsertOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let inserted = outcomes
            .iter()
            .filter(|o| **o == InsertOutcome::Inserted)
            .count();

        assert_eq!(inserted, 1);
        assert_eq!(store.count("patient-1").unwrap(), 1);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("samples.db");
        {
            let store = SqliteSampleStore::open(&path).unwrap();
            store.insert(&heart_rate(70.0, at(8, 0))).unwrap();
        }
        let reopened = SqliteSampleStore::open(&path).unwrap();
        assert_eq!(
            reopened.insert(&heart_rate(70.0, at(8, 0))).unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(reopened.backend_name(), "sqlite");
    }
}
