//! Ingestion deduplicator
//!
//! Stamps producer candidates with identity, validates them one by one and
//! appends them to the sample store. Every item is isolated: a duplicate, a
//! malformed reading or a storage failure on one item is recorded in the
//! [`BatchResult`] and the rest of the batch carries on.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::sync::Arc;

use crate::error::ValidationError;
use crate::store::{InsertOutcome, SampleStore};
use crate::types::{MetricSample, SampleCandidate};

/// Outcome of ingesting one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResult {
    pub inserted: usize,
    pub duplicate: usize,
    pub rejected: Vec<RejectedSample>,
}

impl BatchResult {
    /// Number of candidates the batch contained
    pub fn total(&self) -> usize {
        self.inserted + self.duplicate + self.rejected.len()
    }
}

/// A candidate that was not stored, by its position in the batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedSample {
    pub index: usize,
    #[serde(serialize_with = "serialize_reason")]
    pub reason: ValidationError,
}

fn serialize_reason<S: Serializer>(reason: &ValidationError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(reason)
}

/// Append-only batch ingestion over a [`SampleStore`]
#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn SampleStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn SampleStore>) -> Self {
        Self { store }
    }

    /// Ingest a batch for one patient/device, stamping `recorded_at = now`
    pub fn ingest(
        &self,
        patient_id: &str,
        device_id: &str,
        candidates: Vec<SampleCandidate>,
    ) -> BatchResult {
        self.ingest_at(patient_id, device_id, candidates, Utc::now())
    }

    /// Ingest a batch with an explicit ingestion time
    pub fn ingest_at(
        &self,
        patient_id: &str,
        device_id: &str,
        candidates: Vec<SampleCandidate>,
        recorded_at: DateTime<Utc>,
    ) -> BatchResult {
        let mut result = BatchResult::default();

        for (index, candidate) in candidates.into_iter().enumerate() {
            let sample = MetricSample::from_candidate(patient_id, device_id, candidate, recorded_at);

            if let Err(reason) = sample.validate() {
                tracing::debug!(index, metric = %sample.metric_type, %reason, "Rejected sample");
                result.rejected.push(RejectedSample { index, reason });
                continue;
            }

            match self.store.insert(&sample) {
                Ok(InsertOutcome::Inserted) => result.inserted += 1,
                Ok(InsertOutcome::Duplicate) => result.duplicate += 1,
                Err(e) => {
                    tracing::warn!(index, metric = %sample.metric_type, error = %e, "Storage rejected sample");
                    result.rejected.push(RejectedSample {
                        index,
                        reason: ValidationError::Storage(e.to_string()),
                    });
                }
            }
        }

        if result.inserted > 0 {
            // Bookkeeping only; the samples are already committed
            if let Err(e) = self.store.record_sync(
                patient_id,
                device_id,
                recorded_at,
                result.inserted as u64,
            ) {
                tracing::warn!(patient_id, device_id, error = %e, "Failed to update device sync");
            }
        }

        tracing::info!(
            patient_id,
            device_id,
            inserted = result.inserted,
            duplicate = result.duplicate,
            rejected = result.rejected.len(),
            "Ingested batch"
        );

        result
    }
}
