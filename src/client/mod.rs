//! Client synchronization cache
//!
//! A two-level cache (memory + one durable file) in front of a
//! [`SnapshotSource`]. The in-memory state is an [`Observable`] holding an
//! `Arc<CacheEntry>`; every transition swaps the whole entry, so readers see
//! either the old snapshot with all of its cards or the new one with all of
//! its cards, never a mix.
//!
//! - [`SyncCache::get`] never touches the network.
//! - [`SyncCache::load_durable`] is the cold-start step and only reads disk.
//! - [`SyncCache::refresh`] is the only way to fetch; concurrent calls share
//!   one in-flight request.

mod durable;
mod flight;
mod observable;
mod source;
mod state;

pub use durable::{DurableSnapshot, DurableStore};
pub use flight::SingleFlight;
pub use observable::{Observable, Subscription};
pub use source::{LocalSource, SnapshotSource};
pub use state::{CacheEntry, CacheState, Card, CardSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::error::RollupError;
use crate::types::ComprehensiveSnapshot;

/// Errors surfaced by the client cache
#[derive(Debug, Error)]
pub enum CacheError {
    /// The fetch failed and there is no cached snapshot to fall back on
    #[error("Snapshot fetch failed: {0}")]
    Fetch(String),

    #[error("Durable cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Durable cache JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Refresh task ended without a result")]
    Aborted,

    #[error("Durable write task failed: {0}")]
    WriteTask(String),
}

/// Result of one fetch, shared by every caller that joined it
#[derive(Debug, Clone)]
enum FetchOutcome {
    Applied(Arc<CacheEntry>),
    /// A newer generation was already held; the fetched one was dropped
    Superseded(Arc<CacheEntry>),
    Failed {
        entry: Arc<CacheEntry>,
        message: String,
    },
}

struct Inner {
    patient_id: String,
    days: u32,
    source: Arc<dyn SnapshotSource>,
    durable: Option<Arc<DurableStore>>,
    state: Observable<Arc<CacheEntry>>,
    flights: SingleFlight<String, FetchOutcome>,
    writes: Mutex<Vec<JoinHandle<()>>>,
}

/// Snapshot cache for one patient session
#[derive(Clone)]
pub struct SyncCache {
    inner: Arc<Inner>,
}

impl SyncCache {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        durable: Option<DurableStore>,
        patient_id: impl Into<String>,
        days: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                patient_id: patient_id.into(),
                days,
                source,
                durable: durable.map(Arc::new),
                state: Observable::new(Arc::new(CacheEntry::empty())),
                flights: SingleFlight::new(),
                writes: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn patient_id(&self) -> &str {
        &self.inner.patient_id
    }

    /// Current entry; never blocks on the network
    pub fn get(&self) -> Arc<CacheEntry> {
        self.inner.state.get()
    }

    /// Receive every entry swap
    pub fn subscribe(&self) -> Subscription<Arc<CacheEntry>> {
        self.inner.state.subscribe()
    }

    /// Cold start: adopt the durable snapshot, if any, as `Stale`.
    ///
    /// Never fetches. A snapshot already held in memory that is at least as
    /// new is kept.
    pub async fn load_durable(&self) -> Result<Arc<CacheEntry>, CacheError> {
        let Some(durable) = &self.inner.durable else {
            return Ok(self.get());
        };
        let Some(loaded) = durable.load().await? else {
            return Ok(self.get());
        };

        let snapshot = Arc::new(loaded.snapshot);
        let entry = self.inner.state.replace_with(|current| {
            let newer = current
                .generation_id()
                .map_or(true, |held| snapshot.generation_id > held);
            if newer {
                Arc::new(CacheEntry::from_snapshot(
                    Arc::clone(&snapshot),
                    loaded.fetched_at,
                    CacheState::Stale,
                ))
            } else {
                Arc::clone(current)
            }
        });

        tracing::info!(
            patient_id = %self.inner.patient_id,
            generation_id = ?entry.generation_id(),
            "Loaded durable snapshot"
        );
        Ok(entry)
    }

    /// Fetch a new snapshot, joining any fetch already in flight.
    ///
    /// On failure with a cached snapshot the entry degrades to `Stale` and is
    /// returned as `Ok`; only a failure with nothing cached is an error.
    pub async fn refresh(&self) -> Result<Arc<CacheEntry>, CacheError> {
        let inner = Arc::clone(&self.inner);
        let outcome = self
            .inner
            .flights
            .run(self.inner.patient_id.clone(), move || inner.fetch_and_apply())
            .await;

        match outcome {
            None => Err(CacheError::Aborted),
            Some(FetchOutcome::Failed { entry, message }) if !entry.has_snapshot() => {
                Err(CacheError::Fetch(message))
            }
            Some(
                FetchOutcome::Applied(entry)
                | FetchOutcome::Superseded(entry)
                | FetchOutcome::Failed { entry, .. },
            ) => Ok(entry),
        }
    }

    /// Wait for every scheduled durable write to finish
    pub async fn flush(&self) -> Result<(), CacheError> {
        let pending = std::mem::take(&mut *self.inner.writes.lock());
        for handle in pending {
            handle
                .await
                .map_err(|e| CacheError::WriteTask(e.to_string()))?;
        }
        Ok(())
    }
}

impl Inner {
    async fn fetch_and_apply(self: Arc<Self>) -> FetchOutcome {
        let before = self.state.get().state;
        self.state
            .replace_with(|current| Arc::new(current.with_state(CacheState::Loading, None)));

        let source = Arc::clone(&self.source);
        let patient_id = self.patient_id.clone();
        let days = self.days;
        let fetched = tokio::spawn(async move { source.fetch(&patient_id, days).await })
            .await
            .unwrap_or_else(|e| Err(RollupError::Task(format!("Snapshot fetch task failed: {e}"))));

        match fetched {
            Ok(snapshot) => self.apply(snapshot, Utc::now(), before),
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(patient_id = %self.patient_id, error = %message, "Snapshot refresh failed");
                let entry = self.state.replace_with(|current| {
                    let state = if current.has_snapshot() {
                        CacheState::Stale
                    } else {
                        CacheState::Empty
                    };
                    Arc::new(current.with_state(state, Some(message.clone())))
                });
                FetchOutcome::Failed { entry, message }
            }
        }
    }

    fn apply(
        &self,
        snapshot: ComprehensiveSnapshot,
        fetched_at: DateTime<Utc>,
        before: CacheState,
    ) -> FetchOutcome {
        let snapshot = Arc::new(snapshot);
        let mut applied = false;

        let entry = self.state.replace_with(|current| {
            let newer = current
                .generation_id()
                .map_or(true, |held| snapshot.generation_id > held);
            if newer {
                applied = true;
                Arc::new(CacheEntry::from_snapshot(
                    Arc::clone(&snapshot),
                    fetched_at,
                    CacheState::Fresh,
                ))
            } else {
                let state = match before {
                    CacheState::Empty | CacheState::Loading if current.has_snapshot() => {
                        CacheState::Stale
                    }
                    state => state,
                };
                Arc::new(current.with_state(state, current.last_error.clone()))
            }
        });

        if !applied {
            tracing::debug!(
                patient_id = %self.patient_id,
                generation_id = %snapshot.generation_id,
                "Discarded superseded snapshot"
            );
            return FetchOutcome::Superseded(entry);
        }

        tracing::info!(
            patient_id = %self.patient_id,
            generation_id = %snapshot.generation_id,
            "Applied snapshot"
        );
        self.persist(snapshot, fetched_at);
        FetchOutcome::Applied(entry)
    }

    fn persist(&self, snapshot: Arc<ComprehensiveSnapshot>, fetched_at: DateTime<Utc>) {
        let Some(durable) = &self.durable else {
            return;
        };
        let durable = Arc::clone(durable);
        let handle = tokio::spawn(async move {
            if let Err(e) = durable.save(&snapshot, fetched_at).await {
                tracing::warn!(error = %e, "Failed to write durable snapshot");
            }
        });

        let mut writes = self.writes.lock();
        writes.retain(|h| !h.is_finished());
        writes.push(handle);
    }
}
