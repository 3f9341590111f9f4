//! Cache entry, state machine and card views

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::types::{
    ComprehensiveSnapshot, GenerationId, LatestValue, MetricSeries, MetricSummary, MetricType,
};

/// Lifecycle of the cached snapshot
///
/// `Empty → Loading → (Fresh | Stale)`, `Fresh/Stale → Loading` on refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    /// Nothing cached yet
    Empty,
    /// A fetch is in flight; any previous snapshot is still served
    Loading,
    /// Snapshot came from the latest successful fetch
    Fresh,
    /// Snapshot is the last known good one (failed refresh or disk copy)
    Stale,
}

/// Everything one UI card renders, all from the same snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Card {
    pub metric: MetricType,
    pub generation_id: GenerationId,
    pub summary: Option<MetricSummary>,
    pub series: MetricSeries,
    pub latest: Option<LatestValue>,
}

/// Card views derived from one snapshot at swap time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardSet {
    pub generation_id: GenerationId,
    pub cards: BTreeMap<MetricType, Card>,
}

impl CardSet {
    pub fn from_snapshot(snapshot: &ComprehensiveSnapshot) -> Self {
        let generation_id = snapshot.generation_id;
        let cards = MetricType::ALL
            .iter()
            .map(|&metric| {
                let card = Card {
                    metric,
                    generation_id,
                    summary: snapshot.summary.get(&metric).cloned(),
                    series: snapshot.time_series.get(&metric).cloned().unwrap_or_default(),
                    latest: snapshot.latest_values.get(&metric).cloned(),
                };
                (metric, card)
            })
            .collect();

        Self {
            generation_id,
            cards,
        }
    }

    pub fn card(&self, metric: MetricType) -> Option<&Card> {
        self.cards.get(&metric)
    }
}

/// One immutable cache state. A new entry replaces the old one whole.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub snapshot: Option<Arc<ComprehensiveSnapshot>>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub state: CacheState,
    /// Message of the most recent failed refresh, cleared by a successful one
    pub last_error: Option<String>,
    pub cards: Option<Arc<CardSet>>,
}

impl CacheEntry {
    pub fn empty() -> Self {
        Self {
            snapshot: None,
            fetched_at: None,
            state: CacheState::Empty,
            last_error: None,
            cards: None,
        }
    }

    /// Entry for a new snapshot, with its cards derived in the same step
    pub(crate) fn from_snapshot(
        snapshot: Arc<ComprehensiveSnapshot>,
        fetched_at: DateTime<Utc>,
        state: CacheState,
    ) -> Self {
        let cards = Arc::new(CardSet::from_snapshot(&snapshot));
        Self {
            snapshot: Some(snapshot),
            fetched_at: Some(fetched_at),
            state,
            last_error: None,
            cards: Some(cards),
        }
    }

    /// Same snapshot and cards, new state
    pub(crate) fn with_state(&self, state: CacheState, last_error: Option<String>) -> Self {
        Self {
            state,
            last_error,
            ..self.clone()
        }
    }

    pub fn generation_id(&self) -> Option<GenerationId> {
        self.snapshot.as_ref().map(|s| s.generation_id)
    }

    /// Time to show in a "last synced at" indicator
    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot
            .as_ref()
            .and_then(|s| s.device_info.last_sync)
            .or(self.fetched_at)
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self::empty()
    }
}
