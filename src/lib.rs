//! Synheart Rollup - Wearable metric ingestion, rollups and snapshot sync
//!
//! Rollup turns raw wearable readings into consistent per-patient snapshots:
//! deduplicated ingestion → append-only sample log → hourly/daily rollups and
//! sleep sessions → today-vs-baseline summaries → one generation-stamped
//! snapshot → client cache with single-flight refresh and durable fallback.
//!
//! ## Modules
//!
//! - **Ingestion**: [`Deduplicator`] appends idempotently to a [`SampleStore`]
//! - **Aggregation**: [`AggregationEngine`] and [`SummaryCalculator`]
//! - **Snapshots**: [`SnapshotAssembler`] builds a [`ComprehensiveSnapshot`]
//!   from one consistent read
//! - **Client**: [`SyncCache`] serves snapshots while refreshing in the background

pub mod aggregation;
pub mod client;
pub mod config;
pub mod error;
pub mod ingest;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod summary;
pub mod types;

pub use aggregation::{AggregationEngine, RollupSet, RollupWindows, TimeWindow};
pub use client::{CacheEntry, CacheError, CacheState, DurableStore, LocalSource, SyncCache};
pub use config::{BaselinePolicy, RollupConfig};
pub use error::{RollupError, ValidationError};
pub use ingest::{BatchResult, Deduplicator};
pub use snapshot::SnapshotAssembler;
pub use store::{SampleStore, SqliteSampleStore};
pub use summary::{change_percent, SummaryCalculator};
pub use types::{ComprehensiveSnapshot, GenerationId, MetricSample, MetricType, SampleCandidate};

// Schema exports
pub use schema::{AppleHealthAdapter, AppleHealthExport};

/// Rollup version, reported by the CLI
pub const ROLLUP_VERSION: &str = env!("CARGO_PKG_VERSION");
