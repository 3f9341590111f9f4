//! Producer input formats
//!
//! Apple Health exports as uploaded by the iOS app, and the adapter that
//! turns them into sample candidates for ingestion.

mod export;
mod adapter;

pub use export::*;
pub use adapter::*;
