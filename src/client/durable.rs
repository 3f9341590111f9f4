//! Durable snapshot file
//!
//! One file per cache domain, `<dir>/<domain>.snapshot.json`, always fully
//! replaced: the new content is written and synced to a uniquely named
//! staging file in the same directory, then renamed over the old file and
//! the directory synced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::CacheError;
use crate::types::{ComprehensiveSnapshot, GenerationId};

const SNAPSHOT_SUFFIX: &str = "snapshot.json";

/// Snapshot as persisted on disk
#[derive(Debug, Clone, Deserialize)]
pub struct DurableSnapshot {
    pub fetched_at: DateTime<Utc>,
    pub snapshot: ComprehensiveSnapshot,
}

#[derive(Serialize)]
struct DurableSnapshotRef<'a> {
    fetched_at: DateTime<Utc>,
    snapshot: &'a ComprehensiveSnapshot,
}

/// File-backed copy of the latest snapshot for one cache domain
#[derive(Debug)]
pub struct DurableStore {
    dir: PathBuf,
    domain: String,
    /// Newest generation on disk; writes are serialized through this lock
    written: Mutex<Option<GenerationId>>,
}

impl DurableStore {
    pub fn new(dir: impl Into<PathBuf>, domain: &str) -> Self {
        let domain: String = domain
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Self {
            dir: dir.into(),
            domain,
            written: Mutex::new(None),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.domain, SNAPSHOT_SUFFIX))
    }

    /// Read the durable copy. A missing file is `None`; an unreadable one is
    /// moved aside and also treated as `None`.
    pub async fn load(&self) -> Result<Option<DurableSnapshot>, CacheError> {
        let mut written = self.written.lock().await;
        let path = self.path();

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No durable snapshot");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<DurableSnapshot>(&bytes) {
            Ok(durable) => {
                let generation = durable.snapshot.generation_id;
                *written = (*written).max(Some(generation));
                tracing::debug!(path = %path.display(), %generation, "Loaded durable snapshot");
                Ok(Some(durable))
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Corrupt durable snapshot, ignoring it");
                let backup = path.with_extension(format!("corrupt.{}", Utc::now().timestamp()));
                if let Err(rename_err) = fs::rename(&path, &backup).await {
                    tracing::warn!(error = %rename_err, "Failed to move corrupt snapshot aside");
                }
                Ok(None)
            }
        }
    }

    /// Persist `snapshot` unless a newer generation is already on disk.
    ///
    /// Returns whether the file was written.
    pub async fn save(
        &self,
        snapshot: &ComprehensiveSnapshot,
        fetched_at: DateTime<Utc>,
    ) -> Result<bool, CacheError> {
        let mut written = self.written.lock().await;
        if (*written).is_some_and(|g| snapshot.generation_id <= g) {
            tracing::debug!(
                generation = %snapshot.generation_id,
                "Skipping durable write of an older generation"
            );
            return Ok(false);
        }

        let json = serde_json::to_vec(&DurableSnapshotRef {
            fetched_at,
            snapshot,
        })?;

        fs::create_dir_all(&self.dir).await?;
        let staging = self
            .dir
            .join(format!(".{}.{}.tmp", self.domain, Uuid::new_v4()));
        let path = self.path();

        if let Err(e) = write_synced(&staging, &json).await {
            fs::remove_file(&staging).await.ok();
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&staging, &path).await {
            fs::remove_file(&staging).await.ok();
            return Err(e.into());
        }
        if let Err(e) = sync_dir(&self.dir).await {
            tracing::debug!(dir = %self.dir.display(), error = %e, "Failed to sync cache directory");
        }

        *written = Some(snapshot.generation_id);
        tracing::debug!(
            path = %path.display(),
            generation = %snapshot.generation_id,
            bytes = json.len(),
            "Wrote durable snapshot"
        );
        Ok(true)
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

/// Make the rename itself durable
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
