//! Durable "last safely completed" cursor per harvest target.
//!
//! The file store writes the new record to a temporary file in the same
//! directory, syncs it, and renames it over the previous record. A reader sees
//! either the old record or the new one, never a torn write.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::cursor::Cursor;
use crate::traits::HarvestError;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last committed cursor, or `None` when the target was never harvested.
    async fn load(&self) -> Result<Option<Cursor>, HarvestError>;

    /// Replaces the committed cursor. Failures are transient.
    async fn commit(&self, cursor: &Cursor) -> Result<(), HarvestError>;
}

/// On-disk checkpoint record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub target: String,
    pub cursor: Cursor,
    pub committed_at: i64,
}

/// Record shapes accepted on load, newest first.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredRecord {
    Current(CheckpointRecord),
    /// `{"last_page": n}`: page `n` was the last one completed.
    LegacyPage { last_page: u32 },
    /// `{"last_token": t}`: `t` is the token to continue from.
    LegacyToken { last_token: Option<String> },
}

impl StoredRecord {
    fn into_cursor(self) -> Cursor {
        match self {
            StoredRecord::Current(record) => record.cursor,
            StoredRecord::LegacyPage { last_page } => {
                Cursor::NumericPage(last_page.saturating_add(1))
            }
            StoredRecord::LegacyToken { last_token } => {
                Cursor::OpaqueToken(last_token.filter(|t| !t.is_empty()))
            }
        }
    }
}

/// Record left by the single-target tool this harvester replaces.
pub const LEGACY_RECORD_FILE: &str = "page_now.json";

/// Checkpoint kept in `<state_dir>/checkpoint_<target>.json`.
///
/// Until the first commit, `<state_dir>/page_now.json` is read in its place.
/// It is never written.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    target: String,
    path: PathBuf,
    legacy_path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(state_dir: &Path, target: &str) -> Self {
        Self {
            target: target.to_string(),
            path: state_dir.join(format!("checkpoint_{}.json", target)),
            legacy_path: state_dir.join(LEGACY_RECORD_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(path: &Path) -> Result<Option<Cursor>, HarvestError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: StoredRecord = serde_json::from_str(&raw).map_err(|e| {
            HarvestError::defect(format!("unreadable checkpoint '{}': {}", path.display(), e))
        })?;
        Ok(Some(record.into_cursor()))
    }

    fn write(path: &Path, record: &CheckpointRecord) -> Result<(), HarvestError> {
        let dir = path
            .parent()
            .ok_or_else(|| HarvestError::defect("checkpoint path has no parent directory"))?;
        std::fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| HarvestError::Io(e.error))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<Cursor>, HarvestError> {
        let path = self.path.clone();
        let legacy_path = self.legacy_path.clone();
        let (cursor, imported) = tokio::task::spawn_blocking(move || match Self::read(&path)? {
            Some(cursor) => Ok((Some(cursor), false)),
            None => Self::read(&legacy_path).map(|cursor| {
                let imported = cursor.is_some();
                (cursor, imported)
            }),
        })
        .await
        .map_err(|e| HarvestError::defect(format!("checkpoint read task failed: {}", e)))??;

        if imported {
            info!(
                target_kind = %self.target,
                path = %self.legacy_path.display(),
                cursor = ?cursor,
                "Imported legacy checkpoint"
            );
        } else {
            debug!(target_kind = %self.target, cursor = ?cursor, "Checkpoint loaded");
        }
        Ok(cursor)
    }

    async fn commit(&self, cursor: &Cursor) -> Result<(), HarvestError> {
        let record = CheckpointRecord {
            target: self.target.clone(),
            cursor: cursor.clone(),
            committed_at: unix_now(),
        };
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::write(&path, &record))
            .await
            .map_err(|e| HarvestError::transient(format!("checkpoint write task failed: {}", e)))??;
        info!(target_kind = %self.target, cursor = %cursor, "Checkpoint committed");
        Ok(())
    }
}

/// Process-local store. Used for runs that must not move the durable
/// checkpoint, and in tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    cursor: Mutex<Option<Cursor>>,
}

impl MemoryCheckpointStore {
    pub fn new(initial: Option<Cursor>) -> Self {
        Self {
            cursor: Mutex::new(initial),
        }
    }

    pub fn current(&self) -> Option<Cursor> {
        self.cursor.lock().map(|c| (*c).clone()).unwrap_or(None)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<Cursor>, HarvestError> {
        Ok(self.current())
    }

    async fn commit(&self, cursor: &Cursor) -> Result<(), HarvestError> {
        let mut slot = self
            .cursor
            .lock()
            .map_err(|_| HarvestError::defect("checkpoint lock poisoned"))?;
        *slot = Some(cursor.clone());
        Ok(())
    }
}

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
