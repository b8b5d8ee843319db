//! Per-page JSONL artifacts.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::model::{BatchOutcomes, ItemReference, PageId, ProcessingOutcome};
use crate::traits::{HarvestError, Sink};

/// Writes `<dir>/<page_id>.jsonl`, one line per reference.
///
/// Each artifact is replaced atomically. A new batch is merged into what the
/// page already holds, so a redone or partly cancelled page never drops a
/// stored outcome.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    dir: PathBuf,
}

impl JsonlSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn page_path(&self, page_id: &PageId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", page_id))
    }

    /// Reads a persisted page back. `None` if the page was never persisted.
    pub fn load_page(&self, page_id: &PageId) -> Result<Option<BatchOutcomes>, HarvestError> {
        let raw = match std::fs::read_to_string(self.page_path(page_id)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut outcomes = BatchOutcomes::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let mut value: serde_json::Value = serde_json::from_str(line)?;
            let reference = value
                .as_object_mut()
                .and_then(|obj| obj.remove("ref"))
                .and_then(|r| r.as_str().map(ItemReference::new))
                .ok_or_else(|| {
                    HarvestError::defect(format!("page {} has a line without 'ref'", page_id))
                })?;
            let outcome: ProcessingOutcome = serde_json::from_value(value)?;
            outcomes.insert(reference, outcome);
        }
        Ok(Some(outcomes))
    }

    /// Overlays `incoming` on `stored`. A stored success only gives way to a
    /// newer success.
    fn merge(stored: Option<BatchOutcomes>, incoming: &BatchOutcomes) -> BatchOutcomes {
        let mut merged = stored.unwrap_or_default();
        for (reference, outcome) in incoming {
            let stored_success =
                matches!(merged.get(reference), Some(ProcessingOutcome::Success { .. }));
            let new_success = matches!(outcome, ProcessingOutcome::Success { .. });
            if stored_success && !new_success {
                debug!(item = %reference, "Keeping stored success over a later outcome");
                continue;
            }
            merged.insert(reference.clone(), outcome.clone());
        }
        merged
    }

    fn render(outcomes: &BatchOutcomes) -> Result<String, HarvestError> {
        let mut body = String::new();
        for (reference, outcome) in outcomes {
            let mut value = serde_json::to_value(outcome)?;
            if let Some(obj) = value.as_object_mut() {
                obj.insert("ref".to_string(), reference.as_str().into());
            }
            body.push_str(&serde_json::to_string(&value)?);
            body.push('\n');
        }
        Ok(body)
    }

    fn write_atomic(dir: &Path, target: &Path, body: &str) -> Result<(), HarvestError> {
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(body.as_bytes())?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(target).map_err(|e| HarvestError::Io(e.error))?;
        Ok(())
    }
}

#[async_trait]
impl Sink for JsonlSink {
    async fn persist(
        &self,
        page_id: &PageId,
        outcomes: &BatchOutcomes,
    ) -> Result<(), HarvestError> {
        let sink = self.clone();
        let id = page_id.clone();
        let incoming = outcomes.clone();

        let (path, items) = tokio::task::spawn_blocking(move || {
            let merged = Self::merge(sink.load_page(&id)?, &incoming);
            let target = sink.page_path(&id);
            Self::write_atomic(&sink.dir, &target, &Self::render(&merged)?)?;
            Ok::<_, HarvestError>((target, merged.len()))
        })
        .await
        .map_err(|e| HarvestError::transient(format!("page write task failed: {}", e)))??;

        info!(page = %page_id, items, path = %path.display(), "Page persisted");
        Ok(())
    }
}
