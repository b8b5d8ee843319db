//! Per-item enrichment pipeline.
//!
//! This module provides the [`ItemProcessor`] that runs an ordered list of
//! [`EnrichmentStep`]s for one listed item with:
//! - Classified retry of every step via [`BackoffExecutor`]
//! - A timeout per step attempt
//! - Structured logging via `tracing`
//! - A scoped scratch directory released on every exit path via RAII
//!   (`Drop` on [`ItemWorkspace`])

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::unix_now;
use crate::harvest::traits::{EnrichmentStep, StepContext};
use crate::model::{Fields, ItemRecord, ListedItem, ProcessingOutcome};
use crate::retry::BackoffExecutor;
use crate::traits::HarvestError;

// ============================================================================
// Workspace
// ============================================================================

/// Scratch directory owned by one item while its pipeline runs.
///
/// # RAII Cleanup
///
/// `ItemWorkspace` implements [`Drop`] so the directory, including any partial
/// download, is removed on success, skip, failure and panic alike. It does
/// not implement `Clone`; share `path()` instead.
#[derive(Debug)]
pub struct ItemWorkspace {
    path: PathBuf,
    cleanup_on_drop: bool,
}

impl ItemWorkspace {
    /// Creates `<root>/<stem>`. A directory left behind by a crashed run is
    /// wiped first.
    pub async fn create(
        root: &Path,
        stem: &str,
        cleanup_on_drop: bool,
    ) -> Result<Self, HarvestError> {
        let path = root.join(stem);
        if tokio::fs::try_exists(&path).await? {
            debug!(path = %path.display(), "Removing stale workspace");
            tokio::fs::remove_dir_all(&path).await?;
        }
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self {
            path,
            cleanup_on_drop,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolves `relative` inside the workspace, rejecting any path that
    /// would escape it.
    pub fn safe_child(&self, relative: &Path) -> Result<PathBuf, HarvestError> {
        for component in relative.components() {
            match component {
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(HarvestError::defect(format!(
                        "path escapes workspace: '{}'",
                        relative.display()
                    )));
                }
                _ => {}
            }
        }
        Ok(self.path.join(relative))
    }

    /// Returns the single file in the workspace root matching `predicate`.
    ///
    /// # Errors
    ///
    /// Zero or several matches are a [`HarvestError::Defect`]: the external
    /// tool did not produce the one artifact it promised.
    pub fn single_file<P>(&self, description: &str, predicate: P) -> Result<PathBuf, HarvestError>
    where
        P: Fn(&Path) -> bool,
    {
        let mut matches = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let path = entry?.path();
            if path.is_file() && predicate(&path) {
                matches.push(path);
            }
        }
        match matches.len() {
            1 => Ok(matches.remove(0)),
            n => Err(HarvestError::defect(format!(
                "expected exactly one {} in '{}', found {}",
                description,
                self.path.display(),
                n
            ))),
        }
    }

    /// Single file with the given extension (without the dot).
    pub fn single_file_with_extension(&self, extension: &str) -> Result<PathBuf, HarvestError> {
        self.single_file(&format!(".{} file", extension), |p| {
            p.extension().and_then(|e| e.to_str()) == Some(extension)
        })
    }
}

impl Drop for ItemWorkspace {
    fn drop(&mut self) {
        if self.cleanup_on_drop && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove workspace");
            }
        }
    }
}

// ============================================================================
// Item Processor
// ============================================================================

/// Ordered enrichment pipeline for one item.
///
/// Steps run sequentially; each one is retried by the executor on transient
/// failure and short-circuits the rest on anything else. The processor never
/// returns an error: every exit becomes a [`ProcessingOutcome`].
///
/// # Example
///
/// ```ignore
/// let processor = ItemProcessor::new(steps, BackoffExecutor::new(policy), work_dir)
///     .with_timeout(Duration::from_secs(120));
/// let outcome = processor.process(&listed_item).await;
/// ```
pub struct ItemProcessor {
    /// Enrichment steps in execution order
    steps: Vec<Box<dyn EnrichmentStep>>,

    /// Retry wrapper applied to every step
    executor: BackoffExecutor,

    /// Parent directory of per-item workspaces
    work_root: PathBuf,

    /// Timeout for each step attempt (default: 5 minutes)
    stage_timeout: Duration,

    /// Whether to remove workspaces when the item is done
    auto_cleanup: bool,
}

impl ItemProcessor {
    /// Default configuration:
    /// - Timeout: 5 minutes per step attempt
    /// - Auto-cleanup: enabled
    pub fn new(
        steps: Vec<Box<dyn EnrichmentStep>>,
        executor: BackoffExecutor,
        work_root: PathBuf,
    ) -> Self {
        Self {
            steps,
            executor,
            work_root,
            stage_timeout: Duration::from_secs(300),
            auto_cleanup: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Keeps workspaces on disk when `false`. Meant for debugging a step.
    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.auto_cleanup = cleanup;
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.stage_name()).collect()
    }

    #[instrument(skip(self, item), fields(item = %item.reference))]
    pub async fn process(&self, item: &ListedItem) -> ProcessingOutcome {
        let start = Instant::now();
        let outcome = match self.run_steps(item).await {
            Ok(fields) => ProcessingOutcome::Success {
                record: ItemRecord {
                    reference: item.reference.clone(),
                    harvest_timestamp: unix_now(),
                    harvester_version: env!("CARGO_PKG_VERSION").to_string(),
                    fields,
                },
            },
            Err(err) => {
                let outcome = ProcessingOutcome::from_error(&err);
                match &outcome {
                    ProcessingOutcome::Skipped { reason } => {
                        info!(reason = ?reason, error = %err, "Item skipped")
                    }
                    _ => warn!(error = %err, "Item failed"),
                }
                outcome
            }
        };

        debug!(
            duration_ms = start.elapsed().as_millis() as u64,
            success = outcome.is_success(),
            "Item finished"
        );
        outcome
    }

    async fn run_steps(&self, item: &ListedItem) -> Result<Fields, HarvestError> {
        // Dropped on every return path below, taking partial downloads with it.
        let stem = item.reference.file_stem();
        let workspace = ItemWorkspace::create(&self.work_root, &stem, self.auto_cleanup).await?;

        let mut fields = item.fields.clone();
        for step in &self.steps {
            let stage = step.stage_name();
            let ctx = StepContext {
                item,
                workspace: &workspace,
                fields: &fields,
            };
            let ctx_ref = &ctx;
            let step_ref: &dyn EnrichmentStep = &**step;
            let stage_timeout = self.stage_timeout;

            let output = self
                .executor
                .execute(stage, move || async move {
                    match timeout(stage_timeout, step_ref.execute(ctx_ref)).await {
                        Ok(result) => result,
                        Err(_) => Err(HarvestError::transient(format!(
                            "step '{}' timed out after {}s",
                            stage,
                            stage_timeout.as_secs()
                        ))),
                    }
                })
                .await?;

            debug!(stage, fields = output.len(), "Step completed");
            fields.extend(output);
        }
        Ok(fields)
    }
}

// ============================================================================
// Tests
// ============================================================================
