//! Enrichment step abstraction for the per-item pipeline.

use async_trait::async_trait;

use crate::harvest::pipeline::ItemWorkspace;
use crate::model::{Fields, ListedItem};
use crate::traits::HarvestError;

/// Everything a step can see about the item it is enriching.
pub struct StepContext<'a> {
    /// The item as it appeared in the listing.
    pub item: &'a ListedItem,

    /// Scratch directory owned by this item for the duration of its pipeline.
    pub workspace: &'a ItemWorkspace,

    /// Listing columns plus the output of every step that already succeeded.
    pub fields: &'a Fields,
}

/// One stage of the enrichment pipeline (fetch metadata, list files,
/// download content, ...).
///
/// Steps run in order and short-circuit on the first error. A step returns
/// only the fields it contributes; the pipeline merges them into the record.
///
/// # Idempotence
///
/// A step may be re-run after a transient failure, so it must tolerate
/// leftovers from its own previous attempt in the workspace.
///
/// # Errors
///
/// The [`HarvestError`] classification decides what happens next:
/// transient errors are retried, terminal ones skip the item, anything else
/// fails it.
#[async_trait]
pub trait EnrichmentStep: Send + Sync {
    /// Returns a human-readable name for this step, used in logs.
    fn stage_name(&self) -> &'static str;

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Fields, HarvestError>;
}
