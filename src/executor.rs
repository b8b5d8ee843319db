use crate::harvest::pipeline::ItemProcessor;
use crate::model::{BatchOutcomes, ItemFailure, ItemReference, ListedItem, ProcessingOutcome};
use crate::traits::ErrorClass;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Default number of items processed at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Result of one batch. Every dispatched reference has exactly one outcome.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: BatchOutcomes,
    /// References left in the queue because the run was cancelled.
    pub undispatched: Vec<ItemReference>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.undispatched.is_empty()
    }
}

/// Bounded pool running the item pipeline for one page at a time.
///
/// The semaphore is the only admission control in front of the external
/// service's rate limit: at most `concurrency_limit` items are in flight.
pub struct HarvesterExecutor {
    processor: Arc<ItemProcessor>,
    semaphore: Arc<Semaphore>,
    concurrency_limit: usize,
}

impl HarvesterExecutor {
    pub fn new(processor: ItemProcessor, concurrency_limit: usize) -> Self {
        let concurrency_limit = concurrency_limit.max(1);
        Self {
            processor: Arc::new(processor),
            semaphore: Arc::new(Semaphore::new(concurrency_limit)),
            concurrency_limit,
        }
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Processes `items` and waits for every dispatched one to finish.
    ///
    /// A panicking item becomes a `Failed` outcome. Once `cancel` fires, no
    /// further items are dispatched; those already running finish normally.
    #[instrument(skip(self, items, cancel), fields(items = items.len()))]
    pub async fn run_batch(
        &self,
        items: Vec<ListedItem>,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let mut handles = Vec::with_capacity(items.len());
        let mut queue = items.into_iter();

        while let Some(item) = queue.next() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = self.semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                report.undispatched.push(item.reference);
                report.undispatched.extend(queue.by_ref().map(|i| i.reference));
                break;
            };

            let processor = Arc::clone(&self.processor);
            let reference = item.reference.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                processor.process(&item).await
            });
            handles.push((reference, handle));
        }

        if !report.undispatched.is_empty() {
            warn!(
                undispatched = report.undispatched.len(),
                "Cancellation requested, remaining items not dispatched"
            );
        }

        // Batch barrier.
        for (reference, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    error!(item = %reference, error = %join_err, "Item task aborted");
                    ProcessingOutcome::Failed {
                        failure: ItemFailure {
                            class: ErrorClass::Defect,
                            message: format!("item task aborted: {}", join_err),
                            attempts: None,
                        },
                    }
                }
            };
            report.outcomes.insert(reference, outcome);
        }

        info!(
            outcomes = report.outcomes.len(),
            undispatched = report.undispatched.len(),
            "Batch finished"
        );
        report
    }
}
