//! Page loop driving a harvest run.
//!
//! One run walks a listing page by page:
//!
//! ```text
//! Idle -> FetchingPage -> Dispatching -> Persisting -> Checkpointing -> FetchingPage ...
//!              |                                           |
//!              +-> Exhausted                               +-> Aborted
//! ```
//!
//! A page's outcomes are always persisted before the cursor past that page is
//! committed. A crash in between costs one page of repeated work on the next
//! run and never loses a persisted outcome.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::cursor::Cursor;
use crate::executor::HarvesterExecutor;
use crate::model::{ItemReference, PageId, PageReport};
use crate::retry::BackoffExecutor;
use crate::traits::{HarvestError, PageSource, Sink};

/// Where a run currently is in its page loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    FetchingPage,
    Dispatching,
    Persisting,
    Checkpointing,
    Exhausted,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::FetchingPage => "fetching_page",
            RunState::Dispatching => "dispatching",
            RunState::Persisting => "persisting",
            RunState::Checkpointing => "checkpointing",
            RunState::Exhausted => "exhausted",
            RunState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Why a run stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// The listing has no further pages.
    Exhausted,
    /// The caller's page or item budget was used up.
    BudgetReached,
    /// The run was cancelled; the current page was not checkpointed.
    Cancelled,
}

/// Caller-supplied limits, checked before each page fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunBudget {
    pub max_pages: Option<usize>,
    pub max_items: Option<usize>,
}

impl RunBudget {
    pub fn pages(max_pages: usize) -> Self {
        Self {
            max_pages: Some(max_pages),
            max_items: None,
        }
    }

    fn is_spent(&self, pages: usize, items: usize) -> bool {
        self.max_pages.is_some_and(|max| pages >= max)
            || self.max_items.is_some_and(|max| items >= max)
    }
}

/// Summary of a run that stopped cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub reason: CompletionReason,
    pub pages: Vec<PageReport>,
    /// Last cursor durably committed, by this run or an earlier one.
    pub last_committed: Option<Cursor>,
    pub checkpoint_commits: usize,
}

impl RunReport {
    pub fn items_processed(&self) -> usize {
        self.pages.iter().map(PageReport::processed).sum()
    }
}

/// A run that stopped on an unrecoverable error.
#[derive(Error, Debug)]
#[error(
    "harvest aborted while {state} (last committed cursor: {}): {source}",
    display_cursor(.last_committed)
)]
pub struct HarvestAborted {
    pub state: RunState,
    /// Resume point for the next run.
    pub last_committed: Option<Cursor>,
    /// Pages completed before the abort.
    pub pages: Vec<PageReport>,
    #[source]
    pub source: HarvestError,
}

fn display_cursor(cursor: &Option<Cursor>) -> String {
    cursor
        .as_ref()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Drives the page loop for one harvest target.
pub struct HarvestOrchestrator<P, S, C>
where
    P: PageSource,
    S: Sink,
    C: CheckpointStore,
{
    source: P,
    sink: S,
    checkpoints: C,
    pool: HarvesterExecutor,
    retry: BackoffExecutor,
    budget: RunBudget,
    cancel: CancellationToken,
}

/// Mutable bookkeeping of one `run` call.
struct RunProgress {
    state: RunState,
    pages: Vec<PageReport>,
    items: usize,
    last_committed: Option<Cursor>,
    commits: usize,
    dispatched: HashSet<ItemReference>,
}

impl RunProgress {
    fn enter(&mut self, state: RunState) {
        debug!(from = %self.state, to = %state, "State transition");
        self.state = state;
    }

    fn abort(mut self, source: HarvestError) -> HarvestAborted {
        let state = self.state;
        self.enter(RunState::Aborted);
        warn!(
            state = %state,
            last_committed = %display_cursor(&self.last_committed),
            error = %source,
            "Harvest aborted"
        );
        HarvestAborted {
            state,
            last_committed: self.last_committed,
            pages: self.pages,
            source,
        }
    }

    fn finish(self, reason: CompletionReason) -> RunReport {
        info!(
            reason = ?reason,
            pages = self.pages.len(),
            items = self.items,
            checkpoint_commits = self.commits,
            "Harvest finished"
        );
        RunReport {
            reason,
            pages: self.pages,
            last_committed: self.last_committed,
            checkpoint_commits: self.commits,
        }
    }
}

impl<P, S, C> HarvestOrchestrator<P, S, C>
where
    P: PageSource,
    S: Sink,
    C: CheckpointStore,
{
    pub fn new(
        source: P,
        sink: S,
        checkpoints: C,
        pool: HarvesterExecutor,
        retry: BackoffExecutor,
    ) -> Self {
        Self {
            source,
            sink,
            checkpoints,
            pool,
            retry,
            budget: RunBudget::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_budget(mut self, budget: RunBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Shares a cancellation token with the caller (e.g. a Ctrl-C handler).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn checkpoints(&self) -> &C {
        &self.checkpoints
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Runs the page loop from `start`, or from the committed checkpoint when
    /// `start` is `None`, or from the listing's first page if neither exists.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestAborted`] when a page cannot be fetched (terminal,
    /// defect, or exhausted retries) or the sink or checkpoint keeps failing.
    /// Item failures never abort a run.
    #[instrument(skip(self, start))]
    pub async fn run(&self, start: Option<Cursor>) -> Result<RunReport, HarvestAborted> {
        let kind = self.source.cursor_kind();
        let mut progress = RunProgress {
            state: RunState::Idle,
            pages: Vec::new(),
            items: 0,
            last_committed: None,
            commits: 0,
            dispatched: HashSet::new(),
        };

        let loaded = self.retry.execute("load_checkpoint", || self.checkpoints.load()).await;
        let committed = match loaded {
            Ok(committed) => committed,
            Err(err) => return Err(progress.abort(err)),
        };
        progress.last_committed = committed.clone();

        let mut cursor = start.or(committed).unwrap_or_else(|| Cursor::initial(kind));
        if cursor.kind() != kind {
            let err = HarvestError::defect(format!(
                "cursor {:?} does not match a {:?} listing",
                cursor, kind
            ));
            return Err(progress.abort(err));
        }
        info!(cursor = %cursor, "Harvest starting");

        loop {
            if cursor.is_exhausted() {
                progress.enter(RunState::Exhausted);
                return Ok(progress.finish(CompletionReason::Exhausted));
            }
            if self.budget.is_spent(progress.pages.len(), progress.items) {
                info!(budget = ?self.budget, "Run budget reached");
                return Ok(progress.finish(CompletionReason::BudgetReached));
            }
            if self.cancel.is_cancelled() {
                return Ok(progress.finish(CompletionReason::Cancelled));
            }

            // FetchingPage
            progress.enter(RunState::FetchingPage);
            let label = format!("fetch_page({})", cursor);
            let page = match self.retry.execute(&label, || self.source.fetch_page(&cursor)).await {
                Ok(page) => page,
                Err(err) => return Err(progress.abort(err)),
            };
            let next = cursor.advance(&page);
            let page_id = PageId::for_cursor(&cursor);

            if page.is_empty_listing() && next.is_exhausted() {
                info!(page = %page_id, "Listing exhausted");
                progress.enter(RunState::Exhausted);
                return Ok(progress.finish(CompletionReason::Exhausted));
            }

            // Dispatching
            progress.enter(RunState::Dispatching);
            let listed = page.items.len();
            let mut fresh = Vec::with_capacity(listed);
            for item in page.items {
                if progress.dispatched.insert(item.reference.clone()) {
                    fresh.push(item);
                } else {
                    debug!(item = %item.reference, "Already handled in this run");
                }
            }
            let duplicates = listed - fresh.len();
            info!(page = %page_id, items = fresh.len(), duplicates, "Dispatching page");
            let batch = self.pool.run_batch(fresh, &self.cancel).await;
            if batch.outcomes.is_empty() && !batch.is_complete() {
                // Nothing ran; the stored artifact for this page stays as it is.
                warn!(page = %page_id, "Run cancelled before the page was dispatched");
                return Ok(progress.finish(CompletionReason::Cancelled));
            }

            // Persisting
            progress.enter(RunState::Persisting);
            let label = format!("persist({})", page_id);
            if let Err(err) = self
                .retry
                .execute(&label, || self.sink.persist(&page_id, &batch.outcomes))
                .await
            {
                return Err(progress.abort(err));
            }

            let report =
                PageReport::tally(page_id.clone(), cursor.clone(), &batch.outcomes, duplicates);
            info!(
                page = %page_id,
                success = report.success,
                skipped = report.skipped,
                failed = report.failed,
                duplicates = report.duplicates,
                "Page complete"
            );
            progress.items += report.processed();
            progress.pages.push(report);

            if !batch.is_complete() {
                // The page is only partly done; leave the checkpoint where it is.
                warn!(
                    page = %page_id,
                    undispatched = batch.undispatched.len(),
                    "Run cancelled mid-page"
                );
                return Ok(progress.finish(CompletionReason::Cancelled));
            }

            // Checkpointing
            progress.enter(RunState::Checkpointing);
            let commit = self
                .retry
                .execute("commit_checkpoint", || self.checkpoints.commit(&next))
                .await;
            if let Err(err) = commit {
                return Err(progress.abort(err));
            }
            progress.commits += 1;
            progress.last_committed = Some(next.clone());
            cursor = next;
        }
    }
}
