use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use catalog_harvester::harvest::{EnrichmentStep, ItemProcessor, StepContext};
use catalog_harvester::kaggle::{self, CommandRunner};
use catalog_harvester::{
    BackoffExecutor, CheckpointStore, CompletionReason, Cursor, CursorKind, Fields,
    FileCheckpointStore, HarvestError, HarvestOrchestrator, HarvesterExecutor, ItemReference,
    JsonlSink, ListedItem, PageId, PageResult, PageSource, ProcessingOutcome, ResourceKind,
    RetryPolicy, RunState,
};

/// Numeric listing over fixed pages; records every fetched cursor.
struct FixedListing {
    pages: Vec<Vec<&'static str>>,
    fetched: Mutex<Vec<Cursor>>,
}

impl FixedListing {
    fn new(pages: Vec<Vec<&'static str>>) -> Self {
        Self {
            pages,
            fetched: Mutex::new(Vec::new()),
        }
    }

    fn fetched(&self) -> Vec<Cursor> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageSource for FixedListing {
    fn cursor_kind(&self) -> CursorKind {
        CursorKind::NumericPage
    }

    async fn fetch_page(&self, cursor: &Cursor) -> Result<PageResult, HarvestError> {
        self.fetched.lock().unwrap().push(cursor.clone());
        let Cursor::NumericPage(n) = cursor else {
            return Err(HarvestError::defect("numeric listing"));
        };
        let refs = self.pages.get(*n as usize - 1).cloned().unwrap_or_default();
        Ok(PageResult {
            items: refs.into_iter().map(|r| ListedItem::new(ItemReference::new(r))).collect(),
            ..PageResult::default()
        })
    }
}

/// Shared listing handle so a test can inspect it after the run.
struct SharedListing(Arc<FixedListing>);

#[async_trait]
impl PageSource for SharedListing {
    fn cursor_kind(&self) -> CursorKind {
        self.0.cursor_kind()
    }

    async fn fetch_page(&self, cursor: &Cursor) -> Result<PageResult, HarvestError> {
        self.0.fetch_page(cursor).await
    }
}

/// Cancels the run from inside the fetch, as an interrupt arriving mid-page would.
struct CancellingListing {
    inner: FixedListing,
    cancel: CancellationToken,
}

#[async_trait]
impl PageSource for CancellingListing {
    fn cursor_kind(&self) -> CursorKind {
        self.inner.cursor_kind()
    }

    async fn fetch_page(&self, cursor: &Cursor) -> Result<PageResult, HarvestError> {
        self.cancel.cancel();
        self.inner.fetch_page(cursor).await
    }
}

/// Stands in for the `kaggle` tool: writes what the dataset commands would.
#[derive(Default)]
struct ScriptedKaggle {
    downloads: AtomicUsize,
}

#[async_trait]
impl CommandRunner for ScriptedKaggle {
    async fn run(&self, args: &[&str]) -> Result<String, HarvestError> {
        let dir = args.iter().position(|a| *a == "-p").map(|i| Path::new(args[i + 1]));
        match (args[1], dir) {
            ("metadata", Some(dir)) => {
                let body = format!(r#"{{"info": {{"description": "about {}"}}}}"#, args[2]);
                std::fs::write(dir.join("dataset-metadata.json"), body)?;
                Ok(String::new())
            }
            ("files", _) => Ok("name,size\ndata.csv,10\n".into()),
            ("download", Some(dir)) => {
                self.downloads.fetch_add(1, Ordering::SeqCst);
                std::fs::write(dir.join("data.csv"), args[2])?;
                Ok(String::new())
            }
            _ => Err(HarvestError::defect(format!("unexpected command {:?}", args))),
        }
    }
}

/// Sleeps briefly and tracks peak concurrency. Fails `bad/*` items.
struct TitleStep {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl EnrichmentStep for TitleStep {
    fn stage_name(&self) -> &'static str {
        "title"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Fields, HarvestError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        let reference = ctx.item.reference.as_str();
        if reference.starts_with("bad/") {
            return Err(HarvestError::rejected("403 - Forbidden"));
        }
        let mut fields = Fields::new();
        fields.insert("Title".into(), reference.to_uppercase().into());
        Ok(fields)
    }
}

/// Checkpoint store that loses the connection on every commit.
struct UnwritableCheckpoint(FileCheckpointStore);

#[async_trait]
impl CheckpointStore for UnwritableCheckpoint {
    async fn load(&self) -> Result<Option<Cursor>, HarvestError> {
        self.0.load().await
    }

    async fn commit(&self, _cursor: &Cursor) -> Result<(), HarvestError> {
        Err(HarvestError::transient("state volume unavailable"))
    }
}

struct Harness {
    _root: tempfile::TempDir,
    work: PathBuf,
    output: PathBuf,
    pages: PathBuf,
    state: PathBuf,
    peak: Arc<AtomicUsize>,
}

impl Harness {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self {
            work: root.path().join("tmp"),
            output: root.path().join("output"),
            pages: root.path().join("output/datasets/pages"),
            state: root.path().join("setting"),
            _root: root,
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Pool running the real dataset steps against `runner`.
    fn dataset_pool(&self, runner: Arc<ScriptedKaggle>) -> HarvesterExecutor {
        let processor = ItemProcessor::new(
            kaggle::enrichment_steps(ResourceKind::Datasets, runner, &self.output),
            BackoffExecutor::new(RetryPolicy::immediate(2)),
            self.work.clone(),
        );
        HarvesterExecutor::new(processor, 2)
    }

    fn pool(&self, limit: usize) -> HarvesterExecutor {
        let processor = ItemProcessor::new(
            vec![Box::new(TitleStep {
                current: Arc::new(AtomicUsize::new(0)),
                peak: self.peak.clone(),
            })],
            BackoffExecutor::new(RetryPolicy::immediate(2)),
            self.work.clone(),
        );
        HarvesterExecutor::new(processor, limit)
    }

    fn checkpoints(&self) -> FileCheckpointStore {
        FileCheckpointStore::new(&self.state, "datasets")
    }

    fn sink(&self) -> JsonlSink {
        JsonlSink::new(self.pages.clone())
    }

    fn orchestrator<P: PageSource, C: CheckpointStore>(
        &self,
        source: P,
        checkpoints: C,
    ) -> HarvestOrchestrator<P, JsonlSink, C> {
        self.orchestrator_with(source, checkpoints, self.pool(2))
    }

    fn orchestrator_with<P: PageSource, C: CheckpointStore>(
        &self,
        source: P,
        checkpoints: C,
        pool: HarvesterExecutor,
    ) -> HarvestOrchestrator<P, JsonlSink, C> {
        HarvestOrchestrator::new(
            source,
            self.sink(),
            checkpoints,
            pool,
            BackoffExecutor::new(RetryPolicy::immediate(3)),
        )
    }

    /// Every `Success` on pages `1..=pages`, with `LocalPath` checked and
    /// dropped since it depends on the harness root.
    fn successes(&self, pages: u32) -> BTreeMap<String, Fields> {
        let mut found = BTreeMap::new();
        for page in 1..=pages {
            let outcomes = self
                .sink()
                .load_page(&PageId::for_cursor(&Cursor::NumericPage(page)))
                .unwrap()
                .unwrap_or_default();
            for (reference, outcome) in outcomes {
                if let ProcessingOutcome::Success { record } = outcome {
                    let mut fields = record.fields;
                    let local = fields.remove("LocalPath").unwrap();
                    let local = Path::new(local.as_str().unwrap());
                    assert!(local.starts_with(self.output.join("datasets/content")));
                    assert!(local.join("data.csv").exists());
                    found.insert(reference.as_str().to_string(), fields);
                }
            }
        }
        found
    }
}

fn refs_on_page(sink: &JsonlSink, page: u32) -> BTreeSet<String> {
    sink.load_page(&PageId::for_cursor(&Cursor::NumericPage(page)))
        .unwrap()
        .unwrap_or_default()
        .keys()
        .map(|r| r.as_str().to_string())
        .collect()
}

#[tokio::test]
async fn single_page_listing_commits_once_and_exhausts() {
    let harness = Harness::new();
    let listing = Arc::new(FixedListing::new(vec![vec!["a/one", "a/two", "a/three"]]));
    let orchestrator = harness.orchestrator(SharedListing(listing.clone()), harness.checkpoints());

    let report = orchestrator.run(None).await.unwrap();

    assert_eq!(report.reason, CompletionReason::Exhausted);
    assert_eq!(report.checkpoint_commits, 1);
    assert_eq!(report.last_committed, Some(Cursor::NumericPage(2)));
    assert_eq!(listing.fetched(), vec![Cursor::NumericPage(1), Cursor::NumericPage(2)]);
    assert!(harness.peak.load(Ordering::SeqCst) <= 2);

    assert_eq!(harness.checkpoints().load().await.unwrap(), Some(Cursor::NumericPage(2)));
    assert_eq!(
        refs_on_page(&harness.sink(), 1),
        ["a/one", "a/three", "a/two"]
            .iter()
            .map(|s| s.to_string())
            .collect::<BTreeSet<_>>()
    );
    // Workspaces are gone once items finish.
    assert_eq!(std::fs::read_dir(&harness.work).map(|d| d.count()).unwrap_or(0), 0);
}

#[tokio::test]
async fn rerun_after_exhaustion_refetches_only_the_tail() {
    let harness = Harness::new();
    let pages = vec![vec!["a/one"], vec!["a/two"]];

    let first = harness.orchestrator(FixedListing::new(pages.clone()), harness.checkpoints());
    let report = first.run(None).await.unwrap();
    assert_eq!(report.items_processed(), 2);

    let listing = Arc::new(FixedListing::new(pages));
    let second = harness.orchestrator(SharedListing(listing.clone()), harness.checkpoints());
    let report = second.run(None).await.unwrap();

    assert_eq!(report.reason, CompletionReason::Exhausted);
    assert_eq!(report.items_processed(), 0);
    assert_eq!(listing.fetched(), vec![Cursor::NumericPage(3)]);
}

#[tokio::test]
async fn failed_commit_loses_nothing() {
    let harness = Harness::new();
    let pages = vec![vec!["a/one", "a/two"], vec!["a/three"]];

    let crashed = harness.orchestrator(
        FixedListing::new(pages.clone()),
        UnwritableCheckpoint(harness.checkpoints()),
    );
    let aborted = crashed.run(None).await.unwrap_err();
    assert_eq!(aborted.state, RunState::Checkpointing);
    assert_eq!(aborted.last_committed, None);
    // Outcomes reached the sink before the commit was attempted.
    assert_eq!(refs_on_page(&harness.sink(), 1).len(), 2);

    let listing = Arc::new(FixedListing::new(pages));
    let resumed = harness.orchestrator(SharedListing(listing.clone()), harness.checkpoints());
    let report = resumed.run(None).await.unwrap();

    // Page 1 is repeated, never skipped.
    assert_eq!(listing.fetched()[0], Cursor::NumericPage(1));
    assert_eq!(report.items_processed(), 3);
    assert_eq!(refs_on_page(&harness.sink(), 1).len(), 2);
    assert_eq!(refs_on_page(&harness.sink(), 2).len(), 1);
    assert_eq!(harness.checkpoints().load().await.unwrap(), Some(Cursor::NumericPage(3)));
}

#[tokio::test]
async fn interrupted_runs_end_with_the_same_records_as_one_clean_run() {
    let pages = vec![vec!["alice/titanic", "bob/housing"], vec!["carol/iris"]];

    let clean = Harness::new();
    let runner = Arc::new(ScriptedKaggle::default());
    let report = clean
        .orchestrator_with(
            FixedListing::new(pages.clone()),
            clean.checkpoints(),
            clean.dataset_pool(runner.clone()),
        )
        .run(None)
        .await
        .unwrap();
    assert_eq!(report.reason, CompletionReason::Exhausted);
    let expected = clean.successes(2);
    assert_eq!(expected.len(), 3);

    let harness = Harness::new();
    let runner = Arc::new(ScriptedKaggle::default());

    // Page 1 is persisted, then the commit fails.
    let aborted = harness
        .orchestrator_with(
            FixedListing::new(pages.clone()),
            UnwritableCheckpoint(harness.checkpoints()),
            harness.dataset_pool(runner.clone()),
        )
        .run(None)
        .await
        .unwrap_err();
    assert_eq!(aborted.state, RunState::Checkpointing);
    let after_crash = harness.successes(1);
    assert_eq!(after_crash.len(), 2);

    // The redo of page 1 is interrupted before anything is dispatched.
    let cancel = CancellationToken::new();
    let report = harness
        .orchestrator_with(
            CancellingListing {
                inner: FixedListing::new(pages.clone()),
                cancel: cancel.clone(),
            },
            harness.checkpoints(),
            harness.dataset_pool(runner.clone()),
        )
        .with_cancellation(cancel)
        .run(None)
        .await
        .unwrap();
    assert_eq!(report.reason, CompletionReason::Cancelled);
    assert_eq!(harness.successes(1), after_crash);

    // The redo of page 1 finds the downloads already stored.
    let report = harness
        .orchestrator_with(
            FixedListing::new(pages),
            harness.checkpoints(),
            harness.dataset_pool(runner.clone()),
        )
        .run(None)
        .await
        .unwrap();
    assert_eq!(report.reason, CompletionReason::Exhausted);
    assert_eq!(report.pages[0].success, 2);
    assert_eq!(report.pages[0].skipped, 0);

    assert_eq!(harness.successes(2), expected);
    assert_eq!(runner.downloads.load(Ordering::SeqCst), 3);
    assert_eq!(harness.checkpoints().load().await.unwrap(), Some(Cursor::NumericPage(3)));
}

#[tokio::test]
async fn failing_items_do_not_hold_back_the_page() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(
        FixedListing::new(vec![vec!["a/one", "bad/forbidden", "a/two"]]),
        harness.checkpoints(),
    );

    let report = orchestrator.run(None).await.unwrap();

    assert_eq!(report.pages[0].success, 2);
    assert_eq!(report.pages[0].failed, 1);
    assert_eq!(report.checkpoint_commits, 1);

    let outcomes = harness
        .sink()
        .load_page(&PageId::for_cursor(&Cursor::NumericPage(1)))
        .unwrap()
        .unwrap();
    match &outcomes[&ItemReference::new("a/one")] {
        ProcessingOutcome::Success { record } => assert_eq!(record.fields["Title"], "A/ONE"),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(matches!(
        outcomes[&ItemReference::new("bad/forbidden")],
        ProcessingOutcome::Failed { .. }
    ));
}

#[tokio::test]
async fn legacy_checkpoint_is_resumed() {
    let harness = Harness::new();
    std::fs::create_dir_all(&harness.state).unwrap();
    // Record written by the tool this harvester replaces.
    std::fs::write(harness.state.join("page_now.json"), r#"{"last_page": 2}"#).unwrap();

    let listing = Arc::new(FixedListing::new(vec![vec!["a/1"], vec!["a/2"], vec!["a/3"]]));
    let orchestrator = harness.orchestrator(SharedListing(listing.clone()), harness.checkpoints());
    let report = orchestrator.run(None).await.unwrap();

    assert_eq!(listing.fetched()[0], Cursor::NumericPage(3));
    assert_eq!(report.items_processed(), 1);
    assert_eq!(harness.checkpoints().load().await.unwrap(), Some(Cursor::NumericPage(4)));
}
