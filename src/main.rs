use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use catalog_harvester::harvest::ItemProcessor;
use catalog_harvester::kaggle::{self, CommandRunner, KaggleCli, ResourceKind};
use catalog_harvester::{
    logging, BackoffExecutor, CheckpointStore, Cursor, FileCheckpointStore, HarvestConfig,
    HarvestOrchestrator, HarvesterExecutor, JsonlSink, MemoryCheckpointStore, RunBudget,
};

/// Harvests a Kaggle catalog section page by page, resuming from the last
/// checkpoint.
#[derive(Parser, Debug)]
#[command(name = "catalog-harvester", version)]
struct Cli {
    /// Catalog section to harvest (overrides the config file)
    #[arg(long, value_enum)]
    target: Option<ResourceKind>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start at this page instead of the checkpoint
    #[arg(long, conflicts_with = "start_token")]
    start_page: Option<u32>,

    /// Start at this continuation token instead of the checkpoint
    #[arg(long)]
    start_token: Option<String>,

    /// Stop after this many pages
    #[arg(long)]
    max_pages: Option<usize>,

    /// Stop once this many items have been processed
    #[arg(long)]
    max_items: Option<usize>,

    /// Items processed at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// Keep the checkpoint in memory; the stored one is read but never moved
    #[arg(long)]
    local: bool,
}

impl Cli {
    fn start_cursor(&self) -> Option<Cursor> {
        if let Some(page) = self.start_page {
            return Some(Cursor::NumericPage(page.max(1)));
        }
        self.start_token
            .as_ref()
            .map(|token| Cursor::OpaqueToken(Some(token.clone()).filter(|t| !t.is_empty())))
    }

    fn run_label(&self, kind: ResourceKind) -> String {
        match (self.start_page, self.start_token.as_deref()) {
            (Some(page), _) => format!("{}_page_{}", kind, page),
            (None, Some(token)) => {
                format!("{}_token_{}", kind, token.chars().take(6).collect::<String>())
            }
            (None, None) => format!("{}_resume", kind),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match cli.config.as_deref() {
        Some(path) => match HarvestConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("[ERROR] {}", e);
                return ExitCode::from(2);
            }
        },
        None => HarvestConfig::default(),
    };
    if let Some(target) = cli.target {
        config.target = Some(target);
    }
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
    }
    if let Err(e) = config.validate() {
        eprintln!("[ERROR] {}", e);
        return ExitCode::from(2);
    }
    let Some(kind) = config.target else {
        eprintln!("[ERROR] no target given: pass --target or set \"target\" in the config file");
        return ExitCode::from(2);
    };
    let start = cli.start_cursor();
    if let Some(cursor) = &start {
        if cursor.kind() != kind.cursor_kind() {
            eprintln!("[ERROR] {} are not paged by {}", kind, cursor);
            return ExitCode::from(2);
        }
    }

    match logging::init(&config.logging, &cli.run_label(kind)) {
        Ok(Some(path)) => info!(path = %path.display(), "Logging to file"),
        Ok(None) => {}
        Err(e) => {
            eprintln!("[ERROR] cannot set up logging: {}", e);
            return ExitCode::from(2);
        }
    }

    let budget = RunBudget {
        max_pages: cli.max_pages,
        max_items: cli.max_items,
    };
    let durable = FileCheckpointStore::new(&config.state_dir, kind.as_str());
    if cli.local {
        let initial = match durable.load().await {
            Ok(cursor) => cursor,
            Err(e) => {
                error!(error = %e, "Cannot read checkpoint");
                return ExitCode::from(1);
            }
        };
        run(&config, kind, MemoryCheckpointStore::new(initial), start, budget).await
    } else {
        run(&config, kind, durable, start, budget).await
    }
}

async fn run<C: CheckpointStore>(
    config: &HarvestConfig,
    kind: ResourceKind,
    checkpoints: C,
    start: Option<Cursor>,
    budget: RunBudget,
) -> ExitCode {
    let runner: Arc<dyn CommandRunner> = Arc::new(KaggleCli::new(
        config.kaggle.program.clone(),
        config.kaggle.command_timeout(),
    ));
    let retry = BackoffExecutor::new(config.retry.clone());

    let processor = ItemProcessor::new(
        kaggle::enrichment_steps(kind, runner.clone(), &config.output_dir),
        retry.clone(),
        config.work_dir.join(kind.as_str()),
    )
    .with_timeout(config.step_timeout())
    .with_cleanup(!config.keep_workspaces);
    info!(target_kind = %kind, steps = ?processor.stage_names(), "Item pipeline ready");

    let orchestrator = HarvestOrchestrator::new(
        kaggle::listing(kind, runner, &config.kaggle),
        JsonlSink::new(config.pages_dir(kind)),
        checkpoints,
        HarvesterExecutor::new(processor, config.concurrency),
        retry,
    )
    .with_budget(budget);

    let cancel: CancellationToken = orchestrator.cancellation().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight items");
            cancel.cancel();
        }
    });

    match orchestrator.run(start).await {
        Ok(report) => {
            info!(
                reason = ?report.reason,
                pages = report.pages.len(),
                items = report.items_processed(),
                "Run complete"
            );
            ExitCode::SUCCESS
        }
        Err(aborted) => {
            error!(error = %aborted, "Run aborted");
            let resume = aborted
                .last_committed
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "the first page".to_string());
            eprintln!("[ERROR] {}\nNext run resumes from {}.", aborted, resume);
            ExitCode::from(1)
        }
    }
}
