//! Enrichment steps for each resource kind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::harvest::pipeline::ItemWorkspace;
use crate::harvest::traits::{EnrichmentStep, StepContext};
use crate::kaggle::cli::CommandRunner;
use crate::kaggle::listing::parse_csv_rows;
use crate::model::Fields;
use crate::traits::{HarvestError, TerminalKind};

const LEADERBOARD_TOP: usize = 100;

fn workspace_arg(workspace: &ItemWorkspace) -> String {
    workspace.path().to_string_lossy().into_owned()
}

/// Reads a JSON document the tool wrote into the workspace.
async fn read_json(path: &Path) -> Result<Value, HarvestError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(HarvestError::defect(format!(
                "expected '{}' was not written",
                path.display()
            )))
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&raw).map_err(|e| {
        HarvestError::transient(format!("malformed JSON in '{}': {}", path.display(), e))
    })
}

/// `name,size` CSV rows as `[{"FileName", "Size"}]`.
fn file_entries(output: &str) -> Result<Value, HarvestError> {
    let entries: Vec<Value> = parse_csv_rows(output)?
        .into_iter()
        .map(|row| {
            json!({
                "FileName": row.get("name").cloned().unwrap_or(Value::Null),
                "Size": row.get("size").cloned().unwrap_or(Value::Null),
            })
        })
        .collect();
    Ok(Value::Array(entries))
}

fn single_field(name: &str, value: Value) -> Fields {
    let mut fields = Fields::new();
    fields.insert(name.to_string(), value);
    fields
}

// ============================================================================
// Datasets
// ============================================================================

/// `datasets metadata`: licences, tags and description.
pub struct DatasetMetadataStep {
    runner: Arc<dyn CommandRunner>,
}

impl DatasetMetadataStep {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl EnrichmentStep for DatasetMetadataStep {
    fn stage_name(&self) -> &'static str {
        "dataset_metadata"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Fields, HarvestError> {
        let ws = workspace_arg(ctx.workspace);
        self.runner
            .run(&["datasets", "metadata", ctx.item.reference.as_str(), "-p", ws.as_str()])
            .await?;

        let document = read_json(&ctx.workspace.path().join("dataset-metadata.json")).await?;
        // Newer tool versions nest everything under "info".
        let info = document.get("info").unwrap_or(&document);

        let licenses: Vec<Value> = info
            .get("licenses")
            .and_then(Value::as_array)
            .map(|ls| ls.iter().filter_map(|l| l.get("name").cloned()).collect())
            .unwrap_or_default();
        let tags = info.get("keywords").cloned().unwrap_or_else(|| json!([]));
        let content = info.get("description").cloned().unwrap_or_else(|| json!(""));

        let mut fields = Fields::new();
        fields.insert("Licenses".into(), Value::Array(licenses));
        fields.insert("Tags".into(), tags);
        fields.insert("Content".into(), content);
        Ok(fields)
    }
}

/// `datasets files`: the file explorer listing.
pub struct DatasetFilesStep {
    runner: Arc<dyn CommandRunner>,
}

impl DatasetFilesStep {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl EnrichmentStep for DatasetFilesStep {
    fn stage_name(&self) -> &'static str {
        "dataset_files"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Fields, HarvestError> {
        let reference = ctx.item.reference.as_str();
        let output = self.runner.run(&["datasets", "files", reference, "--csv"]).await?;
        if output.trim().is_empty() {
            return Err(HarvestError::transient(format!("empty file listing for {}", reference)));
        }
        Ok(single_field("File Explorer", file_entries(&output)?))
    }
}

/// `datasets download --unzip`, moved into `<content_root>/<file stem>`. A
/// target left by an earlier run is recorded as is.
pub struct DatasetContentStep {
    runner: Arc<dyn CommandRunner>,
    content_root: PathBuf,
}

impl DatasetContentStep {
    pub fn new(runner: Arc<dyn CommandRunner>, content_root: PathBuf) -> Self {
        Self { runner, content_root }
    }
}

#[async_trait]
impl EnrichmentStep for DatasetContentStep {
    fn stage_name(&self) -> &'static str {
        "dataset_content"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Fields, HarvestError> {
        let reference = &ctx.item.reference;
        let target = self.content_root.join(reference.file_stem());
        let local_path = || single_field("LocalPath", target.to_string_lossy().into_owned().into());
        if tokio::fs::try_exists(&target).await? {
            // Downloaded by an earlier run whose page was not checkpointed.
            info!(item = %reference, path = %target.display(), "Dataset already stored");
            return Ok(local_path());
        }

        let download = ctx.workspace.safe_child(Path::new("download"))?;
        if tokio::fs::try_exists(&download).await? {
            // Leftover from a timed-out attempt.
            tokio::fs::remove_dir_all(&download).await?;
        }
        tokio::fs::create_dir_all(&download).await?;
        let download_arg = download.to_string_lossy().into_owned();

        info!(item = %reference, "Downloading dataset");
        self.runner
            .run(&[
                "datasets",
                "download",
                reference.as_str(),
                "-p",
                download_arg.as_str(),
                "--unzip",
            ])
            .await?;

        tokio::fs::create_dir_all(&self.content_root).await?;
        tokio::fs::rename(&download, &target).await?;
        info!(item = %reference, path = %target.display(), "Dataset stored");

        Ok(local_path())
    }
}

// ============================================================================
// Kernels
// ============================================================================

/// `kernels pull -m`: kernel metadata and its source file.
pub struct KernelPullStep {
    runner: Arc<dyn CommandRunner>,
}

impl KernelPullStep {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl EnrichmentStep for KernelPullStep {
    fn stage_name(&self) -> &'static str {
        "kernel_pull"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Fields, HarvestError> {
        let reference = &ctx.item.reference;
        let ws = workspace_arg(ctx.workspace);
        self.runner
            .run(&["kernels", "pull", reference.as_str(), "-p", ws.as_str(), "-m"])
            .await?;

        let meta = read_json(&ctx.workspace.path().join("kernel-metadata.json")).await?;
        let slug = reference.slug();
        let source = ctx.workspace.single_file("kernel source file", |p| {
            p.file_stem().and_then(|s| s.to_str()) == Some(slug)
                && p.extension().and_then(|e| e.to_str()) != Some("log")
        })?;

        let mut fields = Fields::new();
        for key in ["id", "title", "kernel_type", "language"] {
            let value = meta.get(key).cloned().unwrap_or_else(|| json!("unknown"));
            fields.insert(key.to_string(), value);
        }
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        fields.insert("source_file".into(), name.into());
        Ok(fields)
    }
}

/// `kernels output`, best effort: a kernel without output is still harvested.
pub struct KernelOutputStep {
    runner: Arc<dyn CommandRunner>,
}

impl KernelOutputStep {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl EnrichmentStep for KernelOutputStep {
    fn stage_name(&self) -> &'static str {
        "kernel_output"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Fields, HarvestError> {
        let reference = &ctx.item.reference;
        let ws = workspace_arg(ctx.workspace);
        if let Err(err) = self
            .runner
            .run(&["kernels", "output", reference.as_str(), "-p", ws.as_str()])
            .await
        {
            warn!(item = %reference, error = %err, "No kernel output, continuing with source only");
            return Ok(single_field("log_file", "".into()));
        }

        let log = ctx
            .workspace
            .single_file_with_extension("log")
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();
        Ok(single_field("log_file", log.into()))
    }
}

/// Copies the source (and log) into `<code_root>/<owner_slug>`.
pub struct KernelStoreStep {
    code_root: PathBuf,
}

impl KernelStoreStep {
    pub fn new(code_root: PathBuf) -> Self {
        Self { code_root }
    }
}

#[async_trait]
impl EnrichmentStep for KernelStoreStep {
    fn stage_name(&self) -> &'static str {
        "kernel_store"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Fields, HarvestError> {
        let reference = &ctx.item.reference;
        let target = self.code_root.join(reference.file_stem());
        let code_path = || single_field("code_path", target.to_string_lossy().into_owned().into());
        if tokio::fs::try_exists(&target).await? {
            debug!(item = %reference, path = %target.display(), "Kernel already stored");
            return Ok(code_path());
        }

        let names: Vec<&str> = ["source_file", "log_file"]
            .iter()
            .filter_map(|key| ctx.fields.get(*key).and_then(Value::as_str))
            .filter(|name| !name.is_empty())
            .collect();
        if names.is_empty() {
            return Err(HarvestError::defect(format!("no source file recorded for {}", reference)));
        }

        // Staged next to the target so a failed copy never leaves a half-filled target.
        let staging = self.code_root.join(format!(".{}.partial", reference.file_stem()));
        if tokio::fs::try_exists(&staging).await? {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await?;
        for name in names {
            let from = ctx.workspace.safe_child(Path::new(name))?;
            tokio::fs::copy(&from, staging.join(name)).await?;
        }
        tokio::fs::rename(&staging, &target).await?;
        debug!(item = %reference, path = %target.display(), "Kernel stored");

        Ok(code_path())
    }
}

// ============================================================================
// Competitions
// ============================================================================

/// `competitions leaderboard -d`: top rows of the public leaderboard.
pub struct LeaderboardStep {
    runner: Arc<dyn CommandRunner>,
}

impl LeaderboardStep {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl EnrichmentStep for LeaderboardStep {
    fn stage_name(&self) -> &'static str {
        "leaderboard"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Fields, HarvestError> {
        let slug = ctx.item.reference.slug();
        let ws = workspace_arg(ctx.workspace);
        match self
            .runner
            .run(&["competitions", "leaderboard", slug, "-d", "-p", ws.as_str()])
            .await
        {
            Ok(_) => {}
            Err(HarvestError::Terminal {
                kind: TerminalKind::NotFound,
                ..
            }) => {
                debug!(item = %ctx.item.reference, "Competition has no leaderboard");
                return Ok(single_field("LeaderboardTop100", json!([])));
            }
            Err(err) => return Err(err),
        }

        if let Ok(csv_path) = ctx.workspace.single_file_with_extension("csv") {
            let raw = tokio::fs::read_to_string(&csv_path).await?;
            return Ok(single_field("LeaderboardTop100", leaderboard_rows(&raw)?));
        }
        // Archived leaderboards are kept by name only.
        let archive = ctx
            .workspace
            .single_file_with_extension("zip")?
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut fields = single_field("LeaderboardTop100", json!([]));
        fields.insert("LeaderboardArchive".into(), archive.into());
        Ok(fields)
    }
}

/// Normalises leaderboard columns and keeps the best-ranked rows.
fn leaderboard_rows(raw: &str) -> Result<Value, HarvestError> {
    let mut rows: Vec<(f64, Fields)> = Vec::new();
    for (index, row) in parse_csv_rows(raw)?.into_iter().enumerate() {
        let mut entry = Fields::new();
        for (column, value) in row {
            let name = match column.as_str() {
                "TeamName" | "Team" => "Team",
                "Rank" => "Rank",
                "Score" => "Score",
                "Submissions" | "Entries" => "Submissions",
                "SubmissionCount" => "SubmissionCount",
                _ => continue,
            };
            entry.insert(name.to_string(), value);
        }
        let rank = entry
            .get("Rank")
            .and_then(Value::as_str)
            .and_then(|r| r.trim().parse::<f64>().ok())
            .unwrap_or((index + 1) as f64);
        rows.push((rank, entry));
    }
    rows.sort_by(|a, b| a.0.total_cmp(&b.0));
    Ok(Value::Array(
        rows.into_iter()
            .take(LEADERBOARD_TOP)
            .map(|(_, entry)| Value::Object(entry))
            .collect(),
    ))
}

/// `competitions files`: the competition's data files.
pub struct CompetitionFilesStep {
    runner: Arc<dyn CommandRunner>,
}

impl CompetitionFilesStep {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl EnrichmentStep for CompetitionFilesStep {
    fn stage_name(&self) -> &'static str {
        "competition_files"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Fields, HarvestError> {
        let slug = ctx.item.reference.slug();
        let output = self.runner.run(&["competitions", "files", slug, "--csv"]).await?;
        Ok(single_field("Files", file_entries(&output)?))
    }
}

// ============================================================================
// Models
// ============================================================================

/// `models get`: the model card, read from the one JSON file the tool writes.
pub struct ModelCardStep {
    runner: Arc<dyn CommandRunner>,
}

impl ModelCardStep {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl EnrichmentStep for ModelCardStep {
    fn stage_name(&self) -> &'static str {
        "model_card"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Fields, HarvestError> {
        let ws = workspace_arg(ctx.workspace);
        self.runner
            .run(&["models", "get", ctx.item.reference.as_str(), "-p", ws.as_str()])
            .await?;

        let path = ctx.workspace.single_file_with_extension("json")?;
        let document = read_json(&path).await?;
        let card = document.get("description").cloned().unwrap_or_else(|| json!(""));
        Ok(single_field("modelCard", card))
    }
}

/// Model variations.
///
/// The listing contract for variations is not settled, so this records an
/// empty list rather than guessing at a format.
pub struct ModelVariationsStep;

#[async_trait]
impl EnrichmentStep for ModelVariationsStep {
    fn stage_name(&self) -> &'static str {
        "model_variations"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<Fields, HarvestError> {
        info!(item = %ctx.item.reference, "Variation listing unavailable, recording none");
        Ok(single_field("variations", json!([])))
    }
}
