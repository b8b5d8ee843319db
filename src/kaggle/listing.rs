//! Listing pages for each resource kind.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::cursor::{Cursor, CursorKind};
use crate::kaggle::cli::CommandRunner;
use crate::kaggle::ResourceKind;
use crate::model::{Fields, ItemReference, ListedItem, PageResult};
use crate::traits::{HarvestError, PageSource};

const TOKEN_HEADER: &str = "Next Page Token";

/// Page source backed by the `kaggle <kind> list` commands.
pub struct KaggleListing {
    kind: ResourceKind,
    runner: Arc<dyn CommandRunner>,
    min_usability: f64,
    page_size: u32,
}

impl KaggleListing {
    pub fn new(
        kind: ResourceKind,
        runner: Arc<dyn CommandRunner>,
        min_usability: f64,
        page_size: u32,
    ) -> Self {
        Self {
            kind,
            runner,
            min_usability,
            page_size,
        }
    }

    async fn numeric_page(&self, page: u32) -> Result<PageResult, HarvestError> {
        let page_arg = page.to_string();
        let page_arg = page_arg.as_str();
        let size_arg = self.page_size.to_string();
        let size_arg = size_arg.as_str();
        let args: Vec<&str> = match self.kind {
            ResourceKind::Datasets => vec!["datasets", "list", "--page", page_arg, "--csv"],
            ResourceKind::Kernels => {
                vec!["kernels", "list", "-p", page_arg, "--page-size", size_arg, "--csv"]
            }
            ResourceKind::Competitions => vec!["competitions", "list", "-p", page_arg, "--csv"],
            ResourceKind::Models => {
                return Err(HarvestError::defect("models are listed by token, not by page number"))
            }
        };

        let output = self.runner.run(&args).await?;
        let rows = parse_csv_rows(&output)?;
        let listed = rows.len();

        let mut items = Vec::with_capacity(listed);
        for row in rows {
            let reference = row_reference(&row)?;
            if self.kind == ResourceKind::Datasets {
                let rating = usability(&row);
                if rating < self.min_usability {
                    debug!(item = %reference, rating, "Below usability threshold");
                    continue;
                }
                items.push(ListedItem::with_fields(reference, dataset_fields(row)));
            } else {
                items.push(ListedItem::with_fields(reference, row));
            }
        }

        let filtered = listed - items.len();
        info!(kind = %self.kind, page, listed, kept = items.len(), "Listing page fetched");
        Ok(PageResult {
            items,
            next_token: None,
            filtered,
        })
    }

    async fn token_page(&self, token: Option<&str>) -> Result<PageResult, HarvestError> {
        let mut args = vec!["models", "list", "--sort-by", "voteCount", "-v"];
        if let Some(token) = token {
            args.extend(["--page-token", token]);
        }
        let output = self.runner.run(&args).await?;
        let page = parse_token_page(&output)?;
        info!(
            kind = %self.kind,
            items = page.items.len(),
            has_next = page.next_token.is_some(),
            "Listing page fetched"
        );
        Ok(page)
    }
}

#[async_trait]
impl PageSource for KaggleListing {
    fn cursor_kind(&self) -> CursorKind {
        self.kind.cursor_kind()
    }

    async fn fetch_page(&self, cursor: &Cursor) -> Result<PageResult, HarvestError> {
        match cursor {
            Cursor::NumericPage(page) => self.numeric_page(*page).await,
            Cursor::OpaqueToken(token) if self.kind == ResourceKind::Models => {
                self.token_page(token.as_deref()).await
            }
            other => Err(HarvestError::defect(format!(
                "cannot fetch {} listing at {}",
                self.kind, other
            ))),
        }
    }
}

/// Parses CSV output into one map per row, header names as keys.
///
/// Empty output, or the tool's "No ... found" notice, is an empty page.
pub fn parse_csv_rows(output: &str) -> Result<Vec<Fields>, HarvestError> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed.starts_with("No ") {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(trimmed.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| HarvestError::transient(format!("malformed CSV header: {}", e)))?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| HarvestError::transient(format!("malformed CSV row: {}", e)))?;
        let row: Fields = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.trim().to_string(), Value::String(v.to_string())))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Parses `models list -v` output: a `Next Page Token = T` line, then CSV.
///
/// # Errors
///
/// A missing token line is a [`HarvestError::Defect`]: the listing contract
/// changed and paging cannot continue safely.
pub fn parse_token_page(output: &str) -> Result<PageResult, HarvestError> {
    let trimmed = output.trim();
    let (first, rest) = trimmed.split_once('\n').unwrap_or((trimmed, ""));
    let first = first.trim();

    if !first.starts_with(TOKEN_HEADER) {
        if trimmed.starts_with("No ") {
            return Ok(PageResult::default());
        }
        return Err(HarvestError::defect(format!(
            "model listing does not start with '{}': '{}'",
            TOKEN_HEADER, first
        )));
    }
    let token = first
        .split_once('=')
        .map(|(_, t)| t.trim().to_string())
        .filter(|t| !t.is_empty());

    let mut items = Vec::new();
    for mut row in parse_csv_rows(rest)? {
        let reference = row_reference(&row)?;
        if let Some((owner, slug)) = reference.as_str().split_once('/') {
            row.insert("ownerSlug".into(), owner.into());
            row.insert("modelSlug".into(), slug.into());
        }
        items.push(ListedItem::with_fields(reference, row));
    }

    Ok(PageResult {
        items,
        next_token: token,
        filtered: 0,
    })
}

fn row_reference(row: &Fields) -> Result<ItemReference, HarvestError> {
    row.get("ref")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(ItemReference::new)
        .ok_or_else(|| HarvestError::defect("listing row has no 'ref' column"))
}

fn usability(row: &Fields) -> f64 {
    row.get("usabilityRating")
        .and_then(Value::as_str)
        .and_then(|r| r.trim().parse().ok())
        .unwrap_or(0.0)
}

/// Renames dataset listing columns to the record's field names.
fn dataset_fields(row: Fields) -> Fields {
    let mut fields = Fields::new();
    for (column, field) in [
        ("ref", "Ref"),
        ("title", "Title"),
        ("lastUpdated", "lastUpdated"),
        ("size", "DatasetSize"),
        ("usabilityRating", "usabilityRating"),
    ] {
        if let Some(value) = row.get(column) {
            fields.insert(field.to_string(), value.clone());
        }
    }
    fields
}
