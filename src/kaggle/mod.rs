//! Kaggle catalog collaborator: listings and enrichment steps per resource
//! kind, all driven through the `kaggle` command-line tool.

pub mod cli;
pub mod listing;
pub mod steps;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::KaggleConfig;
use crate::cursor::CursorKind;
use crate::harvest::traits::EnrichmentStep;

pub use cli::{classify, CommandRunner, KaggleCli};
pub use listing::KaggleListing;

/// Catalog section being harvested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Datasets,
    Kernels,
    Competitions,
    Models,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Datasets => "datasets",
            ResourceKind::Kernels => "kernels",
            ResourceKind::Competitions => "competitions",
            ResourceKind::Models => "models",
        }
    }

    /// Models are paged by continuation token, everything else by number.
    pub fn cursor_kind(&self) -> CursorKind {
        match self {
            ResourceKind::Models => CursorKind::OpaqueToken,
            _ => CursorKind::NumericPage,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn listing(
    kind: ResourceKind,
    runner: Arc<dyn CommandRunner>,
    config: &KaggleConfig,
) -> KaggleListing {
    KaggleListing::new(kind, runner, config.min_usability, config.page_size)
}

/// Ordered enrichment steps for `kind`. Downloaded content goes under
/// `<output_dir>/<kind>/`.
pub fn enrichment_steps(
    kind: ResourceKind,
    runner: Arc<dyn CommandRunner>,
    output_dir: &Path,
) -> Vec<Box<dyn EnrichmentStep>> {
    let kind_dir = output_dir.join(kind.as_str());
    match kind {
        ResourceKind::Datasets => vec![
            Box::new(steps::DatasetMetadataStep::new(runner.clone())),
            Box::new(steps::DatasetFilesStep::new(runner.clone())),
            Box::new(steps::DatasetContentStep::new(runner, kind_dir.join("content"))),
        ],
        ResourceKind::Kernels => vec![
            Box::new(steps::KernelPullStep::new(runner.clone())),
            Box::new(steps::KernelOutputStep::new(runner)),
            Box::new(steps::KernelStoreStep::new(kind_dir.join("code"))),
        ],
        ResourceKind::Competitions => vec![
            Box::new(steps::LeaderboardStep::new(runner.clone())),
            Box::new(steps::CompetitionFilesStep::new(runner)),
        ],
        ResourceKind::Models => vec![
            Box::new(steps::ModelCardStep::new(runner)),
            Box::new(steps::ModelVariationsStep),
        ],
    }
}
