use crate::cursor::{Cursor, CursorKind};
use crate::model::{BatchOutcomes, PageId, PageResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a failure is not worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    /// The resource is confirmed absent (removed, private, never existed).
    NotFound,
    /// The work was already done by an earlier run.
    AlreadyExists,
    /// The service permanently refused the request.
    Rejected,
}

/// Retry classification of a [`HarvestError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Terminal,
    Exhausted,
    Defect,
}

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("terminal failure ({kind:?}): {message}")]
    Terminal { kind: TerminalKind, message: String },
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<HarvestError>,
    },
    #[error("defect: {0}")]
    Defect(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarvestError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::Terminal {
            kind: TerminalKind::NotFound,
            message: message.into(),
        }
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::Terminal {
            kind: TerminalKind::AlreadyExists,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Terminal {
            kind: TerminalKind::Rejected,
            message: message.into(),
        }
    }

    pub fn defect(message: impl Into<String>) -> Self {
        Self::Defect(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) | Self::Io(_) => ErrorClass::Transient,
            Self::Terminal { .. } => ErrorClass::Terminal,
            Self::RetriesExhausted { .. } => ErrorClass::Exhausted,
            Self::Defect(_) | Self::Json(_) => ErrorClass::Defect,
        }
    }

    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Number of attempts recorded on an exhausted error, if any.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// Source of listing pages for one harvest target.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Pagination style of this listing. A run never mixes the two.
    fn cursor_kind(&self) -> CursorKind;

    /// Fetches the page at `cursor`. Must be safe to call again on failure.
    async fn fetch_page(&self, cursor: &Cursor) -> Result<PageResult, HarvestError>;
}

/// Durable destination for per-page outcome batches.
///
/// `persist` is an upsert keyed by `page_id` and then by reference: calling it
/// twice with the same id leaves exactly one artifact. References absent from
/// the new batch keep their stored outcome, and a stored `Success` is never
/// replaced by a skip or failure.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn persist(&self, page_id: &PageId, outcomes: &BatchOutcomes)
        -> Result<(), HarvestError>;
}
