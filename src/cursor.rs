//! Position markers for paginated listings.
//!
//! A [`Cursor`] says which page to fetch next. Listings are paged either by a
//! 1-based page number or by an opaque continuation token handed out by the
//! service; both are advanced the same way by [`Cursor::advance`] so the
//! orchestrator never needs to know which one it is driving.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::PageResult;

/// Pagination style of a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorKind {
    NumericPage,
    OpaqueToken,
}

/// Immutable position in a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cursor {
    /// 1-based page number.
    NumericPage(u32),
    /// Continuation token; `None` addresses the first page.
    OpaqueToken(Option<String>),
    /// No further pages exist.
    Exhausted(CursorKind),
}

impl Cursor {
    /// First page of a listing of the given kind.
    pub fn initial(kind: CursorKind) -> Self {
        match kind {
            CursorKind::NumericPage => Cursor::NumericPage(1),
            CursorKind::OpaqueToken => Cursor::OpaqueToken(None),
        }
    }

    pub fn kind(&self) -> CursorKind {
        match self {
            Cursor::NumericPage(_) => CursorKind::NumericPage,
            Cursor::OpaqueToken(_) => CursorKind::OpaqueToken,
            Cursor::Exhausted(kind) => *kind,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Cursor::Exhausted(_))
    }

    /// Produces the cursor following the page fetched at `self`.
    ///
    /// Numeric listings end at the first page the service returns empty. Token listings end when
    /// the service stops handing out a (non-empty) next token.
    pub fn advance(&self, page: &PageResult) -> Cursor {
        match self {
            Cursor::NumericPage(n) => {
                if page.is_empty_listing() {
                    Cursor::Exhausted(CursorKind::NumericPage)
                } else {
                    Cursor::NumericPage(n.saturating_add(1))
                }
            }
            Cursor::OpaqueToken(_) => match page.next_token.as_deref().map(str::trim) {
                Some(token) if !token.is_empty() => Cursor::OpaqueToken(Some(token.to_string())),
                _ => Cursor::Exhausted(CursorKind::OpaqueToken),
            },
            Cursor::Exhausted(kind) => Cursor::Exhausted(*kind),
        }
    }
}

/// Numeric pages are totally ordered; tokens are advance-only and never compare.
impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Cursor::NumericPage(a), Cursor::NumericPage(b)) => Some(a.cmp(b)),
            (a, b) if a == b => Some(Ordering::Equal),
            _ => None,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::NumericPage(n) => write!(f, "page {}", n),
            Cursor::OpaqueToken(None) => write!(f, "token <start>"),
            Cursor::OpaqueToken(Some(token)) => write!(f, "token {}", token),
            Cursor::Exhausted(_) => write!(f, "exhausted"),
        }
    }
}
