use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cursor::Cursor;
use crate::traits::{ErrorClass, HarvestError, TerminalKind};

/// Free-form record fields (listing columns, enrichment results).
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Outcomes of one page, keyed by reference.
pub type BatchOutcomes = BTreeMap<ItemReference, ProcessingOutcome>;

/// Unique external identifier of a harvestable resource, e.g. `owner/slug`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemReference(String);

impl ItemReference {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment (`owner/slug` → `slug`).
    pub fn slug(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Filesystem-safe rendering (`owner/slug` → `owner__slug`).
    ///
    /// Distinct references never share a stem: `/` becomes `__` and every
    /// other byte outside `[A-Za-z0-9.-]`, `_` included, becomes `_xx` (hex).
    /// A leading `.` is escaped too, so a stem is never `.`, `..` or hidden.
    pub fn file_stem(&self) -> String {
        if self.0.is_empty() {
            return "_".to_string();
        }
        let mut stem = String::with_capacity(self.0.len());
        for (i, byte) in self.0.bytes().enumerate() {
            match byte {
                b'/' => stem.push_str("__"),
                b'.' if i == 0 => stem.push_str("_2e"),
                b if b.is_ascii_alphanumeric() || b == b'-' || b == b'.' => stem.push(b as char),
                b => stem.push_str(&format!("_{:02x}", b)),
            }
        }
        stem
    }
}

impl fmt::Display for ItemReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reference as it appeared in a listing, with the listing's own columns.
#[derive(Debug, Clone)]
pub struct ListedItem {
    pub reference: ItemReference,
    pub fields: Fields,
}

impl ListedItem {
    pub fn new(reference: ItemReference) -> Self {
        Self {
            reference,
            fields: Fields::new(),
        }
    }

    pub fn with_fields(reference: ItemReference, fields: Fields) -> Self {
        Self { reference, fields }
    }
}

/// One page of a listing as returned by a page source.
#[derive(Debug, Clone, Default)]
pub struct PageResult {
    /// Items in listing order.
    pub items: Vec<ListedItem>,
    /// Continuation token for token-paged listings. Ignored by numeric ones.
    pub next_token: Option<String>,
    /// Rows the service listed but the source filtered out. A numeric page
    /// with filtered rows is not the end of the listing.
    pub filtered: usize,
}

impl PageResult {
    /// True when the service itself returned no rows.
    pub fn is_empty_listing(&self) -> bool {
        self.items.is_empty() && self.filtered == 0
    }
}

/// Stable identity of a page, used to key persisted artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(String);

impl PageId {
    pub fn for_cursor(cursor: &Cursor) -> Self {
        match cursor {
            Cursor::NumericPage(n) => Self(format!("page_{}", n)),
            Cursor::OpaqueToken(None) => Self("token_start".to_string()),
            Cursor::OpaqueToken(Some(token)) => {
                let digest = Sha256::digest(token.as_bytes());
                let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
                Self(format!("token_{}", hex))
            }
            Cursor::Exhausted(_) => Self("exhausted".to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Enriched record of one successfully harvested item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Reference the record was produced for.
    pub reference: ItemReference,

    /// Unix timestamp when the record was produced (seconds since epoch)
    pub harvest_timestamp: i64,

    /// Version of the harvester that produced this record
    pub harvester_version: String,

    /// Listing columns merged with every enrichment step's output.
    #[serde(flatten)]
    pub fields: Fields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyExists,
    NotFound,
}

/// Serializable summary of the error behind a `Failed` outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub class: ErrorClass,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl From<&HarvestError> for ItemFailure {
    fn from(err: &HarvestError) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
            attempts: err.attempts(),
        }
    }
}

/// Exactly one of these is produced per reference per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessingOutcome {
    Success { record: ItemRecord },
    Skipped { reason: SkipReason },
    Failed { failure: ItemFailure },
}

impl ProcessingOutcome {
    /// Maps the error that stopped an item's pipeline to its outcome.
    pub fn from_error(err: &HarvestError) -> Self {
        match err {
            HarvestError::Terminal {
                kind: TerminalKind::NotFound,
                ..
            } => Self::Skipped {
                reason: SkipReason::NotFound,
            },
            HarvestError::Terminal {
                kind: TerminalKind::AlreadyExists,
                ..
            } => Self::Skipped {
                reason: SkipReason::AlreadyExists,
            },
            other => Self::Failed {
                failure: ItemFailure::from(other),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Per-page tallies reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageReport {
    pub page_id: PageId,
    pub cursor: Cursor,
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
    /// References already dispatched earlier in the same run.
    pub duplicates: usize,
}

impl PageReport {
    pub fn tally(
        page_id: PageId,
        cursor: Cursor,
        outcomes: &BatchOutcomes,
        duplicates: usize,
    ) -> Self {
        let mut report = Self {
            page_id,
            cursor,
            success: 0,
            skipped: 0,
            failed: 0,
            duplicates,
        };
        for outcome in outcomes.values() {
            match outcome {
                ProcessingOutcome::Success { .. } => report.success += 1,
                ProcessingOutcome::Skipped { .. } => report.skipped += 1,
                ProcessingOutcome::Failed { .. } => report.failed += 1,
            }
        }
        report
    }

    pub fn processed(&self) -> usize {
        self.success + self.skipped + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_helpers() {
        let r = ItemReference::new("alice/titanic-survival");
        assert_eq!(r.slug(), "titanic-survival");
        assert_eq!(r.file_stem(), "alice__titanic-survival");
        assert_eq!(ItemReference::new("../up").file_stem(), "_2e.__up");
        assert_eq!(ItemReference::new("..").file_stem(), "_2e.");
        assert_eq!(ItemReference::new("").file_stem(), "_");
        assert_eq!(ItemReference::new("plain").slug(), "plain");
    }

    #[test]
    fn test_file_stems_do_not_collide() {
        let refs = ["a_b/c", "a/b_c", "a/b/c", "a__b/c", "a/b c"];
        let stems: std::collections::HashSet<String> = refs
            .iter()
            .map(|r| ItemReference::new(*r).file_stem())
            .collect();
        assert_eq!(stems.len(), 5);
        assert_eq!(ItemReference::new("a_b/c").file_stem(), "a_5fb__c");
        assert_eq!(ItemReference::new("a/b_c").file_stem(), "a__b_5fc");
    }

    #[test]
    fn test_page_id_is_stable() {
        assert_eq!(PageId::for_cursor(&Cursor::NumericPage(3)).as_str(), "page_3");
        assert_eq!(PageId::for_cursor(&Cursor::OpaqueToken(None)).as_str(), "token_start");

        let a = PageId::for_cursor(&Cursor::OpaqueToken(Some("CfDJ8abc".into())));
        let b = PageId::for_cursor(&Cursor::OpaqueToken(Some("CfDJ8abc".into())));
        let c = PageId::for_cursor(&Cursor::OpaqueToken(Some("CfDJ8abd".into())));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), "token_".len() + 16);
    }

    #[test]
    fn test_outcome_from_error() {
        assert_eq!(
            ProcessingOutcome::from_error(&HarvestError::not_found("404")),
            ProcessingOutcome::Skipped {
                reason: SkipReason::NotFound
            }
        );
        assert_eq!(
            ProcessingOutcome::from_error(&HarvestError::already_exists("on disk")),
            ProcessingOutcome::Skipped {
                reason: SkipReason::AlreadyExists
            }
        );

        let exhausted = HarvestError::RetriesExhausted {
            attempts: 4,
            last: Box::new(HarvestError::transient("429")),
        };
        match ProcessingOutcome::from_error(&exhausted) {
            ProcessingOutcome::Failed { failure } => {
                assert_eq!(failure.class, ErrorClass::Exhausted);
                assert_eq!(failure.attempts, Some(4));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert!(matches!(
            ProcessingOutcome::from_error(&HarvestError::rejected("403")),
            ProcessingOutcome::Failed { .. }
        ));
    }

    #[test]
    fn test_record_flattens_fields() {
        let mut fields = Fields::new();
        fields.insert("Title".into(), "Titanic".into());
        let record = ItemRecord {
            reference: ItemReference::new("alice/titanic"),
            harvest_timestamp: 1_700_000_000,
            harvester_version: "0.1.0".into(),
            fields,
        };
        let outcome = ProcessingOutcome::Success { record };

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["record"]["reference"], "alice/titanic");
        assert_eq!(json["record"]["Title"], "Titanic");
    }

    #[test]
    fn test_page_report_tally() {
        let mut outcomes = BatchOutcomes::new();
        outcomes.insert(
            ItemReference::new("a/1"),
            ProcessingOutcome::Skipped {
                reason: SkipReason::NotFound,
            },
        );
        outcomes.insert(
            ItemReference::new("a/2"),
            ProcessingOutcome::from_error(&HarvestError::defect("missing field")),
        );
        let page_id = PageId::for_cursor(&Cursor::NumericPage(1));
        let report = PageReport::tally(page_id, Cursor::NumericPage(1), &outcomes, 2);
        assert_eq!((report.success, report.skipped, report.failed), (0, 1, 1));
        assert_eq!(report.duplicates, 2);
        assert_eq!(report.processed(), 2);
    }
}
