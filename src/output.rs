//! Data model shared by every pipeline stage.
//!
//! Pages are produced once by the document source and never mutated.
//! Provider outputs ([`ExtractionRecord`]) live only until their page is
//! aggregated; the per-page [`AggregatedResult`] is the only long-lived
//! product of a run.

use crate::error::PageError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Base64-encoded raster of one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageImage {
    /// Base64 payload without a data-URI prefix.
    pub data: String,
    /// MIME type of the decoded payload, e.g. `image/png`.
    pub mime_type: String,
}

impl PageImage {
    pub fn png(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: "image/png".to_string(),
        }
    }

    /// `data:<mime>;base64,<payload>` form used by URL-style image envelopes.
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// One rendered slide of the source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// 1-indexed, matches presentation order. Not necessarily contiguous.
    pub page_number: usize,
    pub image: PageImage,
}

/// Document-level facts fed into every extraction prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: String,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub company: String,
    pub event: String,
    pub date: String,
    /// Stable identifier for the source, usually the input path or URL.
    pub document_id: String,
    pub page_count: usize,
}

/// Ordered pages plus metadata, as produced by a document source.
#[derive(Debug, Clone)]
pub struct Document {
    pub metadata: DocumentMetadata,
    pub pages: Vec<Page>,
}

/// Output of one provider applied to one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub provider_id: String,
    /// Provider-normalized extraction text.
    pub text: String,
    pub page_number: usize,
}

/// How a page's canonical text came to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultStatus {
    /// Exactly one provider succeeded; its text is used verbatim.
    Passthrough,
    /// Several providers succeeded and the aggregator merged them.
    Synthesized,
    /// Synthesis failed; the first successful candidate was kept.
    Degraded { reason: String },
    /// Every provider failed; the text is a placeholder.
    Failed { error: PageError },
}

/// Canonical, page-scoped output of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub page_number: usize,
    pub text: String,
    /// Number of extraction records that contributed. Zero only for
    /// [`ResultStatus::Failed`] placeholders.
    pub source_count: usize,
    /// Provider ids that contributed, in active-set order.
    pub contributors: Vec<String>,
    pub status: ResultStatus,
}

impl AggregatedResult {
    /// Placeholder recorded when every provider failed for a page.
    pub fn failed(page_number: usize, error: PageError) -> Self {
        Self {
            page_number,
            text: format!("_Extraction failed: {error}_"),
            source_count: 0,
            contributors: Vec::new(),
            status: ResultStatus::Failed { error },
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, ResultStatus::Failed { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.status, ResultStatus::Degraded { .. })
    }
}

/// Traversal anomaly that ended a run early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraversalAnomaly {
    /// The current page number is not in the page collection.
    PageNotFound { page_number: usize },
    /// The stage graph exceeded its transition budget.
    StepLimitExceeded { limit: usize },
}

impl std::fmt::Display for TraversalAnomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraversalAnomaly::PageNotFound { page_number } => {
                write!(f, "current page {page_number} not found in the page collection")
            }
            TraversalAnomaly::StepLimitExceeded { limit } => {
                write!(f, "stage graph exceeded {limit} transitions")
            }
        }
    }
}

/// Final state of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    CompleteWithWarnings { warnings: Vec<String> },
    Aborted { anomaly: TraversalAnomaly },
}

/// Where the export artifact went, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExportOutcome {
    Written { path: PathBuf },
    /// Export rendered but not persisted (no output directory configured).
    InMemory,
    /// Zero pages succeeded; nothing was written.
    NothingExtracted,
}

/// Aggregate statistics for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_pages: usize,
    pub processed_pages: usize,
    pub failed_pages: usize,
    pub degraded_pages: usize,
    /// Pages restored from a checkpoint instead of being re-extracted.
    pub resumed_pages: usize,
    pub memory_chunks: usize,
    pub total_duration_ms: u64,
}

/// Everything a run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    pub metadata: DocumentMetadata,
    /// Results in ascending page order.
    pub results: Vec<AggregatedResult>,
    /// Rendered export artifact (empty when nothing was extracted).
    pub export: String,
    pub export_outcome: ExportOutcome,
    pub status: RunStatus,
    pub stats: RunStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_uri_has_prefix() {
        let img = PageImage::png("QUJD");
        assert_eq!(img.data_uri(), "data:image/png;base64,QUJD");
    }

    #[test]
    fn failed_placeholder_is_marked() {
        let r = AggregatedResult::failed(
            7,
            PageError::AllProvidersFailed {
                page: 7,
                attempted: 2,
                failures: vec![],
            },
        );
        assert!(r.is_failed());
        assert!(!r.is_degraded());
        assert_eq!(r.source_count, 0);
        assert!(r.text.contains("Extraction failed"));
    }

    #[test]
    fn status_serialises_with_kind_tag() {
        let json = serde_json::to_string(&ResultStatus::Degraded {
            reason: "boom".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"kind":"degraded","reason":"boom"}"#);
    }
}
