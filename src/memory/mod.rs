//! Semantic memory: an append-only similarity index over prior extractions.
//!
//! Every aggregated page result is recorded twice over: once whole, and once
//! per markdown section (`## Clinical Trials`, `### Drugs (Phase 3)`, …). The
//! whole-page chunk guarantees a lookup can always recover full page context
//! even when a provider ignores the sectioned output format.
//!
//! ## Visibility
//!
//! Embeddings are computed before the write lock is taken and the new chunks
//! are appended in one step, so a concurrent query sees either none or all of
//! a page's chunks, never a partial write. Queries never hold the lock across
//! an embedding call.
//!
//! ## Filtering
//!
//! Similarity ranking always runs over the whole index. Category and page
//! range filters are applied afterwards to the top-K; when they remove every
//! candidate the query returns empty rather than retrying with looser filters.

mod embedder;

pub use embedder::{resolve_embedder, Embedder, HashingEmbedder, OpenAiEmbedder};

use crate::config::{MAX_TOP_K, MIN_TOP_K};
use crate::error::MemoryError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Category label reserved for whole-page chunks.
pub const FULL_EXTRACTION_LABEL: &str = "full_extraction";

/// What kind of information a chunk holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkCategory {
    /// The complete, undecomposed page text.
    FullExtraction,
    /// One section, labelled by its header text including any qualifier.
    Section(String),
}

impl ChunkCategory {
    pub fn label(&self) -> &str {
        match self {
            ChunkCategory::FullExtraction => FULL_EXTRACTION_LABEL,
            ChunkCategory::Section(s) => s,
        }
    }

    /// Interpret a caller-supplied filter label.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim();
        if label == FULL_EXTRACTION_LABEL {
            ChunkCategory::FullExtraction
        } else {
            ChunkCategory::Section(label.to_string())
        }
    }
}

impl fmt::Display for ChunkCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One indexed unit of prior extraction text. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryChunk {
    pub content: String,
    pub page_number: usize,
    pub category: ChunkCategory,
}

/// A chunk returned by a query, with its similarity to the concept.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: MemoryChunk,
    pub score: f32,
}

/// Inclusive page-number range, parsed from `"2-4"` or `"3"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub fn contains(&self, page: usize) -> bool {
        page >= self.start && page <= self.end
    }
}

impl FromStr for PageRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |p: &str| {
            p.trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid page range '{s}'"))
        };
        let (start, end) = match s.split_once('-') {
            Some((a, b)) => (parse(a)?, parse(b)?),
            None => {
                let n = parse(s)?;
                (n, n)
            }
        };
        if start > end {
            return Err(format!("invalid page range '{s}': start after end"));
        }
        Ok(Self { start, end })
    }
}

/// Optional hard post-filters for [`MemoryIndex::query`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    pub category: Option<ChunkCategory>,
    pub page_range: Option<PageRange>,
}

impl QueryFilter {
    fn accepts(&self, chunk: &MemoryChunk) -> bool {
        self.category.as_ref().is_none_or(|c| *c == chunk.category)
            && self
                .page_range
                .is_none_or(|r| r.contains(chunk.page_number))
    }
}

struct StoredChunk {
    chunk: MemoryChunk,
    vector: Vec<f32>,
}

/// In-process similarity index, created once per run.
pub struct MemoryIndex {
    embedder: Arc<dyn Embedder>,
    top_k: usize,
    chunks: RwLock<Vec<StoredChunk>>,
}

impl fmt::Debug for MemoryIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryIndex")
            .field("embedder", &self.embedder.name())
            .field("top_k", &self.top_k)
            .finish_non_exhaustive()
    }
}

impl MemoryIndex {
    /// `top_k` is clamped to 3..=5.
    pub fn new(embedder: Arc<dyn Embedder>, top_k: usize) -> Self {
        Self {
            embedder,
            top_k: top_k.clamp(MIN_TOP_K, MAX_TOP_K),
            chunks: RwLock::new(Vec::new()),
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub async fn len(&self) -> usize {
        self.chunks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.chunks.read().await.is_empty()
    }

    /// Snapshot of all chunks in insertion order.
    pub async fn chunks(&self) -> Vec<MemoryChunk> {
        self.chunks
            .read()
            .await
            .iter()
            .map(|s| s.chunk.clone())
            .collect()
    }

    /// Decompose and index one page's final text. Returns the number of
    /// chunks added.
    pub async fn record_extraction(
        &self,
        text: &str,
        page_number: usize,
    ) -> Result<usize, MemoryError> {
        if text.trim().is_empty() {
            return Ok(0);
        }

        let chunks = decompose(text, page_number);
        let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed(&contents).await?;
        if vectors.len() != chunks.len() {
            return Err(MemoryError::ShapeMismatch {
                expected: chunks.len(),
                actual: vectors.len(),
            });
        }

        let mut store = self.chunks.write().await;
        let dimension = store
            .first()
            .map(|s| s.vector.len())
            .or_else(|| vectors.first().map(Vec::len))
            .unwrap_or(0);
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(MemoryError::ShapeMismatch {
                expected: dimension,
                actual: bad.len(),
            });
        }

        let added = chunks.len();
        store.extend(
            chunks
                .into_iter()
                .zip(vectors)
                .map(|(chunk, vector)| StoredChunk { chunk, vector }),
        );
        debug!(
            page = page_number,
            added,
            total = store.len(),
            "memory index updated"
        );
        Ok(added)
    }

    /// Nearest chunks to `concept`, best first, after post-filtering.
    pub async fn query(
        &self,
        concept: &str,
        filter: &QueryFilter,
    ) -> Result<Vec<ScoredChunk>, MemoryError> {
        if self.chunks.read().await.is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed_one(concept).await?;

        let store = self.chunks.read().await;
        let mut ranked: Vec<(usize, f32)> = store
            .iter()
            .enumerate()
            .map(|(i, s)| (i, cosine_similarity(&query_vector, &s.vector)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(ranked
            .into_iter()
            .take(self.top_k)
            .filter(|(i, _)| filter.accepts(&store[*i].chunk))
            .map(|(i, score)| ScoredChunk {
                chunk: store[i].chunk.clone(),
                score,
            })
            .collect())
    }
}

/// Cosine similarity; zero when either vector is zero or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

static HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^#{1,6}[ \t]+(.+?)[ \t#]*$").unwrap());

/// Split text into section chunks plus the whole-page chunk.
///
/// Text before the first header only appears in the whole-page chunk. A
/// header with no body produces no section chunk.
pub fn decompose(text: &str, page_number: usize) -> Vec<MemoryChunk> {
    let headers: Vec<(usize, String)> = HEADER
        .captures_iter(text)
        .filter_map(|c| {
            let whole = c.get(0)?;
            let label = c.get(1)?.as_str().trim().to_string();
            Some((whole.start(), label))
        })
        .collect();

    let mut chunks = Vec::with_capacity(headers.len() + 1);
    for (i, (start, label)) in headers.iter().enumerate() {
        let end = headers.get(i + 1).map_or(text.len(), |(next, _)| *next);
        let section = text[*start..end].trim();
        let has_body = section.lines().skip(1).any(|l| !l.trim().is_empty());
        if has_body && !label.is_empty() {
            chunks.push(MemoryChunk {
                content: section.to_string(),
                page_number,
                category: ChunkCategory::Section(label.clone()),
            });
        }
    }

    chunks.push(MemoryChunk {
        content: text.trim().to_string(),
        page_number,
        category: ChunkCategory::FullExtraction,
    });
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds by looking for marker words; counts calls.
    struct KeywordEmbedder {
        calls: AtomicUsize,
    }

    impl KeywordEmbedder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        fn name(&self) -> &str {
            "keyword"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        if t.contains("xarelto") { 1.0 } else { 0.0 },
                        if t.contains("revenue") { 1.0 } else { 0.0 },
                        0.1,
                    ]
                })
                .collect())
        }
    }

    #[test]
    fn decompose_splits_on_headers_and_keeps_full_text() {
        let text = "Intro line\n## Drugs (Phase 3)\n- Xarelto\n### Trials\n- EINSTEIN\n## Empty\n";
        let chunks = decompose(text, 4);
        let labels: Vec<&str> = chunks.iter().map(|c| c.category.label()).collect();
        assert_eq!(labels, vec!["Drugs (Phase 3)", "Trials", FULL_EXTRACTION_LABEL]);
        assert!(chunks[0].content.starts_with("## Drugs (Phase 3)"));
        assert!(!chunks[0].content.contains("EINSTEIN"));
        assert_eq!(chunks[2].content, text.trim());
        assert!(chunks.iter().all(|c| c.page_number == 4));
    }

    #[test]
    fn unsectioned_text_degrades_to_single_full_chunk() {
        let chunks = decompose("Drug: foo (Confidence: 5)", 1);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].category, ChunkCategory::FullExtraction);
    }

    #[test]
    fn page_range_parsing() {
        assert_eq!("2-4".parse::<PageRange>(), Ok(PageRange { start: 2, end: 4 }));
        assert_eq!("3".parse::<PageRange>(), Ok(PageRange { start: 3, end: 3 }));
        assert!("4-2".parse::<PageRange>().is_err());
        assert!("two".parse::<PageRange>().is_err());
    }

    #[tokio::test]
    async fn empty_index_query_skips_embedding() {
        let embedder = Arc::new(KeywordEmbedder::new());
        let index = MemoryIndex::new(embedder.clone(), 3);
        let hits = index.query("xarelto", &QueryFilter::default()).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn page_range_filter_applies_after_ranking() {
        let index = MemoryIndex::new(Arc::new(KeywordEmbedder::new()), 3);
        for page in [1, 2, 3, 5] {
            let text = if page == 1 || page == 5 {
                "Drug: Xarelto anticoagulant"
            } else {
                "Revenue update"
            };
            index.record_extraction(text, page).await.unwrap();
        }
        assert_eq!(index.len().await, 4);

        let filter = QueryFilter {
            category: None,
            page_range: Some("2-4".parse().unwrap()),
        };
        let hits = index.query("Xarelto", &filter).await.unwrap();
        assert!(hits.iter().all(|h| (2..=4).contains(&h.chunk.page_number)));
        assert!(hits.iter().all(|h| h.chunk.page_number != 1 && h.chunk.page_number != 5));
    }

    #[tokio::test]
    async fn filters_that_remove_all_top_k_return_empty() {
        let index = MemoryIndex::new(Arc::new(KeywordEmbedder::new()), 3);
        for page in 1..=3 {
            index
                .record_extraction("Drug: Xarelto", page)
                .await
                .unwrap();
        }
        index.record_extraction("Revenue", 9).await.unwrap();

        // Page 9 is a valid match for the range but never reaches the top 3.
        let filter = QueryFilter {
            category: None,
            page_range: Some(PageRange { start: 9, end: 9 }),
        };
        assert!(index.query("xarelto", &filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn category_filter_is_exact() {
        let index = MemoryIndex::new(Arc::new(KeywordEmbedder::new()), 5);
        index
            .record_extraction("## Drugs\n- Xarelto\n## Financials\n- revenue up", 2)
            .await
            .unwrap();
        let filter = QueryFilter {
            category: Some(ChunkCategory::from_label("Drugs")),
            page_range: None,
        };
        let hits = index.query("xarelto", &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.category.label(), "Drugs");
    }

    #[tokio::test]
    async fn blank_text_adds_nothing() {
        let index = MemoryIndex::new(Arc::new(KeywordEmbedder::new()), 3);
        assert_eq!(index.record_extraction("  \n", 1).await.unwrap(), 0);
        assert!(index.is_empty().await);
    }
}
