//! # pharmdeck
//!
//! Extract structured pharmaceutical facts from slide decks by running
//! several vision LLMs over every slide and merging what they find.
//!
//! ## Why several models?
//!
//! Investor and R&D decks pack trial tables, dosing, regulatory dates and
//! partnership terms into dense slides. Any single model misreads some of
//! it. Asking two or three independent models and letting an aggregator
//! reconcile their answers catches most single-model misses, and a
//! semantic memory of earlier slides keeps drug and trial names consistent
//! across a 60-slide deck.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / URL
//!  │
//!  ├─ 1. Load       resolve input, rasterise slides via pdfium, base64 PNG
//!  ├─ 2. Select     traversal state machine picks the next slide
//!  ├─ 3. Extract    fan out to every active provider (tool loop: memory,
//!  │                search, schema lookups)
//!  ├─ 4. Aggregate  passthrough, synthesis, or degraded fallback
//!  ├─ 5. Remember   sections + full text into the memory index
//!  ├─ 6. Check      count-based completion, checkpoint
//!  └─ 7. Export     ordered `## Slide N` sections
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pharmdeck::{run, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .providers(["gemini:gemini-2.0-flash", "openai:gpt-4.1"])
//!         .aggregator("anthropic:claude-sonnet-4-20250514")
//!         .company("Acme Pharma")
//!         .build()?;
//!     let output = run("decks/q3-pipeline.pdf", &config).await?;
//!     println!("{}", output.export);
//!     eprintln!("{} slides, {} failed", output.stats.total_pages, output.stats.failed_pages);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pharmdeck` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pharmdeck = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod aggregate;
pub mod config;
pub mod error;
pub mod export;
pub mod memory;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod provider;
pub mod tools;
pub mod traversal;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use aggregate::fan_out_and_aggregate;
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{MemoryError, NormalizationError, PageError, PharmDeckError, ProviderError};
pub use memory::{ChunkCategory, Embedder, MemoryChunk, MemoryIndex, PageRange, QueryFilter};
pub use orchestrator::{inspect, run, run_document, run_sync};
pub use output::{
    AggregatedResult, Document, DocumentMetadata, ExportOutcome, ExtractionRecord, Page,
    PageImage, ResultStatus, RunOutput, RunStats, RunStatus, TraversalAnomaly,
};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback};
pub use provider::{
    normalize_response, ExtractionProvider, ExtractionRequest, ProviderKind, ProviderSet,
    ProviderSpec, RawResponse,
};
pub use tools::{SchemaCatalog, SearchCapability, ToolBox};
pub use traversal::{advance, check_complete, TraversalState};
