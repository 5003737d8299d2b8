//! The PDF document source.
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ Document { metadata, pages }
//! (URL/path) (pdfium)  (base64)
//! ```
//!
//! 1. [`input`]: canonicalise the user-supplied path or URL to a local file
//! 2. [`render`]: rasterise every slide inside `spawn_blocking`
//! 3. [`encode`]: PNG-encode and base64-wrap each slide
//!
//! The orchestrator only needs [`Document`]; callers with another source can
//! build one themselves and call [`crate::run_document`].

pub mod encode;
pub mod input;
pub mod render;

use crate::config::PipelineConfig;
use crate::error::PharmDeckError;
use crate::output::{Document, DocumentMetadata};
use std::time::Instant;
use tracing::info;

/// Load a deck from a local path or URL.
pub async fn load(input_str: &str, config: &PipelineConfig) -> Result<Document, PharmDeckError> {
    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let pdf_path = resolved.path();

    let mut metadata = render::extract_metadata(pdf_path, config.password.as_deref()).await?;
    metadata.document_id = input_str.to_string();

    let start = Instant::now();
    let pages = render::render_pages(pdf_path, config).await?;
    info!(
        "Rendered {} of {} slides in {}ms",
        pages.len(),
        metadata.page_count,
        start.elapsed().as_millis()
    );

    Ok(Document { metadata, pages })
}

/// Metadata only; no slide is rendered.
pub async fn inspect(input_str: &str, config: &PipelineConfig) -> Result<DocumentMetadata, PharmDeckError> {
    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let mut metadata = render::extract_metadata(resolved.path(), config.password.as_deref()).await?;
    metadata.document_id = input_str.to_string();
    Ok(metadata)
}
