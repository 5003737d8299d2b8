//! Progress-callback trait for per-page extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to follow a
//! run as it walks the deck: the CLI drives its progress bar from these
//! events, a server could forward them to a channel.
//!
//! Pages are extracted one at a time, but the per-provider events for a page
//! arrive from concurrent provider calls, so implementations still need
//! `Send + Sync` and synchronised state.
//!
//! # Example
//!
//! ```rust
//! use pharmdeck::{ExtractionProgressCallback, PipelineConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_number: usize, _total: usize, source_count: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("slide {page_number}: {source_count} source(s)");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the orchestrator as it processes each page.
///
/// All methods default to no-ops so callers only override what they need.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Once, after the document is loaded.
    ///
    /// `resumed_pages` counts pages restored from a checkpoint.
    fn on_run_start(&self, total_pages: usize, resumed_pages: usize) {
        let _ = (total_pages, resumed_pages);
    }

    /// Before the providers are called for a page.
    fn on_page_start(&self, page_number: usize, total_pages: usize) {
        let _ = (page_number, total_pages);
    }

    /// One provider finished its extraction for a page, successfully or not.
    fn on_provider_result(&self, page_number: usize, provider_id: &str, ok: bool) {
        let _ = (page_number, provider_id, ok);
    }

    /// A page produced a canonical result from `source_count` extractions.
    fn on_page_complete(&self, page_number: usize, total_pages: usize, source_count: usize) {
        let _ = (page_number, total_pages, source_count);
    }

    /// Every provider failed for a page; a placeholder was recorded.
    fn on_page_error(&self, page_number: usize, total_pages: usize, error: &str) {
        let _ = (page_number, total_pages, error);
    }

    /// Once, after export.
    fn on_run_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// Default when no callback is configured.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// The type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
