//! Error types for the pharmdeck library.
//!
//! The taxonomy mirrors how far a failure is allowed to travel:
//!
//! * [`PharmDeckError`]: **fatal**. The run cannot start or cannot write its
//!   artifact (bad input file, provider not configured, invalid config).
//!   Returned as `Err(PharmDeckError)` from the top-level `run*` functions.
//!
//! * [`PageError`]: **non-fatal**. Every provider failed for one page. It is
//!   stored on the placeholder [`crate::output::AggregatedResult`] and the
//!   traversal moves on to the next page.
//!
//! * [`ProviderError`]: one provider call failed. Absorbed by the fan-out
//!   engine; the provider contributes nothing for that page.
//!
//! * [`NormalizationError`], [`MemoryError`] and [`ToolError`]: leaf errors.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pharmdeck library.
#[derive(Debug, Error)]
pub enum PharmDeckError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or place libpdfium next to the binary."
    )]
    PdfiumBindingFailed(String),

    // ── Provider errors ───────────────────────────────────────────────────
    /// A configured provider could not be constructed (missing API key etc.).
    #[error("Extraction provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the export artifact.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A checkpoint existed but could not be read or written.
    #[error("Checkpoint error at '{path}': {detail}")]
    Checkpoint { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// Attached to the placeholder result so the export shows exactly which
/// pages were lost and why.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// No provider in the active set produced a usable extraction.
    #[error("Page {page}: all {attempted} providers failed ({})", .failures.join("; "))]
    AllProvidersFailed {
        page: usize,
        attempted: usize,
        failures: Vec<String>,
    },
}

/// Failure of a single `extract` or `synthesize` call.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The backend returned an error (HTTP, auth, content filter, …).
    #[error("provider '{provider}' failed: {detail}")]
    Backend { provider: String, detail: String },

    /// The backend call exceeded the per-call timeout.
    #[error("provider '{provider}' timed out after {secs}s")]
    Timeout { provider: String, secs: u64 },

    /// The response could not be unwrapped into clean text.
    #[error("provider '{provider}' returned an unusable response: {source}")]
    Normalization {
        provider: String,
        #[source]
        source: NormalizationError,
    },

    /// The tool-augmented loop kept calling tools past the step cap.
    #[error("provider '{provider}' exceeded {steps} reasoning steps without a final answer")]
    ToolLoopExhausted { provider: String, steps: usize },
}

/// Response unwrapping failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    /// The response carried no substantive text.
    #[error("response is empty")]
    Empty,

    /// A structured response did not match any known shape.
    #[error("unrecognised response shape: {0}")]
    UnrecognizedShape(String),

    /// A message-list response had no entries.
    #[error("message list is empty")]
    EmptyTranscript,
}

/// Failures inside a reasoning-loop tool. Always turned into an observation
/// for the model, never into a provider failure.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The external search capability failed.
    #[error("search failed: {0}")]
    Search(String),

    /// The schema catalogue could not be loaded.
    #[error("schema catalogue error: {0}")]
    Schema(String),
}

/// Semantic memory index failures.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The embedding capability failed.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// The embedding capability returned the wrong number or size of vectors.
    #[error("embedding shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_providers_failed_display_lists_failures() {
        let e = PageError::AllProvidersFailed {
            page: 4,
            attempted: 2,
            failures: vec!["a: timeout".into(), "b: 500".into()],
        };
        let msg = e.to_string();
        assert!(msg.contains("Page 4"), "got: {msg}");
        assert!(msg.contains("a: timeout; b: 500"), "got: {msg}");
    }

    #[test]
    fn provider_timeout_display() {
        let e = ProviderError::Timeout {
            provider: "openai:gpt-4.1".into(),
            secs: 120,
        };
        assert!(e.to_string().contains("120s"));
        assert!(e.to_string().contains("openai:gpt-4.1"));
    }

    #[test]
    fn normalization_error_is_source_of_provider_error() {
        use std::error::Error as _;
        let e = ProviderError::Normalization {
            provider: "gemini:gemini-2.0-flash".into(),
            source: NormalizationError::Empty,
        };
        assert_eq!(e.source().map(|s| s.to_string()), Some("response is empty".into()));
    }

    #[test]
    fn page_error_serialises() {
        let e = PageError::AllProvidersFailed {
            page: 1,
            attempted: 1,
            failures: vec!["x".into()],
        };
        let json = serde_json::to_string(&e).expect("serialise");
        let back: PageError = serde_json::from_str(&json).expect("deserialise");
        assert_eq!(back, e);
    }
}
