//! Per-page checkpoints so an interrupted run can resume.
//!
//! The file sits next to the export as `<prefix>.checkpoint.json` and holds
//! every result produced so far plus the page the traversal was on. It is
//! rewritten atomically after each page.

use crate::error::PharmDeckError;
use crate::export::write_atomic;
use crate::output::AggregatedResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// On-disk checkpoint record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub document_id: String,
    pub page_count: usize,
    /// Page the traversal was positioned on when the checkpoint was taken.
    pub current_page: Option<usize>,
    pub results: Vec<AggregatedResult>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        document_id: &str,
        page_count: usize,
        current_page: Option<usize>,
        results: &[AggregatedResult],
    ) -> Self {
        Self {
            document_id: document_id.to_string(),
            page_count,
            current_page,
            results: results.to_vec(),
            saved_at: Utc::now(),
        }
    }

    /// Whether this checkpoint was taken for the same document.
    pub fn matches(&self, document_id: &str, page_count: usize) -> bool {
        self.document_id == document_id && self.page_count == page_count
    }

    /// Whether the saved position agrees with the saved results: exactly one
    /// result for each page up to and including `current_page`.
    pub fn is_consistent(&self, page_numbers: &[usize]) -> bool {
        let Some(current) = self.current_page else {
            return self.results.is_empty();
        };
        let Some(index) = page_numbers.iter().position(|&n| n == current) else {
            return false;
        };
        let mut saved: Vec<usize> = self.results.iter().map(|r| r.page_number).collect();
        saved.sort_unstable();
        saved == page_numbers[..=index]
    }
}

pub fn checkpoint_path(output_dir: &Path, prefix: &str) -> PathBuf {
    output_dir.join(format!("{prefix}.checkpoint.json"))
}

pub async fn save(path: &Path, checkpoint: &Checkpoint) -> Result<(), PharmDeckError> {
    let json = serde_json::to_vec_pretty(checkpoint).map_err(|e| PharmDeckError::Checkpoint {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    write_atomic(path, &json).await?;
    debug!(
        "Checkpoint saved: {} results at {}",
        checkpoint.results.len(),
        path.display()
    );
    Ok(())
}

/// Read a checkpoint. `Ok(None)` when there is no file.
pub async fn load(path: &Path) -> Result<Option<Checkpoint>, PharmDeckError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(PharmDeckError::Checkpoint {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| PharmDeckError::Checkpoint {
            path: path.to_path_buf(),
            detail: format!("unreadable checkpoint: {e}"),
        })
}

/// Delete a checkpoint; a missing file is fine.
pub async fn remove(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Checkpoint removed: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove checkpoint {}: {}", path.display(), e),
    }
}
