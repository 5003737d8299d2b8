//! Persisted output: one combined markdown file per run.
//!
//! ```text
//! ## Slide 1
//!
//! <text>
//!
//! ---
//!
//! ## Slide 2
//! ...
//! ```
//!
//! Sections are always emitted in ascending page order, whatever order the
//! results arrive in. Page text gets a light tidy-up first (stray fences,
//! line endings, blank runs, broken tables, invisible characters) since
//! models occasionally wrap or pad their answers despite the prompt.

use crate::error::PharmDeckError;
use crate::output::{AggregatedResult, ExportOutcome};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Separator between page sections.
pub const SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// Render every result as a `## Slide N` section, ascending by page number.
pub fn render_export(results: &[AggregatedResult]) -> String {
    let mut ordered: Vec<&AggregatedResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.page_number);

    let sections: Vec<String> = ordered
        .iter()
        .map(|r| format!("## Slide {}\n\n{}", r.page_number, tidy(&r.text)))
        .collect();
    let mut out = sections.join(SECTION_SEPARATOR);
    out.push('\n');
    out
}

/// File-name prefix for a document: the sanitised file stem of its id, or a
/// timestamped fallback.
pub fn export_prefix(document_id: &str) -> String {
    let stem = document_id
        .trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .and_then(|name| Path::new(name).file_stem())
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('_');

    if cleaned.is_empty() {
        format!("extraction_{}", chrono::Local::now().format("%Y%m%d_%H%M%S"))
    } else {
        cleaned.to_string()
    }
}

/// `<output_dir>/<prefix>_combined.md`.
pub fn export_path(output_dir: &Path, prefix: &str) -> PathBuf {
    output_dir.join(format!("{prefix}_combined.md"))
}

/// Render and, when an output directory is given, persist the export.
///
/// Returns the rendered text and where it went. A run with no successful
/// page renders nothing and writes nothing.
pub async fn export(
    results: &[AggregatedResult],
    prefix: &str,
    output_dir: Option<&Path>,
) -> Result<(String, ExportOutcome), PharmDeckError> {
    if results.iter().all(AggregatedResult::is_failed) {
        warn!("Nothing extracted: no page produced a usable result");
        return Ok((String::new(), ExportOutcome::NothingExtracted));
    }

    let content = render_export(results);
    let Some(dir) = output_dir else {
        return Ok((content, ExportOutcome::InMemory));
    };

    let path = export_path(dir, prefix);
    write_atomic(&path, content.as_bytes()).await?;
    info!("Export written to {}", path.display());
    Ok((content, ExportOutcome::Written { path }))
}

/// Write via a sibling temp file and rename, so readers never see a partial
/// file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PharmDeckError> {
    let fail = |e: std::io::Error| PharmDeckError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(fail)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await.map_err(fail)?;
    tokio::fs::rename(&tmp, path).await.map_err(fail)
}

// ── Tidy-up ──────────────────────────────────────────────────────────────

/// Cosmetic clean-up of one page's text. Never touches content.
pub fn tidy(text: &str) -> String {
    let s = strip_outer_fence(text);
    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    let s = s.lines().map(str::trim_end).collect::<Vec<_>>().join("\n");
    let s = RE_BLANK_RUN.replace_all(&s, "\n\n").to_string();
    let s = fix_tables(&s);
    let s = s.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    );
    s.trim().to_string()
}

static RE_OUTER_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\n(.*)\n```\s*$").unwrap());

static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn strip_outer_fence(input: &str) -> String {
    match RE_OUTER_FENCE.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// Insert a missing header separator and drop separators inside a table
/// body.
fn fix_tables(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut row_in_table = 0usize;

    for (i, line) in lines.iter().enumerate() {
        if !is_table_row(line) {
            row_in_table = 0;
            out.push(line.to_string());
            continue;
        }
        row_in_table += 1;
        let separator = is_separator_row(line);
        if separator && row_in_table != 2 {
            row_in_table -= 1;
            continue;
        }
        out.push(line.to_string());

        if row_in_table == 1 && !separator {
            let next = lines.get(i + 1).copied().unwrap_or("");
            if is_table_row(next) && !is_separator_row(next) {
                let cols = line.matches('|').count().saturating_sub(1).max(1);
                let sep: String = std::iter::once("|")
                    .chain(std::iter::repeat_n(" --- |", cols))
                    .collect();
                out.push(sep);
                row_in_table += 1;
            }
        }
    }
    out.join("\n")
}
