//! Response unwrapping: every backend answer becomes one clean string.
//!
//! Answers reach us in three shapes:
//!
//! 1. Plain text.
//! 2. A message list (a reasoning transcript, or a serialised chat response)
//!    whose last entry carries the answer.
//! 3. A debug rendering of a message object, e.g.
//!    `content='…' additional_kwargs={…}`, where the real text sits inside the
//!    quoted `content` segment.
//!
//! Downstream consumers (memory index, export) assume clean text, so wrapper
//! syntax must never leak through. [`normalize_text`] is idempotent:
//! `normalize_text(normalize_text(x)) == normalize_text(x)`.

use crate::error::NormalizationError;
use serde_json::Value;

/// Role of one transcript entry in a reasoning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRole {
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub role: TranscriptRole,
    pub content: String,
}

impl TranscriptEntry {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TranscriptRole::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: TranscriptRole::Tool,
            content: content.into(),
        }
    }
}

/// An unprocessed backend answer.
#[derive(Debug, Clone)]
pub enum RawResponse {
    Text(String),
    Json(Value),
    Messages(Vec<TranscriptEntry>),
}

/// Unwrap any supported response shape into substantive text.
pub fn normalize_response(raw: RawResponse) -> Result<String, NormalizationError> {
    let text = match raw {
        RawResponse::Text(s) => from_content(&s)?,
        RawResponse::Json(v) => from_json(&v)?,
        RawResponse::Messages(entries) => {
            let last = entries.last().ok_or(NormalizationError::EmptyTranscript)?;
            from_content(&last.content)?
        }
    };
    if text.trim().is_empty() {
        return Err(NormalizationError::Empty);
    }
    Ok(text)
}

/// Strip a debug wrapper if present; return anything else unchanged.
pub fn normalize_text(s: &str) -> String {
    let mut text = s.to_string();
    // Each unwrap strips a `content=` prefix, so nesting runs out.
    while let Some(inner) = unwrap_debug_repr(&text) {
        if inner == text {
            break;
        }
        text = inner;
    }
    text
}

/// Text that might be a serialised response object.
fn from_content(s: &str) -> Result<String, NormalizationError> {
    let trimmed = s.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
            if looks_like_response(&v) {
                return from_json(&v);
            }
        }
    }
    Ok(normalize_text(s))
}

/// Only sniff JSON that carries a response field; extraction text may
/// legitimately be a JSON document of its own.
fn looks_like_response(v: &Value) -> bool {
    match v {
        Value::Object(map) => {
            map.contains_key("choices") || map.contains_key("messages") || map.contains_key("content")
        }
        Value::Array(items) => items.last().is_some_and(looks_like_response),
        _ => false,
    }
}

fn from_json(v: &Value) -> Result<String, NormalizationError> {
    match v {
        Value::String(s) => Ok(normalize_text(s)),
        Value::Array(items) => {
            let last = items.last().ok_or(NormalizationError::EmptyTranscript)?;
            from_json(last)
        }
        Value::Object(map) => {
            if let Some(content) = map.get("content") {
                return content_field(content);
            }
            if let Some(messages) = map.get("messages") {
                return from_json(messages);
            }
            if let Some(choice) = map.get("choices").and_then(|c| c.get(0)) {
                if let Some(content) = choice.get("message").and_then(|m| m.get("content")) {
                    return content_field(content);
                }
                if let Some(text) = choice.get("text") {
                    return content_field(text);
                }
            }
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            Err(NormalizationError::UnrecognizedShape(format!(
                "object with keys [{}]",
                keys.join(", ")
            )))
        }
        Value::Null => Err(NormalizationError::Empty),
        other => Err(NormalizationError::UnrecognizedShape(format!(
            "bare {}",
            json_kind(other)
        ))),
    }
}

/// A `content` field: a string, or a list of typed blocks.
fn content_field(content: &Value) -> Result<String, NormalizationError> {
    match content {
        Value::String(s) => Ok(normalize_text(s)),
        Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter_map(|b| match b {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(_) => b.get("text").and_then(Value::as_str),
                    _ => None,
                })
                .collect();
            if parts.is_empty() {
                return Err(NormalizationError::UnrecognizedShape(
                    "content blocks without text".into(),
                ));
            }
            Ok(normalize_text(&parts.join("\n")))
        }
        Value::Null => Err(NormalizationError::Empty),
        other => Err(NormalizationError::UnrecognizedShape(format!(
            "content is a {}",
            json_kind(other)
        ))),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

const TERMINATORS: [&str; 3] = [" additional_kwargs=", " response_metadata=", " id="];

/// Extract the quoted `content` segment of a debug representation.
///
/// Recognised only when the string starts with `content=` or carries both a
/// `content=` segment and an `additional_kwargs=` marker, so ordinary prose
/// mentioning "content=" is left alone.
fn unwrap_debug_repr(s: &str) -> Option<String> {
    let trimmed = s.trim();
    let (start, quote) = ["content='", "content=\""]
        .into_iter()
        .filter_map(|marker| trimmed.find(marker).map(|i| (i + marker.len(), &marker[8..])))
        .min_by_key(|(i, _)| *i)?;

    let opens_with_marker = trimmed.starts_with("content=");
    if !opens_with_marker && !trimmed.contains("additional_kwargs=") {
        return None;
    }

    let rest = &trimmed[start..];
    let end = TERMINATORS
        .iter()
        .filter_map(|t| {
            rest.match_indices(&format!("{quote}{t}"))
                .map(|(i, _)| i)
                .find(|&i| !is_escaped(rest, i))
        })
        .min()
        .unwrap_or_else(|| {
            if rest.ends_with(quote) {
                rest.len() - quote.len()
            } else {
                rest.len()
            }
        });

    Some(unescape(&rest[..end]).trim().to_string())
}

/// Whether the byte at `i` follows an odd run of backslashes.
fn is_escaped(s: &str, i: usize) -> bool {
    s.as_bytes()[..i]
        .iter()
        .rev()
        .take_while(|&&b| b == b'\\')
        .count()
        % 2
        == 1
}

/// Undo the escaping a debug representation applies to its string.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => {}
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
