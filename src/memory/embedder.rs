//! Embedding capabilities for the memory index.
//!
//! [`OpenAiEmbedder`] talks to any OpenAI-compatible `/embeddings` endpoint.
//! [`HashingEmbedder`] is a deterministic local fallback: token feature
//! hashing into a fixed number of buckets. It has no semantic understanding
//! but ranks exact term overlap well, which is what "have we seen this drug
//! before?" lookups mostly need.

use crate::config::PipelineConfig;
use crate::error::MemoryError;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Turns text into fixed-length vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Embed a batch; the output has one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError>;

    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let mut out = self.embed(&[text.to_string()]).await?;
        match out.len() {
            1 => Ok(out.remove(0)),
            n => Err(MemoryError::ShapeMismatch {
                expected: 1,
                actual: n,
            }),
        }
    }
}

/// Pick the embedder for a run.
///
/// Order: injected embedder, local hashing when requested, OpenAI when
/// `OPENAI_API_KEY` is set, local hashing otherwise.
pub fn resolve_embedder(config: &PipelineConfig) -> Arc<dyn Embedder> {
    if let Some(ref embedder) = config.embedder {
        return Arc::clone(embedder);
    }
    if config.local_embeddings {
        info!("Using local hashing embeddings");
        return Arc::new(HashingEmbedder::default());
    }
    match std::env::var("OPENAI_API_KEY") {
        Ok(key) if !key.trim().is_empty() => {
            let base_url = std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
            match OpenAiEmbedder::new(
                &key,
                &base_url,
                &config.embedding_model,
                Duration::from_secs(config.api_timeout_secs),
            ) {
                Ok(e) => return Arc::new(e),
                Err(e) => warn!("OpenAI embedder unavailable, using local hashing: {e}"),
            }
        }
        _ => info!("OPENAI_API_KEY not set, using local hashing embeddings"),
    }
    Arc::new(HashingEmbedder::default())
}

// ── OpenAI ───────────────────────────────────────────────────────────────

/// Async client for OpenAI-compatible embedding endpoints.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, MemoryError> {
        if api_key.trim().is_empty() {
            return Err(MemoryError::Embedding("missing OpenAI API key".into()));
        }
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|_| MemoryError::Embedding("invalid OpenAI API key".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| MemoryError::Embedding(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingEntry>,
}

#[derive(Deserialize)]
struct EmbeddingEntry {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(MemoryError::Embedding(format!(
                "embeddings request failed ({status}): {body}"
            )));
        }

        let mut parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| MemoryError::Embedding(format!("bad embeddings response: {e}")))?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != texts.len() {
            return Err(MemoryError::ShapeMismatch {
                expected: texts.len(),
                actual: parsed.data.len(),
            });
        }
        debug!("Embedded {} texts with {}", texts.len(), self.model);
        Ok(parsed.data.into_iter().map(|e| e.embedding).collect())
    }
}

// ── Local hashing ────────────────────────────────────────────────────────

/// Deterministic bag-of-words embedder using FNV-1a feature hashing.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { dimensions: 256 }
    }
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }

    fn vectorise(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 1)
        {
            let h = fnv1a(&token.to_lowercase());
            let bucket = (h % self.dimensions as u64) as usize;
            // Sign bit from the high half keeps collisions from only adding up.
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.bytes() {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "local-hashing"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        Ok(texts.iter().map(|t| self.vectorise(t)).collect())
    }
}
