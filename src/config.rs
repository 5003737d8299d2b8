//! Configuration types for a deck extraction run.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Only two knobs actually shape the pipeline:
//! the active provider set and the aggregator. Everything else tunes how a
//! page is rendered, prompted, remembered and written out.
//!
//! # Why a builder
//! The config carries trait objects (providers, embedder, search, progress)
//! alongside plain values. A builder lets library callers inject exactly the
//! collaborators they care about and rely on documented defaults for the rest.

use crate::error::PharmDeckError;
use crate::memory::Embedder;
use crate::progress::ExtractionProgressCallback;
use crate::provider::{ExtractionProvider, ProviderSpec};
use crate::tools::SearchCapability;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Smallest and largest memory top-K the index accepts.
pub const MIN_TOP_K: usize = 3;
pub const MAX_TOP_K: usize = 5;

/// Configuration for one extraction run.
///
/// # Example
/// ```rust
/// use pharmdeck::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .providers(["gemini:gemini-2.0-flash", "openai:gpt-4.1"])
///     .aggregator("anthropic:claude-sonnet-4-20250514")
///     .company("Acme Pharma")
///     .build()
///     .unwrap();
/// assert_eq!(config.providers.len(), 2);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    // ── Providers ────────────────────────────────────────────────────────
    /// Active set as provider spec strings, in fan-out order.
    ///
    /// Each entry is `provider:model` (`openai:gpt-4.1`) or a bare model name
    /// whose family is inferred (`claude-sonnet-4-20250514`). When empty and
    /// no providers are injected, one provider is auto-detected from the
    /// environment.
    pub providers: Vec<ProviderSpec>,

    /// Aggregator spec. Default: the first active provider.
    pub aggregator: Option<ProviderSpec>,

    /// Pre-built providers. Take precedence over `providers` when non-empty.
    pub custom_providers: Vec<Arc<dyn ExtractionProvider>>,

    /// Pre-built aggregator. Takes precedence over `aggregator`.
    pub custom_aggregator: Option<Arc<dyn ExtractionProvider>>,

    /// Sampling temperature. Default: 0.0.
    ///
    /// Extraction is transcription plus classification; any creativity shows
    /// up as invented trial names and dosages.
    pub temperature: f32,

    /// Maximum tokens per model call. Default: 4096.
    pub max_tokens: usize,

    /// Per-call timeout in seconds. Default: 120.
    ///
    /// The only bound on a hung backend. A timed-out call is a provider
    /// failure for that page, nothing more.
    pub api_timeout_secs: u64,

    /// Maximum model calls in one tool-augmented extraction. Default: 25.
    pub max_tool_steps: usize,

    /// Offer tools (memory lookup, search, schema) to providers. Default: true.
    pub enable_tools: bool,

    // ── Memory ───────────────────────────────────────────────────────────
    /// Pre-built embedder. Takes precedence over `embedding_model`.
    pub embedder: Option<Arc<dyn Embedder>>,

    /// OpenAI embedding model. Default: `text-embedding-3-small`.
    pub embedding_model: String,

    /// Use the local hashing embedder even when an API key is present.
    pub local_embeddings: bool,

    /// Memory query result count. Range: 3–5. Default: 3.
    pub memory_top_k: usize,

    // ── Tools ────────────────────────────────────────────────────────────
    /// Pre-built search capability. Takes precedence over `tavily_api_key`.
    pub search: Option<Arc<dyn SearchCapability>>,

    /// Tavily API key. When neither this nor `search` is set, the search
    /// tool is not offered.
    pub tavily_api_key: Option<String>,

    /// Schema reference catalogue (JSON) for the `check_schema` tool.
    pub schema_path: Option<PathBuf>,

    // ── Rendering ────────────────────────────────────────────────────────
    /// Rendering DPI. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Longest rendered edge in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// PDF user password for encrypted decks.
    pub password: Option<String>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    // ── Prompt context ───────────────────────────────────────────────────
    /// Number of preceding page results quoted in each prompt. Default: 3.
    pub context_window: usize,

    pub company: Option<String>,
    pub event: Option<String>,
    pub date: Option<String>,

    // ── Output ───────────────────────────────────────────────────────────
    /// Export and checkpoint directory. `None` keeps the export in memory.
    /// Default: `output`.
    pub output_dir: Option<PathBuf>,

    /// Write a checkpoint after every page. Default: true.
    pub checkpoint: bool,

    /// Restore a matching checkpoint before starting. Default: false.
    pub resume: bool,

    /// Hard cap on stage transitions for one run. Default: 10 000.
    pub max_stage_steps: usize,

    /// Progress events sink.
    pub progress_callback: Option<Arc<dyn ExtractionProgressCallback>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            aggregator: None,
            custom_providers: Vec::new(),
            custom_aggregator: None,
            temperature: 0.0,
            max_tokens: 4096,
            api_timeout_secs: 120,
            max_tool_steps: 25,
            enable_tools: true,
            embedder: None,
            embedding_model: "text-embedding-3-small".to_string(),
            local_embeddings: false,
            memory_top_k: MIN_TOP_K,
            search: None,
            tavily_api_key: None,
            schema_path: None,
            dpi: 150,
            max_rendered_pixels: 2000,
            password: None,
            download_timeout_secs: 120,
            context_window: 3,
            company: None,
            event: None,
            date: None,
            output_dir: Some(PathBuf::from("output")),
            checkpoint: true,
            resume: false,
            max_stage_steps: 10_000,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let custom: Vec<&str> = self.custom_providers.iter().map(|p| p.id()).collect();
        f.debug_struct("PipelineConfig")
            .field("providers", &self.providers)
            .field("aggregator", &self.aggregator)
            .field("custom_providers", &custom)
            .field(
                "custom_aggregator",
                &self.custom_aggregator.as_ref().map(|p| p.id().to_string()),
            )
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("max_tool_steps", &self.max_tool_steps)
            .field("enable_tools", &self.enable_tools)
            .field("embedding_model", &self.embedding_model)
            .field("local_embeddings", &self.local_embeddings)
            .field("memory_top_k", &self.memory_top_k)
            .field("search", &self.search.as_ref().map(|_| "<dyn SearchCapability>"))
            .field("schema_path", &self.schema_path)
            .field("dpi", &self.dpi)
            .field("context_window", &self.context_window)
            .field("output_dir", &self.output_dir)
            .field("checkpoint", &self.checkpoint)
            .field("resume", &self.resume)
            .field("max_stage_steps", &self.max_stage_steps)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
            errors: Vec::new(),
        }
    }
}

/// Builder for [`PipelineConfig`].
///
/// Spec strings are parsed as they are set; parse errors are collected and
/// reported together by [`build`](Self::build).
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
    errors: Vec<String>,
}

impl PipelineConfigBuilder {
    /// Replace the active set with the given spec strings.
    pub fn providers<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.config.providers.clear();
        for spec in specs {
            self = self.provider(spec.as_ref());
        }
        self
    }

    /// Append one provider spec to the active set.
    pub fn provider(mut self, spec: &str) -> Self {
        match spec.parse::<ProviderSpec>() {
            Ok(s) => self.config.providers.push(s),
            Err(e) => self.errors.push(e.to_string()),
        }
        self
    }

    pub fn aggregator(mut self, spec: &str) -> Self {
        match spec.parse::<ProviderSpec>() {
            Ok(s) => self.config.aggregator = Some(s),
            Err(e) => self.errors.push(e.to_string()),
        }
        self
    }

    /// Inject a pre-built provider into the active set.
    pub fn custom_provider(mut self, provider: Arc<dyn ExtractionProvider>) -> Self {
        self.config.custom_providers.push(provider);
        self
    }

    pub fn custom_aggregator(mut self, provider: Arc<dyn ExtractionProvider>) -> Self {
        self.config.custom_aggregator = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn max_tool_steps(mut self, n: usize) -> Self {
        self.config.max_tool_steps = n;
        self
    }

    pub fn enable_tools(mut self, v: bool) -> Self {
        self.config.enable_tools = v;
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.config.embedder = Some(embedder);
        self
    }

    pub fn embedding_model(mut self, model: impl Into<String>) -> Self {
        self.config.embedding_model = model.into();
        self
    }

    pub fn local_embeddings(mut self, v: bool) -> Self {
        self.config.local_embeddings = v;
        self
    }

    pub fn memory_top_k(mut self, k: usize) -> Self {
        self.config.memory_top_k = k.clamp(MIN_TOP_K, MAX_TOP_K);
        self
    }

    pub fn search(mut self, search: Arc<dyn SearchCapability>) -> Self {
        self.config.search = Some(search);
        self
    }

    pub fn tavily_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.tavily_api_key = Some(key.into());
        self
    }

    pub fn schema_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.schema_path = Some(path.into());
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn context_window(mut self, n: usize) -> Self {
        self.config.context_window = n;
        self
    }

    pub fn company(mut self, company: impl Into<String>) -> Self {
        self.config.company = Some(company.into());
        self
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.config.event = Some(event.into());
        self
    }

    pub fn date(mut self, date: impl Into<String>) -> Self {
        self.config.date = Some(date.into());
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = Some(dir.into());
        self
    }

    /// Keep the export in memory only; also disables checkpoints.
    pub fn no_output_dir(mut self) -> Self {
        self.config.output_dir = None;
        self
    }

    pub fn checkpoint(mut self, v: bool) -> Self {
        self.config.checkpoint = v;
        self
    }

    pub fn resume(mut self, v: bool) -> Self {
        self.config.resume = v;
        self
    }

    pub fn max_stage_steps(mut self, n: usize) -> Self {
        self.config.max_stage_steps = n;
        self
    }

    pub fn progress_callback(mut self, cb: Arc<dyn ExtractionProgressCallback>) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PharmDeckError> {
        if !self.errors.is_empty() {
            return Err(PharmDeckError::InvalidConfig(self.errors.join("; ")));
        }
        let c = &self.config;
        if c.max_tokens == 0 {
            return Err(PharmDeckError::InvalidConfig(
                "max_tokens must be ≥ 1".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(PharmDeckError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        if c.max_tool_steps == 0 {
            return Err(PharmDeckError::InvalidConfig(
                "max_tool_steps must be ≥ 1".into(),
            ));
        }
        if c.max_stage_steps < 4 {
            return Err(PharmDeckError::InvalidConfig(format!(
                "max_stage_steps must be ≥ 4, got {}",
                c.max_stage_steps
            )));
        }
        if c.resume && c.output_dir.is_none() {
            return Err(PharmDeckError::InvalidConfig(
                "resume requires an output directory".into(),
            ));
        }
        if c.embedding_model.trim().is_empty() {
            return Err(PharmDeckError::InvalidConfig(
                "embedding_model must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;

    #[test]
    fn defaults_are_deterministic_and_bounded() {
        let c = PipelineConfig::default();
        assert_eq!(c.temperature, 0.0);
        assert_eq!(c.memory_top_k, 3);
        assert_eq!(c.context_window, 3);
        assert_eq!(c.max_tool_steps, 25);
        assert_eq!(c.max_stage_steps, 10_000);
        assert_eq!(c.output_dir, Some(PathBuf::from("output")));
    }

    #[test]
    fn builder_parses_provider_specs_in_order() {
        let c = PipelineConfig::builder()
            .providers(["gemini-2.0-flash", "openai:gpt-4.1"])
            .aggregator("claude-sonnet-4-20250514")
            .build()
            .unwrap();
        assert_eq!(c.providers[0].kind, ProviderKind::GoogleStyle);
        assert_eq!(c.providers[1].kind, ProviderKind::OpenAiStyle);
        assert_eq!(
            c.aggregator.map(|a| a.kind),
            Some(ProviderKind::AnthropicStyle)
        );
    }

    #[test]
    fn builder_reports_bad_specs() {
        let err = PipelineConfig::builder()
            .provider("openai:")
            .build()
            .unwrap_err();
        assert!(matches!(err, PharmDeckError::InvalidConfig(_)));
    }

    #[test]
    fn top_k_is_clamped() {
        let lo = PipelineConfig::builder().memory_top_k(1).build().unwrap();
        let hi = PipelineConfig::builder().memory_top_k(50).build().unwrap();
        assert_eq!(lo.memory_top_k, MIN_TOP_K);
        assert_eq!(hi.memory_top_k, MAX_TOP_K);
    }

    #[test]
    fn resume_without_output_dir_is_rejected() {
        let err = PipelineConfig::builder()
            .no_output_dir()
            .resume(true)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("resume"));
    }
}
