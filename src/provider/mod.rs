//! Extraction provider abstraction.
//!
//! The orchestrator and the fan-out engine only ever see
//! [`ExtractionProvider`]: `extract(page, prompts, tools) → text` and
//! `synthesize(candidates, prompt) → text`. Backend differences live in
//! three places only:
//!
//! * [`kind`]: how each family lays out a request,
//! * [`normalize`]: how any answer shape becomes clean text,
//! * [`chat`]: the shared call, timeout and tool loop.
//!
//! [`ProviderSet`] resolves the configured active set and aggregator once at
//! startup.

pub mod chat;
pub mod kind;
pub mod normalize;

pub use chat::{ChatBackend, ChatProvider, LlmBackend};
pub use kind::{PromptTurn, ProviderKind, ProviderSpec, TurnRole};
pub use normalize::{
    normalize_response, normalize_text, RawResponse, TranscriptEntry, TranscriptRole,
};

use crate::config::PipelineConfig;
use crate::error::{PharmDeckError, ProviderError};
use crate::output::{ExtractionRecord, Page};
use crate::tools::ToolBox;
use async_trait::async_trait;
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Everything a provider needs to extract one page.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    pub page: &'a Page,
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
}

/// A pluggable backend that turns a page image and a prompt into text.
///
/// Implementations must return provider-normalized text: no wrapper syntax,
/// never empty. A returned error makes the provider unavailable for that
/// page only.
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    /// Stable identifier used to label candidates, e.g. `openai:gpt-4.1`.
    fn id(&self) -> &str;

    async fn extract(
        &self,
        request: &ExtractionRequest<'_>,
        tools: &ToolBox<'_>,
    ) -> Result<String, ProviderError>;

    /// Merge candidates. `prompt` already presents every candidate labelled
    /// by provider id; `candidates` is passed for providers that want the
    /// structured form.
    async fn synthesize(
        &self,
        candidates: &[ExtractionRecord],
        prompt: &str,
    ) -> Result<String, ProviderError>;
}

/// The active set, in fan-out order, plus the aggregator.
#[derive(Clone)]
pub struct ProviderSet {
    active: Vec<Arc<dyn ExtractionProvider>>,
    aggregator: Arc<dyn ExtractionProvider>,
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("active", &self.active_ids())
            .field("aggregator", &self.aggregator.id())
            .finish()
    }
}

impl ProviderSet {
    /// Ids must be unique so candidates stay distinguishable.
    pub fn new(
        active: Vec<Arc<dyn ExtractionProvider>>,
        aggregator: Arc<dyn ExtractionProvider>,
    ) -> Result<Self, PharmDeckError> {
        if active.is_empty() {
            return Err(PharmDeckError::InvalidConfig(
                "at least one extraction provider is required".into(),
            ));
        }
        let mut seen = HashSet::new();
        for p in &active {
            if !seen.insert(p.id().to_string()) {
                return Err(PharmDeckError::InvalidConfig(format!(
                    "provider '{}' appears twice in the active set",
                    p.id()
                )));
            }
        }
        Ok(Self { active, aggregator })
    }

    pub fn active(&self) -> &[Arc<dyn ExtractionProvider>] {
        &self.active
    }

    pub fn aggregator(&self) -> &Arc<dyn ExtractionProvider> {
        &self.aggregator
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.iter().map(|p| p.id().to_string()).collect()
    }

    /// Resolve providers from the config, most specific first:
    ///
    /// 1. injected providers, then spec strings, in that order;
    /// 2. with neither, one provider auto-detected from the environment.
    ///
    /// The aggregator is the injected one, else the aggregator spec (reusing
    /// the active instance when the ids match), else the first active
    /// provider.
    pub fn resolve(config: &PipelineConfig) -> Result<Self, PharmDeckError> {
        let mut active: Vec<Arc<dyn ExtractionProvider>> = config.custom_providers.clone();
        for spec in &config.providers {
            active.push(build_provider(spec, config)?);
        }
        if active.is_empty() {
            active.push(auto_detect(config)?);
        }

        let aggregator = if let Some(ref agg) = config.custom_aggregator {
            Arc::clone(agg)
        } else if let Some(ref spec) = config.aggregator {
            let id = spec.id();
            match active.iter().find(|p| p.id() == id) {
                Some(existing) => Arc::clone(existing),
                None => build_provider(spec, config)?,
            }
        } else {
            Arc::clone(&active[0])
        };

        let set = Self::new(active, aggregator)?;
        info!(
            "Providers: [{}], aggregator: {}",
            set.active_ids().join(", "),
            set.aggregator.id()
        );
        Ok(set)
    }
}

fn build_provider(
    spec: &ProviderSpec,
    config: &PipelineConfig,
) -> Result<Arc<dyn ExtractionProvider>, PharmDeckError> {
    let llm = ProviderFactory::create_llm_provider(&spec.factory, &spec.model).map_err(|e| {
        PharmDeckError::ProviderNotConfigured {
            provider: spec.id(),
            hint: format!("{e}"),
        }
    })?;
    Ok(wrap(spec, llm, config))
}

fn wrap(
    spec: &ProviderSpec,
    llm: Arc<dyn LLMProvider>,
    config: &PipelineConfig,
) -> Arc<dyn ExtractionProvider> {
    Arc::new(ChatProvider::from_spec(
        spec,
        llm,
        config.temperature,
        config.max_tokens,
        Duration::from_secs(config.api_timeout_secs),
        config.max_tool_steps,
    ))
}

/// Pick one provider from the environment.
///
/// `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` win when both are set, then
/// an OpenAI key, then whatever `ProviderFactory::from_env` finds.
fn auto_detect(config: &PipelineConfig) -> Result<Arc<dyn ExtractionProvider>, PharmDeckError> {
    if let (Ok(provider), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !provider.is_empty() && !model.is_empty() {
            let spec: ProviderSpec = format!("{provider}:{model}").parse()?;
            return build_provider(&spec, config);
        }
    }

    if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
        let spec: ProviderSpec = "openai:gpt-4.1-mini".parse()?;
        return build_provider(&spec, config);
    }

    let (llm, _embedding) =
        ProviderFactory::from_env().map_err(|e| PharmDeckError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No extraction provider could be auto-detected from the environment.\n\
                 Set OPENAI_API_KEY, ANTHROPIC_API_KEY or GEMINI_API_KEY, or pass --provider.\n\
                 Error: {e}"
            ),
        })?;
    let spec = ProviderSpec {
        kind: ProviderKind::OpenAiStyle,
        factory: llm.name().to_string(),
        model: llm.model().to_string(),
    };
    Ok(wrap(&spec, llm, config))
}
