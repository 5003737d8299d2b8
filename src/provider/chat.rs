//! Chat-backed extraction provider with the tool-augmented reasoning loop.
//!
//! ## Message layout
//!
//! Each call sends the turns produced by the provider's [`ProviderKind`]:
//! the system prompt (plus the tool protocol when tools are on offer) and one
//! user turn carrying the slide image. Tool calls and observations from
//! earlier steps are replayed inside the user turn, so every call is a
//! self-contained request and no backend needs native tool support.
//!
//! ## Bounds
//!
//! * Every backend call is wrapped in `tokio::time::timeout`.
//! * The loop makes at most `max_tool_steps` calls. A model still asking for
//!   tools after that is a provider failure for the page, nothing more.
//!
//! There is no retry here: a failed call makes the provider unavailable for
//! that page and the fan-out engine carries on with the others.

use super::kind::{PromptTurn, ProviderKind, TurnRole};
use super::normalize::{normalize_response, RawResponse, TranscriptEntry};
use super::{ExtractionProvider, ExtractionRequest, ProviderSpec};
use crate::error::ProviderError;
use crate::output::ExtractionRecord;
use crate::prompts;
use crate::tools::{parse_tool_call, ToolBox};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One request/response exchange with a model.
///
/// The seam between the reasoning loop and the network: production code uses
/// [`LlmBackend`], tests script replies.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, turns: &[PromptTurn]) -> Result<String, ProviderError>;
}

/// [`ChatBackend`] over an `edgequake_llm` provider.
pub struct LlmBackend {
    id: String,
    llm: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
    timeout: Duration,
}

impl LlmBackend {
    pub fn new(
        id: impl Into<String>,
        llm: Arc<dyn LLMProvider>,
        temperature: f32,
        max_tokens: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            llm,
            temperature,
            max_tokens,
            timeout,
        }
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

/// Convert backend-neutral turns into `edgequake_llm` messages.
fn to_chat_messages(turns: &[PromptTurn]) -> Vec<ChatMessage> {
    turns
        .iter()
        .map(|turn| match (turn.role, &turn.image) {
            (TurnRole::System, _) => ChatMessage::system(turn.text.as_str()),
            (TurnRole::User, Some(image)) => {
                let mut data = ImageData::new(image.data.clone(), image.mime_type.as_str());
                if let Some(detail) = turn.detail {
                    data = data.with_detail(detail);
                }
                ChatMessage::user_with_images(turn.text.as_str(), vec![data])
            }
            (TurnRole::User, None) => ChatMessage::user_with_images(turn.text.as_str(), Vec::new()),
        })
        .collect()
}

#[async_trait]
impl ChatBackend for LlmBackend {
    async fn complete(&self, turns: &[PromptTurn]) -> Result<String, ProviderError> {
        let messages = to_chat_messages(turns);
        let options = self.options();
        let start = Instant::now();

        match tokio::time::timeout(self.timeout, self.llm.chat(&messages, Some(&options))).await {
            Err(_) => Err(ProviderError::Timeout {
                provider: self.id.clone(),
                secs: self.timeout.as_secs(),
            }),
            Ok(Err(e)) => Err(ProviderError::Backend {
                provider: self.id.clone(),
                detail: e.to_string(),
            }),
            Ok(Ok(response)) => {
                debug!(
                    "{}: {} input tokens, {} output tokens, {:?}",
                    self.id,
                    response.prompt_tokens,
                    response.completion_tokens,
                    start.elapsed()
                );
                Ok(response.content)
            }
        }
    }
}

/// Extraction provider built from a kind and a chat backend.
pub struct ChatProvider {
    id: String,
    kind: ProviderKind,
    backend: Arc<dyn ChatBackend>,
    max_tool_steps: usize,
}

impl ChatProvider {
    pub fn new(
        id: impl Into<String>,
        kind: ProviderKind,
        backend: Arc<dyn ChatBackend>,
        max_tool_steps: usize,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            backend,
            max_tool_steps: max_tool_steps.max(1),
        }
    }

    /// Provider for a parsed spec, backed by `edgequake_llm`.
    pub fn from_spec(
        spec: &ProviderSpec,
        llm: Arc<dyn LLMProvider>,
        temperature: f32,
        max_tokens: usize,
        timeout: Duration,
        max_tool_steps: usize,
    ) -> Self {
        let id = spec.id();
        let backend = LlmBackend::new(id.clone(), llm, temperature, max_tokens, timeout);
        Self::new(id, spec.kind, Arc::new(backend), max_tool_steps)
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn normalize(&self, raw: RawResponse) -> Result<String, ProviderError> {
        normalize_response(raw).map_err(|source| ProviderError::Normalization {
            provider: self.id.clone(),
            source,
        })
    }
}

#[async_trait]
impl ExtractionProvider for ChatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn extract(
        &self,
        request: &ExtractionRequest<'_>,
        tools: &ToolBox<'_>,
    ) -> Result<String, ProviderError> {
        let system = if tools.is_empty() {
            request.system_prompt.to_string()
        } else {
            format!(
                "{}\n\n{}",
                request.system_prompt,
                prompts::tool_protocol(&tools.describe())
            )
        };

        let mut transcript: Vec<TranscriptEntry> = Vec::new();
        for step in 1..=self.max_tool_steps {
            let user = prompts::with_scratchpad(request.user_prompt, &transcript);
            let turns = self
                .kind
                .extraction_turns(&system, &user, &request.page.image);
            let reply = self.backend.complete(&turns).await?;

            let call = parse_tool_call(&reply);
            transcript.push(TranscriptEntry::assistant(reply));
            match call {
                None => {
                    debug!(
                        "{}: page {} answered after {} step(s)",
                        self.id, request.page.page_number, step
                    );
                    return self.normalize(RawResponse::Messages(transcript));
                }
                Some(call) => {
                    let observation = tools.invoke(call).await;
                    transcript.push(TranscriptEntry::tool(observation));
                }
            }
        }

        warn!(
            "{}: page {} still calling tools after {} steps",
            self.id, request.page.page_number, self.max_tool_steps
        );
        Err(ProviderError::ToolLoopExhausted {
            provider: self.id.clone(),
            steps: self.max_tool_steps,
        })
    }

    async fn synthesize(
        &self,
        candidates: &[ExtractionRecord],
        prompt: &str,
    ) -> Result<String, ProviderError> {
        debug!("{}: synthesising {} candidates", self.id, candidates.len());
        let turns = self
            .kind
            .synthesis_turns(prompts::AGGREGATION_SYSTEM_PROMPT, prompt);
        let reply = self.backend.complete(&turns).await?;
        self.normalize(RawResponse::Text(reply))
    }
}
