//! Provider families and the two request-formatting functions each one owns.
//!
//! Backends disagree on where the system instruction goes and how an image is
//! attached. Each [`ProviderKind`] answers exactly two questions: how to lay
//! out an extraction request and how to lay out a synthesis request. Response
//! unwrapping, error handling and the tool loop are shared.
//!
//! The kind is resolved once from a spec string when the config is built and
//! never re-inspected per call.

use crate::error::PharmDeckError;
use crate::output::PageImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of request layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    /// No system role: instructions are folded into the user turn ahead of
    /// the inline image.
    GoogleStyle,
    /// Separate system field; the image block carries no detail hint.
    AnthropicStyle,
    /// Role-tagged message array with a high-detail image part.
    OpenAiStyle,
}

/// Who a prompt turn speaks as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    System,
    User,
}

/// One backend-neutral message of a formatted request.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTurn {
    pub role: TurnRole,
    pub text: String,
    pub image: Option<PageImage>,
    /// Image detail hint, only meaningful when `image` is set.
    pub detail: Option<&'static str>,
}

impl PromptTurn {
    fn system(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::System,
            text: text.into(),
            image: None,
            detail: None,
        }
    }

    fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
            image: None,
            detail: None,
        }
    }

    fn with_image(mut self, image: &PageImage, detail: Option<&'static str>) -> Self {
        self.image = Some(image.clone());
        self.detail = detail;
        self
    }
}

impl ProviderKind {
    /// Lay out an extraction request for one page.
    pub fn extraction_turns(self, system: &str, user: &str, image: &PageImage) -> Vec<PromptTurn> {
        match self {
            ProviderKind::GoogleStyle => {
                vec![PromptTurn::user(fold(system, user)).with_image(image, None)]
            }
            ProviderKind::AnthropicStyle => vec![
                PromptTurn::system(system),
                PromptTurn::user(user).with_image(image, None),
            ],
            ProviderKind::OpenAiStyle => vec![
                PromptTurn::system(system),
                PromptTurn::user(user).with_image(image, Some("high")),
            ],
        }
    }

    /// Lay out a text-only synthesis request.
    pub fn synthesis_turns(self, system: &str, prompt: &str) -> Vec<PromptTurn> {
        match self {
            ProviderKind::GoogleStyle => vec![PromptTurn::user(fold(system, prompt))],
            ProviderKind::AnthropicStyle | ProviderKind::OpenAiStyle => {
                vec![PromptTurn::system(system), PromptTurn::user(prompt)]
            }
        }
    }

    /// Infer the family from a factory name (`openai`, `anthropic`, …).
    fn from_factory(name: &str) -> Self {
        match name {
            "gemini" | "google" | "vertex" | "vertexai" => ProviderKind::GoogleStyle,
            "anthropic" | "claude" => ProviderKind::AnthropicStyle,
            _ => ProviderKind::OpenAiStyle,
        }
    }
}

fn fold(system: &str, user: &str) -> String {
    if system.is_empty() {
        user.to_string()
    } else {
        format!("{system}\n\n{user}")
    }
}

/// A parsed `provider:model` spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub kind: ProviderKind,
    /// Name understood by `edgequake_llm::ProviderFactory`.
    pub factory: String,
    pub model: String,
}

impl ProviderSpec {
    /// Stable identifier used to label candidates and logs.
    pub fn id(&self) -> String {
        format!("{}:{}", self.factory, self.model)
    }
}

impl fmt::Display for ProviderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.factory, self.model)
    }
}

impl FromStr for ProviderSpec {
    type Err = PharmDeckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PharmDeckError::InvalidConfig(
                "provider spec must not be empty".into(),
            ));
        }

        if let Some((provider, model)) = s.split_once(':') {
            let provider = provider.trim().to_ascii_lowercase();
            let model = model.trim();
            if provider.is_empty() || model.is_empty() {
                return Err(PharmDeckError::InvalidConfig(format!(
                    "provider spec '{s}' must look like provider:model"
                )));
            }
            let factory = match provider.as_str() {
                "google" => "gemini".to_string(),
                "claude" => "anthropic".to_string(),
                other => other.to_string(),
            };
            return Ok(Self {
                kind: ProviderKind::from_factory(&factory),
                factory,
                model: model.to_string(),
            });
        }

        let lower = s.to_ascii_lowercase();
        let factory = if lower.starts_with("gemini") {
            "gemini"
        } else if lower.starts_with("claude") {
            "anthropic"
        } else if lower.starts_with("gpt")
            || lower.starts_with("chatgpt")
            || is_openai_reasoning_model(&lower)
        {
            "openai"
        } else {
            return Err(PharmDeckError::InvalidConfig(format!(
                "cannot infer a provider for model '{s}'; use provider:model"
            )));
        };

        Ok(Self {
            kind: ProviderKind::from_factory(factory),
            factory: factory.to_string(),
            model: s.to_string(),
        })
    }
}

/// `o1`, `o3-mini`, `o4-mini`, …
fn is_openai_reasoning_model(model: &str) -> bool {
    let mut chars = model.chars();
    chars.next() == Some('o') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_specs_map_to_kinds() {
        let g: ProviderSpec = "gemini:gemini-2.0-flash".parse().unwrap();
        let a: ProviderSpec = "claude:claude-3-5-sonnet".parse().unwrap();
        let o: ProviderSpec = "ollama:llava".parse().unwrap();
        assert_eq!(g.kind, ProviderKind::GoogleStyle);
        assert_eq!(a.kind, ProviderKind::AnthropicStyle);
        assert_eq!(a.factory, "anthropic");
        assert_eq!(o.kind, ProviderKind::OpenAiStyle);
        assert_eq!(o.id(), "ollama:llava");
    }

    #[test]
    fn bare_models_are_inferred() {
        let spec: ProviderSpec = "o4-mini".parse().unwrap();
        assert_eq!(spec.factory, "openai");
        let spec: ProviderSpec = "gemini-1.5-pro".parse().unwrap();
        assert_eq!(spec.id(), "gemini:gemini-1.5-pro");
        assert!("mystery-model".parse::<ProviderSpec>().is_err());
        assert!("openai:".parse::<ProviderSpec>().is_err());
    }

    #[test]
    fn google_folds_system_prompt_into_user_turn() {
        let img = PageImage::png("AAAA");
        let turns = ProviderKind::GoogleStyle.extraction_turns("SYS", "USER", &img);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, TurnRole::User);
        assert!(turns[0].text.starts_with("SYS\n\nUSER"));
        assert!(turns[0].image.is_some());
    }

    #[test]
    fn openai_requests_high_detail_images() {
        let img = PageImage::png("AAAA");
        let turns = ProviderKind::OpenAiStyle.extraction_turns("SYS", "USER", &img);
        assert_eq!(turns[0].role, TurnRole::System);
        assert_eq!(turns[1].detail, Some("high"));
        let anthropic = ProviderKind::AnthropicStyle.extraction_turns("SYS", "USER", &img);
        assert_eq!(anthropic[1].detail, None);
    }

    #[test]
    fn synthesis_turns_carry_no_image() {
        for kind in [
            ProviderKind::GoogleStyle,
            ProviderKind::AnthropicStyle,
            ProviderKind::OpenAiStyle,
        ] {
            assert!(kind
                .synthesis_turns("SYS", "merge these")
                .iter()
                .all(|t| t.image.is_none()));
        }
    }
}
