// src/config/ai.rs
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::Env;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiProviderKind {
    OpenAi,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub provider: AiProviderKind,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub image_model: String,
    pub request_timeout: Duration,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: AiProviderKind::Disabled,
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            image_model: "dall-e-3".into(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl AiConfig {
    /// `AI_PROVIDER` defaults to `openai` when `OPENAI_API_KEY` is present,
    /// otherwise `disabled`. Asking for `openai` without a key is an error.
    pub fn from_env_with<F>(get: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { get };
        let defaults = Self::default();
        let api_key = env.string("OPENAI_API_KEY").unwrap_or_default();

        let provider = match env.string("AI_PROVIDER").map(|p| p.to_lowercase()) {
            None if api_key.is_empty() => AiProviderKind::Disabled,
            None => AiProviderKind::OpenAi,
            Some(p) if p == "openai" => AiProviderKind::OpenAi,
            Some(p) if p == "disabled" || p == "none" => AiProviderKind::Disabled,
            Some(other) => {
                return Err(PipelineError::Config(format!(
                    "unsupported AI_PROVIDER '{other}'"
                )))
            }
        };
        if provider == AiProviderKind::OpenAi && api_key.is_empty() {
            return Err(PipelineError::Config(
                "AI_PROVIDER=openai needs OPENAI_API_KEY".into(),
            ));
        }

        Ok(Self {
            provider,
            api_key,
            base_url: env.string("AI_BASE_URL").unwrap_or(defaults.base_url),
            model: env.string("AI_MODEL").unwrap_or(defaults.model),
            image_model: env.string("AI_IMAGE_MODEL").unwrap_or(defaults.image_model),
            request_timeout: Duration::from_secs(env.parse("AI_TIMEOUT_SECS", 60)?),
        })
    }
}
