// src/ai/mod.rs
//! Generative service contract: provider traits, prompt templates and strict
//! JSON decoding of responses.
//!
//! Providers return raw text. Callers that need structure go through
//! [`generate_json`], which validates the shape right after the call and turns
//! anything off-schema into [`PipelineError::Malformed`].

pub mod openai;
pub mod scripted;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use regex::Regex;
use serde::de::DeserializeOwned;

use crate::error::{PipelineError, Result};
use crate::retry::RetryPolicy;

pub use openai::OpenAiProvider;
pub use scripted::ScriptedClient;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Text completion provider.
pub trait TextGenerator: Send + Sync {
    fn complete<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String>>;
    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;
}

/// Image provider. Resolves to a URL of the generated image.
pub trait ImageGenerator: Send + Sync {
    fn create<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String>>;
    fn provider_name(&self) -> &'static str;
}

pub type DynText = Arc<dyn TextGenerator>;
pub type DynImage = Arc<dyn ImageGenerator>;

/// Post-decode schema checks for generated JSON.
pub trait Validate {
    fn validate(&self) -> std::result::Result<(), String>;
}

/// Always fails; used when no generative provider is configured.
pub struct DisabledClient;

impl TextGenerator for DisabledClient {
    fn complete<'a>(&'a self, _prompt: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async {
            Err(PipelineError::Fatal(
                "generative service is disabled".into(),
            ))
        })
    }
    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

impl ImageGenerator for DisabledClient {
    fn create<'a>(&'a self, _prompt: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async {
            Err(PipelineError::Fatal(
                "image generation is disabled".into(),
            ))
        })
    }
    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

// ------------------------------------------------------------
// Prompt templates
// ------------------------------------------------------------

/// Prompt text with `{{name}}` placeholders.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub name: &'static str,
    text: String,
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("static regex"))
}

impl PromptTemplate {
    pub fn new(name: &'static str, text: impl Into<String>) -> Self {
        Self {
            name,
            text: text.into(),
        }
    }

    /// Substitute every placeholder. A placeholder with no value is an error,
    /// never left in the prompt.
    pub fn render(&self, vars: &[(&str, &str)]) -> Result<String> {
        let mut missing: Vec<String> = Vec::new();
        let out = placeholder_re().replace_all(&self.text, |caps: &regex::Captures| {
            let key = &caps[1];
            match vars.iter().find(|(k, _)| *k == key) {
                Some((_, v)) => (*v).to_string(),
                None => {
                    missing.push(key.to_string());
                    String::new()
                }
            }
        });
        if !missing.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "template '{}' is missing variables: {}",
                self.name,
                missing.join(", ")
            )));
        }
        Ok(out.into_owned())
    }
}

// ------------------------------------------------------------
// Structured generation
// ------------------------------------------------------------

/// Complete `prompt` and decode a validated `T` from the reply.
///
/// Transport errors are retried by `retry`; a reply that is not JSON, misses
/// keys or fails [`Validate`] is `Malformed` and not retried.
pub async fn generate_json<T>(
    gen: &dyn TextGenerator,
    retry: &RetryPolicy,
    op: &str,
    prompt: &str,
) -> Result<T>
where
    T: DeserializeOwned + Validate,
{
    let raw = retry.run(op, || gen.complete(prompt)).await?;
    decode_json(&raw)
}

/// Decode a model reply, tolerating markdown fences and chatter around the
/// outermost JSON object.
pub fn decode_json<T>(raw: &str) -> Result<T>
where
    T: DeserializeOwned + Validate,
{
    let body = extract_json_object(raw)
        .ok_or_else(|| PipelineError::Malformed(format!("no JSON object in reply: {}", preview(raw))))?;
    let value: T = serde_json::from_str(body)
        .map_err(|e| PipelineError::Malformed(format!("reply does not match schema: {e}")))?;
    value
        .validate()
        .map_err(|why| PipelineError::Malformed(format!("reply failed validation: {why}")))?;
    Ok(value)
}

fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn preview(raw: &str) -> String {
    sanitize_line(raw, 80)
}

/// Single line, printable, at most `max` chars. Collapses whitespace.
pub fn sanitize_line(input: &str, max: usize) -> String {
    let mut out = String::with_capacity(max.min(input.len()));
    let mut prev_space = false;
    let mut count = 0usize;
    for ch in input.chars() {
        let c = if ch.is_control() || ch.is_whitespace() {
            ' '
        } else {
            ch
        };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
                count += 1;
            }
            prev_space = true;
        } else {
            out.push(c);
            count += 1;
            prev_space = false;
        }
        if count >= max {
            break;
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Verdict {
        eligible: bool,
        reasoning: String,
    }

    impl Validate for Verdict {
        fn validate(&self) -> std::result::Result<(), String> {
            if self.reasoning.trim().is_empty() {
                return Err("empty reasoning".into());
            }
            Ok(())
        }
    }

    #[test]
    fn template_substitutes_and_rejects_missing() {
        let t = PromptTemplate::new("t", "Slot {{slot}}: {{ headline }}");
        assert_eq!(
            t.render(&[("slot", "2"), ("headline", "Acme buys Beta")]).unwrap(),
            "Slot 2: Acme buys Beta"
        );
        let err = t.render(&[("slot", "2")]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("headline"));
    }

    #[test]
    fn decode_tolerates_fences_but_not_bad_shapes() {
        let ok: Verdict =
            decode_json("```json\n{\"eligible\": true, \"reasoning\": \"fits\"}\n```").unwrap();
        assert!(ok.eligible);

        let missing = decode_json::<Verdict>(r#"{"eligible": true}"#).unwrap_err();
        assert_eq!(missing.kind(), crate::error::ErrorKind::Malformed);

        let prose = decode_json::<Verdict>("I think yes").unwrap_err();
        assert_eq!(prose.kind(), crate::error::ErrorKind::Malformed);

        let invalid = decode_json::<Verdict>(r#"{"eligible": false, "reasoning": " "}"#).unwrap_err();
        assert!(invalid.to_string().contains("validation"));
    }

    #[test]
    fn sanitize_collapses_and_caps() {
        assert_eq!(sanitize_line("  a\n\tb   c ", 160), "a b c");
        assert_eq!(sanitize_line("abcdef", 3), "abc");
    }

    #[tokio::test]
    async fn disabled_client_fails_fatally() {
        let err = generate_json::<Verdict>(&DisabledClient, &RetryPolicy::default(), "t", "p")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
    }
}
