// src/ai/scripted.rs
//! Deterministic provider for tests and offline runs.
//!
//! Replies are routed by substring: the first rule whose needle occurs in the
//! prompt answers it. Every prompt is recorded.

use std::sync::Mutex;

use super::{BoxFuture, ImageGenerator, TextGenerator};
use crate::error::{PipelineError, Result};

type Reply = Box<dyn Fn(&str) -> Result<String> + Send + Sync>;

#[derive(Default)]
pub struct ScriptedClient {
    rules: Vec<(String, Reply)>,
    image: Option<Reply>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer prompts containing `needle` with `reply(prompt)`.
    pub fn when<F>(mut self, needle: &str, reply: F) -> Self
    where
        F: Fn(&str) -> Result<String> + Send + Sync + 'static,
    {
        self.rules.push((needle.to_string(), Box::new(reply)));
        self
    }

    /// Fixed reply for prompts containing `needle`.
    pub fn reply(self, needle: &str, text: impl Into<String>) -> Self {
        let text = text.into();
        self.when(needle, move |_| Ok(text.clone()))
    }

    pub fn images<F>(mut self, reply: F) -> Self
    where
        F: Fn(&str) -> Result<String> + Send + Sync + 'static,
    {
        self.image = Some(Box::new(reply));
        self
    }

    /// Prompts received so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }

    fn answer(&self, prompt: &str) -> Result<String> {
        if let Ok(mut c) = self.calls.lock() {
            c.push(prompt.to_string());
        }
        self.rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply(prompt))
            .unwrap_or_else(|| {
                Err(PipelineError::Malformed(format!(
                    "no scripted reply for prompt: {}",
                    super::sanitize_line(prompt, 60)
                )))
            })
    }
}

impl TextGenerator for ScriptedClient {
    fn complete<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String>> {
        let out = self.answer(prompt);
        Box::pin(async move { out })
    }
    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}

impl ImageGenerator for ScriptedClient {
    fn create<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String>> {
        if let Ok(mut c) = self.calls.lock() {
            c.push(format!("image: {prompt}"));
        }
        let out = match &self.image {
            Some(reply) => reply(prompt),
            None => Err(PipelineError::Fatal("no scripted image reply".into())),
        };
        Box::pin(async move { out })
    }
    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}
