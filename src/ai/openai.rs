// src/ai/openai.rs
//! OpenAI-compatible provider (chat completions + image generations).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{BoxFuture, ImageGenerator, TextGenerator};
use crate::config::AiConfig;
use crate::error::{PipelineError, Result};

pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    image_model: String,
}

impl OpenAiProvider {
    pub fn new(cfg: &AiConfig) -> Result<Self> {
        if cfg.api_key.trim().is_empty() {
            return Err(PipelineError::Config("OPENAI_API_KEY is not set".into()));
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("issue-pipeline/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("ai http client: {e}")))?;
        Ok(Self {
            http,
            api_key: cfg.api_key.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            image_model: cfg.image_model.clone(),
        })
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        let resp = self
            .http
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let msg = format!("{path} returned {status}: {}", super::sanitize_line(&text, 200));
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                PipelineError::Transient(msg)
            } else {
                PipelineError::Fatal(msg)
            });
        }
        let body = resp.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| PipelineError::Malformed(format!("{path} response: {e}")))
    }

    async fn complete_impl(&self, prompt: &str) -> Result<String> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: Option<String>,
        }

        let sys = "You are a careful newsletter editor. Follow the task instructions exactly. When asked for JSON, output only the JSON object.";
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: sys,
                },
                Msg {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.2,
        };
        let resp: Resp = self.post("chat/completions", &req).await?;
        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| PipelineError::Malformed("completion had no content".into()))
    }

    async fn create_impl(&self, prompt: &str) -> Result<String> {
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            prompt: &'a str,
            n: u8,
            size: &'a str,
        }
        #[derive(Deserialize)]
        struct Resp {
            data: Vec<Image>,
        }
        #[derive(Deserialize)]
        struct Image {
            url: Option<String>,
        }

        let req = Req {
            model: &self.image_model,
            prompt,
            n: 1,
            size: "1024x1024",
        };
        let resp: Resp = self.post("images/generations", &req).await?;
        resp.data
            .into_iter()
            .find_map(|i| i.url)
            .ok_or_else(|| PipelineError::Malformed("image response had no url".into()))
    }
}

impl TextGenerator for OpenAiProvider {
    fn complete<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.complete_impl(prompt))
    }
    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

impl ImageGenerator for OpenAiProvider {
    fn create<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.create_impl(prompt))
    }
    fn provider_name(&self) -> &'static str {
        "openai"
    }
}
