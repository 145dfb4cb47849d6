// src/enrich/fetch.rs
use std::time::Duration;

use async_trait::async_trait;

use super::text::html_to_text;
use crate::error::{PipelineError, Result};

/// Raw text of the page a story links to.
#[async_trait]
pub trait SourceTextFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

pub struct HttpTextFetcher {
    http: reqwest::Client,
    /// Bytes kept from the body before flattening.
    max_body: usize,
}

impl HttpTextFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("issue-pipeline/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("fetch http client: {e}")))?;
        Ok(Self {
            http,
            max_body: 512 * 1024,
        })
    }
}

#[async_trait]
impl SourceTextFetcher for HttpTextFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let parsed = url::Url::parse(url)
            .map_err(|e| PipelineError::InvalidInput(format!("source url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(PipelineError::InvalidInput(format!("unsupported scheme in {url}")));
        }

        let resp = self.http.get(parsed).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let msg = format!("GET {url} returned {status}");
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                PipelineError::Transient(msg)
            } else {
                PipelineError::Fatal(msg)
            });
        }
        let body = resp.text().await?;
        let mut cut = body.len().min(self.max_body);
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        let text = html_to_text(&body[..cut]);
        if text.is_empty() {
            return Err(PipelineError::Malformed(format!("{url} has no text")));
        }
        Ok(text)
    }
}

/// Fixed pages keyed by URL, for tests and offline runs.
#[derive(Debug, Default, Clone)]
pub struct StaticFetcher {
    pages: std::collections::HashMap<String, String>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, text: &str) -> Self {
        self.pages.insert(url.to_string(), text.to_string());
        self
    }
}

#[async_trait]
impl SourceTextFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("no page for {url}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let f = HttpTextFetcher::new(Duration::from_secs(1)).unwrap();
        let err = f.fetch("ftp://example.com/a").await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        assert!(f.fetch("not a url").await.is_err());
    }

    #[tokio::test]
    async fn static_pages_are_served() {
        let f = StaticFetcher::new().page("https://a.test/x", "body");
        assert_eq!(f.fetch("https://a.test/x").await.unwrap(), "body");
        assert!(f.fetch("https://a.test/y").await.is_err());
    }
}
