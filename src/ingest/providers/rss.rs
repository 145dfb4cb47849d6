// src/ingest/providers/rss.rs
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::ingest::types::{FetchedItem, SourceProvider};
use crate::error::PipelineError;
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    let odt = OffsetDateTime::parse(ts.trim(), &Rfc2822).ok()?;
    DateTime::<Utc>::from_timestamp(odt.unix_timestamp(), odt.nanosecond())
}

/// RSS 2.0 feed, either fetched over HTTP or parsed from an in-memory fixture.
pub struct RssProvider {
    name: String,
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http {
        url: String,
        client: reqwest::Client,
        retry: RetryPolicy,
    },
}

impl RssProvider {
    pub fn from_fixture(name: &str, content: &str) -> Self {
        Self {
            name: name.to_string(),
            mode: Mode::Fixture(content.to_string()),
        }
    }

    /// Each fetch runs under `retry`, like every other external call.
    pub fn from_url(name: &str, url: &str, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("issue-pipeline/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .context("building rss http client")?;
        Ok(Self {
            name: name.to_string(),
            mode: Mode::Http {
                url: url.to_string(),
                client,
                retry,
            },
        })
    }

    fn parse_items_from_str(&self, s: &str) -> Result<Vec<FetchedItem>> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(s);
        let rss: Rss = from_str(&xml_clean)
            .with_context(|| format!("parsing rss xml from {}", self.name))?;

        let out: Vec<FetchedItem> = rss
            .channel
            .item
            .into_iter()
            .map(|it| FetchedItem {
                title: it.title,
                url: it.link,
                source: self.name.clone(),
                published_at: it.pub_date.as_deref().and_then(parse_rfc2822),
            })
            .collect();

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("ingest_parse_ms").record(ms);
        Ok(out)
    }
}

#[async_trait]
impl SourceProvider for RssProvider {
    async fn fetch_latest(&self) -> Result<Vec<FetchedItem>> {
        match &self.mode {
            Mode::Fixture(s) => self.parse_items_from_str(s),
            Mode::Http { url, client, retry } => {
                let body = retry
                    .run("rss.fetch", || {
                        let (client, url) = (client, url);
                        async move {
                            let resp = client.get(url).send().await?.error_for_status()?;
                            Ok::<_, PipelineError>(resp.text().await?)
                        }
                    })
                    .await
                    .with_context(|| format!("{} http get", self.name))?;
                self.parse_items_from_str(&body).inspect_err(|_| {
                    counter!("ingest_provider_errors_total", "kind" => "parse").increment(1);
                })
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// XML only knows five named entities; feeds routinely ship HTML ones.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&mdash;", "\u{2014}")
        .replace("&ndash;", "\u{2013}")
        .replace("&hellip;", "\u{2026}")
        .replace("&rsquo;", "\u{2019}")
        .replace("&lsquo;", "\u{2018}")
        .replace("&rdquo;", "\u{201D}")
        .replace("&ldquo;", "\u{201C}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const FIXTURE: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Wire</title>
<item><title>Chipmaker beats estimates&nbsp;again</title><link>https://wire.test/a?utm_source=rss</link><pubDate>Fri, 16 Oct 2026 08:30:00 +0000</pubDate></item>
<item><title>No date here</title><link>https://wire.test/b</link></item>
</channel></rss>"#;

    #[tokio::test]
    async fn parses_fixture_items() {
        let p = RssProvider::from_fixture("Wire", FIXTURE);
        let items = p.fetch_latest().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].source, "Wire");
        assert_eq!(
            items[0].published_at.unwrap().to_rfc3339(),
            "2026-10-16T08:30:00+00:00"
        );
        assert!(items[1].published_at.is_none());
        assert_eq!(p.name(), "Wire");
    }

    #[tokio::test]
    async fn broken_xml_is_an_error() {
        let p = RssProvider::from_fixture("Broken", "<rss><channel><item>");
        assert!(p.fetch_latest().await.is_err());
    }

    /// Answers 503 to the first request and the feed to every later one.
    async fn flaky_feed() -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { break };
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let resp = if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_string()
                } else {
                    format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/rss+xml\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        FIXTURE.len(),
                        FIXTURE
                    )
                };
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        (format!("http://{addr}/feed.xml"), hits)
    }

    #[tokio::test]
    async fn http_fetch_retries_a_busy_feed() {
        let (url, hits) = flaky_feed().await;
        let retry = RetryPolicy::default().with_base_delay(Duration::from_millis(1));
        let p = RssProvider::from_url("Wire", &url, retry).unwrap();

        let items = p.fetch_latest().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn http_fetch_gives_up_after_the_attempt_budget() {
        let (url, hits) = flaky_feed().await;
        let p = RssProvider::from_url("Wire", &url, RetryPolicy::once(Duration::from_secs(5))).unwrap();

        assert!(p.fetch_latest().await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
