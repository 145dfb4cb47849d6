// src/config/mod.rs
//! Runtime configuration from environment variables (`.env` honoured).
//!
//! Everything has a default except credentials; a value that is present but
//! unparseable is a configuration error, never silently replaced.

pub mod ai;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::jobs::ExecutorConfig;
use crate::retry::RetryPolicy;

pub use ai::AiConfig;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub token: String,
    pub request_timeout: Duration,
    /// Only for local test stores; production requires TLS.
    pub allow_insecure: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryConfig {
    Disabled,
    Http { url: String, token: String },
    Smtp(SmtpConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionConfig {
    pub source_cap: usize,
    pub recent_headline_days: i64,
    pub recent_headline_cap: usize,
    pub flagship_companies: Vec<String>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            source_cap: 2,
            recent_headline_days: 14,
            recent_headline_cap: 64,
            flagship_companies: split_list(DEFAULT_FLAGSHIPS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichConfig {
    pub bullet_sentences: usize,
    pub labels: Vec<String>,
    pub excerpt_chars: usize,
    pub image_attempts: u32,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            bullet_sentences: 2,
            labels: split_list(DEFAULT_LABELS),
            excerpt_chars: 2000,
            image_attempts: 3,
        }
    }
}

const DEFAULT_FLAGSHIPS: &str = "Nvidia,Apple,Microsoft,Alphabet,Google,Amazon,Meta,Tesla";
const DEFAULT_LABELS: &str = "Markets,Policy,Technology,Business,Science,World";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// `None` runs against the in-process store.
    pub store: Option<StoreConfig>,
    pub ai: AiConfig,
    pub delivery: DeliveryConfig,
    pub feeds: Vec<FeedConfig>,
    pub selection: SelectionConfig,
    pub enrich: EnrichConfig,
    pub executor: ExecutorConfig,
    pub retry: RetryPolicy,
    pub slot_rules_path: Option<PathBuf>,
    pub source_weights_path: Option<PathBuf>,
    pub artifact_dir: PathBuf,
    /// Shown in the compiled issue's title and subject.
    pub newsletter_title: String,
    /// Periodic ingestion; `None` leaves ingestion to explicit triggers.
    pub ingest_interval: Option<Duration>,
    pub delivery_timeout: Duration,
    pub metrics_enabled: bool,
}

impl PipelineConfig {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { get: &get };

        let store = match env.string("STORE_URL") {
            Some(base_url) => Some(StoreConfig {
                base_url,
                token: env.required("STORE_TOKEN")?,
                request_timeout: Duration::from_secs(env.parse("STORE_TIMEOUT_SECS", 10)?),
                allow_insecure: env.flag("STORE_ALLOW_INSECURE")?,
            }),
            None => None,
        };

        let delivery = match env
            .string("DELIVERY_MODE")
            .unwrap_or_else(|| "none".into())
            .to_ascii_lowercase()
            .as_str()
        {
            "none" | "disabled" => DeliveryConfig::Disabled,
            "http" => DeliveryConfig::Http {
                url: env.required("DELIVERY_URL")?,
                token: env.required("DELIVERY_TOKEN")?,
            },
            "smtp" => DeliveryConfig::Smtp(SmtpConfig {
                host: env.required("SMTP_HOST")?,
                port: env.parse("SMTP_PORT", 587)?,
                username: env.string("SMTP_USER"),
                password: env.string("SMTP_PASS"),
                from: env.required("SMTP_FROM")?,
                recipients: {
                    let list = split_list(&env.required("DELIVERY_RECIPIENTS")?);
                    if list.is_empty() {
                        return Err(PipelineError::Config(
                            "DELIVERY_RECIPIENTS is empty".into(),
                        ));
                    }
                    list
                },
            }),
            other => {
                return Err(PipelineError::Config(format!(
                    "DELIVERY_MODE must be none|http|smtp, got '{other}'"
                )))
            }
        };

        let defaults_sel = SelectionConfig::default();
        let selection = SelectionConfig {
            source_cap: env.parse("SOURCE_CAP", defaults_sel.source_cap)?,
            recent_headline_days: env.parse("RECENT_HEADLINE_DAYS", defaults_sel.recent_headline_days)?,
            recent_headline_cap: env.parse("RECENT_HEADLINE_CAP", defaults_sel.recent_headline_cap)?,
            flagship_companies: env
                .string("FLAGSHIP_COMPANIES")
                .map(|s| split_list(&s))
                .unwrap_or(defaults_sel.flagship_companies),
        };

        let defaults_en = EnrichConfig::default();
        let enrich = EnrichConfig {
            bullet_sentences: env.parse("BULLET_SENTENCES", defaults_en.bullet_sentences)?,
            labels: env
                .string("STORY_LABELS")
                .map(|s| split_list(&s))
                .unwrap_or(defaults_en.labels),
            excerpt_chars: env.parse("EXCERPT_CHARS", defaults_en.excerpt_chars)?,
            image_attempts: env.parse("IMAGE_ATTEMPTS", defaults_en.image_attempts)?,
        };
        if enrich.bullet_sentences == 0 || enrich.labels.is_empty() {
            return Err(PipelineError::Config(
                "BULLET_SENTENCES must be positive and STORY_LABELS non-empty".into(),
            ));
        }

        let executor = ExecutorConfig {
            workers: env.parse("WORKERS", ExecutorConfig::default().workers)?,
            max_queued: env.parse("MAX_QUEUED", ExecutorConfig::default().max_queued)?,
            retain_finished: env.parse("RETAIN_FINISHED_JOBS", ExecutorConfig::default().retain_finished)?,
        };

        let retry = RetryPolicy::default()
            .with_attempts(env.parse("RETRY_ATTEMPTS", 3)?)
            .with_call_timeout(Duration::from_secs(env.parse("CALL_TIMEOUT_SECS", 30)?));

        Ok(Self {
            store,
            ai: AiConfig::from_env_with(&get)?,
            delivery,
            feeds: parse_feeds(&env.string("FEEDS").unwrap_or_default())?,
            selection,
            enrich,
            executor,
            retry,
            slot_rules_path: env.string("SLOT_RULES_PATH").map(PathBuf::from),
            source_weights_path: env.string("SOURCE_WEIGHTS_PATH").map(PathBuf::from),
            artifact_dir: PathBuf::from(
                env.string("ARTIFACT_DIR").unwrap_or_else(|| "artifacts".into()),
            ),
            newsletter_title: env
                .string("NEWSLETTER_TITLE")
                .unwrap_or_else(|| "Daily Brief".into()),
            ingest_interval: match env.parse("INGEST_INTERVAL_SECS", 0u64)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            delivery_timeout: Duration::from_secs(env.parse("DELIVERY_TIMEOUT_SECS", 60)?),
            metrics_enabled: env.string("METRICS_ENABLED").is_none() || env.flag("METRICS_ENABLED")?,
        })
    }
}

/// Thin typed view over a key lookup.
pub(crate) struct Env<'a, F: Fn(&str) -> Option<String>> {
    pub(crate) get: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    pub(crate) fn string(&self, key: &str) -> Option<String> {
        (self.get)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub(crate) fn required(&self, key: &str) -> Result<String> {
        self.string(key)
            .ok_or_else(|| PipelineError::Config(format!("{key} is required")))
    }

    pub(crate) fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| PipelineError::Config(format!("{key}: cannot parse '{raw}'"))),
        }
    }

    pub(crate) fn flag(&self, key: &str) -> Result<bool> {
        match self.string(key).map(|s| s.to_ascii_lowercase()) {
            None => Ok(false),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(PipelineError::Config(format!("{key}: expected a boolean, got '{v}'"))),
            },
        }
    }
}

/// Comma-separated list, trimmed, empties dropped, order kept.
pub fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// `name=url,name=url`
fn parse_feeds(s: &str) -> Result<Vec<FeedConfig>> {
    split_list(s)
        .into_iter()
        .map(|entry| {
            let (name, url) = entry
                .split_once('=')
                .ok_or_else(|| PipelineError::Config(format!("FEEDS entry '{entry}' is not name=url")))?;
            url::Url::parse(url.trim())
                .map_err(|e| PipelineError::Config(format!("FEEDS url for '{name}': {e}")))?;
            Ok(FeedConfig {
                name: name.trim().to_string(),
                url: url.trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<PipelineConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_local_defaults() {
        let cfg = load(&[]).unwrap();
        assert!(cfg.store.is_none());
        assert_eq!(cfg.delivery, DeliveryConfig::Disabled);
        assert_eq!(cfg.selection.source_cap, 2);
        assert_eq!(cfg.selection.recent_headline_days, 14);
        assert_eq!(cfg.enrich.bullet_sentences, 2);
        assert_eq!(cfg.enrich.excerpt_chars, 2000);
        assert!(cfg.metrics_enabled);
        assert!(cfg.feeds.is_empty());
        assert!(cfg.ingest_interval.is_none());
        assert_eq!(cfg.newsletter_title, "Daily Brief");
    }

    #[test]
    fn store_url_requires_token() {
        let err = load(&[("STORE_URL", "https://store.example/v0/base")]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
        assert!(err.to_string().contains("STORE_TOKEN"));

        let cfg = load(&[
            ("STORE_URL", "https://store.example/v0/base"),
            ("STORE_TOKEN", "secret"),
        ])
        .unwrap();
        let store = cfg.store.unwrap();
        assert!(!store.allow_insecure);
        assert_eq!(store.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn unparseable_values_are_errors() {
        assert!(load(&[("SOURCE_CAP", "two")]).is_err());
        assert!(load(&[("STORE_ALLOW_INSECURE", "maybe")]).is_err());
        assert!(load(&[("DELIVERY_MODE", "pigeon")]).is_err());
    }

    #[test]
    fn smtp_delivery_and_feeds_parse() {
        let cfg = load(&[
            ("DELIVERY_MODE", "smtp"),
            ("SMTP_HOST", "smtp.example"),
            ("SMTP_FROM", "news@example.com"),
            ("DELIVERY_RECIPIENTS", "a@example.com, b@example.com,"),
            ("FEEDS", "wire=https://wire.example/rss, tech=https://tech.example/feed"),
        ])
        .unwrap();
        match cfg.delivery {
            DeliveryConfig::Smtp(s) => {
                assert_eq!(s.port, 587);
                assert_eq!(s.recipients, vec!["a@example.com", "b@example.com"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cfg.feeds.len(), 2);
        assert_eq!(cfg.feeds[1].name, "tech");

        assert!(load(&[("FEEDS", "no-equals-sign")]).is_err());
    }

    #[serial_test::serial]
    #[test]
    fn from_env_reads_process_environment() {
        std::env::set_var("SOURCE_CAP", "3");
        let cfg = PipelineConfig::from_env().unwrap();
        std::env::remove_var("SOURCE_CAP");
        assert_eq!(cfg.selection.source_cap, 3);
    }
}
