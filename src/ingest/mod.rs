// src/ingest/mod.rs
//! Ingestion: fetch from every provider, fingerprint, drop what the store
//! already knows, persist the rest as candidates.
//!
//! The known-fingerprint set is loaded once per run, so two runs must never
//! overlap; the pipeline serializes them.

pub mod providers;
pub mod scheduler;
pub mod types;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;

use crate::error::Result;
use crate::fingerprint::fingerprint;
use crate::jobs::JobSummary;
use crate::model::Candidate;
use crate::store::Repository;
use crate::telemetry::anon_hash;

pub use types::{FetchedItem, SourceProvider};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_items_total", "Items parsed from providers.");
        describe_counter!("ingest_new_total", "Items stored as new candidates.");
        describe_counter!(
            "ingest_duplicate_total",
            "Items dropped because their fingerprint was already known."
        );
        describe_counter!(
            "ingest_invalid_total",
            "Items with neither url nor title."
        );
        describe_counter!(
            "ingest_provider_errors_total",
            "Provider fetch/parse errors."
        );
        describe_histogram!("ingest_parse_ms", "Provider parse time in milliseconds.");
        describe_gauge!(
            "ingest_pipeline_last_run_ts",
            "Unix ts when ingest pipeline last ran."
        );
    });
}

/// Normalize text: decode entities, strip tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").expect("static regex"));
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").expect("static regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 5) Length cap: 500 chars
    if out.chars().count() > 500 {
        out = out.chars().take(500).collect();
    }

    out
}

/// Counters for one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub fetched: u64,
    pub ingested: u64,
    pub duplicate: u64,
    pub invalid: u64,
    pub provider_errors: u64,
}

impl IngestStats {
    pub fn to_summary(self) -> JobSummary {
        let mut s = JobSummary::new();
        s.set("fetched", self.fetched);
        s.set("ingested", self.ingested);
        s.set("duplicate", self.duplicate);
        s.set("invalid", self.invalid);
        s.set("provider_errors", self.provider_errors);
        s
    }
}

/// Fingerprint a batch against `known`, which grows as items are accepted
/// (so repeats inside the batch are caught too).
pub fn dedup_batch(
    items: Vec<FetchedItem>,
    known: &mut HashSet<String>,
    now: DateTime<Utc>,
) -> (Vec<Candidate>, IngestStats) {
    let mut stats = IngestStats::default();
    let mut out = Vec::new();

    for item in items {
        stats.fetched += 1;
        let title = item.title.as_deref().map(normalize_text).unwrap_or_default();
        let url = item
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        let fp = match fingerprint(url.as_deref(), Some(&title)) {
            Ok(fp) => fp,
            Err(e) => {
                stats.invalid += 1;
                tracing::debug!(target: "ingest", source = %item.source, error = %e, "skipping item");
                continue;
            }
        };
        if !known.insert(fp.clone()) {
            stats.duplicate += 1;
            continue;
        }

        stats.ingested += 1;
        tracing::debug!(
            target: "ingest",
            fingerprint = %fp,
            title_hash = %anon_hash(&title),
            source = %item.source,
            "new candidate"
        );
        out.push(Candidate {
            fingerprint: fp,
            title: if title.is_empty() {
                url.clone().unwrap_or_default()
            } else {
                title
            },
            url,
            source: item.source.trim().to_string(),
            published_at: item.published_at.unwrap_or(now),
            ingested_at: now,
            company: None,
            classified_at: None,
        });
    }

    (out, stats)
}

/// Run ingestion once over `providers`, persisting new candidates.
pub async fn run_once(
    providers: &[Arc<dyn SourceProvider>],
    repo: &Repository,
    now: DateTime<Utc>,
) -> Result<IngestStats> {
    ensure_metrics_described();

    let mut known = repo.load_fingerprints().await?;
    let known_before = known.len();

    let fetched = join_all(providers.iter().map(|p| async move {
        (p.name().to_string(), p.fetch_latest().await)
    }))
    .await;

    let mut raw = Vec::new();
    let mut provider_errors = 0u64;
    for (name, res) in fetched {
        match res {
            Ok(mut v) => raw.append(&mut v),
            Err(e) => {
                tracing::warn!(target: "ingest", error = ?e, provider = %name, "provider error");
                counter!("ingest_provider_errors_total").increment(1);
                provider_errors += 1;
            }
        }
    }

    let (candidates, mut stats) = dedup_batch(raw, &mut known, now);
    stats.provider_errors = provider_errors;
    repo.insert_candidates(&candidates).await?;

    // Telemetry
    counter!("ingest_items_total").increment(stats.fetched);
    counter!("ingest_new_total").increment(stats.ingested);
    counter!("ingest_duplicate_total").increment(stats.duplicate);
    counter!("ingest_invalid_total").increment(stats.invalid);
    gauge!("ingest_pipeline_last_run_ts").set(now.timestamp() as f64);

    tracing::info!(
        target: "ingest",
        known = known_before,
        fetched = stats.fetched,
        ingested = stats.ingested,
        duplicate = stats.duplicate,
        invalid = stats.invalid,
        provider_errors = stats.provider_errors,
        "ingestion run finished"
    );
    Ok(stats)
}
