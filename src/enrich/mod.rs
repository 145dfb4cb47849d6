// src/enrich/mod.rs
//! Enrichment: turn each selected slot into publishable copy.
//!
//! Stages run in a fixed order per story and each one writes only its own
//! fields as soon as it completes:
//!
//! | stage     | required | on failure                                   |
//! |-----------|----------|----------------------------------------------|
//! | clean     | no       | raw excerpt, or the headline if fetch failed |
//! | structure | yes      | story `failed`, siblings continue            |
//! | emphasize | no       | bullets kept verbatim                        |
//! | image     | no       | `pending` until the attempt budget is spent  |
//!
//! A rerun skips every stage whose output is already stored. Images run as
//! their own low-priority job ([`Enricher::run_images`]).

pub mod fetch;
pub mod text;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use metrics::counter;
use serde::Deserialize;
use serde_json::json;

use crate::ai::{generate_json, sanitize_line, DynImage, DynText, PromptTemplate, Validate};
use crate::config::EnrichConfig;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::jobs::{JobContext, JobSummary};
use crate::model::{DecoratedStory, ImageStatus, SelectedSlot, StoryStatus};
use crate::retry::RetryPolicy;
use crate::store::{Repository, Stored};

pub use fetch::{HttpTextFetcher, SourceTextFetcher, StaticFetcher};

/// Stories enriched at the same time.
const STORY_CONCURRENCY: usize = 3;

const CLEAN_PROMPT: &str = r#"task: clean
Below is text scraped from a news article page. Remove navigation, ads, bylines, cookie notices and any other boilerplate.
Return only the article body as plain text, with no commentary.
Headline: {{headline}}
---
{{text}}"#;

const STRUCTURE_PROMPT: &str = r#"task: structure
Write newsletter copy for this story.
Headline: {{headline}}
Source text:
{{excerpt}}
Rules: a short headline; a one-sentence dek; exactly 3 bullets, each exactly {{sentences}} sentences; label must be one of: {{labels}}.
Reply with JSON only: {"headline": "...", "dek": "...", "bullets": ["...", "...", "..."], "label": "..."}"#;

const EMPHASIZE_PROMPT: &str = r#"task: emphasize
For each bullet, wrap the single most important phrase in **double asterisks**. Do not change any other character.
Bullets (JSON): {{bullets}}
Reply with JSON only: {"bullets": ["...", "...", "..."]}"#;

const IMAGE_PROMPT: &str = r#"task: image-prompt
Describe one editorial illustration for this story in a single sentence. No text, logos or faces of real people.
Headline: {{headline}}
Summary: {{dek}}
Section: {{label}}
Reply with JSON only: {"prompt": "..."}"#;

/// Reply of the structure stage.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StructuredCopy {
    pub headline: String,
    pub dek: String,
    pub bullets: Vec<String>,
    pub label: String,
}

impl Validate for StructuredCopy {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.headline.trim().is_empty() {
            return Err("headline is empty".into());
        }
        if self.dek.trim().is_empty() {
            return Err("dek is empty".into());
        }
        if self.bullets.len() != 3 {
            return Err(format!("expected 3 bullets, got {}", self.bullets.len()));
        }
        if self.bullets.iter().any(|b| b.trim().is_empty()) {
            return Err("empty bullet".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct EmphasizedBullets {
    bullets: Vec<String>,
}

impl Validate for EmphasizedBullets {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.bullets.len() != 3 {
            return Err(format!("expected 3 bullets, got {}", self.bullets.len()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ImagePrompt {
    prompt: String,
}

impl Validate for ImagePrompt {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.prompt.trim().is_empty() {
            return Err("prompt is empty".into());
        }
        Ok(())
    }
}

struct Templates {
    clean: PromptTemplate,
    structure: PromptTemplate,
    emphasize: PromptTemplate,
    image: PromptTemplate,
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            clean: PromptTemplate::new("clean", CLEAN_PROMPT),
            structure: PromptTemplate::new("structure", STRUCTURE_PROMPT),
            emphasize: PromptTemplate::new("emphasize", EMPHASIZE_PROMPT),
            image: PromptTemplate::new("image-prompt", IMAGE_PROMPT),
        }
    }
}

fn note(summary: &mut JobSummary, stage: &'static str, outcome: &'static str) {
    counter!("enrich_stage_total", "stage" => stage, "outcome" => outcome).increment(1);
    summary.incr(&format!("{stage}_{outcome}"), 1);
}

pub struct Enricher {
    text: DynText,
    images: DynImage,
    fetcher: Arc<dyn SourceTextFetcher>,
    retry: RetryPolicy,
    config: EnrichConfig,
    templates: Templates,
}

impl Enricher {
    pub fn new(
        text: DynText,
        images: DynImage,
        fetcher: Arc<dyn SourceTextFetcher>,
        retry: RetryPolicy,
        config: EnrichConfig,
    ) -> Self {
        Self {
            text,
            images,
            fetcher,
            retry,
            config,
            templates: Templates::default(),
        }
    }

    // ---- stage (a): clean ----

    async fn clean(&self, url: Option<&str>, headline: &str) -> (String, &'static str) {
        let Some(url) = url else {
            return (headline.to_string(), "headline");
        };
        let raw = match self.fetcher.fetch(url).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(target: "enrich", url, error = %e, "source fetch failed, using headline");
                return (headline.to_string(), "headline");
            }
        };
        let limit = self.config.excerpt_chars;
        let fallback = text::excerpt(&raw, limit);
        let input = text::excerpt(&raw, limit.saturating_mul(4));
        let prompt = match self
            .templates
            .clean
            .render(&[("headline", headline), ("text", input.as_str())])
        {
            Ok(p) => p,
            Err(_) => return (fallback, "fallback"),
        };
        match self.retry.run("enrich.clean", || self.text.complete(&prompt)).await {
            Ok(cleaned) if !cleaned.trim().is_empty() => (text::excerpt(&cleaned, limit), "ok"),
            Ok(_) => (fallback, "fallback"),
            Err(e) => {
                tracing::warn!(target: "enrich", url, error = %e, "clean failed, using raw excerpt");
                (fallback, "fallback")
            }
        }
    }

    // ---- stage (b): structure ----

    /// Generate and validate the copy. Any rule violation is `Malformed`.
    pub async fn structure(&self, headline: &str, excerpt: &str) -> Result<StructuredCopy> {
        let sentences = self.config.bullet_sentences.to_string();
        let labels = self.config.labels.join(", ");
        let prompt = self.templates.structure.render(&[
            ("headline", headline),
            ("excerpt", excerpt),
            ("sentences", sentences.as_str()),
            ("labels", labels.as_str()),
        ])?;
        let copy: StructuredCopy =
            generate_json(self.text.as_ref(), &self.retry, "enrich.structure", &prompt).await?;
        self.check_structure(copy)
    }

    fn check_structure(&self, copy: StructuredCopy) -> Result<StructuredCopy> {
        let bullets: Vec<String> = copy.bullets.iter().map(|b| b.trim().to_string()).collect();
        for (i, b) in bullets.iter().enumerate() {
            let n = text::count_sentences(b);
            if n != self.config.bullet_sentences {
                return Err(PipelineError::Malformed(format!(
                    "bullet {} has {n} sentences, expected {}",
                    i + 1,
                    self.config.bullet_sentences
                )));
            }
        }
        let label = self
            .config
            .labels
            .iter()
            .find(|l| l.eq_ignore_ascii_case(copy.label.trim()))
            .cloned()
            .ok_or_else(|| PipelineError::Malformed(format!("label {:?} is not allowed", copy.label)))?;
        Ok(StructuredCopy {
            headline: sanitize_line(&copy.headline, 200),
            dek: sanitize_line(&copy.dek, 320),
            bullets,
            label,
        })
    }

    // ---- stage (c): emphasize ----

    /// Returns the bullets to store, whether any emphasis was kept, and the
    /// outcome. Each bullet is either marked correctly or left verbatim.
    async fn emphasize(&self, bullets: &[String]) -> (Vec<String>, bool, &'static str) {
        let listing = match serde_json::to_string(bullets) {
            Ok(l) => l,
            Err(_) => return (bullets.to_vec(), false, "failed"),
        };
        let prompt = match self.templates.emphasize.render(&[("bullets", listing.as_str())]) {
            Ok(p) => p,
            Err(_) => return (bullets.to_vec(), false, "failed"),
        };
        let marked: EmphasizedBullets =
            match generate_json(self.text.as_ref(), &self.retry, "enrich.emphasize", &prompt).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(target: "enrich", error = %e, "emphasis failed, bullets kept verbatim");
                    return (bullets.to_vec(), false, "failed");
                }
            };

        let mut accepted = 0;
        let out: Vec<String> = bullets
            .iter()
            .zip(marked.bullets.iter())
            .map(|(orig, m)| {
                let m = m.trim();
                if text::is_valid_emphasis(orig, m) {
                    accepted += 1;
                    m.to_string()
                } else {
                    orig.clone()
                }
            })
            .collect();
        let outcome = match accepted {
            0 => "rejected",
            n if n == bullets.len() => "ok",
            _ => "partial",
        };
        (out, accepted > 0, outcome)
    }

    /// Run the text stages for one story, skipping those already stored.
    pub async fn enrich_story(
        &self,
        repo: &Repository,
        mut story: Stored<DecoratedStory>,
        headline: &str,
        ctx: &JobContext,
    ) -> Result<(Stored<DecoratedStory>, JobSummary)> {
        let mut summary = JobSummary::new();
        if story.value.status == StoryStatus::TextComplete {
            summary.incr("stories_already_done", 1);
            return Ok((story, summary));
        }
        ctx.checkpoint()?;

        if story.value.source_excerpt.is_none() {
            let (excerpt, outcome) = self.clean(story.value.source_url.as_deref(), headline).await;
            repo.update_story_fields(&story.id, json!({ "source_excerpt": excerpt }))
                .await?;
            story.value.source_excerpt = Some(excerpt);
            note(&mut summary, "clean", outcome);
            ctx.checkpoint()?;
        }

        if !story.value.is_structured() {
            let excerpt = story.value.source_excerpt.clone().unwrap_or_default();
            match self.structure(headline, &excerpt).await {
                Ok(copy) => {
                    repo.update_story_fields(
                        &story.id,
                        json!({
                            "headline": copy.headline,
                            "dek": copy.dek,
                            "bullets": copy.bullets,
                            "label": copy.label,
                            "status": StoryStatus::Pending,
                            "error": null,
                        }),
                    )
                    .await?;
                    story.value.headline = Some(copy.headline);
                    story.value.dek = Some(copy.dek);
                    story.value.bullets = copy.bullets;
                    story.value.label = Some(copy.label);
                    story.value.status = StoryStatus::Pending;
                    story.value.error = None;
                    note(&mut summary, "structure", "ok");
                }
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => {
                    tracing::warn!(target: "enrich", issue_id = %story.value.issue_id, slot = story.value.slot, error = %e, "structure failed, story marked failed");
                    let msg = format!("structure: {e}");
                    repo.update_story_fields(
                        &story.id,
                        json!({ "status": StoryStatus::Failed, "error": msg }),
                    )
                    .await?;
                    story.value.status = StoryStatus::Failed;
                    story.value.error = Some(msg.clone());
                    ctx.record_error(format!("slot {}: {msg}", story.value.slot));
                    note(&mut summary, "structure", "failed");
                    return Ok((story, summary));
                }
            }
            ctx.checkpoint()?;
        }

        let (bullets, emphasized, outcome) = self.emphasize(&story.value.bullets).await;
        repo.update_story_fields(
            &story.id,
            json!({
                "bullets": bullets,
                "emphasized": emphasized,
                "status": StoryStatus::TextComplete,
            }),
        )
        .await?;
        story.value.bullets = bullets;
        story.value.emphasized = emphasized;
        story.value.status = StoryStatus::TextComplete;
        note(&mut summary, "emphasize", outcome);

        tracing::info!(target: "enrich", issue_id = %story.value.issue_id, slot = story.value.slot, emphasized, "story text complete");
        Ok((story, summary))
    }

    /// Create missing story rows for the issue's selected slots.
    async fn ensure_stories(
        &self,
        repo: &Repository,
        issue_id: &str,
        selected: &[SelectedSlot],
    ) -> Result<Vec<(Stored<DecoratedStory>, String)>> {
        let mut existing: HashMap<u8, Stored<DecoratedStory>> = repo
            .stories(issue_id)
            .await?
            .into_iter()
            .map(|s| (s.value.slot, s))
            .collect();
        let missing = selected
            .iter()
            .any(|s| !existing.contains_key(&s.slot.number()));
        let urls: HashMap<String, Option<String>> = if missing {
            repo.candidates()
                .await?
                .into_iter()
                .map(|c| (c.value.fingerprint, c.value.url))
                .collect()
        } else {
            HashMap::new()
        };

        let mut out = Vec::with_capacity(selected.len());
        for sel in selected {
            let story = match existing.remove(&sel.slot.number()) {
                Some(s) => s,
                None => {
                    let url = urls.get(&sel.fingerprint).cloned().flatten();
                    repo.create_story(&DecoratedStory::for_slot(sel, url)).await?
                }
            };
            out.push((story, sel.headline.clone()));
        }
        Ok(out)
    }

    /// Text stages for every selected slot of an issue. One story failing
    /// never stops the others.
    pub async fn run(&self, repo: &Repository, issue_id: &str, ctx: &JobContext) -> Result<JobSummary> {
        let selected = repo.selected_slots(issue_id).await?;
        let mut summary = JobSummary::new();
        summary.set("stories", selected.len() as u64);
        if selected.is_empty() {
            tracing::warn!(target: "enrich", issue_id, "no selected slots to enrich");
            return Ok(summary);
        }

        let work = self.ensure_stories(repo, issue_id, &selected).await?;
        let results: Vec<Result<(Stored<DecoratedStory>, JobSummary)>> = stream::iter(work)
            .map(|(story, headline)| async move {
                self.enrich_story(repo, story, &headline, ctx).await
            })
            .buffer_unordered(STORY_CONCURRENCY)
            .collect()
            .await;

        let mut first_abort: Option<PipelineError> = None;
        for r in results {
            match r {
                Ok((story, s)) => {
                    summary.merge(&s);
                    let key = match story.value.status {
                        StoryStatus::TextComplete => "text_complete",
                        StoryStatus::Failed => "failed",
                        StoryStatus::Pending => "pending",
                    };
                    summary.incr(key, 1);
                }
                Err(e) => {
                    summary.incr("story_errors", 1);
                    ctx.record_error(e.to_string());
                    if matches!(e.kind(), ErrorKind::Cancelled | ErrorKind::Fatal) && first_abort.is_none() {
                        first_abort = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_abort {
            return Err(e);
        }

        tracing::info!(
            target: "enrich",
            issue_id,
            complete = summary.get("text_complete"),
            failed = summary.get("failed"),
            "enrichment finished"
        );
        Ok(summary)
    }

    // ---- stage (d): images ----

    async fn image_prompt(&self, story: &DecoratedStory) -> Result<String> {
        if let Some(p) = &story.image_prompt {
            return Ok(p.clone());
        }
        let prompt = self.templates.image.render(&[
            ("headline", story.headline.as_deref().unwrap_or_default()),
            ("dek", story.dek.as_deref().unwrap_or_default()),
            ("label", story.label.as_deref().unwrap_or_default()),
        ])?;
        let out: ImagePrompt =
            generate_json(self.text.as_ref(), &self.retry, "enrich.image_prompt", &prompt).await?;
        Ok(sanitize_line(&out.prompt, 400))
    }

    async fn illustrate(&self, repo: &Repository, story: Stored<DecoratedStory>) -> Result<&'static str> {
        let attempt = story.value.image_attempts + 1;
        let prompt = self.image_prompt(&story.value).await;
        let result = match &prompt {
            Ok(p) => self.retry.run("enrich.image", || self.images.create(p)).await,
            Err(e) => Err(PipelineError::Malformed(e.to_string())),
        };
        let prompt = prompt.ok();

        let (fields, outcome) = match result {
            Ok(url) => (
                json!({
                    "image_prompt": prompt,
                    "image_url": url,
                    "image_status": ImageStatus::Generated,
                    "image_attempts": attempt,
                }),
                "generated",
            ),
            Err(e) => {
                let spent = attempt >= self.config.image_attempts;
                tracing::warn!(target: "enrich", issue_id = %story.value.issue_id, slot = story.value.slot, attempt, error = %e, "image generation failed");
                let status = if spent { ImageStatus::Failed } else { ImageStatus::Pending };
                (
                    json!({
                        "image_prompt": prompt,
                        "image_status": status,
                        "image_attempts": attempt,
                    }),
                    if spent { "failed" } else { "pending" },
                )
            }
        };
        repo.update_story_fields(&story.id, fields).await?;
        Ok(outcome)
    }

    /// Request illustrations for text-complete stories still waiting on one.
    /// Runs concurrently across stories.
    pub async fn run_images(&self, repo: &Repository, issue_id: &str, ctx: &JobContext) -> Result<JobSummary> {
        let budget = self.config.image_attempts;
        let todo: Vec<Stored<DecoratedStory>> = repo
            .stories(issue_id)
            .await?
            .into_iter()
            .filter(|s| {
                s.value.status == StoryStatus::TextComplete
                    && s.value.image_status == ImageStatus::Pending
                    && s.value.image_attempts < budget
            })
            .collect();
        let mut summary = JobSummary::new();
        summary.set("stories", todo.len() as u64);
        ctx.checkpoint()?;

        let results = join_all(todo.into_iter().map(|s| self.illustrate(repo, s))).await;
        for r in results {
            match r {
                Ok(outcome) => note(&mut summary, "image", outcome),
                Err(e) => {
                    summary.incr("image_errors", 1);
                    ctx.record_error(e.to_string());
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::ScriptedClient;
    use crate::model::Slot;
    use crate::store::MemoryStore;
    use chrono::Utc;

    const GOOD_COPY: &str = r#"{"headline": "Acme raises $40M", "dek": "The robotics startup doubles its valuation.", "bullets": ["Acme raised $40M. The round was led by Beta.", "It builds warehouse robots. Sales tripled in 2025.", "Hiring will double. A European office opens in 2027."], "label": "business"}"#;

    fn enricher(client: ScriptedClient) -> Enricher {
        let client = Arc::new(client);
        Enricher::new(
            client.clone(),
            client,
            Arc::new(StaticFetcher::new().page("https://news.test/acme", "<p>Acme raised money.</p>")),
            RetryPolicy::default(),
            EnrichConfig::default(),
        )
    }

    async fn seeded(repo: &Repository) {
        repo.insert_selected_slot(&SelectedSlot {
            issue_id: "2026-10-17".into(),
            slot: Slot::new(3).unwrap(),
            fingerprint: "p_acme".into(),
            headline: "Acme raises $40M for warehouse robots".into(),
            company: Some("Acme".into()),
            source: Some("TechCrunch".into()),
            reasoning: "fresh".into(),
            selected_at: Utc::now(),
        })
        .await
        .unwrap();
    }

    #[test]
    fn structure_rules_are_enforced() {
        let e = enricher(ScriptedClient::new());
        let good: StructuredCopy = serde_json::from_str(GOOD_COPY).unwrap();
        let checked = e.check_structure(good.clone()).unwrap();
        assert_eq!(checked.label, "Business");

        let mut bad_label = good.clone();
        bad_label.label = "Gossip".into();
        assert!(e.check_structure(bad_label).is_err());

        let mut long_bullet = good;
        long_bullet.bullets[1] = "One. Two. Three.".into();
        assert!(e.check_structure(long_bullet).is_err());
    }

    #[tokio::test]
    async fn full_text_stages_complete_the_story() {
        let store = Arc::new(MemoryStore::new());
        let repo = Repository::new(store, RetryPolicy::default());
        seeded(&repo).await;

        let client = ScriptedClient::new()
            .reply("task: structure", GOOD_COPY)
            .reply(
                "task: emphasize",
                r#"{"bullets": ["Acme raised **$40M**. The round was led by Beta.", "It builds warehouse robots. Sales **tripled** in 2025.", "Hiring will double. A European office opens in 2027."]}"#,
            );
        let e = enricher(client);
        let summary = e.run(&repo, "2026-10-17", &JobContext::detached()).await.unwrap();

        let story = &repo.stories("2026-10-17").await.unwrap()[0].value;
        assert_eq!(story.status, StoryStatus::TextComplete);
        assert!(story.emphasized);
        assert_eq!(story.bullets[0], "Acme raised **$40M**. The round was led by Beta.");
        // third bullet had no emphasis, kept verbatim
        assert_eq!(story.bullets[2], "Hiring will double. A European office opens in 2027.");
        // no url on the slot's candidate: headline used as the excerpt
        assert_eq!(story.source_excerpt.as_deref(), Some("Acme raises $40M for warehouse robots"));
        assert_eq!(summary.get("emphasize_partial"), 1);
        assert_eq!(summary.get("text_complete"), 1);
    }

    #[tokio::test]
    async fn structure_failure_fails_only_the_story() {
        let store = Arc::new(MemoryStore::new());
        let repo = Repository::new(store, RetryPolicy::default());
        seeded(&repo).await;

        let client = ScriptedClient::new().reply("task: structure", "I cannot do that");
        let e = enricher(client);
        let ctx = JobContext::detached();
        let summary = e.run(&repo, "2026-10-17", &ctx).await.unwrap();

        let story = &repo.stories("2026-10-17").await.unwrap()[0].value;
        assert_eq!(story.status, StoryStatus::Failed);
        assert!(story.error.as_deref().unwrap().starts_with("structure"));
        assert_eq!(summary.get("failed"), 1);
        assert_eq!(ctx.take_errors().len(), 1);
    }

    #[tokio::test]
    async fn images_respect_the_attempt_budget() {
        let store = Arc::new(MemoryStore::new());
        let repo = Repository::new(store, RetryPolicy::default());
        let story = DecoratedStory {
            issue_id: "i".into(),
            slot: 1,
            fingerprint: "p_a".into(),
            headline: Some("h".into()),
            dek: Some("d".into()),
            bullets: vec!["a.".into(), "b.".into(), "c.".into()],
            label: Some("World".into()),
            status: StoryStatus::TextComplete,
            image_attempts: 2,
            ..DecoratedStory::default()
        };
        repo.create_story(&story).await.unwrap();

        let client = ScriptedClient::new()
            .reply("task: image-prompt", r#"{"prompt": "a quiet harbor at dawn"}"#)
            .images(|_| Err(PipelineError::Fatal("quota".into())));
        let e = enricher(client);
        let summary = e.run_images(&repo, "i", &JobContext::detached()).await.unwrap();
        assert_eq!(summary.get("image_failed"), 1);

        let stored = &repo.stories("i").await.unwrap()[0].value;
        assert_eq!(stored.image_status, ImageStatus::Failed);
        assert_eq!(stored.image_attempts, 3);
        assert_eq!(stored.image_prompt.as_deref(), Some("a quiet harbor at dawn"));
        assert_eq!(stored.status, StoryStatus::TextComplete);

        // nothing left to try
        let again = e.run_images(&repo, "i", &JobContext::detached()).await.unwrap();
        assert_eq!(again.get("stories"), 0);
    }
}
