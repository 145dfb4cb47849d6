// src/classify/mod.rs
//! Eligibility classification.
//!
//! Every unclassified candidate is judged against every slot. The five slots
//! are evaluated concurrently and independently; a verdict is advisory only
//! (the selector makes the binding choice). Per (candidate, slot):
//!
//! 1. freshness: older than the slot window means ineligible, no external call;
//! 2. topical fit, via an [`EligibilityJudge`];
//! 3. flagship override on the flagship slot: a headline naming a configured
//!    flagship company is eligible whatever the judge said (or failed to say).

pub mod rules;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use metrics::counter;
use regex::Regex;
use serde::Deserialize;

use crate::ai::{generate_json, DynText, PromptTemplate, Validate};
use crate::error::{PipelineError, Result};
use crate::jobs::{JobContext, JobSummary};
use crate::model::{Candidate, EligibilityRecord};
use crate::retry::RetryPolicy;
use crate::store::repo::CandidateAnnotation;
use crate::store::{Repository, Stored};

pub use rules::{SlotRule, SlotRules};

/// Candidates judged at once within one slot.
const PER_SLOT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Judgment {
    pub eligible: bool,
    pub reasoning: String,
    #[serde(default)]
    pub company: Option<String>,
}

impl Validate for Judgment {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.reasoning.trim().is_empty() {
            return Err("reasoning is empty".into());
        }
        Ok(())
    }
}

#[async_trait]
pub trait EligibilityJudge: Send + Sync {
    async fn judge(&self, rule: &SlotRule, candidate: &Candidate) -> Result<Judgment>;
}

const JUDGE_PROMPT: &str = r#"task: slot-eligibility
You decide whether a news item fits a newsletter slot.
Slot {{slot}} "{{name}}": {{topic}}
Headline: {{headline}}
Source: {{source}}
Published: {{published_at}}
Reply with JSON only: {"eligible": true or false, "reasoning": "<one sentence>", "company": "<main company in the headline, or null>"}"#;

/// Judge backed by the generative text service.
pub struct AiEligibilityJudge {
    text: DynText,
    retry: RetryPolicy,
    template: PromptTemplate,
}

impl AiEligibilityJudge {
    pub fn new(text: DynText, retry: RetryPolicy) -> Self {
        Self {
            text,
            retry,
            template: PromptTemplate::new("slot-eligibility", JUDGE_PROMPT),
        }
    }
}

#[async_trait]
impl EligibilityJudge for AiEligibilityJudge {
    async fn judge(&self, rule: &SlotRule, candidate: &Candidate) -> Result<Judgment> {
        let slot = rule.slot.to_string();
        let published = candidate.published_at.to_rfc3339();
        let prompt = self.template.render(&[
            ("slot", slot.as_str()),
            ("name", rule.name.as_str()),
            ("topic", rule.topic.as_str()),
            ("headline", candidate.title.as_str()),
            ("source", candidate.source.as_str()),
            ("published_at", published.as_str()),
        ])?;
        let mut j: Judgment =
            generate_json(self.text.as_ref(), &self.retry, "classify.judge", &prompt).await?;
        j.reasoning = crate::ai::sanitize_line(&j.reasoning, 240);
        j.company = j
            .company
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty() && !c.eq_ignore_ascii_case("null"));
        Ok(j)
    }
}

/// Case-insensitive, word-bounded match against flagship company names.
#[derive(Debug, Clone)]
pub struct FlagshipMatcher {
    names: Vec<String>,
    re: Option<Regex>,
}

impl FlagshipMatcher {
    pub fn new(names: &[String]) -> Result<Self> {
        let names: Vec<String> = names
            .iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            return Ok(Self { names, re: None });
        }
        let alts: Vec<String> = names.iter().map(|n| regex::escape(n)).collect();
        let re = Regex::new(&format!(r"(?i)\b(?:{})\b", alts.join("|")))
            .map_err(|e| PipelineError::Config(format!("flagship names: {e}")))?;
        Ok(Self { names, re: Some(re) })
    }

    /// Canonical name of the first flagship company mentioned.
    pub fn find(&self, headline: &str) -> Option<String> {
        let m = self.re.as_ref()?.find(headline)?;
        let hit = m.as_str();
        self.names
            .iter()
            .find(|n| n.eq_ignore_ascii_case(hit))
            .cloned()
            .or_else(|| Some(hit.to_string()))
    }
}

/// Verdict for one (candidate, slot) pair plus what it cost.
#[derive(Debug, Clone)]
struct Evaluated {
    record: EligibilityRecord,
    company: Option<String>,
    outcome: &'static str,
    failed: bool,
}

pub struct Classifier {
    judge: Arc<dyn EligibilityJudge>,
    rules: SlotRules,
    flagship: FlagshipMatcher,
}

/// Result of classifying one batch.
#[derive(Debug, Clone, Default)]
pub struct ClassifyOutcome {
    pub records: Vec<EligibilityRecord>,
    /// Company per fingerprint, from the first slot whose judge named one.
    pub companies: HashMap<String, Option<String>>,
    pub summary: JobSummary,
    pub errors: Vec<String>,
}

impl Classifier {
    pub fn new(judge: Arc<dyn EligibilityJudge>, rules: SlotRules, flagship: FlagshipMatcher) -> Self {
        Self {
            judge,
            rules,
            flagship,
        }
    }

    pub fn rules(&self) -> &SlotRules {
        &self.rules
    }

    async fn evaluate(&self, rule: &SlotRule, c: &Candidate, now: DateTime<Utc>) -> Evaluated {
        let record = |eligible: bool, reasoning: String| EligibilityRecord {
            candidate_fingerprint: c.fingerprint.clone(),
            slot: rule.slot,
            eligible,
            reasoning,
        };

        if c.older_than(rule.max_age_hours, now) {
            let age = c.age_hours(now);
            return Evaluated {
                record: record(
                    false,
                    format!("stale: published {age}h ago, slot window is {}h", rule.max_age_hours),
                ),
                company: None,
                outcome: "stale",
                failed: false,
            };
        }

        let verdict = self.judge.judge(rule, c).await;
        let flagship = if rule.flagship {
            self.flagship.find(&c.title)
        } else {
            None
        };

        match (verdict, flagship) {
            (Ok(j), None) => Evaluated {
                outcome: if j.eligible { "eligible" } else { "ineligible" },
                record: record(j.eligible, j.reasoning),
                company: j.company,
                failed: false,
            },
            (Ok(j), Some(name)) => Evaluated {
                record: record(true, format!("{}; flagship override: mentions {name}", j.reasoning)),
                company: j.company.or(Some(name)),
                outcome: "flagship_override",
                failed: false,
            },
            (Err(e), Some(name)) => {
                tracing::warn!(target: "classify", slot = %rule.slot, fingerprint = %c.fingerprint, error = %e, "judgment failed, flagship override applies");
                Evaluated {
                    record: record(true, format!("judgment failed ({e}); flagship override: mentions {name}")),
                    company: Some(name),
                    outcome: "flagship_override",
                    failed: true,
                }
            }
            (Err(e), None) => {
                tracing::warn!(target: "classify", slot = %rule.slot, fingerprint = %c.fingerprint, error = %e, "judgment failed");
                Evaluated {
                    record: record(false, format!("judgment failed: {e}")),
                    company: None,
                    outcome: "failed",
                    failed: true,
                }
            }
        }
    }

    async fn classify_slot(&self, rule: &SlotRule, candidates: &[Candidate], now: DateTime<Utc>) -> Vec<Evaluated> {
        let evaluations: Vec<_> = candidates.iter().map(|c| self.evaluate(rule, c, now)).collect();
        stream::iter(evaluations)
            .buffered(PER_SLOT_CONCURRENCY)
            .collect()
            .await
    }

    /// Judge every candidate against all five slots.
    pub async fn classify(&self, candidates: &[Candidate], now: DateTime<Utc>) -> ClassifyOutcome {
        let per_slot = join_all(
            self.rules
                .iter()
                .map(|rule| self.classify_slot(rule, candidates, now)),
        )
        .await;

        let mut out = ClassifyOutcome::default();
        for c in candidates {
            out.companies.insert(c.fingerprint.clone(), None);
        }
        // slot order: the first slot that named a company wins
        for evaluated in per_slot {
            for ev in evaluated {
                counter!("classify_judgments_total", "outcome" => ev.outcome).increment(1);
                out.summary.incr(ev.outcome, 1);
                if ev.failed {
                    out.summary.incr("failed_judgments", 1);
                    out.errors.push(format!(
                        "slot {} / {}: {}",
                        ev.record.slot, ev.record.candidate_fingerprint, ev.record.reasoning
                    ));
                }
                if let Some(company) = ev.company {
                    let slot_company = out
                        .companies
                        .entry(ev.record.candidate_fingerprint.clone())
                        .or_insert(None);
                    if slot_company.is_none() {
                        *slot_company = Some(company);
                    }
                }
                out.records.push(ev.record);
            }
        }
        out.summary.set("candidates", candidates.len() as u64);
        out
    }

    /// Classify everything not yet classified, persist verdicts and annotate
    /// the candidates.
    pub async fn run(&self, repo: &Repository, now: DateTime<Utc>, ctx: &JobContext) -> Result<JobSummary> {
        let pending: Vec<Stored<Candidate>> = repo.unclassified_candidates().await?;
        if pending.is_empty() {
            tracing::info!(target: "classify", "nothing to classify");
            return Ok(JobSummary::new());
        }
        ctx.checkpoint()?;

        let candidates: Vec<Candidate> = pending.iter().map(|s| s.value.clone()).collect();
        let outcome = self.classify(&candidates, now).await;
        for e in &outcome.errors {
            ctx.record_error(e.clone());
        }
        ctx.checkpoint()?;

        repo.save_eligibility(&outcome.records).await?;
        let notes = pending
            .iter()
            .map(|s| CandidateAnnotation {
                record_id: s.id.clone(),
                company: outcome
                    .companies
                    .get(&s.value.fingerprint)
                    .cloned()
                    .flatten(),
                classified_at: now,
            })
            .collect();
        repo.annotate_candidates(notes).await?;

        tracing::info!(
            target: "classify",
            candidates = candidates.len(),
            verdicts = outcome.records.len(),
            failed = outcome.summary.get("failed_judgments"),
            "classification finished"
        );
        Ok(outcome.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedJudge {
        eligible: bool,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EligibilityJudge for FixedJudge {
        async fn judge(&self, _rule: &SlotRule, _c: &Candidate) -> Result<Judgment> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PipelineError::Malformed("not json".into()));
            }
            Ok(Judgment {
                eligible: self.eligible,
                reasoning: "fixed".into(),
                company: None,
            })
        }
    }

    fn candidate(title: &str, age_hours: i64, now: DateTime<Utc>) -> Candidate {
        Candidate {
            fingerprint: crate::fingerprint::fingerprint(None, Some(title)).unwrap(),
            title: title.into(),
            url: None,
            source: "Wire".into(),
            published_at: now - Duration::hours(age_hours),
            ingested_at: now,
            company: None,
            classified_at: None,
        }
    }

    fn classifier(judge: Arc<FixedJudge>) -> Classifier {
        Classifier::new(
            judge,
            SlotRules::default_seed(),
            FlagshipMatcher::new(&["Nvidia".to_string(), "Apple".to_string()]).unwrap(),
        )
    }

    fn verdict(out: &ClassifyOutcome, fp: &str, slot: u8) -> EligibilityRecord {
        out.records
            .iter()
            .find(|r| r.candidate_fingerprint == fp && r.slot.number() == slot)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn stale_candidates_skip_the_judge() {
        let now = Utc::now();
        let judge = Arc::new(FixedJudge { eligible: true, fail: false, calls: AtomicUsize::new(0) });
        let c = candidate("Old news", 100, now);
        let out = classifier(judge.clone()).classify(&[c.clone()], now).await;

        assert_eq!(out.records.len(), 5);
        // 100h is outside the 24h/48h windows (slots 1, 2, 4), inside 168h (3, 5)
        assert_eq!(judge.calls.load(Ordering::SeqCst), 2);
        assert!(!verdict(&out, &c.fingerprint, 1).eligible);
        assert!(verdict(&out, &c.fingerprint, 1).reasoning.starts_with("stale"));
        assert!(verdict(&out, &c.fingerprint, 3).eligible);
        assert_eq!(out.summary.get("stale"), 3);
    }

    #[tokio::test]
    async fn flagship_override_is_unioned_with_the_judge() {
        let now = Utc::now();
        let judge = Arc::new(FixedJudge { eligible: false, fail: false, calls: AtomicUsize::new(0) });
        let c = candidate("NVIDIA unveils new chip", 1, now);
        let out = classifier(judge).classify(&[c.clone()], now).await;

        let slot2 = verdict(&out, &c.fingerprint, 2);
        assert!(slot2.eligible);
        assert!(slot2.reasoning.contains("fixed"));
        assert!(slot2.reasoning.contains("flagship override: mentions Nvidia"));
        assert!(!verdict(&out, &c.fingerprint, 1).eligible);
        assert_eq!(out.companies[&c.fingerprint].as_deref(), Some("Nvidia"));
    }

    #[tokio::test]
    async fn word_boundaries_are_respected() {
        let m = FlagshipMatcher::new(&["Apple".to_string()]).unwrap();
        assert_eq!(m.find("apple shares climb").as_deref(), Some("Apple"));
        assert!(m.find("Pineapples are up").is_none());
        assert!(FlagshipMatcher::new(&[]).unwrap().find("Apple").is_none());
    }

    #[tokio::test]
    async fn failed_judgments_are_isolated() {
        let now = Utc::now();
        let judge = Arc::new(FixedJudge { eligible: true, fail: true, calls: AtomicUsize::new(0) });
        let cands = vec![candidate("Apple earnings", 1, now), candidate("Quiet day", 1, now)];
        let out = classifier(judge).classify(&cands, now).await;

        assert_eq!(out.records.len(), 10);
        assert_eq!(out.summary.get("failed_judgments"), 10);
        // the override still applies when the judge fails
        assert!(verdict(&out, &cands[0].fingerprint, 2).eligible);
        assert!(!verdict(&out, &cands[1].fingerprint, 2).eligible);
        assert!(!verdict(&out, &cands[0].fingerprint, 1).eligible);
    }
}
