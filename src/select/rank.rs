// src/select/rank.rs
//! Ranking delegates: pick one winner out of a slot's filtered pool.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::SelectionState;
use crate::ai::{generate_json, DynText, PromptTemplate, Validate};
use crate::classify::SlotRule;
use crate::error::{PipelineError, Result};
use crate::model::Candidate;
use crate::retry::RetryPolicy;
use crate::source_weights::SourceWeightsConfig;

/// A delegate's choice. `company`/`source` may refine the candidate's own
/// attribution; the selector re-checks caps against them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RankPick {
    pub fingerprint: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    pub reasoning: String,
}

impl Validate for RankPick {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.fingerprint.trim().is_empty() {
            return Err("fingerprint is empty".into());
        }
        if self.reasoning.trim().is_empty() {
            return Err("reasoning is empty".into());
        }
        Ok(())
    }
}

#[async_trait]
pub trait RankingDelegate: Send + Sync {
    /// `pool` is never empty.
    async fn rank(&self, rule: &SlotRule, pool: &[Candidate], state: &SelectionState) -> Result<RankPick>;
}

/// Deterministic: highest source weight, then newest, then lowest fingerprint.
pub struct CredibilityRanker {
    weights: Arc<SourceWeightsConfig>,
}

impl CredibilityRanker {
    pub fn new(weights: Arc<SourceWeightsConfig>) -> Self {
        Self { weights }
    }

    fn order(&self, a: &Candidate, b: &Candidate) -> Ordering {
        let (wa, wb) = (self.weights.weight_for(&a.source), self.weights.weight_for(&b.source));
        wb.partial_cmp(&wa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.published_at.cmp(&a.published_at))
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    }
}

#[async_trait]
impl RankingDelegate for CredibilityRanker {
    async fn rank(&self, rule: &SlotRule, pool: &[Candidate], _state: &SelectionState) -> Result<RankPick> {
        let best = pool
            .iter()
            .min_by(|a, b| self.order(a, b))
            .ok_or_else(|| PipelineError::InvalidInput("empty pool".into()))?;
        Ok(RankPick {
            fingerprint: best.fingerprint.clone(),
            company: best.company.clone(),
            source: Some(best.source.clone()),
            reasoning: format!(
                "slot {}: most credible source ({:.2}) among {} candidates",
                rule.slot,
                self.weights.weight_for(&best.source),
                pool.len()
            ),
        })
    }
}

const RANK_PROMPT: &str = r#"task: slot-ranking
Pick the single best story for newsletter slot {{slot}} "{{name}}": {{topic}}
Companies already featured in this issue: {{companies}}
Candidates (fingerprint | headline | source (credibility) | company | published):
{{candidates}}
Prefer credible sources and fresh, consequential news. Only pick a fingerprint from the list.
Reply with JSON only: {"fingerprint": "...", "company": "<main company or null>", "source": "<source>", "reasoning": "<one sentence>"}"#;

/// Delegate backed by the generative text service.
pub struct AiRankingDelegate {
    text: DynText,
    retry: RetryPolicy,
    weights: Arc<SourceWeightsConfig>,
    template: PromptTemplate,
}

impl AiRankingDelegate {
    pub fn new(text: DynText, retry: RetryPolicy, weights: Arc<SourceWeightsConfig>) -> Self {
        Self {
            text,
            retry,
            weights,
            template: PromptTemplate::new("slot-ranking", RANK_PROMPT),
        }
    }
}

#[async_trait]
impl RankingDelegate for AiRankingDelegate {
    async fn rank(&self, rule: &SlotRule, pool: &[Candidate], state: &SelectionState) -> Result<RankPick> {
        let lines: Vec<String> = pool
            .iter()
            .map(|c| {
                format!(
                    "{} | {} | {} ({:.2}) | {} | {}",
                    c.fingerprint,
                    c.title,
                    c.source,
                    self.weights.weight_for(&c.source),
                    c.company.as_deref().unwrap_or("-"),
                    c.published_at.format("%Y-%m-%d %H:%M")
                )
            })
            .collect();
        let mut companies = state.companies().join(", ");
        if companies.is_empty() {
            companies.push_str("none");
        }
        let slot = rule.slot.to_string();
        let listing = lines.join("\n");
        let prompt = self.template.render(&[
            ("slot", slot.as_str()),
            ("name", rule.name.as_str()),
            ("topic", rule.topic.as_str()),
            ("companies", companies.as_str()),
            ("candidates", listing.as_str()),
        ])?;
        let mut pick: RankPick =
            generate_json(self.text.as_ref(), &self.retry, "select.rank", &prompt).await?;
        pick.fingerprint = pick.fingerprint.trim().to_string();
        pick.reasoning = crate::ai::sanitize_line(&pick.reasoning, 240);
        pick.company = pick
            .company
            .filter(|c| !c.trim().is_empty() && !c.eq_ignore_ascii_case("null"));
        Ok(pick)
    }
}
