// src/select/mod.rs
//! Sequential slot selection.
//!
//! Slots are filled strictly in order 1..=5. A [`SelectionState`] is folded
//! over the slots: each winner is persisted first and only then committed into
//! the state, so the persisted `SelectedSlot` rows are always a prefix-safe
//! recovery point. A rerun for the same issue folds those rows back in and
//! only evaluates the slots that are still open.

pub mod headlines;
pub mod rank;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;

use crate::classify::{SlotRule, SlotRules};
use crate::config::SelectionConfig;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::jobs::{JobContext, JobSummary};
use crate::model::{Candidate, SelectedSlot, Slot};
use crate::store::Repository;

pub use headlines::{HeadlineMatcher, SimilarHeadlines};
pub use rank::{AiRankingDelegate, CredibilityRanker, RankPick, RankingDelegate};

fn norm_key(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
}

/// Exclusion state for one issue's selection run.
///
/// Empty or missing companies/sources never collide with anything.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionState {
    chosen_by_slot: BTreeMap<Slot, String>,
    chosen_companies: HashSet<String>,
    chosen_sources: HashMap<String, usize>,
    /// Newest first.
    recent_headlines: Vec<String>,
    source_cap: usize,
    headline_cap: usize,
}

impl SelectionState {
    pub fn new(source_cap: usize, headline_cap: usize) -> Self {
        Self {
            chosen_by_slot: BTreeMap::new(),
            chosen_companies: HashSet::new(),
            chosen_sources: HashMap::new(),
            recent_headlines: Vec::new(),
            source_cap,
            headline_cap,
        }
    }

    /// Seed the duplicate window with headlines from earlier issues, newest first.
    pub fn seed_headlines<I>(mut self, headlines: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        for h in headlines {
            if self.recent_headlines.len() >= self.headline_cap {
                break;
            }
            self.recent_headlines.push(h);
        }
        self
    }

    pub fn contains_fingerprint(&self, fingerprint: &str) -> bool {
        self.chosen_by_slot.values().any(|f| f == fingerprint)
    }

    pub fn company_taken(&self, company: Option<&str>) -> bool {
        norm_key(company).is_some_and(|c| self.chosen_companies.contains(&c))
    }

    pub fn source_full(&self, source: Option<&str>) -> bool {
        norm_key(source)
            .and_then(|s| self.chosen_sources.get(&s).copied())
            .is_some_and(|n| n >= self.source_cap)
    }

    /// Chosen companies, sorted.
    pub fn companies(&self) -> Vec<String> {
        let mut out: Vec<String> = self.chosen_companies.iter().cloned().collect();
        out.sort();
        out
    }

    pub fn recent_headlines(&self) -> &[String] {
        &self.recent_headlines
    }

    pub fn chosen(&self) -> &BTreeMap<Slot, String> {
        &self.chosen_by_slot
    }

    pub fn commit(mut self, sel: &SelectedSlot) -> Self {
        self.chosen_by_slot.insert(sel.slot, sel.fingerprint.clone());
        if let Some(c) = norm_key(sel.company.as_deref()) {
            self.chosen_companies.insert(c);
        }
        if let Some(s) = norm_key(sel.source.as_deref()) {
            *self.chosen_sources.entry(s).or_insert(0) += 1;
        }
        self.recent_headlines.insert(0, sel.headline.clone());
        self.recent_headlines.truncate(self.headline_cap);
        self
    }
}

/// What happened to one slot in a selection run.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotOutcome {
    Filled(SelectedSlot),
    /// Already persisted by an earlier run of the same issue.
    Resumed(SelectedSlot),
    /// Nothing left after filtering. Not an error.
    Empty { reason: String },
    Failed { error: String },
}

impl SlotOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotOutcome::Filled(_) => "filled",
            SlotOutcome::Resumed(_) => "resumed",
            SlotOutcome::Empty { .. } => "empty",
            SlotOutcome::Failed { .. } => "failed",
        }
    }

    pub fn selected(&self) -> Option<&SelectedSlot> {
        match self {
            SlotOutcome::Filled(s) | SlotOutcome::Resumed(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectionReport {
    pub issue_id: String,
    pub outcomes: BTreeMap<Slot, SlotOutcome>,
    pub state: SelectionState,
    pub summary: JobSummary,
}

impl SelectionReport {
    /// Winners in slot order.
    pub fn selected(&self) -> Vec<&SelectedSlot> {
        self.outcomes.values().filter_map(SlotOutcome::selected).collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter_map(|(slot, o)| match o {
                SlotOutcome::Failed { error } => Some(format!("slot {slot}: {error}")),
                _ => None,
            })
            .collect()
    }
}

/// Durable write of a winner. Must succeed before the state moves on.
#[async_trait]
pub trait SelectionSink: Send + Sync {
    async fn persist(&self, sel: &SelectedSlot) -> Result<()>;
}

#[async_trait]
impl SelectionSink for Repository {
    async fn persist(&self, sel: &SelectedSlot) -> Result<()> {
        self.insert_selected_slot(sel).await
    }
}

/// Inputs gathered from the store for one run.
#[derive(Debug, Clone, Default)]
pub struct SelectionInputs {
    pub pools: BTreeMap<Slot, Vec<Candidate>>,
    /// Rows already persisted for this issue.
    pub existing: Vec<SelectedSlot>,
    /// Headlines of recent earlier issues, newest first.
    pub recent_headlines: Vec<String>,
}

pub struct Selector {
    ranker: Arc<dyn RankingDelegate>,
    matcher: Arc<dyn HeadlineMatcher>,
    sink: Arc<dyn SelectionSink>,
    rules: SlotRules,
    config: SelectionConfig,
}

enum Fill {
    Picked(SelectedSlot),
    Exhausted(String),
}

impl Selector {
    pub fn new(
        ranker: Arc<dyn RankingDelegate>,
        matcher: Arc<dyn HeadlineMatcher>,
        sink: Arc<dyn SelectionSink>,
        rules: SlotRules,
        config: SelectionConfig,
    ) -> Self {
        Self {
            ranker,
            matcher,
            sink,
            rules,
            config,
        }
    }

    /// Fold over slots 1..=5.
    pub async fn select(
        &self,
        issue_id: &str,
        inputs: SelectionInputs,
        ctx: &JobContext,
        now: DateTime<Utc>,
    ) -> Result<SelectionReport> {
        let SelectionInputs {
            mut pools,
            mut existing,
            recent_headlines,
        } = inputs;

        let mut state = SelectionState::new(self.config.source_cap, self.config.recent_headline_cap)
            .seed_headlines(recent_headlines);
        let mut outcomes = BTreeMap::new();
        let mut summary = JobSummary::new();

        existing.retain(|s| s.issue_id == issue_id);
        existing.sort_by_key(|s| s.slot);
        // Rows are written in slot order, so nothing may land below the last one.
        let last_persisted = existing.last().map(|s| s.slot);
        for sel in existing {
            state = state.commit(&sel);
            outcomes.insert(sel.slot, SlotOutcome::Resumed(sel));
        }

        for rule in self.rules.iter() {
            if outcomes.contains_key(&rule.slot) {
                counter!("select_slots_total", "outcome" => "resumed").increment(1);
                summary.incr("resumed", 1);
                continue;
            }
            if last_persisted.is_some_and(|last| rule.slot < last) {
                tracing::info!(target: "select", issue_id, slot = %rule.slot, "slot frozen behind a later persisted slot");
                let outcome = SlotOutcome::Empty {
                    reason: "later slot already persisted".into(),
                };
                counter!("select_slots_total", "outcome" => outcome.as_str()).increment(1);
                summary.incr("frozen", 1);
                outcomes.insert(rule.slot, outcome);
                continue;
            }
            ctx.checkpoint()?;

            let pool = pools.remove(&rule.slot).unwrap_or_default();
            let outcome = match self.fill_slot(issue_id, rule, pool, &state, now, &mut summary).await {
                Ok(Fill::Picked(sel)) => match self.sink.persist(&sel).await {
                    Ok(()) => {
                        state = state.commit(&sel);
                        tracing::info!(
                            target: "select",
                            issue_id,
                            slot = %rule.slot,
                            fingerprint = %sel.fingerprint,
                            company = sel.company.as_deref().unwrap_or("-"),
                            source = sel.source.as_deref().unwrap_or("-"),
                            "slot filled"
                        );
                        SlotOutcome::Filled(sel)
                    }
                    Err(e) => {
                        tracing::error!(target: "select", issue_id, slot = %rule.slot, error = %e, "persisting winner failed");
                        SlotOutcome::Failed {
                            error: format!("persist: {e}"),
                        }
                    }
                },
                Ok(Fill::Exhausted(reason)) => {
                    tracing::info!(target: "select", issue_id, slot = %rule.slot, %reason, "slot left empty");
                    SlotOutcome::Empty { reason }
                }
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => {
                    tracing::warn!(target: "select", issue_id, slot = %rule.slot, error = %e, "slot failed");
                    SlotOutcome::Failed { error: e.to_string() }
                }
            };
            counter!("select_slots_total", "outcome" => outcome.as_str()).increment(1);
            summary.incr(outcome.as_str(), 1);
            if let SlotOutcome::Failed { error } = &outcome {
                ctx.record_error(format!("slot {}: {error}", rule.slot));
            }
            outcomes.insert(rule.slot, outcome);
        }

        Ok(SelectionReport {
            issue_id: issue_id.to_string(),
            outcomes,
            state,
            summary,
        })
    }

    /// Pool minus everything the current state excludes.
    fn filter_pool(&self, pool: Vec<Candidate>, state: &SelectionState, summary: &mut JobSummary) -> Vec<Candidate> {
        let mut seen = HashSet::new();
        pool.into_iter()
            .filter(|c| {
                if !seen.insert(c.fingerprint.clone()) || state.contains_fingerprint(&c.fingerprint) {
                    summary.incr("excluded_chosen", 1);
                    return false;
                }
                if self.matcher.is_duplicate(&c.title, state.recent_headlines()) {
                    summary.incr("excluded_duplicate_headline", 1);
                    return false;
                }
                if state.company_taken(c.company.as_deref()) {
                    summary.incr("excluded_company", 1);
                    return false;
                }
                if state.source_full(Some(&c.source)) {
                    summary.incr("excluded_source_cap", 1);
                    return false;
                }
                true
            })
            .collect()
    }

    async fn fill_slot(
        &self,
        issue_id: &str,
        rule: &SlotRule,
        pool: Vec<Candidate>,
        state: &SelectionState,
        now: DateTime<Utc>,
        summary: &mut JobSummary,
    ) -> Result<Fill> {
        if pool.is_empty() {
            return Ok(Fill::Exhausted("no eligible candidates".into()));
        }
        let offered = pool.len();
        let mut pool = self.filter_pool(pool, state, summary);
        if pool.is_empty() {
            return Ok(Fill::Exhausted(format!(
                "all {offered} eligible candidates excluded"
            )));
        }

        while !pool.is_empty() {
            let pick = self.ranker.rank(rule, &pool, state).await?;
            let Some(idx) = pool.iter().position(|c| c.fingerprint == pick.fingerprint) else {
                return Err(PipelineError::Malformed(format!(
                    "ranking picked {} which is not in the pool",
                    pick.fingerprint
                )));
            };
            let winner = pool.swap_remove(idx);
            let company = norm_key(pick.company.as_deref())
                .and(pick.company.clone())
                .or_else(|| winner.company.clone());
            let source = norm_key(pick.source.as_deref())
                .and(pick.source.clone())
                .or_else(|| Some(winner.source.clone()));

            if state.company_taken(company.as_deref()) || state.source_full(source.as_deref()) {
                tracing::debug!(target: "select", slot = %rule.slot, fingerprint = %winner.fingerprint, "pick violates caps, re-ranking");
                summary.incr("cap_rejections", 1);
                continue;
            }

            return Ok(Fill::Picked(SelectedSlot {
                issue_id: issue_id.to_string(),
                slot: rule.slot,
                fingerprint: winner.fingerprint,
                headline: winner.title,
                company,
                source,
                reasoning: pick.reasoning,
                selected_at: now,
            }));
        }
        Ok(Fill::Exhausted("every pick violated the company or source caps".into()))
    }

    /// Gather pools, existing rows and the recent-headline window from the
    /// store, then select.
    pub async fn run(
        &self,
        repo: &Repository,
        issue_id: &str,
        ctx: &JobContext,
        now: DateTime<Utc>,
    ) -> Result<SelectionReport> {
        let inputs = load_inputs(repo, &self.rules, &self.config, issue_id, now).await?;
        ctx.checkpoint()?;
        let report = self.select(issue_id, inputs, ctx, now).await?;
        tracing::info!(
            target: "select",
            issue_id,
            filled = report.selected().len(),
            failed = report.summary.get("failed"),
            "selection finished"
        );
        Ok(report)
    }
}

/// Build the per-slot pools: candidates eligible for the slot, still inside
/// its freshness window, never selected by another issue in the recent
/// window.
pub async fn load_inputs(
    repo: &Repository,
    rules: &SlotRules,
    config: &SelectionConfig,
    issue_id: &str,
    now: DateTime<Utc>,
) -> Result<SelectionInputs> {
    let existing = repo.selected_slots(issue_id).await?;
    let recent: Vec<SelectedSlot> = repo
        .recent_selected(now - Duration::days(config.recent_headline_days))
        .await?
        .into_iter()
        .filter(|s| s.issue_id != issue_id)
        .collect();
    let used: HashSet<&str> = recent.iter().map(|s| s.fingerprint.as_str()).collect();

    let candidates: HashMap<String, Candidate> = repo
        .candidates()
        .await?
        .into_iter()
        .map(|s| (s.value.fingerprint.clone(), s.value))
        .collect();

    let mut pools = BTreeMap::new();
    for rule in rules.iter() {
        let mut seen = HashSet::new();
        let pool: Vec<Candidate> = repo
            .eligible_for(rule.slot)
            .await?
            .into_iter()
            .filter(|e| seen.insert(e.candidate_fingerprint.clone()))
            .filter(|e| !used.contains(e.candidate_fingerprint.as_str()))
            .filter_map(|e| candidates.get(&e.candidate_fingerprint).cloned())
            .filter(|c| !c.older_than(rule.max_age_hours, now))
            .collect();
        pools.insert(rule.slot, pool);
    }

    Ok(SelectionInputs {
        pools,
        existing,
        recent_headlines: recent.into_iter().map(|s| s.headline).collect(),
    })
}
