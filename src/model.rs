// src/model.rs
//! Records that flow between the pipeline stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// One of the five editorial positions in an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Slot(u8);

impl Slot {
    pub const COUNT: u8 = 5;

    pub fn new(n: u8) -> Result<Self, PipelineError> {
        if (1..=Self::COUNT).contains(&n) {
            Ok(Self(n))
        } else {
            Err(PipelineError::InvalidInput(format!(
                "slot must be 1..={}, got {n}",
                Self::COUNT
            )))
        }
    }

    /// Slots in selection order.
    pub fn all() -> impl Iterator<Item = Slot> {
        (1..=Self::COUNT).map(Slot)
    }

    pub fn number(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Slot {
    type Error = PipelineError;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Slot::new(n)
    }
}

impl From<Slot> for u8 {
    fn from(s: Slot) -> u8 {
        s.0
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A deduplicated item waiting for classification/selection.
///
/// Identity is the fingerprint. Only `company` and `classified_at` change
/// after creation (classification annotations).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub fingerprint: String,
    pub title: String,
    pub url: Option<String>,
    pub source: String,
    pub published_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub classified_at: Option<DateTime<Utc>>,
}

impl Candidate {
    pub fn age_hours(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.published_at).num_hours()
    }

    /// Published more than `max_age_hours` before `now`, to the second.
    pub fn older_than(&self, max_age_hours: i64, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.published_at) > chrono::Duration::hours(max_age_hours)
    }
}

/// Advisory verdict for one (candidate, slot) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EligibilityRecord {
    pub candidate_fingerprint: String,
    pub slot: Slot,
    pub eligible: bool,
    pub reasoning: String,
}

/// Binding choice for one slot of one issue. Written once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectedSlot {
    pub issue_id: String,
    pub slot: Slot,
    pub fingerprint: String,
    pub headline: String,
    pub company: Option<String>,
    pub source: Option<String>,
    pub reasoning: String,
    pub selected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    #[default]
    Pending,
    Generated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    #[default]
    Pending,
    /// Required text stages done; image may still be outstanding.
    TextComplete,
    Failed,
}

/// Publishable copy for one selected slot, filled in stage by stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DecoratedStory {
    pub issue_id: String,
    pub slot: u8,
    pub fingerprint: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub source_excerpt: Option<String>,
    #[serde(default)]
    pub headline: Option<String>,
    #[serde(default)]
    pub dek: Option<String>,
    #[serde(default)]
    pub bullets: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub emphasized: bool,
    #[serde(default)]
    pub image_prompt: Option<String>,
    #[serde(default)]
    pub image_status: ImageStatus,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub image_attempts: u32,
    #[serde(default)]
    pub status: StoryStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl DecoratedStory {
    pub fn for_slot(selected: &SelectedSlot, source_url: Option<String>) -> Self {
        Self {
            issue_id: selected.issue_id.clone(),
            slot: selected.slot.number(),
            fingerprint: selected.fingerprint.clone(),
            source_url,
            ..Self::default()
        }
    }

    pub fn is_structured(&self) -> bool {
        self.headline.is_some() && self.bullets.len() == 3 && self.label.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_bounds_are_enforced() {
        assert!(Slot::new(0).is_err());
        assert!(Slot::new(6).is_err());
        assert_eq!(Slot::new(3).unwrap().number(), 3);
        let order: Vec<u8> = Slot::all().map(Slot::number).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn slot_deserialization_rejects_out_of_range() {
        let ok: Slot = serde_json::from_str("5").unwrap();
        assert_eq!(ok.number(), 5);
        assert!(serde_json::from_str::<Slot>("9").is_err());
    }

    #[test]
    fn freshness_window_counts_minutes_past_the_hour() {
        let now = Utc::now();
        let at = |age: chrono::Duration| Candidate {
            fingerprint: "p_x".into(),
            title: "t".into(),
            url: None,
            source: "Wire".into(),
            published_at: now - age,
            ingested_at: now,
            company: None,
            classified_at: None,
        };
        let late = at(chrono::Duration::hours(24) + chrono::Duration::minutes(59));
        assert_eq!(late.age_hours(now), 24);
        assert!(late.older_than(24, now));
        assert!(!at(chrono::Duration::hours(24)).older_than(24, now));
        assert!(!at(chrono::Duration::hours(23)).older_than(24, now));
    }
}
