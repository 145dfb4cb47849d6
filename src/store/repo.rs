// src/store/repo.rs
//! Typed access to the pipeline tables on top of any [`RecordStore`].
//!
//! Every call goes through the shared [`RetryPolicy`], so a dropped store
//! connection is retried with backoff before it surfaces as fatal.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use super::{create_chunked, create_keyed, to_fields, update_chunked, Fields, Filter, Record, RecordStore};
use crate::error::{PipelineError, Result};
use crate::issue::Issue;
use crate::jobs::{JobRecord, JobSink};
use crate::model::{Candidate, DecoratedStory, EligibilityRecord, SelectedSlot, Slot};
use crate::retry::RetryPolicy;

pub mod tables {
    pub const CANDIDATES: &str = "candidates";
    pub const ELIGIBILITY: &str = "eligibility";
    pub const SELECTED_SLOTS: &str = "selected_slots";
    pub const STORIES: &str = "stories";
    pub const ISSUES: &str = "issues";
    pub const JOBS: &str = "jobs";
}

/// A decoded row plus the store id needed to update it.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub id: String,
    pub value: T,
}

/// Classification annotations written back onto a candidate row.
#[derive(Debug, Clone)]
pub struct CandidateAnnotation {
    pub record_id: String,
    pub company: Option<String>,
    pub classified_at: DateTime<Utc>,
}

pub struct Repository {
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
    job_ids: Mutex<HashMap<String, String>>,
}

impl Repository {
    pub fn new(store: Arc<dyn RecordStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            job_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    async fn list(&self, table: &str, filter: Filter) -> Result<Vec<Record>> {
        self.retry
            .run("store.list_records", || {
                self.store.list_records(table, &filter)
            })
            .await
    }

    async fn list_as<T: DeserializeOwned>(&self, table: &str, filter: Filter) -> Result<Vec<Stored<T>>> {
        self.list(table, filter)
            .await?
            .into_iter()
            .map(|r| {
                Ok(Stored {
                    value: r.decode()?,
                    id: r.id,
                })
            })
            .collect()
    }

    /// Single create keyed by `key`; a retry never stores the row twice.
    async fn create<T: Serialize>(&self, table: &str, key: &[&str], value: &T) -> Result<Record> {
        let fields = to_fields(value)?;
        create_keyed(self.store.as_ref(), &self.retry, table, key, std::slice::from_ref(&fields))
            .await?
            .pop()
            .ok_or_else(|| PipelineError::Malformed(format!("{table}: create returned no row")))
    }

    async fn update(&self, table: &str, id: &str, fields: Fields) -> Result<Record> {
        self.retry
            .run("store.update_record", || {
                self.store.update_record(table, id, fields.clone())
            })
            .await
    }

    // ---- candidates ----

    /// Every fingerprint ever stored. Loaded once per ingestion run.
    pub async fn load_fingerprints(&self) -> Result<HashSet<String>> {
        let rows = self.list(tables::CANDIDATES, Filter::all()).await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.str_field("fingerprint").map(str::to_string))
            .collect())
    }

    pub async fn insert_candidates(&self, candidates: &[Candidate]) -> Result<usize> {
        let rows = candidates
            .iter()
            .map(|c| {
                let mut f = to_fields(c)?;
                f.insert("classified".into(), Value::Bool(c.classified_at.is_some()));
                Ok(f)
            })
            .collect::<Result<Vec<_>>>()?;
        let created = create_chunked(self.store.as_ref(), &self.retry, tables::CANDIDATES, &["fingerprint"], rows).await?;
        Ok(created.len())
    }

    pub async fn candidates(&self) -> Result<Vec<Stored<Candidate>>> {
        self.list_as(tables::CANDIDATES, Filter::all()).await
    }

    pub async fn unclassified_candidates(&self) -> Result<Vec<Stored<Candidate>>> {
        self.list_as(tables::CANDIDATES, Filter::all().eq("classified", false))
            .await
    }

    pub async fn annotate_candidates(&self, notes: Vec<CandidateAnnotation>) -> Result<usize> {
        let rows = notes
            .into_iter()
            .map(|n| {
                let fields = json!({
                    "company": n.company,
                    "classified_at": n.classified_at,
                    "classified": true,
                });
                Ok((n.record_id, to_fields(&fields)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let updated = update_chunked(self.store.as_ref(), &self.retry, tables::CANDIDATES, rows).await?;
        Ok(updated.len())
    }

    // ---- eligibility ----

    pub async fn save_eligibility(&self, records: &[EligibilityRecord]) -> Result<usize> {
        let rows = records.iter().map(to_fields).collect::<Result<Vec<_>>>()?;
        let created = create_chunked(
            self.store.as_ref(),
            &self.retry,
            tables::ELIGIBILITY,
            &["candidate_fingerprint", "slot"],
            rows,
        ).await?;
        Ok(created.len())
    }

    pub async fn eligible_for(&self, slot: Slot) -> Result<Vec<EligibilityRecord>> {
        let rows: Vec<Stored<EligibilityRecord>> = self
            .list_as(
                tables::ELIGIBILITY,
                Filter::all().eq("slot", slot.number()).eq("eligible", true),
            )
            .await?;
        Ok(rows.into_iter().map(|s| s.value).collect())
    }

    // ---- selection ----

    /// Persisted winners for an issue, in slot order.
    pub async fn selected_slots(&self, issue_id: &str) -> Result<Vec<SelectedSlot>> {
        let mut rows: Vec<SelectedSlot> = self
            .list_as::<SelectedSlot>(tables::SELECTED_SLOTS, Filter::all().eq("issue_id", issue_id))
            .await?
            .into_iter()
            .map(|s| s.value)
            .collect();
        rows.sort_by_key(|s| s.slot);
        Ok(rows)
    }

    /// Winners selected at or after `since`, newest first, any issue.
    pub async fn recent_selected(&self, since: DateTime<Utc>) -> Result<Vec<SelectedSlot>> {
        let mut rows: Vec<SelectedSlot> = self
            .list_as::<SelectedSlot>(tables::SELECTED_SLOTS, Filter::all())
            .await?
            .into_iter()
            .map(|s| s.value)
            .filter(|s| s.selected_at >= since)
            .collect();
        rows.sort_by(|a, b| b.selected_at.cmp(&a.selected_at));
        Ok(rows)
    }

    /// Write-once: a second write for the same (issue, slot) is rejected
    /// unless it is the identical pick (replayed after a crash).
    pub async fn insert_selected_slot(&self, sel: &SelectedSlot) -> Result<()> {
        let existing = self
            .list(
                tables::SELECTED_SLOTS,
                Filter::all()
                    .eq("issue_id", sel.issue_id.as_str())
                    .eq("slot", sel.slot.number()),
            )
            .await?;
        if let Some(prev) = existing.first() {
            if prev.str_field("fingerprint") == Some(sel.fingerprint.as_str()) {
                return Ok(());
            }
            return Err(PipelineError::Fatal(format!(
                "slot {} of issue {} is already filled",
                sel.slot, sel.issue_id
            )));
        }
        self.create(tables::SELECTED_SLOTS, &["issue_id", "slot"], sel).await?;
        Ok(())
    }

    // ---- stories ----

    pub async fn stories(&self, issue_id: &str) -> Result<Vec<Stored<DecoratedStory>>> {
        let mut rows: Vec<Stored<DecoratedStory>> = self
            .list_as(tables::STORIES, Filter::all().eq("issue_id", issue_id))
            .await?;
        rows.sort_by_key(|s| s.value.slot);
        Ok(rows)
    }

    pub async fn create_story(&self, story: &DecoratedStory) -> Result<Stored<DecoratedStory>> {
        let rec = self.create(tables::STORIES, &["issue_id", "slot"], story).await?;
        Ok(Stored {
            id: rec.id,
            value: story.clone(),
        })
    }

    /// Persist only the named fields of a story (one enrichment stage's output).
    pub async fn update_story_fields(&self, id: &str, fields: Value) -> Result<()> {
        let fields = to_fields(&fields)?;
        self.update(tables::STORIES, id, fields).await?;
        Ok(())
    }

    // ---- issues ----

    pub async fn issue(&self, issue_id: &str) -> Result<Option<Stored<Issue>>> {
        let mut rows: Vec<Stored<Issue>> = self
            .list_as(tables::ISSUES, Filter::all().eq("issue_id", issue_id).limit(1))
            .await?;
        Ok(rows.pop())
    }

    pub async fn create_issue(&self, issue: &Issue) -> Result<Stored<Issue>> {
        let rec = self.create(tables::ISSUES, &["issue_id"], issue).await?;
        Ok(Stored {
            id: rec.id,
            value: issue.clone(),
        })
    }

    pub async fn save_issue(&self, stored: &Stored<Issue>) -> Result<()> {
        let fields = to_fields(&stored.value)?;
        self.update(tables::ISSUES, &stored.id, fields).await?;
        Ok(())
    }

    // ---- jobs ----

    pub async fn job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let mut rows: Vec<Stored<JobRecord>> = self
            .list_as(tables::JOBS, Filter::all().eq("job_id", job_id).limit(1))
            .await?;
        Ok(rows.pop().map(|s| s.value))
    }

    fn cached_job_id(&self, job_id: &str) -> Option<String> {
        self.job_ids.lock().ok()?.get(job_id).cloned()
    }
}

#[async_trait]
impl JobSink for Repository {
    /// Upsert keyed by `job_id`.
    async fn save_job(&self, job: &JobRecord) -> Result<()> {
        let fields = to_fields(job)?;
        let record_id = match self.cached_job_id(&job.job_id) {
            Some(id) => Some(id),
            None => self
                .list(tables::JOBS, Filter::all().eq("job_id", job.job_id.as_str()).limit(1))
                .await?
                .into_iter()
                .next()
                .map(|r| r.id),
        };
        let saved = match record_id {
            Some(id) => self.update(tables::JOBS, &id, fields).await?,
            None => self.create(tables::JOBS, &["job_id"], &fields).await?,
        };
        if let Ok(mut ids) = self.job_ids.lock() {
            // A finished record is never written again.
            if job.status.is_finished() {
                ids.remove(&job.job_id);
            } else {
                ids.insert(job.job_id.clone(), saved.id);
            }
        }
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.job(job_id).await
    }
}
