// src/jobs/mod.rs
//! Job model for pipeline stages.
//!
//! Every stage of an issue run (ingest, classify, select, ...) executes as one
//! job pulled from a tiered queue by the [`executor::Executor`]. A job runs on
//! exactly one worker, under its own timeout, and its [`JobRecord`] is
//! persisted on enqueue, start and finish.

pub mod executor;
pub mod queue;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PipelineError, Result};

pub use executor::{Executor, ExecutorConfig};
pub use queue::JobQueue;

// ============================================================================
// Enums
// ============================================================================

/// Queue priority. Workers always drain `High` before `Default` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueTier {
    High,
    Default,
    Low,
}

impl QueueTier {
    pub const ALL: [QueueTier; 3] = [QueueTier::High, QueueTier::Default, QueueTier::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueTier::High => "high",
            QueueTier::Default => "default",
            QueueTier::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Classify,
    Select,
    Enrich,
    Images,
    Compile,
    Deliver,
    Archive,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Ingest,
        Stage::Classify,
        Stage::Select,
        Stage::Enrich,
        Stage::Images,
        Stage::Compile,
        Stage::Deliver,
        Stage::Archive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Classify => "classify",
            Stage::Select => "select",
            Stage::Enrich => "enrich",
            Stage::Images => "images",
            Stage::Compile => "compile",
            Stage::Deliver => "deliver",
            Stage::Archive => "archive",
        }
    }

    pub fn default_tier(self) -> QueueTier {
        match self {
            Stage::Ingest | Stage::Classify => QueueTier::Default,
            Stage::Select | Stage::Enrich | Stage::Compile | Stage::Deliver => QueueTier::High,
            Stage::Images | Stage::Archive => QueueTier::Low,
        }
    }

    pub fn default_timeout(self) -> Duration {
        let mins = match self {
            Stage::Ingest => 10,
            Stage::Classify => 15,
            Stage::Select => 10,
            Stage::Enrich => 20,
            Stage::Images => 20,
            Stage::Compile => 2,
            Stage::Deliver => 5,
            Stage::Archive => 1,
        };
        Duration::from_secs(mins * 60)
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PipelineError::NotFound(format!("unknown stage '{s}'")))
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

/// Ordered counter map reported by every stage (`ingested`, `duplicate`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobSummary(BTreeMap<String, u64>);

impl JobSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&mut self, key: &str, by: u64) {
        *self.0.entry(key.to_string()).or_insert(0) += by;
    }

    pub fn set(&mut self, key: &str, value: u64) {
        self.0.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> u64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &JobSummary) {
        for (k, v) in &other.0 {
            self.incr(k, *v);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Parameters accepted by the trigger surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobParams {
    #[serde(default)]
    pub issue_id: Option<String>,
    /// Calendar date of the issue; defaults to today (UTC).
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub tier: Option<QueueTier>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Re-open a failed issue before running the stage.
    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub queue_tier: QueueTier,
    pub stage: Stage,
    pub params: JobParams,
    #[serde(default)]
    pub issue_id: Option<String>,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub summary: JobSummary,
}

impl JobRecord {
    pub fn new(stage: Stage, params: JobParams, now: DateTime<Utc>) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            queue_tier: params.tier.unwrap_or_else(|| stage.default_tier()),
            stage,
            issue_id: params.issue_id.clone(),
            params,
            status: JobStatus::Queued,
            enqueued_at: now,
            started_at: None,
            timeout_at: None,
            finished_at: None,
            errors: Vec::new(),
            summary: JobSummary::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.params
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.stage.default_timeout())
    }
}

// ============================================================================
// Handler contract
// ============================================================================

/// Per-job context handed to a [`StageHandler`].
pub struct JobContext {
    pub job_id: String,
    cancel: CancellationToken,
    errors: Mutex<Vec<String>>,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            job_id: job_id.into(),
            cancel,
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Detached context for direct (non-queued) runs and tests.
    pub fn detached() -> Self {
        Self::new("direct", CancellationToken::new())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stage boundary: bail out with [`PipelineError::Cancelled`] if asked to.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Record an isolated (non-aborting) failure for the job's error list.
    pub fn record_error(&self, msg: impl Into<String>) {
        if let Ok(mut errs) = self.errors.lock() {
            errs.push(msg.into());
        }
    }

    pub fn take_errors(&self) -> Vec<String> {
        self.errors
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(&self, job: &JobRecord, ctx: &JobContext) -> Result<JobSummary>;
}

/// Where job records are persisted. Failures are logged, never fatal.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn save_job(&self, job: &JobRecord) -> Result<()>;

    async fn load_job(&self, job_id: &str) -> Result<Option<JobRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_defaults_match_the_schedule() {
        assert_eq!(Stage::Select.default_tier(), QueueTier::High);
        assert_eq!(Stage::Images.default_tier(), QueueTier::Low);
        assert_eq!(Stage::Ingest.default_tier(), QueueTier::Default);
        assert_eq!(Stage::Enrich.default_timeout(), Duration::from_secs(1200));
        assert_eq!(Stage::Archive.default_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn stage_parse_is_case_insensitive_and_rejects_unknown() {
        assert_eq!("Deliver".parse::<Stage>().unwrap(), Stage::Deliver);
        let err = "publish".parse::<Stage>().unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[test]
    fn params_override_tier_and_timeout() {
        let params = JobParams {
            tier: Some(QueueTier::Low),
            timeout_secs: Some(3),
            ..JobParams::default()
        };
        let rec = JobRecord::new(Stage::Compile, params, Utc::now());
        assert_eq!(rec.queue_tier, QueueTier::Low);
        assert_eq!(rec.timeout(), Duration::from_secs(3));
        assert_eq!(rec.status, JobStatus::Queued);
    }

    #[test]
    fn summary_is_ordered_and_mergeable() {
        let mut a = JobSummary::new();
        a.incr("skipped", 1);
        a.incr("ingested", 2);
        let mut b = JobSummary::new();
        b.incr("ingested", 3);
        a.merge(&b);
        let keys: Vec<&str> = a.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["ingested", "skipped"]);
        assert_eq!(a.get("ingested"), 5);
        assert_eq!(a.get("missing"), 0);
    }
}
