// src/issue.rs
//! Issue lifecycle.
//!
//! ```text
//! pending -> selecting -> decorated -> compiled -> sent -> archived
//!    \__________\____________\____________\______-> failed
//! failed --restart--> pending
//! ```
//!
//! Status never moves backwards; the only way out of `failed` is an explicit
//! [`Issue::restart`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Pending,
    Selecting,
    /// Every slot has had its enrichment attempted.
    Decorated,
    /// Artifact built from the decorated stories.
    Compiled,
    Sent,
    Archived,
    Failed,
}

impl IssueStatus {
    pub fn can_transition_to(self, to: IssueStatus) -> bool {
        use IssueStatus::*;
        matches!(
            (self, to),
            (Pending, Selecting)
                | (Selecting, Decorated)
                | (Decorated, Compiled)
                | (Compiled, Sent)
                | (Sent, Archived)
                | (Pending, Failed)
                | (Selecting, Failed)
                | (Decorated, Failed)
                | (Compiled, Failed)
                | (Failed, Pending) // explicit restart
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, IssueStatus::Archived)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IssueStatus::Pending => "pending",
            IssueStatus::Selecting => "selecting",
            IssueStatus::Decorated => "decorated",
            IssueStatus::Compiled => "compiled",
            IssueStatus::Sent => "sent",
            IssueStatus::Archived => "archived",
            IssueStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub issue_id: String,
    pub date: NaiveDate,
    pub status: IssueStatus,
    #[serde(default)]
    pub status_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    pub fn new(date: NaiveDate, now: DateTime<Utc>) -> Self {
        Self {
            issue_id: issue_id_for(date),
            date,
            status: IssueStatus::Pending,
            status_reason: None,
            updated_at: now,
        }
    }

    /// Move to `to`, or fail with [`PipelineError::InvalidTransition`].
    pub fn transition(
        &mut self,
        to: IssueStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if to == IssueStatus::Pending && self.status == IssueStatus::Failed {
            return Err(PipelineError::InvalidTransition {
                from: self.status.to_string(),
                to: "pending (use restart)".into(),
            });
        }
        self.apply(to, reason, now)
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.apply(IssueStatus::Failed, Some(reason.into()), now)
    }

    /// Re-open a failed issue for a fresh run against the same id.
    pub fn restart(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.apply(IssueStatus::Pending, Some("restarted".into()), now)
    }

    fn apply(
        &mut self,
        to: IssueStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        tracing::info!(
            target: "issue",
            issue_id = %self.issue_id,
            from = %self.status,
            to = %to,
            reason = reason.as_deref().unwrap_or(""),
            "issue status change"
        );
        self.status = to;
        self.status_reason = reason;
        self.updated_at = now;
        Ok(())
    }
}

/// One issue per calendar day: `2026-10-17`.
pub fn issue_id_for(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
