// src/error.rs
//! Error taxonomy shared by every pipeline component.
//!
//! Each error maps onto one [`ErrorKind`], and the kind alone decides what the
//! caller does with it: transient errors are retried by [`crate::retry`],
//! malformed responses skip a single item, fatal errors abort the job.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Coarse classification used by retry and isolation policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller handed us something unusable (empty identity, bad slot number).
    InvalidInput,
    /// Network timeout, dropped connection, 5xx/429. Worth retrying.
    Transient,
    /// Collaborator answered, but not with what the schema requires.
    Malformed,
    /// Missing configuration, store unreachable after retries, illegal state.
    Fatal,
    /// Cancellation observed at a stage boundary.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: String, after: Duration },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("store error (status {status}): {message}")]
    Store { status: u16, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("illegal issue transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled")]
    Cancelled,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidInput(_) => ErrorKind::InvalidInput,
            PipelineError::Transient(_) | PipelineError::Timeout { .. } => ErrorKind::Transient,
            PipelineError::Malformed(_) => ErrorKind::Malformed,
            PipelineError::Store { status, .. } => {
                if *status == 429 || *status >= 500 {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Fatal
                }
            }
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::Config(_)
            | PipelineError::InvalidTransition { .. }
            | PipelineError::NotFound(_)
            | PipelineError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Escalate a retryable error that ran out of attempts.
    pub fn exhausted(self, attempts: u32) -> Self {
        match self.kind() {
            ErrorKind::Transient => {
                PipelineError::Fatal(format!("gave up after {attempts} attempts: {self}"))
            }
            _ => self,
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return PipelineError::Transient(err.to_string());
        }
        if err.is_decode() {
            return PipelineError::Malformed(err.to_string());
        }
        match err.status() {
            Some(status) => PipelineError::Store {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => PipelineError::Transient(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_status_maps_to_kind() {
        let busy = PipelineError::Store {
            status: 503,
            message: "unavailable".into(),
        };
        assert_eq!(busy.kind(), ErrorKind::Transient);

        let limited = PipelineError::Store {
            status: 429,
            message: "slow down".into(),
        };
        assert!(limited.is_transient());

        let denied = PipelineError::Store {
            status: 403,
            message: "forbidden".into(),
        };
        assert_eq!(denied.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn exhausted_transient_becomes_fatal() {
        let e = PipelineError::Transient("connection reset".into()).exhausted(3);
        assert_eq!(e.kind(), ErrorKind::Fatal);
        assert!(e.to_string().contains("3 attempts"));

        let m = PipelineError::Malformed("no json".into()).exhausted(3);
        assert_eq!(m.kind(), ErrorKind::Malformed);
    }
}
