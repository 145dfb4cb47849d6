// src/retry.rs
//! One retry wrapper for every external-collaborator call.
//!
//! Each attempt runs under its own timeout. Only [`ErrorKind::Transient`]
//! failures are retried; anything else is returned on the spot. A transient
//! error that survives the last attempt is escalated to fatal.

use std::future::Future;
use std::time::Duration;

use metrics::counter;

use crate::error::{ErrorKind, PipelineError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Timeout for a single attempt, independent of the job timeout.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff. Used for calls that must not be repeated
    /// (e.g. delivery, where a retry could double-send).
    pub fn once(call_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            call_timeout,
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Run `call` until it succeeds, fails non-transiently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(res) => res,
                Err(_) => Err(PipelineError::Timeout {
                    op: op.to_string(),
                    after: self.call_timeout,
                }),
            };

            match outcome {
                Ok(v) => return Ok(v),
                Err(e) if e.kind() == ErrorKind::Transient && attempt < attempts => {
                    let wait = self.backoff(attempt);
                    counter!("external_call_retries_total").increment(1);
                    tracing::warn!(
                        target: "retry",
                        op,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e.exhausted(attempt)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::default()
            .with_base_delay(Duration::from_millis(1))
            .with_call_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn transient_then_success_is_retried() {
        let calls = AtomicU32::new(0);
        let out = fast()
            .run("flaky", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(PipelineError::Transient("reset".into()))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run("bad-json", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PipelineError::Malformed("not json".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_transient_turns_fatal() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run("down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PipelineError::Transient("refused".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_call_hits_per_call_timeout() {
        let policy = fast().with_attempts(1);
        let err = policy
            .run("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        // a single attempt still escalates to fatal once retries are exhausted
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.to_string().contains("timed out"));
    }
}
