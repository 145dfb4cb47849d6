// src/jobs/queue.rs
//! Three FIFO queues, drained strictly by tier.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::QueueTier;

#[derive(Debug, Default)]
struct Tiers {
    high: VecDeque<String>,
    default: VecDeque<String>,
    low: VecDeque<String>,
}

impl Tiers {
    fn lane(&mut self, tier: QueueTier) -> &mut VecDeque<String> {
        match tier {
            QueueTier::High => &mut self.high,
            QueueTier::Default => &mut self.default,
            QueueTier::Low => &mut self.low,
        }
    }

    fn len(&self) -> usize {
        self.high.len() + self.default.len() + self.low.len()
    }
}

#[derive(Debug, Default)]
pub struct JobQueue {
    tiers: Mutex<Tiers>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tier: QueueTier, job_id: String) {
        if let Ok(mut t) = self.tiers.lock() {
            t.lane(tier).push_back(job_id);
        }
        self.notify.notify_one();
    }

    /// Highest non-empty tier first, FIFO within a tier.
    pub fn pop(&self) -> Option<String> {
        let mut t = self.tiers.lock().ok()?;
        QueueTier::ALL
            .into_iter()
            .find_map(|tier| t.lane(tier).pop_front())
    }

    /// Drop a still-queued job. Returns false if it was already taken.
    pub fn remove(&self, job_id: &str) -> bool {
        let Ok(mut t) = self.tiers.lock() else {
            return false;
        };
        for tier in QueueTier::ALL {
            let lane = t.lane(tier);
            if let Some(pos) = lane.iter().position(|id| id == job_id) {
                lane.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.tiers.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next job, or `None` once `shutdown` fires.
    pub async fn next(&self, shutdown: &CancellationToken) -> Option<String> {
        loop {
            if let Some(id) = self.pop() {
                return Some(id);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }
}
