//! In-memory job queue with claim expiry.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{new_token, poll_step, Claim, JobQueue, QueueError};

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<i64>,
    /// token -> (submission id, visibility deadline)
    claims: HashMap<String, (i64, Instant)>,
    deliveries: HashMap<i64, u32>,
    acknowledged: Vec<i64>,
}

/// Shared in-process queue; clones see the same jobs.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::default(),
            notify: Arc::new(Notify::new()),
            visibility_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Jobs waiting for a first delivery
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Claims handed out and not yet acknowledged
    pub fn in_flight(&self) -> usize {
        self.lock().claims.len()
    }

    /// Submission IDs acknowledged so far, in order
    pub fn acknowledged(&self) -> Vec<i64> {
        self.lock().acknowledged.clone()
    }

    fn try_claim(&self) -> Option<Claim> {
        let mut state = self.lock();
        let now = Instant::now();

        let expired = state
            .claims
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .min_by_key(|(_, (_, deadline))| *deadline)
            .map(|(token, _)| token.clone());
        let submission_id = match expired {
            Some(token) => state.claims.remove(&token).map(|(id, _)| id),
            None => state.pending.pop_front(),
        }?;

        let token = new_token();
        state
            .claims
            .insert(token.clone(), (submission_id, now + self.visibility_timeout));
        let deliveries = state.deliveries.entry(submission_id).or_insert(0);
        *deliveries += 1;

        Some(Claim {
            token,
            submission_id,
            deliveries: *deliveries,
        })
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, submission_id: i64) -> Result<(), QueueError> {
        self.lock().pending.push_back(submission_id);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, poll: Duration) -> Result<Option<Claim>, QueueError> {
        let give_up = Instant::now() + poll;
        loop {
            if let Some(claim) = self.try_claim() {
                return Ok(Some(claim));
            }
            let now = Instant::now();
            if now >= give_up {
                return Ok(None);
            }
            let wait = poll_step(poll).min(give_up - now);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn extend(&self, claim: &Claim) -> Result<bool, QueueError> {
        let mut state = self.lock();
        match state.claims.get_mut(&claim.token) {
            Some((_, deadline)) => {
                *deadline = Instant::now() + self.visibility_timeout;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn acknowledge(&self, claim: &Claim) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.claims.remove(&claim.token).is_some() {
            state.deliveries.remove(&claim.submission_id);
            state.acknowledged.push(claim.submission_id);
        }
        Ok(())
    }
}
