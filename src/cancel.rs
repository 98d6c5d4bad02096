//! Cooperative cancellation shared by every bounded step of a job.
//!
//! A token is fired either by the per-job deadline or by worker shutdown.
//! Child tokens fire when their parent fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token has been cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so `wait_for` can only fail if it is
        // dropped, which cannot happen while we hold `&self`.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// A token that fires when `self` fires, or on its own.
    pub fn child(&self) -> (CancelToken, JoinHandle<()>) {
        let child = CancelToken::new();
        let parent = self.clone();
        let linked = child.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
        (child, handle)
    }
}

/// Per-job deadline. Firing cancels the job's token.
pub struct JobDeadline {
    pub token: CancelToken,
    pub at: Instant,
    link: JoinHandle<()>,
    timer: JoinHandle<()>,
}

impl JobDeadline {
    pub fn start(parent: &CancelToken, budget: Duration) -> Self {
        let (token, link) = parent.child();
        let at = Instant::now() + budget;
        let fire = token.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            fire.cancel();
        });
        Self {
            token,
            at,
            link,
            timer,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

impl Drop for JobDeadline {
    fn drop(&mut self) {
        self.link.abort();
        self.timer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancels_child() {
        let parent = CancelToken::new();
        let (child, _link) = parent.child();
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("child should be cancelled by parent");
    }

    #[tokio::test]
    async fn test_child_does_not_cancel_parent() {
        let parent = CancelToken::new();
        let (child, _link) = parent.child();
        child.cancel();
        tokio::task::yield_now().await;
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_fires() {
        let root = CancelToken::new();
        let deadline = JobDeadline::start(&root, Duration::from_millis(50));
        tokio::time::timeout(Duration::from_secs(2), deadline.token.cancelled())
            .await
            .expect("deadline should fire");
        assert!(deadline.expired());
        assert!(!root.is_cancelled());
    }
}
