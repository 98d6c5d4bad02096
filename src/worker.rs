//! Job consumer loop
//!
//! Each worker claims a job, moves the submission `queued → running`, runs the
//! pipeline under a per-job deadline and writes the terminal verdict
//! conditioned on still owning the `running` state. The claim is acknowledged
//! only once the outcome is durable; anything else leaves it for redelivery.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::cancel::{CancelToken, JobDeadline};
use crate::config::WorkerConfig;
use crate::core::{SubmissionStatus, Verdict};
use crate::error::{Disposition, JudgeError};
use crate::jobs::{job_budget, judge_submission, JobSettings};
use crate::judger::JudgeResult;
use crate::languages::LanguageRegistry;
use crate::queue::{Claim, JobQueue};
use crate::runner::Runner;
use crate::store::{Metrics, StoreError, Submission, SubmissionStore};

/// Everything one worker needs; no state is shared through globals.
#[derive(Clone)]
pub struct WorkerContext {
    pub id: usize,
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn SubmissionStore>,
    pub runner: Arc<dyn Runner>,
    pub registry: Arc<LanguageRegistry>,
    pub config: Arc<WorkerConfig>,
    pub settings: JobSettings,
    /// Stop dequeuing new jobs
    pub shutdown: CancelToken,
    /// Cancel in-flight jobs as well
    pub abort: CancelToken,
}

/// Exponential backoff, capped
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

impl WorkerContext {
    pub fn new(
        id: usize,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn SubmissionStore>,
        runner: Arc<dyn Runner>,
        registry: Arc<LanguageRegistry>,
        config: Arc<WorkerConfig>,
    ) -> Self {
        let settings = JobSettings::from_config(&config);
        Self {
            id,
            queue,
            store,
            runner,
            registry,
            config,
            settings,
            shutdown: CancelToken::new(),
            abort: CancelToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancelToken, abort: CancelToken) -> Self {
        self.shutdown = shutdown;
        self.abort = abort;
        self
    }

    /// Consume jobs until shutdown.
    pub async fn run(self) {
        let span = info_span!("worker", worker = self.id);
        self.consume().instrument(span).await
    }

    async fn consume(&self) {
        info!("Waiting for jobs...");
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);

        while !self.shutdown.is_cancelled() {
            match self.poll_once().await {
                Ok(_) => backoff.reset(),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("{}. Retrying in {:?}...", e, delay);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!("Worker stopped");
    }

    /// Claim and handle at most one job. Returns the handled submission ID.
    ///
    /// Shutdown only interrupts the wait for a job; a claimed job always runs
    /// to completion (or until `abort` fires its deadline). An error means the
    /// queue or store is unreachable and the caller should back off; the claim
    /// (if any) was left unacknowledged.
    pub async fn poll_once(&self) -> Result<Option<i64>, JudgeError> {
        let claim = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            claim = self.queue.dequeue(self.config.poll_interval) => claim?,
        };
        let Some(claim) = claim else {
            return Ok(None);
        };
        let span = info_span!("job", submission_id = claim.submission_id);
        self.handle_claim(&claim).instrument(span).await?;
        Ok(Some(claim.submission_id))
    }

    async fn handle_claim(&self, claim: &Claim) -> Result<(), JudgeError> {
        let outcome = if claim.deliveries > self.config.max_attempts {
            Err(JudgeError::SandboxSetup(format!(
                "gave up after {} deliveries",
                claim.deliveries - 1
            )))
        } else {
            self.process(claim).await
        };

        let err = match outcome {
            Ok(()) => return self.acknowledge(claim).await,
            Err(err) => err,
        };

        match err.disposition() {
            Disposition::Drop => {
                match &err {
                    JudgeError::Store(StoreError::Conflict { .. }) => {
                        debug!("Duplicate delivery: {}", err)
                    }
                    _ => warn!("Dropping job: {}", err),
                }
                self.acknowledge(claim).await
            }
            Disposition::Fail => {
                warn!("Job failed: {}", err);
                self.dead_letter(claim, &err).await?;
                self.acknowledge(claim).await
            }
            Disposition::Retry if claim.deliveries >= self.config.max_attempts => {
                error!(
                    "Dead-lettering submission_id={} after {} deliveries: {}",
                    claim.submission_id, claim.deliveries, err
                );
                self.dead_letter(claim, &err).await?;
                self.acknowledge(claim).await
            }
            Disposition::Retry => {
                warn!(
                    "Job will be redelivered (delivery {} of {}): {}",
                    claim.deliveries, self.config.max_attempts, err
                );
                match err {
                    JudgeError::Store(_) | JudgeError::Queue(_) => Err(err),
                    _ => Ok(()),
                }
            }
        }
    }

    async fn process(&self, claim: &Claim) -> Result<(), JudgeError> {
        let submission = self.load(claim.submission_id).await?;
        if submission.status.is_terminal() {
            info!(
                "Submission already judged ({}), skipping: submission_id={}",
                submission.status, submission.id
            );
            return Ok(());
        }

        info!(
            "Received judge job: submission_id={}, language={}, delivery={}",
            submission.id, submission.language, claim.deliveries
        );
        self.take_ownership(&submission, claim).await?;

        let strategy = self.registry.resolve(&submission.language)?;
        let testcases = self.store.load_testcases(submission.problem_id).await?;

        let budget = job_budget(&strategy, &testcases, &self.settings);
        let deadline = JobDeadline::start(&self.abort, budget);
        let judging = judge_submission(
            self.runner.as_ref(),
            &self.settings,
            &strategy,
            &submission,
            &testcases,
            &deadline.token,
        );
        tokio::pin!(judging);
        let result = tokio::select! {
            result = &mut judging => result,
            _ = self.keep_claim(claim) => judging.await,
        };

        let result = match result {
            Err(JudgeError::SandboxSetup(reason)) if deadline.expired() => {
                debug!("Setup failure after deadline: {}", reason);
                return Err(JudgeError::DeadlineExceeded);
            }
            other => other?,
        };
        debug!("Judged with {:?} of the job budget left", deadline.remaining());

        self.finish(&submission, claim, &result).await?;
        info!(
            "Judge job completed: submission_id={}, verdict={}",
            submission.id, result.verdict
        );
        Ok(())
    }

    /// Extend the claim's visibility while the job runs. Returns only once
    /// the claim has been lost to another delivery.
    async fn keep_claim(&self, claim: &Claim) {
        let every = (self.config.visibility_timeout / 3).max(Duration::from_millis(10));
        loop {
            tokio::time::sleep(every).await;
            match self.queue.extend(claim).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        "Claim for submission_id={} expired while judging",
                        claim.submission_id
                    );
                    return;
                }
                Err(e) => warn!("Failed to extend claim: {}", e),
            }
        }
    }

    async fn load(&self, id: i64) -> Result<Submission, JudgeError> {
        self.store.load_submission(id).await.map_err(|e| match e {
            StoreError::NotFound(id) => JudgeError::SubmissionNotFound(id),
            e => e.into(),
        })
    }

    /// `queued → running`, or `running → running` when a redelivered claim
    /// takes over from a worker that never finished.
    async fn take_ownership(&self, submission: &Submission, claim: &Claim) -> Result<(), JudgeError> {
        if submission.status == SubmissionStatus::Running {
            info!(
                "Taking over submission_id={} from claim {:?}",
                submission.id, submission.owner
            );
        }
        self.store
            .transition(
                submission.id,
                submission.status,
                SubmissionStatus::Running,
                &claim.token,
                &Metrics::default(),
            )
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        submission: &Submission,
        claim: &Claim,
        result: &JudgeResult,
    ) -> Result<(), JudgeError> {
        let metrics = Metrics {
            time_ms: result.time_ms,
            memory_kb: result.memory_kb,
            diagnostic: result.diagnostic.clone(),
        };
        self.store
            .transition(
                submission.id,
                SubmissionStatus::Running,
                SubmissionStatus::from(result.verdict),
                &claim.token,
                &metrics,
            )
            .await?;
        Ok(())
    }

    /// Record `internal_error` for whatever state the submission is in now.
    async fn dead_letter(&self, claim: &Claim, cause: &JudgeError) -> Result<(), JudgeError> {
        let submission = match self.load(claim.submission_id).await {
            Ok(submission) => submission,
            Err(JudgeError::SubmissionNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if submission.status.is_terminal() {
            return Ok(());
        }
        if submission.owner.as_deref() != Some(claim.token.as_str()) {
            self.take_ownership(&submission, claim).await?;
        }
        let result = JudgeResult::internal_error(cause.to_string());
        match self.finish(&submission, claim, &result).await {
            Ok(()) => {
                info!(
                    "Judge job completed: submission_id={}, verdict={}",
                    submission.id,
                    Verdict::InternalError
                );
                Ok(())
            }
            // Someone else finished it meanwhile
            Err(JudgeError::Store(StoreError::Conflict { .. })) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn acknowledge(&self, claim: &Claim) -> Result<(), JudgeError> {
        self.queue.acknowledge(claim).await?;
        Ok(())
    }
}
