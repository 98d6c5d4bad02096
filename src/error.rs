//! Error taxonomy for judging one submission.
//!
//! Expected program failures (compile errors, crashes, timeouts) are verdicts,
//! not errors. The variants here are what the consumer loop has to route:
//! finish the job, retry it, or back off.

use thiserror::Error;

use crate::queue::QueueError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Submission {0} not found")]
    SubmissionNotFound(i64),

    #[error("Problem {0} has no test cases")]
    NoTestCases(i64),

    #[error("Sandbox setup failed: {0}")]
    SandboxSetup(String),

    #[error("Job deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// What the consumer loop does with a job after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Record `internal_error` and acknowledge.
    Fail,
    /// Leave the claim unacknowledged so the job is redelivered.
    Retry,
    /// Nothing to record, acknowledge and move on.
    Drop,
}

impl JudgeError {
    pub fn disposition(&self) -> Disposition {
        match self {
            JudgeError::UnsupportedLanguage(_)
            | JudgeError::NoTestCases(_)
            | JudgeError::DeadlineExceeded => Disposition::Fail,
            JudgeError::SubmissionNotFound(_) => Disposition::Drop,
            JudgeError::SandboxSetup(_) => Disposition::Retry,
            JudgeError::Store(StoreError::NotFound(_)) => Disposition::Drop,
            JudgeError::Store(StoreError::Conflict { .. })
            | JudgeError::Store(StoreError::InvalidTransition { .. }) => Disposition::Drop,
            JudgeError::Store(StoreError::Corrupt { .. }) => Disposition::Fail,
            JudgeError::Store(_) | JudgeError::Queue(_) => Disposition::Retry,
        }
    }
}

impl From<std::io::Error> for JudgeError {
    fn from(e: std::io::Error) -> Self {
        JudgeError::SandboxSetup(e.to_string())
    }
}
