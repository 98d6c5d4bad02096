//! Submission state store
//!
//! This module provides the interface to the durable submission records:
//! - `RedisStore`: Hash-per-submission records with Lua compare-and-set
//! - `MemoryStore`: In-process store for tests and local runs
//!
//! Status changes only go through [`SubmissionStore::transition`], which
//! applies them conditionally so duplicate deliveries cannot overwrite a
//! result.

pub mod memory;
pub mod redis;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::SubmissionStatus;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Submission {0} not found")]
    NotFound(i64),

    #[error("Submission {id} is no longer {expected} for this claim")]
    Conflict { id: i64, expected: String },

    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition {
        from: SubmissionStatus,
        to: SubmissionStatus,
    },

    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<::redis::RedisError> for StoreError {
    fn from(e: ::redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// A submission record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub id: i64,
    pub language: String,
    pub source: String,
    pub user_id: Option<i64>,
    pub problem_id: i64,
    pub status: SubmissionStatus,
    /// Execution time in ms (max over executed test cases)
    pub time_ms: Option<u64>,
    /// Peak memory in KB
    pub memory_kb: Option<u64>,
    /// Compiler output or truncated runtime stderr
    pub diagnostic: Option<String>,
    /// Claim token of the worker that owns the `running` state
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Submission {
    /// A freshly queued submission
    pub fn new(id: i64, problem_id: i64, language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id,
            language: language.into(),
            source: source.into(),
            user_id: None,
            problem_id,
            status: SubmissionStatus::Queued,
            time_ms: None,
            memory_kb: None,
            diagnostic: None,
            owner: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Flat field/value pairs, as stored in a Redis hash
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("language", self.language.clone()),
            ("source", self.source.clone()),
            ("problem_id", self.problem_id.to_string()),
            ("status", self.status.to_string()),
            ("created_at", self.created_at.to_rfc3339()),
        ];
        let optional = [
            ("user_id", self.user_id.map(|v| v.to_string())),
            ("time_ms", self.time_ms.map(|v| v.to_string())),
            ("memory_kb", self.memory_kb.map(|v| v.to_string())),
            ("diagnostic", self.diagnostic.clone()),
            ("owner", self.owner.clone()),
            ("finished_at", self.finished_at.map(|t| t.to_rfc3339())),
        ];
        fields.extend(
            optional
                .into_iter()
                .filter_map(|(name, value)| value.map(|v| (name, v))),
        );
        fields
    }

    pub fn from_fields(id: i64, fields: &HashMap<String, String>) -> Result<Self, StoreError> {
        let key = format!("submission {}", id);
        let corrupt = |reason: String| StoreError::Corrupt {
            key: key.clone(),
            reason,
        };
        let required = |name: &str| {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| corrupt(format!("missing field {}", name)))
        };
        fn parse<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, String> {
            raw.parse()
                .map_err(|_| format!("invalid {}: {:?}", name, raw))
        }
        let optional = |name: &str| -> Result<Option<u64>, StoreError> {
            fields
                .get(name)
                .map(|raw| parse(name, raw).map_err(corrupt))
                .transpose()
        };
        let timestamp = |raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| corrupt(format!("invalid timestamp {:?}: {}", raw, e)))
        };

        Ok(Self {
            id,
            language: required("language")?,
            source: required("source")?,
            user_id: fields
                .get("user_id")
                .map(|raw| parse("user_id", raw).map_err(corrupt))
                .transpose()?,
            problem_id: parse("problem_id", &required("problem_id")?).map_err(corrupt)?,
            status: required("status")?.parse().map_err(corrupt)?,
            time_ms: optional("time_ms")?,
            memory_kb: optional("memory_kb")?,
            diagnostic: fields.get("diagnostic").cloned(),
            owner: fields.get("owner").cloned(),
            created_at: timestamp(required("created_at")?.as_str())?,
            finished_at: fields
                .get("finished_at")
                .map(|raw| timestamp(raw))
                .transpose()?,
        })
    }
}

/// One test case of a problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    /// Base time limit in milliseconds
    pub time_limit_ms: u32,
    /// Base memory limit in MB
    pub memory_limit_mb: u32,
}

/// Measurements recorded with a terminal transition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    pub time_ms: Option<u64>,
    pub memory_kb: Option<u64>,
    pub diagnostic: Option<String>,
}

/// Conditions and writes of one transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPlan {
    pub expected: SubmissionStatus,
    /// Owner that must hold the record for the write to apply
    pub required_owner: Option<String>,
    pub fields: Vec<(&'static str, String)>,
}

/// Validate a requested transition and work out its conditions.
///
/// A terminal write from `running` must come from the current owner; entering
/// `running` (first claim or takeover after redelivery) records `owner` as the
/// new owner.
pub fn plan_transition(
    expected: SubmissionStatus,
    next: SubmissionStatus,
    owner: &str,
    metrics: &Metrics,
) -> Result<TransitionPlan, StoreError> {
    if !expected.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            from: expected,
            to: next,
        });
    }

    let mut fields = vec![("status", next.to_string())];
    let required_owner = if next == SubmissionStatus::Running {
        fields.push(("owner", owner.to_string()));
        None
    } else if expected == SubmissionStatus::Running {
        Some(owner.to_string())
    } else {
        None
    };

    if next.is_terminal() {
        if let Some(time_ms) = metrics.time_ms {
            fields.push(("time_ms", time_ms.to_string()));
        }
        if let Some(memory_kb) = metrics.memory_kb {
            fields.push(("memory_kb", memory_kb.to_string()));
        }
        if let Some(diagnostic) = &metrics.diagnostic {
            fields.push(("diagnostic", diagnostic.clone()));
        }
        fields.push(("finished_at", Utc::now().to_rfc3339()));
    }

    Ok(TransitionPlan {
        expected,
        required_owner,
        fields,
    })
}

/// Durable submission records
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn load_submission(&self, id: i64) -> Result<Submission, StoreError>;

    /// Test cases of a problem, in judging order (empty when none exist)
    async fn load_testcases(&self, problem_id: i64) -> Result<Vec<TestCase>, StoreError>;

    /// Move `id` from `expected` to `next`, or fail with `Conflict`.
    async fn transition(
        &self,
        id: i64,
        expected: SubmissionStatus,
        next: SubmissionStatus,
        owner: &str,
        metrics: &Metrics,
    ) -> Result<(), StoreError>;
}
