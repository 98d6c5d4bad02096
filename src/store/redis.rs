//! Redis-backed submission store.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::debug;

use super::{plan_transition, Metrics, StoreError, Submission, SubmissionStore, TestCase};
use crate::core::SubmissionStatus;

/// Redis key layout
pub mod keys {
    /// Prefix of the production records
    pub const DEFAULT_PREFIX: &str = "judge";

    /// `<prefix>:submission:<id>` hash
    pub fn submission(prefix: &str, id: i64) -> String {
        format!("{}:submission:{}", prefix, id)
    }

    /// `<prefix>:problem:<id>:testcases` JSON list
    pub fn testcases(prefix: &str, problem_id: i64) -> String {
        format!("{}:problem:{}:testcases", prefix, problem_id)
    }
}

/// Compare-and-set on the status field (and on the owner when required).
/// Returns -1 for a missing record, 0 for a failed condition, 1 when applied.
const TRANSITION_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
  return -1
end
if status ~= ARGV[1] then
  return 0
end
if ARGV[2] ~= '' and redis.call('HGET', KEYS[1], 'owner') ~= ARGV[2] then
  return 0
end
for i = 3, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
return 1
"#;

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    transition_script: Script,
    request_timeout: Duration,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, request_timeout: Duration) -> Self {
        Self {
            conn,
            prefix: keys::DEFAULT_PREFIX.to_string(),
            transition_script: Script::new(TRANSITION_SCRIPT),
            request_timeout,
        }
    }

    /// Keep records under `prefix` instead of [`keys::DEFAULT_PREFIX`].
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Create or replace a submission record.
    pub async fn put_submission(&self, submission: &Submission) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = keys::submission(&self.prefix, submission.id);
        let fields = submission.to_fields();
        self.bounded(async move {
            redis::pipe()
                .atomic()
                .del(&key)
                .hset_multiple(&key, &fields)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    /// Replace the test cases of a problem.
    pub async fn put_testcases(
        &self,
        problem_id: i64,
        testcases: &[TestCase],
    ) -> Result<(), StoreError> {
        let key = keys::testcases(&self.prefix, problem_id);
        let payload = serde_json::to_string(testcases).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.set::<_, _, ()>(&key, payload).await })
            .await
    }

    async fn bounded<T, F>(&self, request: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Unavailable(format!(
                "request timed out after {:?}",
                self.request_timeout
            ))),
        }
    }
}

#[async_trait]
impl SubmissionStore for RedisStore {
    async fn load_submission(&self, id: i64) -> Result<Submission, StoreError> {
        let mut conn = self.conn.clone();
        let key = keys::submission(&self.prefix, id);
        let fields: HashMap<String, String> = self
            .bounded(async move { conn.hgetall(&key).await })
            .await?;
        if fields.is_empty() {
            return Err(StoreError::NotFound(id));
        }
        Submission::from_fields(id, &fields)
    }

    async fn load_testcases(&self, problem_id: i64) -> Result<Vec<TestCase>, StoreError> {
        let mut conn = self.conn.clone();
        let key = keys::testcases(&self.prefix, problem_id);
        let payload: Option<String> = self
            .bounded({
                let key = key.clone();
                async move { conn.get(&key).await }
            })
            .await?;
        match payload {
            Some(json) => serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
                key,
                reason: e.to_string(),
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn transition(
        &self,
        id: i64,
        expected: SubmissionStatus,
        next: SubmissionStatus,
        owner: &str,
        metrics: &Metrics,
    ) -> Result<(), StoreError> {
        let plan = plan_transition(expected, next, owner, metrics)?;

        let mut invocation = self.transition_script.key(keys::submission(&self.prefix, id));
        invocation
            .arg(plan.expected.as_str())
            .arg(plan.required_owner.as_deref().unwrap_or(""));
        for (field, value) in &plan.fields {
            invocation.arg(*field).arg(value);
        }

        let mut conn = self.conn.clone();
        let applied: i64 = self
            .bounded(async move { invocation.invoke_async(&mut conn).await })
            .await?;

        debug!(
            "Transition submission_id={} {} -> {}: {}",
            id, expected, next, applied
        );
        match applied {
            1 => Ok(()),
            0 => Err(StoreError::Conflict {
                id,
                expected: expected.to_string(),
            }),
            _ => Err(StoreError::NotFound(id)),
        }
    }
}
