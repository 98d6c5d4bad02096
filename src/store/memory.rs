//! In-memory submission store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{plan_transition, Metrics, StoreError, Submission, SubmissionStore, TestCase};
use crate::core::SubmissionStatus;

#[derive(Debug, Default)]
struct State {
    submissions: HashMap<i64, Submission>,
    testcases: HashMap<i64, Vec<TestCase>>,
    /// Applied transitions per submission, in order
    history: HashMap<i64, Vec<SubmissionStatus>>,
    /// Number of upcoming calls that fail as unavailable
    outages: u32,
}

/// Shared in-process store; clones see the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_submission(&self, submission: Submission) {
        self.lock().submissions.insert(submission.id, submission);
    }

    pub fn insert_testcases(&self, problem_id: i64, testcases: Vec<TestCase>) {
        self.lock().testcases.insert(problem_id, testcases);
    }

    pub fn submission(&self, id: i64) -> Option<Submission> {
        self.lock().submissions.get(&id).cloned()
    }

    /// Statuses the submission moved through, excluding the initial one
    pub fn history(&self, id: i64) -> Vec<SubmissionStatus> {
        self.lock().history.get(&id).cloned().unwrap_or_default()
    }

    /// Make the next `calls` store calls fail with `Unavailable`.
    pub fn fail_next(&self, calls: u32) {
        self.lock().outages = calls;
    }

    fn check_outage(state: &mut State) -> Result<(), StoreError> {
        if state.outages > 0 {
            state.outages -= 1;
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn load_submission(&self, id: i64) -> Result<Submission, StoreError> {
        let mut state = self.lock();
        Self::check_outage(&mut state)?;
        state
            .submissions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn load_testcases(&self, problem_id: i64) -> Result<Vec<TestCase>, StoreError> {
        let mut state = self.lock();
        Self::check_outage(&mut state)?;
        Ok(state.testcases.get(&problem_id).cloned().unwrap_or_default())
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

        let mut state = self.lock();
        Self::check_outage(&mut state)?;
        let submission = state
            .submissions
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;

        let owner_matches = match &plan.required_owner {
            Some(required) => submission.owner.as_deref() == Some(required.as_str()),
            None => true,
        };
        if submission.status != plan.expected || !owner_matches {
            return Err(StoreError::Conflict {
                id,
                expected: expected.to_string(),
            });
        }

        for (field, value) in plan.fields {
            match field {
                "status" => submission.status = next,
                "owner" => submission.owner = Some(value),
                "time_ms" => submission.time_ms = value.parse().ok(),
                "memory_kb" => submission.memory_kb = value.parse().ok(),
                "diagnostic" => submission.diagnostic = Some(value),
                "finished_at" => {
                    submission.finished_at = DateTime::parse_from_rfc3339(&value)
                        .map(|t| t.with_timezone(&Utc))
                        .ok()
                }
                _ => {}
            }
        }
        state.history.entry(id).or_default().push(next);
        Ok(())
    }
}
