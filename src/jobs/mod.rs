//! Build → Run → Compare pipeline for one submission.
//!
//! The caller owns the state machine: this module only turns a submission,
//! its strategy and its test cases into a [`JudgeResult`]. Every file it
//! writes lives in one scratch directory per attempt, removed on return.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::compiler::build;
use crate::config::WorkerConfig;
use crate::error::JudgeError;
use crate::judger::{judge, Aggregate, JudgeResult};
use crate::languages::RunnerStrategy;
use crate::runner::{CommandSpec, RunLimits, Runner};
use crate::sandbox::ScratchDir;
use crate::store::{Submission, TestCase};

/// Settings shared by every job of a worker
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub scratch_root: PathBuf,
    pub build_time_ms: u32,
    pub build_memory_mb: u32,
    pub max_diagnostic_bytes: usize,
    pub deadline_slack: Duration,
    pub sandbox_uid: Option<u32>,
    pub sandbox_gid: Option<u32>,
}

impl JobSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            scratch_root: config.scratch_root.clone(),
            build_time_ms: config.sandbox.compile_time_limit_ms,
            build_memory_mb: config.sandbox.compile_memory_limit_mb,
            max_diagnostic_bytes: config.sandbox.max_diagnostic_bytes,
            deadline_slack: config.deadline_slack,
            sandbox_uid: config.sandbox.uid,
            sandbox_gid: config.sandbox.gid,
        }
    }

    fn build_limits(&self, strategy: &RunnerStrategy) -> RunLimits {
        RunLimits::new(self.build_time_ms, self.build_memory_mb)
            .with_address_space(strategy.address_space_limit)
    }
}

/// Per-language limits for one test case
pub fn case_limits(strategy: &RunnerStrategy, testcase: &TestCase) -> RunLimits {
    RunLimits::new(
        strategy.calculate_time_limit(testcase.time_limit_ms),
        strategy.calculate_memory_limit(testcase.memory_limit_mb),
    )
    .with_address_space(strategy.address_space_limit)
}

/// Upper bound on the whole job: build timeout + adjusted run limits + slack
pub fn job_budget(strategy: &RunnerStrategy, testcases: &[TestCase], settings: &JobSettings) -> Duration {
    let build_ms = if strategy.needs_build() {
        settings.build_time_ms as u64
    } else {
        0
    };
    let run_ms: u64 = testcases
        .iter()
        .map(|tc| case_limits(strategy, tc).time_ms as u64)
        .sum();
    Duration::from_millis(build_ms + run_ms) + settings.deadline_slack
}

/// Judge `submission` against `testcases`, in order, stopping at the first
/// non-accepted case.
pub async fn judge_submission(
    runner: &dyn Runner,
    settings: &JobSettings,
    strategy: &RunnerStrategy,
    submission: &Submission,
    testcases: &[TestCase],
    cancel: &CancelToken,
) -> Result<JudgeResult, JudgeError> {
    if testcases.is_empty() {
        return Err(JudgeError::NoTestCases(submission.problem_id));
    }

    let scratch = ScratchDir::create(
        &settings.scratch_root,
        &format!("submission-{}", submission.id),
    )?;
    scratch
        .write_file(&strategy.source_file, submission.source.as_bytes())
        .await?;
    scratch.grant(settings.sandbox_uid, settings.sandbox_gid)?;

    let build_outcome = build(
        runner,
        scratch.path(),
        strategy,
        &settings.build_limits(strategy),
        settings.max_diagnostic_bytes,
        cancel,
    )
    .await?;

    let mut aggregate = Aggregate::new();
    if !build_outcome.is_ready() {
        aggregate.record(judge(&build_outcome, None, "", 0, settings.max_diagnostic_bytes));
        return Ok(aggregate.finish());
    }
    // Compiled artifacts are created by the worker, hand them over as well.
    scratch.grant(settings.sandbox_uid, settings.sandbox_gid)?;

    let cmd = CommandSpec::from_vec(&strategy.run_argv(scratch.path()), scratch.path());
    for (index, testcase) in testcases.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(JudgeError::DeadlineExceeded);
        }

        let limits = case_limits(strategy, testcase);
        let outcome = runner
            .run(&cmd, &limits, Some(testcase.input.as_bytes()), cancel)
            .await;
        let case = judge(
            &build_outcome,
            Some(&outcome),
            &testcase.expected_output,
            limits.time_ms,
            settings.max_diagnostic_bytes,
        );
        debug!(
            "Testcase {}: submission_id={}, verdict={}, time_ms={}, memory_kb={:?}, truncated={}",
            index + 1,
            submission.id,
            case.verdict,
            case.time_ms,
            case.memory_kb,
            outcome.truncated
        );

        if !aggregate.record(case) {
            break;
        }
    }

    let result = aggregate.finish();
    info!(
        "Job summary: submission_id={}, verdict={}, max_time_ms={:?}, max_memory_kb={:?}",
        submission.id, result.verdict, result.time_ms, result.memory_kb
    );
    Ok(result)
}
