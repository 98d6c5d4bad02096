//! Judger module - verdict engine
//!
//! Turns a build outcome plus the execution outcome of each test case into a
//! verdict. Pure functions only: nothing here runs processes or touches the
//! state store.

use serde::{Deserialize, Serialize};

use crate::compiler::BuildOutcome;
use crate::core::utils::diagnostic;
use crate::core::Verdict;
use crate::runner::{ExecutionOutcome, OutcomeTag};

/// Diagnostic attached to memory-limit kills
pub const MEMORY_LIMIT_DIAGNOSTIC: &str = "memory limit exceeded";

/// Verdict for a single test case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseVerdict {
    pub verdict: Verdict,
    pub diagnostic: Option<String>,
    /// Wall time in milliseconds (0 when nothing ran)
    pub time_ms: u64,
    pub memory_kb: Option<u64>,
}

/// Result of judging a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeResult {
    pub verdict: Verdict,
    /// Compile error / Runtime error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    pub time_ms: Option<u64>,
    pub memory_kb: Option<u64>,
}

impl JudgeResult {
    pub fn internal_error(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::InternalError,
            diagnostic: Some(reason.into()),
            time_ms: None,
            memory_kb: None,
        }
    }
}

/// Judge one test case.
///
/// `execution` is `None` only when the build failed, since nothing ran.
pub fn judge(
    build: &BuildOutcome,
    execution: Option<&ExecutionOutcome>,
    expected: &str,
    time_limit_ms: u32,
    max_diagnostic_bytes: usize,
) -> CaseVerdict {
    if let BuildOutcome::Failed(message) = build {
        return CaseVerdict {
            verdict: Verdict::CompileError,
            diagnostic: Some(message.clone()),
            time_ms: 0,
            memory_kb: None,
        };
    }

    let Some(outcome) = execution else {
        return CaseVerdict {
            verdict: Verdict::InternalError,
            diagnostic: Some("no execution outcome for a successful build".to_string()),
            time_ms: 0,
            memory_kb: None,
        };
    };

    let case = |verdict: Verdict, diagnostic: Option<String>| CaseVerdict {
        verdict,
        diagnostic,
        time_ms: outcome.elapsed_ms,
        memory_kb: outcome.memory_kb,
    };
    let stderr_or = |fallback: String| {
        if outcome.stderr.trim().is_empty() {
            fallback
        } else {
            diagnostic(&outcome.stderr, max_diagnostic_bytes)
        }
    };

    match &outcome.tag {
        OutcomeTag::TimedOut => case(Verdict::TimeLimitExceeded, None),
        OutcomeTag::Cancelled if outcome.elapsed_ms >= time_limit_ms as u64 => {
            case(Verdict::TimeLimitExceeded, None)
        }
        OutcomeTag::Cancelled => case(
            Verdict::InternalError,
            Some("execution cancelled before completion".to_string()),
        ),
        OutcomeTag::RunnerError(reason) => case(
            Verdict::RuntimeError,
            Some(diagnostic(reason, max_diagnostic_bytes)),
        ),
        OutcomeTag::MemoryExceeded => case(
            Verdict::RuntimeError,
            Some(MEMORY_LIMIT_DIAGNOSTIC.to_string()),
        ),
        OutcomeTag::Crashed(signal) => case(
            Verdict::RuntimeError,
            Some(stderr_or(format!("killed by signal {}", signal))),
        ),
        OutcomeTag::Completed(code) if *code != 0 => case(
            Verdict::RuntimeError,
            Some(stderr_or(format!("exited with code {}", code))),
        ),
        OutcomeTag::Completed(_) => {
            if compare_output(&outcome.stdout, expected) {
                case(Verdict::Accepted, None)
            } else {
                case(Verdict::WrongAnswer, None)
            }
        }
    }
}

/// All-or-nothing aggregation over a submission's test cases.
///
/// The first non-accepted case decides the verdict. Time and memory are the
/// maximum over the cases that ran.
#[derive(Debug, Default)]
pub struct Aggregate {
    cases: usize,
    time_ms: u64,
    memory_kb: Option<u64>,
    failure: Option<CaseVerdict>,
}

impl Aggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a case; returns `false` once the remaining cases can be skipped.
    pub fn record(&mut self, case: CaseVerdict) -> bool {
        self.cases += 1;
        self.time_ms = self.time_ms.max(case.time_ms);
        self.memory_kb = match (self.memory_kb, case.memory_kb) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if case.verdict == Verdict::Accepted {
            return true;
        }
        if self.failure.is_none() {
            self.failure = Some(case);
        }
        false
    }

    pub fn finish(self) -> JudgeResult {
        if self.cases == 0 {
            return JudgeResult::internal_error("no test cases were judged");
        }
        let (verdict, diagnostic) = match self.failure {
            Some(case) => (case.verdict, case.diagnostic),
            None => (Verdict::Accepted, None),
        };
        JudgeResult {
            verdict,
            diagnostic,
            time_ms: Some(self.time_ms),
            memory_kb: self.memory_kb,
        }
    }
}

/// Compare program output with expected output
pub fn compare_output(actual: &str, expected: &str) -> bool {
    // Normalize outputs: trim trailing whitespace from each line and trailing newlines
    let normalize = |s: &str| -> Vec<String> {
        let mut lines: Vec<String> = s.lines().map(|line| line.trim_end().to_string()).collect();
        // Remove trailing empty lines
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        lines
    };

    normalize(actual) == normalize(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ready() -> BuildOutcome {
        BuildOutcome::Ready(PathBuf::from("/scratch/main"))
    }

    fn outcome(tag: OutcomeTag, stdout: &str, stderr: &str) -> ExecutionOutcome {
        ExecutionOutcome {
            tag,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            elapsed_ms: 120,
            memory_kb: Some(2048),
            truncated: false,
        }
    }

    fn verdict_of(tag: OutcomeTag, stdout: &str) -> Verdict {
        judge(&ready(), Some(&outcome(tag, stdout, "")), "3\n", 1000, 1024).verdict
    }

    #[test]
    fn test_compare_output_exact_match() {
        assert!(compare_output("hello\nworld\n", "hello\nworld\n"));
    }

    #[test]
    fn test_compare_output_trailing_whitespace() {
        assert!(compare_output("hello  \nworld\n", "hello\nworld\n"));
    }

    #[test]
    fn test_compare_output_trailing_newlines() {
        assert!(compare_output("hello\nworld\n\n\n", "hello\nworld\n"));
    }

    #[test]
    fn test_compare_output_different() {
        assert!(!compare_output("hello\nworld\n", "hello\nearth\n"));
    }

    #[test]
    fn test_compare_output_leading_whitespace_matters() {
        assert!(!compare_output(" 3\n", "3\n"));
    }

    #[test]
    fn test_normalization_cases() {
        for stdout in ["3", "3\n", "3 \n", "3\n\n"] {
            assert_eq!(
                verdict_of(OutcomeTag::Completed(0), stdout),
                Verdict::Accepted,
                "{:?} should be accepted",
                stdout
            );
        }
        assert_eq!(verdict_of(OutcomeTag::Completed(0), "4\n"), Verdict::WrongAnswer);
    }

    #[test]
    fn test_compile_error_wins() {
        let build = BuildOutcome::Failed("main.c:1: error".to_string());
        let case = judge(&build, None, "3\n", 1000, 1024);
        assert_eq!(case.verdict, Verdict::CompileError);
        assert_eq!(case.diagnostic.as_deref(), Some("main.c:1: error"));
        assert_eq!(case.time_ms, 0);
    }

    #[test]
    fn test_timeout_beats_output() {
        assert_eq!(verdict_of(OutcomeTag::TimedOut, "3\n"), Verdict::TimeLimitExceeded);
    }

    #[test]
    fn test_runtime_errors() {
        assert_eq!(verdict_of(OutcomeTag::Completed(1), "3\n"), Verdict::RuntimeError);
        assert_eq!(verdict_of(OutcomeTag::Crashed(11), "3\n"), Verdict::RuntimeError);
        assert_eq!(
            verdict_of(OutcomeTag::RunnerError("program not found: ./main".into()), ""),
            Verdict::RuntimeError
        );

        let case = judge(
            &ready(),
            Some(&outcome(OutcomeTag::MemoryExceeded, "", "")),
            "3\n",
            1000,
            1024,
        );
        assert_eq!(case.verdict, Verdict::RuntimeError);
        assert_eq!(case.diagnostic.as_deref(), Some(MEMORY_LIMIT_DIAGNOSTIC));
    }

    #[test]
    fn test_runtime_error_diagnostic_is_truncated_stderr() {
        let stderr = "x".repeat(100);
        let case = judge(
            &ready(),
            Some(&outcome(OutcomeTag::Completed(2), "", &stderr)),
            "3\n",
            1000,
            10,
        );
        assert_eq!(case.diagnostic.as_deref(), Some("xxxxxxxxxx\n... (truncated)"));

        let silent = judge(
            &ready(),
            Some(&outcome(OutcomeTag::Completed(2), "", "")),
            "3\n",
            1000,
            10,
        );
        assert_eq!(silent.diagnostic.as_deref(), Some("exited with code 2"));
    }

    #[test]
    fn test_cancelled() {
        let mut late = outcome(OutcomeTag::Cancelled, "", "");
        late.elapsed_ms = 1000;
        assert_eq!(
            judge(&ready(), Some(&late), "3\n", 1000, 1024).verdict,
            Verdict::TimeLimitExceeded
        );
        assert_eq!(verdict_of(OutcomeTag::Cancelled, "3\n"), Verdict::InternalError);
    }

    #[test]
    fn test_aggregate_first_failure_wins() {
        let case = |verdict, time_ms, memory_kb| CaseVerdict {
            verdict,
            diagnostic: None,
            time_ms,
            memory_kb,
        };

        let mut aggregate = Aggregate::new();
        assert!(aggregate.record(case(Verdict::Accepted, 10, Some(100))));
        assert!(!aggregate.record(case(Verdict::WrongAnswer, 30, None)));
        let result = aggregate.finish();
        assert_eq!(result.verdict, Verdict::WrongAnswer);
        assert_eq!(result.time_ms, Some(30));
        assert_eq!(result.memory_kb, Some(100));

        let mut all_ok = Aggregate::new();
        all_ok.record(case(Verdict::Accepted, 5, Some(10)));
        all_ok.record(case(Verdict::Accepted, 7, Some(8)));
        let result = all_ok.finish();
        assert_eq!(result.verdict, Verdict::Accepted);
        assert_eq!(result.time_ms, Some(7));
        assert_eq!(result.memory_kb, Some(10));
    }

    #[test]
    fn test_empty_aggregate_is_internal_error() {
        assert_eq!(Aggregate::new().finish().verdict, Verdict::InternalError);
    }
}
