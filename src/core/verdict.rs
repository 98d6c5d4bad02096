use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Verdict from judging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    CompileError,
    RuntimeError,
    TimeLimitExceeded,
    InternalError,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SubmissionStatus::from(*self))
    }
}

/// Persisted lifecycle status of a submission.
///
/// `Queued` is initial, everything after `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Queued,
    Running,
    Accepted,
    WrongAnswer,
    CompileError,
    RuntimeError,
    TimeLimitExceeded,
    InternalError,
}

impl SubmissionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SubmissionStatus::Queued | SubmissionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::Queued => "queued",
            SubmissionStatus::Running => "running",
            SubmissionStatus::Accepted => "accepted",
            SubmissionStatus::WrongAnswer => "wrong_answer",
            SubmissionStatus::CompileError => "compile_error",
            SubmissionStatus::RuntimeError => "runtime_error",
            SubmissionStatus::TimeLimitExceeded => "time_limit_exceeded",
            SubmissionStatus::InternalError => "internal_error",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Running -> Running` is the takeover a redelivered claim performs.
    pub fn can_transition_to(self, next: SubmissionStatus) -> bool {
        match (self, next) {
            (SubmissionStatus::Queued, SubmissionStatus::Running) => true,
            (SubmissionStatus::Running, SubmissionStatus::Running) => true,
            // Dead-lettering may happen before the claim moved it to running.
            (SubmissionStatus::Queued, SubmissionStatus::InternalError) => true,
            (SubmissionStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "queued" => SubmissionStatus::Queued,
            "running" => SubmissionStatus::Running,
            "accepted" => SubmissionStatus::Accepted,
            "wrong_answer" => SubmissionStatus::WrongAnswer,
            "compile_error" => SubmissionStatus::CompileError,
            "runtime_error" => SubmissionStatus::RuntimeError,
            "time_limit_exceeded" => SubmissionStatus::TimeLimitExceeded,
            "internal_error" => SubmissionStatus::InternalError,
            other => return Err(format!("unknown submission status: {}", other)),
        };
        Ok(status)
    }
}

impl From<Verdict> for SubmissionStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Accepted => SubmissionStatus::Accepted,
            Verdict::WrongAnswer => SubmissionStatus::WrongAnswer,
            Verdict::CompileError => SubmissionStatus::CompileError,
            Verdict::RuntimeError => SubmissionStatus::RuntimeError,
            Verdict::TimeLimitExceeded => SubmissionStatus::TimeLimitExceeded,
            Verdict::InternalError => SubmissionStatus::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            SubmissionStatus::Queued,
            SubmissionStatus::Running,
            SubmissionStatus::TimeLimitExceeded,
            SubmissionStatus::InternalError,
        ] {
            assert_eq!(status.as_str().parse::<SubmissionStatus>(), Ok(status));
        }
        assert!("pending".parse::<SubmissionStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SubmissionStatus::Queued.is_terminal());
        assert!(!SubmissionStatus::Running.is_terminal());
        assert!(SubmissionStatus::Accepted.is_terminal());
        assert!(SubmissionStatus::CompileError.is_terminal());
    }

    #[test]
    fn test_transitions_are_monotonic() {
        use SubmissionStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Accepted));
        assert!(Running.can_transition_to(Running));
        assert!(!Queued.can_transition_to(Accepted));
        assert!(!Accepted.can_transition_to(Running));
        assert!(!WrongAnswer.can_transition_to(Accepted));
        assert!(!Running.can_transition_to(Queued));
    }

    #[test]
    fn test_verdict_display_matches_status() {
        assert_eq!(Verdict::WrongAnswer.to_string(), "wrong_answer");
        assert_eq!(Verdict::TimeLimitExceeded.to_string(), "time_limit_exceeded");
        assert_eq!(
            serde_json::to_string(&Verdict::InternalError).unwrap(),
            "\"internal_error\""
        );
    }
}
