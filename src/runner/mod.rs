//! Runner module - Execution abstraction layer
//!
//! This module provides a unified interface for running programs:
//! - `SandboxedRunner`: For untrusted user code and the compilers that build it
//!
//! The runner module does NOT:
//! - Compare outputs or determine verdicts
//! - Cache compiled binaries
//! - Know about problem-specific logic

pub mod sandboxed;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;

/// Command specification for execution
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Working directory (the attempt's scratch directory)
    pub work_dir: PathBuf,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, work_dir: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: work_dir.as_ref().to_path_buf(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    /// Create from a command vector (first element is program, rest are args)
    pub fn from_vec(cmd: &[String], work_dir: impl AsRef<Path>) -> Self {
        let mut iter = cmd.iter();
        let program = iter.next().cloned().unwrap_or_default();
        Self::new(program, work_dir).with_args(iter.cloned())
    }
}

/// Resource limits for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    /// Time limit in milliseconds
    pub time_ms: u32,
    /// Memory limit in MB
    pub memory_mb: u32,
    /// Enforce the memory limit on the address space as well
    pub address_space: bool,
}

impl RunLimits {
    pub fn new(time_ms: u32, memory_mb: u32) -> Self {
        Self {
            time_ms,
            memory_mb,
            address_space: true,
        }
    }

    pub fn with_address_space(mut self, enabled: bool) -> Self {
        self.address_space = enabled;
        self
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self::new(1000, 256)
    }
}

/// How an execution ended (raw, no verdict interpretation)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeTag {
    /// Program exited on its own with given exit code
    Completed(i32),
    /// Wall-clock (or CPU backstop) limit reached
    TimedOut,
    /// Killed by signal
    Crashed(i32),
    /// Peak memory went over the limit
    MemoryExceeded,
    /// The program could not be started
    RunnerError(String),
    /// The job was cancelled while the program ran
    Cancelled,
}

/// Outcome of running a program
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub tag: OutcomeTag,
    /// Stdout content, possibly truncated
    pub stdout: String,
    /// Stderr content, possibly truncated
    pub stderr: String,
    /// Wall time in milliseconds
    pub elapsed_ms: u64,
    /// Peak memory in KB, when measurable
    pub memory_kb: Option<u64>,
    /// stdout or stderr hit the capture bound
    pub truncated: bool,
}

impl ExecutionOutcome {
    /// Outcome for a program that never started
    pub fn runner_error(reason: impl Into<String>) -> Self {
        Self {
            tag: OutcomeTag::RunnerError(reason.into()),
            stdout: String::new(),
            stderr: String::new(),
            elapsed_ms: 0,
            memory_kb: None,
            truncated: false,
        }
    }

    /// Check if execution was successful (exited with code 0)
    pub fn is_success(&self) -> bool {
        self.tag == OutcomeTag::Completed(0)
    }
}

/// Runner trait for executing programs
///
/// Launch failures are reported as [`OutcomeTag::RunnerError`], never as an
/// error, so a broken submission cannot fault the worker.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run a command with the given limits and optional stdin
    async fn run(
        &self,
        cmd: &CommandSpec,
        limits: &RunLimits,
        stdin: Option<&[u8]>,
        cancel: &CancelToken,
    ) -> ExecutionOutcome;
}

// Re-exports
pub use sandboxed::SandboxedRunner;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_from_vec() {
        let cmd = CommandSpec::from_vec(
            &["python3".to_string(), "main.py".to_string()],
            "/tmp/work",
        );
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args, vec!["main.py"]);
        assert_eq!(cmd.work_dir, PathBuf::from("/tmp/work"));
    }

    #[test]
    fn test_empty_command_has_no_program() {
        let cmd = CommandSpec::from_vec(&[], "/tmp");
        assert!(cmd.program.is_empty());
        assert!(cmd.args.is_empty());
    }
}
