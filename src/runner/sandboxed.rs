//! Sandboxed runner implementation
//!
//! Executes untrusted user code (and compilers) under the process supervisor
//! with resource limits.

use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::time::Duration;

use super::{CommandSpec, ExecutionOutcome, OutcomeTag, RunLimits, Runner};
use crate::cancel::CancelToken;
use crate::sandbox::{
    resolve_program, spawn_supervised, ProcessLimits, ProcessSpec, SandboxConfig, Termination,
};

/// Runner that executes code under the process sandbox
#[derive(Debug, Clone)]
pub struct SandboxedRunner {
    config: SandboxConfig,
}

impl SandboxedRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Run a command in the sandbox
    pub async fn execute(
        &self,
        cmd: &CommandSpec,
        limits: &RunLimits,
        stdin: Option<&[u8]>,
        cancel: &CancelToken,
    ) -> ExecutionOutcome {
        let program = match resolve_program(&cmd.program, &cmd.work_dir) {
            Ok(program) => program,
            Err(e) => return ExecutionOutcome::runner_error(e.to_string()),
        };

        let process_limits = ProcessLimits::new(
            &self.config,
            Duration::from_millis(limits.time_ms as u64),
            limits.memory_mb,
        )
        .with_address_space(limits.address_space);

        let spec = ProcessSpec {
            program: &program,
            args: &cmd.args,
            work_dir: &cmd.work_dir,
            stdin,
        };

        let report = match spawn_supervised(spec, &process_limits, cancel).await {
            Ok(report) => report,
            Err(e) => return ExecutionOutcome::runner_error(e.to_string()),
        };

        let tag = match report.termination {
            Termination::Exited(code) => OutcomeTag::Completed(code),
            // RLIMIT_CPU backstop
            Termination::Signaled(sig) if sig == Signal::SIGXCPU as i32 => OutcomeTag::TimedOut,
            Termination::Signaled(sig) => OutcomeTag::Crashed(sig),
            Termination::TimedOut => OutcomeTag::TimedOut,
            Termination::MemoryExceeded => OutcomeTag::MemoryExceeded,
            Termination::Cancelled => OutcomeTag::Cancelled,
        };

        ExecutionOutcome {
            tag,
            truncated: report.stdout.truncated || report.stderr.truncated,
            stdout: report.stdout.text(),
            stderr: report.stderr.text(),
            elapsed_ms: report.elapsed.as_millis() as u64,
            memory_kb: report.peak_memory_kb,
        }
    }
}

#[async_trait]
impl Runner for SandboxedRunner {
    async fn run(
        &self,
        cmd: &CommandSpec,
        limits: &RunLimits,
        stdin: Option<&[u8]>,
        cancel: &CancelToken,
    ) -> ExecutionOutcome {
        self.execute(cmd, limits, stdin, cancel).await
    }
}
