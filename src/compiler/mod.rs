//! Compiler module - Source code compilation
//!
//! Builds a submission inside its scratch directory with the sandboxed
//! runner. The build has its own time/memory budget, separate from the
//! per-test-case run limits.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::core::utils::diagnostic;
use crate::error::JudgeError;
use crate::languages::RunnerStrategy;
use crate::runner::{CommandSpec, OutcomeTag, RunLimits, Runner};

/// Result of a build attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Path to run: the produced binary, or the source for interpreted languages
    Ready(PathBuf),
    /// Compiler diagnostic, never empty
    Failed(String),
}

impl BuildOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, BuildOutcome::Ready(_))
    }
}

/// Compile the submission source already written to `work_dir`.
///
/// A compiler that cannot be launched is a [`JudgeError::SandboxSetup`]; a
/// cancelled build is [`JudgeError::DeadlineExceeded`]. Everything the user
/// code can cause ends up as `Failed`.
pub async fn build(
    runner: &dyn Runner,
    work_dir: &Path,
    strategy: &RunnerStrategy,
    limits: &RunLimits,
    max_diagnostic_bytes: usize,
    cancel: &CancelToken,
) -> Result<BuildOutcome, JudgeError> {
    let Some(argv) = strategy.compile_argv(work_dir) else {
        return Ok(BuildOutcome::Ready(work_dir.join(&strategy.source_file)));
    };
    debug!("Compiling {} with {:?}", strategy.name, argv);

    let cmd = CommandSpec::from_vec(&argv, work_dir);
    let outcome = runner.run(&cmd, limits, None, cancel).await;

    let failure = match outcome.tag {
        OutcomeTag::Completed(0) => {
            let binary = work_dir.join(&strategy.binary);
            if binary.is_file() {
                info!(
                    "Compiled {} in {}ms",
                    strategy.name, outcome.elapsed_ms
                );
                return Ok(BuildOutcome::Ready(binary));
            }
            format!(
                "compiler exited successfully but did not produce {}",
                strategy.binary
            )
        }
        OutcomeTag::RunnerError(reason) => {
            return Err(JudgeError::SandboxSetup(format!(
                "compiler for {} failed to launch: {}",
                strategy.name, reason
            )));
        }
        OutcomeTag::Cancelled => return Err(JudgeError::DeadlineExceeded),
        OutcomeTag::TimedOut => format!("build timed out after {}ms", limits.time_ms),
        OutcomeTag::MemoryExceeded => {
            format!("compiler exceeded the {}MB memory limit", limits.memory_mb)
        }
        OutcomeTag::Completed(code) => {
            compiler_message(&outcome.stderr, &outcome.stdout)
                .unwrap_or_else(|| format!("Compilation failed with exit code {}", code))
        }
        OutcomeTag::Crashed(signal) => compiler_message(&outcome.stderr, &outcome.stdout)
            .unwrap_or_else(|| format!("Compiler killed by signal {}", signal)),
    };

    info!("Compilation failed for {}", strategy.name);
    Ok(BuildOutcome::Failed(diagnostic(&failure, max_diagnostic_bytes)))
}

fn compiler_message(stderr: &str, stdout: &str) -> Option<String> {
    [stderr, stdout]
        .into_iter()
        .find(|text| !text.trim().is_empty())
        .map(|text| text.to_string())
}
