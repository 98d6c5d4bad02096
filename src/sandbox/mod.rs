//! Sandbox module - Low-level process supervision
//!
//! This module provides a minimal abstraction over running one untrusted
//! program. It handles:
//! - Per-attempt scratch directories
//! - Resource limits and isolation applied between fork and exec
//! - Bounded stdout/stderr capture
//! - Wall-clock deadline and process group teardown
//! - Raw command execution returning `ProcessReport`
//!
//! The sandbox module does NOT:
//! - Interpret verdicts (that's the judge's job)
//! - Know about languages or compilation
//! - Compare outputs

pub mod config;
pub mod process;
pub mod scratch;

// Re-exports for convenience
pub use config::{NetworkIsolation, SandboxConfig};
pub use process::{
    resolve_program, spawn_supervised, Captured, LaunchError, ProcessLimits, ProcessReport,
    ProcessSpec, Termination, SANDBOX_PATH,
};
pub use scratch::ScratchDir;
