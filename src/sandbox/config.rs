//! Sandbox configuration
//!
//! Limits and isolation knobs applied to every sandboxed process.

use anyhow::Result;
use serde::Deserialize;

use crate::config::env_or;

/// How the sandbox obtains a private network namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkIsolation {
    /// Unshare the network namespace; refuse to run the program if that fails.
    Strict,
    /// Unshare if the kernel allows it, run anyway otherwise.
    BestEffort,
    /// Leave the network namespace alone (isolation provided by the host).
    Off,
}

impl std::str::FromStr for NetworkIsolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(NetworkIsolation::Strict),
            "best_effort" | "best-effort" => Ok(NetworkIsolation::BestEffort),
            "off" | "none" => Ok(NetworkIsolation::Off),
            other => Err(format!("invalid network isolation mode: {}", other)),
        }
    }
}

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Compile time limit in milliseconds (default: 30000ms = 30s)
    pub compile_time_limit_ms: u32,
    /// Compile memory limit in MB (default: 2048MB)
    pub compile_memory_limit_mb: u32,
    /// Bytes kept from each of stdout and stderr; the rest is discarded
    pub max_output_bytes: usize,
    /// Bytes of stderr / compiler output kept as verdict diagnostic
    pub max_diagnostic_bytes: usize,
    pub network: NetworkIsolation,
    /// Unprivileged uid/gid to run submissions as (requires a root worker)
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// RLIMIT_NPROC; only meaningful together with a dedicated `uid`
    pub max_processes: Option<u64>,
    pub open_files: u64,
    pub fsize_kb: u64,
    /// Interval between peak memory samples
    pub memory_poll_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            compile_time_limit_ms: 30_000,
            compile_memory_limit_mb: 2048,
            max_output_bytes: 8 * 1024 * 1024,
            max_diagnostic_bytes: 8 * 1024,
            network: NetworkIsolation::Strict,
            uid: None,
            gid: None,
            max_processes: None,
            open_files: 256,
            fsize_kb: 262_144, // 256MB
            memory_poll_ms: 10,
        }
    }
}

impl SandboxConfig {
    /// Load configuration, falling back to the defaults for unset variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let uid: Option<u32> = std::env::var("SANDBOX_UID").ok().map(|v| v.parse()).transpose()?;
        let gid: Option<u32> = std::env::var("SANDBOX_GID").ok().map(|v| v.parse()).transpose()?;
        let max_processes: Option<u64> = std::env::var("SANDBOX_MAX_PROCESSES")
            .ok()
            .map(|v| v.parse())
            .transpose()?
            .or(uid.map(|_| 64));

        Ok(Self {
            compile_time_limit_ms: env_or("COMPILE_TIME_LIMIT_MS", defaults.compile_time_limit_ms)?,
            compile_memory_limit_mb: env_or(
                "COMPILE_MEMORY_LIMIT_MB",
                defaults.compile_memory_limit_mb,
            )?,
            max_output_bytes: env_or("MAX_OUTPUT_BYTES", defaults.max_output_bytes)?,
            max_diagnostic_bytes: env_or("MAX_DIAGNOSTIC_BYTES", defaults.max_diagnostic_bytes)?,
            network: env_or("SANDBOX_NETWORK", defaults.network)?,
            uid,
            gid: gid.or(uid),
            max_processes,
            open_files: defaults.open_files,
            fsize_kb: defaults.fsize_kb,
            memory_poll_ms: defaults.memory_poll_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_mode_parse() {
        assert_eq!("strict".parse(), Ok(NetworkIsolation::Strict));
        assert_eq!("best-effort".parse(), Ok(NetworkIsolation::BestEffort));
        assert_eq!("OFF".parse(), Ok(NetworkIsolation::Off));
        assert!("sometimes".parse::<NetworkIsolation>().is_err());
    }

    #[test]
    fn test_defaults_isolate_network() {
        let config = SandboxConfig::default();
        assert_eq!(config.network, NetworkIsolation::Strict);
        assert!(config.max_output_bytes > config.max_diagnostic_bytes);
    }
}
