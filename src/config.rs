//! Worker configuration
//!
//! Everything a worker needs is read once at startup and passed around
//! explicitly inside [`crate::worker::WorkerContext`].

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::sandbox::SandboxConfig;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    /// Language table; the bundled one is used when unset
    pub languages_path: Option<PathBuf>,
    /// Parent directory of the per-attempt scratch directories
    pub scratch_root: PathBuf,
    pub worker_count: usize,
    /// Maximum time one dequeue call waits for a job
    pub poll_interval: Duration,
    /// How long a claimed job stays invisible to other workers
    pub visibility_timeout: Duration,
    /// Bound on each state-store / queue request
    pub request_timeout: Duration,
    /// Deliveries allowed before a job is dead-lettered as `internal_error`
    pub max_attempts: u32,
    /// Added on top of build + run budgets to form the per-job deadline
    pub deadline_slack: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub sandbox: SandboxConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".into(),
            languages_path: None,
            scratch_root: std::env::temp_dir().join("judge-scratch"),
            worker_count: 1,
            poll_interval: Duration::from_millis(1000),
            visibility_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(5),
            max_attempts: 3,
            deadline_slack: Duration::from_secs(5),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            languages_path: std::env::var("LANGUAGES_CONFIG").ok().map(PathBuf::from),
            scratch_root: std::env::var("SCRATCH_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_root),
            worker_count: env_or("WORKER_COUNT", defaults.worker_count)?,
            poll_interval: env_ms("POLL_INTERVAL_MS", defaults.poll_interval)?,
            visibility_timeout: env_ms("VISIBILITY_TIMEOUT_MS", defaults.visibility_timeout)?,
            request_timeout: env_ms("REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            max_attempts: env_or("MAX_ATTEMPTS", defaults.max_attempts)?,
            deadline_slack: env_ms("JOB_DEADLINE_SLACK_MS", defaults.deadline_slack)?,
            backoff_initial: defaults.backoff_initial,
            backoff_max: defaults.backoff_max,
            sandbox: SandboxConfig::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            anyhow::bail!("WORKER_COUNT must be at least 1");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("MAX_ATTEMPTS must be at least 1");
        }
        if self.poll_interval.is_zero() {
            anyhow::bail!("POLL_INTERVAL_MS must be positive");
        }
        // Claims are extended every third of the timeout; each extension must
        // land before the claim runs out.
        if self.visibility_timeout <= self.request_timeout * 2 {
            anyhow::bail!(
                "VISIBILITY_TIMEOUT_MS ({:?}) must be more than twice REQUEST_TIMEOUT_MS ({:?})",
                self.visibility_timeout,
                self.request_timeout
            );
        }
        Ok(())
    }
}

/// Read and parse an environment variable, using `default` when unset.
pub fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn env_ms(key: &str, default: Duration) -> Result<Duration> {
    let ms = env_or(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_default_when_unset() {
        let value: u32 = env_or("JUDGE_WORKER_TEST_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_env_or_parses_and_rejects() {
        std::env::set_var("JUDGE_WORKER_TEST_COUNT", " 4 ");
        let value: usize = env_or("JUDGE_WORKER_TEST_COUNT", 1).unwrap();
        assert_eq!(value, 4);

        std::env::set_var("JUDGE_WORKER_TEST_BAD", "four");
        let err = env_or::<usize>("JUDGE_WORKER_TEST_BAD", 1).unwrap_err();
        assert!(err.to_string().contains("JUDGE_WORKER_TEST_BAD"));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = WorkerConfig {
            worker_count: 0,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unextendable_claims() {
        let config = WorkerConfig {
            visibility_timeout: Duration::from_secs(8),
            request_timeout: Duration::from_secs(5),
            ..WorkerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("VISIBILITY_TIMEOUT_MS"));
    }
}
