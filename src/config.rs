//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::task::RetryPolicy;

/// Operating mode. Decides which static workers are admitted at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Constrained host: lightweight workers only.
    Lean,
    /// Server host: every worker.
    Full,
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lean => write!(f, "lean"),
            Self::Full => write!(f, "full"),
        }
    }
}

impl FromStr for OperatingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lean" | "edge" | "client" => Ok(Self::Lean),
            "full" | "server" => Ok(Self::Full),
            other => Err(ConfigError::InvalidValue {
                key: "CORTEX_MODE".to_string(),
                message: format!("unknown mode '{other}' (expected lean or full)"),
            }),
        }
    }
}

/// Process-wide configuration, built once at startup and passed down.
#[derive(Debug, Clone)]
pub struct CortexConfig {
    pub mode: OperatingMode,
    /// libSQL file. `None` keeps tasks in memory.
    pub db_path: Option<PathBuf>,
    /// Number of dispatch workers pulling from the queue.
    pub dispatch_workers: usize,
    /// How long an idle dispatch worker waits for new work before re-checking.
    pub idle_wait: Duration,
    /// Deadline for a single worker invocation.
    pub worker_timeout: Duration,
    /// Maximum reasoning cycles for one task.
    pub max_cycles: u32,
    /// Save attempts after a cycle before giving up on the write.
    pub persist_retries: u32,
    /// Delay between save attempts.
    pub persist_retry_delay: Duration,
    pub retry: RetryPolicy,
    /// Directory for rolling log files.
    pub log_dir: Option<PathBuf>,
}

impl Default for CortexConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::Full,
            db_path: None,
            dispatch_workers: 1,
            idle_wait: Duration::from_millis(500),
            worker_timeout: Duration::from_secs(30),
            max_cycles: 16,
            persist_retries: 3,
            persist_retry_delay: Duration::from_millis(200),
            retry: RetryPolicy::default(),
            log_dir: None,
        }
    }
}

impl CortexConfig {
    /// Build config from `CORTEX_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mode = match lookup("CORTEX_MODE") {
            Some(raw) => raw.parse()?,
            None => defaults.mode,
        };

        let parse_u64 = |key: &str, default: u64| -> u64 {
            match lookup(key) {
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    tracing::warn!(key, value = %raw, default, "Invalid number, using default");
                    default
                }),
                None => default,
            }
        };

        let dispatch_workers = parse_u64("CORTEX_DISPATCH_WORKERS", defaults.dispatch_workers as u64)
            .max(1) as usize;

        Ok(Self {
            mode,
            db_path: lookup("CORTEX_DB_PATH")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            dispatch_workers,
            idle_wait: Duration::from_millis(parse_u64(
                "CORTEX_IDLE_WAIT_MS",
                defaults.idle_wait.as_millis() as u64,
            )),
            worker_timeout: Duration::from_secs(parse_u64(
                "CORTEX_WORKER_TIMEOUT_SECS",
                defaults.worker_timeout.as_secs(),
            )),
            max_cycles: parse_u64("CORTEX_MAX_CYCLES", defaults.max_cycles as u64) as u32,
            persist_retries: parse_u64("CORTEX_PERSIST_RETRIES", defaults.persist_retries as u64)
                as u32,
            persist_retry_delay: Duration::from_millis(parse_u64(
                "CORTEX_PERSIST_RETRY_MS",
                defaults.persist_retry_delay.as_millis() as u64,
            )),
            retry: defaults.retry,
            log_dir: lookup("CORTEX_LOG_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}
