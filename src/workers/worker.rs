//! Worker contract and static worker definitions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::OperatingMode;
use crate::protocol::{AgentMessage, AgentResponse};

/// A pluggable executor.
///
/// Expected failures (bad input, unavailable upstream) must come back as a
/// `success = false` response. Only genuine defects may panic; the reasoning
/// core catches those.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Identifier this instance was resolved under.
    fn name(&self) -> &str;

    /// Execute one request.
    async fn execute(&self, message: &AgentMessage) -> AgentResponse;
}

/// Capability tier of a worker implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerTier {
    /// Cheap enough to run in lean mode.
    Lightweight,
    /// Needs a full host.
    Full,
}

impl WorkerTier {
    /// Whether a worker of this tier may be registered in `mode`.
    pub fn admitted_in(&self, mode: OperatingMode) -> bool {
        match mode {
            OperatingMode::Full => true,
            OperatingMode::Lean => *self == WorkerTier::Lightweight,
        }
    }

    /// Ad-hoc workers get the richest tier the mode allows.
    pub fn for_mode(mode: OperatingMode) -> Self {
        match mode {
            OperatingMode::Lean => WorkerTier::Lightweight,
            OperatingMode::Full => WorkerTier::Full,
        }
    }
}

impl std::fmt::Display for WorkerTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lightweight => write!(f, "lightweight"),
            Self::Full => write!(f, "full"),
        }
    }
}

/// Per-resolution settings handed to a factory.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub mode: OperatingMode,
    pub timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::Full,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Builds a worker instance under a given id.
pub type WorkerFactory = Arc<dyn Fn(&str, &WorkerConfig) -> Arc<dyn Worker> + Send + Sync>;

/// Static catalogue entry.
#[derive(Clone)]
pub struct WorkerDefinition {
    pub id: String,
    pub description: String,
    pub tier: WorkerTier,
    pub factory: WorkerFactory,
}

impl WorkerDefinition {
    pub fn new<F>(id: impl Into<String>, description: impl Into<String>, tier: WorkerTier, factory: F) -> Self
    where
        F: Fn(&str, &WorkerConfig) -> Arc<dyn Worker> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            description: description.into(),
            tier,
            factory: Arc::new(factory),
        }
    }
}

impl std::fmt::Debug for WorkerDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDefinition")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .finish_non_exhaustive()
    }
}
