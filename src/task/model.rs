//! Task aggregate and its value types.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::OperatingMode;
use crate::error::TaskError;
use crate::protocol::NextAction;
use crate::task::state::TaskStatus;

/// Length of `TaskSnapshot::result_summary`.
const RESULT_SUMMARY_CHARS: usize = 200;

/// Task priority. Declaration order is dispatch order (highest last).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    /// Numeric weight used in storage.
    pub fn weight(&self) -> i64 {
        match self {
            Self::Low => 1,
            Self::Medium => 5,
            Self::High => 10,
            Self::Critical => 20,
        }
    }

    pub fn from_weight(weight: i64) -> Option<Self> {
        match weight {
            1 => Some(Self::Low),
            5 => Some(Self::Medium),
            10 => Some(Self::High),
            20 => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Session and environment snapshot, fixed for the task's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    session_id: Uuid,
    mode: OperatingMode,
    initial_prompt: String,
    environment: BTreeMap<String, String>,
}

impl TaskContext {
    pub fn new(mode: OperatingMode, initial_prompt: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            mode,
            initial_prompt: initial_prompt.into(),
            environment: BTreeMap::new(),
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn initial_prompt(&self) -> &str {
        &self.initial_prompt
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }
}

/// One record per reasoning cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub timestamp: DateTime<Utc>,
    pub agent_name: String,
    pub action_description: String,
    pub success: bool,
    pub result_data: serde_json::Value,
}

impl ExecutionTrace {
    pub fn new(
        agent_name: impl Into<String>,
        action_description: impl Into<String>,
        success: bool,
        result_data: serde_json::Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            agent_name: agent_name.into(),
            action_description: action_description.into(),
            success,
            result_data,
        }
    }

    /// The next-action hint recorded by this cycle, if any.
    pub fn next_action(&self) -> Option<NextAction> {
        self.result_data
            .get("suggested_next_action")
            .and_then(|v| v.as_str())
            .map(NextAction::parse)
    }
}

/// The unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    pub context: TaskContext,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    /// Worker the next cycle targets.
    pub required_agent: Option<String>,
    /// Worker that ran the last cycle.
    pub delegated_to: Option<String>,
    /// Retry-requested responses received so far.
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub trace_history: Vec<ExecutionTrace>,
    /// Set only on a terminal status.
    pub final_result: Option<serde_json::Value>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(
        description: impl Into<String>,
        context: TaskContext,
        priority: TaskPriority,
        required_agent: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            context,
            priority,
            status: TaskStatus::Pending,
            required_agent,
            delegated_to: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            trace_history: Vec::new(),
            final_result: None,
        }
    }

    /// Transition to a new status.
    pub fn transition_to(&mut self, status: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(status) {
            return Err(TaskError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Append the trace entry for a finished cycle.
    pub fn record(&mut self, trace: ExecutionTrace) {
        self.updated_at = trace.timestamp.max(self.updated_at);
        self.trace_history.push(trace);
    }

    /// Chaining hint left by the previous cycle.
    pub fn last_hint(&self) -> Option<NextAction> {
        self.trace_history.last().and_then(|t| t.next_action())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of cycles run so far.
    pub fn cycles(&self) -> usize {
        self.trace_history.len()
    }
}

/// Caller-facing view of a persisted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub delegated_to: Option<String>,
    pub retry_count: u32,
    pub result_summary: Option<String>,
    pub trace_history: Vec<ExecutionTrace>,
}

impl From<Task> for TaskSnapshot {
    fn from(task: Task) -> Self {
        let result_summary = task.final_result.as_ref().map(|result| {
            let text = match result {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text.chars().take(RESULT_SUMMARY_CHARS).collect()
        });
        Self {
            task_id: task.id,
            status: task.status,
            priority: task.priority,
            delegated_to: task.delegated_to,
            retry_count: task.retry_count,
            result_summary,
            trace_history: task.trace_history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            "Compile weekly report",
            TaskContext::new(OperatingMode::Full, "Compile weekly report"),
            TaskPriority::Low,
            None,
        )
    }

    #[test]
    fn priority_order() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
        assert_eq!(TaskPriority::default(), TaskPriority::Medium);
    }

    #[test]
    fn priority_weight_roundtrip() {
        for p in [
            TaskPriority::Low,
            TaskPriority::Medium,
            TaskPriority::High,
            TaskPriority::Critical,
        ] {
            assert_eq!(TaskPriority::from_weight(p.weight()), Some(p));
        }
        assert_eq!(TaskPriority::from_weight(7), None);
        assert_eq!("CRITICAL".parse::<TaskPriority>().unwrap(), TaskPriority::Critical);
    }

    #[test]
    fn new_task_is_pending() {
        let t = task();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.trace_history.is_empty());
        assert!(t.final_result.is_none());
        assert_eq!(t.retry_count, 0);
    }

    #[test]
    fn invalid_transition_rejected() {
        let mut t = task();
        let err = t.transition_to(TaskStatus::Completed).unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
        assert_eq!(t.status, TaskStatus::Pending);
    }

    #[test]
    fn last_hint_reads_trace_payload() {
        let mut t = task();
        assert!(t.last_hint().is_none());
        t.record(ExecutionTrace::new(
            "researcher",
            "Field research done",
            true,
            serde_json::json!({"suggested_next_action": "DELEGATE_TO_WRITER"}),
        ));
        assert_eq!(t.last_hint(), Some(NextAction::DelegateTo("writer".into())));
        assert_eq!(t.cycles(), 1);
    }

    #[test]
    fn context_builder() {
        let ctx = TaskContext::new(OperatingMode::Lean, "scan")
            .with_env("region", "eu");
        assert_eq!(ctx.mode(), OperatingMode::Lean);
        assert_eq!(ctx.environment().get("region").map(String::as_str), Some("eu"));
        assert_eq!(ctx.initial_prompt(), "scan");
    }

    #[test]
    fn snapshot_truncates_summary() {
        let mut t = task();
        t.final_result = Some(serde_json::Value::String("x".repeat(500)));
        let snap = TaskSnapshot::from(t);
        assert_eq!(snap.result_summary.unwrap().chars().count(), 200);
    }
}
