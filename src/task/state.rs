//! Task state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Submitted, never dispatched.
    Pending,
    /// A cycle is choosing the target worker.
    Analysis,
    /// A worker has been chosen (or suggested by a chaining hint).
    Delegated,
    /// The worker is executing.
    InProgress,
    /// Work is complete.
    Completed,
    /// Failed and will not be retried automatically.
    Failed,
    /// The worker asked for another attempt.
    Retry,
    /// A backoff timer is armed; the task re-enters the queue when it fires.
    WaitingBackoff,
}

impl TaskStatus {
    /// Every status that still needs dispatching.
    pub const NON_TERMINAL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Analysis,
        TaskStatus::Delegated,
        TaskStatus::InProgress,
        TaskStatus::Retry,
        TaskStatus::WaitingBackoff,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Analysis) | (Pending, Failed) |
            // From Analysis
            (Analysis, Delegated) | (Analysis, Failed) |
            // From Delegated (chaining re-enters analysis)
            (Delegated, InProgress) | (Delegated, Analysis) | (Delegated, Failed) |
            // From InProgress (Analysis only when resuming after a crash)
            (InProgress, Completed) | (InProgress, Failed) |
            (InProgress, Retry) | (InProgress, WaitingBackoff) |
            (InProgress, Delegated) | (InProgress, Analysis) |
            // From Retry
            (Retry, Analysis) | (Retry, WaitingBackoff) | (Retry, Failed) |
            // From WaitingBackoff
            (WaitingBackoff, Analysis) | (WaitingBackoff, Failed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if the task still needs dispatching.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analysis => "analysis",
            Self::Delegated => "delegated",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retry => "retry",
            Self::WaitingBackoff => "waiting_backoff",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "analysis" => Ok(Self::Analysis),
            "delegated" => Ok(Self::Delegated),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retry" => Ok(Self::Retry),
            "waiting_backoff" => Ok(Self::WaitingBackoff),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_path_is_valid() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Analysis));
        assert!(TaskStatus::Analysis.can_transition_to(TaskStatus::Delegated));
        assert!(TaskStatus::Delegated.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Retry));
        assert!(TaskStatus::Retry.can_transition_to(TaskStatus::Analysis));
        assert!(TaskStatus::WaitingBackoff.can_transition_to(TaskStatus::Analysis));
        assert!(TaskStatus::Delegated.can_transition_to(TaskStatus::Analysis));
    }

    #[test]
    fn terminal_states_are_closed() {
        for target in TaskStatus::NON_TERMINAL {
            assert!(!TaskStatus::Completed.can_transition_to(target));
            assert!(!TaskStatus::Failed.can_transition_to(target));
        }
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn cannot_skip_delegation() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
        assert!(!TaskStatus::Analysis.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Retry.is_terminal());
        assert!(!TaskStatus::WaitingBackoff.is_terminal());
        assert!(TaskStatus::NON_TERMINAL.iter().all(|s| s.is_active()));
    }

    #[test]
    fn status_string_roundtrip() {
        for status in TaskStatus::NON_TERMINAL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert_eq!("completed".parse::<TaskStatus>().unwrap(), TaskStatus::Completed);
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn status_serde_matches_display() {
        let json = serde_json::to_string(&TaskStatus::WaitingBackoff).unwrap();
        assert_eq!(json, "\"waiting_backoff\"");
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    }
}
