//! Request/response envelopes exchanged between the reasoning core and workers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Action type carried by every dispatch-cycle request.
pub const ACTION_EXECUTE_TASK: &str = "EXECUTE_TASK";

/// Interpretation of a worker's `suggested_next_action` hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    /// `TASK_COMPLETED`
    Complete,
    /// `DELEGATE_TO_<WORKER>`; the worker id is lowercased.
    DelegateTo(String),
    /// `RETRY_REQUESTED`: transient failure.
    RetryRequested,
    /// `NEED_REVIEW`: permanent failure, a human has to look at it.
    ManualReview,
    /// Anything the core does not recognise.
    Other(String),
}

impl NextAction {
    const DELEGATE_PREFIX: &'static str = "DELEGATE_TO_";

    pub fn parse(hint: &str) -> Self {
        let upper = hint.trim().to_ascii_uppercase();
        match upper.as_str() {
            "TASK_COMPLETED" | "COMPLETED" | "DONE" => Self::Complete,
            "RETRY_REQUESTED" | "RETRY" => Self::RetryRequested,
            "NEED_REVIEW" | "MANUAL_REVIEW" | "MANUAL_REVIEW_REQUESTED" => Self::ManualReview,
            s if s.len() > Self::DELEGATE_PREFIX.len() && s.starts_with(Self::DELEGATE_PREFIX) => {
                Self::DelegateTo(s[Self::DELEGATE_PREFIX.len()..].to_ascii_lowercase())
            }
            _ => Self::Other(hint.trim().to_string()),
        }
    }

    /// Wire form of the hint.
    pub fn as_hint(&self) -> String {
        match self {
            Self::Complete => "TASK_COMPLETED".to_string(),
            Self::DelegateTo(worker) => {
                format!("{}{}", Self::DELEGATE_PREFIX, worker.to_ascii_uppercase())
            }
            Self::RetryRequested => "RETRY_REQUESTED".to_string(),
            Self::ManualReview => "NEED_REVIEW".to_string(),
            Self::Other(s) => s.clone(),
        }
    }
}

/// Per-call resource limits handed to a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub timeout_ms: Option<u64>,
    pub max_output_bytes: Option<usize>,
}

/// Request envelope. Workers only ever see it by shared reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub message_id: Uuid,
    pub task_id: Uuid,
    pub action_type: String,
    pub raw_prompt: String,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub resource_limits: Option<ResourceLimits>,
}

impl AgentMessage {
    /// Create a message with a fresh message id.
    pub fn new(task_id: Uuid, action_type: impl Into<String>, raw_prompt: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            task_id,
            action_type: action_type.into(),
            raw_prompt: raw_prompt.into(),
            parameters: BTreeMap::new(),
            resource_limits: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }
}

/// Response envelope, built once per reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Must equal the originating request's id.
    pub message_id: Uuid,
    pub task_id: Uuid,
    pub success: bool,
    pub status_code: u16,
    pub output_data: serde_json::Value,
    pub execution_time_ms: f64,
    pub suggested_next_action: Option<String>,
    pub log_message: String,
    pub error_details: Option<String>,
}

impl AgentResponse {
    /// A successful reply to `message`.
    pub fn ok(message: &AgentMessage, output: impl Into<serde_json::Value>) -> Self {
        Self {
            message_id: message.message_id,
            task_id: message.task_id,
            success: true,
            status_code: 200,
            output_data: output.into(),
            execution_time_ms: 0.0,
            suggested_next_action: None,
            log_message: "Execution finished.".to_string(),
            error_details: None,
        }
    }

    /// A worker-reported failure in reply to `message`.
    pub fn failed(message: &AgentMessage, status_code: u16, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            message_id: message.message_id,
            task_id: message.task_id,
            success: false,
            status_code,
            output_data: serde_json::Value::Null,
            execution_time_ms: 0.0,
            suggested_next_action: None,
            log_message: error.clone(),
            error_details: Some(error),
        }
    }

    pub fn with_next_action(mut self, action: NextAction) -> Self {
        self.suggested_next_action = Some(action.as_hint());
        self
    }

    pub fn with_log(mut self, log_message: impl Into<String>) -> Self {
        self.log_message = log_message.into();
        self
    }

    pub fn with_execution_time(mut self, ms: f64) -> Self {
        self.execution_time_ms = ms;
        self
    }

    pub fn next_action(&self) -> Option<NextAction> {
        self.suggested_next_action.as_deref().map(NextAction::parse)
    }

    /// Check that this response answers `message`.
    pub fn corresponds_to(&self, message: &AgentMessage) -> Result<(), String> {
        if self.task_id != message.task_id {
            return Err(format!(
                "response task_id {} does not match request task_id {}",
                self.task_id, message.task_id
            ));
        }
        if self.message_id != message.message_id {
            return Err(format!(
                "response message_id {} does not match request message_id {}",
                self.message_id, message.message_id
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_hints() {
        assert_eq!(NextAction::parse("TASK_COMPLETED"), NextAction::Complete);
        assert_eq!(NextAction::parse("retry_requested"), NextAction::RetryRequested);
        assert_eq!(NextAction::parse("NEED_REVIEW"), NextAction::ManualReview);
        assert_eq!(
            NextAction::parse("DELEGATE_TO_ENGINEER"),
            NextAction::DelegateTo("engineer".into())
        );
    }

    #[test]
    fn bare_delegate_prefix_is_unrecognised() {
        assert_eq!(
            NextAction::parse("DELEGATE_TO_"),
            NextAction::Other("DELEGATE_TO_".into())
        );
        assert_eq!(NextAction::parse("shrug"), NextAction::Other("shrug".into()));
    }

    #[test]
    fn hint_wire_form() {
        assert_eq!(NextAction::DelegateTo("writer".into()).as_hint(), "DELEGATE_TO_WRITER");
        assert_eq!(
            NextAction::parse(&NextAction::ManualReview.as_hint()),
            NextAction::ManualReview
        );
    }

    #[test]
    fn fresh_message_ids() {
        let task_id = Uuid::new_v4();
        let a = AgentMessage::new(task_id, ACTION_EXECUTE_TASK, "p");
        let b = AgentMessage::new(task_id, ACTION_EXECUTE_TASK, "p");
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn response_correspondence() {
        let msg = AgentMessage::new(Uuid::new_v4(), ACTION_EXECUTE_TASK, "p")
            .with_param("mode", "full");
        assert_eq!(msg.param_str("mode"), Some("full"));

        let resp = AgentResponse::ok(&msg, "done");
        assert!(resp.corresponds_to(&msg).is_ok());

        let mut forged = resp.clone();
        forged.task_id = Uuid::new_v4();
        assert!(forged.corresponds_to(&msg).is_err());

        let mut stale = resp;
        stale.message_id = Uuid::new_v4();
        assert!(stale.corresponds_to(&msg).is_err());
    }

    #[test]
    fn failed_response_carries_error() {
        let msg = AgentMessage::new(Uuid::new_v4(), ACTION_EXECUTE_TASK, "p");
        let resp = AgentResponse::failed(&msg, 503, "upstream unavailable")
            .with_next_action(NextAction::RetryRequested);
        assert!(!resp.success);
        assert_eq!(resp.error_details.as_deref(), Some("upstream unavailable"));
        assert_eq!(resp.next_action(), Some(NextAction::RetryRequested));
    }
}
