//! ReasoningCore: one analysis → delegation → execution → review cycle.
//!
//! A cycle takes a non-terminal task, picks its worker, sends it one
//! `AgentMessage`, maps the `AgentResponse` onto the state machine and
//! appends exactly one `ExecutionTrace`. Nothing a worker does escapes this
//! boundary: panics, deadline expiry and envelope mismatches all end up as
//! task state, never as an error returned to the scheduler.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::CortexConfig;
use crate::error::{Error, RegistryError, TaskError};
use crate::protocol::{ACTION_EXECUTE_TASK, AgentMessage, AgentResponse, NextAction, ResourceLimits};
use crate::task::{ExecutionTrace, Task, TaskStatus};
use crate::workers::{Worker, WorkerConfig, WorkerRegistry, WorkerTier};

/// Status code used when a worker misses its deadline.
pub const DEADLINE_EXCEEDED: u16 = 504;

/// Agent name recorded when a cycle never reached a worker.
const CORE_AGENT: &str = "core";

/// A worker chosen for the current cycle.
pub struct Dispatch {
    pub worker_id: String,
    worker: Arc<dyn Worker>,
    /// Set when the requested worker was missing and an ad-hoc one stood in.
    pub fallback: Option<String>,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("worker_id", &self.worker_id)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

/// How a worker invocation ended.
enum Invocation {
    Replied(AgentResponse),
    Panicked(String),
}

pub struct ReasoningCore {
    registry: Arc<WorkerRegistry>,
    worker_timeout: Duration,
    max_cycles: usize,
}

impl ReasoningCore {
    pub fn new(registry: Arc<WorkerRegistry>, config: &CortexConfig) -> Self {
        Self {
            registry,
            worker_timeout: config.worker_timeout,
            max_cycles: config.max_cycles as usize,
        }
    }

    /// Run one full cycle on `task`.
    pub async fn process_one_cycle(&self, task: &mut Task) {
        if let Some(dispatch) = self.prepare(task).await {
            self.execute(task, dispatch).await;
        }
    }

    /// Analysis and delegation: choose the worker and move the task to
    /// IN_PROGRESS.
    ///
    /// Returns `None` when the cycle ended before reaching a worker. The task
    /// is then FAILED and the cycle's trace entry is already recorded.
    pub async fn prepare(&self, task: &mut Task) -> Option<Dispatch> {
        if task.is_terminal() {
            warn!(task_id = %task.id, status = %task.status, "Cycle requested for terminal task");
            return None;
        }

        if task.cycles() >= self.max_cycles {
            warn!(task_id = %task.id, cycles = task.cycles(), "Cycle limit reached");
            let reason = format!("Cycle limit of {} reached", self.max_cycles);
            self.finish(
                task,
                TaskStatus::Failed,
                ExecutionTrace::new(CORE_AGENT, reason.clone(), false, json!({ "error_details": reason })),
                Some(json!({ "error": reason })),
            );
            return None;
        }

        match self.plan(task).await {
            Ok(dispatch) => Some(dispatch),
            Err(e) => {
                let agent = task.required_agent.clone().unwrap_or_else(|| CORE_AGENT.to_string());
                self.fail_defect(task, &agent, format!("Delegation failed: {e}"), json!({}));
                None
            }
        }
    }

    async fn plan(&self, task: &mut Task) -> Result<Dispatch, Error> {
        if task.status != TaskStatus::Analysis {
            task.transition_to(TaskStatus::Analysis)?;
        }

        // A chaining hint from the previous cycle wins over the stored target.
        let target = match task.last_hint() {
            Some(NextAction::DelegateTo(worker)) => Some(worker),
            _ => task.required_agent.clone(),
        };

        let mode = task.context.mode();
        let config = WorkerConfig {
            mode,
            timeout: self.worker_timeout,
        };

        let (worker_id, worker, fallback) = match target {
            Some(id) => match self.registry.resolve(&id, &config).await {
                Ok(worker) => (id, worker, None),
                Err(RegistryError::NotFound { .. }) => {
                    let (ad_hoc, worker) = self.synthesize(task, &config).await?;
                    let note = format!("Worker '{id}' not registered; using ad-hoc '{ad_hoc}'");
                    info!(task_id = %task.id, requested = %id, worker = %ad_hoc, "Resolution fallback");
                    (ad_hoc, worker, Some(note))
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                let (ad_hoc, worker) = self.synthesize(task, &config).await?;
                let note = format!("No worker requested; using ad-hoc '{ad_hoc}'");
                info!(task_id = %task.id, worker = %ad_hoc, "Resolution fallback");
                (ad_hoc, worker, Some(note))
            }
        };

        task.required_agent = Some(worker_id.clone());
        task.delegated_to = Some(worker_id.clone());
        task.transition_to(TaskStatus::Delegated)?;
        task.transition_to(TaskStatus::InProgress)?;

        Ok(Dispatch {
            worker_id,
            worker,
            fallback,
        })
    }

    async fn synthesize(
        &self,
        task: &Task,
        config: &WorkerConfig,
    ) -> Result<(String, Arc<dyn Worker>), Error> {
        let tier = WorkerTier::for_mode(task.context.mode());
        let id = self.registry.register_ad_hoc(&task.description, tier).await?;
        let worker = self.registry.resolve(&id, config).await?;
        Ok((id, worker))
    }

    /// Execution and review: invoke the worker and apply its response.
    pub async fn execute(&self, task: &mut Task, dispatch: Dispatch) {
        let message = self.build_message(task);
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            self.worker_timeout,
            AssertUnwindSafe(dispatch.worker.execute(&message)).catch_unwind(),
        )
        .await;
        let wall_ms = started.elapsed().as_secs_f64() * 1000.0;

        let invocation = match outcome {
            Ok(Ok(response)) => Invocation::Replied(response),
            Ok(Err(panic)) => Invocation::Panicked(panic_message(panic.as_ref())),
            Err(_) => {
                warn!(
                    task_id = %task.id,
                    worker = %dispatch.worker_id,
                    timeout_ms = self.worker_timeout.as_millis() as u64,
                    "Worker deadline exceeded"
                );
                Invocation::Replied(
                    AgentResponse::failed(
                        &message,
                        DEADLINE_EXCEEDED,
                        format!("Worker exceeded its {:?} deadline", self.worker_timeout),
                    )
                    .with_next_action(NextAction::RetryRequested)
                    .with_execution_time(wall_ms),
                )
            }
        };

        let mut extra = json!({ "wall_time_ms": wall_ms });
        if let Some(note) = &dispatch.fallback {
            extra["fallback"] = json!(note);
        }

        match invocation {
            Invocation::Panicked(reason) => {
                self.fail_defect(
                    task,
                    &dispatch.worker_id,
                    format!("Worker panicked: {reason}"),
                    extra,
                );
            }
            Invocation::Replied(response) => {
                if let Err(reason) = response.corresponds_to(&message) {
                    let violation = TaskError::ProtocolViolation {
                        task_id: task.id,
                        reason,
                    };
                    extra["output_data"] = response.output_data.clone();
                    self.fail_defect(task, &dispatch.worker_id, violation.to_string(), extra);
                    return;
                }
                self.review(task, &dispatch.worker_id, response, extra);
            }
        }
    }

    fn build_message(&self, task: &Task) -> AgentMessage {
        let mut message = AgentMessage::new(task.id, ACTION_EXECUTE_TASK, task.description.clone())
            .with_param("mode", task.context.mode().to_string())
            .with_param("session_id", task.context.session_id().to_string())
            .with_param("initial_prompt", task.context.initial_prompt())
            .with_param("priority", task.priority.to_string())
            .with_param("retry_count", task.retry_count)
            .with_limits(ResourceLimits {
                timeout_ms: Some(self.worker_timeout.as_millis() as u64),
                max_output_bytes: None,
            });
        for (key, value) in task.context.environment() {
            message = message.with_param(format!("env.{key}"), value.clone());
        }
        message
    }

    /// Map a corresponding response onto the state machine.
    fn review(&self, task: &mut Task, worker_id: &str, response: AgentResponse, extra: serde_json::Value) {
        let hint = response.next_action();

        let (status, final_result) = match (response.success, &hint) {
            (_, Some(NextAction::RetryRequested)) => (TaskStatus::Retry, None),
            (false, _) => (
                TaskStatus::Failed,
                Some(json!({
                    "error": response.error_details.clone().unwrap_or_else(|| response.log_message.clone()),
                    "status_code": response.status_code,
                })),
            ),
            (true, Some(NextAction::DelegateTo(next))) => {
                task.required_agent = Some(next.clone());
                (TaskStatus::Delegated, None)
            }
            (true, _) => (TaskStatus::Completed, Some(response.output_data.clone())),
        };

        if status == TaskStatus::Retry {
            task.retry_count += 1;
        }

        if response.success {
            info!(task_id = %task.id, worker = %worker_id, status = %status, "Cycle finished");
        } else {
            warn!(
                task_id = %task.id,
                worker = %worker_id,
                status_code = response.status_code,
                hint = ?hint,
                error = response.error_details.as_deref().unwrap_or(""),
                "Worker reported failure"
            );
        }

        let mut data = json!({
            "output_data": response.output_data,
            "suggested_next_action": response.suggested_next_action,
            "execution_time_ms": response.execution_time_ms,
            "status_code": response.status_code,
        });
        if let Some(details) = &response.error_details {
            data["error_details"] = json!(details);
        }
        merge(&mut data, extra);

        let trace = ExecutionTrace::new(worker_id, response.log_message, response.success, data);
        self.finish(task, status, trace, final_result);
    }

    /// Record a core defect: the task fails terminally and the raw error text
    /// lands in the trace.
    fn fail_defect(&self, task: &mut Task, agent: &str, reason: String, extra: serde_json::Value) {
        error!(task_id = %task.id, worker = %agent, defect = true, error = %reason, "Core defect in cycle");
        let mut data = json!({ "error_details": reason, "defect": true });
        merge(&mut data, extra);
        self.finish(
            task,
            TaskStatus::Failed,
            ExecutionTrace::new(agent, reason.clone(), false, data),
            Some(json!({ "error": reason })),
        );
    }

    /// Apply the cycle's final status and append its single trace entry.
    fn finish(
        &self,
        task: &mut Task,
        status: TaskStatus,
        trace: ExecutionTrace,
        final_result: Option<serde_json::Value>,
    ) {
        if let Err(e) = task.transition_to(status) {
            // Failed is reachable from every non-terminal state.
            error!(task_id = %task.id, defect = true, error = %e, "Forcing task to failed");
            task.status = TaskStatus::Failed;
        }
        if task.is_terminal() {
            task.final_result = final_result;
        }
        task.record(trace);
    }
}

fn merge(target: &mut serde_json::Value, extra: serde_json::Value) {
    if let (Some(target), serde_json::Value::Object(extra)) = (target.as_object_mut(), extra) {
        target.extend(extra);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::config::OperatingMode;
    use crate::task::{TaskContext, TaskPriority};
    use crate::workers::WorkerDefinition;

    /// Replies with a fixed outcome.
    struct ScriptedWorker {
        name: String,
        success: bool,
        hint: Option<NextAction>,
    }

    #[async_trait]
    impl Worker for ScriptedWorker {
        fn name(&self) -> &str {
            &self.name
        }
        async fn execute(&self, message: &AgentMessage) -> AgentResponse {
            let mut response = if self.success {
                AgentResponse::ok(message, format!("{} done", self.name))
            } else {
                AgentResponse::failed(message, 503, "upstream unavailable")
            };
            if let Some(hint) = &self.hint {
                response = response.with_next_action(hint.clone());
            }
            response.with_log(format!("{} ran", self.name))
        }
    }

    struct WrongTaskWorker;

    #[async_trait]
    impl Worker for WrongTaskWorker {
        fn name(&self) -> &str {
            "impostor"
        }
        async fn execute(&self, message: &AgentMessage) -> AgentResponse {
            let mut response = AgentResponse::ok(message, "ok");
            response.task_id = Uuid::new_v4();
            response
        }
    }

    struct PanickingWorker;

    #[async_trait]
    impl Worker for PanickingWorker {
        fn name(&self) -> &str {
            "broken"
        }
        async fn execute(&self, _message: &AgentMessage) -> AgentResponse {
            panic!("index out of bounds");
        }
    }

    struct SlowWorker;

    #[async_trait]
    impl Worker for SlowWorker {
        fn name(&self) -> &str {
            "slow"
        }
        async fn execute(&self, message: &AgentMessage) -> AgentResponse {
            tokio::time::sleep(Duration::from_secs(5)).await;
            AgentResponse::ok(message, "late")
        }
    }

    fn scripted(id: &str, success: bool, hint: Option<NextAction>) -> WorkerDefinition {
        WorkerDefinition::new(id, "scripted", WorkerTier::Full, move |name, _| {
            Arc::new(ScriptedWorker {
                name: name.to_string(),
                success,
                hint: hint.clone(),
            }) as Arc<dyn Worker>
        })
    }

    async fn core_with(definitions: Vec<WorkerDefinition>) -> ReasoningCore {
        let registry = Arc::new(WorkerRegistry::new());
        registry
            .set_ad_hoc_base(
                WorkerTier::Full,
                Arc::new(|name: &str, _: &WorkerConfig| {
                    Arc::new(ScriptedWorker {
                        name: name.to_string(),
                        success: true,
                        hint: Some(NextAction::Complete),
                    }) as Arc<dyn Worker>
                }),
            )
            .await;
        for definition in definitions {
            registry.register(definition).await;
        }
        let config = CortexConfig {
            worker_timeout: Duration::from_millis(100),
            max_cycles: 4,
            ..CortexConfig::default()
        };
        ReasoningCore::new(registry, &config)
    }

    fn task(agent: Option<&str>) -> Task {
        Task::new(
            "Investigate outage",
            TaskContext::new(OperatingMode::Full, "Investigate outage"),
            TaskPriority::High,
            agent.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn completes_and_records_one_trace() {
        let core = core_with(vec![scripted("writer", true, Some(NextAction::Complete))]).await;
        let mut t = task(Some("writer"));
        core.process_one_cycle(&mut t).await;

        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.cycles(), 1);
        assert_eq!(t.delegated_to.as_deref(), Some("writer"));
        assert_eq!(t.final_result, Some(json!("writer done")));
        let trace = &t.trace_history[0];
        assert!(trace.success);
        assert_eq!(trace.action_description, "writer ran");
        assert_eq!(trace.result_data["suggested_next_action"], json!("TASK_COMPLETED"));
        assert!(trace.result_data.get("execution_time_ms").is_some());
    }

    #[tokio::test]
    async fn success_without_hint_completes() {
        let core = core_with(vec![scripted("writer", true, None)]).await;
        let mut t = task(Some("writer"));
        core.process_one_cycle(&mut t).await;
        assert_eq!(t.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn delegation_chains_to_next_worker() {
        let core = core_with(vec![
            scripted("researcher", true, Some(NextAction::DelegateTo("writer".into()))),
            scripted("writer", true, Some(NextAction::Complete)),
        ])
        .await;
        let mut t = task(Some("researcher"));

        core.process_one_cycle(&mut t).await;
        assert_eq!(t.status, TaskStatus::Delegated);
        assert_eq!(t.required_agent.as_deref(), Some("writer"));
        assert!(t.final_result.is_none());

        core.process_one_cycle(&mut t).await;
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.delegated_to.as_deref(), Some("writer"));
        assert_eq!(t.cycles(), 2);
    }

    #[tokio::test]
    async fn retry_request_counts_attempts() {
        let core = core_with(vec![scripted("sensor", false, Some(NextAction::RetryRequested))]).await;
        let mut t = task(Some("sensor"));
        core.process_one_cycle(&mut t).await;
        assert_eq!(t.status, TaskStatus::Retry);
        assert_eq!(t.retry_count, 1);

        core.process_one_cycle(&mut t).await;
        assert_eq!(t.status, TaskStatus::Retry);
        assert_eq!(t.retry_count, 2);
        assert_eq!(t.cycles(), 2);
    }

    #[tokio::test]
    async fn manual_review_fails() {
        let core = core_with(vec![scripted("sensor", false, Some(NextAction::ManualReview))]).await;
        let mut t = task(Some("sensor"));
        core.process_one_cycle(&mut t).await;
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.final_result.as_ref().unwrap()["status_code"], json!(503));
        assert_eq!(t.cycles(), 1);
    }

    #[tokio::test]
    async fn failure_without_hint_fails() {
        let core = core_with(vec![scripted("sensor", false, None)]).await;
        let mut t = task(Some("sensor"));
        core.process_one_cycle(&mut t).await;
        assert_eq!(t.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_worker_falls_back_to_ad_hoc() {
        let core = core_with(vec![]).await;
        let mut t = task(Some("ghost"));
        core.process_one_cycle(&mut t).await;

        assert_eq!(t.status, TaskStatus::Completed);
        let worker = t.delegated_to.clone().unwrap();
        assert!(worker.starts_with("adhoc_"));
        let fallback = t.trace_history[0].result_data["fallback"].as_str().unwrap();
        assert!(fallback.contains("ghost"));
    }

    #[tokio::test]
    async fn no_initial_worker_uses_ad_hoc() {
        let core = core_with(vec![]).await;
        let mut t = task(None);
        core.process_one_cycle(&mut t).await;
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(t.trace_history[0].result_data.get("fallback").is_some());
    }

    #[tokio::test]
    async fn envelope_mismatch_is_defect() {
        let core = core_with(vec![WorkerDefinition::new(
            "impostor",
            "returns the wrong task id",
            WorkerTier::Full,
            |_, _| Arc::new(WrongTaskWorker) as Arc<dyn Worker>,
        )])
        .await;
        let mut t = task(Some("impostor"));
        core.process_one_cycle(&mut t).await;

        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.cycles(), 1);
        assert_eq!(t.trace_history[0].result_data["defect"], json!(true));
    }

    #[tokio::test]
    async fn panic_is_caught_and_fails() {
        let core = core_with(vec![WorkerDefinition::new(
            "broken",
            "always panics",
            WorkerTier::Full,
            |_, _| Arc::new(PanickingWorker) as Arc<dyn Worker>,
        )])
        .await;
        let mut t = task(Some("broken"));
        core.process_one_cycle(&mut t).await;

        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.cycles(), 1);
        assert!(t.trace_history[0].action_description.contains("index out of bounds"));
    }

    #[tokio::test]
    async fn deadline_expiry_requests_retry() {
        let core = core_with(vec![WorkerDefinition::new(
            "slow",
            "sleeps past the deadline",
            WorkerTier::Full,
            |_, _| Arc::new(SlowWorker) as Arc<dyn Worker>,
        )])
        .await;
        let mut t = task(Some("slow"));
        core.process_one_cycle(&mut t).await;

        assert_eq!(t.status, TaskStatus::Retry);
        assert_eq!(t.retry_count, 1);
        assert_eq!(t.trace_history[0].result_data["status_code"], json!(DEADLINE_EXCEEDED));
    }

    #[tokio::test]
    async fn cycle_limit_fails_task() {
        let core = core_with(vec![scripted("sensor", false, Some(NextAction::RetryRequested))]).await;
        let mut t = task(Some("sensor"));
        for _ in 0..5 {
            core.process_one_cycle(&mut t).await;
        }
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.cycles(), 5);
        assert_eq!(t.trace_history[4].agent_name, "core");
    }

    #[tokio::test]
    async fn terminal_task_is_left_alone() {
        let core = core_with(vec![scripted("writer", true, None)]).await;
        let mut t = task(Some("writer"));
        core.process_one_cycle(&mut t).await;
        core.process_one_cycle(&mut t).await;
        assert_eq!(t.cycles(), 1);
    }

    #[tokio::test]
    async fn message_carries_mode_and_env() {
        let core = core_with(vec![]).await;
        let mut t = task(None);
        t.context = TaskContext::new(OperatingMode::Lean, "scan").with_env("region", "eu");
        let message = core.build_message(&t);
        assert_eq!(message.action_type, ACTION_EXECUTE_TASK);
        assert_eq!(message.param_str("mode"), Some("lean"));
        assert_eq!(message.param_str("env.region"), Some("eu"));
        assert_eq!(message.task_id, t.id);
    }
}
