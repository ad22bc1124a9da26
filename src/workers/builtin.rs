//! Built-in workers and the static catalogue.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::config::OperatingMode;
use crate::protocol::{AgentMessage, AgentResponse, NextAction};
use crate::workers::registry::WorkerRegistry;
use crate::workers::worker::{Worker, WorkerConfig, WorkerDefinition, WorkerFactory, WorkerTier};

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Deep analysis of the prompt; hands the findings to the writer.
pub struct ResearcherWorker {
    name: String,
}

#[async_trait]
impl Worker for ResearcherWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, message: &AgentMessage) -> AgentResponse {
        let start = Instant::now();
        tracing::info!(worker = %self.name, task_id = %message.task_id, "Research started");

        let output = format!("{} analysed in depth: '{}'", self.name, message.raw_prompt);
        AgentResponse::ok(message, output)
            .with_next_action(NextAction::DelegateTo("writer".to_string()))
            .with_log("Field research finished.")
            .with_execution_time(elapsed_ms(start))
    }
}

/// Turns prior findings into a final report.
pub struct WriterWorker {
    name: String,
}

#[async_trait]
impl Worker for WriterWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, message: &AgentMessage) -> AgentResponse {
        let start = Instant::now();
        let output = format!("Report: {}", message.raw_prompt);
        AgentResponse::ok(message, output)
            .with_next_action(NextAction::Complete)
            .with_log("Report written.")
            .with_execution_time(elapsed_ms(start))
    }
}

/// Code and systems work. Security incidents get a structured patch record.
pub struct EngineerWorker {
    name: String,
}

#[async_trait]
impl Worker for EngineerWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, message: &AgentMessage) -> AgentResponse {
        let start = Instant::now();
        let prompt = message.raw_prompt.to_lowercase();

        let response = if prompt.contains("security") {
            AgentResponse::ok(
                message,
                serde_json::json!({
                    "fix_applied": true,
                    "details": "Emergency patch applied.",
                }),
            )
            .with_log("Critical security mitigation finished.")
        } else {
            AgentResponse::ok(
                message,
                format!("{} designed: '{}'", self.name, message.raw_prompt),
            )
            .with_log("Project development finished.")
        };

        response
            .with_next_action(NextAction::Complete)
            .with_execution_time(elapsed_ms(start))
    }
}

/// Lightweight monitoring probe.
pub struct SensorWorker {
    name: String,
}

#[async_trait]
impl Worker for SensorWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, message: &AgentMessage) -> AgentResponse {
        let start = Instant::now();
        if message.raw_prompt.trim().is_empty() {
            return AgentResponse::failed(message, 400, "Nothing to monitor: empty prompt")
                .with_next_action(NextAction::ManualReview)
                .with_execution_time(elapsed_ms(start));
        }

        let output = serde_json::json!({
            "probe": self.name,
            "observed": message.raw_prompt,
            "mode": message.param_str("mode"),
        });
        AgentResponse::ok(message, output)
            .with_next_action(NextAction::Complete)
            .with_log("Sensor reading recorded.")
            .with_execution_time(elapsed_ms(start))
    }
}

/// Minimal executor. Base implementation for lightweight ad-hoc workers.
pub struct SimpleWorker {
    name: String,
}

#[async_trait]
impl Worker for SimpleWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, message: &AgentMessage) -> AgentResponse {
        let start = Instant::now();
        AgentResponse::ok(message, format!("{} handled: '{}'", self.name, message.raw_prompt))
            .with_next_action(NextAction::Complete)
            .with_log("Simple execution finished.")
            .with_execution_time(elapsed_ms(start))
    }
}

/// General-purpose executor. Base implementation for full ad-hoc workers.
pub struct GeneralistWorker {
    name: String,
}

#[async_trait]
impl Worker for GeneralistWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, message: &AgentMessage) -> AgentResponse {
        let start = Instant::now();
        let output = serde_json::json!({
            "worker": self.name,
            "summary": format!("Processed: '{}'", message.raw_prompt),
            "parameters": message.parameters,
        });
        AgentResponse::ok(message, output)
            .with_next_action(NextAction::Complete)
            .with_log("General processing finished.")
            .with_execution_time(elapsed_ms(start))
    }
}

fn simple_factory() -> WorkerFactory {
    Arc::new(|name: &str, _config: &WorkerConfig| {
        Arc::new(SimpleWorker {
            name: name.to_string(),
        }) as Arc<dyn Worker>
    })
}

fn generalist_factory() -> WorkerFactory {
    Arc::new(|name: &str, _config: &WorkerConfig| {
        Arc::new(GeneralistWorker {
            name: name.to_string(),
        }) as Arc<dyn Worker>
    })
}

/// The static worker catalogue, each entry tagged with its tier.
pub fn catalogue() -> Vec<WorkerDefinition> {
    vec![
        WorkerDefinition::new(
            "researcher",
            "High-capacity analysis of complex requests",
            WorkerTier::Full,
            |name, _| Arc::new(ResearcherWorker { name: name.to_string() }) as Arc<dyn Worker>,
        ),
        WorkerDefinition::new(
            "writer",
            "Turns findings into a final report",
            WorkerTier::Full,
            |name, _| Arc::new(WriterWorker { name: name.to_string() }) as Arc<dyn Worker>,
        ),
        WorkerDefinition::new(
            "engineer",
            "Code and systems manipulation",
            WorkerTier::Full,
            |name, _| Arc::new(EngineerWorker { name: name.to_string() }) as Arc<dyn Worker>,
        ),
        WorkerDefinition::new(
            "sensor",
            "Lightweight monitoring probe",
            WorkerTier::Lightweight,
            |name, _| Arc::new(SensorWorker { name: name.to_string() }) as Arc<dyn Worker>,
        ),
        WorkerDefinition {
            id: "simple".to_string(),
            description: "Minimal executor".to_string(),
            tier: WorkerTier::Lightweight,
            factory: simple_factory(),
        },
    ]
}

/// Load the catalogue for `mode` and install the ad-hoc base implementations.
pub async fn install(registry: &WorkerRegistry, mode: OperatingMode) -> usize {
    registry
        .set_ad_hoc_base(WorkerTier::Lightweight, simple_factory())
        .await;
    registry
        .set_ad_hoc_base(WorkerTier::Full, generalist_factory())
        .await;
    registry.register_catalogue(catalogue(), mode).await
}
