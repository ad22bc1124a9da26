//! Orchestration engine: priority queue, reasoning cycle and scheduler.

pub mod queue;
pub mod reasoning;
pub mod scheduler;

pub use queue::TaskQueue;
pub use reasoning::ReasoningCore;
pub use scheduler::{HealthReport, Scheduler};
