//! Cortex: priority task orchestration over pluggable workers.

pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod store;
pub mod task;
pub mod workers;
