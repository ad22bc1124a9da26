//! Workers: the executors tasks are delegated to.

pub mod builtin;
pub mod registry;
pub mod worker;

pub use registry::WorkerRegistry;
pub use worker::*;
