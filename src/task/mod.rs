//! Task model: the aggregate, its state machine and the retry policy.

pub mod model;
pub mod retry;
pub mod state;

pub use model::{ExecutionTrace, Task, TaskContext, TaskPriority, TaskSnapshot};
pub use retry::RetryPolicy;
pub use state::TaskStatus;
