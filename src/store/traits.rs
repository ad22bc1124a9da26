//! `TaskStore` trait, the only persistence contract the core depends on.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::task::Task;

/// Durable storage for task aggregates.
///
/// `save` must be atomic per task and `find_pending` must reflect the latest
/// saved state. Implementations are shared across dispatch workers.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or replace a task, including its trace history.
    async fn save(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// All tasks in a non-terminal status, highest priority first.
    async fn find_pending(&self) -> Result<Vec<Task>, DatabaseError>;
}
