//! libSQL backend: durable `TaskStore` over a local file or in-memory database.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::task::{ExecutionTrace, Task, TaskContext, TaskPriority, TaskStatus};

const TASK_COLUMNS: &str = "id, description, context, priority, status, required_agent, delegated_to, retry_count, final_result, created_at, updated_at";

const TRACE_COLUMNS: &str = "timestamp, agent_name, action_description, success, result_data";

/// libSQL task store.
///
/// One connection is shared by every dispatch worker. Every operation holds
/// `lock` for its whole duration: a save is one transaction, and a read sees
/// the task row and its traces from the same committed save.
pub struct LibSqlTaskStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    lock: Mutex<()>,
}

impl LibSqlTaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Task database opened");
        Ok(store)
    }

    /// Create an in-memory database.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;
        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Trace history of one task, in append order. Caller holds `lock`.
    async fn load_traces(&self, task_id: Uuid) -> Result<Vec<ExecutionTrace>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TRACE_COLUMNS} FROM execution_traces WHERE task_id = ?1 ORDER BY seq ASC"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_traces: {e}")))?;

        let mut traces = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("load_traces row: {e}")))?
        {
            traces.push(row_to_trace(&row)?);
        }
        Ok(traces)
    }

    async fn hydrate(&self, mut task: Task) -> Result<Task, DatabaseError> {
        task.trace_history = self.load_traces(task.id).await?;
        Ok(task)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp '{s}': {e}")))
}

fn query_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

/// Map a libsql Row to a Task without its trace history.
///
/// Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row.get(0).map_err(query_err("task id"))?;
    let context_str: String = row.get(2).map_err(query_err("task context"))?;
    let priority: i64 = row.get(3).map_err(query_err("task priority"))?;
    let status_str: String = row.get(4).map_err(query_err("task status"))?;
    let retry_count: i64 = row.get(7).map_err(query_err("task retry_count"))?;
    let final_result: Option<String> = row.get(8).map_err(query_err("task final_result"))?;
    let created_str: String = row.get(9).map_err(query_err("task created_at"))?;
    let updated_str: String = row.get(10).map_err(query_err("task updated_at"))?;

    let context: TaskContext = serde_json::from_str(&context_str)?;
    let final_result = final_result
        .map(|s| serde_json::from_str(&s))
        .transpose()?;

    Ok(Task {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("bad task id '{id_str}': {e}")))?,
        description: row.get(1).map_err(query_err("task description"))?,
        context,
        priority: TaskPriority::from_weight(priority).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown priority weight {priority}"))
        })?,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        required_agent: row.get(5).map_err(query_err("task required_agent"))?,
        delegated_to: row.get(6).map_err(query_err("task delegated_to"))?,
        retry_count: u32::try_from(retry_count).map_err(|_| {
            DatabaseError::Serialization(format!("invalid retry_count {retry_count}"))
        })?,
        created_at: parse_datetime(&created_str)?,
        updated_at: parse_datetime(&updated_str)?,
        trace_history: Vec::new(),
        final_result,
    })
}

/// Column order matches TRACE_COLUMNS.
fn row_to_trace(row: &libsql::Row) -> Result<ExecutionTrace, DatabaseError> {
    let timestamp: String = row.get(0).map_err(query_err("trace timestamp"))?;
    let success: i64 = row.get(3).map_err(query_err("trace success"))?;
    let result_data: String = row.get(4).map_err(query_err("trace result_data"))?;

    Ok(ExecutionTrace {
        timestamp: parse_datetime(&timestamp)?,
        agent_name: row.get(1).map_err(query_err("trace agent_name"))?,
        action_description: row.get(2).map_err(query_err("trace action_description"))?,
        success: success != 0,
        result_data: serde_json::from_str(&result_data)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn save(&self, task: &Task) -> Result<(), DatabaseError> {
        let context = serde_json::to_string(&task.context)?;
        let final_result = task
            .final_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let _guard = self.lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("save begin"))?;

        tx.execute(
            "INSERT INTO tasks (id, description, context, priority, status, required_agent, delegated_to, retry_count, final_result, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                description = excluded.description,
                context = excluded.context,
                priority = excluded.priority,
                status = excluded.status,
                required_agent = excluded.required_agent,
                delegated_to = excluded.delegated_to,
                retry_count = excluded.retry_count,
                final_result = excluded.final_result,
                updated_at = excluded.updated_at",
            params![
                task.id.to_string(),
                task.description.clone(),
                context,
                task.priority.weight(),
                task.status.as_str(),
                task.required_agent.clone(),
                task.delegated_to.clone(),
                i64::from(task.retry_count),
                final_result,
                format_datetime(&task.created_at),
                format_datetime(&task.updated_at),
            ],
        )
        .await
        .map_err(query_err("save task"))?;

        // History is append-only: rows already written keep their seq.
        tx.execute(
            "DELETE FROM execution_traces WHERE task_id = ?1 AND seq >= ?2",
            params![task.id.to_string(), task.trace_history.len() as i64],
        )
        .await
        .map_err(query_err("save trim traces"))?;

        for (seq, trace) in task.trace_history.iter().enumerate() {
            tx.execute(
                "INSERT OR IGNORE INTO execution_traces (task_id, seq, timestamp, agent_name, action_description, success, result_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    task.id.to_string(),
                    seq as i64,
                    format_datetime(&trace.timestamp),
                    trace.agent_name.clone(),
                    trace.action_description.clone(),
                    i64::from(trace.success),
                    serde_json::to_string(&trace.result_data)?,
                ],
            )
            .await
            .map_err(query_err("save trace"))?;
        }

        tx.commit().await.map_err(query_err("save commit"))?;
        debug!(task_id = %task.id, status = %task.status, traces = task.trace_history.len(), "Task saved");
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("find_by_id"))?;

        let task = match rows.next().await.map_err(query_err("find_by_id row"))? {
            Some(row) => row_to_task(&row)?,
            None => return Ok(None),
        };
        Ok(Some(self.hydrate(task).await?))
    }

    async fn find_pending(&self) -> Result<Vec<Task>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status NOT IN (?1, ?2)
                     ORDER BY priority DESC, created_at ASC"
                ),
                params![TaskStatus::Completed.as_str(), TaskStatus::Failed.as_str()],
            )
            .await
            .map_err(query_err("find_pending"))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("find_pending row"))? {
            tasks.push(row_to_task(&row)?);
        }

        let mut hydrated = Vec::with_capacity(tasks.len());
        for task in tasks {
            hydrated.push(self.hydrate(task).await?);
        }
        Ok(hydrated)
    }
}
