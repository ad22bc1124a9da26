//! Scheduler: submission, crash recovery, dispatch workers and backoff.
//!
//! Dispatch workers pull task ids from a shared `TaskQueue`, load the latest
//! persisted state, run one reasoning cycle and persist the result before
//! taking the next id. Backoff is a deferred re-enqueue, never a sleep inside
//! a dispatch worker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{CortexConfig, OperatingMode};
use crate::engine::queue::TaskQueue;
use crate::engine::reasoning::ReasoningCore;
use crate::error::{DatabaseError, Error, TaskError};
use crate::store::TaskStore;
use crate::task::{Task, TaskContext, TaskPriority, TaskSnapshot, TaskStatus};
use crate::workers::WorkerRegistry;

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub mode: OperatingMode,
    pub running: bool,
    /// Tasks waiting in the queue.
    pub queued: usize,
    /// Tasks a dispatch worker is cycling right now.
    pub in_flight: usize,
    /// Tasks held back by a backoff or persistence-retry timer.
    pub deferred: usize,
    /// Registered workers, ad-hoc ones included.
    pub workers: usize,
}

/// Priority scheduler over a `TaskStore`. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: CortexConfig,
    store: Arc<dyn TaskStore>,
    registry: Arc<WorkerRegistry>,
    core: ReasoningCore,
    queue: TaskQueue,
    started: AtomicBool,
    shutdown: AtomicBool,
    /// At most one active cycle per task id.
    in_flight: Mutex<HashSet<Uuid>>,
    /// Pending deferred re-enqueues, tagged with the generation that armed them.
    timers: Mutex<HashMap<Uuid, (u64, JoinHandle<()>)>>,
    timer_seq: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        config: CortexConfig,
        store: Arc<dyn TaskStore>,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        let core = ReasoningCore::new(Arc::clone(&registry), &config);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                registry,
                core,
                queue: TaskQueue::new(),
                started: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                in_flight: Mutex::new(HashSet::new()),
                timers: Mutex::new(HashMap::new()),
                timer_seq: AtomicU64::new(0),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create, persist and enqueue a new task.
    ///
    /// Accepted before `start()` (the task waits in the queue) but not after
    /// `stop()`. A failed save is returned to the caller and nothing is queued.
    pub async fn submit(
        &self,
        description: impl Into<String>,
        context: TaskContext,
        priority: TaskPriority,
        initial_agent: Option<String>,
    ) -> Result<Task, Error> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(TaskError::NotRunning.into());
        }

        let task = Task::new(description, context, priority, initial_agent);
        self.inner.store.save(&task).await?;
        self.inner
            .queue
            .push(task.id, task.priority, task.created_at)
            .await;

        info!(
            task_id = %task.id,
            priority = %task.priority,
            agent = task.required_agent.as_deref().unwrap_or("-"),
            "Task submitted"
        );
        Ok(task)
    }

    /// Recover unfinished tasks from the store and spawn the dispatch workers.
    ///
    /// Returns how many recovered tasks were enqueued.
    pub async fn start(&self) -> Result<usize, Error> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(TaskError::AlreadyStarted.into());
        }

        let recovered = match self.inner.recover().await {
            Ok(n) => n,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let mut workers = self.inner.workers.lock().await;
        for index in 0..self.inner.config.dispatch_workers {
            workers.push(tokio::spawn(Arc::clone(&self.inner).dispatch_loop(index)));
        }

        info!(
            mode = %self.inner.config.mode,
            dispatch_workers = self.inner.config.dispatch_workers,
            recovered,
            "Scheduler started"
        );
        Ok(recovered)
    }

    /// Stop the dispatch workers after their current cycle and wait for them.
    ///
    /// Backoff timers are cancelled; their tasks stay persisted as
    /// WAITING_BACKOFF and are picked up by the next `start()`.
    pub async fn stop(&self) -> Result<(), Error> {
        if !self.inner.started.load(Ordering::SeqCst)
            || self.inner.shutdown.swap(true, Ordering::SeqCst)
        {
            return Err(TaskError::NotRunning.into());
        }

        info!("Scheduler stopping");
        self.inner.queue.wake_all();

        let workers = std::mem::take(&mut *self.inner.workers.lock().await);
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatch worker ended abnormally");
            }
        }

        let timers = std::mem::take(&mut *self.inner.timers.lock().await);
        for (task_id, (_, handle)) in timers {
            handle.abort();
            debug!(%task_id, "Deferred re-enqueue cancelled");
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Latest persisted state of a task.
    pub async fn get_status(&self, id: Uuid) -> Result<TaskSnapshot, Error> {
        self.inner
            .store
            .find_by_id(id)
            .await?
            .map(TaskSnapshot::from)
            .ok_or_else(|| TaskError::NotFound { id }.into())
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            mode: self.inner.config.mode,
            running: self.is_running(),
            queued: self.inner.queue.len().await,
            in_flight: self.inner.in_flight.lock().await.len(),
            deferred: self.inner.timers.lock().await.len(),
            workers: self.inner.registry.count().await,
        }
    }
}

impl Inner {
    /// Re-enqueue every unfinished task. Exhausted RETRY tasks stay parked.
    async fn recover(&self) -> Result<usize, DatabaseError> {
        let pending = self.store.find_pending().await?;
        let mut recovered = 0;

        for task in pending {
            if task.status == TaskStatus::Retry && !self.config.retry.should_retry(task.retry_count) {
                debug!(task_id = %task.id, retry_count = task.retry_count, "Exhausted task left parked");
                continue;
            }
            if self.queue.push(task.id, task.priority, task.created_at).await {
                info!(task_id = %task.id, status = %task.status, "Recovered task");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn dispatch_loop(self: Arc<Self>, index: usize) {
        info!(dispatcher = index, "Dispatch worker started");

        while !self.shutdown.load(Ordering::SeqCst) {
            let Some(id) = self.queue.pop_wait(self.config.idle_wait).await else {
                continue;
            };
            if self.shutdown.load(Ordering::SeqCst) {
                // Persisted and non-terminal, so the next start() recovers it.
                debug!(task_id = %id, "Dequeued during shutdown; left for recovery");
                break;
            }
            self.run_cycle(id).await;
        }

        info!(dispatcher = index, "Dispatch worker shutting down");
    }

    async fn run_cycle(self: &Arc<Self>, id: Uuid) {
        if !self.in_flight.lock().await.insert(id) {
            // The active cycle re-enqueues or defers the task once it is released.
            debug!(task_id = %id, "Task already in flight; duplicate dispatch dropped");
            return;
        }
        let follow_up = self.cycle(id).await;

        // Release before re-enqueueing so any dispatch worker can claim it.
        self.in_flight.lock().await.remove(&id);
        match follow_up {
            FollowUp::Done => {}
            FollowUp::Requeue(task) => {
                self.queue.push(task.id, task.priority, task.created_at).await;
            }
            FollowUp::Defer(delay) => self.defer(id, delay).await,
        }
    }

    async fn cycle(&self, id: Uuid) -> FollowUp {
        let mut task = match self.store.find_by_id(id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id = %id, "Queued task missing from store");
                return FollowUp::Done;
            }
            Err(e) => {
                error!(task_id = %id, error = %e, "Failed to load task");
                return FollowUp::Defer(self.config.persist_retry_delay);
            }
        };

        if task.is_terminal() {
            debug!(task_id = %id, status = %task.status, "Task already settled");
            return FollowUp::Done;
        }
        if task.status == TaskStatus::Retry && !self.config.retry.should_retry(task.retry_count) {
            debug!(task_id = %id, "Exhausted task left parked");
            return FollowUp::Done;
        }

        let Some(dispatch) = self.core.prepare(&mut task).await else {
            return if self.commit(&task).await {
                FollowUp::Done
            } else {
                FollowUp::Defer(self.config.persist_retry_delay)
            };
        };

        // Checkpoint: a crash from here on recovers the task as IN_PROGRESS.
        if let Err(e) = self.persist(&task).await {
            error!(task_id = %id, error = %e, "Checkpoint failed; cycle postponed");
            return FollowUp::Defer(self.config.persist_retry_delay);
        }

        self.core.execute(&mut task, dispatch).await;

        let backoff = if task.status == TaskStatus::Retry {
            match self.config.retry.wait_time(task.retry_count) {
                Some(delay) => match task.transition_to(TaskStatus::WaitingBackoff) {
                    Ok(()) => Some(delay),
                    Err(e) => {
                        error!(task_id = %id, defect = true, error = %e, "Cannot arm backoff");
                        None
                    }
                },
                None => {
                    warn!(
                        task_id = %id,
                        retry_count = task.retry_count,
                        max_retries = self.config.retry.max_retries(),
                        "Retry budget exhausted; task parked"
                    );
                    None
                }
            }
        } else {
            None
        };

        if !self.commit(&task).await {
            return FollowUp::Defer(self.config.persist_retry_delay);
        }

        match (task.status, backoff) {
            (TaskStatus::Delegated, _) => FollowUp::Requeue(task),
            (TaskStatus::WaitingBackoff, Some(delay)) => {
                info!(
                    task_id = %id,
                    attempt = task.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Retry scheduled"
                );
                FollowUp::Defer(delay)
            }
            (TaskStatus::Completed | TaskStatus::Failed, _) => {
                info!(task_id = %id, status = %task.status, cycles = task.cycles(), "Task settled");
                FollowUp::Done
            }
            _ => FollowUp::Done,
        }
    }

    /// Persist a cycle result. On failure the in-memory copy is dropped and
    /// the caller reloads the last confirmed state later.
    async fn commit(&self, task: &Task) -> bool {
        match self.persist(task).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    task_id = %task.id,
                    status = %task.status,
                    error = %e,
                    "Failed to persist cycle result; last saved state kept"
                );
                false
            }
        }
    }

    /// Save with bounded retries.
    async fn persist(&self, task: &Task) -> Result<(), DatabaseError> {
        let mut attempt = 0;
        loop {
            match self.store.save(task).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.persist_retries => {
                    attempt += 1;
                    warn!(task_id = %task.id, attempt, error = %e, "Save failed, retrying");
                    tokio::time::sleep(self.config.persist_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-enqueue `id` from its persisted state once `delay` has elapsed.
    ///
    /// A newer timer for the same id replaces (and aborts) the older one.
    async fn defer(self: &Arc<Self>, id: Uuid, delay: Duration) {
        let generation = self.timer_seq.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.timers.lock().await;
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.requeue_after(id, delay, generation).await });
        if let Some((_, previous)) = timers.insert(id, (generation, handle)) {
            previous.abort();
        }
    }

    async fn requeue_after(&self, id: Uuid, delay: Duration, generation: u64) {
        let mut delay = delay;
        let task = loop {
            tokio::time::sleep(delay).await;
            if self.shutdown.load(Ordering::SeqCst) {
                break None;
            }
            match self.store.find_by_id(id).await {
                Ok(task) => break task.filter(|t| t.status.is_active()),
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Deferred reload failed, retrying");
                    delay = self.config.persist_retry_delay;
                }
            }
        };

        {
            let mut timers = self.timers.lock().await;
            let owned = timers
                .get(&id)
                .is_some_and(|(current, _)| *current == generation);
            if !owned {
                debug!(task_id = %id, generation, "Superseded timer exits");
                return;
            }
            timers.remove(&id);
        }
        if let Some(task) = task {
            debug!(task_id = %id, status = %task.status, "Deferred task re-enqueued");
            self.queue.push(task.id, task.priority, task.created_at).await;
        }
    }
}

/// What happens to a task once its cycle releases the in-flight claim.
enum FollowUp {
    Done,
    /// Dispatch again right away.
    Requeue(Task),
    /// Reload and dispatch again after a delay.
    Defer(Duration),
}
