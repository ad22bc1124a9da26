//! Shared priority queue of task ids.
//!
//! Dequeue order is priority descending, then creation time ascending. Ties on
//! both fall back to an insertion counter, so the order never depends on the
//! heap's internal layout.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::task::TaskPriority;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    id: Uuid,
    priority: TaskPriority,
    created_at: DateTime<Utc>,
    seq: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest entry.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    /// Ids currently in `heap`; an id is never queued twice.
    queued: HashSet<Uuid>,
    next_seq: u64,
}

/// Concurrent priority queue shared by `submit`, backoff timers and the
/// dispatch workers.
#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task. Returns `false` if it was already queued.
    pub async fn push(&self, id: Uuid, priority: TaskPriority, created_at: DateTime<Utc>) -> bool {
        {
            let mut state = self.state.lock().await;
            if !state.queued.insert(id) {
                return false;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Entry {
                id,
                priority,
                created_at,
                seq,
            });
        }
        self.ready.notify_one();
        true
    }

    /// Take the next task, if any.
    pub async fn pop(&self) -> Option<Uuid> {
        let mut state = self.state.lock().await;
        let entry = state.heap.pop()?;
        state.queued.remove(&entry.id);
        Some(entry.id)
    }

    /// Take the next task, waiting up to `wait` for one to arrive.
    pub async fn pop_wait(&self, wait: Duration) -> Option<Uuid> {
        let notified = self.ready.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(id) = self.pop().await {
            return Some(id);
        }
        let _ = tokio::time::timeout(wait, notified).await;
        self.pop().await
    }

    /// Wake every idle consumer.
    pub fn wake_all(&self) {
        self.ready.notify_waiters();
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.state.lock().await.queued.contains(&id)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.heap.is_empty()
    }
}
