//! Retry queue for tasks deferred by rate limiting.

use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock};

use crate::core::Task;

/// Entries whose attempt count exceeds this are reported as expired.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// A task waiting for its rate limit to reset.
#[derive(Debug, Clone)]
pub struct PendingRetry {
    pub task: Arc<Task>,
    pub retry_after: DateTime<Utc>,
    /// Number of times the task has been queued, starting at 1.
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
    pub reason: String,
}

impl PendingRetry {
    fn is_expired(&self) -> bool {
        self.attempts > MAX_RETRY_ATTEMPTS
    }

    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired() && self.retry_after <= now
    }
}

/// Task-ID keyed list of deferred tasks behind a single read/write lock.
///
/// Never holds two entries for the same task; re-adding updates in place.
#[derive(Debug, Default)]
pub struct TaskQueue {
    entries: RwLock<Vec<PendingRetry>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` for retry after `retry_after`.
    ///
    /// If the task is already queued its retry time and reason are replaced
    /// and its attempt count incremented.
    pub fn add(&self, task: Arc<Task>, retry_after: DateTime<Utc>, reason: impl Into<String>) {
        let reason = reason.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.iter_mut().find(|e| e.task.id == task.id) {
            existing.retry_after = retry_after;
            existing.attempts += 1;
            existing.reason = reason;
            existing.task = task;
            return;
        }
        entries.push(PendingRetry {
            task,
            retry_after,
            attempts: 1,
            queued_at: Utc::now(),
            reason,
        });
    }

    /// Remove and return every entry whose retry time has passed and whose
    /// attempts are within budget.
    pub fn get_ready(&self) -> Vec<PendingRetry> {
        self.get_ready_at(Utc::now())
    }

    pub fn get_ready_at(&self, now: DateTime<Utc>) -> Vec<PendingRetry> {
        self.drain_where(|e| e.is_ready(now))
    }

    /// Remove and return every entry over the retry budget.
    pub fn get_expired(&self) -> Vec<PendingRetry> {
        self.drain_where(PendingRetry::is_expired)
    }

    fn drain_where(&self, pred: impl Fn(&PendingRetry) -> bool) -> Vec<PendingRetry> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let (taken, kept): (Vec<_>, Vec<_>) = entries.drain(..).partition(|e| pred(e));
        *entries = kept;
        taken
    }

    /// Snapshot of every pending entry.
    pub fn list(&self) -> Vec<PendingRetry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Earliest retry time among pending entries.
    pub fn next_retry_time(&self) -> Option<DateTime<Utc>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.retry_after)
            .min()
    }

    /// Put back an entry taken by [`get_ready`](Self::get_ready) without
    /// counting another attempt. A newer entry for the same task wins.
    pub fn restore(&self, entry: PendingRetry) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.iter().any(|e| e.task.id == entry.task.id) {
            entries.push(entry);
        }
    }

    pub fn remove(&self, task_id: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| e.task.id != task_id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
