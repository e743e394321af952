//! Background retry of rate-limited tasks.
//!
//! The scheduler ticks on a fixed interval. Each tick first drains tasks
//! over the retry budget (reported through [`RetryHandler::on_expired`]),
//! then tasks whose reset time has passed (handed to
//! [`RetryHandler::on_retry`]).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::core::Task;
use crate::orchestration::queue::{PendingRetry, TaskQueue};
use crate::orchestration::ratelimit::RateLimitInfo;
use crate::{flog, flog_debug, flog_error, flog_warn, Result};

/// Receives tasks leaving the retry queue.
#[async_trait]
pub trait RetryHandler: Send + Sync {
    /// Re-dispatch a task whose limit has reset. Errors are logged.
    async fn on_retry(&self, entry: &PendingRetry, cancel: &CancellationToken) -> Result<()>;

    /// A task exhausted its retry budget.
    async fn on_expired(&self, entry: &PendingRetry);
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub running: bool,
    pub pending_count: usize,
    pub pending: Vec<PendingRetry>,
    pub next_retry: Option<DateTime<Utc>>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Running {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

pub struct RetryScheduler {
    check_interval: Duration,
    retry_buffer: Duration,
    queue: Arc<TaskQueue>,
    handler: Arc<dyn RetryHandler>,
    running: Mutex<Option<Running>>,
}

impl RetryScheduler {
    pub fn new(config: &SchedulerConfig, queue: Arc<TaskQueue>, handler: Arc<dyn RetryHandler>) -> Self {
        Self {
            check_interval: config.check_interval(),
            retry_buffer: config.retry_buffer(),
            queue,
            handler,
            running: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Defer `task` until the limit resets plus the configured buffer.
    /// Returns the scheduled retry time.
    pub fn queue_task(&self, task: Arc<Task>, info: &RateLimitInfo) -> DateTime<Utc> {
        let buffer = chrono::Duration::from_std(self.retry_buffer).unwrap_or_else(|_| chrono::Duration::zero());
        let retry_at = info.reset_time + buffer;
        flog!(
            "Queued {} for retry at {} (resets in {})",
            task.id,
            retry_at,
            info.human_readable_reset()
        );
        self.queue.add(task, retry_at, info.raw_error.clone());
        retry_at
    }

    /// Start the background loop under `parent`; cancelling `parent` ends it
    /// as well as [`stop`](Self::stop). Calling it again while running does
    /// nothing.
    pub fn start(&self, parent: &CancellationToken) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(Running::is_live) {
            return;
        }

        let cancel = parent.child_token();
        let loop_cancel = cancel.clone();
        let queue = Arc::clone(&self.queue);
        let handler = Arc::clone(&self.handler);
        let period = self.check_interval;

        flog!(
            "RetryScheduler started: interval={:?} buffer={:?}",
            period,
            self.retry_buffer
        );

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => {
                        flog_debug!("RetryScheduler cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        process_queue(&queue, handler.as_ref(), &loop_cancel).await;
                    }
                }
            }
        });

        *running = Some(Running { cancel, handle });
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running { cancel, handle }) = running else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            flog_warn!("RetryScheduler loop ended abnormally: {}", e);
        }
        flog!("RetryScheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(Running::is_live)
    }

    /// Run one tick immediately, outside the timer.
    pub async fn process_now(&self, cancel: &CancellationToken) {
        process_queue(&self.queue, self.handler.as_ref(), cancel).await;
    }

    pub fn status(&self) -> SchedulerStatus {
        let pending = self.queue.list();
        SchedulerStatus {
            running: self.is_running(),
            pending_count: pending.len(),
            next_retry: self.queue.next_retry_time(),
            pending,
        }
    }
}

async fn process_queue(queue: &TaskQueue, handler: &dyn RetryHandler, cancel: &CancellationToken) {
    for entry in queue.get_expired() {
        flog_warn!(
            "Task {} exceeded {} retry attempts, dropping",
            entry.task.id,
            entry.attempts - 1
        );
        handler.on_expired(&entry).await;
    }

    for entry in queue.get_ready() {
        if cancel.is_cancelled() {
            // Put it back so it is not lost on shutdown.
            queue.restore(entry);
            continue;
        }
        flog!("Retrying {} (attempt {})", entry.task.id, entry.attempts);
        if let Err(e) = handler.on_retry(&entry, cancel).await {
            flog_error!("Retry of {} failed: {}", entry.task.id, e);
        }
    }
}
