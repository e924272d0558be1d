// src/pool.rs

//! Bounded FIFO execution pool for one task category
//!
//! A pool owns an unbounded submission queue and a dispatcher that starts
//! jobs strictly in submission order, gated by a semaphore sized to the
//! pool's capacity. Queue depth is unbounded on purpose: pool exhaustion is
//! not an error in this design, jobs simply wait their turn.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, PoolOperation, Result};
use crate::task::{ActivityTracker, Task, TaskHandle, TaskState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub label: String,
    pub capacity: usize,
    pub active: usize,
    pub queued: usize,
    pub finished: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// State shared between the pool, its dispatcher, and running jobs.
#[derive(Debug)]
struct PoolShared {
    label: String,
    registry: DashMap<u64, Arc<TaskHandle>>,
    outstanding: AtomicUsize,
    active: AtomicUsize,
    finished: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    idle: Notify,
}

impl PoolShared {
    fn new(label: String) -> Self {
        Self {
            label,
            registry: DashMap::new(),
            outstanding: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            finished: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            idle: Notify::new(),
        }
    }

    fn record_outcome(&self, state: TaskState) {
        match state {
            TaskState::Finished => self.finished.fetch_add(1, Ordering::Relaxed),
            TaskState::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
            TaskState::Cancelled => self.cancelled.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    /// Removes a task from the registry and wakes idle waiters when the
    /// last outstanding job drains.
    fn task_done(&self, task_id: u64) {
        self.registry.remove(&task_id);
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Cancels a queued task that will never be started.
    fn discard(&self, task: Task) {
        let handle = task.handle();
        handle.cancel();
        self.record_outcome(TaskState::Cancelled);
        self.task_done(handle.id());
    }
}

/// Bounded worker pool executing submitted tasks in FIFO order.
pub struct TaskPool {
    shared: Arc<PoolShared>,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    queue_tx: mpsc::UnboundedSender<Task>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
    activity: Arc<ActivityTracker>,
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("label", &self.shared.label)
            .field("capacity", &self.capacity)
            .field("active", &self.shared.active.load(Ordering::Relaxed))
            .field(
                "outstanding",
                &self.shared.outstanding.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl TaskPool {
    pub fn new(label: impl Into<String>, capacity: usize, activity: Arc<ActivityTracker>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(PoolShared::new(label.into())),
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown: CancellationToken::new(),
            dispatcher: Mutex::new(None),
            activity,
        }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.shared
            .outstanding
            .load(Ordering::SeqCst)
            .saturating_sub(self.active())
    }

    /// Starts the dispatcher. Submissions made before `start` wait in the
    /// queue and are picked up once the dispatcher runs.
    pub fn start(&self) {
        let Some(queue_rx) = self.queue_rx.lock().take() else {
            return;
        };

        let handle = tokio::spawn(Self::dispatch(
            Arc::clone(&self.shared),
            queue_rx,
            Arc::clone(&self.semaphore),
            self.shutdown.clone(),
            Arc::clone(&self.activity),
        ));
        *self.dispatcher.lock() = Some(handle);
    }

    /// Enqueues a task. Jobs are started in submission order; there is no
    /// rejection policy for a busy pool.
    pub fn submit(&self, task: Task) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::pool(
                self.shared.label.clone(),
                PoolOperation::Submit,
                "Pool is shut down",
            ));
        }

        let handle = task.handle();
        self.shared.registry.insert(handle.id(), handle);
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);

        if let Err(send_error) = self.queue_tx.send(task) {
            let task = send_error.0;
            let handle = task.handle();
            self.shared.task_done(handle.id());
            return Err(Error::pool(
                self.shared.label.clone(),
                PoolOperation::Submit,
                "Pool queue is closed",
            ));
        }

        Ok(())
    }

    /// Requests cancellation of every queued and running task. Queued tasks
    /// are observed cancelled by the dispatcher and their bodies never run;
    /// running tasks exit at their next cooperative checkpoint.
    pub fn cancel_all(&self) {
        for entry in self.shared.registry.iter() {
            entry.value().cancel();
        }
    }

    /// Resolves once the pool has neither queued nor running work.
    pub async fn await_idle(&self) {
        loop {
            if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }

            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            // Register interest before the re-check so a completion landing
            // in between cannot be missed.
            notified.as_mut().enable();
            if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stops the dispatcher, cancels all work, and waits (bounded) for
    /// running jobs to exit cooperatively.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.cancel_all();

        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }

        if tokio::time::timeout(Duration::from_secs(5), self.await_idle())
            .await
            .is_err()
        {
            tracing::warn!(
                pool = %self.shared.label,
                "Jobs did not exit within the shutdown grace period"
            );
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            label: self.shared.label.clone(),
            capacity: self.capacity,
            active: self.active(),
            queued: self.queued(),
            finished: self.shared.finished.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            cancelled: self.shared.cancelled.load(Ordering::Relaxed),
        }
    }

    async fn dispatch(
        shared: Arc<PoolShared>,
        mut queue: mpsc::UnboundedReceiver<Task>,
        semaphore: Arc<Semaphore>,
        shutdown: CancellationToken,
        activity: Arc<ActivityTracker>,
    ) {
        tracing::debug!(pool = %shared.label, "Pool dispatcher started");

        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                task = queue.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            // Capacity gate: acquire before spawning so jobs start strictly
            // in submission order and active never exceeds capacity.
            let permit = tokio::select! {
                _ = shutdown.cancelled() => {
                    shared.discard(task);
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            shared.active.fetch_add(1, Ordering::SeqCst);
            let job_shared = Arc::clone(&shared);
            let job_activity = Arc::clone(&activity);
            tokio::spawn(async move {
                let handle = task.handle();
                task.run(job_activity).await;
                job_shared.record_outcome(handle.state());
                drop(permit);
                job_shared.active.fetch_sub(1, Ordering::SeqCst);
                job_shared.task_done(handle.id());
            });
        }

        // Shutdown path: everything still queued is cancelled, not run.
        queue.close();
        while let Ok(task) = queue.try_recv() {
            shared.discard(task);
        }

        tracing::debug!(pool = %shared.label, "Pool dispatcher stopped");
    }
}
