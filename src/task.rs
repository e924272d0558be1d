// src/task.rs

//! Cancellable background tasks with lifecycle tracking and category routing
//!
//! A [`Task`] pairs an observable [`TaskHandle`] with a one-shot async body.
//! The handle carries the lifecycle state machine
//! (`Created → Started → {Finished | Failed | Cancelled}`), progress counters,
//! and the listener set; the body receives a [`TaskContext`] through which it
//! polls for cooperative cancellation and publishes progress. The
//! [`TaskManager`] routes submissions to one bounded pool per category.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TaskConfig;
use crate::error::Result;
use crate::manager::{ManagedState, Manager, ManagerState, ManagerStatus};
use crate::pool::{PoolStats, TaskPool};

/// Process-unique, monotonically increasing task ids for log lines and
/// debugging output.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    Started,
    Finished,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Started => write!(f, "STARTED"),
            Self::Finished => write!(f, "FINISHED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Closed routing classification; which bounded pool executes a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskCategory {
    Main,
    Background,
    Download,
    ImageCache,
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Background => write!(f, "background"),
            Self::Download => write!(f, "download"),
            Self::ImageCache => write!(f, "image-cache"),
        }
    }
}

/// Observer callback for task state and progress changes.
///
/// Invoked synchronously on whatever thread drives the task; observers that
/// update UI state must marshal back to their own thread themselves.
pub trait TaskListener: Send + Sync {
    fn on_task_event(&self, task: &TaskHandle);
}

/// Process-wide last-activity timestamp, touched on every progress publish.
/// An external idle detector reads it to decide when the application is
/// quiescent.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    last: Mutex<Option<Instant>>,
}

impl ActivityTracker {
    pub fn touch(&self) {
        *self.last.lock() = Some(Instant::now());
    }

    pub fn last_activity(&self) -> Option<Instant> {
        *self.last.lock()
    }

    pub fn idle_for(&self) -> Option<Duration> {
        self.last.lock().map(|at| at.elapsed())
    }
}

#[derive(Debug, Default)]
struct ElapsedTimer {
    started: Option<Instant>,
    accumulated: Duration,
}

impl ElapsedTimer {
    fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.accumulated += started.elapsed();
        }
    }

    fn elapsed(&self) -> Duration {
        self.accumulated
            + self
                .started
                .map(|started| started.elapsed())
                .unwrap_or_default()
    }
}

/// Shared, observable side of a task.
pub struct TaskHandle {
    id: u64,
    name: String,
    description: RwLock<String>,
    work_total: AtomicU64,
    work_done: AtomicU64,
    state: RwLock<TaskState>,
    failure: RwLock<Option<String>>,
    cancel_token: CancellationToken,
    cancel_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    listeners: RwLock<Vec<Arc<dyn TaskListener>>>,
    timer: Mutex<ElapsedTimer>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &*self.state.read())
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish()
    }
}

impl TaskHandle {
    fn new(name: String, description: String, work_total: u64) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name,
            description: RwLock::new(description),
            work_total: AtomicU64::new(work_total),
            work_done: AtomicU64::new(0),
            state: RwLock::new(TaskState::Created),
            failure: RwLock::new(None),
            cancel_token: CancellationToken::new(),
            cancel_hook: Mutex::new(None),
            listeners: RwLock::new(Vec::new()),
            timer: Mutex::new(ElapsedTimer::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        *self.state.read()
    }

    pub fn description(&self) -> String {
        self.description.read().clone()
    }

    /// Returns `(completed, total)` work units. Values come straight from
    /// the job body; the core does not clamp them.
    pub fn progress(&self) -> (u64, u64) {
        (
            self.work_done.load(Ordering::Relaxed),
            self.work_total.load(Ordering::Relaxed),
        )
    }

    pub fn elapsed(&self) -> Duration {
        self.timer.lock().elapsed()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// The failure message if the task ended in [`TaskState::Failed`].
    pub fn failure(&self) -> Option<String> {
        self.failure.read().clone()
    }

    /// Registers a listener; the same listener (by identity) is added once.
    pub fn add_listener(&self, listener: Arc<dyn TaskListener>) {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Removes a listener by identity.
    pub fn remove_listener(&self, listener: &Arc<dyn TaskListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Requests cancellation. Idempotent: the flag latches, the forwarding
    /// hook runs once, and listeners see at most one `Cancelled` event.
    /// The body may keep running to a safe stopping point; it is expected
    /// to poll [`TaskContext::is_cancelled`] and return early.
    pub fn cancel(self: &Arc<Self>) {
        self.cancel_token.cancel();

        let hook = self.cancel_hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }

        self.timer.lock().stop();

        if self.transition(TaskState::Cancelled) {
            tracing::debug!(task_id = self.id, task = %self.name, "Task cancelled");
            self.notify_listeners();
            self.release_listeners();
        }
    }

    /// Installs the hook invoked on the first effective cancel. Used by
    /// composite tasks to forward cancellation into their active child.
    pub(crate) fn set_cancel_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.cancel_hook.lock() = Some(hook);
    }

    /// Moves the state machine forward. Returns false when the transition
    /// is not allowed: terminal states are never left, and `Started` only
    /// follows `Created`.
    pub(crate) fn transition(&self, next: TaskState) -> bool {
        let mut state = self.state.write();
        if state.is_terminal() || *state == next {
            return false;
        }
        if next == TaskState::Started && *state != TaskState::Created {
            return false;
        }
        *state = next;
        true
    }

    pub(crate) fn set_failure(&self, message: String) {
        *self.failure.write() = Some(message);
    }

    pub(crate) fn set_work_total(&self, total: u64) {
        self.work_total.store(total, Ordering::Relaxed);
    }

    pub(crate) fn publish(&self, description: Option<String>, work_done: Option<u64>) {
        if let Some(description) = description {
            *self.description.write() = description;
        }
        if let Some(done) = work_done {
            self.work_done.store(done, Ordering::Relaxed);
        }
        self.notify_listeners();
    }

    /// Notifies all listeners from a snapshot taken under the lock; a
    /// panicking listener is isolated and does not stop the others.
    pub(crate) fn notify_listeners(&self) {
        let snapshot = self.listeners.read().clone();
        for listener in snapshot {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_task_event(self);
            }));
            if outcome.is_err() {
                tracing::warn!(task_id = self.id, task = %self.name, "Task listener panicked");
            }
        }
    }

    /// Drops all listeners so a terminal task retains no observers.
    pub(crate) fn release_listeners(&self) {
        self.listeners.write().clear();
    }

    pub(crate) fn start_timer(&self) {
        self.timer.lock().start();
    }

    pub(crate) fn stop_timer(&self) {
        self.timer.lock().stop();
    }
}

/// Capability handed to a job body: cooperative cancellation plus progress
/// publishing. Progress publishes also touch the process-wide activity
/// tracker.
pub struct TaskContext {
    handle: Arc<TaskHandle>,
    activity: Arc<ActivityTracker>,
}

impl TaskContext {
    pub fn task(&self) -> &Arc<TaskHandle> {
        &self.handle
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.handle.cancel_token.cancelled().await;
    }

    /// Updates the description and completed work units, then notifies
    /// listeners synchronously on the calling thread.
    pub fn publish_state(&self, description: impl Into<String>, work_done: u64) {
        self.activity.touch();
        self.handle
            .publish(Some(description.into()), Some(work_done));
    }

    /// Updates completed work units only.
    pub fn publish_progress(&self, work_done: u64) {
        self.activity.touch();
        self.handle.publish(None, Some(work_done));
    }

    /// Adjusts the total work units when the job learns its real size late.
    pub fn set_work_total(&self, total: u64) {
        self.handle.set_work_total(total);
    }

    pub(crate) fn activity(&self) -> Arc<ActivityTracker> {
        Arc::clone(&self.activity)
    }
}

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type TaskBody = Box<dyn FnOnce(TaskContext) -> TaskFuture + Send>;

/// A unit of cancellable background work: an observable handle plus a
/// one-shot body.
pub struct Task {
    handle: Arc<TaskHandle>,
    body: TaskBody,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("handle", &self.handle)
            .field("body", &"<body>")
            .finish()
    }
}

impl Task {
    pub fn handle(&self) -> Arc<TaskHandle> {
        Arc::clone(&self.handle)
    }

    /// Drives the task through its lifecycle. Invoked exactly once, by a
    /// pool dispatcher or a composite parent.
    ///
    /// A pre-start cancel skips the body entirely. A body error or panic is
    /// captured here and surfaced as `Failed`; it never reaches the pool.
    pub(crate) async fn run(self, activity: Arc<ActivityTracker>) {
        let Task { handle, body } = self;

        if handle.is_cancelled() {
            tracing::debug!(
                task_id = handle.id,
                task = %handle.name,
                "Cancelled before start, skipping body"
            );
            if handle.transition(TaskState::Cancelled) {
                handle.notify_listeners();
            }
            handle.release_listeners();
            return;
        }

        handle.start_timer();
        if handle.transition(TaskState::Started) {
            handle.notify_listeners();
        }
        activity.touch();

        let context = TaskContext {
            handle: Arc::clone(&handle),
            activity,
        };
        let outcome = std::panic::AssertUnwindSafe(body(context))
            .catch_unwind()
            .await;

        handle.stop_timer();

        let next = match outcome {
            Ok(Ok(())) => TaskState::Finished,
            Ok(Err(err)) => {
                tracing::error!(
                    task_id = handle.id,
                    task = %handle.name,
                    error = %err,
                    "Task failed"
                );
                handle.set_failure(err.to_string());
                TaskState::Failed
            }
            Err(_) => {
                tracing::error!(task_id = handle.id, task = %handle.name, "Task body panicked");
                handle.set_failure("task body panicked".to_string());
                TaskState::Failed
            }
        };

        // A concurrent cancel() may have already made the state terminal;
        // the monotonic guard keeps Cancelled final in that case.
        if handle.transition(next) {
            handle.notify_listeners();
        }
        handle.release_listeners();
    }
}

/// Builder for tasks.
pub struct TaskBuilder {
    name: String,
    description: String,
    work_units: u64,
    listeners: Vec<Arc<dyn TaskListener>>,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            work_units: 0,
            listeners: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn work_units(mut self, work_units: u64) -> Self {
        self.work_units = work_units;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn TaskListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build<F, Fut>(self, body: F) -> Task
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = TaskHandle::new(self.name, self.description, self.work_units);
        for listener in self.listeners {
            handle.add_listener(listener);
        }

        Task {
            handle,
            body: Box::new(move |ctx| Box::pin(body(ctx))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManagerStats {
    pub total_submitted: u64,
    pub pools: Vec<PoolStats>,
}

/// Routes task submissions to one bounded pool per category.
///
/// One instance per process, constructed by the composition root; tests
/// build their own isolated instances.
#[derive(Debug)]
pub struct TaskManager {
    state: ManagedState,
    main_pool: TaskPool,
    background_pool: TaskPool,
    download_pool: TaskPool,
    image_cache_pool: TaskPool,
    named_pools: DashMap<String, Arc<TaskPool>>,
    activity: Arc<ActivityTracker>,
    total_submitted: AtomicU64,
}

impl TaskManager {
    pub fn new(config: TaskConfig) -> Self {
        let activity = Arc::new(ActivityTracker::default());
        Self {
            state: ManagedState::new(Uuid::new_v4(), "task_manager"),
            main_pool: TaskPool::new("main", config.main_capacity, Arc::clone(&activity)),
            background_pool: TaskPool::new(
                "background",
                config.background_capacity,
                Arc::clone(&activity),
            ),
            download_pool: TaskPool::new(
                "download",
                config.download_capacity,
                Arc::clone(&activity),
            ),
            image_cache_pool: TaskPool::new(
                "image-cache",
                config.image_cache_capacity,
                Arc::clone(&activity),
            ),
            named_pools: DashMap::new(),
            activity,
            total_submitted: AtomicU64::new(0),
        }
    }

    fn pool_for(&self, category: TaskCategory) -> &TaskPool {
        match category {
            TaskCategory::Main => &self.main_pool,
            TaskCategory::Background => &self.background_pool,
            TaskCategory::Download => &self.download_pool,
            TaskCategory::ImageCache => &self.image_cache_pool,
        }
    }

    /// Submits a task for execution on the pool matching its category.
    pub fn submit(&self, category: TaskCategory, task: Task) -> Result<Arc<TaskHandle>> {
        let handle = task.handle();
        self.pool_for(category).submit(task)?;
        self.total_submitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            task_id = handle.id(),
            task = %handle.name(),
            %category,
            "Task submitted"
        );
        Ok(handle)
    }

    pub fn submit_main(&self, task: Task) -> Result<Arc<TaskHandle>> {
        self.submit(TaskCategory::Main, task)
    }

    pub fn submit_background(&self, task: Task) -> Result<Arc<TaskHandle>> {
        self.submit(TaskCategory::Background, task)
    }

    pub fn submit_download(&self, task: Task) -> Result<Arc<TaskHandle>> {
        self.submit(TaskCategory::Download, task)
    }

    pub fn submit_image_cache(&self, task: Task) -> Result<Arc<TaskHandle>> {
        self.submit(TaskCategory::ImageCache, task)
    }

    /// Wraps a plain closure into an unnamed, listener-less task. The
    /// closure still receives a [`TaskContext`] so it can honor
    /// cancellation like every other job.
    pub fn submit_fn<F, Fut>(
        &self,
        category: TaskCategory,
        name: impl Into<String>,
        body: F,
    ) -> Result<Arc<TaskHandle>>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.submit(category, TaskBuilder::new(name).build(body))
    }

    /// Escape hatch: submits to a named pool, creating it with the given
    /// capacity on first use. The capacity argument is ignored for a pool
    /// that already exists.
    pub fn submit_named(
        &self,
        pool_name: &str,
        capacity: usize,
        task: Task,
    ) -> Result<Arc<TaskHandle>> {
        let pool = self
            .named_pools
            .entry(pool_name.to_string())
            .or_insert_with(|| {
                let pool = Arc::new(TaskPool::new(
                    pool_name,
                    capacity.max(1),
                    Arc::clone(&self.activity),
                ));
                pool.start();
                pool
            })
            .clone();

        let handle = task.handle();
        pool.submit(task)?;
        self.total_submitted.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    /// Resolves when every pool has neither queued nor running work.
    pub async fn await_idle(&self) {
        self.main_pool.await_idle().await;
        self.background_pool.await_idle().await;
        self.download_pool.await_idle().await;
        self.image_cache_pool.await_idle().await;

        let named: Vec<Arc<TaskPool>> =
            self.named_pools.iter().map(|e| Arc::clone(e.value())).collect();
        for pool in named {
            pool.await_idle().await;
        }
    }

    /// Requests cancellation of every queued and running task in every pool.
    pub fn cancel_all(&self) {
        self.main_pool.cancel_all();
        self.background_pool.cancel_all();
        self.download_pool.cancel_all();
        self.image_cache_pool.cancel_all();
        for entry in self.named_pools.iter() {
            entry.value().cancel_all();
        }
    }

    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    pub fn stats(&self) -> TaskManagerStats {
        let mut pools = vec![
            self.main_pool.stats(),
            self.background_pool.stats(),
            self.download_pool.stats(),
            self.image_cache_pool.stats(),
        ];
        for entry in self.named_pools.iter() {
            pools.push(entry.value().stats());
        }

        TaskManagerStats {
            total_submitted: self.total_submitted.load(Ordering::Relaxed),
            pools,
        }
    }
}

#[async_trait]
impl Manager for TaskManager {
    fn name(&self) -> &str {
        "task_manager"
    }

    fn id(&self) -> Uuid {
        self.state.id()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::Initializing).await;

        self.main_pool.start();
        self.background_pool.start();
        self.download_pool.start();
        self.image_cache_pool.start();

        self.state.set_state(ManagerState::Running).await;
        tracing::info!("Task manager initialized");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::ShuttingDown).await;

        self.main_pool.shutdown().await;
        self.background_pool.shutdown().await;
        self.download_pool.shutdown().await;
        self.image_cache_pool.shutdown().await;

        let named: Vec<Arc<TaskPool>> =
            self.named_pools.iter().map(|e| Arc::clone(e.value())).collect();
        for pool in named {
            pool.shutdown().await;
        }
        self.named_pools.clear();

        self.state.set_state(ManagerState::Shutdown).await;
        tracing::info!("Task manager shut down");
        Ok(())
    }

    async fn status(&self) -> ManagerStatus {
        let mut status = self.state.status().await;
        let stats = self.stats();

        status.add_metadata(
            "total_submitted",
            serde_json::Value::from(stats.total_submitted),
        );
        for pool in &stats.pools {
            status.add_metadata(
                format!("pool.{}.active", pool.label),
                serde_json::Value::from(pool.active),
            );
            status.add_metadata(
                format!("pool.{}.queued", pool.label),
                serde_json::Value::from(pool.queued),
            );
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct RecordingListener {
        states: Mutex<Vec<TaskState>>,
    }

    impl TaskListener for RecordingListener {
        fn on_task_event(&self, task: &TaskHandle) {
            self.states.lock().push(task.state());
        }
    }

    fn activity() -> Arc<ActivityTracker> {
        Arc::new(ActivityTracker::default())
    }

    #[tokio::test]
    async fn test_lifecycle_is_monotonic() {
        let listener = Arc::new(RecordingListener::default());
        let task = TaskBuilder::new("scan library")
            .listener(listener.clone())
            .build(|ctx| async move {
                ctx.publish_state("scanning", 1);
                Ok(())
            });

        task.run(activity()).await;

        let states = listener.states.lock().clone();
        assert_eq!(
            states,
            vec![TaskState::Started, TaskState::Started, TaskState::Finished]
        );
    }

    #[tokio::test]
    async fn test_pre_start_cancel_skips_body() {
        let body_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&body_ran);
        let task = TaskBuilder::new("doomed").build(move |_ctx| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let handle = task.handle();
        handle.cancel();
        task.run(activity()).await;

        assert!(!body_ran.load(Ordering::SeqCst));
        assert_eq!(handle.state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_body_error_surfaces_as_failed() {
        let task = TaskBuilder::new("broken").build(|_ctx| async move {
            Err(crate::error::Error::task(None, None, "no datasource"))
        });

        let handle = task.handle();
        task.run(activity()).await;

        assert_eq!(handle.state(), TaskState::Failed);
        assert!(handle.failure().unwrap().contains("no datasource"));
    }

    #[tokio::test]
    async fn test_body_panic_surfaces_as_failed() {
        let task = TaskBuilder::new("panicky")
            .build(|_ctx| async move { panic!("job body blew up") });

        let handle = task.handle();
        task.run(activity()).await;

        assert_eq!(handle.state(), TaskState::Failed);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let listener = Arc::new(RecordingListener::default());
        let task = TaskBuilder::new("cancelled twice")
            .listener(listener.clone())
            .build(|_ctx| async move { Ok(()) });

        let handle = task.handle();
        handle.cancel();
        handle.cancel();

        let cancelled_events = listener
            .states
            .lock()
            .iter()
            .filter(|s| **s == TaskState::Cancelled)
            .count();
        assert_eq!(cancelled_events, 1);
    }

    #[tokio::test]
    async fn test_cancel_during_run_stays_cancelled() {
        let task = TaskBuilder::new("slow copy").build(|ctx| async move {
            ctx.cancelled().await;
            // observed the flag, exit early as a cooperative body should
            Ok(())
        });

        let handle = task.handle();
        let runner = tokio::spawn(task.run(activity()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        runner.await.unwrap();

        // the body returned Ok after cancel; Cancelled must not be overwritten
        assert_eq!(handle.state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_listeners_released_after_terminal_state() {
        let listener = Arc::new(RecordingListener::default());
        let task = TaskBuilder::new("short")
            .listener(listener.clone())
            .build(|_ctx| async move { Ok(()) });

        let handle = task.handle();
        task.run(activity()).await;

        assert_eq!(handle.state(), TaskState::Finished);
        // only the test's own reference remains
        assert_eq!(Arc::strong_count(&listener), 1);
    }

    #[tokio::test]
    async fn test_publish_state_updates_and_touches_activity() {
        let tracker = activity();
        let task = TaskBuilder::new("scrape")
            .work_units(10)
            .build(|ctx| async move {
                ctx.publish_state("episode 3", 3);
                Ok(())
            });

        let handle = task.handle();
        assert!(tracker.last_activity().is_none());
        task.run(Arc::clone(&tracker)).await;

        assert_eq!(handle.description(), "episode 3");
        assert_eq!(handle.progress(), (3, 10));
        assert!(tracker.last_activity().is_some());
    }

    #[tokio::test]
    async fn test_panicking_task_listener_is_isolated() {
        struct PanickingListener;
        impl TaskListener for PanickingListener {
            fn on_task_event(&self, _task: &TaskHandle) {
                panic!("listener bug");
            }
        }

        let recording = Arc::new(RecordingListener::default());
        let task = TaskBuilder::new("observed")
            .listener(Arc::new(PanickingListener))
            .listener(recording.clone())
            .build(|_ctx| async move { Ok(()) });

        task.run(activity()).await;

        // the well-behaved listener still saw the full lifecycle
        assert_eq!(
            recording.states.lock().clone(),
            vec![TaskState::Started, TaskState::Finished]
        );
    }

    #[tokio::test]
    async fn test_manager_routes_and_completes() {
        let mut manager = TaskManager::new(TaskConfig::default());
        manager.initialize().await.unwrap();

        let handle = manager
            .submit_fn(TaskCategory::Background, "refresh", |ctx| async move {
                ctx.publish_progress(1);
                Ok(())
            })
            .unwrap();

        manager.await_idle().await;
        assert_eq!(handle.state(), TaskState::Finished);
        assert_eq!(manager.stats().total_submitted, 1);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_manager_named_pool_escape_hatch() {
        let mut manager = TaskManager::new(TaskConfig::default());
        manager.initialize().await.unwrap();

        let task = TaskBuilder::new("nfo export").build(|_ctx| async move { Ok(()) });
        let handle = manager.submit_named("export", 2, task).unwrap();

        manager.await_idle().await;
        assert_eq!(handle.state(), TaskState::Finished);

        manager.shutdown().await.unwrap();
    }
}
