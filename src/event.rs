// src/event.rs

//! Debounced, topic-scoped change notification bus
//!
//! Publishers announce that something in a shared collection changed; the
//! bus buffers those announcements per topic and flushes them to listeners
//! as one batch after a debounce window. Duplicate (sender, kind) pairs
//! inside a window collapse via set semantics, so a bulk operation touching
//! the same object hundreds of times produces a single notification. This
//! coalescing is the bus's anti-storm mechanism and the reason it exists.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EventBusConfig;
use crate::error::Result;
use crate::manager::{ManagedState, Manager, ManagerState, ManagerStatus};

/// The closed set of change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Save,
    Add,
    Remove,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Save => write!(f, "save"),
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// Opaque sender identity. Equality and hashing follow the underlying
/// allocation, so two events from the same shared object compare equal and
/// coalesce, while events from distinct objects never collide. Publishers
/// must reuse the same `Sender` (or the same `Arc`) for the same object.
#[derive(Clone)]
pub struct Sender(Arc<dyn Any + Send + Sync>);

impl Sender {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl<T: Any + Send + Sync> From<Arc<T>> for Sender {
    fn from(value: Arc<T>) -> Self {
        Self(value)
    }
}

impl PartialEq for Sender {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Sender {}

impl std::hash::Hash for Sender {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sender({:#x})", self.key())
    }
}

/// One change notification: who changed, and how.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeEvent {
    pub sender: Sender,
    pub kind: ChangeKind,
}

/// Batch observer for a topic. Called once per flush with the drained
/// events in insertion order, on the bus's timer task; callbacks must be
/// fast and non-blocking.
pub trait ChangeListener: Send + Sync {
    fn on_events(&self, topic: &str, events: &[ChangeEvent]);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    pub total_published: u64,
    pub total_coalesced: u64,
    pub total_flushes: u64,
    pub total_delivered: u64,
    pub listener_panics: u64,
}

#[derive(Default)]
struct TopicState {
    pending: Vec<ChangeEvent>,
    listeners: Vec<Arc<dyn ChangeListener>>,
    flush_scheduled: bool,
}

#[derive(Default)]
struct BusInner {
    topics: HashMap<String, TopicState>,
}

/// Topic-scoped pub/sub with per-topic debounce and coalescing.
///
/// Both maps (pending events and listeners) live under one coarse
/// reader/writer lock; the lock is never held across an await or during
/// listener callbacks.
pub struct EventBusManager {
    state: ManagedState,
    config: EventBusConfig,
    inner: Arc<RwLock<BusInner>>,
    published: AtomicU64,
    coalesced: AtomicU64,
    flushes: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
    listener_panics: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl Debug for EventBusManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBusManager")
            .field("debounce_ms", &self.config.debounce_ms)
            .field("topics", &self.inner.read().topics.len())
            .finish()
    }
}

impl EventBusManager {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            state: ManagedState::new(Uuid::new_v4(), "event_bus_manager"),
            config,
            inner: Arc::new(RwLock::new(BusInner::default())),
            published: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            flushes: Arc::new(AtomicU64::new(0)),
            delivered: Arc::new(AtomicU64::new(0)),
            listener_panics: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Registers a listener on a topic; the same listener (by identity) is
    /// registered once.
    pub fn register_listener(&self, topic: &str, listener: Arc<dyn ChangeListener>) {
        let mut inner = self.inner.write();
        let topic_state = inner.topics.entry(topic.to_string()).or_default();
        if !topic_state
            .listeners
            .iter()
            .any(|l| Arc::ptr_eq(l, &listener))
        {
            topic_state.listeners.push(listener);
        }
    }

    /// Removes a listener from a topic by identity.
    pub fn remove_listener(&self, topic: &str, listener: &Arc<dyn ChangeListener>) {
        let mut inner = self.inner.write();
        if let Some(topic_state) = inner.topics.get_mut(topic) {
            topic_state.listeners.retain(|l| !Arc::ptr_eq(l, listener));
        }
    }

    /// Publishes a change on a topic. The event joins the topic's pending
    /// set (duplicates collapse) and a flush is scheduled for one debounce
    /// window later, unless one is already pending for this topic.
    ///
    /// Must be called from within a tokio runtime.
    pub fn publish(&self, topic: &str, sender: Sender, kind: ChangeKind) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let event = ChangeEvent { sender, kind };
        self.published.fetch_add(1, Ordering::Relaxed);

        let schedule = {
            let mut inner = self.inner.write();
            let topic_state = inner.topics.entry(topic.to_string()).or_default();

            if topic_state.pending.contains(&event) {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
            } else {
                topic_state.pending.push(event);
            }

            if topic_state.flush_scheduled {
                false
            } else {
                topic_state.flush_scheduled = true;
                true
            }
        };

        if schedule {
            let inner = Arc::clone(&self.inner);
            let flushes = Arc::clone(&self.flushes);
            let delivered = Arc::clone(&self.delivered);
            let listener_panics = Arc::clone(&self.listener_panics);
            let shutdown = self.shutdown.clone();
            let topic = topic.to_string();
            let delay = Duration::from_millis(self.config.debounce_ms);

            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => return,
                }
                Self::flush_topic(&inner, &topic, &flushes, &delivered, &listener_panics);
            });
        }
    }

    /// Drains and delivers a topic's pending set. Draining and clearing the
    /// scheduled flag happen atomically under the write lock; delivery runs
    /// on a listener snapshot with the lock released. A flush that finds an
    /// empty pending set is a harmless no-op, so redundant flushes racing
    /// over the same set are safe.
    fn flush_topic(
        inner: &RwLock<BusInner>,
        topic: &str,
        flushes: &AtomicU64,
        delivered: &AtomicU64,
        listener_panics: &AtomicU64,
    ) {
        let (events, listeners) = {
            let mut guard = inner.write();
            let Some(topic_state) = guard.topics.get_mut(topic) else {
                return;
            };
            topic_state.flush_scheduled = false;
            (
                std::mem::take(&mut topic_state.pending),
                topic_state.listeners.clone(),
            )
        };

        flushes.fetch_add(1, Ordering::Relaxed);
        if events.is_empty() {
            return;
        }

        for listener in listeners {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_events(topic, &events);
            }));
            match outcome {
                Ok(()) => {
                    delivered.fetch_add(events.len() as u64, Ordering::Relaxed);
                }
                Err(_) => {
                    listener_panics.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(topic, "Change listener panicked during delivery");
                }
            }
        }
    }

    /// Immediately drains and delivers a topic, bypassing the debounce
    /// window. Used by orchestration code that must not wait out the window.
    pub fn flush_now(&self, topic: &str) {
        Self::flush_topic(
            &self.inner,
            topic,
            &self.flushes,
            &self.delivered,
            &self.listener_panics,
        );
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            total_published: self.published.load(Ordering::Relaxed),
            total_coalesced: self.coalesced.load(Ordering::Relaxed),
            total_flushes: self.flushes.load(Ordering::Relaxed),
            total_delivered: self.delivered.load(Ordering::Relaxed),
            listener_panics: self.listener_panics.load(Ordering::Relaxed),
        }
    }

    fn topic_count(&self) -> usize {
        self.inner.read().topics.len()
    }
}

#[async_trait]
impl Manager for EventBusManager {
    fn name(&self) -> &str {
        "event_bus_manager"
    }

    fn id(&self) -> Uuid {
        self.state.id()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::Initializing).await;
        self.state.set_state(ManagerState::Running).await;
        tracing::info!(
            debounce_ms = self.config.debounce_ms,
            "Event bus initialized"
        );
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.state.set_state(ManagerState::ShuttingDown).await;

        // Stop pending timers from delivering, then drop all bus state.
        self.shutdown.cancel();
        self.inner.write().topics.clear();

        self.state.set_state(ManagerState::Shutdown).await;
        tracing::info!("Event bus shut down");
        Ok(())
    }

    async fn status(&self) -> ManagerStatus {
        let mut status = self.state.status().await;
        let stats = self.stats();

        status.add_metadata(
            "total_published",
            serde_json::Value::from(stats.total_published),
        );
        status.add_metadata(
            "total_coalesced",
            serde_json::Value::from(stats.total_coalesced),
        );
        status.add_metadata("total_flushes", serde_json::Value::from(stats.total_flushes));
        status.add_metadata("topics", serde_json::Value::from(self.topic_count()));

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records every delivered batch.
    #[derive(Default)]
    struct RecordingListener {
        batches: Mutex<Vec<Vec<ChangeEvent>>>,
    }

    impl ChangeListener for RecordingListener {
        fn on_events(&self, _topic: &str, events: &[ChangeEvent]) {
            self.batches.lock().push(events.to_vec());
        }
    }

    fn bus(debounce_ms: u64) -> EventBusManager {
        EventBusManager::new(EventBusConfig { debounce_ms })
    }

    #[tokio::test]
    async fn test_duplicate_publishes_coalesce_into_one_event() {
        let bus = bus(50);
        let listener = Arc::new(RecordingListener::default());
        bus.register_listener("movies", listener.clone() as Arc<dyn ChangeListener>);

        let sender = Sender::new("movie #1".to_string());
        for _ in 0..5 {
            bus.publish("movies", sender.clone(), ChangeKind::Add);
        }

        tokio::time::sleep(Duration::from_millis(150)).await;

        let batches = listener.batches.lock().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].kind, ChangeKind::Add);
        assert_eq!(batches[0][0].sender, sender);

        let stats = bus.stats();
        assert_eq!(stats.total_published, 5);
        assert_eq!(stats.total_coalesced, 4);
    }

    #[tokio::test]
    async fn test_distinct_events_keep_insertion_order() {
        let bus = bus(50);
        let listener = Arc::new(RecordingListener::default());
        bus.register_listener("episodes", listener.clone() as Arc<dyn ChangeListener>);

        let first = Sender::new(1u32);
        let second = Sender::new(2u32);
        bus.publish("episodes", first.clone(), ChangeKind::Add);
        bus.publish("episodes", second.clone(), ChangeKind::Add);
        bus.publish("episodes", first.clone(), ChangeKind::Save);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let batches = listener.batches.lock().clone();
        assert_eq!(batches.len(), 1);
        let kinds: Vec<(Sender, ChangeKind)> = batches[0]
            .iter()
            .map(|e| (e.sender.clone(), e.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (first.clone(), ChangeKind::Add),
                (second, ChangeKind::Add),
                (first, ChangeKind::Save),
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_block_others() {
        struct PanickingListener;
        impl ChangeListener for PanickingListener {
            fn on_events(&self, _topic: &str, _events: &[ChangeEvent]) {
                panic!("listener bug");
            }
        }

        let bus = bus(30);
        let surviving = Arc::new(RecordingListener::default());
        bus.register_listener("shows", Arc::new(PanickingListener));
        bus.register_listener("shows", surviving.clone() as Arc<dyn ChangeListener>);

        bus.publish("shows", Sender::new(7u8), ChangeKind::Remove);
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(surviving.batches.lock().len(), 1);
        assert_eq!(bus.stats().listener_panics, 1);
    }

    #[tokio::test]
    async fn test_empty_flush_is_a_no_op() {
        let bus = bus(30);
        let listener = Arc::new(RecordingListener::default());
        bus.register_listener("movies", listener.clone() as Arc<dyn ChangeListener>);

        bus.publish("movies", Sender::new(1u32), ChangeKind::Save);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // the window's flush already drained the set; racing flushes over
        // the empty set must deliver nothing and panic nothing
        bus.flush_now("movies");
        bus.flush_now("movies");
        bus.flush_now("does-not-exist");

        assert_eq!(listener.batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_publishes_after_window_get_their_own_flush() {
        let bus = bus(40);
        let listener = Arc::new(RecordingListener::default());
        bus.register_listener("movies", listener.clone() as Arc<dyn ChangeListener>);

        let sender = Sender::new(1u32);
        bus.publish("movies", sender.clone(), ChangeKind::Add);
        tokio::time::sleep(Duration::from_millis(120)).await;

        bus.publish("movies", sender, ChangeKind::Save);
        tokio::time::sleep(Duration::from_millis(120)).await;

        let batches = listener.batches.lock().clone();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0][0].kind, ChangeKind::Add);
        assert_eq!(batches[1][0].kind, ChangeKind::Save);
    }

    #[tokio::test]
    async fn test_listener_identity_registered_once_and_removable() {
        let bus = bus(30);
        let listener = Arc::new(RecordingListener::default());
        let as_dyn = listener.clone() as Arc<dyn ChangeListener>;

        bus.register_listener("movies", as_dyn.clone());
        bus.register_listener("movies", as_dyn.clone());

        bus.publish("movies", Sender::new(1u32), ChangeKind::Add);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(listener.batches.lock().len(), 1);

        bus.remove_listener("movies", &as_dyn);
        bus.publish("movies", Sender::new(2u32), ChangeKind::Add);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(listener.batches.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_topics_are_independent() {
        let bus = bus(30);
        let movies = Arc::new(RecordingListener::default());
        let shows = Arc::new(RecordingListener::default());
        bus.register_listener("movies", movies.clone() as Arc<dyn ChangeListener>);
        bus.register_listener("shows", shows.clone() as Arc<dyn ChangeListener>);

        bus.publish("movies", Sender::new(1u32), ChangeKind::Add);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(movies.batches.lock().len(), 1);
        assert!(shows.batches.lock().is_empty());
    }

    /// The concrete scenario from the design discussion: duplicate adds for
    /// the same object inside the default 250 ms window produce exactly one
    /// delivered event.
    #[tokio::test]
    async fn test_default_window_duplicate_add_scenario() {
        let bus = EventBusManager::new(EventBusConfig::default());
        let listener = Arc::new(RecordingListener::default());
        bus.register_listener("movies", listener.clone() as Arc<dyn ChangeListener>);

        let obj1 = Sender::new("obj1".to_string());
        bus.publish("movies", obj1.clone(), ChangeKind::Add);
        tokio::time::sleep(Duration::from_millis(80)).await;
        bus.publish("movies", obj1.clone(), ChangeKind::Add);

        tokio::time::sleep(Duration::from_millis(300)).await;

        let batches = listener.batches.lock().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec![ChangeEvent { sender: obj1, kind: ChangeKind::Add }]);
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending_deliveries() {
        let mut bus = bus(50);
        bus.initialize().await.unwrap();

        let listener = Arc::new(RecordingListener::default());
        bus.register_listener("movies", listener.clone() as Arc<dyn ChangeListener>);
        bus.publish("movies", Sender::new(1u32), ChangeKind::Add);

        bus.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(listener.batches.lock().is_empty());
        bus.publish("movies", Sender::new(2u32), ChangeKind::Add);
        assert_eq!(bus.topic_count(), 0);
    }
}
