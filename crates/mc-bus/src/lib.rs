//! In-process publish/subscribe bus for coordination events.
//!
//! Subscriptions are exact-topic or wildcard (`*`). Publication runs in two
//! modes: `wait_for_handlers = true` dispatches handlers sequentially and
//! completes only after all of them finish (used for state-mutating
//! sequences such as lease-issuance logging); `false` is fire-and-forget.
//! A failing handler is logged and skipped for that event; it never aborts
//! the other handlers.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mc_core::collections;
use mc_core::types::Event;
use mc_core::Persistence;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Topic that matches every event.
pub const WILDCARD: &str = "*";

/// Event emitted (in-memory only) the first time a durable event write fails.
pub const DEGRADED_EVENT: &str = "persistence.degraded";

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

struct Subscription {
    topic: String,
    handler: Handler,
}

struct Inner {
    handlers: RwLock<Vec<Subscription>>,
    channels: RwLock<Vec<(String, flume::Sender<Event>)>>,
    history: Mutex<VecDeque<Event>>,
    history_limit: usize,
    persistence: Option<Arc<dyn Persistence>>,
    /// Latched once the durable log degrades to in-memory only.
    degraded: AtomicBool,
    seq: AtomicU64,
}

/// Broadcast-style event bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Create a bus with the default history limit and no durable log.
    pub fn new() -> Self {
        Self::with_limit(1000)
    }

    pub fn with_limit(history_limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(Vec::new()),
                channels: RwLock::new(Vec::new()),
                history: Mutex::new(VecDeque::new()),
                history_limit,
                persistence: None,
                degraded: AtomicBool::new(false),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Create a bus that appends every published event to the `events`
    /// collection of the given store.
    pub fn with_persistence(history_limit: usize, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(Vec::new()),
                channels: RwLock::new(Vec::new()),
                history: Mutex::new(VecDeque::new()),
                history_limit,
                persistence: Some(persistence),
                degraded: AtomicBool::new(false),
                seq: AtomicU64::new(0),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Subscription
    // -----------------------------------------------------------------------

    /// Register an async handler for a topic (or `*`).
    pub async fn subscribe<F, Fut>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)) as HandlerFuture);
        let mut handlers = self.inner.handlers.write().await;
        handlers.push(Subscription {
            topic: topic.into(),
            handler,
        });
    }

    /// Register a channel subscriber. The returned receiver sees every
    /// matching event published from this point forward; disconnected
    /// receivers are pruned automatically.
    pub async fn subscribe_channel(&self, topic: impl Into<String>) -> flume::Receiver<Event> {
        let (tx, rx) = flume::unbounded();
        let mut channels = self.inner.channels.write().await;
        channels.push((topic.into(), tx));
        rx
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.handlers.read().await.len() + self.inner.channels.read().await.len()
    }

    // -----------------------------------------------------------------------
    // Publication
    // -----------------------------------------------------------------------

    /// Publish an event.
    ///
    /// With `wait_for_handlers`, every matching handler has completed by the
    /// time this returns. Without it, handler fanout happens on a spawned
    /// task and only the history/durable appends are awaited.
    pub async fn publish(&self, event: Event, wait_for_handlers: bool) {
        self.record(&event).await;
        self.fanout_channels(&event).await;

        let matching = self.matching_handlers(&event.event_type).await;
        if matching.is_empty() {
            return;
        }

        if wait_for_handlers {
            Self::dispatch(matching, event).await;
        } else {
            tokio::spawn(async move {
                Self::dispatch(matching, event).await;
            });
        }
    }

    async fn matching_handlers(&self, event_type: &str) -> Vec<Handler> {
        let handlers = self.inner.handlers.read().await;
        handlers
            .iter()
            .filter(|s| s.topic == WILDCARD || s.topic == event_type)
            .map(|s| s.handler.clone())
            .collect()
    }

    /// Invoke handlers in subscription order; a failure is logged and the
    /// remaining handlers still run (error isolation).
    async fn dispatch(handlers: Vec<Handler>, event: Event) {
        for handler in handlers {
            if let Err(e) = handler(event.clone()).await {
                warn!(
                    event_type = %event.event_type,
                    error = %e,
                    "event handler failed; continuing with remaining handlers"
                );
            }
        }
    }

    async fn fanout_channels(&self, event: &Event) {
        let mut channels = self.inner.channels.write().await;
        channels.retain(|(topic, tx)| {
            if topic != WILDCARD && topic != &event.event_type {
                return !tx.is_disconnected();
            }
            tx.send(event.clone()).is_ok()
        });
    }

    /// Append to the bounded in-memory ring and, when configured, the
    /// durable `events` collection. A durable failure latches degraded mode
    /// and surfaces exactly one `persistence.degraded` event.
    async fn record(&self, event: &Event) {
        {
            let mut history = self.inner.history.lock().await;
            if history.len() >= self.inner.history_limit {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let Some(store) = &self.inner.persistence else {
            return;
        };
        if self.inner.degraded.load(Ordering::Relaxed) {
            return;
        }

        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let key = format!("{}-{:06}", event.timestamp.timestamp_millis(), seq);
        let value = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "event not serializable; skipping durable append");
                return;
            }
        };
        if let Err(e) = store.store(collections::EVENTS, &key, value).await {
            if !self.inner.degraded.swap(true, Ordering::SeqCst) {
                warn!(error = %e, "durable event log failed; continuing with in-memory ring only");
                let alert = Event::new(
                    DEGRADED_EVENT,
                    "event_bus",
                    serde_json::json!({ "error": e.to_string() }),
                );
                let mut history = self.inner.history.lock().await;
                if history.len() >= self.inner.history_limit {
                    history.pop_front();
                }
                history.push_back(alert);
            }
        } else {
            debug!(event_type = %event.event_type, "event recorded");
        }
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Most recent events, oldest first, at most `limit`.
    pub async fn recent_events(&self, limit: usize) -> Vec<Event> {
        let history = self.inner.history.lock().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mc_core::{FileStore, PersistenceExt};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn event(event_type: &str) -> Event {
        Event::new(event_type, "test", json!({}))
    }

    #[tokio::test]
    async fn exact_topic_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.subscribe("lease.recovered", move |_| {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        bus.publish(event("lease.recovered"), true).await;
        bus.publish(event("task.completed"), true).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wildcard_sees_everything() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.subscribe(WILDCARD, move |_| {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        bus.publish(event("a"), true).await;
        bus.publish(event("b"), true).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_handler_does_not_abort_others() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe("x", |_| async { Err("boom".into()) }).await;
        let h = hits.clone();
        bus.subscribe("x", move |_| {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        bus.publish(event("x"), true).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_for_handlers_completes_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            bus.subscribe("seq", move |_| {
                let order = order.clone();
                async move {
                    order.lock().await.push(i);
                    Ok(())
                }
            })
            .await;
        }

        bus.publish(event("seq"), true).await;
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn channel_subscriber_receives_matching() {
        let bus = EventBus::new();
        let rx = bus.subscribe_channel("task.completed").await;

        bus.publish(event("task.completed"), true).await;
        bus.publish(event("other"), true).await;

        let got = rx.recv_async().await.unwrap();
        assert_eq!(got.event_type, "task.completed");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnected_channels_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe_channel(WILDCARD).await;
        assert_eq!(bus.subscriber_count().await, 1);
        drop(rx);
        bus.publish(event("x"), true).await;
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let bus = EventBus::with_limit(3);
        for i in 0..5 {
            bus.publish(event(&format!("e{}", i)), true).await;
        }
        let recent = bus.recent_events(10).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].event_type, "e2");
        assert_eq!(recent[2].event_type, "e4");
    }

    #[tokio::test]
    async fn durable_log_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Persistence> = Arc::new(FileStore::new(dir.path()));
        let bus = EventBus::with_persistence(100, store.clone());

        bus.publish(event("first"), true).await;
        bus.publish(event("second"), true).await;

        let rows: Vec<Event> = store.query_typed(collections::EVENTS, 0, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].event_type, "first");
        assert_eq!(rows[1].event_type, "second");
    }

    #[tokio::test]
    async fn durable_failure_latches_single_degraded_alert() {
        // A file store rooted at a path that cannot be created.
        let store: Arc<dyn Persistence> = Arc::new(FileStore::new("/proc/marcus-no-such-dir"));
        let bus = EventBus::with_persistence(100, store);

        bus.publish(event("a"), true).await;
        bus.publish(event("b"), true).await;
        bus.publish(event("c"), true).await;

        assert!(bus.is_degraded());
        let degraded: Vec<Event> = bus
            .recent_events(100)
            .await
            .into_iter()
            .filter(|e| e.event_type == DEGRADED_EVENT)
            .collect();
        assert_eq!(degraded.len(), 1);
    }
}
