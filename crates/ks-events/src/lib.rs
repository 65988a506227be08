//! In-process (and pluggable cross-process) typed topic dispatch.
//!
//! [`EventBus`] is the contract every engine's provider publishes
//! through. [`InProcessEventBus`] is the default: synchronous relative
//! to the caller's `dispatch` (it awaits every listener before
//! returning), with listeners run concurrently and FIFO per listener.
//!
//! Rust closures have no stable notion of reference equality, so rather
//! than identifying listeners "by reference", this crate substitutes
//! the idiomatic Rust equivalent: `add_listener`/`listen_once`
//! return a [`ListenerId`] handle, and that handle — not the closure — is
//! the identity `remove_listener` matches on. Passing the exact same
//! `Arc<...>` listener twice is still idempotent: [`InProcessEventBus`]
//! dedupes by `Arc::ptr_eq` and returns the existing id.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use ks_domain::SharedClock;
use ks_task::{Task, TaskCtx, TaskError};

pub type Payload = serde_json::Value;
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A listener callback. Returns `Err` to signal a failure that the bus
/// logs but does not propagate to other listeners.
pub type ListenerFn = Arc<dyn Fn(Payload) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Mint an id from a process-local counter. Exposed so out-of-crate
    /// `EventBus` implementations (e.g. a cross-process pub/sub adapter)
    /// can allocate ids with the same scheme `InProcessEventBus` uses.
    pub fn from_raw(value: u64) -> Self {
        ListenerId(value)
    }
}

/// Contract every engine's provider publishes through.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Deliver `payload` to every listener registered on `topic` at the
    /// moment this call starts; returns once all of them have run.
    async fn dispatch(&self, topic: &str, payload: Payload);

    /// Register `listener` on `topic`. Registering the exact same `Arc`
    /// twice is idempotent — implementations should return the original
    /// id rather than double-register.
    fn add_listener(&self, topic: &str, listener: ListenerFn) -> ListenerId;

    fn remove_listener(&self, topic: &str, id: ListenerId);

    /// Register a listener that self-removes after its first invocation.
    fn listen_once(&self, topic: &str, listener: ListenerFn) -> ListenerId;
}

/// Convenience wrapper returned by [`subscribe`]/[`subscribe_once`]: call
/// `unsubscribe()` (or just drop it) to remove the registration.
pub struct Unsubscribe {
    bus: Arc<dyn EventBus>,
    topic: String,
    id: ListenerId,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        self.bus.remove_listener(&self.topic, self.id);
    }
}

pub fn subscribe(bus: Arc<dyn EventBus>, topic: impl Into<String>, listener: ListenerFn) -> Unsubscribe {
    let topic = topic.into();
    let id = bus.add_listener(&topic, listener);
    Unsubscribe { bus, topic, id }
}

pub fn subscribe_once(bus: Arc<dyn EventBus>, topic: impl Into<String>, listener: ListenerFn) -> Unsubscribe {
    let topic = topic.into();
    let id = bus.listen_once(&topic, listener);
    Unsubscribe { bus, topic, id }
}

/// Resolve with the next payload dispatched on `topic`. Cancellable via
/// the returned task's own cancellation signal.
pub fn as_promise(bus: Arc<dyn EventBus>, topic: impl Into<String>) -> Task<Payload> {
    let topic = topic.into();
    Task::new(move |ctx: TaskCtx| {
        let bus = bus.clone();
        let topic = topic.clone();
        async move {
            let (tx, rx) = tokio::sync::oneshot::channel::<Payload>();
            let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));
            let tx_for_listener = tx.clone();
            let id = bus.listen_once(
                &topic,
                Arc::new(move |payload| {
                    let tx = tx_for_listener.clone();
                    Box::pin(async move {
                        if let Some(tx) = tx.lock().take() {
                            let _ = tx.send(payload);
                        }
                        Ok(())
                    })
                }),
            );

            tokio::select! {
                result = rx => result.map_err(|_| TaskError::Cancelled),
                _ = ctx.cancel.cancelled() => {
                    bus.remove_listener(&topic, id);
                    Err(TaskError::Cancelled)
                }
            }
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-process bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type TopicMap = Arc<RwLock<HashMap<String, Vec<(ListenerId, ListenerFn)>>>>;

/// The default event bus: synchronous, in-memory, single-process.
pub struct InProcessEventBus {
    topics: TopicMap,
    next_id: AtomicU64,
    clock: SharedClock,
}

impl InProcessEventBus {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            clock,
        }
    }

    fn alloc_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn insert(&self, topic: &str, id: ListenerId, listener: ListenerFn) {
        self.topics
            .write()
            .entry(topic.to_owned())
            .or_default()
            .push((id, listener));
    }

    fn find_duplicate(&self, topic: &str, listener: &ListenerFn) -> Option<ListenerId> {
        self.topics
            .read()
            .get(topic)
            .and_then(|listeners| {
                listeners
                    .iter()
                    .find(|(_, existing)| Arc::ptr_eq(existing, listener))
                    .map(|(id, _)| *id)
            })
    }
}

impl Default for InProcessEventBus {
    fn default() -> Self {
        Self::new(ks_domain::clock::system_clock())
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    async fn dispatch(&self, topic: &str, payload: Payload) {
        let listeners: Vec<(ListenerId, ListenerFn)> = self
            .topics
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        let dispatched_at = self.clock.now();
        tracing::debug!(topic, listeners = listeners.len(), %dispatched_at, "dispatching event");

        let mut handles = Vec::with_capacity(listeners.len());
        for (id, listener) in listeners {
            let payload = payload.clone();
            handles.push(tokio::spawn(async move {
                if let Err(err) = listener(payload).await {
                    tracing::warn!(?id, error = %err, "event listener failed");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn add_listener(&self, topic: &str, listener: ListenerFn) -> ListenerId {
        if let Some(existing) = self.find_duplicate(topic, &listener) {
            return existing;
        }
        let id = self.alloc_id();
        self.insert(topic, id, listener);
        id
    }

    fn remove_listener(&self, topic: &str, id: ListenerId) {
        if let Some(listeners) = self.topics.write().get_mut(topic) {
            listeners.retain(|(existing, _)| *existing != id);
        }
    }

    fn listen_once(&self, topic: &str, listener: ListenerFn) -> ListenerId {
        let id = self.alloc_id();
        let topics = self.topics.clone();
        let topic_owned = topic.to_owned();
        let fired = Arc::new(AtomicBool::new(false));

        let wrapper: ListenerFn = Arc::new(move |payload| {
            let topics = topics.clone();
            let topic = topic_owned.clone();
            let fired = fired.clone();
            let listener = listener.clone();
            Box::pin(async move {
                if fired.swap(true, Ordering::SeqCst) {
                    return Ok(());
                }
                if let Some(listeners) = topics.write().get_mut(&topic) {
                    listeners.retain(|(existing, _)| *existing != id);
                }
                listener(payload).await
            })
        });

        self.insert(topic, id, wrapper);
        id
    }
}

/// Default environment fallback when no bus is configured: dispatch and
/// publishing become inert, but providers still compile and run.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEventBus;

#[async_trait]
impl EventBus for NoOpEventBus {
    async fn dispatch(&self, _topic: &str, _payload: Payload) {}

    fn add_listener(&self, _topic: &str, _listener: ListenerFn) -> ListenerId {
        ListenerId(0)
    }

    fn remove_listener(&self, _topic: &str, _id: ListenerId) {}

    fn listen_once(&self, _topic: &str, _listener: ListenerFn) -> ListenerId {
        ListenerId(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn bus() -> Arc<InProcessEventBus> {
        Arc::new(InProcessEventBus::default())
    }

    #[tokio::test]
    async fn dispatch_reaches_listener() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let h2 = hits.clone();
        bus.add_listener(
            "add",
            Arc::new(move |_payload| {
                let h2 = h2.clone();
                Box::pin(async move {
                    h2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        bus.dispatch("add", json!({"a": 1})).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listener_added_after_dispatch_misses_it() {
        let bus = bus();
        bus.dispatch("add", json!(1)).await;

        let hits = Arc::new(AtomicUsize::new(0));
        let h2 = hits.clone();
        bus.add_listener(
            "add",
            Arc::new(move |_| {
                let h2 = h2.clone();
                Box::pin(async move {
                    h2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn listen_once_fires_once() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let h2 = hits.clone();
        bus.listen_once(
            "add",
            Arc::new(move |_| {
                let h2 = h2.clone();
                Box::pin(async move {
                    h2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        bus.dispatch("add", json!(1)).await;
        bus.dispatch("add", json!(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn removing_listen_once_before_dispatch_cancels_it() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let h2 = hits.clone();
        let id = bus.listen_once(
            "add",
            Arc::new(move |_| {
                let h2 = h2.clone();
                Box::pin(async move {
                    h2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        bus.remove_listener("add", id);
        bus.dispatch("add", json!(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_listener_registration_is_idempotent() {
        let bus = bus();
        let listener: ListenerFn = Arc::new(|_| Box::pin(async { Ok(()) }));
        let id1 = bus.add_listener("t", listener.clone());
        let id2 = bus.add_listener("t", listener);
        assert_eq!(id1, id2);
        assert_eq!(bus.topics.read().get("t").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn listener_error_does_not_stop_others() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.add_listener("t", Arc::new(|_| Box::pin(async { Err(anyhow::anyhow!("boom")) })));
        let h2 = hits.clone();
        bus.add_listener(
            "t",
            Arc::new(move |_| {
                let h2 = h2.clone();
                Box::pin(async move {
                    h2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        bus.dispatch("t", json!(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn as_promise_resolves_with_next_payload() {
        let bus: Arc<dyn EventBus> = bus();
        let task = as_promise(bus.clone(), "add");

        let bus2 = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bus2.dispatch("add", json!({"a": 1, "b": 2})).await;
        });

        let payload = task.run().await.unwrap();
        assert_eq!(payload, json!({"a": 1, "b": 2}));

        // A second dispatch does not re-resolve the already-resolved task.
        bus.dispatch("add", json!({"a": 99})).await;
        assert_eq!(task.run().await.unwrap(), json!({"a": 1, "b": 2}));
    }

    #[tokio::test]
    async fn no_op_bus_is_inert() {
        let bus = NoOpEventBus;
        bus.dispatch("x", json!(1)).await;
        let id = bus.add_listener("x", Arc::new(|_| Box::pin(async { Ok(()) })));
        bus.remove_listener("x", id);
    }
}
