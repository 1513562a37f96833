//! Headless, topic-keyed publish/subscribe event bus.
//!
//! Topics are plain strings and need no registration: an unknown topic simply
//! has zero subscribers and publishing to it is a silent no-op.
//!
//! # Delivery contract
//!
//! | Property | Guarantee |
//! |---|---|
//! | Snapshot | [`EventBus::publish`] dispatches to the handler list as it was when the call started; handlers added or removed mid-dispatch do not affect it. |
//! | Ordering | Handlers of one topic run in subscription order. Nothing is promised across topics. |
//! | Isolation | A handler that returns `Err` or panics is logged and skipped; the remaining handlers still run and `publish` never fails. |
//! | Retention | The bus keeps nothing after `publish` returns. Handlers that need the event must clone it. |

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use aegis_types::{Event, GatewayError};
use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// A subscriber callback.
///
/// Implement this directly for handlers that need to suspend (I/O, locks
/// held across awaits). Synchronous closures can be wrapped with
/// [`FnHandler`] or registered through [`EventBus::subscribe_fn`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), GatewayError>;
}

/// Adapter turning a synchronous closure into an [`EventHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> Result<(), GatewayError> + Send + Sync,
{
    async fn handle(&self, event: &Event) -> Result<(), GatewayError> {
        (self.0)(event)
    }
}

/// Opaque token identifying one subscription; pass it back to
/// [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct Inner {
    topics: RwLock<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
}

/// Shared event bus. Clone it cheaply – all clones share the same
/// subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self
            .inner
            .topics
            .read()
            .map(|t| t.len())
            .unwrap_or_default();
        f.debug_struct("EventBus").field("topics", &topics).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Subscription management
    // -----------------------------------------------------------------------

    /// Register `handler` for `topic`. Handlers of the same topic are invoked
    /// in the order they were registered.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let topic = topic.into();
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut topics = self
            .inner
            .topics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        debug!(topic = %topic, subscription = id.0, "subscribed");
        topics
            .entry(topic)
            .or_default()
            .push(Subscription { id, handler });
        id
    }

    /// Convenience: register a synchronous closure.
    pub fn subscribe_fn<F>(&self, topic: impl Into<String>, f: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), GatewayError> + Send + Sync + 'static,
    {
        self.subscribe(topic, Arc::new(FnHandler(f)))
    }

    /// Remove the subscription `id` from `topic`.
    ///
    /// Returns `false` when no such subscription exists. Empty topics are
    /// pruned so the table never accumulates dead keys.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let mut topics = self
            .inner
            .topics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(subs) = topics.get_mut(topic) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Number of handlers currently registered for `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .map(|t| t.get(topic).map_or(0, Vec::len))
            .unwrap_or_default()
    }

    /// Subscribe a bounded queue to `topic` and return its receiving end.
    ///
    /// When the queue is full the event is dropped for this receiver only
    /// (logged at `warn`); publishing never waits on a slow tap. Dropping the
    /// [`TopicReceiver`] does not unsubscribe by itself – call
    /// [`TopicReceiver::close`] with the bus to release the slot.
    pub fn tap(&self, topic: impl Into<String>, capacity: usize) -> TopicReceiver {
        let topic = topic.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let tap_topic = topic.clone();
        let id = self.subscribe_fn(topic.clone(), move |event| {
            match tx.try_send(event.clone()) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(topic = %tap_topic, "topic tap full; event dropped");
                    Ok(())
                }
                // Receiver gone: nothing left to deliver to.
                Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
            }
        });
        TopicReceiver {
            topic,
            id,
            receiver: rx,
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Deliver `event` to every handler registered for `topic`.
    ///
    /// Returns the number of handlers that completed successfully. Failures
    /// are logged and isolated; see the module docs for the full contract.
    pub async fn publish(&self, topic: &str, event: Event) -> usize {
        let snapshot: Vec<Subscription> = {
            let topics = self
                .inner
                .topics
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match topics.get(topic) {
                Some(subs) => subs.clone(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for sub in snapshot {
            let outcome = AssertUnwindSafe(sub.handler.handle(&event))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    error!(topic = %topic, subscription = sub.id.0, error = %e, "event handler failed");
                }
                Err(_) => {
                    error!(topic = %topic, subscription = sub.id.0, "event handler panicked");
                }
            }
        }
        delivered
    }
}

// ---------------------------------------------------------------------------
// Pull-style receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single topic.
///
/// Obtained via [`EventBus::tap`].
pub struct TopicReceiver {
    topic: String,
    id: SubscriptionId,
    receiver: mpsc::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic. Returns `None` once the tap
    /// has been closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    /// The topic this receiver is bound to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Unsubscribe from `bus`; already-queued events stay readable.
    pub fn close(&mut self, bus: &EventBus) {
        bus.unsubscribe(&self.topic, self.id);
        self.receiver.close();
    }
}
