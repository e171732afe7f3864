//! Connection status fan-out.
//!
//! Subscribers get the current state replayed on subscribe and every later
//! transition in subscription order. Delivery iterates a snapshot of the
//! subscriber list, so callbacks may subscribe or unsubscribe freely.

use parking_lot::{Mutex, ReentrantMutex};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

type Callback = Arc<dyn Fn(bool) + Send + Sync>;

struct Inner {
    subscribers: Mutex<Vec<(Uuid, Callback)>>,
    /// Serializes delivery; reentrant so callbacks can subscribe
    delivery: ReentrantMutex<()>,
    state: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ConnectionNotifier {
    inner: Arc<Inner>,
}

impl ConnectionNotifier {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                delivery: ReentrantMutex::new(()),
                state,
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow()
    }

    /// Register `callback`; it is invoked with the current state before
    /// this returns. The subscription stays active until
    /// [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let _delivery = self.inner.delivery.lock();
        let id = Uuid::new_v4();
        let callback: Callback = Arc::new(callback);
        self.inner.subscribers.lock().push((id, callback.clone()));
        callback(self.is_connected());

        Subscription {
            id,
            notifier: Arc::downgrade(&self.inner),
        }
    }

    /// Async view of the same state
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.inner.state.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Publish a transition; repeating the current state is a no-op
    pub fn notify(&self, connected: bool) {
        let _delivery = self.inner.delivery.lock();
        if self.is_connected() == connected {
            return;
        }
        self.inner.state.send_replace(connected);

        let snapshot: Vec<Callback> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        debug!(connected, subscribers = snapshot.len(), "connection status changed");
        for callback in snapshot {
            callback(connected);
        }
    }

    /// Drop every subscriber
    pub fn clear(&self) {
        self.inner.subscribers.lock().clear();
    }
}

impl Default for ConnectionNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`ConnectionNotifier::subscribe`]
#[derive(Debug, Clone)]
pub struct Subscription {
    id: Uuid,
    notifier: Weak<Inner>,
}

impl Subscription {
    /// Idempotent; safe to call from inside a callback.
    ///
    /// A delivery already in progress runs over the subscriber list as it
    /// was when the transition started, so a subscriber removed by another
    /// callback mid-delivery still receives that one transition.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.notifier.upgrade() {
            inner.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}
