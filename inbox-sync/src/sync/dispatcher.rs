//! Fan-out of decoded push events to any number of listeners
//!
//! Not a durable queue: events published while nobody listens are gone, and
//! events missed while disconnected are recovered by the session's catch-up
//! fetch, not by redelivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::debug;

use crate::sync::codec::InboundEvent;

pub type Listener = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

/// Synchronous, ordered broadcaster
///
/// Listeners run in registration order on the publishing task. The listener
/// list is never locked while a listener runs, so listeners may subscribe or
/// unsubscribe (themselves or others) from inside a callback.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is unsubscribed or dropped.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        debug!("Listener {} subscribed", id);

        Subscription {
            id,
            dispatcher: Arc::downgrade(self),
        }
    }

    /// Invoke every registered listener once, in registration order
    ///
    /// A listener removed before its turn in this round is skipped.
    pub fn publish(&self, event: &InboundEvent) -> usize {
        let round: Vec<(u64, Listener)> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut delivered = 0;
        for (id, listener) in round {
            if !self.is_registered(id) {
                continue;
            }
            listener(event);
            delivered += 1;
        }
        delivered
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn is_registered(&self, id: u64) -> bool {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(registered, _)| *registered == id)
    }

    fn remove(&self, id: u64) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        before != listeners.len()
    }
}

/// Handle returned by [`EventDispatcher::subscribe`]
///
/// Removal is by identity: only the listener this handle registered is removed.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    dispatcher: Weak<EventDispatcher>,
}

impl Subscription {
    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        match self.dispatcher.upgrade() {
            Some(dispatcher) => {
                let removed = dispatcher.remove(self.id);
                if removed {
                    debug!("Listener {} unsubscribed", self.id);
                }
                removed
            }
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn event() -> InboundEvent {
        InboundEvent::Unhandled {
            kind: "ping".to_string(),
        }
    }

    #[test]
    fn test_publish_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l1 = log.clone();
        let _a = dispatcher.subscribe(move |_| l1.lock().unwrap().push("a"));
        let l2 = log.clone();
        let _b = dispatcher.subscribe(move |_| l2.lock().unwrap().push("b"));

        assert_eq!(dispatcher.publish(&event()), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_unsubscribe_is_identity_based_and_idempotent() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(Mutex::new(0));

        let c = count.clone();
        let a = dispatcher.subscribe(move |_| *c.lock().unwrap() += 1);
        let c = count.clone();
        let _b = dispatcher.subscribe(move |_| *c.lock().unwrap() += 10);

        assert!(a.unsubscribe());
        assert!(!a.unsubscribe());
        dispatcher.publish(&event());
        assert_eq!(*count.lock().unwrap(), 10);
        assert_eq!(dispatcher.listener_count(), 1);
    }

    #[test]
    fn test_unsubscribe_later_listener_during_dispatch() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let l = log.clone();
        let v = victim.clone();
        let _first = dispatcher.subscribe(move |_| {
            l.lock().unwrap().push("first");
            if let Some(sub) = v.lock().unwrap().take() {
                sub.unsubscribe();
            }
        });
        let l = log.clone();
        *victim.lock().unwrap() = Some(dispatcher.subscribe(move |_| l.lock().unwrap().push("second")));

        assert_eq!(dispatcher.publish(&event()), 1);
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn test_unsubscribe_self_during_dispatch() {
        let dispatcher = EventDispatcher::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let hits = Arc::new(Mutex::new(0));

        let s = slot.clone();
        let h = hits.clone();
        let sub = dispatcher.subscribe(move |_| {
            *h.lock().unwrap() += 1;
            if let Some(me) = s.lock().unwrap().take() {
                me.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(sub);

        dispatcher.publish(&event());
        dispatcher.publish(&event());
        assert_eq!(*hits.lock().unwrap(), 1);
        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let dispatcher = EventDispatcher::new();
        {
            let _sub = dispatcher.subscribe(|_| {});
            assert_eq!(dispatcher.listener_count(), 1);
        }
        assert_eq!(dispatcher.listener_count(), 0);
    }
}
