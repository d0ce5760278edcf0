//! Synchronous publish/subscribe channel.
//!
//! One bus exists per subsystem (cache events, fetch-queue events,
//! submit-queue events). Delivery is synchronous and ordered: `emit` calls
//! every subscriber registered at the time of the call, in registration
//! order, before returning. There is no buffering or replay.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::counter;
use tracing::warn;

use crate::lock::mutex_lock;

const SOURCE: &str = "events";
pub(crate) const METRIC_SUBSCRIBER_PANIC: &str = "courier_subscriber_panic_total";

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Outcome of a single [`EventBus::emit`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    /// Subscribers that returned normally.
    pub delivered: usize,
    /// Subscribers that panicked. Delivery continued past them.
    pub failed: usize,
}

/// Ordered subscription registry with isolated, synchronous delivery.
pub struct EventBus<E> {
    name: &'static str,
    listeners: Mutex<Vec<(SubscriptionId, Listener<E>)>>,
    next_id: AtomicU64,
    failures: AtomicU64,
}

impl<E> EventBus<E> {
    /// Create an empty bus. `name` labels logs and metrics.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Register a subscriber. It observes only events emitted after this call.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        mutex_lock(&self.listeners, SOURCE, "subscribe").push((id, Arc::new(listener)));
        id
    }

    /// Remove one subscriber. Returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = mutex_lock(&self.listeners, SOURCE, "unsubscribe");
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Drop every subscriber.
    pub fn remove_all_listeners(&self) {
        mutex_lock(&self.listeners, SOURCE, "remove_all_listeners").clear();
    }

    pub fn listener_count(&self) -> usize {
        mutex_lock(&self.listeners, SOURCE, "listener_count").len()
    }

    /// Total number of subscriber panics observed by this bus.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Deliver `event` to every current subscriber, in registration order.
    ///
    /// The registry is snapshotted before delivery, so subscribers may
    /// subscribe or unsubscribe from inside a callback without deadlocking;
    /// such changes take effect from the next emit.
    pub fn emit(&self, event: &E) -> EmitReport {
        let snapshot: Vec<(SubscriptionId, Listener<E>)> =
            mutex_lock(&self.listeners, SOURCE, "emit").clone();

        let mut report = EmitReport::default();
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    report.failed += 1;
                    self.failures.fetch_add(1, Ordering::SeqCst);
                    counter!(METRIC_SUBSCRIBER_PANIC, "bus" => self.name).increment(1);
                    warn!(
                        bus = self.name,
                        subscription = id.0,
                        "Event subscriber panicked; continuing delivery"
                    );
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn delivers_in_registration_order() {
        let bus = EventBus::<u32>::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |value: &u32| {
                seen.lock().expect("seen lock").push(format!("{tag}{value}"));
            });
        }

        let report = bus.emit(&1);
        assert_eq!(report.delivered, 3);
        assert_eq!(*seen.lock().expect("seen lock"), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let bus = EventBus::<u32>::new("test");
        let hits = Arc::new(AtomicU64::new(0));

        bus.subscribe(|_: &u32| panic!("subscriber failure"));
        let counter = Arc::clone(&hits);
        bus.subscribe(move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let report = bus.emit(&7);
        assert_eq!(report, EmitReport { delivered: 1, failed: 1 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.failures(), 1);
    }

    #[test]
    fn unsubscribe_and_remove_all() {
        let bus = EventBus::<u32>::new("test");
        let first = bus.subscribe(|_: &u32| {});
        bus.subscribe(|_: &u32| {});

        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));
        assert_eq!(bus.listener_count(), 1);

        bus.remove_all_listeners();
        assert_eq!(bus.listener_count(), 0);
        assert_eq!(bus.emit(&1), EmitReport::default());
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::<u32>::new("test");
        bus.emit(&1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |value: &u32| sink.lock().expect("seen lock").push(*value));
        bus.emit(&2);

        assert_eq!(*seen.lock().expect("seen lock"), vec![2]);
    }

    #[test]
    fn subscribing_during_delivery_does_not_deadlock() {
        let bus = Arc::new(EventBus::<u32>::new("test"));
        let inner = Arc::clone(&bus);
        bus.subscribe(move |_: &u32| {
            inner.subscribe(|_: &u32| {});
        });

        assert_eq!(bus.emit(&1).delivered, 1);
        assert_eq!(bus.listener_count(), 2);
    }
}
