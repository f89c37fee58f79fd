use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use types::MeasurementEvent;

type Consumer = Arc<dyn Fn(&MeasurementEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    consumer: Consumer,
}

/// Synchronous fan-out of `MeasurementEvent`s to subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
}

/// Returned by `subscribe`; dropping or calling `unsubscribe` removes the
/// subscriber.
pub struct SubscriptionHandle {
    id: u64,
    bus: EventBus,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {
        self.bus.remove(self.id);
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `consumer` to the subscriber list, returning a handle that
    /// removes it when unsubscribed.
    pub fn subscribe<F>(&self, consumer: F) -> SubscriptionHandle
    where
        F: Fn(&MeasurementEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Subscriber { id, consumer: Arc::new(consumer) });
        SubscriptionHandle { id, bus: self.clone() }
    }

    fn remove(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|subscriber| subscriber.id != id);
    }

    /// Invokes each subscriber in subscription order. A subscriber that
    /// panics is isolated via `catch_unwind` and logged; the remaining
    /// subscribers still run.
    pub fn publish(&self, event: &MeasurementEvent) {
        let subscribers: Vec<Consumer> = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|s| s.consumer.clone())
            .collect();

        for consumer in subscribers {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| consumer(event)));
            if result.is_err() {
                warn!(device_id = %event.device_id, "event bus subscriber panicked; continuing to remaining subscribers");
            }
        }
    }
}

/// Logs every published event at `debug`, for local troubleshooting.
pub fn debug_logging_subscriber(event: &MeasurementEvent) {
    debug!(device_id = %event.device_id, samples = event.samples.len(), "measurement event published");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::SystemTime;

    fn sample_event() -> MeasurementEvent {
        MeasurementEvent::new("dev-1", SystemTime::now(), Vec::new())
    }

    #[test]
    fn publishes_to_all_subscribers_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = order.clone();
        let _h1 = bus.subscribe(move |_| order_a.lock().unwrap().push(1));
        let order_b = order.clone();
        let _h2 = bus.subscribe(move |_| order_b.lock().unwrap().push(2));

        bus.publish(&sample_event());
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _h1 = bus.subscribe(|_| panic!("boom"));
        let hits_clone = hits.clone();
        let _h2 = bus.subscribe(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&sample_event());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_future_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let handle = bus.subscribe(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&sample_event());
        handle.unsubscribe();
        bus.publish(&sample_event());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
