//! Publish/subscribe bus with bounded, drop-on-full delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::event::Event;

/// A subscriber filter. All predicates of a subscription must match.
pub type Predicate = Box<dyn Fn(&Event) -> bool + Send + Sync>;

struct Subscriber {
    predicates: Vec<Predicate>,
    tx: mpsc::Sender<Event>,
}

impl Subscriber {
    fn matches(&self, event: &Event) -> bool {
        self.predicates.iter().all(|p| p(event))
    }
}

struct Registry {
    buffer_size: usize,
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<u64, Subscriber>>,
}

impl Registry {
    fn remove(&self, id: u64) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

/// Best-effort in-process event bus.
///
/// Cloning yields another handle to the same bus. [`EventBus::send`] never
/// blocks: a subscriber whose queue is full misses the event.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<Registry>,
}

impl EventBus {
    /// Create a bus whose subscriber queues hold `buffer_size` events.
    ///
    /// A size of zero is raised to one.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                buffer_size: buffer_size.max(1),
                next_id: AtomicU64::new(0),
                subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Deliver an event to every matching subscriber.
    pub fn send(&self, event: impl Into<Event>) {
        let event = event.into();
        let subscribers = self
            .registry
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        for (id, subscriber) in subscribers.iter() {
            if !subscriber.matches(&event) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::trace!(subscriber = id, kind = event.kind(), "subscriber queue full, event dropped");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Subscribe to events matching every predicate. No predicates means
    /// every event.
    pub fn subscribe(&self, predicates: Vec<Predicate>) -> Listener {
        let (tx, rx) = mpsc::channel(self.registry.buffer_size);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);

        self.registry
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Subscriber { predicates, tx });

        tracing::trace!(subscriber = id, "subscribed");

        Listener {
            id,
            rx: Some(rx),
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Subscribe with a single predicate.
    pub fn subscribe_where(
        &self,
        predicate: impl Fn(&Event) -> bool + Send + Sync + 'static,
    ) -> Listener {
        self.subscribe(vec![Box::new(predicate)])
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.registry
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

/// The receiving end of a subscription.
///
/// Dropping the listener closes it.
pub struct Listener {
    id: u64,
    rx: Option<mpsc::Receiver<Event>>,
    registry: Weak<Registry>,
}

impl Listener {
    /// A listener that never yields. Used where a subscription is optional.
    pub fn never() -> Self {
        Self {
            id: u64::MAX,
            rx: None,
            registry: Weak::new(),
        }
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once closed and drained. A [`Listener::never`]
    /// listener stays pending forever.
    pub async fn recv(&mut self) -> Option<Event> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.as_mut().and_then(|rx| rx.try_recv().ok())
    }

    /// Release the subscription. Idempotent.
    pub fn close(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        self.registry = Weak::new();
        if let Some(rx) = self.rx.as_mut() {
            rx.close();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("never", &self.rx.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Operation, ResourceChangedEvent, ZoneWentOffline};
    use meshsync_core::{ResourceKey, ResourceType, TenantId};
    use std::time::Duration;

    fn changed(name: &str) -> Event {
        Event::ResourceChanged(ResourceChangedEvent {
            operation: Operation::Update,
            resource_type: ResourceType::new("Mesh"),
            key: ResourceKey::global(name),
            tenant_id: TenantId::default_tenant(),
        })
    }

    fn offline(zone: &str) -> Event {
        Event::ZoneWentOffline(ZoneWentOffline {
            zone: zone.into(),
            tenant_id: TenantId::default_tenant(),
        })
    }

    #[tokio::test]
    async fn test_size_one_keeps_first_and_drops_second() {
        let bus = EventBus::new(1);
        let mut listener = bus.subscribe(vec![]);

        bus.send(changed("e1"));
        bus.send(changed("e2"));

        assert_eq!(listener.recv().await, Some(changed("e1")));
        assert_eq!(listener.try_recv(), None);
    }

    #[tokio::test]
    async fn test_fifo_per_subscriber() {
        let bus = EventBus::new(10);
        let mut listener = bus.subscribe(vec![]);

        for i in 0..5 {
            bus.send(changed(&format!("m{i}")));
        }
        for i in 0..5 {
            assert_eq!(listener.recv().await, Some(changed(&format!("m{i}"))));
        }
    }

    #[tokio::test]
    async fn test_send_never_blocks_on_full_queue() {
        let bus = EventBus::new(1);
        let _listener = bus.subscribe(vec![]);

        let sends = async {
            for i in 0..10_000 {
                bus.send(changed(&format!("m{i}")));
            }
        };
        tokio::time::timeout(Duration::from_secs(5), sends)
            .await
            .expect("send blocked");
    }

    #[tokio::test]
    async fn test_predicates_all_must_match() {
        let bus = EventBus::new(10);
        let mut listener = bus.subscribe(vec![
            Box::new(|e| matches!(e, Event::ZoneWentOffline(_))),
            Box::new(|e| matches!(e, Event::ZoneWentOffline(z) if z.zone == "zone-1")),
        ]);

        bus.send(changed("m"));
        bus.send(offline("zone-2"));
        bus.send(offline("zone-1"));

        assert_eq!(listener.recv().await, Some(offline("zone-1")));
        assert_eq!(listener.try_recv(), None);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_unregisters() {
        let bus = EventBus::new(1);
        let mut listener = bus.subscribe(vec![]);
        bus.send(changed("m"));
        assert_eq!(bus.subscriber_count(), 1);

        listener.close();
        listener.close();
        assert_eq!(bus.subscriber_count(), 0);

        bus.send(changed("after-close"));
        assert_eq!(listener.recv().await, Some(changed("m")));
        assert_eq!(listener.recv().await, None);
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let bus = EventBus::new(1);
        {
            let _listener = bus.subscribe(vec![]);
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_close_after_bus_dropped() {
        let bus = EventBus::new(1);
        let mut listener = bus.subscribe(vec![]);
        drop(bus);
        listener.close();
        assert_eq!(listener.try_recv(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_listener_stays_pending() {
        let mut listener = Listener::never();
        let res = tokio::time::timeout(Duration::from_secs(60), listener.recv()).await;
        assert!(res.is_err());
        assert_eq!(listener.try_recv(), None);
        listener.close();
    }

    #[tokio::test]
    async fn test_zero_buffer_is_raised() {
        let bus = EventBus::new(0);
        let mut listener = bus.subscribe(vec![]);
        bus.send(changed("m"));
        assert_eq!(listener.try_recv(), Some(changed("m")));
    }
}
