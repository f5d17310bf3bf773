//! # meshsync Events
//!
//! Process-wide publish/subscribe of typed events: resource changes and
//! zone stream lifecycle.
//!
//! ## Overview
//!
//! The bus is best effort. [`EventBus::send`] fans an event out to every
//! subscriber whose predicates match, using a non-blocking enqueue. A full
//! subscriber queue drops the event; the publisher is never slowed down.
//! Delivery order is FIFO per subscriber, with no ordering across
//! subscribers.
//!
//! The bus is a cloneable handle passed to whoever needs it, so each test
//! can run against its own isolated bus.
//!
//! ## Key Types
//!
//! - [`Event`] - Closed set of events
//! - [`EventBus`] - The bus
//! - [`Listener`] - A subscription; closed explicitly or on drop

pub mod bus;
pub mod event;

pub use bus::{EventBus, Listener, Predicate};
pub use event::{
    Event, Operation, ResourceChangedEvent, StreamCancelled, StreamType, ZoneOpenedStream,
    ZoneWentOffline,
};

#[cfg(test)]
mod proptests {
    use super::*;
    use meshsync_core::{ResourceKey, ResourceType, TenantId};
    use proptest::prelude::*;

    fn event_strategy() -> impl Strategy<Value = Event> {
        let tenant = prop_oneof![Just(""), Just("acme"), Just("other")];
        let zone = prop_oneof![Just("zone-1"), Just("zone-2")];
        (0u8..3, tenant, zone).prop_map(|(kind, tenant, zone)| {
            let tenant_id = TenantId::new(tenant);
            match kind {
                0 => Event::ResourceChanged(ResourceChangedEvent {
                    operation: Operation::Create,
                    resource_type: ResourceType::new("Mesh"),
                    key: ResourceKey::global(zone),
                    tenant_id,
                }),
                1 => Event::ZoneWentOffline(ZoneWentOffline {
                    zone: zone.into(),
                    tenant_id,
                }),
                _ => Event::ZoneOpenedStream(ZoneOpenedStream {
                    zone: zone.into(),
                    tenant_id,
                    stream_type: StreamType::GlobalToZone,
                    conn_time: std::time::UNIX_EPOCH,
                }),
            }
        })
    }

    proptest! {
        #[test]
        fn prop_subscriber_only_sees_matching_events(
            events in proptest::collection::vec(event_strategy(), 0..50)
        ) {
            let bus = EventBus::new(64);
            let mut acme = bus.subscribe_where(|e| e.tenant_id().as_str() == "acme");
            let mut all = bus.subscribe(vec![]);

            for event in &events {
                bus.send(event.clone());
            }

            let mut seen = Vec::new();
            while let Some(event) = acme.try_recv() {
                prop_assert_eq!(event.tenant_id().as_str(), "acme");
                seen.push(event);
            }
            let expected: Vec<Event> = events
                .iter()
                .filter(|e| e.tenant_id().as_str() == "acme")
                .cloned()
                .collect();
            prop_assert_eq!(seen, expected);

            let mut count = 0;
            while all.try_recv().is_some() {
                count += 1;
            }
            prop_assert_eq!(count, events.len());
        }
    }
}
