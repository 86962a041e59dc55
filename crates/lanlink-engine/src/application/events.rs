//! Engine event seam.
//!
//! The presentation layer (and any other collaborator) observes the engine
//! exclusively through this subscription interface: device state changes
//! with typed reasons, routed packets, and security-relevant trust events.
//! No raw protocol errors cross this boundary.

use lanlink_core::{DeviceId, Packet};
use tokio::sync::broadcast;
use tracing::trace;

use crate::application::registry::{DisconnectReason, LinkState};

/// Events delivered to engine subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A device's link state changed. `reason` is set on disconnects.
    DeviceStateChanged {
        device_id: DeviceId,
        state: LinkState,
        reason: Option<DisconnectReason>,
    },
    /// A capability packet from a paired device was routed.
    PacketReceived { device_id: DeviceId, packet: Packet },
    /// A peer asked to pair and awaits a local decision.
    PairingRequested { device_id: DeviceId },
    /// A previously paired device presented the wrong identity key.
    /// Alert-worthy: the device was demoted and the link refused.
    TrustViolation { device_id: DeviceId },
}

/// Multi-subscriber event fan-out.
///
/// Cheap to clone; every clone publishes into the same channel. Slow
/// subscribers miss events rather than back-pressuring the engine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Opens a new subscription starting at the current event.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event to all current subscribers. Publishing with no
    /// subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        trace!("engine event: {event:?}");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_published_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::PairingRequested {
            device_id: DeviceId::from("a"),
        });

        match rx.recv().await.expect("event") {
            EngineEvent::PairingRequested { device_id } => {
                assert_eq!(device_id, DeviceId::from("a"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_each_subscriber_sees_each_event_once() {
        let bus = EventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(EngineEvent::TrustViolation {
            device_id: DeviceId::from("a"),
        });

        assert!(matches!(
            rx1.recv().await,
            Ok(EngineEvent::TrustViolation { .. })
        ));
        assert!(matches!(
            rx2.recv().await,
            Ok(EngineEvent::TrustViolation { .. })
        ));
        // No duplicate delivery.
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        bus.publish(EngineEvent::PairingRequested {
            device_id: DeviceId::from("a"),
        });
    }
}
