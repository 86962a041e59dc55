//! Plugin dispatch router.
//!
//! Maps capability identifiers to plugin instances per device and routes
//! packets both ways. Inbound packets pass three gates before reaching a
//! plugin: pairing packets are diverted to the trust machinery, packets
//! from untrusted devices are silently dropped, and packets of a
//! capability the sender never advertised are dropped with an
//! `UnsupportedCapability` log line (protocol tolerance, not an error).
//!
//! Bindings are created lazily on the first matching packet and live until
//! the device disconnects. Outbound routing is a synchronous hand-off to
//! the device's link send queue; the router never buffers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lanlink_core::{DeviceId, Packet};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::application::events::{EngineEvent, EventBus};
use crate::application::plugins::{PacketSink, Plugin, PluginContext, PluginFactory};
use crate::application::registry::{DeviceRegistry, LinkState};
use crate::application::trust::TrustStore;

/// Error type for outbound routing.
#[derive(Debug, Error, PartialEq)]
pub enum RouteError {
    /// The target device is not known to the registry.
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    /// The target device has no live link.
    #[error("device {0} is not connected")]
    NotConnected(DeviceId),

    /// The link closed between the state check and the hand-off, or the
    /// caller sent after close.
    #[error("link to device {0} is closed")]
    LinkClosed(DeviceId),

    /// No compiled-in factory serves this capability.
    #[error("unknown capability: {0}")]
    UnknownCapability(String),
}

/// Hands a packet to a connected device's link send queue.
///
/// The registry lock is released before awaiting the queue so a full
/// queue never blocks unrelated registry access.
pub(crate) async fn send_to_device(
    registry: &Mutex<DeviceRegistry>,
    device_id: &DeviceId,
    packet: Packet,
) -> Result<(), RouteError> {
    let link = {
        let registry = registry.lock().await;
        match registry.state(device_id) {
            None => return Err(RouteError::UnknownDevice(device_id.clone())),
            Some(LinkState::Connected) => registry
                .link(device_id)
                .ok_or_else(|| RouteError::LinkClosed(device_id.clone()))?,
            Some(_) => return Err(RouteError::NotConnected(device_id.clone())),
        }
    };

    link.send(packet)
        .await
        .map_err(|_| RouteError::LinkClosed(device_id.clone()))
}

/// [`PacketSink`] implementation plugins reply through.
struct RouterSink {
    registry: Arc<Mutex<DeviceRegistry>>,
}

#[async_trait]
impl PacketSink for RouterSink {
    async fn send(&self, device_id: &DeviceId, packet: Packet) -> Result<(), RouteError> {
        send_to_device(&self.registry, device_id, packet).await
    }
}

/// The per-device capability dispatch table.
pub struct PluginRouter {
    factories: HashMap<&'static str, Arc<dyn PluginFactory>>,
    bindings: Mutex<HashMap<(DeviceId, String), Arc<dyn Plugin>>>,
    registry: Arc<Mutex<DeviceRegistry>>,
    trust: Arc<Mutex<TrustStore>>,
    events: EventBus,
    sink: Arc<dyn PacketSink>,
}

impl PluginRouter {
    pub fn new(
        factories: Vec<Arc<dyn PluginFactory>>,
        registry: Arc<Mutex<DeviceRegistry>>,
        trust: Arc<Mutex<TrustStore>>,
        events: EventBus,
    ) -> Self {
        let sink: Arc<dyn PacketSink> = Arc::new(RouterSink {
            registry: Arc::clone(&registry),
        });
        Self {
            factories: factories.into_iter().map(|f| (f.capability(), f)).collect(),
            bindings: Mutex::new(HashMap::new()),
            registry,
            trust,
            events,
            sink,
        }
    }

    /// Explicitly creates (or returns) the binding for a capability, as
    /// used by capability negotiation.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::UnknownCapability`] when no compiled-in
    /// factory serves the capability.
    pub async fn register_capability(
        &self,
        device_id: &DeviceId,
        capability: &str,
    ) -> Result<Arc<dyn Plugin>, RouteError> {
        let factory = self
            .factories
            .get(capability)
            .ok_or_else(|| RouteError::UnknownCapability(capability.to_string()))?;

        let mut bindings = self.bindings.lock().await;
        let key = (device_id.clone(), capability.to_string());
        let plugin = bindings.entry(key).or_insert_with(|| {
            debug!("binding capability {capability:?} for device {device_id}");
            factory.instantiate(PluginContext {
                device_id: device_id.clone(),
                sink: Arc::clone(&self.sink),
            })
        });
        Ok(Arc::clone(plugin))
    }

    /// Routes one inbound capability packet from `device_id`.
    ///
    /// Dropped packets are logged, never surfaced to the sender: protocol
    /// tolerance for version skew is deliberate.
    pub async fn route_inbound(&self, device_id: &DeviceId, packet: Packet) {
        // Pairing negotiation and identity are link/trust concerns; they
        // must never reach a plugin.
        if packet.is_pair() || packet.is_identity() {
            debug!("router ignoring control packet {:?}", packet.packet_type);
            return;
        }

        if !self.trust.lock().await.is_trusted(device_id) {
            debug!(
                "dropping {:?} packet from untrusted device {device_id}",
                packet.packet_type
            );
            return;
        }

        let advertised = {
            let registry = self.registry.lock().await;
            registry
                .info(device_id)
                .map(|info| info.sends(&packet.packet_type))
        };
        match advertised {
            None => {
                debug!("dropping packet from unknown device {device_id}");
                return;
            }
            Some(false) => {
                warn!(
                    "UnsupportedCapability: device {device_id} sent {:?} without advertising it; packet dropped",
                    packet.packet_type
                );
                return;
            }
            Some(true) => {}
        }

        match self.register_capability(device_id, &packet.packet_type).await {
            Ok(plugin) => {
                if let Err(e) = plugin.handle_packet(&packet).await {
                    warn!(
                        "plugin {:?} failed to handle packet from {device_id}: {e}",
                        packet.packet_type
                    );
                }
            }
            Err(RouteError::UnknownCapability(capability)) => {
                // Decoded fine, advertised, but this build has no plugin
                // for it. Drop and move on.
                debug!("no plugin for capability {capability:?}; packet dropped");
                return;
            }
            Err(e) => {
                warn!("failed to bind plugin for {device_id}: {e}");
                return;
            }
        }

        self.events.publish(EngineEvent::PacketReceived {
            device_id: device_id.clone(),
            packet,
        });
    }

    /// Routes one outbound packet to a connected device.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NotConnected`] when the device has no live
    /// link and [`RouteError::LinkClosed`] when the hand-off races a
    /// close. Queueing for offline devices is a plugin policy, not the
    /// router's.
    pub async fn route_outbound(
        &self,
        device_id: &DeviceId,
        packet: Packet,
    ) -> Result<(), RouteError> {
        send_to_device(&self.registry, device_id, packet).await
    }

    /// Drops every binding of a device. Called when its link is destroyed;
    /// a reconnect starts with fresh plugin instances.
    pub async fn drop_device(&self, device_id: &DeviceId) {
        let mut bindings = self.bindings.lock().await;
        bindings.retain(|(bound_device, _), _| bound_device != device_id);
    }

    /// Number of live bindings for a device.
    pub async fn binding_count(&self, device_id: &DeviceId) -> usize {
        self.bindings
            .lock()
            .await
            .keys()
            .filter(|(bound_device, _)| bound_device == device_id)
            .count()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
