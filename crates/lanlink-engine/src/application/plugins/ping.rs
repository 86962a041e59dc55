//! Ping plugin: the smallest possible capability, useful for reachability
//! checks and as a wiring smoke test between two paired devices.

use std::sync::Arc;

use async_trait::async_trait;
use lanlink_core::Packet;
use tracing::info;

use crate::application::plugins::{Plugin, PluginContext, PluginError, PluginFactory};

/// Capability identifier of this plugin.
pub const CAPABILITY: &str = "ping";

/// Builds an outbound ping packet.
pub fn ping_packet() -> Packet {
    Packet::empty(CAPABILITY)
}

pub struct PingPluginFactory;

impl PluginFactory for PingPluginFactory {
    fn capability(&self) -> &'static str {
        CAPABILITY
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![CAPABILITY.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![CAPABILITY.to_string()]
    }

    fn instantiate(&self, ctx: PluginContext) -> Arc<dyn Plugin> {
        Arc::new(PingPlugin { ctx })
    }
}

pub struct PingPlugin {
    ctx: PluginContext,
}

#[async_trait]
impl Plugin for PingPlugin {
    fn capability(&self) -> &'static str {
        CAPABILITY
    }

    async fn handle_packet(&self, _packet: &Packet) -> Result<(), PluginError> {
        // Subscribers see the ping through the router's PacketReceived
        // event; nothing else to do.
        info!("ping from device {}", self.ctx.device_id);
        Ok(())
    }
}
