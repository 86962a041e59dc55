//! The plugin dispatch contract and the compiled-in plugin set.
//!
//! A *capability* is a string naming a packet family (`"runcommand"`,
//! `"ping"`). Each capability has exactly one [`PluginFactory`] in the
//! fixed registry returned by [`builtin_factories`]; the router
//! instantiates one [`Plugin`] per (device, capability) pair and keeps it
//! for the life of the connection. Plugins are never shared across
//! devices, so per-device plugin state cannot leak between peers.

use std::sync::Arc;

use async_trait::async_trait;
use lanlink_core::{DeviceId, Packet};
use thiserror::Error;

use crate::application::router::RouteError;
use crate::config::CommandEntry;

pub mod ping;
pub mod run_command;

/// Error type for plugin packet handling.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin's reply could not be handed to the link.
    #[error("send failed: {0}")]
    Send(#[from] RouteError),

    /// The command runner failed to start a process.
    #[error("command runner: {0}")]
    Runner(String),
}

/// Outbound hand-off seam given to plugins.
///
/// The router implements this on top of the device's link send queue;
/// tests implement it with a recorder.
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Sends a packet to a connected device.
    async fn send(&self, device_id: &DeviceId, packet: Packet) -> Result<(), RouteError>;
}

/// Per-binding context handed to a plugin at instantiation.
#[derive(Clone)]
pub struct PluginContext {
    /// The device this plugin instance is bound to.
    pub device_id: DeviceId,
    /// Outbound path back to that device.
    pub sink: Arc<dyn PacketSink>,
}

/// A live capability handler bound to one device.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// The capability identifier this plugin consumes.
    fn capability(&self) -> &'static str;

    /// Handles one inbound packet of this plugin's capability.
    ///
    /// Errors are logged by the router; they never propagate to the link.
    async fn handle_packet(&self, packet: &Packet) -> Result<(), PluginError>;
}

/// Compiled-in constructor for one capability's plugins.
pub trait PluginFactory: Send + Sync {
    /// The capability identifier this factory serves.
    fn capability(&self) -> &'static str;

    /// Capability identifiers this plugin can receive.
    fn incoming_capabilities(&self) -> Vec<String>;

    /// Capability identifiers this plugin can send.
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// Creates the plugin instance for one device.
    fn instantiate(&self, ctx: PluginContext) -> Arc<dyn Plugin>;
}

/// The fixed, compiled-in plugin registry.
pub fn builtin_factories(commands: &[CommandEntry]) -> Vec<Arc<dyn PluginFactory>> {
    vec![
        Arc::new(run_command::RunCommandPluginFactory::new(
            commands.to_vec(),
        )),
        Arc::new(ping::PingPluginFactory),
    ]
}

/// Union of every factory's incoming capabilities, advertised in our
/// identity record.
pub fn all_incoming_capabilities(factories: &[Arc<dyn PluginFactory>]) -> Vec<String> {
    let mut capabilities = Vec::new();
    for factory in factories {
        for capability in factory.incoming_capabilities() {
            if !capabilities.contains(&capability) {
                capabilities.push(capability);
            }
        }
    }
    capabilities
}

/// Union of every factory's outgoing capabilities.
pub fn all_outgoing_capabilities(factories: &[Arc<dyn PluginFactory>]) -> Vec<String> {
    let mut capabilities = Vec::new();
    for factory in factories {
        for capability in factory.outgoing_capabilities() {
            if !capabilities.contains(&capability) {
                capabilities.push(capability);
            }
        }
    }
    capabilities
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_contains_runcommand_and_ping() {
        let factories = builtin_factories(&[]);
        let capabilities: Vec<&str> = factories.iter().map(|f| f.capability()).collect();
        assert!(capabilities.contains(&"runcommand"));
        assert!(capabilities.contains(&"ping"));
    }

    #[test]
    fn test_capability_unions_deduplicate() {
        let factories = builtin_factories(&[]);
        let incoming = all_incoming_capabilities(&factories);
        let outgoing = all_outgoing_capabilities(&factories);

        let mut deduped = incoming.clone();
        deduped.dedup();
        assert_eq!(incoming, deduped);
        assert!(incoming.contains(&"runcommand".to_string()));
        assert!(outgoing.contains(&"ping".to_string()));
    }
}
