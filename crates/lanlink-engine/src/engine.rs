//! The engine facade: owns the registry, trust store, router, and link
//! provider, and exposes the narrow surface collaborators (such as a UI
//! shell) attach to: device list queries, packet sends, pairing
//! decisions, and the event subscription.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lanlink_core::{
    crypto::CryptoError, DeviceId, DeviceInfo, DeviceType, IdentityKeypair, Packet,
    PACKET_TYPE_PAIR, PROTOCOL_VERSION,
};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::application::events::{EngineEvent, EventBus};
use crate::application::plugins::{
    all_incoming_capabilities, all_outgoing_capabilities, builtin_factories,
};
use crate::application::registry::{DeviceFilter, DeviceRegistry, DeviceSnapshot};
use crate::application::router::{PluginRouter, RouteError};
use crate::application::trust::{TrustError, TrustState, TrustStore};
use crate::config::{self, ConfigError, EngineConfig};
use crate::infrastructure::discovery::{DiscoveryConfig, DiscoveryEvent};
use crate::infrastructure::provider::{LinkProvider, ProviderConfig, ProviderError};

/// Error type for engine construction and operation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The Link & Plugin Dispatch Engine.
pub struct Engine {
    registry: Arc<Mutex<DeviceRegistry>>,
    trust: Arc<Mutex<TrustStore>>,
    router: Arc<PluginRouter>,
    events: EventBus,
    provider: LinkProvider,
}

impl Engine {
    /// Builds an engine with persistent state in the platform config
    /// directory: identity key, device id, and trust table all survive
    /// restarts.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let identity = load_or_generate_identity(config::identity_key_path()?)?;
        let device_id = load_or_generate_device_id(config::config_dir()?.join("device.id"))?;
        let trust = TrustStore::load(config::trust_table_path()?)?;
        Ok(Self::with_state(config, identity, device_id, trust))
    }

    /// Builds an engine from explicit state. Used by tests and embedders
    /// that manage persistence themselves.
    pub fn with_state(
        config: EngineConfig,
        identity: IdentityKeypair,
        device_id: DeviceId,
        trust: TrustStore,
    ) -> Self {
        let identity = Arc::new(identity);
        let registry = Arc::new(Mutex::new(DeviceRegistry::new()));
        let trust = Arc::new(Mutex::new(trust));
        let events = EventBus::default();

        let factories = builtin_factories(&config.commands);
        let our_info = DeviceInfo {
            device_id,
            device_name: config.device.name.clone(),
            device_type: DeviceType::from(config.device.device_type.clone()),
            protocol_version: PROTOCOL_VERSION,
            tcp_port: config.network.control_port,
            incoming_capabilities: all_incoming_capabilities(&factories),
            outgoing_capabilities: all_outgoing_capabilities(&factories),
            identity_key: identity.public_base64(),
        };

        let router = Arc::new(PluginRouter::new(
            factories,
            Arc::clone(&registry),
            Arc::clone(&trust),
            events.clone(),
        ));

        let bind_address: IpAddr = config
            .network
            .bind_address
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let broadcast_address: IpAddr = config
            .network
            .broadcast_address
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::BROADCAST));

        let provider_config = ProviderConfig {
            bind_address,
            control_port: config.network.control_port,
            discovery: DiscoveryConfig {
                bind_address,
                broadcast_address,
                port: config.network.discovery_port,
                interval: Duration::from_secs(config.timing.broadcast_interval_secs),
            },
            handshake_timeout: Duration::from_secs(config.timing.handshake_timeout_secs),
            device_timeout: Duration::from_secs(config.timing.device_timeout_secs),
            eviction_interval: Duration::from_secs(config.timing.eviction_sweep_secs),
        };

        let provider = LinkProvider::new(
            our_info,
            identity,
            Arc::clone(&registry),
            Arc::clone(&trust),
            Arc::clone(&router),
            events.clone(),
            provider_config,
        );

        Self {
            registry,
            trust,
            router,
            events,
            provider,
        }
    }

    /// Starts discovery, the link listener, and the orchestration loop.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        self.provider.start().await?;
        Ok(())
    }

    /// Gracefully closes every link and stops all background tasks.
    pub async fn stop(&mut self) {
        self.provider.stop().await;
    }

    /// Our identity metadata as advertised to peers.
    pub fn our_info(&self) -> &DeviceInfo {
        self.provider.our_info()
    }

    /// The bound link listener address, once started.
    pub fn control_addr(&self) -> Option<std::net::SocketAddr> {
        self.provider.control_addr()
    }

    /// Read-only device list, most recently seen first.
    pub async fn list_devices(&self, filter: DeviceFilter) -> Vec<DeviceSnapshot> {
        self.registry.lock().await.list_devices(filter)
    }

    /// Current pairing state of a device.
    pub async fn trust_state(&self, device_id: &DeviceId) -> TrustState {
        self.trust.lock().await.state(device_id)
    }

    /// Opens a subscription to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Sends a capability packet to a connected device.
    pub async fn send_packet(
        &self,
        device_id: &DeviceId,
        packet: Packet,
    ) -> Result<(), RouteError> {
        self.router.route_outbound(device_id, packet).await
    }

    /// Connects to a device immediately instead of waiting for its next
    /// announcement.
    pub async fn dial(&self, event: DiscoveryEvent) {
        self.provider.dial(event).await;
    }

    /// Asks a connected device to pair with us.
    pub async fn request_pairing(&self, device_id: &DeviceId) -> Result<(), EngineError> {
        self.trust.lock().await.request_pairing(device_id)?;
        self.send_packet(device_id, pair_packet(true)).await?;
        Ok(())
    }

    /// Accepts a peer's pending pairing request.
    pub async fn accept_pairing(&self, device_id: &DeviceId) -> Result<(), EngineError> {
        self.trust.lock().await.accept_pairing(device_id)?;
        self.send_packet(device_id, pair_packet(true)).await?;
        Ok(())
    }

    /// Rejects a pending pairing request.
    pub async fn reject_pairing(&self, device_id: &DeviceId) -> Result<(), EngineError> {
        self.trust.lock().await.reject_pairing(device_id)?;
        // Best effort: the peer may already be gone.
        if let Err(e) = self.send_packet(device_id, pair_packet(false)).await {
            debug!("could not notify {device_id} of rejection: {e}");
        }
        Ok(())
    }

    /// Revokes pairing and deletes the trust record.
    pub async fn unpair(&self, device_id: &DeviceId) -> Result<(), EngineError> {
        self.trust.lock().await.unpair(device_id)?;
        if let Err(e) = self.send_packet(device_id, pair_packet(false)).await {
            debug!("could not notify {device_id} of unpair: {e}");
        }
        Ok(())
    }
}

/// Builds a pairing-negotiation packet.
fn pair_packet(pair: bool) -> Packet {
    let mut body = serde_json::Map::new();
    body.insert("pair".to_string(), json!(pair));
    Packet::new(PACKET_TYPE_PAIR, body)
}

/// Loads the identity keypair, generating and persisting one on first run.
fn load_or_generate_identity(path: PathBuf) -> Result<IdentityKeypair, EngineError> {
    match std::fs::read_to_string(&path) {
        Ok(encoded) => Ok(IdentityKeypair::from_secret_base64(encoded.trim())?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keys = IdentityKeypair::generate();
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(|source| EngineError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
            std::fs::write(&path, keys.secret_base64()).map_err(|source| EngineError::Io {
                path: path.clone(),
                source,
            })?;
            Ok(keys)
        }
        Err(source) => Err(EngineError::Io { path, source }),
    }
}

/// Loads the stable device id, generating and persisting one on first run.
fn load_or_generate_device_id(path: PathBuf) -> Result<DeviceId, EngineError> {
    match std::fs::read_to_string(&path) {
        Ok(id) => Ok(DeviceId::from(id.trim())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let id = DeviceId::generate();
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(|source| EngineError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
            std::fs::write(&path, id.as_str()).map_err(|source| EngineError::Io {
                path: path.clone(),
                source,
            })?;
            Ok(id)
        }
        Err(source) => Err(EngineError::Io { path, source }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
