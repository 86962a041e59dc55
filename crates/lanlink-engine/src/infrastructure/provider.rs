//! The link provider: discovery-driven dialing, inbound acceptance,
//! handshake sequencing, trust consultation, and link supersession.
//!
//! All state transitions flow through one orchestration loop, so a single
//! device's lifecycle is strictly serialized while the I/O of different
//! devices runs in parallel on their own link tasks. Handshakes run on
//! detached tasks and report back as messages; the loop itself never
//! blocks on the network.
//!
//! Failure policy: a failed handshake marks the device `Disconnected`
//! with a typed reason and is *not* retried. The next discovery
//! announcement starts a fresh cycle, which bounds reconnect storms to
//! the announcement interval.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use lanlink_core::{DeviceId, DeviceInfo, IdentityKeypair, LinkRole, Packet};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::application::events::{EngineEvent, EventBus};
use crate::application::registry::{DeviceRegistry, DisconnectReason, LinkState};
use crate::application::router::PluginRouter;
use crate::application::trust::{PairUpdate, TrustStore};
use crate::infrastructure::discovery::{
    start_discovery, DiscoveryConfig, DiscoveryError, DiscoveryEvent,
};
use crate::infrastructure::link::{
    disconnect_reason, establish, EstablishedLink, LinkEvent, LinkHandle,
};

/// Error type for provider startup.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The TCP listener could not be bound.
    #[error("failed to bind link listener on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Discovery could not start.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Provider configuration, derived from the engine config.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub bind_address: IpAddr,
    pub control_port: u16,
    pub discovery: DiscoveryConfig,
    pub handshake_timeout: Duration,
    pub device_timeout: Duration,
    pub eviction_interval: Duration,
}

/// Messages driving the orchestration loop.
enum ProviderMessage {
    /// A discovery announcement (or an explicit dial request).
    Discovered(DiscoveryEvent),
    /// An accepted inbound connection, pre-handshake.
    Inbound { stream: TcpStream },
    /// A handshake completed on a detached task.
    Established {
        link: EstablishedLink<TcpStream>,
    },
    /// A handshake failed on a detached task.
    HandshakeFailed {
        device_id: Option<DeviceId>,
        reason: DisconnectReason,
        detail: String,
    },
}

/// Orchestrates discovery, links, and the shared application state.
pub struct LinkProvider {
    our_info: DeviceInfo,
    identity: Arc<IdentityKeypair>,
    registry: Arc<Mutex<DeviceRegistry>>,
    trust: Arc<Mutex<TrustStore>>,
    router: Arc<PluginRouter>,
    events: EventBus,
    config: ProviderConfig,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    msg_tx: Option<mpsc::Sender<ProviderMessage>>,
    control_addr: Option<SocketAddr>,
}

impl LinkProvider {
    pub fn new(
        our_info: DeviceInfo,
        identity: Arc<IdentityKeypair>,
        registry: Arc<Mutex<DeviceRegistry>>,
        trust: Arc<Mutex<TrustStore>>,
        router: Arc<PluginRouter>,
        events: EventBus,
        config: ProviderConfig,
    ) -> Self {
        Self {
            our_info,
            identity,
            registry,
            trust,
            router,
            events,
            config,
            shutdown: None,
            tasks: Vec::new(),
            msg_tx: None,
            control_addr: None,
        }
    }

    /// Our identity metadata, with the TCP port resolved once started.
    pub fn our_info(&self) -> &DeviceInfo {
        &self.our_info
    }

    /// The bound link listener address, once started.
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_addr
    }

    /// Binds the listener and discovery sockets and spawns the accept
    /// loop and the orchestration loop.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when a socket cannot be bound.
    pub async fn start(&mut self) -> Result<(), ProviderError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listen_addr = SocketAddr::new(self.config.bind_address, self.config.control_port);
        let listener =
            TcpListener::bind(listen_addr)
                .await
                .map_err(|source| ProviderError::BindFailed {
                    addr: listen_addr,
                    source,
                })?;
        let control_addr = listener.local_addr().map_err(|source| ProviderError::BindFailed {
            addr: listen_addr,
            source,
        })?;
        // Announce the port the OS actually gave us.
        self.our_info.tcp_port = control_addr.port();
        self.control_addr = Some(control_addr);
        info!("link listener on TCP {control_addr}");

        let (discovery_service, discovery_rx) = start_discovery(
            self.our_info.clone(),
            self.config.discovery.clone(),
            shutdown_rx.clone(),
        )
        .await?;

        let (msg_tx, msg_rx) = mpsc::channel(64);
        let (link_tx, link_rx) = mpsc::channel(256);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            msg_tx.clone(),
            shutdown_rx.clone(),
        ));

        let orchestrator = Orchestrator {
            our_info: self.our_info.clone(),
            identity: Arc::clone(&self.identity),
            registry: Arc::clone(&self.registry),
            trust: Arc::clone(&self.trust),
            router: Arc::clone(&self.router),
            events: self.events.clone(),
            msg_tx: msg_tx.clone(),
            link_tx,
            handshake_timeout: self.config.handshake_timeout,
            device_timeout: self.config.device_timeout,
            eviction_interval: self.config.eviction_interval,
            links: HashMap::new(),
        };
        let orchestrator_task = tokio::spawn(orchestrator.run(msg_rx, link_rx, shutdown_rx.clone()));

        let pump_task = tokio::spawn(discovery_pump(discovery_rx, msg_tx.clone(), shutdown_rx));

        self.tasks = vec![
            accept_task,
            orchestrator_task,
            pump_task,
            discovery_service.announcer,
            discovery_service.listener,
        ];
        self.msg_tx = Some(msg_tx);
        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Asks the orchestrator to connect to a device now, as if it had just
    /// announced itself. Used by collaborators for explicit connects and
    /// by tests.
    pub async fn dial(&self, event: DiscoveryEvent) {
        if let Some(tx) = &self.msg_tx {
            let _ = tx.send(ProviderMessage::Discovered(event)).await;
        }
    }

    /// Signals shutdown and waits for every task, including each link's
    /// reader and writer, to finish. All blocked accepts, reads, and
    /// dials resolve promptly via the shutdown signal.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.msg_tx = None;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("link provider stopped");
    }
}

/// Accepts inbound connections until shutdown.
async fn accept_loop(
    listener: TcpListener,
    msg_tx: mpsc::Sender<ProviderMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        debug!("inbound connection from {addr}");
                        if msg_tx.send(ProviderMessage::Inbound { stream }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("accept failed: {e}"),
                }
            }
        }
    }
    debug!("accept loop stopped");
}

/// Forwards discovery events into the orchestration loop.
async fn discovery_pump(
    mut discovery_rx: mpsc::Receiver<DiscoveryEvent>,
    msg_tx: mpsc::Sender<ProviderMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = discovery_rx.recv() => {
                let Some(event) = event else { break };
                if msg_tx.send(ProviderMessage::Discovered(event)).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// The single-writer orchestration loop state.
struct Orchestrator {
    our_info: DeviceInfo,
    identity: Arc<IdentityKeypair>,
    registry: Arc<Mutex<DeviceRegistry>>,
    trust: Arc<Mutex<TrustStore>>,
    router: Arc<PluginRouter>,
    events: EventBus,
    msg_tx: mpsc::Sender<ProviderMessage>,
    link_tx: mpsc::Sender<LinkEvent>,
    handshake_timeout: Duration,
    device_timeout: Duration,
    eviction_interval: Duration,
    links: HashMap<DeviceId, LinkHandle>,
}

impl Orchestrator {
    async fn run(
        mut self,
        mut msg_rx: mpsc::Receiver<ProviderMessage>,
        mut link_rx: mpsc::Receiver<LinkEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut eviction = tokio::time::interval(self.eviction_interval);
        eviction.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = eviction.tick() => {
                    let evicted = self.registry.lock().await.evict_stale(self.device_timeout);
                    for device_id in evicted {
                        debug!("evicted device {device_id}");
                    }
                }
                message = msg_rx.recv() => {
                    let Some(message) = message else { break };
                    self.handle_message(message).await;
                }
                event = link_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_link_event(event).await;
                }
            }
        }

        self.close_all_links().await;
        debug!("orchestrator stopped");
    }

    async fn handle_message(&mut self, message: ProviderMessage) {
        match message {
            ProviderMessage::Discovered(event) => self.handle_discovered(event).await,
            ProviderMessage::Inbound { stream } => self.spawn_handshake(stream, LinkRole::Acceptor),
            ProviderMessage::Established { link } => self.handle_established(link).await,
            ProviderMessage::HandshakeFailed {
                device_id,
                reason,
                detail,
            } => self.handle_handshake_failed(device_id, reason, detail).await,
        }
    }

    /// Reacts to an announcement: upsert, then dial unless a connection
    /// already exists or is being made. The state check and the flip to
    /// `Connecting` happen under one registry lock, which is what makes
    /// duplicate announcements race-free.
    async fn handle_discovered(&mut self, event: DiscoveryEvent) {
        let device_id = event.info.device_id.clone();
        if device_id == self.our_info.device_id {
            return;
        }

        {
            let mut registry = self.registry.lock().await;
            registry.upsert_from_announcement(event.info.clone());
            match registry.state(&device_id) {
                Some(LinkState::Connecting) | Some(LinkState::Connected) => return,
                _ => {}
            }
            if registry.mark_connecting(&device_id).is_err() {
                return;
            }
        }
        self.publish_state(&device_id, LinkState::Connecting, None);

        let addr = SocketAddr::new(event.addr.ip(), event.info.tcp_port);
        let msg_tx = self.msg_tx.clone();
        let our_info = self.our_info.clone();
        let identity = Arc::clone(&self.identity);
        let handshake_timeout = self.handshake_timeout;

        tokio::spawn(async move {
            let message = match timeout(handshake_timeout, TcpStream::connect(addr)).await {
                Err(_) => ProviderMessage::HandshakeFailed {
                    device_id: Some(device_id),
                    reason: DisconnectReason::Timeout,
                    detail: format!("connect to {addr} timed out"),
                },
                Ok(Err(e)) => ProviderMessage::HandshakeFailed {
                    device_id: Some(device_id),
                    reason: DisconnectReason::PeerClosed,
                    detail: format!("connect to {addr} failed: {e}"),
                },
                Ok(Ok(stream)) => {
                    match run_handshake(
                        stream,
                        LinkRole::Initiator,
                        our_info,
                        identity,
                        handshake_timeout,
                    )
                    .await
                    {
                        // Attach the id we dialed so the failure demotes
                        // the right device.
                        ProviderMessage::HandshakeFailed { reason, detail, .. } => {
                            ProviderMessage::HandshakeFailed {
                                device_id: Some(device_id),
                                reason,
                                detail,
                            }
                        }
                        other => other,
                    }
                }
            };
            let _ = msg_tx.send(message).await;
        });
    }

    /// Runs the handshake for an inbound connection on a detached task.
    fn spawn_handshake(&self, stream: TcpStream, role: LinkRole) {
        let msg_tx = self.msg_tx.clone();
        let our_info = self.our_info.clone();
        let identity = Arc::clone(&self.identity);
        let handshake_timeout = self.handshake_timeout;

        tokio::spawn(async move {
            let message =
                run_handshake(stream, role, our_info, identity, handshake_timeout).await;
            let _ = msg_tx.send(message).await;
        });
    }

    /// Installs an authenticated link: trust check, supersession, registry
    /// transitions, and task spawning.
    async fn handle_established(&mut self, link: EstablishedLink<TcpStream>) {
        let peer = link.peer.clone();
        let device_id = peer.device_id.clone();

        // Trust first: a pinned key mismatch refuses the link before any
        // packet of it is processed. Non-violation errors here are persist
        // failures while demoting, so they refuse the link all the same.
        if let Err(e) = self
            .trust
            .lock()
            .await
            .verify_identity_key(&device_id, &peer.identity_key)
        {
            warn!("refusing link from {device_id}: {e}");
            self.events.publish(EngineEvent::TrustViolation {
                device_id: device_id.clone(),
            });
            // The id is demoted, so any link still running under it is
            // torn down with the refusal.
            if let Some(old) = self.links.remove(&device_id) {
                old.shutdown().await;
            }
            self.router.drop_device(&device_id).await;
            let mut registry = self.registry.lock().await;
            registry.upsert_from_announcement(peer);
            let _ = registry.mark_connecting(&device_id);
            let _ = registry.mark_disconnected(&device_id, DisconnectReason::TrustViolation);
            drop(registry);
            self.publish_state(
                &device_id,
                LinkState::Disconnected,
                Some(DisconnectReason::TrustViolation),
            );
            return;
        }

        // One live link per device id. A dead leftover is always
        // superseded; when both links live (simultaneous connects from
        // both directions) the link initiated by the smaller device id
        // wins; both ends compute the same verdict, so they converge on
        // one socket instead of killing each other's.
        if let Some(existing) = self.links.get(&device_id) {
            let keep_new = if !existing.is_alive() {
                true
            } else {
                let new_initiator = initiator_id(&self.our_info.device_id, &device_id, link.role);
                let old_initiator =
                    initiator_id(&self.our_info.device_id, &device_id, existing.role);
                new_initiator < old_initiator
            };
            if !keep_new {
                debug!("duplicate link for {device_id}; dropping the new one");
                return;
            }
            if let Some(old) = self.links.remove(&device_id) {
                // Confirmed dead before the replacement routes anything.
                old.shutdown().await;
                let _ = self
                    .registry
                    .lock()
                    .await
                    .mark_disconnected(&device_id, DisconnectReason::PeerClosed);
            }
        }

        let handle = link.spawn(self.link_tx.clone());
        let connected = {
            let mut registry = self.registry.lock().await;
            registry.upsert_from_announcement(peer);
            if registry.state(&device_id) != Some(LinkState::Connecting) {
                // Inbound links arrive without a local dial; enter the
                // connecting state for a legal transition.
                let _ = registry.mark_connecting(&device_id);
            }
            registry.mark_connected(&device_id, handle.sender())
        };

        match connected {
            Ok(()) => {
                self.links.insert(device_id.clone(), handle);
                self.publish_state(&device_id, LinkState::Connected, None);
            }
            Err(e) => {
                warn!("could not install link for {device_id}: {e}");
                handle.shutdown().await;
            }
        }
    }

    async fn handle_handshake_failed(
        &mut self,
        device_id: Option<DeviceId>,
        reason: DisconnectReason,
        detail: String,
    ) {
        warn!("handshake failed ({reason}): {detail}");
        let Some(device_id) = device_id else {
            // Inbound strangers that fail the handshake never made it
            // into the registry; nothing to demote.
            return;
        };
        if self
            .registry
            .lock()
            .await
            .mark_disconnected(&device_id, reason)
            .is_ok()
        {
            self.publish_state(&device_id, LinkState::Disconnected, Some(reason));
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Packet {
                device_id,
                link_id,
                packet,
            } => {
                if !self.is_current_link(&device_id, link_id) {
                    // A superseded link drained its last packets; no
                    // double routing.
                    debug!("ignoring packet from stale link {link_id} of {device_id}");
                    return;
                }
                if packet.is_pair() {
                    self.handle_pair_packet(&device_id, &packet).await;
                } else {
                    self.router.route_inbound(&device_id, packet).await;
                }
            }
            LinkEvent::Closed {
                device_id,
                link_id,
                reason,
            } => {
                if !self.is_current_link(&device_id, link_id) {
                    // The replacement link is live; the old one's close
                    // must not tear it down.
                    return;
                }
                if let Some(handle) = self.links.remove(&device_id) {
                    handle.shutdown().await;
                }
                self.router.drop_device(&device_id).await;
                if self
                    .registry
                    .lock()
                    .await
                    .mark_disconnected(&device_id, reason)
                    .is_ok()
                {
                    self.publish_state(&device_id, LinkState::Disconnected, Some(reason));
                }
            }
        }
    }

    fn is_current_link(&self, device_id: &DeviceId, link_id: u64) -> bool {
        self.links
            .get(device_id)
            .map(|handle| handle.link_id == link_id)
            .unwrap_or(false)
    }

    /// Pairing negotiation is the one packet family processed regardless
    /// of trust state, since it is how trust gets established.
    async fn handle_pair_packet(&mut self, device_id: &DeviceId, packet: &Packet) {
        let wants_pair = packet.body_bool("pair").unwrap_or(false);
        let identity_key = match self.registry.lock().await.info(device_id) {
            Some(info) => info.identity_key.clone(),
            None => {
                debug!("pair packet from unknown device {device_id}; dropped");
                return;
            }
        };

        let update = self
            .trust
            .lock()
            .await
            .handle_pair_packet(device_id, &identity_key, wants_pair);
        match update {
            Ok(PairUpdate::RequestedByPeer) => {
                info!("pairing requested by device {device_id}");
                self.events.publish(EngineEvent::PairingRequested {
                    device_id: device_id.clone(),
                });
            }
            Ok(PairUpdate::Paired) => info!("device {device_id} is now paired"),
            Ok(PairUpdate::Unpaired) => info!("device {device_id} revoked pairing"),
            Err(e) => warn!("pairing update for {device_id} failed: {e}"),
        }
    }

    async fn close_all_links(&mut self) {
        for (device_id, handle) in self.links.drain() {
            handle.shutdown().await;
            self.router.drop_device(&device_id).await;
            if self
                .registry
                .lock()
                .await
                .mark_disconnected(&device_id, DisconnectReason::Cancelled)
                .is_ok()
            {
                self.events.publish(EngineEvent::DeviceStateChanged {
                    device_id,
                    state: LinkState::Disconnected,
                    reason: Some(DisconnectReason::Cancelled),
                });
            }
        }
    }

    fn publish_state(
        &self,
        device_id: &DeviceId,
        state: LinkState,
        reason: Option<DisconnectReason>,
    ) {
        self.events.publish(EngineEvent::DeviceStateChanged {
            device_id: device_id.clone(),
            state,
            reason,
        });
    }
}

/// Device id that initiated a link of the given role, seen from our side.
fn initiator_id<'a>(ours: &'a DeviceId, peer: &'a DeviceId, role: LinkRole) -> &'a DeviceId {
    match role {
        LinkRole::Initiator => ours,
        LinkRole::Acceptor => peer,
    }
}

/// Runs one handshake and wraps the outcome as a provider message.
async fn run_handshake(
    stream: TcpStream,
    role: LinkRole,
    our_info: DeviceInfo,
    identity: Arc<IdentityKeypair>,
    handshake_timeout: Duration,
) -> ProviderMessage {
    match establish(stream, role, &our_info, &identity, handshake_timeout).await {
        Ok(link) => ProviderMessage::Established { link },
        // The peer id is unknown until the identity exchange succeeds;
        // the dial side re-attaches the id it dialed.
        Err(e) => ProviderMessage::HandshakeFailed {
            device_id: None,
            reason: disconnect_reason(&e),
            detail: e.to_string(),
        },
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::plugins::builtin_factories;
    use lanlink_core::DeviceType;

    fn make_provider(name: &str) -> LinkProvider {
        let identity = Arc::new(IdentityKeypair::generate());
        let registry = Arc::new(Mutex::new(DeviceRegistry::new()));
        let trust = Arc::new(Mutex::new(TrustStore::in_memory()));
        let events = EventBus::new(64);
        let factories = builtin_factories(&[]);
        let router = Arc::new(PluginRouter::new(
            factories,
            Arc::clone(&registry),
            Arc::clone(&trust),
            events.clone(),
        ));

        let our_info = DeviceInfo {
            device_id: DeviceId::from(name),
            device_name: name.to_string(),
            device_type: DeviceType::Desktop,
            protocol_version: 1,
            tcp_port: 0,
            incoming_capabilities: vec!["runcommand".to_string(), "ping".to_string()],
            outgoing_capabilities: vec!["runcommand".to_string(), "ping".to_string()],
            identity_key: identity.public_base64(),
        };

        let config = ProviderConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            control_port: 0,
            discovery: DiscoveryConfig {
                bind_address: "127.0.0.1".parse().unwrap(),
                broadcast_address: "127.0.0.1".parse().unwrap(),
                port: 0,
                interval: Duration::from_secs(3600),
            },
            handshake_timeout: Duration::from_secs(5),
            device_timeout: Duration::from_secs(180),
            eviction_interval: Duration::from_secs(3600),
        };

        LinkProvider::new(our_info, identity, registry, trust, router, events, config)
    }

    #[tokio::test]
    async fn test_start_binds_and_resolves_control_port() {
        let mut provider = make_provider("a");
        provider.start().await.expect("start");

        let addr = provider.control_addr().expect("bound");
        assert_ne!(addr.port(), 0);
        assert_eq!(provider.our_info().tcp_port, addr.port());

        provider.stop().await;
    }

    #[tokio::test]
    async fn test_stop_resolves_promptly_with_blocked_accept() {
        let mut provider = make_provider("a");
        provider.start().await.expect("start");

        // The accept loop and discovery listener are parked on their
        // sockets; stop() must still return quickly via the shutdown
        // signal rather than hang on them.
        timeout(Duration::from_secs(5), provider.stop())
            .await
            .expect("stop must not hang");
    }

    #[tokio::test]
    async fn test_stop_twice_is_harmless() {
        let mut provider = make_provider("a");
        provider.start().await.expect("start");
        provider.stop().await;
        provider.stop().await;
    }
}
