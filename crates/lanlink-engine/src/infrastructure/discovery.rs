//! UDP broadcast device discovery.
//!
//! Two tasks share the discovery port: the announcer broadcasts our
//! identity record every interval, and the listener decodes announcements
//! from other devices into [`DiscoveryEvent`]s for the link provider.
//! Announcements are unauthenticated by design; they only tell us who to
//! dial; every claim in them is re-verified during the link handshake.
//!
//! Both tasks race every blocking call against the shutdown signal, so
//! `stop()` never waits on a silent network.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use lanlink_core::{codec::decode_packet, encode_packet, DeviceInfo};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Error type for discovery startup.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A discovery socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Discovery timing and addressing knobs.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Address the listener binds to.
    pub bind_address: IpAddr,
    /// Address announcements are broadcast to.
    pub broadcast_address: IpAddr,
    /// UDP discovery port.
    pub port: u16,
    /// Interval between announcement broadcasts.
    pub interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            port: 24820,
            interval: Duration::from_secs(5),
        }
    }
}

/// An announcement received from another device.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    /// The identity metadata the device broadcast.
    pub info: DeviceInfo,
    /// Source address of the datagram; combined with the advertised TCP
    /// port this is where the device can be dialed.
    pub addr: SocketAddr,
}

/// Handles of the two running discovery tasks.
pub struct DiscoveryService {
    pub announcer: JoinHandle<()>,
    pub listener: JoinHandle<()>,
}

/// Binds the discovery sockets and spawns the announcer and listener.
///
/// Returns the receiver the link provider reads [`DiscoveryEvent`]s from.
///
/// # Errors
///
/// Returns [`DiscoveryError::BindFailed`] when a socket cannot be bound.
pub async fn start_discovery(
    our_info: DeviceInfo,
    config: DiscoveryConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<(DiscoveryService, mpsc::Receiver<DiscoveryEvent>), DiscoveryError> {
    let listen_addr = SocketAddr::new(config.bind_address, config.port);
    let listen_socket =
        UdpSocket::bind(listen_addr)
            .await
            .map_err(|source| DiscoveryError::BindFailed {
                addr: listen_addr,
                source,
            })?;

    let announce_bind = SocketAddr::new(config.bind_address, 0);
    let announce_socket =
        UdpSocket::bind(announce_bind)
            .await
            .map_err(|source| DiscoveryError::BindFailed {
                addr: announce_bind,
                source,
            })?;
    if let Err(e) = announce_socket.set_broadcast(true) {
        warn!("could not enable broadcast on announce socket: {e}");
    }

    info!("discovery listening on UDP {listen_addr}");

    let (tx, rx) = mpsc::channel(64);
    let broadcast_to = SocketAddr::new(config.broadcast_address, config.port);

    let announcer = tokio::spawn(announce_loop(
        announce_socket,
        our_info.clone(),
        broadcast_to,
        config.interval,
        shutdown.clone(),
    ));
    let listener = tokio::spawn(listen_loop(listen_socket, our_info, tx, shutdown));

    Ok((DiscoveryService { announcer, listener }, rx))
}

/// Broadcasts our identity record every interval until shutdown.
async fn announce_loop(
    socket: UdpSocket,
    our_info: DeviceInfo,
    broadcast_to: SocketAddr,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match encode_packet(&our_info.to_packet()) {
                    Ok(datagram) => {
                        if let Err(e) = socket.send_to(&datagram, broadcast_to).await {
                            debug!("announcement broadcast failed: {e}");
                        }
                    }
                    Err(e) => error!("failed to encode announcement: {e}"),
                }
            }
        }
    }

    debug!("discovery announcer stopped");
}

/// Receives announcement datagrams until shutdown.
async fn listen_loop(
    socket: UdpSocket,
    our_info: DeviceInfo,
    tx: mpsc::Sender<DiscoveryEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, src) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("discovery recv error: {e}");
                        continue;
                    }
                };

                let Some(event) = parse_announcement(&buf[..len], src, &our_info) else {
                    continue;
                };
                if tx.send(event).await.is_err() {
                    // Receiver dropped: provider is shutting down.
                    break;
                }
            }
        }
    }

    debug!("discovery listener stopped");
}

/// Decodes one announcement datagram, filtering our own broadcasts and
/// anything malformed.
fn parse_announcement(
    datagram: &[u8],
    src: SocketAddr,
    our_info: &DeviceInfo,
) -> Option<DiscoveryEvent> {
    let packet = match decode_packet(datagram) {
        Ok(packet) => packet,
        Err(e) => {
            debug!("ignoring malformed discovery datagram from {src}: {e}");
            return None;
        }
    };

    let info = match DeviceInfo::from_packet(&packet) {
        Ok(info) => info,
        Err(e) => {
            debug!("ignoring non-identity datagram from {src}: {e}");
            return None;
        }
    };

    if info.device_id == our_info.device_id {
        return None;
    }

    debug!(
        "announcement from {src}: {} ({})",
        info.device_name, info.device_id
    );
    Some(DiscoveryEvent { info, addr: src })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
