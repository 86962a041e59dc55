//! The per-peer transport link.
//!
//! A fresh connection is cleartext exactly long enough for both sides to
//! exchange one identity record each. Anything else before the upgrade is
//! a protocol violation and the connection is torn down without retry.
//! After the exchange, both sides derive the session cipher from their
//! identity keys and every subsequent record travels encrypted.
//!
//! A spawned link runs two tasks: a writer draining the outbound send
//! queue with at most one in-flight write (frames are never interleaved),
//! and a reader decoding records in arrival order. The reader surfaces a
//! terminal [`LinkEvent::Closed`] exactly once; sends after that fail at
//! the queue. Everything is generic over the byte stream so tests run the
//! full handshake over in-memory duplex pipes.

use std::time::Duration;

use lanlink_core::{
    codec::MAX_RECORD_BYTES, crypto::CryptoError, decode_packet, derive_session, encode_packet,
    DecodeError, DeviceId, DeviceInfo, IdentityKeypair, LinkRole, Packet,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::application::registry::DisconnectReason;
use lanlink_core::crypto::{SessionOpener, SessionSealer};

/// Depth of the outbound send queue per link.
const SEND_QUEUE_DEPTH: usize = 64;

/// Error type for link establishment and send operations.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The peer could not be reached.
    #[error("connect failed: {0}")]
    Connect(std::io::Error),

    /// The handshake did not complete within its deadline.
    #[error("handshake timed out")]
    Timeout,

    /// The peer violated the handshake sequence.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer sent a structurally broken record.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Key material was unusable.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The underlying stream failed.
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The link is closed; the send was not delivered.
    #[error("link closed")]
    Closed,
}

/// Maps a handshake failure to the registry's typed disconnect reason.
pub fn disconnect_reason(error: &LinkError) -> DisconnectReason {
    match error {
        LinkError::Timeout => DisconnectReason::Timeout,
        LinkError::Protocol(_) | LinkError::Decode(_) | LinkError::Crypto(_) => {
            DisconnectReason::ProtocolError
        }
        LinkError::Connect(_) | LinkError::Io(_) | LinkError::Closed => {
            DisconnectReason::PeerClosed
        }
    }
}

/// Events a spawned link reports upstream.
///
/// Every event names the link instance it came from, so events of a
/// superseded link can be told apart from its replacement's.
#[derive(Debug)]
pub enum LinkEvent {
    /// A decoded packet, in exact arrival order.
    Packet {
        device_id: DeviceId,
        link_id: u64,
        packet: Packet,
    },
    /// The link terminated. Sent exactly once, last.
    Closed {
        device_id: DeviceId,
        link_id: u64,
        reason: DisconnectReason,
    },
}

/// A connection that has completed the identity exchange and encryption
/// upgrade but is not yet running its I/O tasks.
pub struct EstablishedLink<S> {
    /// The peer's authenticated identity metadata.
    pub peer: DeviceInfo,
    /// Which end of this connection we are.
    pub role: LinkRole,
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: tokio::io::WriteHalf<S>,
    sealer: SessionSealer,
    opener: SessionOpener,
}

/// Runs the cleartext identity exchange and derives the session cipher.
///
/// Symmetric: both ends call this concurrently, each writing its identity
/// record and reading the peer's. Every read and write races the
/// handshake deadline.
///
/// # Errors
///
/// [`LinkError::Timeout`] when the deadline passes, [`LinkError::Protocol`]
/// when the first record is anything but an identity record, and
/// [`LinkError::Decode`]/[`LinkError::Crypto`] for broken framing or key
/// material. All of these are connection-fatal and never retried.
pub async fn establish<S>(
    stream: S,
    role: LinkRole,
    our_info: &DeviceInfo,
    identity: &IdentityKeypair,
    handshake_timeout: Duration,
) -> Result<EstablishedLink<S>, LinkError>
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let our_record = encode_packet(&our_info.to_packet())?;
    timeout(handshake_timeout, write_half.write_all(&our_record))
        .await
        .map_err(|_| LinkError::Timeout)??;

    let mut line = Vec::new();
    let read = timeout(handshake_timeout, reader.read_until(b'\n', &mut line))
        .await
        .map_err(|_| LinkError::Timeout)??;
    if read == 0 {
        return Err(LinkError::Protocol(
            "connection closed during identity exchange".to_string(),
        ));
    }
    if line.len() > MAX_RECORD_BYTES {
        return Err(LinkError::Protocol("oversized identity record".to_string()));
    }

    let packet = decode_packet(&line)?;
    if !packet.is_identity() {
        // Capability traffic before the upgrade is a violation, not data.
        return Err(LinkError::Protocol(format!(
            "expected identity record before upgrade, got {:?}",
            packet.packet_type
        )));
    }
    let peer = DeviceInfo::from_packet(&packet).map_err(|e| LinkError::Protocol(e.to_string()))?;

    let shared_secret = identity.shared_secret(&peer.identity_key)?;
    let (sealer, opener) = derive_session(&shared_secret, role);

    debug!(
        "link upgraded with {} ({}) as {role:?}",
        peer.device_name, peer.device_id
    );

    Ok(EstablishedLink {
        peer,
        role,
        reader,
        writer: write_half,
        sealer,
        opener,
    })
}

/// Counter assigning each spawned link a unique instance id.
static LINK_IDS: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// A running link: the owner's handle to its tasks and send queue.
///
/// The registry only ever holds clones of the queue sender; the handle
/// itself (and with it the life of the tasks) belongs to the provider.
pub struct LinkHandle {
    pub device_id: DeviceId,
    /// Unique id of this link instance, echoed in its events.
    pub link_id: u64,
    /// Which end of the connection we are; decides supersession ties.
    pub role: LinkRole,
    sender: mpsc::Sender<Packet>,
    shutdown: watch::Sender<bool>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl LinkHandle {
    /// A clone of the outbound queue sender (the registry's link key).
    pub fn sender(&self) -> mpsc::Sender<Packet> {
        self.sender.clone()
    }

    /// Whether the link's writer still accepts packets.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Signals both tasks and waits until they have exited. After this
    /// returns the link is confirmed dead: nothing routes through it.
    ///
    /// The reader is aborted rather than joined on the shutdown signal:
    /// it may be parked delivering into the owner's event channel, and
    /// the owner is the one calling this.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.writer_task.await;
        self.reader_task.abort();
        let _ = self.reader_task.await;
    }
}

impl<S> EstablishedLink<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Spawns the reader and writer tasks and returns the owning handle.
    ///
    /// Decoded packets and the terminal close are delivered to `events`
    /// in order.
    pub fn spawn(self, events: mpsc::Sender<LinkEvent>) -> LinkHandle {
        let (sender, send_queue) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let device_id = self.peer.device_id.clone();
        let link_id = LINK_IDS.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let writer_task = tokio::spawn(write_loop(
            self.writer,
            self.sealer,
            send_queue,
            shutdown_rx.clone(),
        ));
        let reader_task = tokio::spawn(read_loop(
            self.reader,
            self.opener,
            device_id.clone(),
            link_id,
            events,
            shutdown_rx,
        ));

        LinkHandle {
            device_id,
            link_id,
            role: self.role,
            sender,
            shutdown: shutdown_tx,
            writer_task,
            reader_task,
        }
    }
}

/// Drains the send queue, sealing and writing one record at a time.
async fn write_loop<W>(
    mut writer: tokio::io::WriteHalf<W>,
    mut sealer: SessionSealer,
    mut queue: mpsc::Receiver<Packet>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite,
{
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            next = queue.recv() => {
                let Some(packet) = next else { break };
                let record = match encode_packet(&packet) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("dropping unencodable outbound packet: {e}");
                        continue;
                    }
                };
                let line = match sealer.seal_record(&record) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("session sealer failed, closing link: {e}");
                        break;
                    }
                };
                if let Err(e) = writer.write_all(&line).await {
                    debug!("link write failed: {e}");
                    break;
                }
            }
        }
    }
    // Dropping the queue receiver makes every send after this fail,
    // which is how callers observe LinkClosed.
}

/// Reads encrypted records in order until close, shutdown, or violation.
async fn read_loop<R>(
    mut reader: BufReader<tokio::io::ReadHalf<R>>,
    mut opener: SessionOpener,
    device_id: DeviceId,
    link_id: u64,
    events: mpsc::Sender<LinkEvent>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead,
{
    let reason = loop {
        let mut line = Vec::new();
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break DisconnectReason::Cancelled;
                }
            }
            read = reader.read_until(b'\n', &mut line) => {
                match read {
                    Ok(0) => break DisconnectReason::PeerClosed,
                    Ok(_) => {
                        if line.len() > MAX_RECORD_BYTES {
                            warn!("oversized record from {device_id}, closing link");
                            break DisconnectReason::ProtocolError;
                        }
                        let record = match opener.open_record(&line) {
                            Ok(record) => record,
                            Err(e) => {
                                warn!("undecryptable record from {device_id}: {e}");
                                break DisconnectReason::ProtocolError;
                            }
                        };
                        match decode_packet(&record) {
                            Ok(packet) => {
                                let event = LinkEvent::Packet {
                                    device_id: device_id.clone(),
                                    link_id,
                                    packet,
                                };
                                if events.send(event).await.is_err() {
                                    break DisconnectReason::Cancelled;
                                }
                            }
                            Err(e) => {
                                // Corrupt framing inside the encrypted
                                // channel is connection-fatal.
                                warn!("malformed record from {device_id}: {e}");
                                break DisconnectReason::ProtocolError;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("link read failed for {device_id}: {e}");
                        break DisconnectReason::PeerClosed;
                    }
                }
            }
        }
    };

    let _ = events
        .send(LinkEvent::Closed {
            device_id,
            link_id,
            reason,
        })
        .await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
