//! Device registry: the engine's in-memory database of every peer it has
//! discovered or connected to, and the single writer of link-state
//! transitions.
//!
//! State machine per device:
//!
//! ```text
//! Discovered ──► Connecting ──► Connected ──► Disconnected ──► (evicted)
//!                    │                             ▲
//!                    └─────── handshake failure ───┘
//! ```
//!
//! A reconnect starts a fresh `Discovered/Disconnected → Connecting` cycle;
//! `Connected → Connecting` is rejected. The registry stores a non-owning
//! handle to the link's send queue, never the link itself; live links are
//! owned by the link provider.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use lanlink_core::{DeviceId, DeviceInfo, Packet};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Non-owning handle to a link's outbound send queue.
///
/// Cloned out of the registry by the router for outbound hand-off; the
/// queue's receiving side lives in the link's writer task.
pub type LinkKey = mpsc::Sender<Packet>;

/// Current link state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// An announcement was received; no connection yet.
    Discovered,
    /// A connection and handshake are in progress.
    Connecting,
    /// An authenticated, encrypted link is live.
    Connected,
    /// The link ended; the record is kept until eviction.
    Disconnected,
}

/// Why a device left the `Connected` or `Connecting` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The handshake or an I/O operation timed out.
    Timeout,
    /// The peer presented an identity key that contradicts its trust record.
    TrustViolation,
    /// The peer violated handshake or framing rules.
    ProtocolError,
    /// The peer closed the connection.
    PeerClosed,
    /// The engine is shutting down.
    Cancelled,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::TrustViolation => "trust violation",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::PeerClosed => "peer closed",
            DisconnectReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Error type for registry operations.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("invalid transition from {from:?} to {to:?} for device {device_id}")]
    InvalidTransition {
        device_id: DeviceId,
        from: LinkState,
        to: LinkState,
    },
}

/// Filter for [`DeviceRegistry::list_devices`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFilter {
    /// Every known device.
    All,
    /// Only devices with a live link.
    Connected,
}

/// One tracked device.
#[derive(Debug)]
struct DeviceRecord {
    info: DeviceInfo,
    state: LinkState,
    last_seen: Instant,
    last_reason: Option<DisconnectReason>,
    link: Option<LinkKey>,
}

/// Read-only view of a device, handed to collaborators.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub info: DeviceInfo,
    pub state: LinkState,
    pub last_reason: Option<DisconnectReason>,
    pub last_seen: Instant,
}

/// In-memory registry of all known devices.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or refreshes a device from announcement (or handshake
    /// identity) metadata. Idempotent: repeated announcements merge the
    /// capability lists, update the mutable identity fields, and refresh
    /// the last-seen time. Returns `true` when the device was not known
    /// before.
    pub fn upsert_from_announcement(&mut self, info: DeviceInfo) -> bool {
        match self.devices.get_mut(&info.device_id) {
            Some(record) => {
                merge_capabilities(&mut record.info.incoming_capabilities, &info.incoming_capabilities);
                merge_capabilities(&mut record.info.outgoing_capabilities, &info.outgoing_capabilities);
                record.info.device_name = info.device_name;
                record.info.device_type = info.device_type;
                record.info.tcp_port = info.tcp_port;
                record.info.protocol_version = info.protocol_version;
                record.info.identity_key = info.identity_key;
                record.last_seen = Instant::now();
                false
            }
            None => {
                debug!("new device discovered: {} ({})", info.device_name, info.device_id);
                self.devices.insert(
                    info.device_id.clone(),
                    DeviceRecord {
                        info,
                        state: LinkState::Discovered,
                        last_seen: Instant::now(),
                        last_reason: None,
                        link: None,
                    },
                );
                true
            }
        }
    }

    /// Marks a device as `Connecting`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidTransition`] when the device is
    /// already `Connecting` or `Connected`; a live link is never resumed,
    /// and duplicate dials are refused here, which is what makes dialing
    /// idempotent against repeated announcements.
    pub fn mark_connecting(&mut self, device_id: &DeviceId) -> Result<(), RegistryError> {
        let record = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.clone()))?;

        match record.state {
            LinkState::Discovered | LinkState::Disconnected => {
                record.state = LinkState::Connecting;
                record.last_seen = Instant::now();
                Ok(())
            }
            from => Err(RegistryError::InvalidTransition {
                device_id: device_id.clone(),
                from,
                to: LinkState::Connecting,
            }),
        }
    }

    /// Marks a device as `Connected`, storing the non-owning link key.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidTransition`] unless the device is
    /// `Connecting`.
    pub fn mark_connected(
        &mut self,
        device_id: &DeviceId,
        link: LinkKey,
    ) -> Result<(), RegistryError> {
        let record = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.clone()))?;

        match record.state {
            LinkState::Connecting => {
                record.state = LinkState::Connected;
                record.last_seen = Instant::now();
                record.last_reason = None;
                record.link = Some(link);
                info!("device connected: {} ({})", record.info.device_name, device_id);
                Ok(())
            }
            from => Err(RegistryError::InvalidTransition {
                device_id: device_id.clone(),
                from,
                to: LinkState::Connected,
            }),
        }
    }

    /// Marks a device as `Disconnected` with a typed reason and drops the
    /// link key. Valid from `Connecting` and `Connected`; a no-op error is
    /// never needed because disconnects race link teardown.
    pub fn mark_disconnected(
        &mut self,
        device_id: &DeviceId,
        reason: DisconnectReason,
    ) -> Result<(), RegistryError> {
        let record = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.clone()))?;

        info!(
            "device disconnected: {} ({}): {}",
            record.info.device_name, device_id, reason
        );
        record.state = LinkState::Disconnected;
        record.last_seen = Instant::now();
        record.last_reason = Some(reason);
        record.link = None;
        Ok(())
    }

    /// Returns the link send-queue handle for a `Connected` device.
    pub fn link(&self, device_id: &DeviceId) -> Option<LinkKey> {
        self.devices
            .get(device_id)
            .filter(|r| r.state == LinkState::Connected)
            .and_then(|r| r.link.clone())
    }

    /// Returns the current state of a device, if known.
    pub fn state(&self, device_id: &DeviceId) -> Option<LinkState> {
        self.devices.get(device_id).map(|r| r.state)
    }

    /// Returns a device's identity metadata, if known.
    pub fn info(&self, device_id: &DeviceId) -> Option<&DeviceInfo> {
        self.devices.get(device_id).map(|r| &r.info)
    }

    /// Returns snapshots of known devices, most recently seen first.
    pub fn list_devices(&self, filter: DeviceFilter) -> Vec<DeviceSnapshot> {
        let mut devices: Vec<DeviceSnapshot> = self
            .devices
            .values()
            .filter(|r| match filter {
                DeviceFilter::All => true,
                DeviceFilter::Connected => r.state == LinkState::Connected,
            })
            .map(|r| DeviceSnapshot {
                info: r.info.clone(),
                state: r.state,
                last_reason: r.last_reason,
                last_seen: r.last_seen,
            })
            .collect();
        devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        devices
    }

    /// Removes a device outright (explicit unpair path).
    pub fn remove(&mut self, device_id: &DeviceId) {
        self.devices.remove(device_id);
    }

    /// Evicts devices whose last-seen time exceeds `timeout` and whose
    /// state is not `Connected`. A live link keeps a device alive
    /// regardless of announcement freshness. Returns the evicted ids.
    pub fn evict_stale(&mut self, timeout: Duration) -> Vec<DeviceId> {
        let now = Instant::now();
        let stale: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|(_, r)| {
                r.state != LinkState::Connected
                    && now.saturating_duration_since(r.last_seen) > timeout
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            debug!("evicting stale device {id}");
            self.devices.remove(id);
        }
        stale
    }
}

/// Set-union merge of capability lists, preserving first-seen order.
fn merge_capabilities(existing: &mut Vec<String>, incoming: &[String]) {
    for capability in incoming {
        if !existing.iter().any(|c| c == capability) {
            existing.push(capability.clone());
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lanlink_core::DeviceType;

    fn info(id: &str, name: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: DeviceId::from(id),
            device_name: name.to_string(),
            device_type: DeviceType::Desktop,
            protocol_version: 1,
            tcp_port: 24821,
            incoming_capabilities: vec!["runcommand".to_string()],
            outgoing_capabilities: vec!["runcommand".to_string()],
            identity_key: "key".to_string(),
        }
    }

    fn link_key() -> LinkKey {
        let (tx, _rx) = mpsc::channel(1);
        tx
    }

    #[test]
    fn test_registry_starts_empty() {
        let registry = DeviceRegistry::new();
        assert!(registry.list_devices(DeviceFilter::All).is_empty());
    }

    #[test]
    fn test_upsert_inserts_as_discovered() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.upsert_from_announcement(info("a", "A")));
        assert_eq!(
            registry.state(&DeviceId::from("a")),
            Some(LinkState::Discovered)
        );
    }

    #[test]
    fn test_upsert_is_idempotent_and_merges_capabilities() {
        let mut registry = DeviceRegistry::new();
        registry.upsert_from_announcement(info("a", "A"));

        let mut update = info("a", "A renamed");
        update.outgoing_capabilities = vec!["ping".to_string()];
        assert!(!registry.upsert_from_announcement(update));

        let id = DeviceId::from("a");
        let merged = registry.info(&id).unwrap();
        assert_eq!(merged.device_name, "A renamed");
        assert!(merged.sends("runcommand"), "existing capability kept");
        assert!(merged.sends("ping"), "new capability merged");
    }

    #[test]
    fn test_upsert_does_not_reset_link_state() {
        let mut registry = DeviceRegistry::new();
        registry.upsert_from_announcement(info("a", "A"));
        let id = DeviceId::from("a");
        registry.mark_connecting(&id).unwrap();

        registry.upsert_from_announcement(info("a", "A"));
        assert_eq!(registry.state(&id), Some(LinkState::Connecting));
    }

    #[test]
    fn test_full_lifecycle_transitions() {
        let mut registry = DeviceRegistry::new();
        registry.upsert_from_announcement(info("a", "A"));
        let id = DeviceId::from("a");

        registry.mark_connecting(&id).unwrap();
        registry.mark_connected(&id, link_key()).unwrap();
        assert_eq!(registry.state(&id), Some(LinkState::Connected));

        registry
            .mark_disconnected(&id, DisconnectReason::PeerClosed)
            .unwrap();
        assert_eq!(registry.state(&id), Some(LinkState::Disconnected));

        // A reconnect is a fresh cycle, not a resume.
        registry.mark_connecting(&id).unwrap();
        assert_eq!(registry.state(&id), Some(LinkState::Connecting));
    }

    #[test]
    fn test_connected_to_connecting_is_rejected() {
        let mut registry = DeviceRegistry::new();
        registry.upsert_from_announcement(info("a", "A"));
        let id = DeviceId::from("a");
        registry.mark_connecting(&id).unwrap();
        registry.mark_connected(&id, link_key()).unwrap();

        assert!(matches!(
            registry.mark_connecting(&id),
            Err(RegistryError::InvalidTransition {
                from: LinkState::Connected,
                ..
            })
        ));
    }

    #[test]
    fn test_duplicate_mark_connecting_is_rejected() {
        let mut registry = DeviceRegistry::new();
        registry.upsert_from_announcement(info("a", "A"));
        let id = DeviceId::from("a");
        registry.mark_connecting(&id).unwrap();

        // The second announcement-triggered dial attempt is refused.
        assert!(registry.mark_connecting(&id).is_err());
    }

    #[test]
    fn test_mark_connected_requires_connecting() {
        let mut registry = DeviceRegistry::new();
        registry.upsert_from_announcement(info("a", "A"));
        let id = DeviceId::from("a");

        assert!(matches!(
            registry.mark_connected(&id, link_key()),
            Err(RegistryError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_transitions_on_unknown_device_fail() {
        let mut registry = DeviceRegistry::new();
        let id = DeviceId::from("ghost");
        assert_eq!(
            registry.mark_connecting(&id),
            Err(RegistryError::UnknownDevice(id.clone()))
        );
        assert!(registry
            .mark_disconnected(&id, DisconnectReason::Timeout)
            .is_err());
    }

    #[test]
    fn test_link_returns_key_only_while_connected() {
        let mut registry = DeviceRegistry::new();
        registry.upsert_from_announcement(info("a", "A"));
        let id = DeviceId::from("a");
        assert!(registry.link(&id).is_none());

        registry.mark_connecting(&id).unwrap();
        registry.mark_connected(&id, link_key()).unwrap();
        assert!(registry.link(&id).is_some());

        registry
            .mark_disconnected(&id, DisconnectReason::PeerClosed)
            .unwrap();
        assert!(registry.link(&id).is_none());
    }

    #[test]
    fn test_list_devices_orders_by_last_seen_descending() {
        let mut registry = DeviceRegistry::new();
        registry.upsert_from_announcement(info("old", "Old"));
        std::thread::sleep(Duration::from_millis(5));
        registry.upsert_from_announcement(info("new", "New"));

        let devices = registry.list_devices(DeviceFilter::All);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].info.device_id, DeviceId::from("new"));
        assert_eq!(devices[1].info.device_id, DeviceId::from("old"));
    }

    #[test]
    fn test_list_devices_connected_filter() {
        let mut registry = DeviceRegistry::new();
        registry.upsert_from_announcement(info("a", "A"));
        registry.upsert_from_announcement(info("b", "B"));
        let id = DeviceId::from("a");
        registry.mark_connecting(&id).unwrap();
        registry.mark_connected(&id, link_key()).unwrap();

        let connected = registry.list_devices(DeviceFilter::Connected);
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].info.device_id, id);
    }

    #[test]
    fn test_eviction_removes_stale_disconnected_devices() {
        let mut registry = DeviceRegistry::new();
        registry.upsert_from_announcement(info("a", "A"));

        let evicted = registry.evict_stale(Duration::from_secs(0));
        assert_eq!(evicted, vec![DeviceId::from("a")]);
        assert!(registry.state(&DeviceId::from("a")).is_none());
    }

    #[test]
    fn test_eviction_never_removes_connected_devices() {
        let mut registry = DeviceRegistry::new();
        registry.upsert_from_announcement(info("a", "A"));
        let id = DeviceId::from("a");
        registry.mark_connecting(&id).unwrap();
        registry.mark_connected(&id, link_key()).unwrap();

        // Zero timeout makes every non-connected device stale; the
        // connected one must survive regardless.
        let evicted = registry.evict_stale(Duration::from_secs(0));
        assert!(evicted.is_empty());
        assert_eq!(registry.state(&id), Some(LinkState::Connected));
    }

    #[test]
    fn test_eviction_respects_timeout() {
        let mut registry = DeviceRegistry::new();
        registry.upsert_from_announcement(info("a", "A"));
        let evicted = registry.evict_stale(Duration::from_secs(3600));
        assert!(evicted.is_empty());
    }
}
