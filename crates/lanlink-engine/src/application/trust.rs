//! Pairing state machine and persisted trust table.
//!
//! Trust is established by an explicit pairing exchange and pinned to the
//! peer's long-term identity key. The table survives restarts; a record is
//! deleted on explicit unpair. Pairing state machine per device:
//!
//! ```text
//! Unpaired ──► PairRequested ────────────► Paired
//!     │                                      ▲
//!     └──────► PairRequestedByPeer ──────────┘
//!                      │
//!                  rejected ──► Unpaired
//! ```
//!
//! A later connection that presents a different identity key than the
//! pinned one is a trust violation: the device is demoted to `Unpaired`
//! and must be re-paired explicitly. This stops impersonation after a key
//! rotation the user never consented to.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use lanlink_core::crypto::fingerprint;
use lanlink_core::DeviceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Error type for trust store operations.
#[derive(Debug, Error)]
pub enum TrustError {
    /// The peer presented an identity key that contradicts the pinned one.
    #[error("identity key mismatch for device {device_id}")]
    Violation { device_id: DeviceId },

    /// The requested transition is not legal from the current state.
    #[error("device {device_id} is {state:?}; operation not applicable")]
    InvalidState {
        device_id: DeviceId,
        state: TrustState,
    },

    /// A file system I/O error occurred.
    #[error("I/O error accessing trust table at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The trust table TOML could not be parsed.
    #[error("failed to parse trust table: {0}")]
    Parse(#[from] toml::de::Error),

    /// The trust table could not be serialized.
    #[error("failed to serialize trust table: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Pairing state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustState {
    /// No trust relationship.
    Unpaired,
    /// We asked the peer to pair and are waiting for its answer.
    PairRequested,
    /// The peer asked us to pair and is waiting for our answer.
    PairRequestedByPeer,
    /// Pairing completed; the identity key is pinned.
    Paired,
}

/// Outcome of processing an inbound pairing-negotiation packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairUpdate {
    /// Both sides agreed; the device is now paired.
    Paired,
    /// The peer requested pairing; a local decision is needed.
    RequestedByPeer,
    /// The peer rejected or revoked pairing.
    Unpaired,
}

/// Persisted credential material for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub device_id: DeviceId,
    /// Base64 identity public key. Pinned once `state` is `Paired`;
    /// before that it is the candidate key from the pending request.
    pub identity_key: String,
    /// Colon-hex SHA-256 fingerprint of the key, for logs and UIs.
    pub fingerprint: String,
    pub state: TrustState,
    /// Seconds since the Unix epoch when pairing completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paired_at_secs: Option<u64>,
}

/// On-disk shape of the trust table.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustTable {
    #[serde(default)]
    records: Vec<TrustRecord>,
}

/// The trust store: per-device pairing state plus pinned identity keys.
///
/// Writes are serialized by the caller holding the store behind one lock;
/// every mutating operation persists before returning.
pub struct TrustStore {
    path: Option<PathBuf>,
    records: HashMap<DeviceId, TrustRecord>,
}

impl TrustStore {
    /// Loads the trust table from `path`, starting empty if the file does
    /// not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Io`] or [`TrustError::Parse`] on unreadable
    /// or corrupt tables.
    pub fn load(path: PathBuf) -> Result<Self, TrustError> {
        let records = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let table: TrustTable = toml::from_str(&content)?;
                table
                    .records
                    .into_iter()
                    .map(|r| (r.device_id.clone(), r))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(TrustError::Io { path, source }),
        };
        Ok(Self {
            path: Some(path),
            records,
        })
    }

    /// Creates a store that never touches the filesystem. Used in tests
    /// and by embedders that persist elsewhere.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: HashMap::new(),
        }
    }

    /// Current pairing state of a device; unknown devices are `Unpaired`.
    pub fn state(&self, device_id: &DeviceId) -> TrustState {
        self.records
            .get(device_id)
            .map(|r| r.state)
            .unwrap_or(TrustState::Unpaired)
    }

    /// Returns `true` when the device has completed pairing.
    pub fn is_trusted(&self, device_id: &DeviceId) -> bool {
        self.state(device_id) == TrustState::Paired
    }

    /// Returns the persisted record for a device, if any.
    pub fn record(&self, device_id: &DeviceId) -> Option<&TrustRecord> {
        self.records.get(device_id)
    }

    /// Starts an outgoing pairing request.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::InvalidState`] when the device is already
    /// paired, or when the peer's own request is pending (answer it with
    /// [`TrustStore::accept_pairing`] instead).
    pub fn request_pairing(&mut self, device_id: &DeviceId) -> Result<(), TrustError> {
        match self.state(device_id) {
            TrustState::Unpaired => {
                self.records.insert(
                    device_id.clone(),
                    TrustRecord {
                        device_id: device_id.clone(),
                        identity_key: String::new(),
                        fingerprint: String::new(),
                        state: TrustState::PairRequested,
                        paired_at_secs: None,
                    },
                );
                self.persist()
            }
            TrustState::PairRequested => Ok(()), // already asked; idempotent
            state => Err(TrustError::InvalidState {
                device_id: device_id.clone(),
                state,
            }),
        }
    }

    /// Accepts a pending incoming pairing request, pinning the candidate
    /// identity key recorded when the request arrived.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::InvalidState`] unless the peer's request is
    /// pending.
    pub fn accept_pairing(&mut self, device_id: &DeviceId) -> Result<(), TrustError> {
        match self.records.get_mut(device_id) {
            Some(record) if record.state == TrustState::PairRequestedByPeer => {
                record.state = TrustState::Paired;
                record.paired_at_secs = Some(now_secs());
                info!(
                    "paired with device {device_id} (key {})",
                    record.fingerprint
                );
                self.persist()
            }
            _ => Err(TrustError::InvalidState {
                device_id: device_id.clone(),
                state: self.state(device_id),
            }),
        }
    }

    /// Rejects a pending pairing request (incoming or our own outgoing).
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::InvalidState`] when the device is paired;
    /// use [`TrustStore::unpair`] for that.
    pub fn reject_pairing(&mut self, device_id: &DeviceId) -> Result<(), TrustError> {
        match self.state(device_id) {
            TrustState::Paired => Err(TrustError::InvalidState {
                device_id: device_id.clone(),
                state: TrustState::Paired,
            }),
            TrustState::Unpaired => Ok(()),
            _ => {
                self.records.remove(device_id);
                self.persist()
            }
        }
    }

    /// Deletes the trust record for a device entirely.
    pub fn unpair(&mut self, device_id: &DeviceId) -> Result<(), TrustError> {
        if self.records.remove(device_id).is_some() {
            info!("unpaired device {device_id}");
            self.persist()?;
        }
        Ok(())
    }

    /// Processes an inbound pairing-negotiation packet from a device whose
    /// link presented `identity_key`.
    ///
    /// `wants_pair == true` either completes our outgoing request (pinning
    /// the key) or records an incoming request awaiting a local decision.
    /// `wants_pair == false` clears any relationship.
    pub fn handle_pair_packet(
        &mut self,
        device_id: &DeviceId,
        identity_key: &str,
        wants_pair: bool,
    ) -> Result<PairUpdate, TrustError> {
        if !wants_pair {
            self.records.remove(device_id);
            self.persist()?;
            return Ok(PairUpdate::Unpaired);
        }

        match self.state(device_id) {
            TrustState::PairRequested => {
                // Peer accepted our request: pin the key it authenticated with.
                self.records.insert(
                    device_id.clone(),
                    TrustRecord {
                        device_id: device_id.clone(),
                        identity_key: identity_key.to_string(),
                        fingerprint: fingerprint_of_base64(identity_key),
                        state: TrustState::Paired,
                        paired_at_secs: Some(now_secs()),
                    },
                );
                info!("pairing accepted by device {device_id}");
                self.persist()?;
                Ok(PairUpdate::Paired)
            }
            TrustState::Paired => Ok(PairUpdate::Paired),
            _ => {
                self.records.insert(
                    device_id.clone(),
                    TrustRecord {
                        device_id: device_id.clone(),
                        identity_key: identity_key.to_string(),
                        fingerprint: fingerprint_of_base64(identity_key),
                        state: TrustState::PairRequestedByPeer,
                        paired_at_secs: None,
                    },
                );
                self.persist()?;
                Ok(PairUpdate::RequestedByPeer)
            }
        }
    }

    /// Checks a connecting device's identity key against the pinned one.
    ///
    /// A mismatch on a `Paired` device demotes it to `Unpaired` (the
    /// record is dropped) and returns [`TrustError::Violation`]; the
    /// caller must refuse the link. Devices without a pinned key pass.
    pub fn verify_identity_key(
        &mut self,
        device_id: &DeviceId,
        identity_key: &str,
    ) -> Result<(), TrustError> {
        let pinned = match self.records.get(device_id) {
            Some(record) if record.state == TrustState::Paired => record.identity_key.clone(),
            _ => return Ok(()),
        };

        if pinned == identity_key {
            return Ok(());
        }

        warn!(
            "identity key mismatch for paired device {device_id}: \
             presented {}, pinned {}",
            fingerprint_of_base64(identity_key),
            fingerprint_of_base64(&pinned),
        );
        self.records.remove(device_id);
        self.persist()?;
        Err(TrustError::Violation {
            device_id: device_id.clone(),
        })
    }

    /// Writes the table to disk, serializing records in a stable order.
    fn persist(&self) -> Result<(), TrustError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut records: Vec<TrustRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        let content = toml::to_string_pretty(&TrustTable { records })?;

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| TrustError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| TrustError::Io {
            path: path.clone(),
            source,
        })
    }
}

/// Fingerprint of a base64 key string, falling back to fingerprinting the
/// raw text when it is not valid base64 (still unique, still loggable).
fn fingerprint_of_base64(key: &str) -> String {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    match BASE64.decode(key) {
        Ok(bytes) => fingerprint(&bytes),
        Err(_) => fingerprint(key.as_bytes()),
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
