//! Device identity metadata.
//!
//! The same metadata travels in two places: as the body of the UDP
//! discovery announcement and as the first (cleartext) record on a fresh
//! connection. It names the device, advertises its capabilities, and
//! carries the long-term identity public key the encrypted upgrade is
//! authenticated against.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::packet::{Packet, PACKET_TYPE_IDENTITY, PROTOCOL_VERSION};

/// Stable, opaque device identifier.
///
/// Generated once per installation; peers treat it as an opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Generates a fresh random device id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of device, as advertised in announcements.
///
/// Unknown wire strings decode as [`DeviceType::Desktop`] so newer device
/// kinds do not break older peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
    Tv,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }
}

impl From<String> for DeviceType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "mobile" => DeviceType::Mobile,
            "tablet" => DeviceType::Tablet,
            "tv" => DeviceType::Tv,
            _ => DeviceType::Desktop,
        }
    }
}

impl From<DeviceType> for String {
    fn from(t: DeviceType) -> Self {
        t.as_str().to_string()
    }
}

/// Error produced when an identity packet cannot be interpreted.
#[derive(Debug, Error, PartialEq)]
pub enum IdentityError {
    /// The packet's type identifier is not `lanlink.identity`.
    #[error("expected identity packet, got type {0:?}")]
    WrongType(String),

    /// The body is missing a required field or a field has the wrong shape.
    #[error("invalid identity body: {0}")]
    InvalidBody(String),
}

/// Identity metadata describing one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Stable unique identifier of the device.
    pub device_id: DeviceId,

    /// Human-readable display name.
    pub device_name: String,

    /// Kind of device.
    pub device_type: DeviceType,

    /// Protocol version the device speaks; currently [`PROTOCOL_VERSION`].
    pub protocol_version: u32,

    /// TCP port the device accepts link connections on.
    pub tcp_port: u16,

    /// Capability identifiers the device can receive.
    #[serde(default)]
    pub incoming_capabilities: Vec<String>,

    /// Capability identifiers the device can send.
    #[serde(default)]
    pub outgoing_capabilities: Vec<String>,

    /// Base64 x25519 identity public key used to authenticate the
    /// encrypted upgrade.
    pub identity_key: String,
}

impl DeviceInfo {
    /// Serializes this metadata as an identity packet.
    pub fn to_packet(&self) -> Packet {
        // DeviceInfo serializes to a JSON object by construction.
        let body = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        Packet::new(PACKET_TYPE_IDENTITY, body)
    }

    /// Interprets an identity packet received from a peer.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::WrongType`] for any other packet type and
    /// [`IdentityError::InvalidBody`] when required fields are missing.
    pub fn from_packet(packet: &Packet) -> Result<Self, IdentityError> {
        if !packet.is_identity() {
            return Err(IdentityError::WrongType(packet.packet_type.clone()));
        }
        serde_json::from_value(Value::Object(packet.body.clone()))
            .map_err(|e| IdentityError::InvalidBody(e.to_string()))
    }

    /// Returns `true` if the device advertises `capability` in its
    /// outgoing list.
    pub fn sends(&self, capability: &str) -> bool {
        self.outgoing_capabilities.iter().any(|c| c == capability)
    }

    /// Returns `true` if the device advertises `capability` in its
    /// incoming list.
    pub fn receives(&self, capability: &str) -> bool {
        self.incoming_capabilities.iter().any(|c| c == capability)
    }
}
