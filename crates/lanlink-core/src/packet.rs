//! The LanLink packet envelope.
//!
//! Every message exchanged over a link is a `Packet`: a capability type
//! identifier, a millisecond timestamp, and a JSON body whose schema is
//! owned by the plugin that consumes it. Packets are immutable once
//! constructed. Large binary attachments are never inlined in the body;
//! they are referenced through the optional payload descriptor and
//! transferred out of band.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current protocol version advertised in identity packets.
pub const PROTOCOL_VERSION: u32 = 1;

/// Type identifier of the identity/upgrade handshake packet.
pub const PACKET_TYPE_IDENTITY: &str = "lanlink.identity";

/// Type identifier of the pairing-negotiation packet.
///
/// This is the only packet type accepted from a device that is not paired;
/// it is how trust is established in the first place.
pub const PACKET_TYPE_PAIR: &str = "lanlink.pair";

/// A typed packet exchanged over a link.
///
/// Wire form (one JSON record per line):
///
/// ```text
/// {"id":1716000000000,"type":"runcommand","body":{"request":"list"}}
/// ```
///
/// Unrecognized body fields are preserved and ignored, so older peers can
/// talk to newer ones without renegotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Millisecond Unix timestamp at construction time. Informative only;
    /// receivers must not assume cross-device clock agreement.
    pub id: i64,

    /// Capability identifier naming the packet family (e.g. `"runcommand"`).
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Named fields carrying the packet's content.
    #[serde(default)]
    pub body: Map<String, Value>,

    /// Size in bytes of the out-of-band binary payload, if any.
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<u64>,

    /// Transport information for fetching the out-of-band payload
    /// (side-channel port, transfer id). Opaque to the dispatch core.
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<Map<String, Value>>,
}

impl Packet {
    /// Creates a packet of the given type with the current time as its id.
    pub fn new(packet_type: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            id: now_millis(),
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Creates a packet with an empty body.
    pub fn empty(packet_type: impl Into<String>) -> Self {
        Self::new(packet_type, Map::new())
    }

    /// Attaches an out-of-band payload descriptor.
    pub fn with_payload(mut self, size: u64, transfer_info: Map<String, Value>) -> Self {
        self.payload_size = Some(size);
        self.payload_transfer_info = Some(transfer_info);
        self
    }

    /// Returns `true` for the identity/upgrade handshake packet type.
    pub fn is_identity(&self) -> bool {
        self.packet_type == PACKET_TYPE_IDENTITY
    }

    /// Returns `true` for the pairing-negotiation packet type.
    pub fn is_pair(&self) -> bool {
        self.packet_type == PACKET_TYPE_PAIR
    }

    /// Returns a string body field, if present and a string.
    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Returns a boolean body field, if present and a boolean.
    pub fn body_bool(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(Value::as_bool)
    }

    /// Returns an integer body field, if present and an integer.
    pub fn body_i64(&self, key: &str) -> Option<i64> {
        self.body.get(key).and_then(Value::as_i64)
    }

    /// Returns a nested-mapping body field, if present and an object.
    pub fn body_object(&self, key: &str) -> Option<&Map<String, Value>> {
        self.body.get(key).and_then(Value::as_object)
    }
}

/// Milliseconds since the Unix epoch, saturating at 0 for clocks set
/// before 1970.
fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
