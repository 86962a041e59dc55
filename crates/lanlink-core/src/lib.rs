//! # lanlink-core
//!
//! Shared library for LanLink containing the packet protocol codec, device
//! identity types, and the link session cryptography.
//!
//! This crate is used by every peer on a LanLink network; both ends of a
//! link run the same symmetric protocol. It has zero dependencies on OS
//! APIs, network sockets, or engine state.
//!
//! - **`packet`** – The typed packet envelope: a capability type identifier,
//!   a millisecond timestamp, and a JSON body, with an optional descriptor
//!   for out-of-band binary payloads.
//!
//! - **`codec`** – How packets travel over the wire. Each packet is one
//!   newline-terminated, self-describing JSON record; the stream decoder can
//!   resynchronize on the next record boundary after a malformed record.
//!
//! - **`identity`** – Device identity metadata exchanged in discovery
//!   announcements and the link handshake: stable device id, display name,
//!   device type, capability lists, and the long-term identity public key.
//!
//! - **`crypto`** – The encrypted channel. Long-term x25519 identity keys,
//!   per-link ECDH, and a direction-scoped ChaCha20-Poly1305 session cipher.

pub mod codec;
pub mod crypto;
pub mod identity;
pub mod packet;

pub use codec::{decode_packet, encode_packet, DecodeError, StreamDecoder};
pub use crypto::{derive_session, CryptoError, IdentityKeypair, LinkRole};
pub use identity::{DeviceId, DeviceInfo, DeviceType};
pub use packet::{Packet, PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR, PROTOCOL_VERSION};
