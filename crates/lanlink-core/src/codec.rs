//! Line-delimited packet codec.
//!
//! Wire format: each packet is one JSON object terminated by `\n`. The
//! newline is the record boundary marker, so a stream reader that hits a
//! malformed record can discard up to the next newline and resynchronize.
//!
//! Unknown `type` identifiers are *not* a decode error: the record decodes
//! successfully and the router decides what to do with it (usually: find no
//! matching plugin and drop it). Schema validation of body fields is a
//! plugin concern, not a codec concern.

use thiserror::Error;

use crate::packet::Packet;

/// Upper bound on a single encoded record, including the newline.
/// Anything larger is treated as malformed rather than buffered forever.
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;

/// Errors produced while encoding or decoding packet records.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    /// The record is not a structurally valid packet.
    #[error("malformed packet record: {0}")]
    Malformed(String),

    /// The record exceeds [`MAX_RECORD_BYTES`] without a record boundary.
    #[error("record of {size} bytes exceeds the {limit}-byte limit")]
    Oversized { size: usize, limit: usize },
}

/// Encodes a packet as one newline-terminated JSON record.
///
/// Encoding is deterministic for a given packet value.
///
/// # Errors
///
/// Returns [`DecodeError::Malformed`] if the packet cannot be serialized
/// (cannot happen for packets built through [`Packet`] constructors, but
/// the error is propagated rather than swallowed).
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, DecodeError> {
    let mut bytes =
        serde_json::to_vec(packet).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decodes a single packet record.
///
/// Accepts the record with or without its trailing newline.
///
/// # Errors
///
/// Returns [`DecodeError::Malformed`] on broken JSON or a record that is
/// not a packet object, and [`DecodeError::Oversized`] for records over
/// [`MAX_RECORD_BYTES`].
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, DecodeError> {
    if bytes.len() > MAX_RECORD_BYTES {
        return Err(DecodeError::Oversized {
            size: bytes.len(),
            limit: MAX_RECORD_BYTES,
        });
    }
    let record = match bytes.last() {
        Some(b'\n') => &bytes[..bytes.len() - 1],
        _ => bytes,
    };
    serde_json::from_slice(record).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Incremental decoder over a byte stream.
///
/// Feed arbitrary chunks with [`StreamDecoder::extend`], then drain
/// complete records with [`StreamDecoder::next_packet`]. A malformed
/// record consumes input up to its newline, so the next call starts at a
/// record boundary. An over-long record without a newline switches the
/// decoder into skip mode until the next boundary arrives.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
    skipping: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes received from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempts to decode the next complete record.
    ///
    /// Returns `None` when no full record is buffered yet. Malformed and
    /// oversized records are returned as errors; the decoder remains usable
    /// and resynchronizes on the following record.
    pub fn next_packet(&mut self) -> Option<Result<Packet, DecodeError>> {
        loop {
            let newline = self.buf.iter().position(|&b| b == b'\n');

            if self.skipping {
                match newline {
                    Some(pos) => {
                        self.buf.drain(..=pos);
                        self.skipping = false;
                        continue;
                    }
                    None => {
                        self.buf.clear();
                        return None;
                    }
                }
            }

            match newline {
                Some(pos) => {
                    let line: Vec<u8> = self.buf.drain(..=pos).collect();
                    // Tolerate blank keep-alive lines between records.
                    if line.iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }
                    return Some(decode_packet(&line));
                }
                None if self.buf.len() > MAX_RECORD_BYTES => {
                    let size = self.buf.len();
                    self.buf.clear();
                    self.skipping = true;
                    return Some(Err(DecodeError::Oversized {
                        size,
                        limit: MAX_RECORD_BYTES,
                    }));
                }
                None => return None,
            }
        }
    }
}
