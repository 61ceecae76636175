// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Packet framing for the handoff byte stream.
//!
//! Packet layout:
//!
//! ``MAGIC(4) || VERSION(2) || FLAGS(2) || LENGTH(4) || PAYLOAD || CHECKSUM(32)``
//!
//! * PAYLOAD is one JSON-encoded [`TransportEvent`]
//! * CHECKSUM = blake3-256 over HEADER (first 12 bytes) || PAYLOAD

use blake3::Hasher;

use crate::TransportEvent;

/// Protocol magic constant "RPLY".
pub const MAGIC: [u8; 4] = [0x52, 0x50, 0x4c, 0x59];
/// Wire protocol version (big-endian u16).
pub const VERSION: u16 = 0x0001;
/// Reserved flags (set to zero for v1).
pub const FLAGS: u16 = 0x0000;
/// Header length in bytes.
pub const HEADER_BYTES: usize = 12;
/// Checksum length in bytes.
pub const CHECKSUM_BYTES: usize = 32;
/// Default ceiling on a single payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 8 * 1024 * 1024;

/// Framing errors.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Not enough bytes buffered for a full packet.
    #[error("incomplete packet")]
    Incomplete,
    /// Header does not start with [`MAGIC`].
    #[error("bad magic")]
    BadMagic,
    /// Header carries an unknown version.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    /// Checksum over header||payload did not match.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// Declared payload exceeds the configured ceiling.
    #[error("payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge {
        /// Declared length.
        len: usize,
        /// Ceiling.
        max: usize,
    },
    /// Payload was not a valid event.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A full packet (header + payload + checksum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw header (12 bytes).
    pub header: [u8; HEADER_BYTES],
    /// JSON payload bytes.
    pub payload: Vec<u8>,
    /// blake3 checksum over header||payload.
    pub checksum: [u8; CHECKSUM_BYTES],
}

impl Packet {
    /// Build a packet around a payload.
    ///
    /// Fails when the payload does not fit the 32-bit length field.
    pub fn from_payload(payload: Vec<u8>) -> Result<Self, WireError> {
        let mut header = [0u8; HEADER_BYTES];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_be_bytes());
        header[6..8].copy_from_slice(&FLAGS.to_be_bytes());
        header[8..12].copy_from_slice(&length_field(payload.len())?.to_be_bytes());

        let checksum = checksum(&header, &payload);
        Ok(Self {
            header,
            payload,
            checksum,
        })
    }

    /// Concatenate header, payload and checksum.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_BYTES + self.payload.len() + CHECKSUM_BYTES);
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.checksum);
        out
    }
}

fn length_field(len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::PayloadTooLarge {
        len,
        max: usize::try_from(u32::MAX).unwrap_or(usize::MAX),
    })
}

fn checksum(header: &[u8], payload: &[u8]) -> [u8; CHECKSUM_BYTES] {
    let mut hasher = Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

/// Encode one event as a packet.
pub fn encode_event(event: &TransportEvent) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(event)?;
    Ok(Packet::from_payload(payload)?.into_bytes())
}

/// Declared payload length of a buffered header, if 12 bytes are available.
pub fn peek_payload_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < HEADER_BYTES {
        return None;
    }
    Some(u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize)
}

/// Decode one packet from the front of `bytes`, returning the event and bytes consumed.
pub fn decode_event(bytes: &[u8]) -> Result<(TransportEvent, usize), WireError> {
    let len = peek_payload_len(bytes).ok_or(WireError::Incomplete)?;
    if bytes[0..4] != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let total = HEADER_BYTES + len + CHECKSUM_BYTES;
    if bytes.len() < total {
        return Err(WireError::Incomplete);
    }
    let header = &bytes[..HEADER_BYTES];
    let payload = &bytes[HEADER_BYTES..HEADER_BYTES + len];
    let sum = &bytes[HEADER_BYTES + len..total];
    if checksum(header, payload)[..] != *sum {
        return Err(WireError::ChecksumMismatch);
    }
    let event = serde_json::from_slice(payload)?;
    Ok((event, total))
}

/// Accumulates arbitrary byte chunks and yields whole events.
///
/// Short reads never desynchronize framing: bytes stay buffered until a full
/// packet is present.
#[derive(Debug)]
pub struct FrameDecoder {
    acc: Vec<u8>,
    max_payload: usize,
}

impl FrameDecoder {
    /// Decoder with [`DEFAULT_MAX_PAYLOAD`].
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Decoder with a custom payload ceiling.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            acc: Vec::with_capacity(32 * 1024),
            max_payload,
        }
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.acc.len()
    }

    /// Append `chunk` and decode every complete packet.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<TransportEvent>, WireError> {
        self.acc.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(len) = peek_payload_len(&self.acc) {
            if len > self.max_payload {
                return Err(WireError::PayloadTooLarge {
                    len,
                    max: self.max_payload,
                });
            }
            if self.acc.len() < HEADER_BYTES + len + CHECKSUM_BYTES {
                break;
            }
            let (event, used) = decode_event(&self.acc)?;
            self.acc.drain(..used);
            out.push(event);
        }
        Ok(out)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// --- Unit tests -----------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{OperationDescriptor, TransferId};
    use proptest::prelude::*;
    use serde_json::json;

    fn sample_events() -> Vec<TransportEvent> {
        vec![
            TransportEvent::Started {
                id: TransferId(1),
                operation: OperationDescriptor::new("Q").with_id("q1"),
            },
            TransportEvent::Value {
                id: "v".into(),
                value: json!({"k": [1, 2, 3]}),
            },
            TransportEvent::Complete { id: TransferId(1) },
        ]
    }

    #[test]
    fn rejects_tampered_payload() {
        let mut bytes = encode_event(&TransportEvent::Complete { id: TransferId(3) }).unwrap();
        bytes[HEADER_BYTES] ^= 0x01;
        assert!(matches!(
            decode_event(&bytes),
            Err(WireError::ChecksumMismatch)
        ));
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut bytes = encode_event(&TransportEvent::Complete { id: TransferId(3) }).unwrap();
        bytes[0] = b'X';
        assert!(matches!(decode_event(&bytes), Err(WireError::BadMagic)));

        let mut bytes = encode_event(&TransportEvent::Complete { id: TransferId(3) }).unwrap();
        bytes[5] = 9;
        assert!(matches!(
            decode_event(&bytes),
            Err(WireError::UnsupportedVersion(9))
        ));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn length_field_rejects_payloads_past_u32() {
        assert_eq!(length_field(7).unwrap(), 7);
        assert_eq!(length_field(u32::MAX as usize).unwrap(), u32::MAX);
        let len = u32::MAX as usize + 1;
        assert!(matches!(
            length_field(len),
            Err(WireError::PayloadTooLarge { len: got, max }) if got == len && max == u32::MAX as usize
        ));
    }

    #[test]
    fn decoder_rejects_oversize_before_buffering_payload() {
        let bytes = encode_event(&TransportEvent::Value {
            id: "big".into(),
            value: json!("x".repeat(64)),
        })
        .unwrap();
        let mut dec = FrameDecoder::with_max_payload(16);
        assert!(matches!(
            dec.push(&bytes[..HEADER_BYTES]),
            Err(WireError::PayloadTooLarge { max: 16, .. })
        ));
    }

    proptest! {
        #[test]
        fn decoder_is_chunking_invariant(split in prop::collection::vec(1usize..17, 1..64)) {
            let events = sample_events();
            let mut stream = Vec::new();
            for ev in &events {
                stream.extend(encode_event(ev).unwrap());
            }
            let mut dec = FrameDecoder::new();
            let mut out = Vec::new();
            let mut rest: &[u8] = &stream;
            let mut sizes = split.iter().cycle();
            while !rest.is_empty() {
                let n = (*sizes.next().unwrap()).min(rest.len());
                out.extend(dec.push(&rest[..n]).unwrap());
                rest = &rest[n..];
            }
            prop_assert_eq!(out, events);
            prop_assert_eq!(dec.buffered(), 0);
        }
    }
}
