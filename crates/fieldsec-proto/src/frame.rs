//! Frame type combining header and payload.
//!
//! A `Frame` is the datagram-layer packet consisting of:
//! - 38-byte raw binary header (Big Endian)
//! - Variable-length raw payload bytes (already encoded)
//!
//! This is a pure data holder. For typed payloads see `Payload::into_frame()`
//! and `Payload::from_frame()`.

use bytes::{BufMut, Bytes};

use crate::{
    SecureHeader,
    errors::{ProtocolError, Result},
};

/// Complete secure frame
///
/// Layout on the wire:
/// `[SecureHeader: 38 bytes, raw binary] + [payload: variable bytes]`
///
/// # Invariants
///
/// - Size Consistency: `payload.len()` MUST match `header.payload_size()`.
///   Enforced by [`Frame::new`] and verified by [`Frame::decode`].
///
/// - Size Limit: `payload.len()` MUST NOT exceed
///   [`SecureHeader::MAX_PAYLOAD_SIZE`]. Violations are rejected during
///   encoding and decoding.
///
/// # Security
///
/// Provides structural validity only. A decoded frame has a well-formed
/// header and the announced number of payload bytes; its tag has NOT been
/// verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header (38 bytes)
    pub header: SecureHeader,

    /// Raw payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with automatic `payload_size` calculation.
    ///
    /// Payloads longer than `u16::MAX` saturate the size field and are
    /// rejected by [`Frame::encode`].
    #[must_use]
    pub fn new(mut header: SecureHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let payload_len = u16::try_from(payload.len()).unwrap_or(u16::MAX);

        header.payload_size = payload_len.to_be_bytes();

        Self { header, payload }
    }

    /// Bytes covered by the frame MAC: header with zeroed tag, then payload.
    #[must_use]
    pub fn authenticated_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(SecureHeader::SIZE + self.payload.len());
        data.extend_from_slice(&self.header.authenticated_bytes());
        data.extend_from_slice(&self.payload);
        data
    }

    /// Encode frame into buffer.
    ///
    /// Writes: `[header (38 bytes)] + [payload (variable)]`
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if payload exceeds
    ///   `MAX_PAYLOAD_SIZE` (1400 bytes)
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.payload.len() > SecureHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: SecureHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        debug_assert_eq!(self.payload.len(), self.header.payload_size() as usize);

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Encode into a fresh buffer, ready to hand to a datagram socket.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` as [`Frame::encode`]
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(SecureHeader::SIZE + self.payload.len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode frame from wire format
    ///
    /// Returns a Frame with raw bytes (does NOT decode the payload).
    ///
    /// # Errors
    ///
    /// - `ProtocolError` if header parsing fails (invalid magic, version, or
    ///   size limits)
    /// - `ProtocolError::FrameTruncated` if payload is shorter than the header
    ///   claims
    ///
    /// # Security
    ///
    /// - Exact Size: Only `payload_size` bytes are read. Trailing datagram
    ///   bytes are ignored and never reach the MAC.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = SecureHeader::from_bytes(bytes)?;

        let payload_size = header.payload_size() as usize;
        let total_size = SecureHeader::SIZE + payload_size;

        let Some(payload) = bytes.get(SecureHeader::SIZE..total_size) else {
            #[cfg_attr(not(fuzzing), allow(unexpected_cfgs))]
            #[cfg(fuzzing)]
            {
                let _ = payload_size; // Proves we hit this branch
            }

            return Err(ProtocolError::FrameTruncated {
                expected: payload_size,
                actual: bytes.len().saturating_sub(SecureHeader::SIZE),
            });
        };

        Ok(Self { header: *header, payload: Bytes::copy_from_slice(payload) })
    }
}
