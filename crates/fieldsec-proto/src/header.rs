//! Secure frame header with zero-copy parsing.
//!
//! The `SecureHeader` is a fixed 38-byte structure serialized as raw binary
//! (Big Endian). Receivers read the sender, sequence number and tag without
//! touching the payload.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    FrameFlags, ServiceType,
    errors::{ProtocolError, Result},
};

/// Largest value representable in the 48-bit sender and sequence fields
pub const MAX_U48: u64 = (1 << 48) - 1;

/// Fixed 38-byte secure frame header (Big Endian network byte order)
///
/// ```text
///  0      2   3   4        6        8         10            16            22                  38
///  ┌──────┬───┬───┬────────┬────────┬─────────┬─────────────┬─────────────┬───────────────────┐
///  │magic │ver│flg│service │ length │ channel │ sender (48) │ seq (48)    │ tag (16 bytes)    │
///  └──────┴───┴───┴────────┴────────┴─────────┴─────────────┴─────────────┴───────────────────┘
/// ```
///
/// # Security
///
/// The `#[repr(C, packed)]` layout with zerocopy traits makes every 38-byte
/// pattern a valid header, so untrusted datagrams can be cast without
/// undefined behavior. Parsing checks structure only. The tag is verified by
/// the session or group that owns the key, over [`Self::authenticated_bytes`]
/// plus the payload, with the sequence number bound into the MAC input.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SecureHeader {
    magic: [u8; 2],                   // 0x4653 ("FS" in ASCII)
    version: u8,                      // 0x01
    flags: u8,                        // FrameFlags bitfield
    pub(crate) service: [u8; 2],      // u16 service type
    pub(crate) payload_size: [u8; 2], // u16 payload length
    channel_id: [u8; 2],              // u16 session id (unicast) or 0 (multicast)
    sender_id: [u8; 6],               // u48 sender identifier
    sequence: [u8; 6],                // u48 sequence number
    tag: [u8; 16],                    // truncated HMAC-SHA256
}

impl SecureHeader {
    /// Size of the serialized header (38 bytes)
    pub const SIZE: usize = 38;

    /// Magic number: "FS" in ASCII (0x4653)
    pub const MAGIC: u16 = 0x4653;

    /// Current protocol version
    pub const VERSION: u8 = 0x01;

    /// Maximum payload size, chosen so a frame fits one Ethernet MTU
    pub const MAX_PAYLOAD_SIZE: u16 = 1400;

    /// Offset of the tag field
    const TAG_OFFSET: usize = 22;

    /// Create a header for `service` with all other fields zeroed.
    #[must_use]
    pub fn new(service: ServiceType) -> Self {
        Self {
            magic: Self::MAGIC.to_be_bytes(),
            version: Self::VERSION,
            flags: 0,
            service: service.to_u16().to_be_bytes(),
            payload_size: [0; 2],
            channel_id: [0; 2],
            sender_id: [0; 6],
            sequence: [0; 6],
            tag: [0; 16],
        }
    }

    /// Parse header from network bytes (zero-copy, safe)
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooShort` if buffer is shorter than 38 bytes
    /// - `ProtocolError::InvalidMagic` if magic number is invalid
    /// - `ProtocolError::UnsupportedVersion` if protocol version is unsupported
    /// - `ProtocolError::PayloadTooLarge` if payload size exceeds maximum
    ///
    /// The service type is NOT validated here; unknown services are rejected
    /// when the payload is decoded.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if u16::from_be_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        let payload_size = u16::from_be_bytes(header.payload_size);
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize header to bytes (zero-copy)
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let bytes = IntoBytes::as_bytes(self);
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(bytes);
        arr
    }

    /// Header bytes covered by the MAC: the full header with the tag zeroed.
    #[must_use]
    pub fn authenticated_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = self.to_bytes();
        bytes[Self::TAG_OFFSET..].fill(0);
        bytes
    }

    /// Protocol magic number (0x4653 = "FS").
    #[must_use]
    pub fn magic(&self) -> u16 {
        u16::from_be_bytes(self.magic)
    }

    /// Protocol version byte (currently 0x01).
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Header flags.
    #[must_use]
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_byte(self.flags)
    }

    /// Service type as raw u16.
    #[must_use]
    pub fn service(&self) -> u16 {
        u16::from_be_bytes(self.service)
    }

    /// Service type as enum. `None` if unrecognized.
    #[must_use]
    pub fn service_type(&self) -> Option<ServiceType> {
        ServiceType::from_u16(self.service())
    }

    /// Payload size in bytes (max 1400).
    #[must_use]
    pub fn payload_size(&self) -> u16 {
        u16::from_be_bytes(self.payload_size)
    }

    /// Session id for unicast frames, zero for multicast.
    #[must_use]
    pub fn channel_id(&self) -> u16 {
        u16::from_be_bytes(self.channel_id)
    }

    /// 48-bit sender identifier.
    #[must_use]
    pub fn sender_id(&self) -> u64 {
        read_u48(self.sender_id)
    }

    /// 48-bit sequence number bound into the MAC.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        read_u48(self.sequence)
    }

    /// Raw tag field (zero-padded for short tags, all zero if unauthenticated).
    #[must_use]
    pub fn tag(&self) -> &[u8; 16] {
        &self.tag
    }

    /// Tag bytes as announced by the flags: 16, 4 or 0 bytes.
    #[must_use]
    pub fn tag_bytes(&self) -> &[u8] {
        let flags = self.flags();
        if !flags.is_authenticated() {
            &[]
        } else if flags.is_short_tag() {
            &self.tag[..4]
        } else {
            &self.tag
        }
    }

    /// Update header flags.
    pub fn set_flags(&mut self, flags: FrameFlags) {
        self.flags = flags.to_byte();
    }

    /// Set session id.
    pub fn set_channel_id(&mut self, channel_id: u16) {
        self.channel_id = channel_id.to_be_bytes();
    }

    /// Set 48-bit sender identifier.
    pub fn set_sender_id(&mut self, sender_id: u64) {
        debug_assert!(sender_id <= MAX_U48, "sender id {sender_id} exceeds 48 bits");
        self.sender_id = write_u48(sender_id);
    }

    /// Set 48-bit sequence number.
    pub fn set_sequence(&mut self, sequence: u64) {
        debug_assert!(sequence <= MAX_U48, "sequence {sequence} exceeds 48 bits");
        self.sequence = write_u48(sequence);
    }

    /// Set the tag field (computed over [`Self::authenticated_bytes`] and the
    /// payload).
    pub fn set_tag(&mut self, tag: [u8; 16]) {
        self.tag = tag;
    }

    /// Set payload size (kept consistent by [`crate::Frame::new`]).
    pub fn set_payload_size(&mut self, size: u16) {
        self.payload_size = size.to_be_bytes();
    }
}

fn read_u48(bytes: [u8; 6]) -> u64 {
    let mut wide = [0u8; 8];
    wide[2..].copy_from_slice(&bytes);
    u64::from_be_bytes(wide)
}

fn write_u48(value: u64) -> [u8; 6] {
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(&value.to_be_bytes()[2..]);
    bytes
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for SecureHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureHeader")
            .field("magic", &format!("{:#06x}", self.magic()))
            .field("version", &self.version())
            .field("flags", &self.flags())
            .field("service", &format!("{:#06x}", self.service()))
            .field("payload_size", &self.payload_size())
            .field("channel_id", &self.channel_id())
            .field("sender_id", &format!("{:#014x}", self.sender_id()))
            .field("sequence", &self.sequence())
            .finish_non_exhaustive()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for SecureHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for SecureHeader {}
