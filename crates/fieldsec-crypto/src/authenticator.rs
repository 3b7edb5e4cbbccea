//! Frame authentication with sequence-bound HMAC-SHA256 tags
//!
//! # Security Properties
//!
//! - Sequence Binding: The 48-bit sequence number is part of the MAC input.
//!   A captured frame re-stamped with a different sequence number no longer
//!   verifies, so freshness and authenticity cannot be checked separately.
//! - Constant Time: Tag verification uses `hmac`'s constant-time comparison.
//! - Truncation: Tags are the left-most bytes of the HMAC output, 16 bytes by
//!   default or 4 bytes for the short profile.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::kdf::DerivedKey;

type HmacSha256 = Hmac<Sha256>;

/// Width of the tag field on the wire (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Largest sequence number representable in 48 bits
pub const MAX_SEQUENCE: u64 = (1 << 48) - 1;

/// Domain separation label for frame MACs
const FRAME_MAC_LABEL: &[u8] = b"fieldsec.frame-mac.v1";

/// Tag width profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MacProfile {
    /// 16-byte tags (default)
    #[default]
    Full,
    /// 4-byte tags for bandwidth-constrained links
    Short,
}

impl MacProfile {
    /// Tag length in bytes.
    #[must_use]
    pub const fn tag_len(self) -> usize {
        match self {
            Self::Full => TAG_SIZE,
            Self::Short => 4,
        }
    }

    /// Profile for a received tag length. `None` for unsupported widths.
    #[must_use]
    pub const fn from_tag_len(len: usize) -> Option<Self> {
        match len {
            TAG_SIZE => Some(Self::Full),
            4 => Some(Self::Short),
            _ => None,
        }
    }
}

/// A truncated authentication tag.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    bytes: [u8; TAG_SIZE],
    profile: MacProfile,
}

impl Tag {
    /// Tag bytes (4 or 16 depending on profile).
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.profile.tag_len()]
    }

    /// Profile this tag was produced with.
    #[must_use]
    pub fn profile(&self) -> MacProfile {
        self.profile
    }

    /// Fixed-width wire representation, zero-padded for short tags.
    #[must_use]
    pub fn to_wire(&self) -> [u8; TAG_SIZE] {
        self.bytes
    }
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tag({:?}, ", self.profile)?;
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Compute a full-width tag over `frame` for `sequence`.
pub fn mac(key: &DerivedKey, sequence: u64, frame: &[u8]) -> Tag {
    mac_with_profile(key, sequence, frame, MacProfile::Full)
}

/// Compute a tag truncated to `profile`.
pub fn mac_with_profile(key: &DerivedKey, sequence: u64, frame: &[u8], profile: MacProfile) -> Tag {
    let output = keyed_mac(key, sequence, frame).finalize().into_bytes();

    let mut bytes = [0u8; TAG_SIZE];
    let len = profile.tag_len();
    bytes[..len].copy_from_slice(&output[..len]);

    Tag { bytes, profile }
}

/// Verify `tag` over `frame` for `sequence`.
///
/// The tag width selects the profile; widths other than 4 or 16 bytes never
/// verify. Comparison is constant time.
pub fn verify(key: &DerivedKey, sequence: u64, frame: &[u8], tag: &[u8]) -> bool {
    if MacProfile::from_tag_len(tag.len()).is_none() {
        return false;
    }

    keyed_mac(key, sequence, frame).verify_truncated_left(tag).is_ok()
}

/// HMAC state over `label || sequence (6 bytes BE) || len (4 bytes BE) || frame`.
fn keyed_mac(key: &DerivedKey, sequence: u64, frame: &[u8]) -> HmacSha256 {
    debug_assert!(sequence <= MAX_SEQUENCE, "sequence {sequence} exceeds 48 bits");

    let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };

    mac.update(FRAME_MAC_LABEL);
    mac.update(&sequence.to_be_bytes()[2..]);
    mac.update(&(frame.len() as u32).to_be_bytes());
    mac.update(frame);
    mac
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::KEY_SIZE;

    fn test_key() -> DerivedKey {
        let mut key = [0u8; KEY_SIZE];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        DerivedKey::from_bytes(key)
    }

    #[test]
    fn known_answer_full_tag() {
        let tag = mac(&test_key(), 5, b"abc");
        assert_eq!(hex::encode(tag.as_bytes()), "55961bcd6acb368b8092b7325e6ad44b");
    }

    #[test]
    fn short_tag_is_prefix_of_full_tag() {
        let full = mac(&test_key(), 5, b"abc");
        let short = mac_with_profile(&test_key(), 5, b"abc", MacProfile::Short);

        assert_eq!(hex::encode(short.as_bytes()), "55961bcd");
        assert_eq!(short.as_bytes(), &full.as_bytes()[..4]);
        assert_eq!(&short.to_wire()[4..], &[0u8; 12]);
    }

    #[test]
    fn verify_accepts_valid_tag() {
        let key = test_key();
        let tag = mac(&key, 42, b"frame bytes");

        assert!(verify(&key, 42, b"frame bytes", tag.as_bytes()));
    }

    #[test]
    fn verify_accepts_valid_short_tag() {
        let key = test_key();
        let tag = mac_with_profile(&key, 42, b"frame bytes", MacProfile::Short);

        assert!(verify(&key, 42, b"frame bytes", tag.as_bytes()));
    }

    #[test]
    fn verify_rejects_other_sequence() {
        let key = test_key();
        let tag = mac(&key, 42, b"frame bytes");

        assert!(!verify(&key, 43, b"frame bytes", tag.as_bytes()));
        assert!(!verify(&key, 41, b"frame bytes", tag.as_bytes()));
    }

    #[test]
    fn verify_rejects_tampered_frame() {
        let key = test_key();
        let tag = mac(&key, 1, b"frame bytes");

        assert!(!verify(&key, 1, b"frame bytez", tag.as_bytes()));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let tag = mac(&test_key(), 1, b"frame");
        let other = DerivedKey::from_bytes([0xFF; KEY_SIZE]);

        assert!(!verify(&other, 1, b"frame", tag.as_bytes()));
    }

    #[test]
    fn verify_rejects_unsupported_tag_widths() {
        let key = test_key();
        let tag = mac(&key, 1, b"frame");

        assert!(!verify(&key, 1, b"frame", &[]));
        assert!(!verify(&key, 1, b"frame", &tag.as_bytes()[..8]));
    }

    #[test]
    fn max_sequence_is_accepted() {
        let key = test_key();
        let tag = mac(&key, MAX_SEQUENCE, b"frame");

        assert!(verify(&key, MAX_SEQUENCE, b"frame", tag.as_bytes()));
    }
}
