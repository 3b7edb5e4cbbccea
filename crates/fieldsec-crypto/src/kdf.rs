//! Password-based key derivation for role keys using PBKDF2-HMAC-SHA256

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Size of every role, group and session key (16 bytes)
pub const KEY_SIZE: usize = 16;

/// PBKDF2 iteration count for role keys.
///
/// Fixed by the protocol: both ends of a session must derive the same key
/// from the same password, so this value can never be tuned per deployment.
pub const KDF_ITERATIONS: u32 = 65_536;

/// Salt used when a role key is derived without a deployment-specific salt.
///
/// Gateways and tools derive user keys from the user password with this salt,
/// which makes the derivation reproducible on both sides of a handshake.
pub const DEFAULT_ROLE_SALT: &[u8] = b"fieldsec.default-salt.v1";

/// Domain separation label prepended to every role-key salt
const KDF_LABEL: &[u8] = b"fieldsec.kdf.v1";

/// Role a symmetric key is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyRole {
    /// Shared key of a secure multicast group
    Group,
    /// Key of a tunnelling user, identified by its user id
    User(u8),
    /// Device authentication key of a gateway
    DeviceAuthentication,
}

impl KeyRole {
    const GROUP: u8 = 0x00;
    const USER: u8 = 0x01;
    const DEVICE: u8 = 0x02;

    /// Two-byte wire encoding: `[kind, user_id]`.
    ///
    /// Used as role binding in salts, keyring AAD and handshake transcripts.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 2] {
        match self {
            Self::Group => [Self::GROUP, 0],
            Self::User(id) => [Self::USER, id],
            Self::DeviceAuthentication => [Self::DEVICE, 0],
        }
    }

    /// Parse the two-byte encoding. `None` for unknown kinds or a non-zero
    /// user byte on a role that has no user id.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 2]) -> Option<Self> {
        match bytes {
            [Self::GROUP, 0] => Some(Self::Group),
            [Self::USER, id] => Some(Self::User(id)),
            [Self::DEVICE, 0] => Some(Self::DeviceAuthentication),
            _ => None,
        }
    }
}

impl std::fmt::Display for KeyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Group => write!(f, "group"),
            Self::User(id) => write!(f, "user:{id}"),
            Self::DeviceAuthentication => write!(f, "device-authentication"),
        }
    }
}

/// A 16-byte symmetric key scoped to one role.
///
/// Cloning copies the key; every copy zeroizes its buffer when dropped.
/// Equality is evaluated in constant time.
#[derive(Clone)]
pub struct DerivedKey {
    key: [u8; KEY_SIZE],
}

impl DerivedKey {
    /// Wrap raw key bytes (e.g. a group key read from the keyring).
    #[must_use]
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Raw key bytes.
    ///
    /// Only for feeding MAC/KDF primitives. Never log the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl PartialEq for DerivedKey {
    fn eq(&self, other: &Self) -> bool {
        self.key[..].ct_eq(&other.key[..]).into()
    }
}

impl Eq for DerivedKey {}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Derive a role key from a password and salt.
///
/// PBKDF2-HMAC-SHA256 with [`KDF_ITERATIONS`] rounds over
/// `label || role || salt`. Pure: no I/O, no randomness. Identical inputs
/// always yield the identical key, and changing the password, the salt or the
/// role changes the output.
pub fn derive_key(password: &str, salt: &[u8], role: KeyRole) -> DerivedKey {
    // Capacity: 15 (label) + 2 (role) + salt
    let mut salt_input = Vec::with_capacity(KDF_LABEL.len() + 2 + salt.len());
    salt_input.extend_from_slice(KDF_LABEL);
    salt_input.extend_from_slice(&role.to_bytes());
    salt_input.extend_from_slice(salt);

    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt_input, KDF_ITERATIONS, &mut key);

    DerivedKey { key }
}

/// Derive a role key with the protocol's [`DEFAULT_ROLE_SALT`].
pub fn derive_role_key(password: &str, role: KeyRole) -> DerivedKey {
    derive_key(password, DEFAULT_ROLE_SALT, role)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_produces_16_byte_key() {
        let key = derive_key("password", b"salt", KeyRole::Group);
        assert_eq!(key.as_bytes().len(), KEY_SIZE);
    }

    #[test]
    fn derive_is_deterministic() {
        let key1 = derive_key("hunter2", b"salt", KeyRole::User(1));
        let key2 = derive_key("hunter2", b"salt", KeyRole::User(1));

        assert_eq!(key1, key2, "same inputs must produce same output");
    }

    #[test]
    fn known_answer_user_key() {
        let key = derive_role_key("correct horse battery staple", KeyRole::User(1));
        assert_eq!(hex::encode(key.as_bytes()), "4d22099e8d15dbcbe8967b0dff99c084");
    }

    #[test]
    fn known_answer_empty_inputs() {
        let key = derive_key("", b"", KeyRole::Group);
        assert_eq!(hex::encode(key.as_bytes()), "7d5eeecffd16c05f818e3e62895a1659");
    }

    #[test]
    fn different_passwords_produce_different_keys() {
        let key_a = derive_key("password-a", b"salt", KeyRole::User(1));
        let key_b = derive_key("password-b", b"salt", KeyRole::User(1));

        assert_ne!(key_a, key_b);
    }

    #[test]
    fn different_salts_produce_different_keys() {
        let key_a = derive_key("password", b"salt-a", KeyRole::User(1));
        let key_b = derive_key("password", b"salt-b", KeyRole::User(1));

        assert_ne!(key_a, key_b);
    }

    #[test]
    fn different_roles_produce_different_keys() {
        let user1 = derive_key("password", b"salt", KeyRole::User(1));
        let user2 = derive_key("password", b"salt", KeyRole::User(2));
        let device = derive_key("password", b"salt", KeyRole::DeviceAuthentication);

        assert_ne!(user1, user2, "user id must scope the key");
        assert_ne!(user1, device, "role kind must scope the key");
    }

    #[test]
    fn role_bytes_round_trip() {
        for role in [KeyRole::Group, KeyRole::User(0), KeyRole::User(127), KeyRole::DeviceAuthentication]
        {
            assert_eq!(KeyRole::from_bytes(role.to_bytes()), Some(role));
        }
    }

    #[test]
    fn role_rejects_unknown_encodings() {
        assert_eq!(KeyRole::from_bytes([0x03, 0]), None);
        assert_eq!(KeyRole::from_bytes([0x00, 7]), None, "group carries no user id");
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = DerivedKey::from_bytes([0xAB; KEY_SIZE]);
        let rendered = format!("{key:?}");

        assert!(!rendered.contains("ab"), "debug output leaked key bytes: {rendered}");
        assert!(!rendered.contains("171"), "debug output leaked key bytes: {rendered}");
    }
}
