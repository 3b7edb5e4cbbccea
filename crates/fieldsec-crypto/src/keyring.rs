//! Encrypted keyring container
//!
//! A keyring is a CBOR document holding one sealed entry per role. Unlocking
//! derives a master key from the keyring password, checks it against an
//! embedded check value, then opens every entry.
//!
//! # Format
//!
//! ```text
//! KeyringFile {
//!     version:  u16,                 // KEYRING_FORMAT_VERSION
//!     kdf_salt: [u8; 16],            // PBKDF2 salt for the master key
//!     check:    [u8; 16],            // HMAC(master, label || kdf_salt)[..16]
//!     entries:  [EntryRecord],
//! }
//!
//! EntryRecord {
//!     role:       [u8; 2],           // KeyRole::to_bytes
//!     salt:       [u8; 16],          // HKDF salt for this entry
//!     ciphertext: [u8],              // XChaCha20-Poly1305, AAD = role
//!     tag:        [u8; 16],          // detached Poly1305 tag
//! }
//! ```
//!
//! # Failure Modes
//!
//! - Wrong password: the check value mismatches and unlock fails with
//!   [`KeyringError::BadPassword`] before any entry is touched.
//! - Damaged check value: indistinguishable from a wrong password, also
//!   reported as [`KeyringError::BadPassword`]. This is a joint failure mode.
//! - Damaged entry: the password check passes but the entry tag fails, which
//!   is reported as [`KeyringError::CorruptKeyring`].
//! - Structural damage (bad CBOR, wrong field lengths, duplicate or unknown
//!   roles): [`KeyringError::CorruptKeyring`].

use std::collections::BTreeMap;

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{AeadInPlace, KeyInit},
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::kdf::{DerivedKey, KEY_SIZE, KeyRole, derive_role_key};

type HmacSha256 = Hmac<Sha256>;

/// Current keyring container version
pub const KEYRING_FORMAT_VERSION: u16 = 1;

/// PBKDF2 iteration count for the keyring master key
pub const KEYRING_KDF_ITERATIONS: u32 = 65_536;

/// Size of the master and entry salts (16 bytes)
pub const SALT_SIZE: usize = 16;

/// Size of the password check value (16 bytes)
const CHECK_SIZE: usize = 16;

/// Poly1305 tag size (16 bytes)
const ENTRY_TAG_SIZE: usize = 16;

/// Master key size (32 bytes)
const MASTER_KEY_SIZE: usize = 32;

/// Entry key (32) + `XChaCha20` nonce (24)
const ENTRY_KEY_MATERIAL_SIZE: usize = 32 + 24;

const MASTER_LABEL: &[u8] = b"fieldsec.keyring.master.v1";
const CHECK_LABEL: &[u8] = b"fieldsec.keyring.check.v1";
const ENTRY_LABEL: &[u8] = b"fieldsec.keyring.entry.v1";

/// Errors from unlocking or sealing a keyring.
///
/// Every variant is a credential error: fatal to the calling tool and never
/// worth retrying with the same input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyringError {
    /// Password does not unlock this keyring (or the check value is damaged)
    #[error("keyring password is incorrect")]
    BadPassword,

    /// Keyring file is structurally invalid or an entry failed authentication
    #[error("keyring is corrupt: {reason}")]
    CorruptKeyring {
        /// What was wrong with the file
        reason: String,
    },

    /// Keyring was written by an unknown format version
    #[error("unsupported keyring format version {0}")]
    UnsupportedFormat(u16),

    /// Keyring could not be sealed from the supplied inputs
    #[error("cannot seal keyring: {reason}")]
    SealFailed {
        /// Why sealing failed
        reason: String,
    },
}

impl KeyringError {
    fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptKeyring { reason: reason.into() }
    }

    /// Returns true if the failure can only be fixed by a different password.
    pub fn is_bad_password(&self) -> bool {
        matches!(self, Self::BadPassword)
    }
}

#[derive(Serialize, Deserialize)]
struct KeyringFile {
    version: u16,
    kdf_salt: Vec<u8>,
    check: Vec<u8>,
    entries: Vec<EntryRecord>,
}

#[derive(Serialize, Deserialize)]
struct EntryRecord {
    role: [u8; 2],
    salt: Vec<u8>,
    ciphertext: Vec<u8>,
    tag: Vec<u8>,
}

/// Unlocked keyring: role-scoped keys, read-only for the process lifetime.
///
/// User and device entries are stored as passwords in the file and turned
/// into [`DerivedKey`]s during unlock; the decrypted passwords are zeroized
/// before [`Keyring::unlock`] returns.
pub struct Keyring {
    keys: BTreeMap<KeyRole, DerivedKey>,
}

impl Keyring {
    /// Decrypt a keyring file with its password.
    ///
    /// # Errors
    ///
    /// - [`KeyringError::BadPassword`] if the password check fails
    /// - [`KeyringError::UnsupportedFormat`] for unknown container versions
    /// - [`KeyringError::CorruptKeyring`] for structural damage or an entry
    ///   whose tag does not verify
    pub fn unlock(bytes: &[u8], password: &str) -> Result<Self, KeyringError> {
        let file: KeyringFile = ciborium::de::from_reader(bytes)
            .map_err(|e| KeyringError::corrupt(format!("invalid container: {e}")))?;

        if file.version != KEYRING_FORMAT_VERSION {
            return Err(KeyringError::UnsupportedFormat(file.version));
        }
        if file.kdf_salt.len() != SALT_SIZE {
            return Err(KeyringError::corrupt(format!(
                "kdf salt is {} bytes, expected {SALT_SIZE}",
                file.kdf_salt.len()
            )));
        }
        if file.check.len() != CHECK_SIZE {
            return Err(KeyringError::corrupt(format!(
                "check value is {} bytes, expected {CHECK_SIZE}",
                file.check.len()
            )));
        }

        let master = derive_master_key(password, &file.kdf_salt);
        let expected = password_check(&master, &file.kdf_salt);
        if !bool::from(expected[..].ct_eq(&file.check[..])) {
            return Err(KeyringError::BadPassword);
        }

        let mut keys = BTreeMap::new();
        for record in &file.entries {
            let role = KeyRole::from_bytes(record.role).ok_or_else(|| {
                KeyringError::corrupt(format!("unknown role {:02x?}", record.role))
            })?;
            if keys.contains_key(&role) {
                return Err(KeyringError::corrupt(format!("duplicate entry for role {role}")));
            }

            let secret = open_entry(&master, role, record)?;
            keys.insert(role, entry_key(role, &secret)?);
        }

        Ok(Self { keys })
    }

    /// Build a keyring directly from keys, bypassing the file format.
    ///
    /// For provisioning tools and tests that already hold key material.
    pub fn from_keys(keys: impl IntoIterator<Item = (KeyRole, DerivedKey)>) -> Self {
        Self { keys: keys.into_iter().collect() }
    }

    /// Key for `role`, if the keyring holds one.
    pub fn key(&self, role: KeyRole) -> Option<&DerivedKey> {
        self.keys.get(&role)
    }

    /// Multicast group key.
    pub fn group_key(&self) -> Option<&DerivedKey> {
        self.key(KeyRole::Group)
    }

    /// Key of tunnelling user `user_id`.
    pub fn user_key(&self, user_id: u8) -> Option<&DerivedKey> {
        self.key(KeyRole::User(user_id))
    }

    /// Device authentication key.
    pub fn device_key(&self) -> Option<&DerivedKey> {
        self.key(KeyRole::DeviceAuthentication)
    }

    /// Roles present in this keyring, in role order.
    pub fn roles(&self) -> impl Iterator<Item = KeyRole> + '_ {
        self.keys.keys().copied()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the keyring holds no entries.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring").field("roles", &self.keys.keys().collect::<Vec<_>>()).finish()
    }
}

/// Produces keyring files.
///
/// Entry secrets are held in zeroizing buffers until the builder is dropped.
#[derive(Default)]
pub struct KeyringBuilder {
    entries: BTreeMap<KeyRole, Zeroizing<Vec<u8>>>,
}

impl KeyringBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the raw multicast group key.
    #[must_use]
    pub fn group_key(mut self, key: [u8; KEY_SIZE]) -> Self {
        self.entries.insert(KeyRole::Group, Zeroizing::new(key.to_vec()));
        self
    }

    /// Set the password of tunnelling user `user_id`.
    #[must_use]
    pub fn user_password(mut self, user_id: u8, password: &str) -> Self {
        self.entries.insert(KeyRole::User(user_id), Zeroizing::new(password.as_bytes().to_vec()));
        self
    }

    /// Set the device authentication password.
    #[must_use]
    pub fn device_password(mut self, password: &str) -> Self {
        self.entries
            .insert(KeyRole::DeviceAuthentication, Zeroizing::new(password.as_bytes().to_vec()));
        self
    }

    /// Number of entries that will be sealed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries have been added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Seal all entries under `password`.
    ///
    /// Pure: the caller supplies the master salt and one salt per entry
    /// (entries are sealed in role order). Salts MUST come from a
    /// cryptographically secure RNG in production.
    ///
    /// # Errors
    ///
    /// - [`KeyringError::SealFailed`] if `entry_salts` does not hold exactly
    ///   one salt per entry
    pub fn seal(
        &self,
        password: &str,
        kdf_salt: [u8; SALT_SIZE],
        entry_salts: &[[u8; SALT_SIZE]],
    ) -> Result<Vec<u8>, KeyringError> {
        if entry_salts.len() != self.entries.len() {
            return Err(KeyringError::SealFailed {
                reason: format!(
                    "expected {} entry salts, got {}",
                    self.entries.len(),
                    entry_salts.len()
                ),
            });
        }

        let master = derive_master_key(password, &kdf_salt);
        let check = password_check(&master, &kdf_salt);

        let entries = self
            .entries
            .iter()
            .zip(entry_salts)
            .map(|((role, secret), salt)| seal_entry(&master, *role, salt, secret))
            .collect();

        let file = KeyringFile {
            version: KEYRING_FORMAT_VERSION,
            kdf_salt: kdf_salt.to_vec(),
            check: check.to_vec(),
            entries,
        };

        let mut out = Vec::new();
        ciborium::ser::into_writer(&file, &mut out)
            .map_err(|e| KeyringError::SealFailed { reason: e.to_string() })?;

        Ok(out)
    }
}

fn derive_master_key(password: &str, kdf_salt: &[u8]) -> Zeroizing<[u8; MASTER_KEY_SIZE]> {
    let mut salt_input = Vec::with_capacity(MASTER_LABEL.len() + kdf_salt.len());
    salt_input.extend_from_slice(MASTER_LABEL);
    salt_input.extend_from_slice(kdf_salt);

    let mut master = Zeroizing::new([0u8; MASTER_KEY_SIZE]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt_input, KEYRING_KDF_ITERATIONS, &mut *master);
    master
}

fn password_check(master: &[u8; MASTER_KEY_SIZE], kdf_salt: &[u8]) -> [u8; CHECK_SIZE] {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(master.as_slice()) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(CHECK_LABEL);
    mac.update(kdf_salt);

    let output = mac.finalize().into_bytes();
    let mut check = [0u8; CHECK_SIZE];
    check.copy_from_slice(&output[..CHECK_SIZE]);
    check
}

/// Expand the per-entry cipher key and nonce from the master key.
fn entry_key_material(
    master: &[u8; MASTER_KEY_SIZE],
    role: KeyRole,
    salt: &[u8],
) -> Zeroizing<[u8; ENTRY_KEY_MATERIAL_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), master);

    let mut info = Vec::with_capacity(ENTRY_LABEL.len() + 2);
    info.extend_from_slice(ENTRY_LABEL);
    info.extend_from_slice(&role.to_bytes());

    let mut okm = Zeroizing::new([0u8; ENTRY_KEY_MATERIAL_SIZE]);
    let Ok(()) = hkdf.expand(&info, &mut *okm) else {
        unreachable!("56 bytes is a valid HKDF-SHA256 output length");
    };
    okm
}

fn entry_cipher(okm: &[u8; ENTRY_KEY_MATERIAL_SIZE]) -> (XChaCha20Poly1305, XNonce) {
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&okm[..32]);

    let cipher = XChaCha20Poly1305::new((&*key).into());
    let nonce = *XNonce::from_slice(&okm[32..]);
    (cipher, nonce)
}

fn seal_entry(
    master: &[u8; MASTER_KEY_SIZE],
    role: KeyRole,
    salt: &[u8; SALT_SIZE],
    secret: &[u8],
) -> EntryRecord {
    let okm = entry_key_material(master, role, salt);
    let (cipher, nonce) = entry_cipher(&okm);

    let mut buffer = secret.to_vec();
    let Ok(tag) = cipher.encrypt_in_place_detached(&nonce, &role.to_bytes(), &mut buffer) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    EntryRecord { role: role.to_bytes(), salt: salt.to_vec(), ciphertext: buffer, tag: tag.to_vec() }
}

fn open_entry(
    master: &[u8; MASTER_KEY_SIZE],
    role: KeyRole,
    record: &EntryRecord,
) -> Result<Zeroizing<Vec<u8>>, KeyringError> {
    if record.salt.len() != SALT_SIZE {
        return Err(KeyringError::corrupt(format!("entry {role}: salt has wrong length")));
    }
    if record.tag.len() != ENTRY_TAG_SIZE {
        return Err(KeyringError::corrupt(format!("entry {role}: tag has wrong length")));
    }

    let okm = entry_key_material(master, role, &record.salt);
    let (cipher, nonce) = entry_cipher(&okm);

    let mut buffer = Zeroizing::new(record.ciphertext.clone());
    cipher
        .decrypt_in_place_detached(
            &nonce,
            &role.to_bytes(),
            &mut *buffer,
            chacha20poly1305::Tag::from_slice(&record.tag),
        )
        .map_err(|_| KeyringError::corrupt(format!("entry {role}: authentication failed")))?;

    Ok(buffer)
}

/// Turn a decrypted entry secret into the role key.
fn entry_key(role: KeyRole, secret: &[u8]) -> Result<DerivedKey, KeyringError> {
    match role {
        KeyRole::Group => {
            let key: [u8; KEY_SIZE] = secret.try_into().map_err(|_| {
                KeyringError::corrupt(format!("group key is {} bytes, expected {KEY_SIZE}", secret.len()))
            })?;
            Ok(DerivedKey::from_bytes(key))
        },
        KeyRole::User(_) | KeyRole::DeviceAuthentication => {
            let password = std::str::from_utf8(secret)
                .map_err(|_| KeyringError::corrupt(format!("entry {role}: password is not UTF-8")))?;
            Ok(derive_role_key(password, role))
        },
    }
}
