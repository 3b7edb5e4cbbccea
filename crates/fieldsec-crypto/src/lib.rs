//! fieldsec Cryptographic Primitives
//!
//! Cryptographic building blocks for the fieldsec secure-session layer. Pure
//! functions with deterministic outputs. Callers provide random bytes (salts,
//! nonces, challenges) so every operation can be replayed in tests.
//!
//! # Key Hierarchy
//!
//! ```text
//! Keyring password
//!        │
//!        ▼
//! PBKDF2 → Keyring master key ──HKDF──> entry keys ──XChaCha20-Poly1305──> entry secrets
//!                                                                          │
//!                         ┌────────────────────────────────────────────────┤
//!                         ▼                                                ▼
//!               group key (raw 16 bytes)                  user / device passwords
//!                         │                                                │
//!                         │                                  PBKDF2 (role-scoped salt)
//!                         │                                                ▼
//!                         │                                     role keys (16 bytes)
//!                         │                                                │
//!                         │                                  HKDF(handshake transcript)
//!                         ▼                                                ▼
//!                 multicast frame MACs                        unicast session key
//! ```
//!
//! # Security
//!
//! Key Material:
//! - Every key type zeroizes its buffer on drop
//! - `Debug` output never contains key bytes
//! - Decrypted keyring passwords live in `Zeroizing` buffers only
//!
//! Authenticity:
//! - Frame MACs bind the 48-bit sequence number into the MAC input, so a
//!   replayed frame cannot be re-stamped with a fresh sequence number
//! - Tag comparison is constant time
//!
//! Credential Errors:
//! - A wrong keyring password is detected by an embedded check value before
//!   any entry is decrypted and never produces a plausible wrong key

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod authenticator;
pub mod kdf;
pub mod keyring;
pub mod transcript;

pub use authenticator::{MAX_SEQUENCE, MacProfile, TAG_SIZE, Tag, mac, mac_with_profile, verify};
pub use kdf::{DEFAULT_ROLE_SALT, DerivedKey, KDF_ITERATIONS, KEY_SIZE, KeyRole, derive_key, derive_role_key};
pub use keyring::{
    KEYRING_FORMAT_VERSION, KEYRING_KDF_ITERATIONS, Keyring, KeyringBuilder, KeyringError,
    SALT_SIZE,
};
pub use transcript::{AuthError, CHALLENGE_SIZE, CLIENT_NONCE_SIZE, RESPONSE_SIZE, Transcript};
