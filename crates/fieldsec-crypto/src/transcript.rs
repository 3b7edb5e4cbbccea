//! Unicast handshake transcript
//!
//! The handshake is a challenge/response over a role key:
//!
//! ```text
//! client                                         gateway
//!   │ ── SessionRequest { user_id, client_nonce } ──> │
//!   │ <── SessionChallenge { session_id, challenge } ─ │
//!   │ ── SessionResponse { MAC(role_key, T) } ──────> │
//!   │ <── SessionStatus(AuthSuccess) [session key] ── │
//! ```
//!
//! Both ends build the same [`Transcript`] `T` from the exchanged values. The
//! response proves knowledge of the role key; the session key is expanded
//! from the role key and the transcript, so every session gets a fresh key
//! even when the password never changes.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::kdf::{DerivedKey, KEY_SIZE, KeyRole};

type HmacSha256 = Hmac<Sha256>;

/// Size of the client nonce in `SessionRequest` (16 bytes)
pub const CLIENT_NONCE_SIZE: usize = 16;

/// Size of the gateway challenge (16 bytes)
pub const CHALLENGE_SIZE: usize = 16;

/// Size of the handshake response (16 bytes)
pub const RESPONSE_SIZE: usize = 16;

const RESPONSE_LABEL: &[u8] = b"fieldsec.handshake.response.v1";
const SESSION_KEY_LABEL: &[u8] = b"fieldsec.handshake.session-key.v1";

/// Handshake authentication failures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// Response was not produced with the expected role key
    #[error("handshake response does not verify")]
    InvalidResponse,
}

/// Values both handshake parties agree on before the session key exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transcript {
    /// Session id assigned by the gateway
    pub session_id: u16,
    /// Role whose key authenticates the handshake
    pub role: KeyRole,
    /// Client-chosen nonce from `SessionRequest`
    pub client_nonce: [u8; CLIENT_NONCE_SIZE],
    /// Gateway-chosen challenge from `SessionChallenge`
    pub challenge: [u8; CHALLENGE_SIZE],
}

impl Transcript {
    /// Client response proving knowledge of `role_key`.
    pub fn response(&self, role_key: &DerivedKey) -> [u8; RESPONSE_SIZE] {
        let output = self.response_mac(role_key).finalize().into_bytes();

        let mut response = [0u8; RESPONSE_SIZE];
        response.copy_from_slice(&output[..RESPONSE_SIZE]);
        response
    }

    /// Check a client response in constant time.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidResponse`] on any mismatch, including a response
    ///   of the wrong length
    pub fn verify_response(&self, role_key: &DerivedKey, response: &[u8]) -> Result<(), AuthError> {
        if response.len() != RESPONSE_SIZE {
            return Err(AuthError::InvalidResponse);
        }

        self.response_mac(role_key)
            .verify_truncated_left(response)
            .map_err(|_| AuthError::InvalidResponse)
    }

    /// Session key for this handshake.
    ///
    /// HKDF-SHA256 with the role key as input key material and the nonce and
    /// challenge as salt; the session id and role are bound through `info`.
    pub fn session_key(&self, role_key: &DerivedKey) -> DerivedKey {
        let mut salt = [0u8; CLIENT_NONCE_SIZE + CHALLENGE_SIZE];
        salt[..CLIENT_NONCE_SIZE].copy_from_slice(&self.client_nonce);
        salt[CLIENT_NONCE_SIZE..].copy_from_slice(&self.challenge);

        let hkdf = Hkdf::<Sha256>::new(Some(&salt), role_key.as_bytes());

        // Capacity: 33 (label) + 2 (session id) + 2 (role)
        let mut info = Vec::with_capacity(SESSION_KEY_LABEL.len() + 4);
        info.extend_from_slice(SESSION_KEY_LABEL);
        info.extend_from_slice(&self.session_id.to_be_bytes());
        info.extend_from_slice(&self.role.to_bytes());

        let mut key = [0u8; KEY_SIZE];
        let Ok(()) = hkdf.expand(&info, &mut key) else {
            unreachable!("16 bytes is a valid HKDF-SHA256 output length");
        };

        DerivedKey::from_bytes(key)
    }

    fn response_mac(&self, role_key: &DerivedKey) -> HmacSha256 {
        let Ok(mut mac) = HmacSha256::new_from_slice(role_key.as_bytes()) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };

        mac.update(RESPONSE_LABEL);
        mac.update(&self.session_id.to_be_bytes());
        mac.update(&self.role.to_bytes());
        mac.update(&self.client_nonce);
        mac.update(&self.challenge);
        mac
    }
}
