//! Handshake and session-control payload types.

use serde::{Deserialize, Serialize};

/// Client handshake opener
///
/// Sent unauthenticated. The client nonce makes every transcript unique even
/// if the gateway reuses a challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Tunnelling user the client authenticates as
    pub user_id: u8,
    /// Fresh random nonce chosen by the client
    pub client_nonce: [u8; 16],
}

/// Gateway challenge
///
/// Assigns the session id that every later frame of this session carries in
/// its `channel_id` header field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionChallenge {
    /// Session id assigned by the gateway (never zero)
    pub session_id: u16,
    /// Fresh random challenge chosen by the gateway
    pub challenge: [u8; 16],
}

/// Client challenge response: `MAC(role_key, transcript)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResponse {
    /// Truncated HMAC over the handshake transcript
    pub response: [u8; 16],
}

/// Session status notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Status code
    pub status: StatusCode,
}

impl SessionStatus {
    /// Status notification with `status`.
    #[must_use]
    pub const fn new(status: StatusCode) -> Self {
        Self { status }
    }
}

/// Session status codes.
///
/// Encoded as a single CBOR unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StatusCode {
    /// Handshake succeeded; sent authenticated under the new session key
    AuthSuccess = 0,
    /// Handshake response did not verify; sent unauthenticated
    AuthFailed = 1,
    /// Frame referenced a session that is not authenticated
    Unauthenticated = 2,
    /// Session expired on the gateway
    Timeout = 3,
    /// Keep-alive probe or echo on an established session
    KeepAlive = 4,
    /// Peer is closing the session
    Close = 5,
}

impl StatusCode {
    /// Whether this status is only meaningful when authenticated under the
    /// session key.
    #[must_use]
    pub const fn requires_authentication(self) -> bool {
        !matches!(self, Self::AuthFailed)
    }
}

impl From<StatusCode> for u8 {
    fn from(code: StatusCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for StatusCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AuthSuccess),
            1 => Ok(Self::AuthFailed),
            2 => Ok(Self::Unauthenticated),
            3 => Ok(Self::Timeout),
            4 => Ok(Self::KeepAlive),
            5 => Ok(Self::Close),
            other => Err(format!("unknown status code {other}")),
        }
    }
}
