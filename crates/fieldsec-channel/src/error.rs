//! Channel error types.
//!
//! Errors callers of [`crate::SecureChannel`] see. Frames dropped for a bad
//! MAC or a stale sequence number never show up here; they reach the
//! configured `SecurityObserver` instead.

use std::{path::PathBuf, time::Duration};

use fieldsec_core::{GroupError, SessionError};
use fieldsec_crypto::{KeyRole, KeyringError};
use thiserror::Error;

use crate::transport::TransportError;

/// Errors from opening, using or closing a secure channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Keyring could not be unlocked or sealed.
    #[error("credential error: {0}")]
    Credential(#[from] KeyringError),

    /// Keyring file could not be read or written.
    #[error("keyring file {}: {reason}", path.display())]
    KeyringFile {
        /// File path
        path: PathBuf,
        /// I/O failure
        reason: String,
    },

    /// Keyring holds no key for the role.
    #[error("keyring has no {0} key")]
    MissingKey(KeyRole),

    /// Peer did not complete the handshake in time.
    #[error("handshake timed out after {elapsed:?}")]
    HandshakeTimeout {
        /// How long we waited
        elapsed: Duration,
    },

    /// Peer refused our credentials.
    #[error("handshake rejected by peer")]
    HandshakeRejected,

    /// Session failure other than a timeout or rejection.
    #[error("session error: {0}")]
    Session(SessionError),

    /// Multicast group failure.
    #[error("group error: {0}")]
    Group(#[from] GroupError),

    /// Socket failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel configuration out of range.
    #[error("invalid channel config: {0}")]
    Config(String),

    /// Channel has been closed, locally or by the peer.
    #[error("channel closed")]
    Closed,

    /// Driver task failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChannelError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HandshakeTimeout { .. } => true,
            Self::Session(err) => err.is_retryable(),
            Self::Transport(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Returns true if the channel (or the attempt to open it) is unusable.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Session(err) => err.is_fatal(),
            Self::Group(err) => err.is_fatal(),
            Self::Transport(err) => !err.is_transient(),
            Self::HandshakeTimeout { .. } => false,
            _ => true,
        }
    }
}

impl From<SessionError> for ChannelError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::HandshakeTimeout { elapsed } => Self::HandshakeTimeout { elapsed },
            SessionError::AuthenticationRejected => Self::HandshakeRejected,
            other => Self::Session(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_timeout_is_retryable() {
        let err = ChannelError::from(SessionError::HandshakeTimeout {
            elapsed: Duration::from_secs(5),
        });

        assert!(matches!(err, ChannelError::HandshakeTimeout { .. }));
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn rejection_is_fatal_and_not_retryable() {
        let err = ChannelError::from(SessionError::AuthenticationRejected);

        assert!(matches!(err, ChannelError::HandshakeRejected));
        assert!(!err.is_retryable());
        assert!(err.is_fatal());
    }

    #[test]
    fn bad_password_is_a_credential_error() {
        let err = ChannelError::from(KeyringError::BadPassword);

        assert!(matches!(err, ChannelError::Credential(KeyringError::BadPassword)));
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "credential error: keyring password is incorrect");
    }

    #[test]
    fn concurrent_negotiation_is_retryable() {
        let peer = std::net::SocketAddr::from(([192, 0, 2, 1], 3671));
        let err = ChannelError::from(SessionError::SessionAlreadyNegotiating { peer });

        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }
}
