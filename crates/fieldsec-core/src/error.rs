//! Error types for the fieldsec state machines.
//!
//! Session errors cover the unicast handshake and established-session
//! lifecycle; group errors cover the local side of a multicast group. Frames
//! that fail authentication or freshness are NOT errors: they are dropped and
//! surfaced as `SecurityEvent`s so injected traffic cannot disrupt callers.

use std::{net::SocketAddr, time::Duration};

use fieldsec_crypto::KeyRole;
use thiserror::Error;

use crate::{sequence::SequenceExhausted, session::SessionState};

/// Errors from unicast session and negotiator operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation not valid in the current state
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when error occurred
        state: SessionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// A negotiation with this peer is already in flight
    #[error("secure session with {peer} is already negotiating")]
    SessionAlreadyNegotiating {
        /// Peer address
        peer: SocketAddr,
    },

    /// Peer did not complete the handshake in time
    #[error("handshake timeout after {elapsed:?}")]
    HandshakeTimeout {
        /// How long we waited
        elapsed: Duration,
    },

    /// Established session heard nothing from the peer in time
    #[error("idle timeout after {elapsed:?}")]
    IdleTimeout {
        /// How long the session was idle
        elapsed: Duration,
    },

    /// Peer rejected our credentials
    #[error("authentication rejected by peer")]
    AuthenticationRejected,

    /// Frame not valid for the current state
    #[error("unexpected frame: received service {service:#06x} in state {state:?}")]
    UnexpectedFrame {
        /// Current state when frame was received
        state: SessionState,
        /// Service identifier of the frame
        service: u16,
    },

    /// Outgoing 48-bit sequence space used up
    #[error("48-bit sequence space exhausted")]
    SequenceExhausted,

    /// Unicast sessions authenticate with user keys only
    #[error("role {0} cannot open a unicast session")]
    UnsupportedRole(KeyRole),

    /// Frame could not be built or parsed
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SessionError {
    /// Returns true if the caller may retry with the same credentials.
    ///
    /// Timeouts and an in-flight negotiation clear on their own. Rejection and
    /// protocol violations do not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout { .. }
                | Self::IdleTimeout { .. }
                | Self::SessionAlreadyNegotiating { .. }
        )
    }

    /// Returns true if the session can no longer be used.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::SessionAlreadyNegotiating { .. }
                | Self::InvalidState { .. }
                | Self::UnexpectedFrame { .. }
        )
    }
}

impl From<fieldsec_proto::ProtocolError> for SessionError {
    fn from(err: fieldsec_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<SequenceExhausted> for SessionError {
    fn from(_: SequenceExhausted) -> Self {
        Self::SequenceExhausted
    }
}

/// Errors from local multicast group operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// Outgoing 48-bit sequence space used up
    #[error("48-bit sequence space exhausted")]
    SequenceExhausted,

    /// Group configuration out of range
    #[error("invalid group config: {reason}")]
    InvalidConfig {
        /// What is wrong
        reason: String,
    },

    /// Frame could not be built
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl GroupError {
    /// Returns true if the group can no longer send.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SequenceExhausted | Self::InvalidConfig { .. })
    }
}

impl From<fieldsec_proto::ProtocolError> for GroupError {
    fn from(err: fieldsec_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<SequenceExhausted> for GroupError {
    fn from(_: SequenceExhausted) -> Self {
        Self::SequenceExhausted
    }
}
