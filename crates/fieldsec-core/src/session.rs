//! Unicast secure session state machine (client side).
//!
//! Methods take time as input and return actions for the driver to execute,
//! the same action pattern the multicast group and the responder use.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ Request ┌───────────┐ Challenge ┌────────────────┐ AuthSuccess ┌─────────────┐
//! │ Idle │────────>│ Requested │──────────>│ Authenticating │────────────>│ Established │
//! └──────┘         └───────────┘           └────────────────┘             └─────────────┘
//!                        │                         │                             │
//!                        │ Timeout/AuthFailed      │ Timeout/AuthFailed          │ Close/Idle
//!                        ↓                         ↓                             ↓
//!                   ┌────────────────────────────────────────────────────────────────┐
//!                   │                             Closed                             │
//!                   └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A closed session is never reused; open a new one.

use std::{
    net::SocketAddr,
    ops::Sub,
    time::{Duration, Instant},
};

use bytes::Bytes;
use fieldsec_crypto::{DerivedKey, KeyRole, MacProfile, Transcript};
use fieldsec_proto::{
    Frame, Payload, ProtocolError, SecureHeader, ServiceType, SessionRequest, SessionResponse,
    SessionStatus, StatusCode,
};

use crate::{
    error::SessionError,
    observer::{DropReason, SecurityEvent},
    seal::{open_first, open_frame, plain_frame, seal_frame},
    sequence::{SequenceCounter, SequenceState},
};

/// Time allowed for the gateway to answer each handshake step.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum time without an accepted frame before an established session is
/// closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval at which an established session sends keep-alive status frames
/// when it has nothing else to send.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Actions returned by the session state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Send this frame to the peer
    SendFrame(Frame),

    /// Handshake completed
    Established {
        /// Session id assigned by the gateway
        session_id: u16,
    },

    /// Authentic, fresh application data
    Deliver {
        /// Sequence number the peer stamped on the frame
        sequence: u64,
        /// Application payload
        payload: Bytes,
    },

    /// A frame was dropped
    Security(SecurityEvent),

    /// Session is closed; the driver should stop
    Close {
        /// Why the session closed
        reason: CloseReason,
    },
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed locally
    LocalClose,
    /// Peer sent an authenticated close
    PeerClosed,
    /// Gateway did not answer a handshake step in time
    HandshakeTimeout {
        /// How long we waited
        elapsed: Duration,
    },
    /// No authentic frame from the peer in time
    IdleTimeout {
        /// How long the session was idle
        elapsed: Duration,
    },
    /// Gateway rejected the credentials
    AuthenticationRejected,
    /// Outgoing sequence space used up
    SequenceExhausted,
}

impl CloseReason {
    /// Error to surface to the caller, if the close was not orderly.
    pub fn into_error(self) -> Option<SessionError> {
        match self {
            Self::LocalClose | Self::PeerClosed => None,
            Self::HandshakeTimeout { elapsed } => Some(SessionError::HandshakeTimeout { elapsed }),
            Self::IdleTimeout { elapsed } => Some(SessionError::IdleTimeout { elapsed }),
            Self::AuthenticationRejected => Some(SessionError::AuthenticationRejected),
            Self::SequenceExhausted => Some(SessionError::SequenceExhausted),
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalClose => write!(f, "closed locally"),
            Self::PeerClosed => write!(f, "closed by peer"),
            Self::HandshakeTimeout { elapsed } => write!(f, "handshake timeout after {elapsed:?}"),
            Self::IdleTimeout { elapsed } => write!(f, "idle timeout after {elapsed:?}"),
            Self::AuthenticationRejected => write!(f, "authentication rejected"),
            Self::SequenceExhausted => write!(f, "sequence space exhausted"),
        }
    }
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing sent yet
    Idle,
    /// Request sent, waiting for the challenge
    Requested,
    /// Response sent, waiting for the authenticated confirm
    Authenticating,
    /// Session key agreed, data may flow
    Established,
    /// Closed (orderly, timeout or rejection)
    Closed,
}

/// Session configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Timeout for each handshake step
    pub handshake_timeout: Duration,
    /// Idle timeout once established
    pub idle_timeout: Duration,
    /// Keep-alive interval (should be < idle_timeout / 2)
    pub keepalive_interval: Duration,
    /// Tag width for outgoing frames
    pub mac_profile: MacProfile,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            mac_profile: MacProfile::default(),
        }
    }
}

/// Client side of a unicast secure session with one gateway.
///
/// Pure state machine: no I/O, time passed in. Generic over `Instant` to
/// support both real and virtual time.
#[derive(Debug)]
pub struct Session<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    state: SessionState,
    config: SessionConfig,
    peer: SocketAddr,
    user_id: u8,
    role_key: DerivedKey,
    client_nonce: [u8; 16],
    /// Zero until the gateway assigns one
    session_id: u16,
    session_key: Option<DerivedKey>,
    incoming: Option<SequenceState<I>>,
    outgoing: SequenceCounter,
    /// Start of the current handshake step
    step_started: I,
    last_received: I,
    last_sent: I,
}

impl<I> Session<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a session in [`SessionState::Idle`].
    ///
    /// `role_key` is the key derived for `KeyRole::User(user_id)`.
    pub fn new(
        peer: SocketAddr,
        user_id: u8,
        role_key: DerivedKey,
        config: SessionConfig,
        now: I,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            config,
            peer,
            user_id,
            role_key,
            client_nonce: [0; 16],
            session_id: 0,
            session_key: None,
            incoming: None,
            outgoing: SequenceCounter::starting_at(0),
            step_started: now,
            last_received: now,
            last_sent: now,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Gateway address
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Tunnelling user this session authenticates as
    #[must_use]
    pub fn user_id(&self) -> u8 {
        self.user_id
    }

    /// Role whose key authenticates the handshake
    #[must_use]
    pub fn role(&self) -> KeyRole {
        KeyRole::User(self.user_id)
    }

    /// Session id assigned by the gateway. `None` before the challenge.
    #[must_use]
    pub fn session_id(&self) -> Option<u16> {
        (self.session_id != 0).then_some(self.session_id)
    }

    /// Start the handshake.
    ///
    /// `client_nonce` must be fresh random bytes (`Environment::random_nonce`).
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` if not in [`SessionState::Idle`]
    pub fn request(
        &mut self,
        client_nonce: [u8; 16],
        now: I,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState { state: self.state, operation: "request" });
        }

        let request = Payload::SessionRequest(SessionRequest { user_id: self.user_id, client_nonce });
        let frame = plain_frame(SecureHeader::new(ServiceType::SessionRequest), request)?;

        self.client_nonce = client_nonce;
        self.state = SessionState::Requested;
        self.step_started = now;
        self.last_sent = now;

        tracing::debug!(peer = %self.peer, user_id = self.user_id, "session requested");

        Ok(vec![SessionAction::SendFrame(frame)])
    }

    /// Process an incoming frame.
    ///
    /// Authentication and replay failures are not errors: they produce
    /// [`SessionAction::Security`] and leave the session untouched.
    ///
    /// # Errors
    ///
    /// - `SessionError::UnexpectedFrame` if the service is invalid for the
    ///   current state
    /// - `SessionError::Protocol` if a handshake payload does not decode
    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        now: I,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let Some(service) = frame.header.service_type() else {
            return Err(SessionError::UnexpectedFrame {
                state: self.state,
                service: frame.header.service(),
            });
        };

        let authenticated = frame.header.flags().is_authenticated();

        match (self.state, service) {
            (SessionState::Closed, _) => Ok(vec![]),

            (SessionState::Requested, ServiceType::SessionChallenge) => {
                self.handle_challenge(frame, now)
            },

            (SessionState::Requested | SessionState::Authenticating, ServiceType::SessionStatus)
                if !authenticated =>
            {
                self.handle_rejection(frame)
            },

            (SessionState::Authenticating, ServiceType::SessionStatus) => {
                self.handle_confirm(frame, now)
            },

            (SessionState::Established, ServiceType::SecureData | ServiceType::SessionStatus) => {
                self.handle_established(frame, service, now)
            },

            (state, service) => {
                Err(SessionError::UnexpectedFrame { state, service: service.to_u16() })
            },
        }
    }

    /// Seal application data for the peer.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` if not established
    /// - `SessionError::Protocol` if the payload exceeds the frame limit
    /// - `SessionError::SequenceExhausted` once the 48-bit counter is used up
    pub fn seal(&mut self, payload: Bytes, now: I) -> Result<Frame, SessionError> {
        if self.state != SessionState::Established {
            return Err(SessionError::InvalidState { state: self.state, operation: "seal" });
        }

        let max = SecureHeader::MAX_PAYLOAD_SIZE as usize;
        if payload.len() > max {
            return Err(ProtocolError::PayloadTooLarge { size: payload.len(), max }.into());
        }

        self.seal_payload(Payload::SecureData(payload), now)
    }

    /// Close the session.
    ///
    /// An established session tells the peer with an authenticated close.
    /// Idempotent: closing a closed session returns no actions.
    pub fn close(&mut self, now: I) -> Vec<SessionAction> {
        let mut actions = Vec::new();

        match self.state {
            SessionState::Closed => return actions,
            SessionState::Established => {
                let close = Payload::SessionStatus(SessionStatus::new(StatusCode::Close));
                match self.seal_payload(close, now) {
                    Ok(frame) => actions.push(SessionAction::SendFrame(frame)),
                    Err(err) => tracing::warn!(error = %err, "could not seal close notification"),
                }
            },
            _ => {},
        }

        self.state = SessionState::Closed;
        tracing::info!(peer = %self.peer, session_id = self.session_id, "session closed");
        actions.push(SessionAction::Close { reason: CloseReason::LocalClose });
        actions
    }

    /// Process periodic maintenance (timeouts and keep-alives).
    pub fn tick(&mut self, now: I) -> Vec<SessionAction> {
        match self.state {
            SessionState::Requested | SessionState::Authenticating => {
                let elapsed = now - self.step_started;
                if elapsed >= self.config.handshake_timeout {
                    tracing::warn!(peer = %self.peer, ?elapsed, state = ?self.state, "handshake timeout");
                    return self.fail(CloseReason::HandshakeTimeout { elapsed });
                }
                vec![]
            },

            SessionState::Established => {
                let elapsed = now - self.last_received;
                if elapsed >= self.config.idle_timeout {
                    tracing::warn!(peer = %self.peer, ?elapsed, "session idle timeout");
                    return self.fail(CloseReason::IdleTimeout { elapsed });
                }

                if now - self.last_sent < self.config.keepalive_interval {
                    return vec![];
                }

                let keepalive = Payload::SessionStatus(SessionStatus::new(StatusCode::KeepAlive));
                match self.seal_payload(keepalive, now) {
                    Ok(frame) => vec![SessionAction::SendFrame(frame)],
                    Err(err) => {
                        tracing::warn!(error = %err, "could not seal keep-alive");
                        self.fail(CloseReason::SequenceExhausted)
                    },
                }
            },

            SessionState::Idle | SessionState::Closed => vec![],
        }
    }

    fn handle_challenge(
        &mut self,
        frame: &Frame,
        now: I,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let Payload::SessionChallenge(challenge) = Payload::from_frame(frame)? else {
            return Err(SessionError::Protocol("challenge frame without challenge".to_string()));
        };

        if challenge.session_id == 0 {
            return Err(SessionError::Protocol(
                "gateway assigned reserved session id 0".to_string(),
            ));
        }

        let transcript = Transcript {
            session_id: challenge.session_id,
            role: self.role(),
            client_nonce: self.client_nonce,
            challenge: challenge.challenge,
        };

        let mut header = SecureHeader::new(ServiceType::SessionResponse);
        header.set_channel_id(challenge.session_id);
        let response = Payload::SessionResponse(SessionResponse {
            response: transcript.response(&self.role_key),
        });
        let frame = plain_frame(header, response)?;

        self.session_key = Some(transcript.session_key(&self.role_key));
        self.session_id = challenge.session_id;
        self.state = SessionState::Authenticating;
        self.step_started = now;
        self.last_sent = now;

        tracing::debug!(peer = %self.peer, session_id = self.session_id, "challenge answered");

        Ok(vec![SessionAction::SendFrame(frame)])
    }

    fn handle_rejection(&mut self, frame: &Frame) -> Result<Vec<SessionAction>, SessionError> {
        let Payload::SessionStatus(status) = Payload::from_frame(frame)? else {
            return Err(SessionError::Protocol("status frame without status".to_string()));
        };

        if status.status.requires_authentication() {
            return Ok(vec![SessionAction::Security(SecurityEvent::for_frame(
                DropReason::Forged,
                &frame.header,
            ))]);
        }

        tracing::warn!(peer = %self.peer, user_id = self.user_id, "gateway rejected credentials");
        Ok(self.fail(CloseReason::AuthenticationRejected))
    }

    fn handle_confirm(
        &mut self,
        frame: &Frame,
        now: I,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if frame.header.channel_id() != self.session_id {
            return Ok(vec![drop_event(DropReason::Malformed, frame)]);
        }

        let Some(key) = &self.session_key else {
            return Err(SessionError::Protocol("authenticating without a session key".to_string()));
        };

        let incoming = match open_first(key, self.config.mac_profile, frame, 0, now) {
            Ok(window) => window,
            Err(reason) => return Ok(vec![drop_event(reason, frame)]),
        };

        match Payload::from_frame(frame) {
            Ok(Payload::SessionStatus(SessionStatus { status: StatusCode::AuthSuccess })) => {},
            Ok(Payload::SessionStatus(_)) => {
                tracing::warn!(peer = %self.peer, "gateway refused authenticated session");
                return Ok(self.fail(CloseReason::AuthenticationRejected));
            },
            _ => return Ok(vec![drop_event(DropReason::Malformed, frame)]),
        }

        self.incoming = Some(incoming);
        self.state = SessionState::Established;
        self.last_received = now;
        self.last_sent = now;

        tracing::info!(peer = %self.peer, session_id = self.session_id, "secure session established");

        Ok(vec![SessionAction::Established { session_id: self.session_id }])
    }

    fn handle_established(
        &mut self,
        frame: &Frame,
        service: ServiceType,
        now: I,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if frame.header.channel_id() != self.session_id {
            return Ok(vec![drop_event(DropReason::Malformed, frame)]);
        }

        let profile = self.config.mac_profile;
        let (Some(key), Some(window)) = (&self.session_key, &mut self.incoming) else {
            return Err(SessionError::Protocol("established without sequence state".to_string()));
        };

        let sequence = match open_frame(key, profile, frame, window, now) {
            Ok(sequence) => sequence,
            Err(reason) => return Ok(vec![drop_event(reason, frame)]),
        };
        self.last_received = now;

        if service == ServiceType::SecureData {
            return Ok(vec![SessionAction::Deliver { sequence, payload: frame.payload.clone() }]);
        }

        match Payload::from_frame(frame) {
            Ok(Payload::SessionStatus(status)) => match status.status {
                StatusCode::KeepAlive | StatusCode::AuthSuccess => Ok(vec![]),
                StatusCode::Close
                | StatusCode::Timeout
                | StatusCode::Unauthenticated
                | StatusCode::AuthFailed => {
                    tracing::info!(
                        peer = %self.peer,
                        session_id = self.session_id,
                        status = ?status.status,
                        "peer closed session"
                    );
                    self.state = SessionState::Closed;
                    Ok(vec![SessionAction::Close { reason: CloseReason::PeerClosed }])
                },
            },
            _ => Ok(vec![drop_event(DropReason::Malformed, frame)]),
        }
    }

    fn seal_payload(&mut self, payload: Payload, now: I) -> Result<Frame, SessionError> {
        let Some(key) = &self.session_key else {
            return Err(SessionError::InvalidState { state: self.state, operation: "seal" });
        };

        let sequence = self.outgoing.next()?;
        let mut header = SecureHeader::new(payload.service());
        header.set_channel_id(self.session_id);

        let frame = seal_frame(key, self.config.mac_profile, header, sequence, payload)?;
        self.last_sent = now;
        Ok(frame)
    }

    fn fail(&mut self, reason: CloseReason) -> Vec<SessionAction> {
        self.state = SessionState::Closed;
        vec![SessionAction::Close { reason }]
    }
}

fn drop_event(reason: DropReason, frame: &Frame) -> SessionAction {
    SessionAction::Security(SecurityEvent::for_frame(reason, &frame.header))
}

#[cfg(test)]
mod tests {
    use fieldsec_crypto::derive_role_key;

    use super::*;

    const SESSION_ID: u16 = 0x2a;
    const CHALLENGE: [u8; 16] = [0xc4; 16];
    const NONCE: [u8; 16] = [0x11; 16];

    fn peer() -> SocketAddr {
        "192.0.2.1:3671".parse().unwrap()
    }

    fn user_key() -> DerivedKey {
        DerivedKey::from_bytes([0x5a; 16])
    }

    fn t0() -> Instant {
        Instant::now()
    }

    fn transcript() -> Transcript {
        Transcript {
            session_id: SESSION_ID,
            role: KeyRole::User(1),
            client_nonce: NONCE,
            challenge: CHALLENGE,
        }
    }

    fn challenge_frame() -> Frame {
        let payload = Payload::SessionChallenge(fieldsec_proto::SessionChallenge {
            session_id: SESSION_ID,
            challenge: CHALLENGE,
        });
        plain_frame(SecureHeader::new(ServiceType::SessionChallenge), payload).unwrap()
    }

    fn gateway_frame(sequence: u64, payload: Payload) -> Frame {
        let mut header = SecureHeader::new(payload.service());
        header.set_channel_id(SESSION_ID);
        let key = transcript().session_key(&user_key());
        seal_frame(&key, MacProfile::Full, header, sequence, payload).unwrap()
    }

    fn status(code: StatusCode) -> Payload {
        Payload::SessionStatus(SessionStatus::new(code))
    }

    fn established(now: Instant) -> Session {
        let mut session = Session::new(peer(), 1, user_key(), SessionConfig::default(), now);
        session.request(NONCE, now).unwrap();
        session.handle_frame(&challenge_frame(), now).unwrap();
        let actions =
            session.handle_frame(&gateway_frame(100, status(StatusCode::AuthSuccess)), now).unwrap();
        assert_eq!(actions, vec![SessionAction::Established { session_id: SESSION_ID }]);
        session
    }

    #[test]
    fn handshake_lifecycle() {
        let now = t0();
        let mut session = Session::new(peer(), 1, user_key(), SessionConfig::default(), now);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.session_id(), None);

        let actions = session.request(NONCE, now).unwrap();
        assert_eq!(session.state(), SessionState::Requested);
        let SessionAction::SendFrame(request) = &actions[0] else {
            panic!("expected request frame");
        };
        assert_eq!(request.header.service_type(), Some(ServiceType::SessionRequest));
        assert!(!request.header.flags().is_authenticated());

        let actions = session.handle_frame(&challenge_frame(), now).unwrap();
        assert_eq!(session.state(), SessionState::Authenticating);
        assert_eq!(session.session_id(), Some(SESSION_ID));

        let SessionAction::SendFrame(response) = &actions[0] else {
            panic!("expected response frame");
        };
        assert_eq!(response.header.channel_id(), SESSION_ID);
        let Payload::SessionResponse(response) = Payload::from_frame(response).unwrap() else {
            panic!("expected response payload");
        };
        assert!(transcript().verify_response(&user_key(), &response.response).is_ok());

        let actions =
            session.handle_frame(&gateway_frame(100, status(StatusCode::AuthSuccess)), now).unwrap();
        assert_eq!(actions, vec![SessionAction::Established { session_id: SESSION_ID }]);
        assert_eq!(session.state(), SessionState::Established);
    }

    #[test]
    fn request_twice_is_invalid() {
        let now = t0();
        let mut session = Session::new(peer(), 1, user_key(), SessionConfig::default(), now);
        session.request(NONCE, now).unwrap();

        let result = session.request(NONCE, now);
        assert!(matches!(result, Err(SessionError::InvalidState { operation: "request", .. })));
    }

    #[test]
    fn confirm_under_wrong_key_is_dropped() {
        let now = t0();
        let mut session = Session::new(peer(), 1, user_key(), SessionConfig::default(), now);
        session.request(NONCE, now).unwrap();
        session.handle_frame(&challenge_frame(), now).unwrap();

        let mut header = SecureHeader::new(ServiceType::SessionStatus);
        header.set_channel_id(SESSION_ID);
        let wrong = transcript().session_key(&derive_role_key("guess", KeyRole::User(1)));
        let forged =
            seal_frame(&wrong, MacProfile::Full, header, 1, status(StatusCode::AuthSuccess)).unwrap();

        let actions = session.handle_frame(&forged, now).unwrap();
        assert!(matches!(
            actions.as_slice(),
            [SessionAction::Security(SecurityEvent { reason: DropReason::Forged, .. })]
        ));
        assert_eq!(session.state(), SessionState::Authenticating);
    }

    #[test]
    fn plain_auth_failed_rejects() {
        let now = t0();
        let mut session = Session::new(peer(), 1, user_key(), SessionConfig::default(), now);
        session.request(NONCE, now).unwrap();
        session.handle_frame(&challenge_frame(), now).unwrap();

        let rejection =
            plain_frame(SecureHeader::new(ServiceType::SessionStatus), status(StatusCode::AuthFailed))
                .unwrap();
        let actions = session.handle_frame(&rejection, now).unwrap();

        assert_eq!(actions, vec![SessionAction::Close {
            reason: CloseReason::AuthenticationRejected
        }]);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            CloseReason::AuthenticationRejected.into_error(),
            Some(SessionError::AuthenticationRejected)
        );
    }

    #[test]
    fn plain_success_is_not_trusted() {
        let now = t0();
        let mut session = Session::new(peer(), 1, user_key(), SessionConfig::default(), now);
        session.request(NONCE, now).unwrap();
        session.handle_frame(&challenge_frame(), now).unwrap();

        let spoofed =
            plain_frame(SecureHeader::new(ServiceType::SessionStatus), status(StatusCode::AuthSuccess))
                .unwrap();
        let actions = session.handle_frame(&spoofed, now).unwrap();

        assert!(matches!(actions.as_slice(), [SessionAction::Security(_)]));
        assert_eq!(session.state(), SessionState::Authenticating);
    }

    #[test]
    fn handshake_times_out_after_five_seconds() {
        let now = t0();
        let mut session = Session::new(peer(), 1, user_key(), SessionConfig::default(), now);
        session.request(NONCE, now).unwrap();

        assert!(session.tick(now + Duration::from_millis(4_999)).is_empty());

        let actions = session.tick(now + Duration::from_secs(5));
        assert_eq!(actions, vec![SessionAction::Close {
            reason: CloseReason::HandshakeTimeout { elapsed: Duration::from_secs(5) }
        }]);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn data_delivered_once() {
        let now = t0();
        let mut session = established(now);

        let data = gateway_frame(101, Payload::SecureData(Bytes::from_static(b"1/1/1 on")));
        let actions = session.handle_frame(&data, now).unwrap();
        assert_eq!(actions, vec![SessionAction::Deliver {
            sequence: 101,
            payload: Bytes::from_static(b"1/1/1 on"),
        }]);

        let actions = session.handle_frame(&data, now).unwrap();
        assert!(matches!(
            actions.as_slice(),
            [SessionAction::Security(SecurityEvent { reason: DropReason::Replayed, .. })]
        ));
    }

    #[test]
    fn stale_sequence_rejected_on_unicast() {
        let now = t0();
        let mut session = established(now);

        session
            .handle_frame(&gateway_frame(110, Payload::SecureData(Bytes::from_static(b"a"))), now)
            .unwrap();
        let late = gateway_frame(105, Payload::SecureData(Bytes::from_static(b"b")));
        let actions = session.handle_frame(&late, now).unwrap();

        assert!(matches!(actions.as_slice(), [SessionAction::Security(_)]));
    }

    #[test]
    fn seal_before_established_is_invalid() {
        let now = t0();
        let mut session = Session::new(peer(), 1, user_key(), SessionConfig::default(), now);

        let result = session.seal(Bytes::from_static(b"x"), now);
        assert!(matches!(result, Err(SessionError::InvalidState { operation: "seal", .. })));
    }

    #[test]
    fn sealed_frames_count_from_zero() {
        let now = t0();
        let mut session = established(now);

        let first = session.seal(Bytes::from_static(b"a"), now).unwrap();
        let second = session.seal(Bytes::from_static(b"b"), now).unwrap();

        assert_eq!(first.header.sequence(), 0);
        assert_eq!(second.header.sequence(), 1);
        assert_eq!(first.header.channel_id(), SESSION_ID);

        let key = transcript().session_key(&user_key());
        assert!(crate::seal::authenticate(&key, MacProfile::Full, &first));
    }

    #[test]
    fn oversized_payload_rejected() {
        let now = t0();
        let mut session = established(now);
        let payload = Bytes::from(vec![0u8; SecureHeader::MAX_PAYLOAD_SIZE as usize + 1]);

        assert!(matches!(session.seal(payload, now), Err(SessionError::Protocol(_))));
    }

    #[test]
    fn keepalive_then_idle_timeout() {
        let now = t0();
        let mut session = established(now);

        assert!(session.tick(now + Duration::from_secs(14)).is_empty());

        let actions = session.tick(now + Duration::from_secs(15));
        let [SessionAction::SendFrame(frame)] = actions.as_slice() else {
            panic!("expected keep-alive");
        };
        assert_eq!(Payload::from_frame(frame).unwrap(), status(StatusCode::KeepAlive));

        let actions = session.tick(now + Duration::from_secs(60));
        assert!(matches!(actions.as_slice(), [SessionAction::Close {
            reason: CloseReason::IdleTimeout { .. }
        }]));
    }

    #[test]
    fn peer_keepalive_resets_idle_timer() {
        let now = t0();
        let mut session = established(now);

        let later = now + Duration::from_secs(50);
        session.handle_frame(&gateway_frame(101, status(StatusCode::KeepAlive)), later).unwrap();

        let actions = session.tick(now + Duration::from_secs(70));
        assert!(!actions.iter().any(|a| matches!(a, SessionAction::Close { .. })));
    }

    #[test]
    fn peer_close_closes() {
        let now = t0();
        let mut session = established(now);

        let actions = session.handle_frame(&gateway_frame(101, status(StatusCode::Close)), now).unwrap();
        assert_eq!(actions, vec![SessionAction::Close { reason: CloseReason::PeerClosed }]);

        let data = gateway_frame(102, Payload::SecureData(Bytes::from_static(b"late")));
        assert!(session.handle_frame(&data, now).unwrap().is_empty());
    }

    #[test]
    fn local_close_notifies_peer_once() {
        let now = t0();
        let mut session = established(now);

        let actions = session.close(now);
        assert_eq!(actions.len(), 2);
        let SessionAction::SendFrame(frame) = &actions[0] else {
            panic!("expected close frame");
        };
        assert!(frame.header.flags().is_authenticated());
        assert_eq!(Payload::from_frame(frame).unwrap(), status(StatusCode::Close));

        assert!(session.close(now).is_empty());
    }

    #[test]
    fn data_during_handshake_is_unexpected() {
        let now = t0();
        let mut session = Session::new(peer(), 1, user_key(), SessionConfig::default(), now);
        session.request(NONCE, now).unwrap();

        let data = gateway_frame(1, Payload::SecureData(Bytes::from_static(b"x")));
        let result = session.handle_frame(&data, now);
        assert!(matches!(result, Err(SessionError::UnexpectedFrame { .. })));
    }
}
