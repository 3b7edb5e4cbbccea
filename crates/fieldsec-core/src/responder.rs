//! Gateway side of the unicast handshake.
//!
//! One responder serves many clients. Sessions are keyed by the 16-bit
//! session id the responder assigns in its challenge; every later frame
//! carries that id in the `channel_id` header field and must come from the
//! address that started the session.
//!
//! Handshake frames arrive unauthenticated by necessity. Nothing an
//! unauthenticated frame does can touch an established session: requests
//! only create new challenged sessions, and responses only complete the
//! session they name.

use std::{
    collections::HashMap,
    net::SocketAddr,
    ops::Sub,
    time::{Duration, Instant},
};

use bytes::Bytes;
use fieldsec_crypto::{DerivedKey, KeyRole, Keyring, MacProfile, Transcript};
use fieldsec_proto::{
    Frame, Payload, ProtocolError, SecureHeader, ServiceType, SessionChallenge, SessionStatus,
    StatusCode,
};

use crate::{
    env::Environment,
    error::SessionError,
    observer::{DropReason, SecurityEvent},
    seal::{open_first, open_frame, plain_frame, seal_frame},
    sequence::{SequenceCounter, SequenceState},
    session::{CloseReason, SessionConfig, SessionState},
};

/// Attempts at drawing an unused random session id before refusing a request
const SESSION_ID_ATTEMPTS: usize = 8;

/// Actions returned by the responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderAction {
    /// Send this frame to a client
    SendFrame {
        /// Client address
        to: SocketAddr,
        /// Frame to send
        frame: Frame,
    },

    /// A client completed the handshake
    SessionEstablished {
        /// Assigned session id
        session_id: u16,
        /// Client address
        peer: SocketAddr,
        /// Tunnelling user the client authenticated as
        user_id: u8,
    },

    /// Authentic, fresh application data from a client
    Deliver {
        /// Session the data arrived on
        session_id: u16,
        /// Sequence number the client stamped on the frame
        sequence: u64,
        /// Application payload
        payload: Bytes,
    },

    /// An established session ended
    SessionClosed {
        /// Session id
        session_id: u16,
        /// Why it closed
        reason: CloseReason,
    },

    /// A frame was dropped
    Security(SecurityEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Challenged,
    Established,
}

#[derive(Debug)]
struct ClientSession<I> {
    peer: SocketAddr,
    user_id: u8,
    phase: Phase,
    transcript: Transcript,
    session_key: DerivedKey,
    /// Created from the client's first authentic frame
    incoming: Option<SequenceState<I>>,
    outgoing: SequenceCounter,
    started: I,
    last_received: I,
}

impl<I: Copy> ClientSession<I> {
    fn open(&mut self, frame: &Frame, profile: MacProfile, now: I) -> Result<u64, DropReason> {
        let sequence = match &mut self.incoming {
            Some(window) => open_frame(&self.session_key, profile, frame, window, now)?,
            None => {
                let window = open_first(&self.session_key, profile, frame, 0, now)?;
                let sequence = window.highest();
                self.incoming = Some(window);
                sequence
            },
        };

        self.last_received = now;
        Ok(sequence)
    }

    fn state(&self) -> SessionState {
        match self.phase {
            Phase::Challenged => SessionState::Authenticating,
            Phase::Established => SessionState::Established,
        }
    }
}

/// Accepts secure sessions from clients.
///
/// Pure state machine like [`crate::session::Session`]; the gateway driver
/// feeds it datagrams and executes the returned actions.
#[derive(Debug)]
pub struct Responder<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    user_keys: HashMap<u8, DerivedKey>,
    sessions: HashMap<u16, ClientSession<I>>,
    config: SessionConfig,
}

impl<I> Responder<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Responder that knows no users yet.
    pub fn new(config: SessionConfig) -> Self {
        Self { user_keys: HashMap::new(), sessions: HashMap::new(), config }
    }

    /// Responder accepting every user key held by `keyring`.
    pub fn from_keyring(keyring: &Keyring, config: SessionConfig) -> Self {
        let mut responder = Self::new(config);
        for role in keyring.roles() {
            if let (KeyRole::User(user_id), Some(key)) = (role, keyring.key(role)) {
                responder.add_user(user_id, key.clone());
            }
        }
        responder
    }

    /// Accept `user_id` authenticating with `key`.
    pub fn add_user(&mut self, user_id: u8, key: DerivedKey) {
        self.user_keys.insert(user_id, key);
    }

    /// Number of sessions, challenged or established.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Client address of an established session.
    pub fn peer(&self, session_id: u16) -> Option<SocketAddr> {
        self.sessions
            .get(&session_id)
            .filter(|session| session.phase == Phase::Established)
            .map(|session| session.peer)
    }

    /// Process a frame from `from`.
    ///
    /// # Errors
    ///
    /// - `SessionError::UnexpectedFrame` for services a client never sends
    /// - `SessionError::Protocol` if a handshake payload does not decode
    pub fn handle_frame<E>(
        &mut self,
        env: &E,
        from: SocketAddr,
        frame: &Frame,
        now: I,
    ) -> Result<Vec<ResponderAction>, SessionError>
    where
        E: Environment<Instant = I>,
    {
        match frame.header.service_type() {
            Some(ServiceType::SessionRequest) => self.handle_request(env, from, frame, now),
            Some(ServiceType::SessionResponse) => self.handle_response(from, frame, now),
            Some(service @ (ServiceType::SecureData | ServiceType::SessionStatus)) => {
                Ok(self.handle_established(from, frame, service, now))
            },
            _ => Err(SessionError::UnexpectedFrame {
                state: SessionState::Idle,
                service: frame.header.service(),
            }),
        }
    }

    /// Seal application data for an established session.
    ///
    /// Returns the client address with the frame.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` if the session is not established
    /// - `SessionError::Protocol` if the payload exceeds the frame limit
    /// - `SessionError::SequenceExhausted` once the 48-bit counter is used up
    pub fn seal(
        &mut self,
        session_id: u16,
        payload: Bytes,
    ) -> Result<(SocketAddr, Frame), SessionError> {
        let max = SecureHeader::MAX_PAYLOAD_SIZE as usize;
        if payload.len() > max {
            return Err(ProtocolError::PayloadTooLarge { size: payload.len(), max }.into());
        }

        let profile = self.config.mac_profile;
        let session = self.established_mut(session_id, "seal")?;
        let frame = seal_to(session, session_id, profile, Payload::SecureData(payload))?;
        Ok((session.peer, frame))
    }

    /// Close an established session, notifying the client.
    pub fn close(&mut self, session_id: u16) -> Vec<ResponderAction> {
        let Some(mut session) = self.sessions.remove(&session_id) else {
            return vec![];
        };

        let mut actions = Vec::new();
        if session.phase == Phase::Established {
            let close = Payload::SessionStatus(SessionStatus::new(StatusCode::Close));
            match seal_to(&mut session, session_id, self.config.mac_profile, close) {
                Ok(frame) => actions.push(ResponderAction::SendFrame { to: session.peer, frame }),
                Err(err) => tracing::warn!(session_id, error = %err, "could not seal close"),
            }
            actions.push(ResponderAction::SessionClosed {
                session_id,
                reason: CloseReason::LocalClose,
            });
        }

        actions
    }

    /// Drive handshake and idle timeouts.
    pub fn tick(&mut self, now: I) -> Vec<ResponderAction> {
        let mut actions = Vec::new();
        let config = self.config;

        self.sessions.retain(|&session_id, session| {
            if session.phase == Phase::Challenged {
                let expired = now - session.started >= config.handshake_timeout;
                if expired {
                    tracing::debug!(session_id, peer = %session.peer, "challenge expired");
                }
                return !expired;
            }

            let elapsed = now - session.last_received;
            if elapsed < config.idle_timeout {
                return true;
            }

            let reason = CloseReason::IdleTimeout { elapsed };
            tracing::warn!(session_id, peer = %session.peer, %reason, "client session expired");
            actions.push(ResponderAction::SessionClosed { session_id, reason });
            false
        });

        actions
    }

    fn handle_request<E>(
        &mut self,
        env: &E,
        from: SocketAddr,
        frame: &Frame,
        now: I,
    ) -> Result<Vec<ResponderAction>, SessionError>
    where
        E: Environment<Instant = I>,
    {
        let Payload::SessionRequest(request) = Payload::from_frame(frame)? else {
            return Err(SessionError::Protocol("request frame without request".to_string()));
        };

        // One challenge per client address; a retried request replaces it
        self.sessions
            .retain(|_, session| !(session.peer == from && session.phase == Phase::Challenged));

        let Some(role_key) = self.user_keys.get(&request.user_id) else {
            tracing::warn!(peer = %from, user_id = request.user_id, "request for unknown user");
            return refuse(from, 0);
        };

        let Some(session_id) = self.allocate_session_id(env) else {
            tracing::warn!(peer = %from, "no free session id");
            return refuse(from, 0);
        };

        let transcript = Transcript {
            session_id,
            role: KeyRole::User(request.user_id),
            client_nonce: request.client_nonce,
            challenge: env.random_nonce(),
        };
        let session_key = transcript.session_key(role_key);

        let mut header = SecureHeader::new(ServiceType::SessionChallenge);
        header.set_channel_id(session_id);
        let challenge = Payload::SessionChallenge(SessionChallenge {
            session_id,
            challenge: transcript.challenge,
        });
        let reply = plain_frame(header, challenge)?;

        self.sessions.insert(session_id, ClientSession {
            peer: from,
            user_id: request.user_id,
            phase: Phase::Challenged,
            transcript,
            session_key,
            incoming: None,
            outgoing: SequenceCounter::starting_at(0),
            started: now,
            last_received: now,
        });

        tracing::debug!(peer = %from, session_id, user_id = request.user_id, "challenge issued");

        Ok(vec![ResponderAction::SendFrame { to: from, frame: reply }])
    }

    fn handle_response(
        &mut self,
        from: SocketAddr,
        frame: &Frame,
        now: I,
    ) -> Result<Vec<ResponderAction>, SessionError> {
        let session_id = frame.header.channel_id();
        let profile = self.config.mac_profile;
        let malformed = || {
            Ok(vec![ResponderAction::Security(SecurityEvent::for_frame(
                DropReason::Malformed,
                &frame.header,
            ))])
        };

        let Some(session) = self.sessions.get_mut(&session_id) else {
            return malformed();
        };
        if session.peer != from || session.phase != Phase::Challenged {
            return malformed();
        }

        let Payload::SessionResponse(response) = Payload::from_frame(frame)? else {
            return Err(SessionError::Protocol("response frame without response".to_string()));
        };

        let Some(role_key) = self.user_keys.get(&session.user_id) else {
            return malformed();
        };

        if session.transcript.verify_response(role_key, &response.response).is_err() {
            tracing::warn!(
                peer = %from,
                session_id,
                user_id = session.user_id,
                "handshake response rejected"
            );
            self.sessions.remove(&session_id);
            return refuse(from, session_id);
        }

        session.phase = Phase::Established;
        session.last_received = now;

        let confirm = Payload::SessionStatus(SessionStatus::new(StatusCode::AuthSuccess));
        let frame = seal_to(session, session_id, profile, confirm)?;
        let user_id = session.user_id;

        tracing::info!(peer = %from, session_id, user_id, "secure session established");

        Ok(vec![
            ResponderAction::SendFrame { to: from, frame },
            ResponderAction::SessionEstablished { session_id, peer: from, user_id },
        ])
    }

    fn handle_established(
        &mut self,
        from: SocketAddr,
        frame: &Frame,
        service: ServiceType,
        now: I,
    ) -> Vec<ResponderAction> {
        let session_id = frame.header.channel_id();
        let profile = self.config.mac_profile;
        let dropped = |reason: DropReason| {
            vec![ResponderAction::Security(SecurityEvent::for_frame(reason, &frame.header))]
        };

        let Some(session) = self.sessions.get_mut(&session_id) else {
            return dropped(DropReason::Malformed);
        };
        if session.peer != from || session.phase != Phase::Established {
            return dropped(DropReason::Malformed);
        }

        let sequence = match session.open(frame, profile, now) {
            Ok(sequence) => sequence,
            Err(reason) => return dropped(reason),
        };

        if service == ServiceType::SecureData {
            return vec![ResponderAction::Deliver {
                session_id,
                sequence,
                payload: frame.payload.clone(),
            }];
        }

        let status = match Payload::from_frame(frame) {
            Ok(Payload::SessionStatus(status)) => status.status,
            _ => return dropped(DropReason::Malformed),
        };

        match status {
            StatusCode::KeepAlive => {
                let echo = Payload::SessionStatus(SessionStatus::new(StatusCode::KeepAlive));
                match seal_to(session, session_id, profile, echo) {
                    Ok(frame) => vec![ResponderAction::SendFrame { to: from, frame }],
                    Err(err) => {
                        tracing::warn!(session_id, error = %err, "could not seal keep-alive echo");
                        vec![]
                    },
                }
            },
            StatusCode::AuthSuccess => vec![],
            StatusCode::Close
            | StatusCode::Timeout
            | StatusCode::Unauthenticated
            | StatusCode::AuthFailed => {
                self.sessions.remove(&session_id);
                tracing::info!(peer = %from, session_id, "client closed session");
                vec![ResponderAction::SessionClosed { session_id, reason: CloseReason::PeerClosed }]
            },
        }
    }

    fn established_mut(
        &mut self,
        session_id: u16,
        operation: &'static str,
    ) -> Result<&mut ClientSession<I>, SessionError> {
        match self.sessions.get_mut(&session_id) {
            Some(session) if session.phase == Phase::Established => Ok(session),
            Some(session) => Err(SessionError::InvalidState { state: session.state(), operation }),
            None => Err(SessionError::InvalidState { state: SessionState::Closed, operation }),
        }
    }

    fn allocate_session_id<E: Environment>(&self, env: &E) -> Option<u16> {
        (0..SESSION_ID_ATTEMPTS).find_map(|_| {
            let mut bytes = [0u8; 2];
            env.random_bytes(&mut bytes);
            let session_id = u16::from_be_bytes(bytes);
            (session_id != 0 && !self.sessions.contains_key(&session_id)).then_some(session_id)
        })
    }
}

fn seal_to<I>(
    session: &mut ClientSession<I>,
    session_id: u16,
    profile: MacProfile,
    payload: Payload,
) -> Result<Frame, SessionError> {
    let sequence = session.outgoing.next()?;
    let mut header = SecureHeader::new(payload.service());
    header.set_channel_id(session_id);

    Ok(seal_frame(&session.session_key, profile, header, sequence, payload)?)
}

fn refuse(to: SocketAddr, session_id: u16) -> Result<Vec<ResponderAction>, SessionError> {
    let mut header = SecureHeader::new(ServiceType::SessionStatus);
    header.set_channel_id(session_id);
    let frame =
        plain_frame(header, Payload::SessionStatus(SessionStatus::new(StatusCode::AuthFailed)))?;

    Ok(vec![ResponderAction::SendFrame { to, frame }])
}
