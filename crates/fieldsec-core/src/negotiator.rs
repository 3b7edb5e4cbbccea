//! Unicast handshake negotiator.
//!
//! Owns every session that is still negotiating, keyed by peer address, and
//! enforces at most one negotiation in flight per peer. Established sessions
//! are handed off with [`Negotiator::take_established`] to whoever drives the
//! data phase; failed ones are dropped on the next [`Negotiator::tick`].

use std::{
    collections::HashMap,
    net::SocketAddr,
    ops::Sub,
    time::{Duration, Instant},
};

use fieldsec_crypto::DerivedKey;
use fieldsec_proto::Frame;

use crate::{
    error::SessionError,
    session::{Session, SessionAction, SessionConfig, SessionState},
};

/// Negotiations in flight.
#[derive(Debug)]
pub struct Negotiator<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    pending: HashMap<SocketAddr, Session<I>>,
    config: SessionConfig,
}

impl<I> Negotiator<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Empty negotiator; every session it starts uses `config`.
    pub fn new(config: SessionConfig) -> Self {
        Self { pending: HashMap::new(), config }
    }

    /// Start a handshake with `peer`.
    ///
    /// # Errors
    ///
    /// - `SessionError::SessionAlreadyNegotiating` if a handshake with `peer`
    ///   is already in flight
    pub fn begin(
        &mut self,
        peer: SocketAddr,
        user_id: u8,
        role_key: DerivedKey,
        client_nonce: [u8; 16],
        now: I,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if self.pending.contains_key(&peer) {
            return Err(SessionError::SessionAlreadyNegotiating { peer });
        }

        let mut session = Session::new(peer, user_id, role_key, self.config, now);
        let actions = session.request(client_nonce, now)?;
        self.pending.insert(peer, session);

        Ok(actions)
    }

    /// Route a frame from `peer` to its negotiation.
    ///
    /// Frames from peers with no negotiation in flight are ignored.
    ///
    /// # Errors
    ///
    /// - Any error from [`Session::handle_frame`]
    pub fn handle_frame(
        &mut self,
        peer: SocketAddr,
        frame: &Frame,
        now: I,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let Some(session) = self.pending.get_mut(&peer) else {
            tracing::debug!(%peer, "frame from peer with no negotiation in flight");
            return Ok(vec![]);
        };

        let actions = session.handle_frame(frame, now)?;
        if session.state() == SessionState::Closed {
            self.pending.remove(&peer);
        }

        Ok(actions)
    }

    /// Remove and return the session with `peer` if its handshake completed.
    pub fn take_established(&mut self, peer: SocketAddr) -> Option<Session<I>> {
        match self.pending.get(&peer) {
            Some(session) if session.state() == SessionState::Established => {
                self.pending.remove(&peer)
            },
            _ => None,
        }
    }

    /// Drive handshake timeouts.
    ///
    /// Sessions that time out are removed; their close actions are returned
    /// tagged with the peer address.
    pub fn tick(&mut self, now: I) -> Vec<(SocketAddr, SessionAction)> {
        let mut actions = Vec::new();

        for (peer, session) in &mut self.pending {
            if session.state() == SessionState::Established {
                continue;
            }
            actions.extend(session.tick(now).into_iter().map(|action| (*peer, action)));
        }

        self.pending.retain(|_, session| session.state() != SessionState::Closed);
        actions
    }

    /// Drive the handshake timeout of the negotiation with `peer` only.
    ///
    /// Used by drivers that own one negotiation each while sharing the
    /// negotiator; a timed-out session is removed.
    pub fn tick_peer(&mut self, peer: SocketAddr, now: I) -> Vec<SessionAction> {
        let Some(session) = self.pending.get_mut(&peer) else {
            return vec![];
        };
        if session.state() == SessionState::Established {
            return vec![];
        }

        let actions = session.tick(now);
        if session.state() == SessionState::Closed {
            self.pending.remove(&peer);
        }
        actions
    }

    /// Abandon the negotiation with `peer`, if any.
    pub fn abort(&mut self, peer: SocketAddr) {
        if self.pending.remove(&peer).is_some() {
            tracing::debug!(%peer, "negotiation aborted");
        }
    }

    /// Whether a negotiation with `peer` is in flight.
    pub fn is_negotiating(&self, peer: SocketAddr) -> bool {
        self.pending.contains_key(&peer)
    }

    /// Number of negotiations in flight.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no negotiation is in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
