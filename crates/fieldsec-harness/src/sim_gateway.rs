//! Simulated field gateway.
//!
//! `SimGateway` drives the core `Responder` over any datagram transport. It
//! plays the gateway half of the unicast handshake for client scenarios and
//! reports what it saw as [`GatewayEvent`]s.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use fieldsec_channel::{DatagramTransport, MAX_DATAGRAM_SIZE, TransportError};
use fieldsec_core::{
    CloseReason, Environment, Responder, ResponderAction, SecurityEvent, SessionConfig,
};
use fieldsec_crypto::{KeyRole, derive_role_key};
use fieldsec_proto::Frame;
use tokio::sync::mpsc;

use crate::SimEnv;

/// How the gateway treats clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatewayBehavior {
    /// Complete handshakes and echo every payload back
    #[default]
    Echo,
    /// Complete handshakes, accept data, never answer it
    Sink,
    /// Read and discard every datagram
    Silent,
}

/// What the gateway observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// A client completed the handshake
    Established {
        /// Assigned session id
        session_id: u16,
        /// Client address
        peer: SocketAddr,
        /// User the client authenticated as
        user_id: u8,
    },
    /// Authentic data arrived
    Delivered {
        /// Session the data arrived on
        session_id: u16,
        /// Payload
        payload: Bytes,
    },
    /// A session ended
    Closed {
        /// Session id
        session_id: u16,
        /// Why it ended
        reason: CloseReason,
    },
    /// A frame was dropped
    Dropped(SecurityEvent),
}

/// Gateway driving a `Responder` over a simulated transport.
pub struct SimGateway {
    responder: Responder<tokio::time::Instant>,
    transport: Arc<dyn DatagramTransport>,
    env: SimEnv,
    behavior: GatewayBehavior,
    events: mpsc::UnboundedSender<GatewayEvent>,
    tick_interval: Duration,
}

impl SimGateway {
    /// Gateway on `transport`; returns the event stream alongside.
    pub fn new(
        transport: Arc<dyn DatagramTransport>,
        env: SimEnv,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let gateway = Self {
            responder: Responder::new(config),
            transport,
            env,
            behavior: GatewayBehavior::default(),
            events,
            tick_interval: Duration::from_millis(100),
        };
        (gateway, receiver)
    }

    /// Accept `user_id` with `password`.
    #[must_use]
    pub fn with_user(mut self, user_id: u8, password: &str) -> Self {
        self.responder.add_user(user_id, derive_role_key(password, KeyRole::User(user_id)));
        self
    }

    /// Change how clients are treated.
    #[must_use]
    pub fn with_behavior(mut self, behavior: GatewayBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Serve until the transport fails.
    pub async fn run(mut self) -> Result<(), TransportError> {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut ticker = tokio::time::interval(self.tick_interval);

        loop {
            let actions = tokio::select! {
                received = self.transport.recv_from(&mut buffer) => {
                    let (len, from) = received?;
                    if self.behavior == GatewayBehavior::Silent {
                        tracing::trace!(%from, "silent gateway discarding datagram");
                        continue;
                    }
                    self.receive(&buffer[..len], from)
                }
                _ = ticker.tick() => self.responder.tick(self.env.now()),
            };

            self.execute(actions).await?;
        }
    }

    fn receive(&mut self, datagram: &[u8], from: SocketAddr) -> Vec<ResponderAction> {
        let frame = match Frame::decode(datagram) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(%from, error = %err, "gateway dropped undecodable datagram");
                return vec![ResponderAction::Security(SecurityEvent::malformed())];
            },
        };

        let now = self.env.now();
        match self.responder.handle_frame(&self.env, from, &frame, now) {
            Ok(actions) => actions,
            Err(err) => {
                tracing::debug!(%from, error = %err, "gateway rejected frame");
                vec![]
            },
        }
    }

    async fn execute(&mut self, actions: Vec<ResponderAction>) -> Result<(), TransportError> {
        let mut pending = actions;

        while !pending.is_empty() {
            for action in std::mem::take(&mut pending) {
                match action {
                    ResponderAction::SendFrame { to, frame } => {
                        let datagram =
                            frame.to_vec().map_err(|e| TransportError::Encode(e.to_string()))?;
                        self.transport.send_to(&datagram, to).await?;
                    },
                    ResponderAction::SessionEstablished { session_id, peer, user_id } => {
                        self.emit(GatewayEvent::Established { session_id, peer, user_id });
                    },
                    ResponderAction::Deliver { session_id, payload, .. } => {
                        if self.behavior == GatewayBehavior::Echo {
                            match self.responder.seal(session_id, payload.clone()) {
                                Ok((to, frame)) => {
                                    pending.push(ResponderAction::SendFrame { to, frame });
                                },
                                Err(err) => tracing::warn!(session_id, error = %err, "echo failed"),
                            }
                        }
                        self.emit(GatewayEvent::Delivered { session_id, payload });
                    },
                    ResponderAction::SessionClosed { session_id, reason } => {
                        self.emit(GatewayEvent::Closed { session_id, reason });
                    },
                    ResponderAction::Security(event) => self.emit(GatewayEvent::Dropped(event)),
                }
            }
        }

        Ok(())
    }

    fn emit(&self, event: GatewayEvent) {
        // Scenarios that ignore events drop the receiver
        let _ = self.events.send(event);
    }
}
