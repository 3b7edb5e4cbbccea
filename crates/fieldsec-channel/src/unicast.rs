//! Unicast secure sessions over datagrams.
//!
//! [`SecureConnector`] runs handshakes through a shared [`Negotiator`], so at
//! most one negotiation per peer is in flight across every channel opened
//! through the same connector. Once a session is established it is moved
//! out of the negotiator into its own driver task.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use fieldsec_core::{
    CloseReason, DropReason, Environment, Negotiator, SecurityEvent, SecurityObserver, Session,
    SessionAction, SessionError,
};
use fieldsec_crypto::{DerivedKey, KeyRole, derive_role_key};
use fieldsec_proto::Frame;
use tokio::{
    sync::mpsc,
    time::{MissedTickBehavior, interval},
};
use zeroize::Zeroizing;

use crate::{
    channel::{Command, DriverHandle, Inbound, SecureChannel},
    config::{ChannelConfig, DEFAULT_COMMAND_CAPACITY},
    error::ChannelError,
    system_env::SystemEnv,
    transport::{DatagramTransport, MAX_DATAGRAM_SIZE, UdpTransport, send_frame},
};

/// Open a secure unicast session with the gateway at `peer`.
///
/// Derives the role key from `password` (off the async runtime), binds a UDP
/// socket and runs the handshake. Each call uses its own negotiator; share a
/// [`SecureConnector`] to enforce one negotiation per peer across calls.
///
/// # Errors
///
/// - `ChannelError::Session(UnsupportedRole)` unless `role` is a user role
/// - `ChannelError::HandshakeTimeout` if the gateway does not answer in time
/// - `ChannelError::HandshakeRejected` if the gateway refuses the credentials
/// - Transport errors from binding or sending
pub async fn open_secure_unicast(
    peer: SocketAddr,
    role: KeyRole,
    password: &str,
    config: ChannelConfig,
) -> Result<UnicastChannel, ChannelError> {
    SecureConnector::new(config).open(peer, role, password).await
}

/// Opens unicast channels through one shared negotiator.
#[derive(Clone)]
pub struct SecureConnector<E: Environment = SystemEnv> {
    negotiator: Arc<Mutex<Negotiator<E::Instant>>>,
    env: E,
    config: ChannelConfig,
}

impl SecureConnector<SystemEnv> {
    /// Connector using system time and randomness.
    pub fn new(config: ChannelConfig) -> Self {
        Self::with_env(SystemEnv::new(), config)
    }
}

impl<E: Environment> SecureConnector<E> {
    /// Connector using `env` for time and randomness.
    pub fn with_env(env: E, config: ChannelConfig) -> Self {
        let negotiator = Negotiator::new(config.session);
        Self { negotiator: Arc::new(Mutex::new(negotiator)), env, config }
    }

    /// Number of handshakes currently in flight.
    pub fn negotiations_in_flight(&self) -> usize {
        lock(&self.negotiator).len()
    }

    /// Derive the key for `role`, bind a UDP socket and connect to `peer`.
    pub async fn open(
        &self,
        peer: SocketAddr,
        role: KeyRole,
        password: &str,
    ) -> Result<UnicastChannel, ChannelError> {
        self.config.validate()?;
        let (user_id, role_key) = derive_user_key(role, password).await?;
        let transport = UdpTransport::bind(self.config.bind_address_for(peer)).await?;

        self.connect(Arc::new(transport), peer, user_id, role_key).await
    }

    /// Run the handshake with `peer` over `transport`.
    ///
    /// Returns once the gateway's authenticated confirm has been verified.
    /// Dropping the returned future abandons the negotiation.
    pub async fn connect(
        &self,
        transport: Arc<dyn DatagramTransport>,
        peer: SocketAddr,
        user_id: u8,
        role_key: DerivedKey,
    ) -> Result<UnicastChannel, ChannelError> {
        self.config.validate()?;

        let nonce = self.env.random_nonce();
        let started = lock(&self.negotiator).begin(peer, user_id, role_key, nonce, self.env.now());
        let mut pending = started?;
        let mut guard = NegotiationGuard { negotiator: &self.negotiator, peer, armed: true };

        tracing::info!(%peer, user_id, "negotiating secure session");

        let observer = &self.config.observer;
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            for action in std::mem::take(&mut pending) {
                match action {
                    SessionAction::SendFrame(frame) => {
                        send_frame(transport.as_ref(), &frame, peer).await?;
                    },
                    SessionAction::Security(event) => observer.on_drop(&event),
                    SessionAction::Established { session_id } => {
                        let taken = lock(&self.negotiator).take_established(peer);
                        guard.armed = false;
                        let session = taken.ok_or_else(|| {
                            ChannelError::Internal("established session missing".into())
                        })?;

                        tracing::info!(%peer, session_id, "secure session established");
                        return Ok(self.spawn(session, transport, session_id));
                    },
                    SessionAction::Close { reason } => {
                        guard.armed = false;
                        tracing::warn!(%peer, %reason, "secure session negotiation failed");
                        return Err(reason.into_error().map_or(ChannelError::Closed, Into::into));
                    },
                    SessionAction::Deliver { .. } => {},
                }
            }

            tokio::select! {
                received = transport.recv_from(&mut buffer) => {
                    let (len, from) = match received {
                        Ok(received) => received,
                        Err(err) if err.is_transient() => {
                            tracing::warn!(%peer, error = %err, "receive failed during handshake");
                            continue;
                        },
                        Err(err) => return Err(err.into()),
                    };
                    if from != peer {
                        tracing::debug!(%peer, %from, "datagram from unexpected address");
                        continue;
                    }

                    let frame = match Frame::decode(&buffer[..len]) {
                        Ok(frame) => frame,
                        Err(err) => {
                            tracing::debug!(%peer, error = %err, "undecodable handshake datagram");
                            observer.on_drop(&SecurityEvent::malformed());
                            continue;
                        },
                    };

                    let result = lock(&self.negotiator).handle_frame(peer, &frame, self.env.now());
                    match result {
                        Ok(actions) => pending = actions,
                        Err(err) => {
                            tracing::debug!(%peer, error = %err, "handshake frame rejected");
                            observer.on_drop(&SecurityEvent::for_frame(DropReason::Malformed, &frame.header));
                        },
                    }
                }

                _ = ticker.tick() => {
                    pending = lock(&self.negotiator).tick_peer(peer, self.env.now());
                }
            }
        }
    }

    fn spawn(
        &self,
        session: Session<E::Instant>,
        transport: Arc<dyn DatagramTransport>,
        session_id: u16,
    ) -> UnicastChannel {
        let (commands_tx, commands_rx) = mpsc::channel(DEFAULT_COMMAND_CAPACITY);
        let (deliveries_tx, deliveries_rx) = mpsc::channel(self.config.delivery_capacity);
        let peer = session.peer();

        let driver = SessionDriver {
            session,
            transport,
            env: self.env.clone(),
            observer: Arc::clone(&self.config.observer),
            deliveries: deliveries_tx,
            peer,
            session_id,
        };
        let task = tokio::spawn(driver.run(commands_rx, self.config.tick_interval));

        UnicastChannel { peer, session_id, handle: DriverHandle::new(commands_tx, deliveries_rx, task) }
    }
}

/// An established unicast secure session.
#[derive(Debug)]
pub struct UnicastChannel {
    peer: SocketAddr,
    session_id: u16,
    handle: DriverHandle<Result<CloseReason, ChannelError>>,
}

impl UnicastChannel {
    /// Gateway address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Session id assigned by the gateway.
    pub fn session_id(&self) -> u16 {
        self.session_id
    }
}

#[async_trait]
impl SecureChannel for UnicastChannel {
    async fn send(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        self.handle.send(payload).await
    }

    async fn receive(&mut self) -> Option<Inbound> {
        self.handle.receive().await
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        match self.handle.shutdown().await? {
            Some(Err(err)) => Err(err),
            Some(Ok(reason)) => {
                tracing::debug!(peer = %self.peer, session_id = self.session_id, %reason, "channel closed");
                Ok(())
            },
            None => Ok(()),
        }
    }
}

/// Aborts the negotiation if `connect` exits without handing it off.
struct NegotiationGuard<'a, I>
where
    I: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>,
{
    negotiator: &'a Mutex<Negotiator<I>>,
    peer: SocketAddr,
    armed: bool,
}

impl<I> Drop for NegotiationGuard<'_, I>
where
    I: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>,
{
    fn drop(&mut self) {
        if self.armed {
            lock(self.negotiator).abort(self.peer);
        }
    }
}

/// Owns one established session and its socket.
struct SessionDriver<E: Environment> {
    session: Session<E::Instant>,
    transport: Arc<dyn DatagramTransport>,
    env: E,
    observer: Arc<dyn SecurityObserver>,
    deliveries: mpsc::Sender<Inbound>,
    peer: SocketAddr,
    session_id: u16,
}

impl<E: Environment> SessionDriver<E> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        tick_interval: Duration,
    ) -> Result<CloseReason, ChannelError> {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            let actions = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send { payload, reply }) => {
                        let result = self.send(payload).await;
                        let _ = reply.send(result);
                        continue;
                    },
                    Some(Command::Close) | None => self.session.close(self.env.now()),
                },

                received = self.transport.recv_from(&mut buffer) => match received {
                    Ok((len, from)) => self.receive(&buffer[..len], from),
                    Err(err) if err.is_transient() => {
                        tracing::warn!(peer = %self.peer, error = %err, "receive failed");
                        continue;
                    },
                    Err(err) => break Err(err.into()),
                },

                _ = ticker.tick() => self.session.tick(self.env.now()),
            };

            if let Some(reason) = self.execute(actions).await {
                break Ok(reason);
            }
        };

        match &outcome {
            Ok(reason) => {
                tracing::info!(peer = %self.peer, session_id = self.session_id, %reason, "secure session ended");
            },
            Err(err) => {
                tracing::error!(peer = %self.peer, session_id = self.session_id, error = %err, "session driver failed");
            },
        }
        outcome
    }

    async fn send(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        let frame = self.session.seal(payload, self.env.now())?;
        send_frame(self.transport.as_ref(), &frame, self.peer).await?;
        Ok(())
    }

    fn receive(&mut self, datagram: &[u8], from: SocketAddr) -> Vec<SessionAction> {
        if from != self.peer {
            tracing::debug!(peer = %self.peer, %from, "datagram from unexpected address");
            return vec![];
        }

        let frame = match Frame::decode(datagram) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(peer = %self.peer, error = %err, "undecodable datagram");
                return vec![SessionAction::Security(SecurityEvent::malformed())];
            },
        };

        match self.session.handle_frame(&frame, self.env.now()) {
            Ok(actions) => actions,
            Err(err) => {
                tracing::debug!(peer = %self.peer, error = %err, "frame rejected");
                vec![SessionAction::Security(SecurityEvent::for_frame(
                    DropReason::Malformed,
                    &frame.header,
                ))]
            },
        }
    }

    /// Execute actions; returns the close reason once the session ends.
    async fn execute(&mut self, actions: Vec<SessionAction>) -> Option<CloseReason> {
        for action in actions {
            match action {
                SessionAction::SendFrame(frame) => {
                    if let Err(err) = send_frame(self.transport.as_ref(), &frame, self.peer).await {
                        tracing::warn!(peer = %self.peer, error = %err, "failed to send frame");
                    }
                },
                SessionAction::Deliver { sequence, payload } => {
                    let inbound = Inbound { sender_id: u64::from(self.session_id), sequence, payload };
                    if self.deliveries.send(inbound).await.is_err() {
                        tracing::debug!(peer = %self.peer, sequence, "receiver gone, payload discarded");
                    }
                },
                SessionAction::Security(event) => self.observer.on_drop(&event),
                SessionAction::Established { .. } => {},
                SessionAction::Close { reason } => return Some(reason),
            }
        }
        None
    }
}

/// Derive the key of a user role off the async runtime.
async fn derive_user_key(role: KeyRole, password: &str) -> Result<(u8, DerivedKey), ChannelError> {
    let KeyRole::User(user_id) = role else {
        return Err(SessionError::UnsupportedRole(role).into());
    };

    let password = Zeroizing::new(password.to_owned());
    let key = tokio::task::spawn_blocking(move || derive_role_key(&password, role))
        .await
        .map_err(|e| ChannelError::Internal(format!("key derivation task failed: {e}")))?;

    Ok((user_id, key))
}

fn lock<I>(negotiator: &Mutex<Negotiator<I>>) -> MutexGuard<'_, Negotiator<I>>
where
    I: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>,
{
    negotiator.lock().unwrap_or_else(PoisonError::into_inner)
}
