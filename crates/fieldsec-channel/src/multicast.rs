//! Secure multicast group membership.
//!
//! One driver task per membership owns the [`MulticastGroup`] and the
//! socket. Every member sends to the group address and receives every
//! member's frames; the group drops its own by sender id.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use fieldsec_core::{
    Environment, GroupAction, MulticastGroup, SecurityObserver, SequenceCounter,
};
use fieldsec_crypto::{DerivedKey, KeyRole, Keyring};
use tokio::{
    sync::mpsc,
    time::{MissedTickBehavior, interval, sleep},
};

use crate::{
    channel::{Command, DriverHandle, Inbound, SecureChannel},
    config::{ChannelConfig, DEFAULT_COMMAND_CAPACITY},
    error::ChannelError,
    keystore::load_keyring_async,
    system_env::SystemEnv,
    transport::{DatagramTransport, MAX_DATAGRAM_SIZE, UdpTransport, send_frame},
};

/// Join the secure multicast group at `group` with the keyring's group key.
///
/// The sender id is random and the outgoing counter starts at the current
/// wall-clock milliseconds, so a restarted member continues above the
/// sequence numbers it used before.
///
/// # Errors
///
/// - `ChannelError::MissingKey` if the keyring holds no group key
/// - `ChannelError::Config` or `ChannelError::Group` for invalid config
/// - Transport errors from binding or joining
pub async fn join_secure_multicast(
    group: SocketAddr,
    keyring: &Keyring,
    config: ChannelConfig,
) -> Result<MulticastChannel, ChannelError> {
    config.validate()?;
    let key = keyring.group_key().cloned().ok_or(ChannelError::MissingKey(KeyRole::Group))?;
    let transport = UdpTransport::join_multicast(group, config.multicast_interface).await?;

    MulticastJoin::new(config).spawn(Arc::new(transport), group, key)
}

/// Unlock the keyring at `keyring_path` with `password` and join `group`.
///
/// For tools that hold only a keyring path and password. The keyring is
/// dropped once the group key is taken; callers opening several channels
/// should unlock once and use [`join_secure_multicast`].
///
/// # Errors
///
/// - `ChannelError::KeyringFile` if the keyring cannot be read
/// - `ChannelError::Credential` for a wrong password or a corrupt keyring
/// - Everything [`join_secure_multicast`] returns
pub async fn join_secure_multicast_with_password(
    group: SocketAddr,
    keyring_path: impl Into<PathBuf>,
    password: &str,
    config: ChannelConfig,
) -> Result<MulticastChannel, ChannelError> {
    let keyring = load_keyring_async(keyring_path, password).await?;
    join_secure_multicast(group, &keyring, config).await
}

/// Options for joining a group over an arbitrary transport.
#[derive(Debug)]
pub struct MulticastJoin<E: Environment = SystemEnv> {
    env: E,
    config: ChannelConfig,
    sender_id: Option<u64>,
    counter: Option<SequenceCounter>,
}

impl MulticastJoin<SystemEnv> {
    /// Join options using system time and randomness.
    pub fn new(config: ChannelConfig) -> Self {
        Self::with_env(SystemEnv::new(), config)
    }
}

impl<E: Environment> MulticastJoin<E> {
    /// Join options using `env` for time and randomness.
    pub fn with_env(env: E, config: ChannelConfig) -> Self {
        Self { env, config, sender_id: None, counter: None }
    }

    /// Use a fixed sender id instead of a random one.
    #[must_use]
    pub fn sender_id(mut self, sender_id: u64) -> Self {
        self.sender_id = Some(sender_id);
        self
    }

    /// Continue from a counter returned by [`MulticastChannel::leave`].
    #[must_use]
    pub fn counter(mut self, counter: SequenceCounter) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Start the driver task for the group at `group` over `transport`.
    pub fn spawn(
        self,
        transport: Arc<dyn DatagramTransport>,
        group: SocketAddr,
        key: DerivedKey,
    ) -> Result<MulticastChannel, ChannelError> {
        self.config.validate()?;

        let sender_id =
            self.sender_id.unwrap_or_else(|| MulticastGroup::<E::Instant>::random_sender_id(&self.env));
        let counter = self
            .counter
            .unwrap_or_else(|| SequenceCounter::from_wall_clock(self.env.wall_clock_millis()));
        let state = MulticastGroup::new(key, sender_id, counter, self.config.group, self.env.now())?;

        let (commands_tx, commands_rx) = mpsc::channel(DEFAULT_COMMAND_CAPACITY);
        let (deliveries_tx, deliveries_rx) = mpsc::channel(self.config.delivery_capacity);

        let driver = GroupDriver {
            group: state,
            transport,
            group_addr: group,
            env: self.env,
            observer: self.config.observer,
            deliveries: deliveries_tx,
        };
        let task = tokio::spawn(driver.run(commands_rx, self.config.tick_interval));

        tracing::info!(%group, sender_id, "secure multicast membership started");

        Ok(MulticastChannel {
            group,
            sender_id,
            counter: None,
            handle: DriverHandle::new(commands_tx, deliveries_rx, task),
        })
    }
}

type GroupExit = (SequenceCounter, Result<(), ChannelError>);

/// Membership in a secure multicast group.
#[derive(Debug)]
pub struct MulticastChannel {
    group: SocketAddr,
    sender_id: u64,
    counter: Option<SequenceCounter>,
    handle: DriverHandle<GroupExit>,
}

impl MulticastChannel {
    /// Group address.
    pub fn group(&self) -> SocketAddr {
        self.group
    }

    /// Sender id stamped on our frames.
    pub fn sender_id(&self) -> u64 {
        self.sender_id
    }

    /// Leave the group and return the outgoing counter for the next join.
    pub async fn leave(mut self) -> Result<SequenceCounter, ChannelError> {
        let closed = self.close().await;
        match self.counter.take() {
            Some(counter) => Ok(counter),
            None => Err(closed.err().unwrap_or(ChannelError::Closed)),
        }
    }
}

#[async_trait]
impl SecureChannel for MulticastChannel {
    async fn send(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        self.handle.send(payload).await
    }

    async fn receive(&mut self) -> Option<Inbound> {
        self.handle.receive().await
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        let Some((counter, result)) = self.handle.shutdown().await? else {
            return Ok(());
        };
        self.counter = Some(counter);
        result
    }
}

/// Owns one group membership and its socket.
struct GroupDriver<E: Environment> {
    group: MulticastGroup<E::Instant>,
    transport: Arc<dyn DatagramTransport>,
    group_addr: SocketAddr,
    env: E,
    observer: Arc<dyn SecurityObserver>,
    deliveries: mpsc::Sender<Inbound>,
}

impl<E: Environment> GroupDriver<E> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, tick_interval: Duration) -> GroupExit {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            let release = self.group.release_delay(self.env.now());
            let actions = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send { payload, reply }) => {
                        let result = self.send(payload).await;
                        let _ = reply.send(result);
                        continue;
                    },
                    Some(Command::Close) | None => break Ok(()),
                },

                received = self.transport.recv_from(&mut buffer) => match received {
                    Ok((len, _)) => self.group.handle_datagram(&buffer[..len], self.env.now()),
                    Err(err) if err.is_transient() => {
                        tracing::warn!(group = %self.group_addr, error = %err, "receive failed");
                        continue;
                    },
                    Err(err) => break Err(err.into()),
                },

                () = sleep(release.unwrap_or_default()), if release.is_some() => {
                    self.group.release_held(self.env.now())
                },

                _ = ticker.tick() => match self.group.tick(self.env.now()) {
                    Ok(actions) => actions,
                    Err(err) => break Err(err.into()),
                },
            };

            self.execute(actions).await;
        };

        let sender_id = self.group.local_sender();
        match &outcome {
            Ok(()) => tracing::info!(group = %self.group_addr, sender_id, "left multicast group"),
            Err(err) => {
                tracing::error!(group = %self.group_addr, sender_id, error = %err, "group driver failed");
            },
        }
        (self.group.into_counter(), outcome)
    }

    async fn send(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        let frame = self.group.seal(payload, self.env.now())?;
        send_frame(self.transport.as_ref(), &frame, self.group_addr).await?;
        Ok(())
    }

    async fn execute(&mut self, actions: Vec<GroupAction>) {
        for action in actions {
            match action {
                GroupAction::SendFrame(frame) => {
                    let sent = send_frame(self.transport.as_ref(), &frame, self.group_addr).await;
                    if let Err(err) = sent {
                        tracing::warn!(group = %self.group_addr, error = %err, "failed to send frame");
                    }
                },
                GroupAction::Deliver { sender_id, sequence, payload } => {
                    let inbound = Inbound { sender_id, sequence, payload };
                    if self.deliveries.send(inbound).await.is_err() {
                        tracing::debug!(sender_id, sequence, "receiver gone, payload discarded");
                    }
                },
                GroupAction::Security(event) => self.observer.on_drop(&event),
                GroupAction::SenderEvicted { sender_id } => {
                    tracing::debug!(group = %self.group_addr, sender_id, "sender evicted");
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use fieldsec_core::{CounterSnapshot, SecurityCounters};
    use fieldsec_crypto::{KeyringBuilder, KeyringError};

    use super::*;
    use crate::{keystore::save_keyring, transport::TransportError};

    /// Every datagram sent by any member reaches every member.
    #[derive(Default)]
    struct Hub {
        members: Mutex<Vec<mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>>>,
    }

    struct HubTransport {
        hub: Arc<Hub>,
        address: SocketAddr,
        inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    }

    impl Hub {
        fn attach(self: &Arc<Self>, port: u16) -> Arc<HubTransport> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.members.lock().unwrap().push(tx);
            Arc::new(HubTransport {
                hub: Arc::clone(self),
                address: SocketAddr::from(([10, 0, 0, 1], port)),
                inbox: tokio::sync::Mutex::new(rx),
            })
        }
    }

    #[async_trait]
    impl DatagramTransport for HubTransport {
        async fn send_to(&self, datagram: &[u8], _: SocketAddr) -> Result<(), TransportError> {
            for member in self.hub.members.lock().unwrap().iter() {
                let _ = member.send((datagram.to_vec(), self.address));
            }
            Ok(())
        }

        async fn recv_from(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
            let (datagram, from) = self
                .inbox
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| TransportError::Receive("hub closed".into()))?;
            buffer[..datagram.len()].copy_from_slice(&datagram);
            Ok((datagram.len(), from))
        }

        fn local_addr(&self) -> Result<SocketAddr, TransportError> {
            Ok(self.address)
        }
    }

    fn group_addr() -> SocketAddr {
        SocketAddr::from(([239, 0, 0, 1], 3671))
    }

    fn member(hub: &Arc<Hub>, sender_id: u64, key: [u8; 16], config: ChannelConfig) -> MulticastChannel {
        MulticastJoin::new(config)
            .sender_id(sender_id)
            .spawn(hub.attach(sender_id as u16), group_addr(), DerivedKey::from_bytes(key))
            .unwrap()
    }

    #[tokio::test]
    async fn members_receive_each_others_payloads() {
        let hub = Arc::new(Hub::default());
        let mut a = member(&hub, 1, [7; 16], ChannelConfig::default());
        let mut b = member(&hub, 2, [7; 16], ChannelConfig::default());

        a.send(Bytes::from_static(b"on")).await.unwrap();

        let inbound = b.receive().await.unwrap();
        assert_eq!(inbound.sender_id, 1);
        assert_eq!(inbound.payload, Bytes::from_static(b"on"));

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn foreign_key_frames_are_counted_not_delivered() {
        let hub = Arc::new(Hub::default());
        let counters = Arc::new(SecurityCounters::new());
        let config = ChannelConfig::default().with_observer(counters.clone());

        let mut honest = member(&hub, 1, [7; 16], config);
        let mut intruder = member(&hub, 2, [9; 16], ChannelConfig::default());

        intruder.send(Bytes::from_static(b"off")).await.unwrap();
        intruder.close().await.unwrap();

        let next = tokio::time::timeout(Duration::from_millis(100), honest.receive()).await;
        assert!(next.is_err(), "forged payload must not be delivered");
        assert_eq!(counters.snapshot(), CounterSnapshot { forged: 1, ..CounterSnapshot::default() });

        honest.close().await.unwrap();
    }

    #[tokio::test]
    async fn receive_returns_none_after_close() {
        let hub = Arc::new(Hub::default());
        let mut channel = member(&hub, 1, [7; 16], ChannelConfig::default());

        channel.close().await.unwrap();
        channel.close().await.unwrap();

        assert_eq!(channel.receive().await, None);
        assert!(matches!(channel.send(Bytes::from_static(b"x")).await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn leave_returns_the_advanced_counter() {
        let hub = Arc::new(Hub::default());
        let mut channel = MulticastJoin::new(ChannelConfig::default())
            .sender_id(1)
            .counter(SequenceCounter::starting_at(100))
            .spawn(hub.attach(1), group_addr(), DerivedKey::from_bytes([7; 16]))
            .unwrap();

        channel.send(Bytes::from_static(b"a")).await.unwrap();
        channel.send(Bytes::from_static(b"b")).await.unwrap();

        let counter = channel.leave().await.unwrap();
        assert_eq!(counter.peek(), 102);
    }

    #[tokio::test]
    async fn password_join_surfaces_credential_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.keyring");
        let builder = KeyringBuilder::new().group_key([7; 16]);
        save_keyring(&path, &builder, "backbone", &SystemEnv::new()).unwrap();

        let result =
            join_secure_multicast_with_password(group_addr(), &path, "guessed", ChannelConfig::default())
                .await;

        assert!(matches!(result, Err(ChannelError::Credential(KeyringError::BadPassword))));
    }

    #[tokio::test]
    async fn password_join_requires_a_group_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel-only.keyring");
        let builder = KeyringBuilder::new().user_password(1, "tunnel-1");
        save_keyring(&path, &builder, "backbone", &SystemEnv::new()).unwrap();

        let result =
            join_secure_multicast_with_password(group_addr(), &path, "backbone", ChannelConfig::default())
                .await;

        assert!(matches!(result, Err(ChannelError::MissingKey(KeyRole::Group))));
    }

    #[tokio::test]
    async fn keyring_without_group_key_cannot_join() {
        let keyring = Keyring::from_keys([(KeyRole::User(1), DerivedKey::from_bytes([1; 16]))]);
        let result = join_secure_multicast(group_addr(), &keyring, ChannelConfig::default()).await;

        assert!(matches!(result, Err(ChannelError::MissingKey(KeyRole::Group))));
    }
}
