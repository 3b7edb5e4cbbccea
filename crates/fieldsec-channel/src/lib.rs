//! fieldsec Channel
//!
//! Tokio runtime for the fieldsec state machines. Wraps the sans-IO
//! `Session`, `Negotiator` and `MulticastGroup` from `fieldsec-core` with
//! datagram transports, a system environment and driver tasks, and exposes
//! them through the [`SecureChannel`] interface.
//!
//! # Components
//!
//! - [`open_secure_unicast`] / [`SecureConnector`]: handshake with a gateway
//!   and drive the established session
//! - [`join_secure_multicast`] / [`MulticastJoin`]: secure multicast group
//!   membership
//! - [`DatagramTransport`] / [`UdpTransport`]: datagram I/O
//! - [`SystemEnv`]: system time and OS randomness
//! - [`load_keyring`] / [`save_keyring`]: keyring files
//!
//! # Concurrency
//!
//! Each channel is one tokio task that exclusively owns its state machine
//! and socket. Handles talk to it over `mpsc` channels; closing a channel
//! waits for the task, so the socket is released when `close` returns.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod channel;
pub mod config;
pub mod error;
pub mod keystore;
pub mod multicast;
pub mod system_env;
pub mod transport;
pub mod unicast;

pub use channel::{Inbound, SecureChannel};
pub use config::{ChannelConfig, DEFAULT_DELIVERY_CAPACITY, DEFAULT_TICK_INTERVAL};
pub use error::ChannelError;
pub use keystore::{load_keyring, load_keyring_async, save_keyring};
pub use multicast::{
    MulticastChannel, MulticastJoin, join_secure_multicast, join_secure_multicast_with_password,
};
pub use system_env::SystemEnv;
pub use transport::{DatagramTransport, MAX_DATAGRAM_SIZE, TransportError, UdpTransport};
pub use unicast::{SecureConnector, UnicastChannel, open_secure_unicast};
