//! Deterministic simulation harness for fieldsec.
//!
//! Seeded environments and simulated datagram transports so the real
//! channel drivers run unchanged under turmoil or a paused tokio clock.
//!
//! - [`SimEnv`]: tokio virtual time and a seeded `ChaCha8Rng`
//! - [`SimUdp`]: turmoil UDP sockets for multi-host scenarios
//! - [`MemoryNetwork`]: in-process network with multicast fan-out, history
//!   and datagram injection for replay and forgery scenarios
//! - [`SimGateway`]: the gateway half of the handshake on any transport

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sim_env;
pub mod sim_gateway;
pub mod sim_transport;

pub use sim_env::SimEnv;
pub use sim_gateway::{GatewayBehavior, GatewayEvent, SimGateway};
pub use sim_transport::{Datagram, MemoryNetwork, MemoryTransport, SimUdp};
