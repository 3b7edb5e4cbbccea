//! Datagram transports.
//!
//! Drivers only need to send and receive opaque datagrams. [`UdpTransport`]
//! is the production implementation; simulations plug in their own.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use fieldsec_proto::{Frame, SecureHeader};
use thiserror::Error;
use tokio::net::UdpSocket;

/// Largest datagram a driver will read: one full-size frame.
pub const MAX_DATAGRAM_SIZE: usize = SecureHeader::SIZE + SecureHeader::MAX_PAYLOAD_SIZE as usize;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket could not be created or bound.
    #[error("bind failed: {0}")]
    Bind(String),

    /// Joining a multicast group failed.
    #[error("multicast join failed: {0}")]
    Multicast(String),

    /// Datagram could not be sent.
    #[error("send failed: {0}")]
    Send(String),

    /// Receiving failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// Frame could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),
}

impl TransportError {
    /// Whether the next send or receive may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Send(_) | Self::Receive(_))
    }
}

/// Sends and receives opaque datagrams.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram to `target`.
    async fn send_to(&self, datagram: &[u8], target: SocketAddr) -> Result<(), TransportError>;

    /// Receive one datagram into `buffer`.
    ///
    /// Must be cancel safe: drivers race it against commands and timers.
    async fn recv_from(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr), TransportError>;

    /// Address the transport is bound to.
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
}

/// Encode `frame` and send it to `target`.
pub(crate) async fn send_frame(
    transport: &dyn DatagramTransport,
    frame: &Frame,
    target: SocketAddr,
) -> Result<(), TransportError> {
    let datagram = frame.to_vec().map_err(|e| TransportError::Encode(e.to_string()))?;
    transport.send_to(&datagram, target).await
}

/// UDP transport over a tokio socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a unicast socket.
    pub async fn bind(address: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(address)
            .await
            .map_err(|e| TransportError::Bind(format!("failed to bind to {address}: {e}")))?;

        tracing::debug!(%address, "udp transport bound");
        Ok(Self { socket })
    }

    /// Bind to the group port and join `group` on `interface`.
    ///
    /// Multicast loopback stays enabled so several members on one host can
    /// share a group; the group drops its own frames by sender id.
    pub async fn join_multicast(
        group: SocketAddr,
        interface: Ipv4Addr,
    ) -> Result<Self, TransportError> {
        let bind_address = match group.ip() {
            IpAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port())),
            IpAddr::V6(_) => SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, group.port())),
        };
        let transport = Self::bind(bind_address).await?;

        match group.ip() {
            IpAddr::V4(ip) if ip.is_multicast() => {
                transport
                    .socket
                    .join_multicast_v4(ip, interface)
                    .map_err(|e| TransportError::Multicast(format!("{group}: {e}")))?;
                transport
                    .socket
                    .set_multicast_loop_v4(true)
                    .map_err(|e| TransportError::Multicast(format!("{group}: {e}")))?;
            },
            IpAddr::V6(ip) if ip.is_multicast() => {
                transport
                    .socket
                    .join_multicast_v6(&ip, 0)
                    .map_err(|e| TransportError::Multicast(format!("{group}: {e}")))?;
            },
            ip => {
                return Err(TransportError::Multicast(format!("{ip} is not a multicast address")));
            },
        }

        tracing::info!(%group, %interface, "joined multicast group");
        Ok(transport)
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_to(&self, datagram: &[u8], target: SocketAddr) -> Result<(), TransportError> {
        self.socket
            .send_to(datagram, target)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(format!("{target}: {e}")))
    }

    async fn recv_from(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
        self.socket.recv_from(buffer).await.map_err(|e| TransportError::Receive(e.to_string()))
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket.local_addr().map_err(|e| TransportError::Bind(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn datagrams_flow_between_sockets() {
        let a = UdpTransport::bind(loopback()).await.unwrap();
        let b = UdpTransport::bind(loopback()).await.unwrap();

        a.send_to(b"knx", b.local_addr().unwrap()).await.unwrap();

        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = b.recv_from(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..len], b"knx");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn joining_a_unicast_address_fails() {
        let result =
            UdpTransport::join_multicast(SocketAddr::from(([127, 0, 0, 1], 0)), Ipv4Addr::UNSPECIFIED)
                .await;

        assert!(matches!(result, Err(TransportError::Multicast(_))));
    }

    #[test]
    fn only_io_errors_are_transient() {
        assert!(TransportError::Send("x".into()).is_transient());
        assert!(TransportError::Receive("x".into()).is_transient());
        assert!(!TransportError::Bind("x".into()).is_transient());
        assert!(!TransportError::Multicast("x".into()).is_transient());
    }
}
