//! Simulated datagram transports.
//!
//! - [`SimUdp`]: turmoil UDP socket, for scenarios across simulated hosts
//!   with latency, partitions and virtual time
//! - [`MemoryNetwork`]: in-process network with multicast fan-out, a record
//!   of every datagram, and injection of arbitrary datagrams (replays,
//!   forgeries) from any address

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use fieldsec_channel::{DatagramTransport, TransportError};
use tokio::sync::mpsc;

/// Turmoil UDP socket as a [`DatagramTransport`].
#[derive(Debug)]
pub struct SimUdp {
    socket: turmoil::net::UdpSocket,
}

impl SimUdp {
    /// Bind on the current simulated host.
    pub async fn bind(address: SocketAddr) -> Result<Self, TransportError> {
        let socket = turmoil::net::UdpSocket::bind(address)
            .await
            .map_err(|e| TransportError::Bind(format!("failed to bind to {address}: {e}")))?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl DatagramTransport for SimUdp {
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

/// A datagram as it crossed the [`MemoryNetwork`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Sender address
    pub from: SocketAddr,
    /// Destination (a member or a group)
    pub to: SocketAddr,
    /// Raw bytes
    pub bytes: Vec<u8>,
}

type Inbox = mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>;

#[derive(Debug, Default)]
struct NetworkState {
    members: HashMap<SocketAddr, Inbox>,
    groups: HashMap<SocketAddr, HashSet<SocketAddr>>,
    history: Vec<Datagram>,
}

/// In-process datagram network.
///
/// Unicast datagrams go to the member bound at the destination; datagrams to
/// a group address go to every member that joined it, sender included, like
/// multicast with loopback enabled. Nothing is ever lost or reordered unless
/// a test injects it.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a member at `address`.
    ///
    /// # Errors
    ///
    /// - `TransportError::Bind` if the address is taken
    pub fn attach(&self, address: SocketAddr) -> Result<Arc<MemoryTransport>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        if state.members.contains_key(&address) {
            return Err(TransportError::Bind(format!("{address} already in use")));
        }
        state.members.insert(address, tx);

        Ok(Arc::new(MemoryTransport {
            network: self.clone(),
            address,
            inbox: tokio::sync::Mutex::new(rx),
        }))
    }

    /// Attach a member at `address` and join it to `group`.
    pub fn attach_to_group(
        &self,
        address: SocketAddr,
        group: SocketAddr,
    ) -> Result<Arc<MemoryTransport>, TransportError> {
        let transport = self.attach(address)?;
        self.state().groups.entry(group).or_default().insert(address);
        Ok(transport)
    }

    /// Deliver `bytes` to `to` as if `from` had sent it. Recorded in the
    /// history like any other datagram.
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, bytes: Vec<u8>) {
        self.route(Datagram { from, to, bytes });
    }

    /// Every datagram sent so far, in send order.
    pub fn history(&self) -> Vec<Datagram> {
        self.state().history.clone()
    }

    /// Datagrams sent by `from`, in send order.
    pub fn sent_by(&self, from: SocketAddr) -> Vec<Datagram> {
        self.state().history.iter().filter(|d| d.from == from).cloned().collect()
    }

    fn route(&self, datagram: Datagram) {
        let mut state = self.state();

        let recipients: Vec<SocketAddr> = match state.groups.get(&datagram.to) {
            Some(members) => {
                let mut members: Vec<_> = members.iter().copied().collect();
                members.sort();
                members
            },
            None => vec![datagram.to],
        };

        for recipient in recipients {
            let Some(inbox) = state.members.get(&recipient) else {
                tracing::trace!(to = %recipient, "datagram to unbound address dropped");
                continue;
            };
            if inbox.send((datagram.bytes.clone(), datagram.from)).is_err() {
                tracing::trace!(to = %recipient, "datagram to detached member dropped");
            }
        }

        state.history.push(datagram);
    }

    fn detach(&self, address: SocketAddr) {
        let mut state = self.state();
        state.members.remove(&address);
        for members in state.groups.values_mut() {
            members.remove(&address);
        }
    }
}

/// One member's socket on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: SocketAddr,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.detach(self.address);
    }
}

#[async_trait]
impl DatagramTransport for MemoryTransport {
    async fn send_to(&self, datagram: &[u8], target: SocketAddr) -> Result<(), TransportError> {
        self.network.route(Datagram { from: self.address, to: target, bytes: datagram.to_vec() });
        Ok(())
    }

    async fn recv_from(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr), TransportError> {
        let (bytes, from) = self
            .inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| TransportError::Bind(format!("{} detached", self.address)))?;

        let len = bytes.len().min(buffer.len());
        buffer[..len].copy_from_slice(&bytes[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.address)
    }
}
