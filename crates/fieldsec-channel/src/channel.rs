//! The `SecureChannel` interface shared by unicast and multicast channels.
//!
//! A channel is a handle to a driver task that exclusively owns the state
//! machine and the socket. The handle talks to it over `mpsc` channels:
//!
//! ```text
//!  send(payload) ──Command──> driver ──frame──> transport
//!  receive()     <──Inbound── driver <──frame── transport
//!  close()       ──Close────> driver, then await the task
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::error::ChannelError;

/// Authentic, fresh application data received on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Multicast sender id, or the session id of a unicast session
    pub sender_id: u64,
    /// Sequence number the sender stamped on the frame
    pub sequence: u64,
    /// Application payload
    pub payload: Bytes,
}

/// An authenticated, replay-protected datagram channel.
#[async_trait]
pub trait SecureChannel: Send {
    /// Seal `payload` and send it.
    ///
    /// # Errors
    ///
    /// - `ChannelError::Closed` once the channel is closed
    /// - Session or group errors (payload too large, sequence exhausted)
    /// - Transport errors from the socket
    async fn send(&mut self, payload: Bytes) -> Result<(), ChannelError>;

    /// Next accepted payload, in accept order per sender.
    ///
    /// Cancel safe: a dropped `receive` future loses nothing. Returns `None`
    /// after `close` or once the driver has stopped.
    async fn receive(&mut self) -> Option<Inbound>;

    /// Stop the driver, notify the peer where the protocol has a close
    /// message, and release the socket. Idempotent.
    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// Requests from a channel handle to its driver.
#[derive(Debug)]
pub(crate) enum Command {
    Send { payload: Bytes, reply: oneshot::Sender<Result<(), ChannelError>> },
    Close,
}

/// Handle-side plumbing shared by both channel kinds.
#[derive(Debug)]
pub(crate) struct DriverHandle<T> {
    commands: mpsc::Sender<Command>,
    deliveries: mpsc::Receiver<Inbound>,
    task: Option<JoinHandle<T>>,
}

impl<T> DriverHandle<T> {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        deliveries: mpsc::Receiver<Inbound>,
        task: JoinHandle<T>,
    ) -> Self {
        Self { commands, deliveries, task: Some(task) }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.task.is_none()
    }

    pub(crate) async fn send(&self, payload: Bytes) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Send { payload, reply })
            .await
            .map_err(|_| ChannelError::Closed)?;

        result.await.map_err(|_| ChannelError::Closed)?
    }

    pub(crate) async fn receive(&mut self) -> Option<Inbound> {
        if self.is_closed() {
            return None;
        }
        self.deliveries.recv().await
    }

    /// Ask the driver to stop and wait for it. `None` if already closed.
    pub(crate) async fn shutdown(&mut self) -> Result<Option<T>, ChannelError> {
        let Some(task) = self.task.take() else {
            return Ok(None);
        };

        // Unblocks a driver waiting on a full delivery queue
        self.deliveries.close();
        // A driver that already stopped has dropped its receiver
        let _ = self.commands.send(Command::Close).await;

        task.await
            .map(Some)
            .map_err(|e| ChannelError::Internal(format!("driver task failed: {e}")))
    }
}
