//! Connection handle contract
//!
//! The transport layer owns each network connection; the broker only needs
//! a non-blocking way to hand packets to it and to ask it to close. Packets
//! are queued for the connection's writer task, so nothing here waits on
//! network I/O.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::protocol::Packet;

/// Why a packet could not be queued for sending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Outbound buffer full
    Full,
    /// Connection closed
    Closed,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Full => write!(f, "send buffer full"),
            SendError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// A live network endpoint, as seen by the broker
pub trait Connection: Send + Sync + 'static {
    /// Client identifier supplied at CONNECT
    fn client_id(&self) -> &str;

    /// Queue a packet for sending without blocking
    fn send(&self, packet: Packet) -> Result<(), SendError>;

    /// Ask the transport to close the connection
    fn close(&self);
}

/// Connection backed by a bounded tokio channel
///
/// The receiving half goes to the task that encodes and writes packets.
pub struct ChannelConnection {
    client_id: Arc<str>,
    sender: mpsc::Sender<Packet>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl ChannelConnection {
    pub fn new(client_id: impl Into<Arc<str>>, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Packet>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let connection = Arc::new(Self {
            client_id: client_id.into(),
            sender,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        (connection, receiver)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until `close` is called
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

impl Connection for ChannelConnection {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn send(&self, packet: Packet) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.sender.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
        }
    }
}

impl fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("client_id", &self.client_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
