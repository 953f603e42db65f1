//! Broker error types

use std::fmt;
use std::sync::Arc;

use crate::protocol::{PacketId, ProtocolError};

/// Per-operation broker errors. None of them is fatal to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Malformed topic or filter, or another protocol violation
    Protocol(ProtocolError),
    /// The session key no longer resolves (taken over, expired or detached)
    UnknownSession(Arc<str>),
    /// Acknowledgement for a packet id that is not pending
    UnknownPacketId(PacketId),
    /// Broker constructed outside a tokio runtime
    NoRuntime,
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Protocol(e) => write!(f, "protocol error: {}", e),
            BrokerError::UnknownSession(client_id) => {
                write!(f, "no attached session for client {}", client_id)
            }
            BrokerError::UnknownPacketId(id) => write!(f, "unknown packet identifier {}", id),
            BrokerError::NoRuntime => write!(f, "broker requires a tokio runtime"),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for BrokerError {
    fn from(e: ProtocolError) -> Self {
        BrokerError::Protocol(e)
    }
}
