//! MQTT protocol types used by the routing core
//!
//! These are the in-memory records the framing layer hands to the broker
//! (publish, subscribe, unsubscribe) and the packets the broker hands back
//! to a connection. No wire encoding lives here.

mod error;
mod packet;
mod properties;
mod reason;

pub use error::ProtocolError;
pub use packet::*;
pub use properties::Properties;
pub use reason::ReasonCode;

/// Packet identifier.
///
/// Wide enough for the 32-bit id mode; sessions in the default 16-bit mode
/// never allocate past `u16::MAX`.
pub type PacketId = u32;

/// Session expiry interval meaning "never expires"
pub const SESSION_EXPIRY_NEVER: u32 = u32::MAX;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the minimum of two QoS levels (for subscription matching)
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

/// Retain handling options (MQTT v5.0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    /// Send retained messages at subscription time
    #[default]
    SendAtSubscribe = 0,
    /// Send retained messages only for new subscriptions
    SendAtSubscribeIfNew = 1,
    /// Do not send retained messages
    DoNotSend = 2,
}

impl RetainHandling {
    /// Whether retained messages go out for a subscription that did or did
    /// not exist before this SUBSCRIBE
    pub fn should_send(self, existed: bool) -> bool {
        match self {
            RetainHandling::SendAtSubscribe => true,
            RetainHandling::SendAtSubscribeIfNew => !existed,
            RetainHandling::DoNotSend => false,
        }
    }
}

/// Subscription options
///
/// An immutable value: re-subscribing to the same filter replaces the whole
/// bundle at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    /// Maximum QoS the subscriber accepts
    pub max_qos: QoS,
    /// Don't send messages to the client that published them
    pub no_local: bool,
    /// Keep the retain flag of forwarded messages
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscriptionOptions {
    pub fn new(max_qos: QoS) -> Self {
        Self {
            max_qos,
            ..Self::default()
        }
    }

    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    pub fn with_retain_as_published(mut self, retain_as_published: bool) -> Self {
        self.retain_as_published = retain_as_published;
        self
    }

    pub fn with_retain_handling(mut self, retain_handling: RetainHandling) -> Self {
        self.retain_handling = retain_handling;
        self
    }
}
