//! MQTT v5.0 Reason Codes
//!
//! The subset the routing core produces in acknowledgements and
//! server-initiated disconnects.

use std::fmt;

use super::QoS;

/// MQTT v5.0 Reason Code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ReasonCode {
    /// Success / Normal disconnection / Granted QoS 0
    #[default]
    Success = 0x00,
    /// Granted QoS 1
    GrantedQoS1 = 0x01,
    /// Granted QoS 2
    GrantedQoS2 = 0x02,
    /// No matching subscribers
    NoMatchingSubscribers = 0x10,
    /// No subscription existed
    NoSubscriptionExisted = 0x11,
    /// Protocol Error
    ProtocolError = 0x82,
    /// Session taken over
    SessionTakenOver = 0x8E,
    /// Topic Filter invalid
    TopicFilterInvalid = 0x8F,
    /// Topic Name invalid
    TopicNameInvalid = 0x90,
    /// Packet Identifier not found
    PacketIdNotFound = 0x92,
    /// Quota exceeded
    QuotaExceeded = 0x97,
    /// Retain not supported
    RetainNotSupported = 0x9A,
    /// QoS not supported
    QoSNotSupported = 0x9B,
}

impl ReasonCode {
    /// SUBACK code for a granted QoS
    pub fn granted(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => ReasonCode::Success,
            QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
            QoS::ExactlyOnce => ReasonCode::GrantedQoS2,
        }
    }

    /// Check if this reason code indicates failure
    #[inline]
    pub fn is_error(self) -> bool {
        (self as u8) >= 0x80
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReasonCode::Success => write!(f, "Success"),
            ReasonCode::GrantedQoS1 => write!(f, "Granted QoS 1"),
            ReasonCode::GrantedQoS2 => write!(f, "Granted QoS 2"),
            ReasonCode::NoMatchingSubscribers => write!(f, "No matching subscribers"),
            ReasonCode::NoSubscriptionExisted => write!(f, "No subscription existed"),
            ReasonCode::ProtocolError => write!(f, "Protocol Error"),
            ReasonCode::SessionTakenOver => write!(f, "Session taken over"),
            ReasonCode::TopicFilterInvalid => write!(f, "Topic Filter invalid"),
            ReasonCode::TopicNameInvalid => write!(f, "Topic Name invalid"),
            ReasonCode::PacketIdNotFound => write!(f, "Packet Identifier not found"),
            ReasonCode::QuotaExceeded => write!(f, "Quota exceeded"),
            ReasonCode::RetainNotSupported => write!(f, "Retain not supported"),
            ReasonCode::QoSNotSupported => write!(f, "QoS not supported"),
        }
    }
}
