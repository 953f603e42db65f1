//! MQTT Packet Definitions
//!
//! Already-parsed packet records exchanged with the framing layer.

use std::sync::Arc;

use bytes::Bytes;

use super::{PacketId, Properties, QoS, ReasonCode, SubscriptionOptions};

/// Packets the broker hands to a connection for sending
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    SubAck(SubAck),
    UnsubAck(UnsubAck),
    Disconnect(Disconnect),
}

/// Will message configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    /// Will topic
    pub topic: String,
    /// Will payload
    pub payload: Bytes,
    /// Will QoS
    pub qos: QoS,
    /// Will retain flag
    pub retain: bool,
    /// Will properties (carries the will delay interval)
    pub properties: Properties,
}

impl Will {
    pub(crate) fn into_publish(self) -> Publish {
        let mut properties = self.properties;
        properties.will_delay_interval = None;
        Publish {
            dup: false,
            qos: self.qos,
            retain: self.retain,
            topic: Arc::from(self.topic.as_str()),
            packet_id: None,
            payload: self.payload,
            properties,
        }
    }
}

/// PUBLISH packet (bidirectional)
///
/// The topic field uses `Arc<str>` for efficient fan-out: when routing a message
/// to multiple subscribers, cloning the topic is O(1) instead of O(n) for String.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Duplicate delivery flag
    pub dup: bool,
    /// Quality of service
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Topic name
    pub topic: Arc<str>,
    /// Packet identifier (present only for QoS > 0)
    pub packet_id: Option<PacketId>,
    /// Payload
    pub payload: Bytes,
    /// Properties (v5.0 only)
    pub properties: Properties,
}

impl Publish {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            ..Self::default()
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_packet_id(mut self, packet_id: PacketId) -> Self {
        self.packet_id = Some(packet_id);
        self
    }
}

impl Default for Publish {
    fn default() -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(""),
            packet_id: None,
            payload: Bytes::new(),
            properties: Properties::default(),
        }
    }
}

macro_rules! ack_packet {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            /// Packet identifier
            pub packet_id: PacketId,
            /// Reason code (v5.0 only)
            pub reason_code: ReasonCode,
        }

        impl $name {
            pub fn new(packet_id: PacketId) -> Self {
                Self {
                    packet_id,
                    reason_code: ReasonCode::Success,
                }
            }

            pub fn with_reason(packet_id: PacketId, reason_code: ReasonCode) -> Self {
                Self {
                    packet_id,
                    reason_code,
                }
            }
        }
    };
}

ack_packet!(
    /// PUBACK packet (QoS 1)
    PubAck
);
ack_packet!(
    /// PUBREC packet (QoS 2 step 1)
    PubRec
);
ack_packet!(
    /// PUBREL packet (QoS 2 step 2)
    PubRel
);
ack_packet!(
    /// PUBCOMP packet (QoS 2 step 3)
    PubComp
);

/// Subscription request with options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic filter
    pub filter: String,
    /// Subscription options
    pub options: SubscriptionOptions,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, options: SubscriptionOptions) -> Self {
        Self {
            filter: filter.into(),
            options,
        }
    }
}

/// SUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subscribe {
    /// Packet identifier
    pub packet_id: PacketId,
    /// Subscriptions, in request order
    pub subscriptions: Vec<Subscription>,
    /// Subscription identifier (v5.0)
    pub subscription_id: Option<u32>,
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    /// Packet identifier
    pub packet_id: PacketId,
    /// Reason codes for each subscription
    pub reason_codes: Vec<ReasonCode>,
}

/// UNSUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Unsubscribe {
    /// Packet identifier
    pub packet_id: PacketId,
    /// Topic filters to unsubscribe from
    pub filters: Vec<String>,
}

/// UNSUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    /// Packet identifier
    pub packet_id: PacketId,
    /// Reason codes for each unsubscription
    pub reason_codes: Vec<ReasonCode>,
}

/// DISCONNECT packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub reason_code: ReasonCode,
}
