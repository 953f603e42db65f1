//! MQTT v5.0 message properties carried through routing
//!
//! Only the properties that travel with an application message are kept;
//! connection-level properties are the framing layer's business.

use bytes::Bytes;

/// Properties attached to a PUBLISH or will message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    /// Seconds the message stays deliverable
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    /// Identifiers of the subscriptions that matched (outbound only)
    pub subscription_identifiers: Vec<u32>,
    /// Seconds to wait before publishing a will
    pub will_delay_interval: Option<u32>,
    pub user_properties: Vec<(String, String)>,
}
