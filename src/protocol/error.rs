//! Protocol error types

use std::fmt;

/// Errors raised while validating client-supplied topics and filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Topic filter with misplaced wildcards, empty, or too deep
    MalformedFilter(&'static str),
    /// Topic name that cannot be published to
    InvalidTopicName(&'static str),
    /// Protocol violation
    ProtocolViolation(&'static str),
}

impl ProtocolError {
    /// Reason code reported back to the client
    pub fn reason_code(&self) -> super::ReasonCode {
        match self {
            Self::MalformedFilter(_) => super::ReasonCode::TopicFilterInvalid,
            Self::InvalidTopicName(_) => super::ReasonCode::TopicNameInvalid,
            Self::ProtocolViolation(_) => super::ReasonCode::ProtocolError,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedFilter(msg) => write!(f, "malformed topic filter: {}", msg),
            Self::InvalidTopicName(msg) => write!(f, "invalid topic name: {}", msg),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}
