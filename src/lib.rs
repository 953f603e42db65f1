//! VibeMQ Core - routing and session engine of an MQTT v5.0 broker
//!
//! Sits between the transport (which parses packets and owns sockets) and
//! the network: matches topics against subscriptions, keeps retained
//! messages, and tracks per-client session state across reconnects with
//! QoS 1/2 delivery, offline queueing, session expiry and wills.
//!
//! The entry point is [`Broker`]; connections plug in through the
//! [`Connection`] trait.

pub mod broker;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod retained;
pub mod session;
pub mod timer;
pub mod topic;

pub use broker::{
    Broker, BrokerConfig, BrokerError, BrokerEvent, ChannelConnection, ConnectOptions,
    ConnectOutcome, Connection, SendError,
};
pub use config::Config;
pub use metrics::Metrics;
pub use protocol::{Packet, PacketId, Publish, QoS, ReasonCode, SubscriptionOptions};
pub use retained::{RetainedMessage, RetainedStore};
pub use session::{SessionKey, SessionRegistry};
pub use topic::SubscriptionRegistry;
