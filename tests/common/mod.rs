//! Shared helpers for the broker integration tests

#![allow(dead_code)]

use std::sync::Arc;

use tokio::sync::mpsc;

use vibemq_core::broker::{Broker, BrokerConfig, ChannelConnection, ConnectOptions, Connection};
use vibemq_core::protocol::{
    Packet, Publish, QoS, Subscribe, Subscription, SubscriptionOptions, Will,
};
use vibemq_core::session::SessionKey;

/// A connected test client: its session key, the raw connection and the
/// packets the broker sent it
pub struct TestClient {
    pub key: SessionKey,
    pub conn: Arc<ChannelConnection>,
    pub rx: mpsc::Receiver<Packet>,
    pub session_present: bool,
}

impl TestClient {
    /// Everything received so far
    pub fn drain(&mut self) -> Vec<Packet> {
        std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
    }

    /// Received publishes only, as (topic, payload)
    pub fn publishes(&mut self) -> Vec<Publish> {
        self.drain()
            .into_iter()
            .filter_map(|p| match p {
                Packet::Publish(p) => Some(p),
                _ => None,
            })
            .collect()
    }
}

pub fn broker() -> Broker {
    Broker::with_defaults(BrokerConfig::default()).unwrap()
}

pub fn connect_with(broker: &Broker, client_id: &str, options: ConnectOptions) -> TestClient {
    let (conn, rx) = ChannelConnection::new(client_id, 1024);
    let dyn_conn: Arc<dyn Connection> = conn.clone();
    let outcome = broker.on_connect(dyn_conn, options).unwrap();
    TestClient {
        key: outcome.key,
        conn,
        rx,
        session_present: outcome.session_present,
    }
}

/// Persistent session with the given expiry
pub fn connect(broker: &Broker, client_id: &str, expiry: u32) -> TestClient {
    connect_with(
        broker,
        client_id,
        ConnectOptions {
            clean_start: false,
            session_expiry_interval: Some(expiry),
            will: None,
        },
    )
}

pub fn subscribe(broker: &Broker, client: &TestClient, filter: &str, options: SubscriptionOptions) {
    broker
        .on_subscribe(
            &client.key,
            Subscribe {
                packet_id: 1,
                subscriptions: vec![Subscription::new(filter, options)],
                subscription_id: None,
            },
        )
        .unwrap();
}

pub fn will(topic: &str, payload: &'static str, delay: u32) -> Will {
    let mut will = Will {
        topic: topic.to_string(),
        payload: payload.into(),
        qos: QoS::AtMostOnce,
        retain: false,
        properties: Default::default(),
    };
    if delay > 0 {
        will.properties.will_delay_interval = Some(delay);
    }
    will
}

pub fn payloads(publishes: &[Publish]) -> Vec<&[u8]> {
    publishes.iter().map(|p| &p.payload[..]).collect()
}
