use super::*;
use crate::protocol::{Subscription, SubscriptionOptions};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

fn broker() -> Broker {
    Broker::with_defaults(BrokerConfig::default()).unwrap()
}

fn client(id: &str) -> (Arc<dyn Connection>, mpsc::Receiver<Packet>) {
    let (conn, rx) = ChannelConnection::new(id, 256);
    let conn: Arc<dyn Connection> = conn;
    (conn, rx)
}

fn connect(broker: &Broker, id: &str, expiry: u32) -> (SessionKey, mpsc::Receiver<Packet>) {
    let (conn, rx) = client(id);
    let outcome = broker
        .on_connect(
            conn,
            ConnectOptions {
                clean_start: false,
                session_expiry_interval: Some(expiry),
                will: None,
            },
        )
        .unwrap();
    (outcome.key, rx)
}

fn subscribe(broker: &Broker, key: &SessionKey, filter: &str, qos: QoS) -> Vec<ReasonCode> {
    broker
        .on_subscribe(
            key,
            Subscribe {
                packet_id: 1,
                subscriptions: vec![Subscription::new(filter, SubscriptionOptions::new(qos))],
                subscription_id: None,
            },
        )
        .unwrap()
}

fn drain(rx: &mut mpsc::Receiver<Packet>) -> Vec<Packet> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[test]
fn test_requires_runtime() {
    assert!(matches!(
        Broker::with_defaults(BrokerConfig::default()),
        Err(BrokerError::NoRuntime)
    ));
}

#[tokio::test]
async fn test_empty_client_id_rejected() {
    let broker = broker();
    let (conn, _rx) = client("");
    let result = broker.on_connect(conn, ConnectOptions::default());
    assert!(matches!(result, Err(BrokerError::Protocol(_))));
    assert_eq!(broker.session_count(), 0);
}

#[tokio::test]
async fn test_qos1_publish_acked_and_routed() {
    let broker = broker();
    let (sub_key, mut sub_rx) = connect(&broker, "sub", 60);
    let (pub_key, mut pub_rx) = connect(&broker, "pub", 60);
    assert_eq!(
        subscribe(&broker, &sub_key, "a/+", QoS::AtLeastOnce),
        vec![ReasonCode::GrantedQoS1]
    );
    drain(&mut sub_rx);

    broker
        .on_publish(
            &pub_key,
            Publish::new("a/b", "hi", QoS::ExactlyOnce).with_packet_id(7),
        )
        .unwrap();

    match drain(&mut pub_rx).as_slice() {
        [Packet::PubRec(ack)] => {
            assert_eq!(ack.packet_id, 7);
            assert_eq!(ack.reason_code, ReasonCode::Success);
        }
        other => panic!("unexpected {:?}", other),
    }
    match drain(&mut sub_rx).as_slice() {
        [Packet::Publish(p)] => {
            assert_eq!(p.qos, QoS::AtLeastOnce);
            assert_eq!(p.packet_id, Some(1));
            assert_eq!(&*p.payload, b"hi");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_publish_without_subscribers() {
    let broker = broker();
    let (key, mut rx) = connect(&broker, "pub", 60);
    broker
        .on_publish(&key, Publish::new("x", "1", QoS::AtLeastOnce).with_packet_id(3))
        .unwrap();
    match drain(&mut rx).as_slice() {
        [Packet::PubAck(ack)] => assert_eq!(ack.reason_code, ReasonCode::NoMatchingSubscribers),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_topic_rejected() {
    let broker = broker();
    let (key, mut rx) = connect(&broker, "pub", 60);
    let result = broker.on_publish(&key, Publish::new("a/+", "1", QoS::AtLeastOnce).with_packet_id(1));
    assert!(matches!(
        result,
        Err(BrokerError::Protocol(ProtocolError::InvalidTopicName(_)))
    ));
    match drain(&mut rx).as_slice() {
        [Packet::PubAck(ack)] => assert_eq!(ack.reason_code, ReasonCode::TopicNameInvalid),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_qos2_duplicate_not_rerouted() {
    let broker = broker();
    let (sub_key, mut sub_rx) = connect(&broker, "sub", 60);
    let (pub_key, mut pub_rx) = connect(&broker, "pub", 60);
    subscribe(&broker, &sub_key, "t", QoS::AtMostOnce);
    drain(&mut sub_rx);

    let publish = Publish::new("t", "once", QoS::ExactlyOnce).with_packet_id(5);
    broker.on_publish(&pub_key, publish.clone()).unwrap();
    broker.on_publish(&pub_key, publish).unwrap();

    assert_eq!(drain(&mut sub_rx).len(), 1);
    assert_eq!(drain(&mut pub_rx).len(), 2);

    broker.on_pubrel(&pub_key, 5).unwrap();
    assert!(matches!(
        drain(&mut pub_rx).as_slice(),
        [Packet::PubComp(c)] if c.reason_code == ReasonCode::Success
    ));
    assert_eq!(
        broker.on_pubrel(&pub_key, 5),
        Err(BrokerError::UnknownPacketId(5))
    );
}

#[tokio::test]
async fn test_unknown_ack_is_reported() {
    let broker = broker();
    let (key, _rx) = connect(&broker, "c", 60);
    assert_eq!(broker.on_puback(&key, 42), Err(BrokerError::UnknownPacketId(42)));
    assert_eq!(broker.on_pubcomp(&key, 42), Err(BrokerError::UnknownPacketId(42)));
}

#[tokio::test]
async fn test_stale_key_after_takeover() {
    let broker = broker();
    let (old_key, mut old_rx) = connect(&broker, "c", 60);
    let (new_key, _new_rx) = connect(&broker, "c", 60);

    assert!(matches!(
        drain(&mut old_rx).as_slice(),
        [Packet::Disconnect(d)] if d.reason_code == ReasonCode::SessionTakenOver
    ));
    assert!(matches!(
        broker.on_publish(&old_key, Publish::new("t", "x", QoS::AtMostOnce)),
        Err(BrokerError::UnknownSession(_))
    ));
    assert!(broker.on_disconnect(&old_key, true).is_err());
    assert_eq!(
        broker.session_info("c").unwrap().connection_id,
        Some(new_key.connection_id())
    );
    assert_eq!(broker.metrics().sessions_taken_over_total.get(), 1);
}

#[tokio::test]
async fn test_unsubscribe_reports_existence() {
    let broker = broker();
    let (key, mut rx) = connect(&broker, "c", 60);
    subscribe(&broker, &key, "a/#", QoS::AtMostOnce);
    drain(&mut rx);

    let existed = broker
        .on_unsubscribe(
            &key,
            Unsubscribe {
                packet_id: 2,
                filters: vec!["a/#".into(), "b".into()],
            },
        )
        .unwrap();
    assert_eq!(existed, vec![true, false]);
    match drain(&mut rx).as_slice() {
        [Packet::UnsubAck(ack)] => assert_eq!(
            ack.reason_codes,
            vec![ReasonCode::Success, ReasonCode::NoSubscriptionExisted]
        ),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(broker.subscription_count(), 0);
}

#[tokio::test]
async fn test_subscribe_grants_capped_qos() {
    let broker = Broker::with_defaults(BrokerConfig {
        max_qos: QoS::AtLeastOnce,
        ..Default::default()
    })
    .unwrap();
    let (key, _rx) = connect(&broker, "c", 60);
    assert_eq!(
        subscribe(&broker, &key, "t", QoS::ExactlyOnce),
        vec![ReasonCode::GrantedQoS1]
    );
    assert_eq!(
        subscribe(&broker, &key, "bad/#/x", QoS::AtMostOnce),
        vec![ReasonCode::TopicFilterInvalid]
    );
}

#[tokio::test]
async fn test_events_emitted() {
    let broker = broker();
    let mut events = broker.subscribe_events();
    let (key, _rx) = connect(&broker, "c", 0);
    broker.on_disconnect(&key, true).unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            BrokerEvent::ClientConnected {
                client_id: Arc::from("c"),
                session_present: false,
            },
            BrokerEvent::SessionExpired {
                client_id: Arc::from("c"),
            },
            BrokerEvent::ClientDisconnected {
                client_id: Arc::from("c"),
            },
        ]
    );
}

#[tokio::test]
async fn test_gather_metrics_samples_gauges() {
    let broker = broker();
    let (key, _rx) = connect(&broker, "c", 60);
    subscribe(&broker, &key, "t", QoS::AtMostOnce);
    broker
        .publish(Publish::new("r", "kept", QoS::AtMostOnce).with_retain(true))
        .unwrap();

    let text = broker.gather_metrics();
    assert!(text.contains("vibemq_sessions_current 1"));
    assert!(text.contains("vibemq_subscriptions_current 1"));
    assert!(text.contains("vibemq_retained_messages_current 1"));
}

fn expiring_retained(topic: &str, expiry: u32) -> Publish {
    let mut publish = Publish::new(topic, "stale", QoS::AtMostOnce).with_retain(true);
    publish.properties.message_expiry_interval = Some(expiry);
    publish
}

#[tokio::test(start_paused = true)]
async fn test_expired_retained_purged_periodically() {
    let broker = broker();
    broker.publish(expiring_retained("status/a", 5)).unwrap();
    broker
        .publish(Publish::new("status/b", "kept", QoS::AtMostOnce).with_retain(true))
        .unwrap();
    assert_eq!(broker.retained_count(), 2);

    // Expired but not yet swept
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(broker.retained_count(), 2);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(broker.retained_count(), 1);
    assert_eq!(broker.retained().matches("status/#").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retained_purge_disabled() {
    let broker = Broker::with_defaults(BrokerConfig {
        retained_purge_interval: Duration::ZERO,
        ..BrokerConfig::default()
    })
    .unwrap();
    broker.publish(expiring_retained("status/a", 5)).unwrap();

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(broker.retained_count(), 1);
    // Still hidden from subscribers
    assert!(broker.retained().matches("status/#").is_empty());
}
