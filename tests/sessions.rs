//! Session lifecycle tests: takeover, resumption, expiry and wills
//!
//! Timer-driven cases run on a paused clock so expiry and will delays can
//! be stepped through without waiting.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use common::{broker, connect, connect_with, payloads, subscribe, will};
use vibemq_core::broker::{
    Broker, BrokerConfig, BrokerError, BrokerEvent, ChannelConnection, ConnectOptions, Connection,
};
use vibemq_core::protocol::{
    Packet, PubRec, Publish, QoS, ReasonCode, SubscriptionOptions, SESSION_EXPIRY_NEVER,
};
use vibemq_core::session::{SessionLimits, SessionState};

#[tokio::test(start_paused = true)]
async fn test_takeover_evicts_old_connection() {
    let broker = broker();
    let mut events = broker.subscribe_events();
    let mut first = connect(&broker, "dev", 60);
    subscribe(&broker, &first, "cmd", SubscriptionOptions::new(QoS::AtLeastOnce));
    first.drain();

    let second = connect(&broker, "dev", 60);
    assert!(second.session_present);

    assert!(matches!(
        first.drain().as_slice(),
        [Packet::Disconnect(d)] if d.reason_code == ReasonCode::SessionTakenOver
    ));
    assert!(!first.conn.is_closed());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(first.conn.is_closed());

    // Subscriptions belong to the session, not the connection
    assert_eq!(broker.subscription_count(), 1);
    assert_eq!(broker.session_count(), 1);
    assert!(std::iter::from_fn(|| events.try_recv().ok())
        .any(|e| e == BrokerEvent::SessionTakenOver { client_id: "dev".into() }));
}

#[tokio::test]
async fn test_clean_start_discards_session() {
    let broker = broker();
    let first = connect(&broker, "dev", 60);
    subscribe(&broker, &first, "cmd", SubscriptionOptions::new(QoS::AtLeastOnce));
    broker.on_disconnect(&first.key, true).unwrap();

    let second = connect_with(
        &broker,
        "dev",
        ConnectOptions {
            clean_start: true,
            session_expiry_interval: Some(60),
            will: None,
        },
    );
    assert!(!second.session_present);
    assert_eq!(broker.subscription_count(), 0);
}

#[tokio::test]
async fn test_offline_messages_delivered_in_order() {
    let broker = broker();
    let sub = connect(&broker, "sub", 300);
    subscribe(&broker, &sub, "news/#", SubscriptionOptions::new(QoS::AtLeastOnce));
    broker.on_disconnect(&sub.key, true).unwrap();

    for payload in ["a", "b", "c"] {
        broker
            .publish(Publish::new("news/today", payload, QoS::AtLeastOnce))
            .unwrap();
    }
    // QoS 0 is queued too by default
    broker
        .publish(Publish::new("news/today", "d", QoS::AtMostOnce))
        .unwrap();
    assert_eq!(broker.session_info("sub").unwrap().pending, 4);

    let mut sub = connect(&broker, "sub", 300);
    assert!(sub.session_present);
    let received = sub.publishes();
    assert_eq!(
        payloads(&received),
        vec![b"a".as_slice(), b"b".as_slice(), b"c".as_slice(), b"d".as_slice()]
    );
    let ids: Vec<_> = received.iter().map(|p| p.packet_id).collect();
    assert_eq!(ids, vec![Some(1), Some(2), Some(3), None]);
}

#[tokio::test]
async fn test_live_qos0_waits_behind_resumed_backlog() {
    let broker = Broker::with_defaults(BrokerConfig {
        session: SessionLimits {
            max_inflight: 2,
            ..SessionLimits::default()
        },
        ..BrokerConfig::default()
    })
    .unwrap();
    let sub = connect(&broker, "sub", 300);
    subscribe(&broker, &sub, "t", SubscriptionOptions::new(QoS::AtLeastOnce));
    broker.on_disconnect(&sub.key, true).unwrap();

    for payload in ["q1", "q2", "q3", "q4"] {
        broker
            .publish(Publish::new("t", payload, QoS::AtLeastOnce))
            .unwrap();
    }

    let mut sub = connect(&broker, "sub", 300);
    assert!(sub.session_present);
    broker.publish(Publish::new("t", "live0", QoS::AtMostOnce)).unwrap();

    let mut received = Vec::new();
    let mut batch = sub.publishes();
    // Only the window's worth goes out before any ack
    assert_eq!(payloads(&batch), vec![b"q1".as_slice(), b"q2".as_slice()]);
    while !batch.is_empty() {
        for publish in &batch {
            if let Some(id) = publish.packet_id {
                broker.on_puback(&sub.key, id).unwrap();
            }
        }
        received.append(&mut batch);
        batch = sub.publishes();
    }

    assert_eq!(
        payloads(&received),
        vec![
            b"q1".as_slice(),
            b"q2".as_slice(),
            b"q3".as_slice(),
            b"q4".as_slice(),
            b"live0".as_slice(),
        ]
    );
    assert_eq!(broker.session_info("sub").unwrap().pending, 0);
}

#[tokio::test]
async fn test_unacked_resent_with_dup() {
    let broker = broker();
    let mut sub = connect(&broker, "sub", 300);
    subscribe(&broker, &sub, "t", SubscriptionOptions::new(QoS::AtLeastOnce));
    sub.drain();

    broker.publish(Publish::new("t", "x", QoS::AtLeastOnce)).unwrap();
    let first = sub.publishes();
    assert!(!first[0].dup);
    let id = first[0].packet_id.unwrap();
    broker.on_disconnect(&sub.key, true).unwrap();

    let mut sub = connect(&broker, "sub", 300);
    let resent = sub.publishes();
    assert_eq!(resent.len(), 1);
    assert!(resent[0].dup);
    assert_eq!(resent[0].packet_id, Some(id));

    broker.on_puback(&sub.key, id).unwrap();
    assert_eq!(broker.session_info("sub").unwrap().inflight, 0);
}

#[tokio::test]
async fn test_qos2_outbound_round_trip() {
    let broker = broker();
    let mut sub = connect(&broker, "sub", 300);
    subscribe(&broker, &sub, "t", SubscriptionOptions::new(QoS::ExactlyOnce));
    sub.drain();

    broker.publish(Publish::new("t", "x", QoS::ExactlyOnce)).unwrap();
    let id = sub.publishes()[0].packet_id.unwrap();

    broker.on_pubrec(&sub.key, PubRec::new(id)).unwrap();
    assert!(matches!(sub.drain().as_slice(), [Packet::PubRel(r)] if r.packet_id == id));

    // PUBREL goes out again after a reconnect
    broker.on_disconnect(&sub.key, true).unwrap();
    let mut sub = connect(&broker, "sub", 300);
    assert!(matches!(sub.drain().as_slice(), [Packet::PubRel(r)] if r.packet_id == id));

    broker.on_pubcomp(&sub.key, id).unwrap();
    assert_eq!(broker.session_info("sub").unwrap().inflight, 0);
    assert_eq!(
        broker.on_pubcomp(&sub.key, id),
        Err(BrokerError::UnknownPacketId(id))
    );

    // The id is free again
    broker.publish(Publish::new("t", "y", QoS::ExactlyOnce)).unwrap();
    assert_eq!(sub.publishes()[0].packet_id, Some(id));
}

#[tokio::test(start_paused = true)]
async fn test_zero_expiry_destroys_on_disconnect() {
    let broker = broker();
    let sub = connect(&broker, "sub", 0);
    subscribe(&broker, &sub, "t", SubscriptionOptions::new(QoS::AtLeastOnce));
    broker.on_disconnect(&sub.key, true).unwrap();

    assert_eq!(broker.session_count(), 0);
    assert_eq!(broker.subscription_count(), 0);
    assert_eq!(broker.publish(Publish::new("t", "x", QoS::AtLeastOnce)).unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_session_expires_after_interval() {
    let broker = broker();
    let sub = connect(&broker, "sub", 5);
    subscribe(&broker, &sub, "t", SubscriptionOptions::new(QoS::AtLeastOnce));
    broker.on_disconnect(&sub.key, true).unwrap();

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(
        broker.session_info("sub").unwrap().state,
        SessionState::Detached
    );

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(broker.session_info("sub").is_none());
    assert_eq!(broker.subscription_count(), 0);
    assert_eq!(broker.metrics().sessions_expired_total.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_cancels_expiry() {
    let broker = broker();
    let sub = connect(&broker, "sub", 5);
    broker.on_disconnect(&sub.key, true).unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    let sub = connect(&broker, "sub", 5);
    assert!(sub.session_present);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        broker.session_info("sub").unwrap().state,
        SessionState::Attached
    );
}

#[tokio::test(start_paused = true)]
async fn test_never_expiring_session() {
    let broker = broker();
    let sub = connect(&broker, "sub", SESSION_EXPIRY_NEVER);
    broker.on_disconnect(&sub.key, true).unwrap();

    tokio::time::sleep(Duration::from_secs(7 * 24 * 3600)).await;
    assert!(broker.session_info("sub").is_some());
}

#[tokio::test]
async fn test_will_published_on_disconnect() {
    let broker = broker();
    let mut watcher = connect(&broker, "watcher", 60);
    subscribe(&broker, &watcher, "lwt/#", SubscriptionOptions::new(QoS::AtMostOnce));
    watcher.drain();

    let dev = connect_with(
        &broker,
        "dev",
        ConnectOptions {
            clean_start: false,
            session_expiry_interval: Some(60),
            will: Some(will("lwt/dev", "offline", 0)),
        },
    );
    broker.on_disconnect(&dev.key, true).unwrap();
    assert_eq!(payloads(&watcher.publishes()), vec![b"offline".as_slice()]);
}

#[tokio::test]
async fn test_normal_disconnect_suppresses_will() {
    let broker = broker();
    let mut watcher = connect(&broker, "watcher", 60);
    subscribe(&broker, &watcher, "lwt/#", SubscriptionOptions::new(QoS::AtMostOnce));
    watcher.drain();

    let dev = connect_with(
        &broker,
        "dev",
        ConnectOptions {
            clean_start: false,
            session_expiry_interval: Some(60),
            will: Some(will("lwt/dev", "offline", 0)),
        },
    );
    broker.on_disconnect(&dev.key, false).unwrap();
    assert!(watcher.publishes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_delayed_will() {
    let broker = broker();
    let mut watcher = connect(&broker, "watcher", 600);
    subscribe(&broker, &watcher, "lwt/#", SubscriptionOptions::new(QoS::AtMostOnce));
    watcher.drain();

    let dev = connect_with(
        &broker,
        "dev",
        ConnectOptions {
            clean_start: false,
            session_expiry_interval: Some(600),
            will: Some(will("lwt/dev", "offline", 10)),
        },
    );
    broker.on_disconnect(&dev.key, true).unwrap();

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert!(watcher.publishes().is_empty());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(payloads(&watcher.publishes()), vec![b"offline".as_slice()]);
    assert!(!broker.session_info("dev").unwrap().has_will);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_cancels_delayed_will() {
    let broker = broker();
    let mut watcher = connect(&broker, "watcher", 600);
    subscribe(&broker, &watcher, "lwt/#", SubscriptionOptions::new(QoS::AtMostOnce));
    watcher.drain();

    let dev = connect_with(
        &broker,
        "dev",
        ConnectOptions {
            clean_start: false,
            session_expiry_interval: Some(600),
            will: Some(will("lwt/dev", "offline", 10)),
        },
    );
    broker.on_disconnect(&dev.key, true).unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    let _dev = connect(&broker, "dev", 600);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(watcher.publishes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_session_expiry_publishes_pending_will() {
    let broker = broker();
    let mut watcher = connect(&broker, "watcher", 600);
    subscribe(&broker, &watcher, "lwt/#", SubscriptionOptions::new(QoS::AtMostOnce));
    watcher.drain();

    let dev = connect_with(
        &broker,
        "dev",
        ConnectOptions {
            clean_start: false,
            session_expiry_interval: Some(5),
            will: Some(will("lwt/dev", "offline", 60)),
        },
    );
    broker.on_disconnect(&dev.key, true).unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(payloads(&watcher.publishes()), vec![b"offline".as_slice()]);
    assert!(broker.session_info("dev").is_none());

    // The will timer finds nothing left to publish
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(watcher.publishes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_past_deadline_publishes_will() {
    let broker = broker();
    let mut watcher = connect(&broker, "watcher", 600);
    subscribe(&broker, &watcher, "lwt/#", SubscriptionOptions::new(QoS::AtMostOnce));
    watcher.drain();

    // Set up through the registry so no expiry timer is armed, as when the
    // deadline passes before the timer task gets to run
    let (conn, _rx) = ChannelConnection::new("dev", 16);
    let conn: Arc<dyn Connection> = conn;
    let attach = broker.sessions().connect(
        &conn,
        false,
        5,
        Some(will("lwt/dev", "offline", 60)),
        broker.subscriptions(),
    );
    broker
        .sessions()
        .disconnect(&attach.key, true, broker.subscriptions(), |_| {});

    tokio::time::advance(Duration::from_secs(6)).await;
    let dev = connect(&broker, "dev", 600);
    assert!(!dev.session_present);
    assert_eq!(payloads(&watcher.publishes()), vec![b"offline".as_slice()]);
    assert_eq!(broker.metrics().sessions_expired_total.get(), 1);
}

#[tokio::test]
async fn test_takeover_discards_old_will() {
    let broker = broker();
    let mut watcher = connect(&broker, "watcher", 60);
    subscribe(&broker, &watcher, "lwt/#", SubscriptionOptions::new(QoS::AtMostOnce));
    watcher.drain();

    let first = connect_with(
        &broker,
        "dev",
        ConnectOptions {
            clean_start: false,
            session_expiry_interval: Some(60),
            will: Some(will("lwt/dev", "offline", 0)),
        },
    );
    let _second = connect(&broker, "dev", 60);

    assert!(broker.on_disconnect(&first.key, true).is_err());
    assert!(watcher.publishes().is_empty());
    assert!(!broker.session_info("dev").unwrap().has_will);
}
