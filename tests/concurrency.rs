//! Broker behavior under concurrent callers on a multi-threaded runtime

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tokio::sync::Barrier;

use common::{broker, connect, subscribe, TestClient};
use vibemq_core::broker::Broker;
use vibemq_core::protocol::{Packet, Publish, QoS, ReasonCode, SubscriptionOptions, Unsubscribe};

const CONTENDERS: usize = 8;
const MESSAGES: u32 = 300;

fn numbered(n: u32) -> Publish {
    Publish::new("t", n.to_string(), QoS::AtMostOnce)
}

/// Payload numbers received, and whether a takeover DISCONNECT arrived
fn received(client: &mut TestClient) -> (Vec<u32>, bool) {
    let mut numbers = Vec::new();
    let mut taken_over = false;
    for packet in client.drain() {
        match packet {
            Packet::Publish(p) => {
                assert!(!taken_over, "publish after takeover");
                let text = std::str::from_utf8(&p.payload).unwrap();
                numbers.push(text.parse().unwrap());
            }
            Packet::Disconnect(d) => {
                assert_eq!(d.reason_code, ReasonCode::SessionTakenOver);
                taken_over = true;
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }
    (numbers, taken_over)
}

fn publish_all(broker: Broker, range: std::ops::Range<u32>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        for n in range {
            broker.publish(numbered(n)).unwrap();
            if n % 16 == 0 {
                tokio::task::yield_now().await;
            }
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_connects_leave_single_owner() {
    let broker = broker();
    let mut seed = connect(&broker, "dev", 600);
    subscribe(&broker, &seed, "t", SubscriptionOptions::new(QoS::AtMostOnce));
    seed.drain();

    let barrier = Arc::new(Barrier::new(CONTENDERS + 1));
    let contenders: Vec<_> = (0..CONTENDERS)
        .map(|_| {
            let broker = broker.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                connect(&broker, "dev", 600)
            })
        })
        .collect();

    barrier.wait().await;
    let publisher = publish_all(broker.clone(), 0..MESSAGES);

    let mut clients = vec![seed];
    for task in contenders {
        clients.push(task.await.unwrap());
    }
    publisher.await.unwrap();

    // Exactly one connection still owns the session
    let owners: Vec<usize> = clients
        .iter()
        .enumerate()
        .filter(|(_, c)| broker.sessions().resolve(&c.key, |_| ()).is_some())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(owners.len(), 1);
    let owner = owners[0];

    // Every other connection was told it was taken over, and the messages
    // routed during the race went to exactly one connection each
    let mut all = Vec::new();
    for (i, client) in clients.iter_mut().enumerate() {
        let (numbers, taken_over) = received(client);
        assert_eq!(taken_over, i != owner, "connection {i}");
        assert!(numbers.windows(2).all(|w| w[0] < w[1]));
        all.extend(numbers);
    }
    all.sort_unstable();
    assert_eq!(all, (0..MESSAGES).collect::<Vec<_>>());

    // Once settled, the owner gets each message once
    for n in MESSAGES..MESSAGES + 50 {
        broker.publish(numbered(n)).unwrap();
    }
    let (numbers, taken_over) = received(&mut clients[owner]);
    assert!(!taken_over);
    assert_eq!(numbers, (MESSAGES..MESSAGES + 50).collect::<Vec<_>>());
    assert_eq!(broker.session_count(), 1);
    assert_eq!(broker.subscription_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscription_churn_during_routing() {
    let broker = broker();
    let mut stable = connect(&broker, "stable", 600);
    subscribe(&broker, &stable, "t", SubscriptionOptions::new(QoS::AtMostOnce));
    // Overlaps the exact subscription; still one copy per message
    subscribe(&broker, &stable, "#", SubscriptionOptions::new(QoS::AtMostOnce));
    stable.drain();

    let churners: Vec<_> = (0..4)
        .map(|i| {
            let broker = broker.clone();
            tokio::spawn(async move {
                let client = connect(&broker, &format!("churn-{i}"), 600);
                for round in 0..50 {
                    subscribe(&broker, &client, "t", SubscriptionOptions::new(QoS::AtMostOnce));
                    let removed = broker
                        .on_unsubscribe(
                            &client.key,
                            Unsubscribe {
                                packet_id: round + 1,
                                filters: vec!["t".to_string()],
                            },
                        )
                        .unwrap();
                    assert_eq!(removed, vec![true]);
                    tokio::task::yield_now().await;
                }
                client
            })
        })
        .collect();

    publish_all(broker.clone(), 0..MESSAGES).await.unwrap();
    for task in churners {
        task.await.unwrap();
    }

    let (numbers, _) = received(&mut stable);
    assert_eq!(numbers, (0..MESSAGES).collect::<Vec<_>>());
    assert_eq!(broker.subscription_count(), 2);
}
