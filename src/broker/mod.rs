//! MQTT Broker Core
//!
//! Orchestrates the subscription registry, retained store and session
//! registry. The transport layer calls in with already-parsed packets and a
//! [`SessionKey`]; the broker answers through each client's [`Connection`].
//!
//! Lock discipline: routing collects matching subscribers under the
//! subscription read lock, releases it, then delivers under the session
//! read lock. Operations that need both always take the session lock first.

pub mod connection;
mod error;
mod router;

pub use connection::{ChannelConnection, Connection, SendError};
pub use error::BrokerError;

use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::metrics::Metrics;
use crate::protocol::{
    Disconnect, Packet, PacketId, ProtocolError, PubAck, PubComp, PubRec, Publish, QoS,
    ReasonCode, SubAck, Subscribe, UnsubAck, Unsubscribe, Will, SESSION_EXPIRY_NEVER,
};
use crate::retained::RetainedStore;
use crate::session::registry::SessionInfo;
use crate::session::{
    Delivery, IncomingQos2, QueueResult, Session, SessionKey, SessionLimits, SessionRegistry,
};
use crate::timer::Timers;
use crate::topic::{validate_topic_name_with_max_levels, SubscriptionRegistry};
use router::RoutePlanner;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum QoS
    pub max_qos: QoS,
    /// Retain available
    pub retain_available: bool,
    /// Maximum topic levels (0 = unlimited)
    pub max_topic_levels: usize,
    /// Per-session limits
    pub session: SessionLimits,
    /// Delay between telling a taken-over connection to go and closing it
    pub takeover_grace: Duration,
    /// Session expiry used when a persistent session asks for none
    pub default_session_expiry: u32,
    /// Capacity of the broker event channel
    pub event_capacity: usize,
    /// How often expired retained messages are dropped (zero disables)
    pub retained_purge_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            max_topic_levels: 0,
            session: SessionLimits::default(),
            takeover_grace: Duration::from_millis(100),
            default_session_expiry: SESSION_EXPIRY_NEVER,
            event_capacity: 1024,
            retained_purge_interval: Duration::from_secs(60),
        }
    }
}

/// Client-supplied CONNECT flags
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub clean_start: bool,
    /// Requested session expiry in seconds; `SESSION_EXPIRY_NEVER` never expires
    pub session_expiry_interval: Option<u32>,
    pub will: Option<Will>,
}

/// Result of a successful CONNECT
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    /// A prior session was resumed
    pub session_present: bool,
    /// Key to pass back on every later call for this connection
    pub key: SessionKey,
}

/// Broker events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Client connected
    ClientConnected {
        client_id: Arc<str>,
        session_present: bool,
    },
    /// Client disconnected
    ClientDisconnected { client_id: Arc<str> },
    /// A newer connection evicted the attached one
    SessionTakenOver { client_id: Arc<str> },
    /// Session destroyed after its expiry interval
    SessionExpired { client_id: Arc<str> },
    /// Message routed
    MessagePublished {
        topic: Arc<str>,
        qos: QoS,
        matched: usize,
    },
    /// Message dropped for one subscriber
    MessageDropped { client_id: Arc<str>, topic: Arc<str> },
    SubscriptionAdded {
        client_id: Arc<str>,
        filter: String,
        qos: QoS,
    },
    SubscriptionRemoved { client_id: Arc<str>, filter: String },
}

struct BrokerInner {
    config: BrokerConfig,
    subscriptions: Arc<SubscriptionRegistry>,
    retained: Arc<RetainedStore>,
    sessions: Arc<SessionRegistry>,
    timers: Timers,
    metrics: Metrics,
    events: broadcast::Sender<BrokerEvent>,
}

/// The MQTT broker core
///
/// Cheap to clone; all clones share state. Timers hold only a weak
/// reference, so dropping the last clone stops pending timers from acting.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Create a broker over explicitly owned registries
    ///
    /// Must be called within a tokio runtime, which runs the broker's timers.
    pub fn new(
        config: BrokerConfig,
        subscriptions: Arc<SubscriptionRegistry>,
        retained: Arc<RetainedStore>,
        sessions: Arc<SessionRegistry>,
    ) -> Result<Self, BrokerError> {
        let timers = Timers::current().ok_or(BrokerError::NoRuntime)?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let broker = Self {
            inner: Arc::new(BrokerInner {
                config,
                subscriptions,
                retained,
                sessions,
                timers,
                metrics: Metrics::new(),
                events,
            }),
        };
        broker.start_retained_purge();
        Ok(broker)
    }

    /// Periodically drop retained messages whose expiry has passed
    ///
    /// Stops on its own once the last broker clone is gone.
    fn start_retained_purge(&self) {
        let period = self.inner.config.retained_purge_interval;
        if period.is_zero() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.timers.every(period, move || {
            let Some(broker) = upgrade(&weak) else {
                return ControlFlow::Break(());
            };
            let purged = broker.inner.retained.purge_expired();
            if purged > 0 {
                debug!(purged, "purged expired retained messages");
            }
            ControlFlow::Continue(())
        });
    }

    /// Create a broker with fresh registries built from `config`
    pub fn with_defaults(config: BrokerConfig) -> Result<Self, BrokerError> {
        let subscriptions = Arc::new(SubscriptionRegistry::with_max_topic_levels(
            config.max_topic_levels,
        ));
        let sessions = Arc::new(SessionRegistry::new(config.session));
        Self::new(config, subscriptions, Arc::new(RetainedStore::new()), sessions)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: BrokerEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    /// Attach a connection after CONNECT
    ///
    /// A live connection already attached for the same client id is sent a
    /// DISCONNECT (session taken over) and closed after a short grace delay.
    /// Messages left unacknowledged by a resumed session are resent before
    /// this returns.
    pub fn on_connect(
        &self,
        connection: Arc<dyn Connection>,
        options: ConnectOptions,
    ) -> Result<ConnectOutcome, BrokerError> {
        let inner = &self.inner;
        if connection.client_id().is_empty() {
            return Err(BrokerError::Protocol(
                ProtocolError::ProtocolViolation("empty client identifier"),
            ));
        }
        if let Some(will) = &options.will {
            validate_topic_name_with_max_levels(&will.topic, inner.config.max_topic_levels)?;
        }

        let expiry = options.session_expiry_interval.unwrap_or(if options.clean_start {
            0
        } else {
            inner.config.default_session_expiry
        });

        let attach = inner.sessions.connect(
            &connection,
            options.clean_start,
            expiry,
            options.will,
            &inner.subscriptions,
        );
        let client_id = attach.key.client_id_arc().clone();

        if attach.expired {
            inner.metrics.sessions_expired_total.inc();
            if let Some(will) = attach.expired_will {
                self.publish_will(&client_id, will);
            }
            self.emit(BrokerEvent::SessionExpired {
                client_id: client_id.clone(),
            });
        }

        if let Some(evicted) = attach.evicted {
            debug!(client_id = %client_id, "session taken over");
            let _ = evicted.send(Packet::Disconnect(Disconnect {
                reason_code: ReasonCode::SessionTakenOver,
            }));
            inner
                .timers
                .schedule(inner.config.takeover_grace, move || evicted.close());
            inner.metrics.sessions_taken_over_total.inc();
            self.emit(BrokerEvent::SessionTakenOver {
                client_id: client_id.clone(),
            });
        }

        self.emit(BrokerEvent::ClientConnected {
            client_id,
            session_present: attach.session_present,
        });

        Ok(ConnectOutcome {
            session_present: attach.session_present,
            key: attach.key,
        })
    }

    /// The live connection attached under `key`
    fn connection_for(&self, key: &SessionKey) -> Result<Arc<dyn Connection>, BrokerError> {
        self.inner
            .sessions
            .resolve(key, |s| s.connection())
            .flatten()
            .ok_or_else(|| BrokerError::UnknownSession(key.client_id_arc().clone()))
    }

    /// Handle a PUBLISH from a client
    ///
    /// Acknowledges QoS 1 with PUBACK and QoS 2 with PUBREC. A QoS 2 message
    /// whose packet id is still awaiting PUBREL is acknowledged again but not
    /// routed a second time.
    pub fn on_publish(&self, key: &SessionKey, mut publish: Publish) -> Result<(), BrokerError> {
        let inner = &self.inner;
        let connection = self.connection_for(key)?;
        let packet_id = match publish.qos {
            QoS::AtMostOnce => None,
            _ => Some(publish.packet_id.ok_or(BrokerError::Protocol(
                ProtocolError::ProtocolViolation("missing packet identifier"),
            ))?),
        };

        let rejection = if let Err(e) =
            validate_topic_name_with_max_levels(&publish.topic, inner.config.max_topic_levels)
        {
            Some((e.reason_code(), e))
        } else if publish.qos > inner.config.max_qos {
            Some((
                ReasonCode::QoSNotSupported,
                ProtocolError::ProtocolViolation("QoS not supported"),
            ))
        } else if publish.retain && !inner.config.retain_available {
            Some((
                ReasonCode::RetainNotSupported,
                ProtocolError::ProtocolViolation("retain not supported"),
            ))
        } else {
            None
        };
        if let Some((reason, e)) = rejection {
            debug!(client_id = key.client_id(), topic = %publish.topic, error = %e, "rejecting publish");
            if let Some(id) = packet_id {
                let _ = connection.send(ack_packet(publish.qos, id, reason));
            }
            return Err(e.into());
        }

        publish.dup = false;
        publish.properties.subscription_identifiers.clear();
        inner.metrics.publish_received_total.inc();

        let Some(id) = packet_id else {
            self.route(&publish, Some(key.client_id()));
            return Ok(());
        };

        if publish.qos == QoS::ExactlyOnce {
            let state = inner
                .sessions
                .resolve(key, |s| s.begin_incoming_qos2(id))
                .ok_or_else(|| BrokerError::UnknownSession(key.client_id_arc().clone()))?;
            match state {
                IncomingQos2::New => {}
                IncomingQos2::Duplicate => {
                    trace!(client_id = key.client_id(), packet_id = id, "duplicate QoS 2 publish");
                    let _ = connection.send(Packet::PubRec(PubRec::new(id)));
                    return Ok(());
                }
                IncomingQos2::QuotaExceeded => {
                    debug!(client_id = key.client_id(), "too many QoS 2 messages awaiting PUBREL");
                    let _ = connection.send(Packet::PubRec(PubRec::with_reason(
                        id,
                        ReasonCode::QuotaExceeded,
                    )));
                    return Ok(());
                }
            }
        }

        let matched = self.route(&publish, Some(key.client_id()));
        let reason = if matched == 0 {
            ReasonCode::NoMatchingSubscribers
        } else {
            ReasonCode::Success
        };
        let _ = connection.send(ack_packet(publish.qos, id, reason));
        Ok(())
    }

    /// Publish a broker-originated message
    ///
    /// Returns the number of clients it was routed to.
    pub fn publish(&self, mut publish: Publish) -> Result<usize, BrokerError> {
        validate_topic_name_with_max_levels(&publish.topic, self.inner.config.max_topic_levels)?;
        publish.qos = publish.qos.min(self.inner.config.max_qos);
        Ok(self.route(&publish, None))
    }

    /// Route a message to every matching subscriber
    fn route(&self, publish: &Publish, publisher: Option<&str>) -> usize {
        let inner = &self.inner;
        if publish.retain && inner.config.retain_available {
            inner.retained.apply(publish);
        }

        let mut planner = RoutePlanner::new(publisher);
        inner
            .subscriptions
            .for_each_subscriber(&publish.topic, |sub| planner.add(sub));
        let routes = planner.finish();
        let matched = routes.len();

        if matched == 0 {
            trace!(topic = %publish.topic, "no matching subscribers");
        } else {
            inner.sessions.for_each_session(
                routes.into_iter().map(|r| (r.client_id.clone(), r)),
                |route, session| {
                    let delivery = session.deliver(route.outgoing(publish));
                    self.record_delivery(delivery, &route.client_id, &publish.topic);
                },
            );
        }

        self.emit(BrokerEvent::MessagePublished {
            topic: publish.topic.clone(),
            qos: publish.qos,
            matched,
        });
        matched
    }

    fn record_delivery(&self, delivery: Delivery, client_id: &Arc<str>, topic: &Arc<str>) {
        let metrics = &self.inner.metrics;
        match delivery {
            Delivery::Sent => metrics.publish_delivered_total.inc(),
            Delivery::Queued(QueueResult::Queued) => metrics.publish_queued_total.inc(),
            Delivery::Queued(QueueResult::DroppedOldest) => {
                metrics.publish_queued_total.inc();
                metrics.publish_dropped_total.inc();
                self.emit(BrokerEvent::MessageDropped {
                    client_id: client_id.clone(),
                    topic: topic.clone(),
                });
            }
            Delivery::Queued(QueueResult::DroppedNewest) | Delivery::Discarded => {
                metrics.publish_dropped_total.inc();
                self.emit(BrokerEvent::MessageDropped {
                    client_id: client_id.clone(),
                    topic: topic.clone(),
                });
            }
        }
    }

    /// Handle a SUBSCRIBE
    ///
    /// Sends SUBACK, then the retained messages each new subscription asks
    /// for. Returns one reason code per requested filter, in order.
    pub fn on_subscribe(
        &self,
        key: &SessionKey,
        subscribe: Subscribe,
    ) -> Result<Vec<ReasonCode>, BrokerError> {
        let inner = &self.inner;
        let client_id = key.client_id_arc().clone();

        let (codes, added) = inner
            .sessions
            .resolve(key, |session| {
                let mut codes = Vec::with_capacity(subscribe.subscriptions.len());
                let mut added = Vec::new();
                let mut replay = Vec::new();

                for sub in &subscribe.subscriptions {
                    let mut options = sub.options;
                    options.max_qos = options.max_qos.min(inner.config.max_qos);

                    match inner.subscriptions.subscribe(
                        &client_id,
                        &sub.filter,
                        options,
                        subscribe.subscription_id,
                    ) {
                        Ok(replaced) => {
                            debug!(client_id = %client_id, filter = %sub.filter, qos = ?options.max_qos, "subscribed");
                            codes.push(ReasonCode::granted(options.max_qos));
                            added.push((sub.filter.clone(), options.max_qos));
                            if options.retain_handling.should_send(replaced.is_some()) {
                                replay.push((sub.filter.as_str(), options.max_qos));
                            }
                        }
                        Err(e) => {
                            debug!(client_id = %client_id, filter = %sub.filter, error = %e, "rejected subscription");
                            codes.push(e.reason_code());
                        }
                    }
                }

                if let Some(connection) = session.connection() {
                    let _ = connection.send(Packet::SubAck(SubAck {
                        packet_id: subscribe.packet_id,
                        reason_codes: codes.clone(),
                    }));
                }

                if inner.config.retain_available {
                    self.replay_retained(session, &replay, subscribe.subscription_id);
                }
                (codes, added)
            })
            .ok_or_else(|| BrokerError::UnknownSession(client_id.clone()))?;

        for (filter, qos) in added {
            self.emit(BrokerEvent::SubscriptionAdded {
                client_id: client_id.clone(),
                filter,
                qos,
            });
        }
        Ok(codes)
    }

    fn replay_retained(
        &self,
        session: &mut Session,
        filters: &[(&str, QoS)],
        subscription_id: Option<u32>,
    ) {
        let now = tokio::time::Instant::now();
        for &(filter, qos) in filters {
            for message in self.inner.retained.matches(filter) {
                let mut publish = message.to_publish(qos, now);
                publish.properties.subscription_identifiers = subscription_id.into_iter().collect();
                let delivery = session.deliver(publish);
                self.record_delivery(delivery, &session.client_id, &message.topic);
            }
        }
    }

    /// Handle an UNSUBSCRIBE
    ///
    /// Sends UNSUBACK and returns, per filter, whether a subscription existed.
    pub fn on_unsubscribe(
        &self,
        key: &SessionKey,
        unsubscribe: Unsubscribe,
    ) -> Result<Vec<bool>, BrokerError> {
        let inner = &self.inner;
        let client_id = key.client_id_arc().clone();

        let existed = inner
            .sessions
            .resolve(key, |session| {
                let existed: Vec<bool> = unsubscribe
                    .filters
                    .iter()
                    .map(|filter| inner.subscriptions.unsubscribe(&client_id, filter))
                    .collect();

                if let Some(connection) = session.connection() {
                    let _ = connection.send(Packet::UnsubAck(UnsubAck {
                        packet_id: unsubscribe.packet_id,
                        reason_codes: existed
                            .iter()
                            .map(|&e| {
                                if e {
                                    ReasonCode::Success
                                } else {
                                    ReasonCode::NoSubscriptionExisted
                                }
                            })
                            .collect(),
                    }));
                }
                existed
            })
            .ok_or_else(|| BrokerError::UnknownSession(client_id.clone()))?;

        for (filter, _) in unsubscribe.filters.into_iter().zip(&existed).filter(|(_, e)| **e) {
            debug!(client_id = %client_id, filter = %filter, "unsubscribed");
            self.emit(BrokerEvent::SubscriptionRemoved {
                client_id: client_id.clone(),
                filter,
            });
        }
        Ok(existed)
    }

    /// Handle the end of a connection
    ///
    /// The session is destroyed at once if its expiry interval is 0 and
    /// otherwise kept with an expiry timer (none for the never-expire
    /// sentinel). The will, unless `send_will` is false, is published now or
    /// after its delay. A key that was already taken over is rejected and
    /// changes nothing.
    pub fn on_disconnect(&self, key: &SessionKey, send_will: bool) -> Result<(), BrokerError> {
        let inner = &self.inner;
        let detach = inner
            .sessions
            .disconnect(key, send_will, &inner.subscriptions, |session| {
                self.arm_timers(session)
            })
            .ok_or_else(|| BrokerError::UnknownSession(key.client_id_arc().clone()))?;

        let client_id = key.client_id_arc().clone();
        if detach.destroyed {
            inner.metrics.sessions_expired_total.inc();
        }
        if let Some(will) = detach.will {
            self.publish_will(&client_id, will);
        }
        if detach.destroyed {
            self.emit(BrokerEvent::SessionExpired {
                client_id: client_id.clone(),
            });
        }
        self.emit(BrokerEvent::ClientDisconnected { client_id });
        Ok(())
    }

    /// Schedule expiry and delayed will for a freshly detached session
    fn arm_timers(&self, session: &mut Session) {
        let epoch = session.epoch();

        if session.session_expiry_interval != SESSION_EXPIRY_NEVER {
            let broker = Arc::downgrade(&self.inner);
            let client_id = session.client_id.clone();
            session.expiry_timer = Some(self.inner.timers.schedule(
                Duration::from_secs(session.session_expiry_interval as u64),
                move || {
                    if let Some(broker) = upgrade(&broker) {
                        broker.expire_session(&client_id, epoch);
                    }
                },
            ));
        }

        let will_delay = session
            .will
            .as_ref()
            .and_then(|w| w.properties.will_delay_interval)
            .unwrap_or(0);
        if session.will.is_some() && will_delay > 0 {
            let broker = Arc::downgrade(&self.inner);
            let client_id = session.client_id.clone();
            session.will_timer = Some(self.inner.timers.schedule(
                Duration::from_secs(will_delay as u64),
                move || {
                    if let Some(broker) = upgrade(&broker) {
                        if let Some(will) =
                            broker.inner.sessions.take_delayed_will(&client_id, epoch)
                        {
                            broker.publish_will(&client_id, will);
                        }
                    }
                },
            ));
        }
    }

    fn expire_session(&self, client_id: &Arc<str>, epoch: u64) {
        let inner = &self.inner;
        let Some(expired) = inner.sessions.expire(client_id, epoch, &inner.subscriptions) else {
            return;
        };
        inner.metrics.sessions_expired_total.inc();
        if let Some(will) = expired.will {
            self.publish_will(client_id, will);
        }
        self.emit(BrokerEvent::SessionExpired {
            client_id: client_id.clone(),
        });
    }

    fn publish_will(&self, client_id: &Arc<str>, will: Will) {
        debug!(client_id = %client_id, topic = %will.topic, "publishing will");
        let mut publish = will.into_publish();
        publish.qos = publish.qos.min(self.inner.config.max_qos);
        self.route(&publish, Some(client_id));
    }

    /// Handle PUBACK
    pub fn on_puback(&self, key: &SessionKey, packet_id: PacketId) -> Result<(), BrokerError> {
        let acked = self
            .inner
            .sessions
            .resolve(key, |s| s.ack_puback(packet_id))
            .ok_or_else(|| BrokerError::UnknownSession(key.client_id_arc().clone()))?;
        unknown_ack(key, "PUBACK", packet_id, acked)
    }

    /// Handle PUBREC; replies with PUBREL
    pub fn on_pubrec(&self, key: &SessionKey, pubrec: PubRec) -> Result<(), BrokerError> {
        let acked = self
            .inner
            .sessions
            .resolve(key, |s| s.ack_pubrec(pubrec.packet_id, pubrec.reason_code))
            .ok_or_else(|| BrokerError::UnknownSession(key.client_id_arc().clone()))?;
        unknown_ack(key, "PUBREC", pubrec.packet_id, acked)
    }

    /// Handle PUBCOMP
    pub fn on_pubcomp(&self, key: &SessionKey, packet_id: PacketId) -> Result<(), BrokerError> {
        let acked = self
            .inner
            .sessions
            .resolve(key, |s| s.ack_pubcomp(packet_id))
            .ok_or_else(|| BrokerError::UnknownSession(key.client_id_arc().clone()))?;
        unknown_ack(key, "PUBCOMP", packet_id, acked)
    }

    /// Handle PUBREL for an inbound QoS 2 message; replies with PUBCOMP
    pub fn on_pubrel(&self, key: &SessionKey, packet_id: PacketId) -> Result<(), BrokerError> {
        let (released, connection) = self
            .inner
            .sessions
            .resolve(key, |s| (s.release_incoming(packet_id), s.connection()))
            .ok_or_else(|| BrokerError::UnknownSession(key.client_id_arc().clone()))?;

        if let Some(connection) = connection {
            let reason = if released {
                ReasonCode::Success
            } else {
                ReasonCode::PacketIdNotFound
            };
            let _ = connection.send(Packet::PubComp(PubComp::with_reason(packet_id, reason)));
        }
        unknown_ack(key, "PUBREL", packet_id, released)
    }

    /// Get session count
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Get retained message count
    pub fn retained_count(&self) -> usize {
        self.inner.retained.len()
    }

    pub fn session_info(&self, client_id: &str) -> Option<SessionInfo> {
        self.inner.sessions.session_info(client_id)
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.subscriptions
    }

    pub fn retained(&self) -> &Arc<RetainedStore> {
        &self.inner.retained
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.sessions
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Sample the gauges and render all metrics in the Prometheus text format
    pub fn gather_metrics(&self) -> String {
        let inner = &self.inner;
        let metrics = &inner.metrics;
        metrics.sessions_current.set(inner.sessions.len() as i64);
        metrics
            .subscriptions_current
            .set(inner.subscriptions.len() as i64);
        metrics
            .retained_messages_current
            .set(inner.retained.len() as i64);
        metrics
            .inflight_messages
            .set(inner.sessions.inflight_total() as i64);
        metrics.gather_text()
    }
}

fn upgrade(inner: &Weak<BrokerInner>) -> Option<Broker> {
    inner.upgrade().map(|inner| Broker { inner })
}

fn ack_packet(qos: QoS, packet_id: PacketId, reason: ReasonCode) -> Packet {
    if qos == QoS::ExactlyOnce {
        Packet::PubRec(PubRec::with_reason(packet_id, reason))
    } else {
        Packet::PubAck(PubAck::with_reason(packet_id, reason))
    }
}

fn unknown_ack(
    key: &SessionKey,
    kind: &'static str,
    packet_id: PacketId,
    acked: bool,
) -> Result<(), BrokerError> {
    if acked {
        Ok(())
    } else {
        warn!(client_id = key.client_id(), packet_id, "{} for unknown packet id", kind);
        Err(BrokerError::UnknownPacketId(packet_id))
    }
}

#[cfg(test)]
mod tests;
