//! MQTT Session Management
//!
//! Per-client delivery state that outlives individual network connections:
//! outbound QoS 1/2 inflight tracking, the pending message queue, inbound
//! QoS 2 exactly-once bookkeeping, the will message and the timers armed
//! while the client is away.

mod packet_id;
pub mod registry;

pub use packet_id::{PacketIdPool, PacketIdWidth};
pub use registry::{Attach, SessionKey, SessionRegistry};

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::broker::connection::Connection;
use crate::protocol::{
    Packet, PacketId, PubRel, Publish, QoS, ReasonCode, Will, SESSION_EXPIRY_NEVER,
};
use crate::timer::TimerHandle;

/// Identifies one network connection for the lifetime of the broker
pub type ConnectionId = u64;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no connection attached yet
    New,
    /// A live connection is attached
    Attached,
    /// Connection gone, expiry timer armed
    Detached,
    /// Destroyed; kept only by whoever still holds the value
    Expired,
}

/// What to do when the pending queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room
    #[default]
    DropOldest,
    /// Reject the incoming message
    DropNewest,
}

/// Per-session resource limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Pending queue capacity (0 = unbounded)
    pub max_queued_messages: usize,
    pub overflow_policy: OverflowPolicy,
    /// Queue QoS 0 messages while detached
    pub queue_qos0: bool,
    /// Outstanding outbound QoS 1/2 messages (0 = bounded only by the id space)
    pub max_inflight: usize,
    /// Inbound QoS 2 messages awaiting PUBREL
    pub max_awaiting_rel: usize,
    pub packet_id_width: PacketIdWidth,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_queued_messages: 1000,
            overflow_policy: OverflowPolicy::DropOldest,
            queue_qos0: true,
            max_inflight: 32,
            max_awaiting_rel: 100,
            packet_id_width: PacketIdWidth::U16,
        }
    }
}

/// QoS 2 message state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2State {
    /// PUBLISH sent, waiting for PUBREC
    WaitingPubRec,
    /// PUBREC received, PUBREL sent, waiting for PUBCOMP
    WaitingPubComp,
}

/// Inflight message state for QoS 1/2
#[derive(Debug, Clone)]
pub struct InflightMessage {
    /// The publish packet, with its packet id set
    pub publish: Publish,
    /// QoS 2 state
    pub qos2_state: Option<Qos2State>,
    /// Send order within the session
    seq: u64,
}

/// A message waiting in the session queue
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub publish: Publish,
    pub queued_at: Instant,
}

impl QueuedMessage {
    fn new(publish: Publish) -> Self {
        Self {
            publish,
            queued_at: Instant::now(),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.publish
            .properties
            .message_expiry_interval
            .is_some_and(|secs| now >= self.queued_at + Duration::from_secs(secs as u64))
    }

    /// Take the publish, counting the time spent queued against its expiry
    fn into_publish(mut self, now: Instant) -> Publish {
        if let Some(secs) = self.publish.properties.message_expiry_interval {
            let waited = now.saturating_duration_since(self.queued_at).as_secs() as u32;
            self.publish.properties.message_expiry_interval = Some(secs.saturating_sub(waited));
        }
        self.publish
    }
}

/// Result of queueing a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueResult {
    Queued,
    /// Queued after evicting the oldest message
    DroppedOldest,
    /// Queue full, the new message was discarded
    DroppedNewest,
}

/// Result of handing a routed message to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the attached connection
    Sent,
    /// Placed in the pending queue
    Queued(QueueResult),
    /// QoS 0 message with nowhere to go
    Discarded,
}

/// Inbound QoS 2 PUBLISH bookkeeping result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingQos2 {
    /// First time this id is seen; route the message
    New,
    /// Id still awaiting PUBREL; acknowledge without routing again
    Duplicate,
    /// Too many messages awaiting PUBREL
    QuotaExceeded,
}

struct AttachedConnection {
    id: ConnectionId,
    handle: Weak<dyn Connection>,
}

/// Client session
pub struct Session {
    /// Client identifier
    pub client_id: Arc<str>,
    /// Session state
    pub state: SessionState,
    connection: Option<AttachedConnection>,
    /// Bumped on every attach and detach; timers compare it before acting
    epoch: u64,
    /// Session expiry interval in seconds (0 = delete on disconnect)
    pub session_expiry_interval: u32,
    limits: SessionLimits,
    packet_ids: PacketIdPool,
    /// Inflight outgoing messages (QoS 1/2)
    inflight_outgoing: AHashMap<PacketId, InflightMessage>,
    next_seq: u64,
    /// Inbound QoS 2 packet ids awaiting PUBREL
    awaiting_rel: AHashSet<PacketId>,
    /// Pending messages, oldest first
    pending: VecDeque<QueuedMessage>,
    /// Will message
    pub will: Option<Will>,
    pub(crate) will_timer: Option<TimerHandle>,
    pub(crate) expiry_timer: Option<TimerHandle>,
    /// Disconnect timestamp
    pub disconnected_at: Option<Instant>,
}

impl Session {
    pub fn new(client_id: Arc<str>, limits: SessionLimits) -> Self {
        Self {
            client_id,
            state: SessionState::New,
            connection: None,
            epoch: 0,
            session_expiry_interval: 0,
            limits,
            packet_ids: PacketIdPool::new(limits.packet_id_width),
            inflight_outgoing: AHashMap::new(),
            next_seq: 0,
            awaiting_rel: AHashSet::new(),
            pending: VecDeque::new(),
            will: None,
            will_timer: None,
            expiry_timer: None,
            disconnected_at: None,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Attach a connection, returning the previously attached one if it is
    /// still alive
    ///
    /// Cancels the expiry timer and any pending will: a reconnect before the
    /// will delay elapses means the will is not sent.
    pub fn attach(
        &mut self,
        id: ConnectionId,
        connection: &Arc<dyn Connection>,
    ) -> Option<Arc<dyn Connection>> {
        let previous = self.detach_connection();
        self.cancel_timers();
        self.will = None;
        self.connection = Some(AttachedConnection {
            id,
            handle: Arc::downgrade(connection),
        });
        self.state = SessionState::Attached;
        self.disconnected_at = None;
        self.epoch += 1;
        previous
    }

    /// Detach the current connection, returning it if it is still alive
    pub fn detach(&mut self) -> Option<Arc<dyn Connection>> {
        let previous = self.detach_connection();
        self.state = SessionState::Detached;
        self.disconnected_at = Some(Instant::now());
        self.epoch += 1;
        previous
    }

    fn detach_connection(&mut self) -> Option<Arc<dyn Connection>> {
        self.connection.take().and_then(|c| c.handle.upgrade())
    }

    pub fn is_attached(&self) -> bool {
        self.state == SessionState::Attached
    }

    /// Id of the attached connection
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(|c| c.id)
    }

    /// The attached connection, if it is still alive
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.as_ref().and_then(|c| c.handle.upgrade())
    }

    /// Cancel the expiry and will timers
    pub(crate) fn cancel_timers(&mut self) {
        if let Some(timer) = self.expiry_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.will_timer.take() {
            timer.cancel();
        }
    }

    /// Take the will message, cancelling its delay timer
    pub fn take_will(&mut self) -> Option<Will> {
        if let Some(timer) = self.will_timer.take() {
            timer.cancel();
        }
        self.will.take()
    }

    /// Check if a detached session has outlived its expiry interval
    pub fn is_expired(&self, now: Instant) -> bool {
        if self.state == SessionState::Expired {
            return true;
        }
        if self.state != SessionState::Detached
            || self.session_expiry_interval == SESSION_EXPIRY_NEVER
        {
            return false;
        }
        self.disconnected_at.is_some_and(|at| {
            now >= at + Duration::from_secs(self.session_expiry_interval as u64)
        })
    }

    /// Hand a routed message to the session
    ///
    /// Attached sessions send right away while the inflight window has room
    /// and nothing is queued; everything else waits in the pending queue so
    /// delivery order is kept.
    pub fn deliver(&mut self, publish: Publish) -> Delivery {
        let Some(connection) = self.connection().filter(|_| self.is_attached()) else {
            if publish.qos == QoS::AtMostOnce && !self.limits.queue_qos0 {
                return Delivery::Discarded;
            }
            return Delivery::Queued(self.queue_message(publish));
        };

        // Keep order behind anything already waiting
        if !self.pending.is_empty() {
            return Delivery::Queued(self.queue_message(publish));
        }

        if publish.qos == QoS::AtMostOnce {
            return if send(&*connection, Packet::Publish(publish)) {
                Delivery::Sent
            } else {
                Delivery::Discarded
            };
        }

        if self.inflight_full() {
            return Delivery::Queued(self.queue_message(publish));
        }

        match self.send_inflight(&*connection, publish) {
            Ok(()) => Delivery::Sent,
            Err(publish) => Delivery::Queued(self.queue_message(publish)),
        }
    }

    /// Queue a message for later delivery, applying the overflow policy
    pub fn queue_message(&mut self, publish: Publish) -> QueueResult {
        let capacity = self.limits.max_queued_messages;
        if capacity == 0 || self.pending.len() < capacity {
            self.pending.push_back(QueuedMessage::new(publish));
            return QueueResult::Queued;
        }

        match self.limits.overflow_policy {
            OverflowPolicy::DropOldest => {
                self.pending.pop_front();
                self.pending.push_back(QueuedMessage::new(publish));
                debug!(client_id = %self.client_id, "pending queue full, dropped oldest message");
                QueueResult::DroppedOldest
            }
            OverflowPolicy::DropNewest => {
                debug!(client_id = %self.client_id, "pending queue full, dropped new message");
                QueueResult::DroppedNewest
            }
        }
    }

    /// Resend unacknowledged messages and flush the pending queue after a
    /// connection attaches
    ///
    /// Inflight messages go first in their original send order: publishes
    /// awaiting PUBACK/PUBREC are resent with DUP set, QoS 2 messages already
    /// past PUBREC get their PUBREL again. Returns the number of packets sent.
    pub fn resume_delivery(&mut self) -> usize {
        let Some(connection) = self.connection() else {
            return 0;
        };

        let mut inflight: Vec<&mut InflightMessage> = self.inflight_outgoing.values_mut().collect();
        inflight.sort_by_key(|m| m.seq);

        let mut sent = 0;
        for message in inflight {
            let packet = match (message.qos2_state, message.publish.packet_id) {
                (Some(Qos2State::WaitingPubComp), Some(id)) => Packet::PubRel(PubRel::new(id)),
                _ => {
                    message.publish.dup = true;
                    Packet::Publish(message.publish.clone())
                }
            };
            if send(&*connection, packet) {
                sent += 1;
            }
        }

        sent + self.drain_pending(&*connection)
    }

    /// Move pending messages into the inflight window
    fn drain_pending(&mut self, connection: &dyn Connection) -> usize {
        let now = Instant::now();
        let mut sent = 0;

        while !self.inflight_full() {
            let Some(queued) = self.pending.pop_front() else {
                break;
            };
            if queued.is_expired(now) {
                trace!(client_id = %self.client_id, topic = %queued.publish.topic, "dropping expired message");
                continue;
            }

            let publish = queued.into_publish(now);
            if publish.qos == QoS::AtMostOnce {
                if send(connection, Packet::Publish(publish)) {
                    sent += 1;
                }
                continue;
            }

            match self.send_inflight(connection, publish) {
                Ok(()) => sent += 1,
                Err(publish) => {
                    // Id space exhausted; retry on the next ack
                    self.pending.push_front(QueuedMessage {
                        publish,
                        queued_at: now,
                    });
                    break;
                }
            }
        }

        sent
    }

    fn inflight_full(&self) -> bool {
        self.limits.max_inflight != 0 && self.inflight_outgoing.len() >= self.limits.max_inflight
    }

    /// Assign a packet id, record the message as inflight and send it.
    /// Hands the message back when no id is free.
    fn send_inflight(
        &mut self,
        connection: &dyn Connection,
        mut publish: Publish,
    ) -> Result<(), Publish> {
        let Some(packet_id) = self.packet_ids.allocate() else {
            return Err(publish);
        };

        publish.packet_id = Some(packet_id);
        publish.dup = false;
        let qos2_state = (publish.qos == QoS::ExactlyOnce).then_some(Qos2State::WaitingPubRec);
        self.next_seq += 1;
        self.inflight_outgoing.insert(
            packet_id,
            InflightMessage {
                publish: publish.clone(),
                qos2_state,
                seq: self.next_seq,
            },
        );

        // A failed send stays inflight and goes out again with DUP on resume
        send(connection, Packet::Publish(publish));
        Ok(())
    }

    fn complete(&mut self, packet_id: PacketId) {
        self.inflight_outgoing.remove(&packet_id);
        self.packet_ids.release(packet_id);
        if let Some(connection) = self.connection().filter(|_| self.is_attached()) {
            self.drain_pending(&*connection);
        }
    }

    /// Handle PUBACK for an outbound QoS 1 message
    pub fn ack_puback(&mut self, packet_id: PacketId) -> bool {
        match self.inflight_outgoing.get(&packet_id) {
            Some(m) if m.qos2_state.is_none() => {
                self.complete(packet_id);
                true
            }
            _ => false,
        }
    }

    /// Handle PUBREC for an outbound QoS 2 message
    ///
    /// Replies with PUBREL. An error reason code ends the exchange and frees
    /// the id instead.
    pub fn ack_pubrec(&mut self, packet_id: PacketId, reason_code: ReasonCode) -> bool {
        let Some(message) = self.inflight_outgoing.get_mut(&packet_id) else {
            return false;
        };
        if message.qos2_state.is_none() {
            return false;
        }

        if reason_code.is_error() {
            self.complete(packet_id);
            return true;
        }

        message.qos2_state = Some(Qos2State::WaitingPubComp);
        if let Some(connection) = self.connection() {
            send(&*connection, Packet::PubRel(PubRel::new(packet_id)));
        }
        true
    }

    /// Handle PUBCOMP for an outbound QoS 2 message
    pub fn ack_pubcomp(&mut self, packet_id: PacketId) -> bool {
        match self.inflight_outgoing.get(&packet_id) {
            Some(m) if m.qos2_state == Some(Qos2State::WaitingPubComp) => {
                self.complete(packet_id);
                true
            }
            _ => false,
        }
    }

    /// Record an inbound QoS 2 PUBLISH
    pub fn begin_incoming_qos2(&mut self, packet_id: PacketId) -> IncomingQos2 {
        if self.awaiting_rel.contains(&packet_id) {
            return IncomingQos2::Duplicate;
        }
        if self.awaiting_rel.len() >= self.limits.max_awaiting_rel {
            return IncomingQos2::QuotaExceeded;
        }
        self.awaiting_rel.insert(packet_id);
        IncomingQos2::New
    }

    /// Handle PUBREL for an inbound QoS 2 message
    pub fn release_incoming(&mut self, packet_id: PacketId) -> bool {
        self.awaiting_rel.remove(&packet_id)
    }

    /// Outbound messages awaiting acknowledgement
    pub fn inflight_count(&self) -> usize {
        self.inflight_outgoing.len()
    }

    pub fn inflight(&self, packet_id: PacketId) -> Option<&InflightMessage> {
        self.inflight_outgoing.get(&packet_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop all delivery state
    pub(crate) fn discard_state(&mut self) {
        self.inflight_outgoing.clear();
        self.packet_ids.clear();
        self.awaiting_rel.clear();
        self.pending.clear();
    }
}

fn send(connection: &dyn Connection, packet: Packet) -> bool {
    match connection.send(packet) {
        Ok(()) => true,
        Err(e) => {
            trace!(client_id = connection.client_id(), error = %e, "send failed");
            false
        }
    }
}
