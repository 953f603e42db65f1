//! Retained message store
//!
//! Keeps the last retained message per topic. Topics are stored twice: in a
//! flat map for O(1) set/clear/get, and in a trie keyed by topic level so a
//! subscription filter can be walked against the stored topics. Wildcards
//! only ever appear on the query side.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use bytes::Bytes;
use compact_str::CompactString;
use parking_lot::RwLock;
use smallvec::{smallvec, SmallVec};
use tokio::time::Instant;
use tracing::trace;

use crate::protocol::{Properties, Publish, QoS};
use crate::topic::{is_system_topic, parse_levels, TopicLevel};

/// Retained message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub properties: Properties,
    pub timestamp: Instant,
}

impl RetainedMessage {
    pub fn from_publish(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            properties: publish.properties.clone(),
            timestamp: Instant::now(),
        }
    }

    /// Whether the message expiry interval has elapsed at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        self.properties
            .message_expiry_interval
            .is_some_and(|secs| now >= self.timestamp + Duration::from_secs(secs as u64))
    }

    /// Build the publish replayed to a new subscriber
    ///
    /// The retain flag is always set and the remaining expiry interval is
    /// carried instead of the original one.
    pub fn to_publish(&self, max_qos: QoS, now: Instant) -> Publish {
        let mut properties = self.properties.clone();
        if let Some(secs) = properties.message_expiry_interval {
            let elapsed = now.saturating_duration_since(self.timestamp).as_secs();
            properties.message_expiry_interval = Some(secs.saturating_sub(elapsed as u32).max(1));
        }
        Publish {
            dup: false,
            qos: self.qos.min(max_qos),
            retain: true,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
            properties,
        }
    }
}

#[derive(Default)]
struct RetainedNode {
    children: AHashMap<CompactString, RetainedNode>,
    message: Option<Arc<RetainedMessage>>,
}

impl RetainedNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.message.is_none()
    }

    fn remove(&mut self, levels: &[&str]) -> Option<Arc<RetainedMessage>> {
        let Some((level, rest)) = levels.split_first() else {
            return self.message.take();
        };
        let child = self.children.get_mut(*level)?;
        let removed = child.remove(rest);
        if child.is_empty() {
            self.children.remove(*level);
        }
        removed
    }
}

#[derive(Default)]
struct Inner {
    by_topic: AHashMap<Arc<str>, Arc<RetainedMessage>>,
    root: RetainedNode,
}

impl Inner {
    fn insert(&mut self, message: Arc<RetainedMessage>) {
        let mut node = &mut self.root;
        for level in message.topic.split('/') {
            node = node.children.entry(CompactString::new(level)).or_default();
        }
        node.message = Some(message.clone());
        self.by_topic.insert(message.topic.clone(), message);
    }

    fn remove(&mut self, topic: &str) -> Option<Arc<RetainedMessage>> {
        self.by_topic.remove(topic)?;
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        self.root.remove(&levels)
    }
}

/// What a retained publish did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainOutcome {
    /// Message stored (replacing any previous one)
    Stored,
    /// Empty payload removed an existing entry
    Cleared,
    /// Empty payload for a topic with no entry
    Unchanged,
}

/// Thread-safe retained message store
#[derive(Default)]
pub struct RetainedStore {
    inner: RwLock<Inner>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a publish that carries the retain flag
    ///
    /// An empty payload clears the topic instead of storing an empty entry.
    pub fn apply(&self, publish: &Publish) -> RetainOutcome {
        if publish.payload.is_empty() {
            if self.clear(&publish.topic).is_some() {
                RetainOutcome::Cleared
            } else {
                RetainOutcome::Unchanged
            }
        } else {
            self.set(RetainedMessage::from_publish(publish));
            RetainOutcome::Stored
        }
    }

    /// Store a message, replacing the previous one for its topic
    pub fn set(&self, message: RetainedMessage) {
        trace!(topic = %message.topic, "storing retained message");
        self.inner.write().insert(Arc::new(message));
    }

    /// Remove the message for a topic
    pub fn clear(&self, topic: &str) -> Option<Arc<RetainedMessage>> {
        let removed = self.inner.write().remove(topic);
        if removed.is_some() {
            trace!(topic, "cleared retained message");
        }
        removed
    }

    pub fn get(&self, topic: &str) -> Option<Arc<RetainedMessage>> {
        self.inner.read().by_topic.get(topic).cloned()
    }

    /// Find the live retained messages whose topic matches a filter
    pub fn matches(&self, filter: &str) -> Vec<Arc<RetainedMessage>> {
        let now = Instant::now();
        let levels: SmallVec<[TopicLevel<'_>; 8]> = parse_levels(filter).collect();
        let inner = self.inner.read();
        let mut result = Vec::new();
        let mut push = |message: &Arc<RetainedMessage>| {
            if !message.is_expired(now) {
                result.push(message.clone());
            }
        };

        let mut worklist: SmallVec<[(&RetainedNode, usize); 16]> = smallvec![(&inner.root, 0)];
        while let Some((node, depth)) = worklist.pop() {
            let Some(level) = levels.get(depth) else {
                if let Some(message) = &node.message {
                    push(message);
                }
                continue;
            };

            match *level {
                TopicLevel::Normal(name) => {
                    if let Some(child) = node.children.get(name) {
                        worklist.push((child, depth + 1));
                    }
                }
                TopicLevel::SingleWildcard => {
                    for (name, child) in &node.children {
                        if depth == 0 && is_system_topic(name) {
                            continue;
                        }
                        worklist.push((child, depth + 1));
                    }
                }
                TopicLevel::MultiWildcard => {
                    // `#` also matches the parent level itself
                    if let Some(message) = &node.message {
                        push(message);
                    }
                    let mut subtree: Vec<&RetainedNode> = node
                        .children
                        .iter()
                        .filter(|(name, _)| !(depth == 0 && is_system_topic(name)))
                        .map(|(_, child)| child)
                        .collect();
                    while let Some(node) = subtree.pop() {
                        if let Some(message) = &node.message {
                            push(message);
                        }
                        subtree.extend(node.children.values());
                    }
                }
            }
        }

        result
    }

    /// Drop messages whose expiry interval has elapsed, returning how many
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let expired: Vec<Arc<str>> = inner
            .by_topic
            .values()
            .filter(|m| m.is_expired(now))
            .map(|m| m.topic.clone())
            .collect();
        for topic in &expired {
            inner.remove(topic);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_topic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
