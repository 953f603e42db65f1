//! Topic matching and subscription management
//!
//! Implements topic name/filter validation, a topic trie for efficient
//! subscription matching, and the subscription registry built on it.
//!
//! Performance notes:
//! - Matching is callback based and never allocates per filter
//! - Results use SmallVec (most topics have few subscribers)
//! - A per-client index makes `unsubscribe_all` proportional to the
//!   client's own subscriptions, not to the size of the trie

mod trie;
pub mod validation;

pub use trie::{FilterHandle, TopicTrie};
pub use validation::{
    is_system_topic, parse_levels, topic_matches_filter, validate_topic_filter,
    validate_topic_filter_with_max_levels, validate_topic_name,
    validate_topic_name_with_max_levels, TopicLevel,
};

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::{ProtocolError, SubscriptionOptions};

/// A subscriber entry stored in the trie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    /// Client ID
    pub client_id: Arc<str>,
    /// Subscription options
    pub options: SubscriptionOptions,
    /// Subscription identifier (v5.0)
    pub subscription_id: Option<u32>,
}

/// One subscription held by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSubscription {
    pub filter: Arc<str>,
    pub options: SubscriptionOptions,
    pub subscription_id: Option<u32>,
}

#[derive(Default)]
struct Inner {
    trie: TopicTrie<Subscriber>,
    /// client id -> filter -> trie entry
    by_client: AHashMap<Arc<str>, AHashMap<Arc<str>, FilterHandle>>,
}

/// Thread-safe subscription registry
///
/// SUBSCRIBE/UNSUBSCRIBE take the write lock; routing lookups share the
/// read lock, so a lookup never sees a half-inserted filter.
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
    max_topic_levels: usize,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::with_max_topic_levels(0)
    }

    /// Registry that rejects filters deeper than `max_topic_levels` (0 = unlimited)
    pub fn with_max_topic_levels(max_topic_levels: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_topic_levels,
        }
    }

    /// Add or replace a subscription
    ///
    /// Returns the options that were replaced when the client already held
    /// a subscription on the same filter string. A malformed filter is
    /// rejected before anything is inserted.
    pub fn subscribe(
        &self,
        client_id: &str,
        filter: &str,
        options: SubscriptionOptions,
        subscription_id: Option<u32>,
    ) -> Result<Option<SubscriptionOptions>, ProtocolError> {
        validate_topic_filter_with_max_levels(filter, self.max_topic_levels)?;

        let mut inner = self.inner.write();
        let Inner { trie, by_client } = &mut *inner;

        if let Some(handle) = by_client.get(client_id).and_then(|f| f.get(filter)) {
            if let Some(existing) = trie.get_mut(handle) {
                let replaced = existing.options;
                existing.options = options;
                existing.subscription_id = subscription_id;
                return Ok(Some(replaced));
            }
        }

        let client_id: Arc<str> = match by_client.get_key_value(client_id) {
            Some((key, _)) => key.clone(),
            None => Arc::from(client_id),
        };
        let handle = trie.insert(
            filter,
            Subscriber {
                client_id: client_id.clone(),
                options,
                subscription_id,
            },
        );
        by_client
            .entry(client_id)
            .or_default()
            .insert(handle.filter_arc().clone(), handle);
        Ok(None)
    }

    /// Remove a subscription, returning whether it existed
    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        let mut inner = self.inner.write();
        let Inner { trie, by_client } = &mut *inner;

        let Some(filters) = by_client.get_mut(client_id) else {
            return false;
        };
        let Some(handle) = filters.remove(filter) else {
            return false;
        };
        if filters.is_empty() {
            by_client.remove(client_id);
        }
        trie.remove(&handle).is_some()
    }

    /// Remove all subscriptions for a client, returning how many were removed
    pub fn unsubscribe_all(&self, client_id: &str) -> usize {
        let mut inner = self.inner.write();
        let Inner { trie, by_client } = &mut *inner;

        let Some(filters) = by_client.remove(client_id) else {
            return 0;
        };
        filters
            .values()
            .filter(|handle| trie.remove(handle).is_some())
            .count()
    }

    /// Find all subscribers whose filter matches a topic name
    ///
    /// A client holding several matching filters appears once per filter.
    pub fn subscribers_for(&self, topic: &str) -> SmallVec<[Subscriber; 16]> {
        let inner = self.inner.read();
        let mut result = SmallVec::new();
        inner.trie.matches(topic, |sub| result.push(sub.clone()));
        result
    }

    /// Find matching subscribers using a callback to avoid allocation
    pub fn for_each_subscriber<F>(&self, topic: &str, callback: F)
    where
        F: FnMut(&Subscriber),
    {
        self.inner.read().trie.matches(topic, callback);
    }

    /// Subscriptions currently held by a client
    pub fn subscriptions_of(&self, client_id: &str) -> Vec<ClientSubscription> {
        let inner = self.inner.read();
        let Some(filters) = inner.by_client.get(client_id) else {
            return Vec::new();
        };
        filters
            .iter()
            .filter_map(|(filter, handle)| {
                inner.trie.get(handle).map(|sub| ClientSubscription {
                    filter: filter.clone(),
                    options: sub.options,
                    subscription_id: sub.subscription_id,
                })
            })
            .collect()
    }

    /// Whether a client holds a subscription on exactly this filter
    pub fn has_subscription(&self, client_id: &str, filter: &str) -> bool {
        self.inner
            .read()
            .by_client
            .get(client_id)
            .is_some_and(|f| f.contains_key(filter))
    }

    /// Total number of subscriptions
    pub fn len(&self) -> usize {
        self.inner.read().trie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
