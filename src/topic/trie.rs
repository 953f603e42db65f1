//! Topic Trie for efficient subscription matching
//!
//! A trie (prefix tree) keyed by topic level. Each node has a table of
//! literal children, an optional `+` child and a list of entries whose
//! filter ends in `#` right below it. Every inserted filter gets its own
//! entry id, so one filter string can be held by many subscribers and
//! removed one at a time through the returned [`FilterHandle`].
//!
//! Lookup walks an explicit worklist of `(node, depth)` pairs instead of
//! recursing, following the literal child and the `+` child side by side.
//! A node is reached by at most one path for a given topic, so every entry
//! is reported at most once per lookup.

use std::ops::ControlFlow;
use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::{smallvec, SmallVec};

use super::validation::{is_system_topic, parse_levels, TopicLevel};

type EntryId = u64;

/// Handle to one inserted filter entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterHandle {
    id: EntryId,
    filter: Arc<str>,
}

impl FilterHandle {
    /// The filter this entry was inserted under
    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub(crate) fn filter_arc(&self) -> &Arc<str> {
        &self.filter
    }
}

/// Node in the topic trie
#[derive(Debug)]
struct TrieNode<V> {
    /// Children indexed by topic level (CompactString avoids heap allocation for short strings)
    children: AHashMap<CompactString, TrieNode<V>>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Entries whose filter ends exactly at this node
    values: SmallVec<[(EntryId, V); 1]>,
    /// Entries whose filter continues with a trailing `#` from this node
    multi_wildcard: SmallVec<[(EntryId, V); 1]>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            children: AHashMap::new(),
            single_wildcard: None,
            values: SmallVec::new(),
            multi_wildcard: SmallVec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.children.is_empty()
            && self.single_wildcard.is_none()
            && self.values.is_empty()
            && self.multi_wildcard.is_empty()
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Topic Trie for efficient subscription matching
///
/// Filters are expected to be validated before insertion.
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
    next_id: EntryId,
    len: usize,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
            next_id: 1,
            len: 0,
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value under a topic filter and return its handle
    pub fn insert(&mut self, filter: &str, value: V) -> FilterHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.len += 1;

        let mut node = &mut self.root;
        for level in parse_levels(filter) {
            match level {
                TopicLevel::MultiWildcard => {
                    node.multi_wildcard.push((id, value));
                    return FilterHandle {
                        id,
                        filter: Arc::from(filter),
                    };
                }
                TopicLevel::SingleWildcard => {
                    node = node
                        .single_wildcard
                        .get_or_insert_with(|| Box::new(TrieNode::new()));
                }
                TopicLevel::Normal(level) => {
                    node = node.children.entry(CompactString::new(level)).or_default();
                }
            }
        }

        node.values.push((id, value));
        FilterHandle {
            id,
            filter: Arc::from(filter),
        }
    }

    /// Get the value of an entry
    pub fn get(&self, handle: &FilterHandle) -> Option<&V> {
        let mut node = &self.root;
        for level in parse_levels(&handle.filter) {
            match level {
                TopicLevel::MultiWildcard => return find_entry(&node.multi_wildcard, handle.id),
                TopicLevel::SingleWildcard => node = node.single_wildcard.as_deref()?,
                TopicLevel::Normal(level) => node = node.children.get(level)?,
            }
        }
        find_entry(&node.values, handle.id)
    }

    /// Get a mutable reference to the value of an entry
    pub fn get_mut(&mut self, handle: &FilterHandle) -> Option<&mut V> {
        let mut node = &mut self.root;
        for level in parse_levels(&handle.filter) {
            match level {
                TopicLevel::MultiWildcard => {
                    return node
                        .multi_wildcard
                        .iter_mut()
                        .find(|(id, _)| *id == handle.id)
                        .map(|(_, v)| v)
                }
                TopicLevel::SingleWildcard => node = node.single_wildcard.as_deref_mut()?,
                TopicLevel::Normal(level) => node = node.children.get_mut(level)?,
            }
        }
        node.values
            .iter_mut()
            .find(|(id, _)| *id == handle.id)
            .map(|(_, v)| v)
    }

    /// Remove an entry, pruning nodes left empty
    pub fn remove(&mut self, handle: &FilterHandle) -> Option<V> {
        let levels: SmallVec<[TopicLevel<'_>; 8]> = parse_levels(&handle.filter).collect();
        let removed = Self::remove_at(&mut self.root, &levels, handle.id);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn remove_at(node: &mut TrieNode<V>, levels: &[TopicLevel<'_>], id: EntryId) -> Option<V> {
        let Some((level, rest)) = levels.split_first() else {
            return take_entry(&mut node.values, id);
        };

        match *level {
            TopicLevel::MultiWildcard => take_entry(&mut node.multi_wildcard, id),
            TopicLevel::SingleWildcard => {
                let child = node.single_wildcard.as_deref_mut()?;
                let removed = Self::remove_at(child, rest, id);
                if child.is_empty() {
                    node.single_wildcard = None;
                }
                removed
            }
            TopicLevel::Normal(name) => {
                let child = node.children.get_mut(name)?;
                let removed = Self::remove_at(child, rest, id);
                if child.is_empty() {
                    node.children.remove(name);
                }
                removed
            }
        }
    }

    /// Find all entries whose filter matches a topic name
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let _ = self.try_matches(topic, |v| {
            callback(v);
            ControlFlow::<()>::Continue(())
        });
    }

    /// Find matching entries, stopping as soon as the callback breaks
    pub fn try_matches<B, F>(&self, topic: &str, mut callback: F) -> ControlFlow<B>
    where
        F: FnMut(&V) -> ControlFlow<B>,
    {
        // $-topics don't match filters starting with + or #
        let is_system = is_system_topic(topic);
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        let mut worklist: SmallVec<[(&TrieNode<V>, usize); 16]> = smallvec![(&self.root, 0)];

        while let Some((node, depth)) = worklist.pop() {
            let wildcards_allowed = !(is_system && depth == 0);

            if wildcards_allowed {
                for (_, v) in &node.multi_wildcard {
                    callback(v)?;
                }
            }

            if depth == levels.len() {
                for (_, v) in &node.values {
                    callback(v)?;
                }
                continue;
            }

            if let Some(child) = node.children.get(levels[depth]) {
                worklist.push((child, depth + 1));
            }
            if wildcards_allowed {
                if let Some(child) = node.single_wildcard.as_deref() {
                    worklist.push((child, depth + 1));
                }
            }
        }

        ControlFlow::Continue(())
    }

    /// Visit every entry
    pub fn for_each<F>(&self, mut callback: F)
    where
        F: FnMut(&V),
    {
        let mut worklist: Vec<&TrieNode<V>> = vec![&self.root];
        while let Some(node) = worklist.pop() {
            node.values.iter().for_each(|(_, v)| callback(v));
            node.multi_wildcard.iter().for_each(|(_, v)| callback(v));
            worklist.extend(node.children.values());
            worklist.extend(node.single_wildcard.as_deref());
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

fn find_entry<V>(entries: &[(EntryId, V)], id: EntryId) -> Option<&V> {
    entries.iter().find(|(e, _)| *e == id).map(|(_, v)| v)
}

fn take_entry<V>(entries: &mut SmallVec<[(EntryId, V); 1]>, id: EntryId) -> Option<V> {
    let pos = entries.iter().position(|(e, _)| *e == id)?;
    Some(entries.remove(pos).1)
}
