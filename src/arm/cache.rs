//! Bounded map with time-to-live and least-recently-used eviction.
//!
//! Entries live in an arena (`Vec<Option<Node>>` plus a free list). A
//! `HashMap` maps keys to arena slots and an intrusive doubly linked list
//! keeps the slots in recency order, head = most recently used.
//!
//! Expiry is checked lazily on every lookup, so an expired entry is never
//! returned even if [`ExpiringCache::evict_expired`] was not called yet.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use crate::core::millis;

/// When the TTL of an entry starts counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// TTL counts from the last insert.
    AfterWrite,
    /// TTL counts from the last insert or lookup.
    AfterAccess,
}

#[derive(Debug)]
struct Node<K, V> {
    key: K,
    value: V,
    touched_at: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Map bounded by size and age.
#[derive(Debug)]
pub struct ExpiringCache<K, V> {
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    policy: ExpiryPolicy,
    ttl: Option<u64>,
    max_size: usize,
}

impl<K: Eq + Hash + Clone, V> ExpiringCache<K, V> {
    /// Create a cache. `ttl = None` disables expiry, `max_size = 0` disables
    /// the size bound.
    pub fn new(policy: ExpiryPolicy, ttl: Option<Duration>, max_size: usize) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            policy,
            ttl: ttl.map(millis),
            max_size,
        }
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Insert or replace `key`, returning the previous value.
    ///
    /// Evicts the least recently used entry when the size bound is exceeded.
    pub fn insert(&mut self, key: K, value: V, now: u64) -> Option<V> {
        self.put(key, value, now).0
    }

    /// Like [`ExpiringCache::insert`], but hands back the entry evicted to
    /// respect the size bound.
    pub fn insert_evicting(&mut self, key: K, value: V, now: u64) -> Option<(K, V)> {
        self.put(key, value, now).1
    }

    /// Look up `key`, refreshing its recency.
    pub fn get(&mut self, key: &K, now: u64) -> Option<&V> {
        let slot = self.live_slot(key, now)?;
        self.node(slot).map(|node| &node.value)
    }

    /// Look up `key` mutably, refreshing its recency.
    pub fn get_mut(&mut self, key: &K, now: u64) -> Option<&mut V> {
        let slot = self.live_slot(key, now)?;
        self.node_mut(slot).map(|node| &mut node.value)
    }

    /// Look up `key` without touching recency or access time.
    pub fn peek(&self, key: &K, now: u64) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.node(slot)
            .filter(|node| !self.is_expired(node, now))
            .map(|node| &node.value)
    }

    /// Whether a live entry for `key` exists.
    pub fn contains_key(&self, key: &K, now: u64) -> bool {
        self.peek(key, now).is_some()
    }

    /// Remove `key`.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = *self.index.get(key)?;
        self.remove_slot(slot).map(|(_, value)| value)
    }

    /// Drop all expired entries, returning how many were removed.
    pub fn evict_expired(&mut self, now: u64) -> usize {
        self.take_expired(now).len()
    }

    /// Remove and return all expired entries.
    pub fn take_expired(&mut self, now: u64) -> Vec<(K, V)> {
        let expired: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(slot, node)| {
                node.as_ref()
                    .filter(|node| self.is_expired(node, now))
                    .map(|_| slot)
            })
            .collect();

        expired
            .into_iter()
            .filter_map(|slot| self.remove_slot(slot))
            .collect()
    }

    /// Iterate over live entries, most recently used first.
    pub fn iter(&self, now: u64) -> impl Iterator<Item = (&K, &V)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            loop {
                let node = self.node(cursor?)?;
                cursor = node.next;
                if !self.is_expired(node, now) {
                    return Some((&node.key, &node.value));
                }
            }
        })
    }

    /// Keys of live entries, most recently used first.
    pub fn keys(&self, now: u64) -> Vec<K> {
        self.iter(now).map(|(key, _)| key.clone()).collect()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    fn put(&mut self, key: K, value: V, now: u64) -> (Option<V>, Option<(K, V)>) {
        if let Some(&slot) = self.index.get(&key) {
            self.touch(slot, now);
            let previous = self
                .node_mut(slot)
                .map(|node| std::mem::replace(&mut node.value, value));
            return (previous, None);
        }

        let node = Node {
            key: key.clone(),
            value,
            touched_at: now,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.push_front(slot);

        if self.max_size > 0 && self.index.len() > self.max_size {
            let evicted = self.tail.and_then(|lru| self.remove_slot(lru));
            return (None, evicted);
        }
        (None, None)
    }

    fn is_expired(&self, node: &Node<K, V>, now: u64) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_sub(node.touched_at) >= ttl)
    }

    /// Slot of a live entry. Expired entries are removed on the way.
    fn live_slot(&mut self, key: &K, now: u64) -> Option<usize> {
        let slot = *self.index.get(key)?;
        let expired = self.node(slot).is_some_and(|node| self.is_expired(node, now));
        if expired {
            self.remove_slot(slot);
            return None;
        }

        self.unlink(slot);
        self.push_front(slot);
        if self.policy == ExpiryPolicy::AfterAccess {
            if let Some(node) = self.node_mut(slot) {
                node.touched_at = now;
            }
        }
        Some(slot)
    }

    fn touch(&mut self, slot: usize, now: u64) {
        self.unlink(slot);
        self.push_front(slot);
        if let Some(node) = self.node_mut(slot) {
            node.touched_at = now;
        }
    }

    fn node(&self, slot: usize) -> Option<&Node<K, V>> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node<K, V>> {
        self.nodes.get_mut(slot).and_then(Option::as_mut)
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(head) = old_head.and_then(|h| self.node_mut(h)) {
            head.prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn unlink(&mut self, slot: usize) {
        let Some((prev, next)) = self.node(slot).map(|n| (n.prev, n.next)) else {
            return;
        };

        match prev.and_then(|p| self.node_mut(p)) {
            Some(prev_node) => prev_node.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.node_mut(n)) {
            Some(next_node) => next_node.prev = prev,
            None => self.tail = prev,
        }
        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = None;
        }
    }

    fn remove_slot(&mut self, slot: usize) -> Option<(K, V)> {
        self.unlink(slot);
        let node = self.nodes.get_mut(slot)?.take()?;
        self.index.remove(&node.key);
        self.free.push(slot);
        Some((node.key, node.value))
    }
}
