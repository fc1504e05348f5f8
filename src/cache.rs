//! Bounded caches.
//!
//! - [`TtlLru`]: `lru::LruCache` whose entries also expire after a TTL
//! - [`SeqRing`]: fixed-size ring of recent data messages keyed by sequence

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

fn cap(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).unwrap_or(NonZeroUsize::MIN)
}

/// LRU map with a hard capacity and per-entry expiry.
#[derive(Debug)]
pub struct TtlLru<K: Hash + Eq, V> {
    inner: LruCache<K, (V, Instant)>,
    ttl: Duration,
}

impl<K: Hash + Eq + Clone, V> TtlLru<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: LruCache::new(cap(capacity)),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Insert with the default TTL. Returns the least recently used entry
    /// when the cap forced it out.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let ttl = self.ttl;
        self.insert_with_ttl(key, value, ttl)
    }

    pub fn insert_with_ttl(&mut self, key: K, value: V, ttl: Duration) -> Option<(K, V)> {
        let expires_at = Instant::now() + ttl;
        match self.inner.push(key.clone(), (value, expires_at)) {
            Some((old_key, (old_value, _))) if old_key != key => Some((old_key, old_value)),
            _ => None,
        }
    }

    fn expired(&self, key: &K) -> Option<bool> {
        self.inner.peek(key).map(|(_, exp)| *exp <= Instant::now())
    }

    /// Touches the entry. Expired entries are removed and reported absent.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.expired(key)? {
            self.inner.pop(key);
            return None;
        }
        self.inner.get(key).map(|(v, _)| v)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.expired(key)? {
            self.inner.pop(key);
            return None;
        }
        self.inner.get_mut(key).map(|(v, _)| v)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key).map(|(v, _)| v)
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn prune_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<K> = self
            .inner
            .iter()
            .filter(|(_, (_, exp))| *exp <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.inner.pop(key);
        }
        expired.len()
    }

    /// Unexpired entries, most recently used first.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let now = Instant::now();
        self.inner
            .iter()
            .filter(move |(_, (_, exp))| *exp > now)
            .map(|(k, (v, _))| (k, v))
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    pub seq: u32,
    pub origin_ts: u64,
    pub payload: Vec<u8>,
}

/// Ring buffer of the last `window` sequences seen on a channel.
///
/// Slot `seq % window` holds the message; lookups compare the stored
/// sequence so a stale slot never answers for a newer sequence.
#[derive(Debug)]
pub struct SeqRing {
    slots: Vec<Option<CachedMessage>>,
    highest: Option<u32>,
    lowest: Option<u32>,
}

impl SeqRing {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            slots: vec![None; window],
            highest: None,
            lowest: None,
        }
    }

    fn slot(&self, seq: u32) -> usize {
        seq as usize % self.slots.len()
    }

    fn in_window(&self, seq: u32) -> bool {
        match self.highest {
            Some(h) => seq <= h && (h - seq) < self.slots.len() as u32,
            None => false,
        }
    }

    pub fn insert(&mut self, seq: u32, origin_ts: u64, payload: Vec<u8>) {
        if let Some(h) = self.highest {
            if seq < h && !self.in_window(seq) {
                return;
            }
        }
        let idx = self.slot(seq);
        self.slots[idx] = Some(CachedMessage { seq, origin_ts, payload });
        self.highest = Some(self.highest.map_or(seq, |h| h.max(seq)));
        self.lowest = Some(self.lowest.map_or(seq, |l| l.min(seq)));
    }

    pub fn get(&self, seq: u32) -> Option<&CachedMessage> {
        if !self.in_window(seq) {
            return None;
        }
        self.slots[self.slot(seq)].as_ref().filter(|m| m.seq == seq)
    }

    /// `[from, to_exclusive)` of sequences this ring may answer for.
    pub fn range(&self) -> Option<(u32, u32)> {
        let highest = self.highest?;
        let lowest = self.lowest.unwrap_or(highest);
        let window_start = highest.saturating_sub(self.slots.len() as u32 - 1);
        Some((lowest.max(window_start), highest.saturating_add(1)))
    }
}
