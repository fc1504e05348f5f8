//! Rendezvous tables: channel trackers and the provider directory.
//!
//! Both are two-level bounded maps: an LRU of keys (channels or namespaces),
//! each holding a TTL-LRU of peers. Nothing here grows with network size.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::cache::TtlLru;
use crate::config::{MAX_ANNOUNCE_TTL, MAX_QUERY_WANT};
use crate::error::RejectReason;
use crate::identity::Identity;
use crate::messages::{ChannelKey, FeedbackEvent, PeerAddrs, TrackerRecord};

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerEntry {
    pub level: u16,
    /// Stored as announced; not used for gating.
    pub max_children: u16,
    pub free_slots: u16,
    pub bid_per_byte: f64,
    pub addrs: Vec<Vec<u8>>,
}

fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.min(MAX_ANNOUNCE_TTL)
}

fn clamp_want(want: u8) -> usize {
    want.min(MAX_QUERY_WANT) as usize
}

fn bounded(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).unwrap_or(NonZeroUsize::MIN)
}

#[derive(Debug)]
pub struct TrackerDirectory {
    channels: LruCache<ChannelKey, TtlLru<Identity, TrackerEntry>>,
    max_entries: usize,
}

impl TrackerDirectory {
    pub fn new(max_channels: usize, max_entries_per_channel: usize) -> Self {
        Self {
            channels: LruCache::new(bounded(max_channels)),
            max_entries: max_entries_per_channel.max(1),
        }
    }

    pub fn announce(&mut self, key: ChannelKey, peer: Identity, entry: TrackerEntry, ttl: Duration) {
        let ttl = clamp_ttl(ttl);
        if ttl.is_zero() {
            if let Some(table) = self.channels.get_mut(&key) {
                table.remove(&peer);
            }
            return;
        }
        let max_entries = self.max_entries;
        let table = self
            .channels
            .get_or_insert_mut(key, || TtlLru::new(max_entries, MAX_ANNOUNCE_TTL));
        table.insert_with_ttl(peer, entry, ttl);
    }

    /// Up to `want` live entries with free slots, best first; the top
    /// `2 × want` are shuffled before truncation to spread joiners.
    pub fn query<R: Rng>(
        &mut self,
        key: &ChannelKey,
        querier: &Identity,
        want: u8,
        rng: &mut R,
    ) -> Vec<TrackerRecord> {
        let want = clamp_want(want);
        let Some(table) = self.channels.get_mut(key) else {
            return Vec::new();
        };
        table.prune_expired();

        let mut records: Vec<TrackerRecord> = table
            .iter()
            .filter(|(peer, e)| *peer != querier && e.free_slots > 0)
            .map(|(peer, e)| TrackerRecord {
                peer: *peer,
                level: e.level,
                free_slots: e.free_slots,
                bid_per_byte: e.bid_per_byte,
                addrs: e.addrs.clone(),
            })
            .collect();
        records.sort_by(|a, b| {
            a.level
                .cmp(&b.level)
                .then_with(|| b.free_slots.cmp(&a.free_slots))
                .then_with(|| b.bid_per_byte.total_cmp(&a.bid_per_byte))
                .then_with(|| a.peer.cmp(&b.peer))
        });
        records.truncate(want.saturating_mul(2));
        records.shuffle(rng);
        records.truncate(want);
        records
    }

    pub fn feedback(&mut self, key: &ChannelKey, candidate: &Identity, event: FeedbackEvent) {
        let Some(table) = self.channels.get_mut(key) else {
            return;
        };
        match event {
            FeedbackEvent::Joined => {
                if let Some(entry) = table.get_mut(candidate) {
                    entry.free_slots = entry.free_slots.saturating_sub(1);
                }
            }
            FeedbackEvent::DialFailed
            | FeedbackEvent::JoinTimeout
            | FeedbackEvent::JoinReject(RejectReason::NotAttached) => {
                table.remove(candidate);
            }
            FeedbackEvent::JoinReject(RejectReason::NoCapacity)
            | FeedbackEvent::JoinReject(RejectReason::LowBid) => {
                if let Some(entry) = table.get_mut(candidate) {
                    entry.free_slots = 0;
                }
            }
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Live entries of a channel without touching recency.
    pub fn peers(&self, key: &ChannelKey) -> Vec<(Identity, TrackerEntry)> {
        self.channels
            .peek(key)
            .map(|t| t.iter().map(|(p, e)| (*p, e.clone())).collect())
            .unwrap_or_default()
    }

    pub fn prune(&mut self) {
        let mut empty = Vec::new();
        for (key, table) in self.channels.iter_mut() {
            table.prune_expired();
            if table.is_empty() {
                empty.push(*key);
            }
        }
        for key in empty {
            self.channels.pop(&key);
        }
    }
}

#[derive(Debug)]
pub struct ProviderDirectory {
    namespaces: LruCache<ChannelKey, TtlLru<Identity, Vec<Vec<u8>>>>,
    max_entries: usize,
}

impl ProviderDirectory {
    pub fn new(max_namespaces: usize, max_entries: usize) -> Self {
        Self {
            namespaces: LruCache::new(bounded(max_namespaces)),
            max_entries: max_entries.max(1),
        }
    }

    pub fn announce(&mut self, key: ChannelKey, peer: Identity, addrs: Vec<Vec<u8>>, ttl: Duration) {
        let ttl = clamp_ttl(ttl);
        if ttl.is_zero() {
            if let Some(table) = self.namespaces.get_mut(&key) {
                table.remove(&peer);
            }
            return;
        }
        let max_entries = self.max_entries;
        self.namespaces
            .get_or_insert_mut(key, || TtlLru::new(max_entries, MAX_ANNOUNCE_TTL))
            .insert_with_ttl(peer, addrs, ttl);
    }

    pub fn query<R: Rng>(&mut self, key: &ChannelKey, querier: &Identity, want: u8, rng: &mut R) -> Vec<PeerAddrs> {
        let want = clamp_want(want);
        let Some(table) = self.namespaces.get_mut(key) else {
            return Vec::new();
        };
        table.prune_expired();
        let mut entries: Vec<PeerAddrs> = table
            .iter()
            .filter(|(peer, _)| *peer != querier)
            .map(|(peer, addrs)| PeerAddrs { peer: *peer, addrs: addrs.clone() })
            .collect();
        entries.shuffle(rng);
        entries.truncate(want);
        entries
    }

    pub fn namespace_count(&self) -> usize {
        self.namespaces.len()
    }

    pub fn prune(&mut self) {
        let mut empty = Vec::new();
        for (key, table) in self.namespaces.iter_mut() {
            table.prune_expired();
            if table.is_empty() {
                empty.push(*key);
            }
        }
        for key in empty {
            self.namespaces.pop(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn id(n: u8) -> Identity {
        Identity::from_bytes([n; 32])
    }

    fn key(n: u8) -> ChannelKey {
        [n; 32]
    }

    fn entry(level: u16, free_slots: u16) -> TrackerEntry {
        TrackerEntry { level, max_children: 8, free_slots, bid_per_byte: 0.0, addrs: vec![] }
    }

    fn entry_of(dir: &TrackerDirectory, channel: u8, peer: u8) -> Option<TrackerEntry> {
        dir.peers(&key(channel)).into_iter().find(|(p, _)| *p == id(peer)).map(|(_, e)| e)
    }

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn query_excludes_querier_full_and_expired() {
        let mut dir = TrackerDirectory::new(4, 8);
        let mut rng = StdRng::seed_from_u64(1);
        dir.announce(key(1), id(1), entry(1, 2), TTL);
        dir.announce(key(1), id(2), entry(1, 0), TTL);
        dir.announce(key(1), id(3), entry(2, 1), Duration::from_secs(1));
        dir.announce(key(1), id(4), entry(0, 3), TTL);

        tokio::time::advance(Duration::from_secs(2)).await;

        let mut peers: Vec<Identity> = dir.query(&key(1), &id(4), 10, &mut rng).iter().map(|r| r.peer).collect();
        peers.sort();
        assert_eq!(peers, vec![id(1)]);
        assert!(dir.query(&key(9), &id(4), 10, &mut rng).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn query_draws_from_top_two_times_want() {
        let mut dir = TrackerDirectory::new(4, 64);
        for n in 1..=20u8 {
            dir.announce(key(1), id(n), entry(n as u16, 1), TTL);
        }
        for seed in 0..10 {
            let mut rng = StdRng::seed_from_u64(seed);
            let result = dir.query(&key(1), &id(99), 3, &mut rng);
            assert_eq!(result.len(), 3);
            assert!(result.iter().all(|r| r.level <= 6));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_and_want_are_capped() {
        let mut dir = TrackerDirectory::new(4, 64);
        let mut rng = StdRng::seed_from_u64(5);
        dir.announce(key(1), id(1), entry(1, 1), Duration::from_secs(3600));
        for n in 2..60u8 {
            dir.announce(key(1), id(n), entry(1, 1), TTL);
        }
        assert_eq!(dir.query(&key(1), &id(0), 255, &mut rng).len(), MAX_QUERY_WANT as usize);

        tokio::time::advance(MAX_ANNOUNCE_TTL + Duration::from_secs(1)).await;
        assert!(dir.query(&key(1), &id(0), 8, &mut rng).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn feedback_adjusts_entries() {
        let mut dir = TrackerDirectory::new(4, 8);
        dir.announce(key(1), id(1), entry(1, 2), TTL);
        dir.announce(key(1), id(2), entry(1, 2), TTL);
        dir.announce(key(1), id(3), entry(1, 2), TTL);

        dir.feedback(&key(1), &id(1), FeedbackEvent::Joined);
        assert_eq!(entry_of(&dir, 1, 1).map(|e| e.free_slots), Some(1));

        dir.feedback(&key(1), &id(2), FeedbackEvent::JoinReject(RejectReason::LowBid));
        assert_eq!(entry_of(&dir, 1, 2).map(|e| e.free_slots), Some(0));

        dir.feedback(&key(1), &id(3), FeedbackEvent::DialFailed);
        assert!(entry_of(&dir, 1, 3).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_tables_are_bounded() {
        let mut dir = TrackerDirectory::new(3, 4);
        for c in 0..5u8 {
            for n in 0..10u8 {
                dir.announce(key(c), id(n), entry(1, 1), TTL);
            }
        }
        assert_eq!(dir.channel_count(), 3);
        assert_eq!(dir.peers(&key(4)).len(), 4);
        assert!(dir.peers(&key(0)).is_empty());
        // Oldest announcers were pushed out first.
        assert!(entry_of(&dir, 4, 0).is_none());
        assert!(entry_of(&dir, 4, 9).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn provider_directory_bounded_and_shuffled() {
        let mut dir = ProviderDirectory::new(2, 3);
        let mut rng = StdRng::seed_from_u64(9);
        for n in 0..5u8 {
            dir.announce(key(1), id(n), vec![vec![n]], TTL);
        }
        dir.announce(key(2), id(0), vec![], TTL);
        dir.announce(key(3), id(0), vec![], TTL);

        assert_eq!(dir.namespace_count(), 2);
        assert!(dir.query(&key(1), &id(99), 8, &mut rng).is_empty());
        assert_eq!(dir.query(&key(3), &id(99), 8, &mut rng).len(), 1);

        for n in 0..3u8 {
            dir.announce(key(3), id(10 + n), vec![], TTL);
        }
        let got = dir.query(&key(3), &id(10), 8, &mut rng);
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|p| p.peer != id(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_empty_channels() {
        let mut dir = TrackerDirectory::new(4, 4);
        dir.announce(key(1), id(1), entry(1, 1), Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        dir.prune();
        assert_eq!(dir.channel_count(), 0);
    }
}
