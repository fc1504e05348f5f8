//! Per-channel state owned by the node actor.
//!
//! A channel is a `(topic, root)` pair. Its 32-byte key namespaces every
//! control frame; the last 24 bytes of the key ride inside data message ids so
//! data frames stay compact.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::{SeqRing, TtlLru};
use crate::config::{ChannelOptions, JoinOptions, Role};
use crate::error::{FanoutError, FanoutResult, RejectReason};
use crate::forwarder::{effective_max_children, OverloadState};
use crate::identity::Identity;
use crate::messages::{ChannelKey, MessageKind, PeerAddrs, KEY_SUFFIX_LEN};
use crate::ratelimit::TokenBucket;
use crate::repair::{GapTracker, NeighborHave};
use crate::route::RouteToken;

/// Level of a node that has no rooted path.
pub const DETACHED_LEVEL: u16 = u16::MAX;

pub const MAX_TOPIC_LENGTH: usize = 255;

/// Bound on cooldown and have-by-peer maps.
pub const MAX_COOLDOWNS: usize = 256;
pub const MAX_HAVE_BY_PEER: usize = 64;

pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LENGTH
        && !topic.chars().any(|c| c.is_control())
}

/// `blake3(len(topic) ‖ topic ‖ root)`.
pub fn channel_key(topic: &str, root: &Identity) -> ChannelKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(topic.len() as u16).to_be_bytes());
    hasher.update(topic.as_bytes());
    hasher.update(root.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Key under which providers of `namespace` are stored.
pub fn namespace_key(namespace: &str) -> ChannelKey {
    *blake3::hash(namespace.as_bytes()).as_bytes()
}

pub fn key_suffix(key: &ChannelKey) -> [u8; KEY_SUFFIX_LEN] {
    let mut suffix = [0u8; KEY_SUFFIX_LEN];
    suffix.copy_from_slice(&key[32 - KEY_SUFFIX_LEN..]);
    suffix
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub topic: String,
    pub root: Identity,
    pub key: ChannelKey,
    pub suffix: [u8; KEY_SUFFIX_LEN],
}

impl ChannelId {
    pub fn new(topic: &str, root: Identity) -> FanoutResult<Self> {
        if !is_valid_topic(topic) {
            return Err(FanoutError::InvalidTopic);
        }
        let key = channel_key(topic, &root);
        Ok(Self {
            topic: topic.to_string(),
            root,
            key,
            suffix: key_suffix(&key),
        })
    }

    pub fn key_hex(&self) -> String {
        hex::encode(&self.key[..8])
    }
}

#[derive(Debug)]
pub struct ChildInfo {
    pub bid_per_byte: f64,
    pub addrs: Vec<Vec<u8>>,
    pub joined_at: Instant,
    pub starved_streak: u32,
    pub write_fail_streak: u32,
    pub proxy_ingress: TokenBucket,
    pub unicast_ingress: TokenBucket,
}

impl ChildInfo {
    pub fn new(bid_per_byte: f64, addrs: Vec<Vec<u8>>, opts: &ChannelOptions) -> Self {
        Self {
            bid_per_byte,
            addrs,
            joined_at: Instant::now(),
            starved_streak: 0,
            write_fail_streak: 0,
            proxy_ingress: TokenBucket::messages(opts.proxy_publish_rate, opts.proxy_publish_burst),
            unicast_ingress: TokenBucket::messages(opts.unicast_rate, opts.unicast_burst),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct KindCounter {
    pub count: u64,
    pub bytes: u64,
}

/// Monotonic per-channel counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelMetrics {
    pub sent: BTreeMap<MessageKind, KindCounter>,
    pub received: BTreeMap<MessageKind, KindCounter>,
    pub delivered: u64,
    pub dropped_duplicate: u64,
    pub dropped_stale: u64,
    pub dropped_upload: u64,
    pub dropped_rate_limited: u64,
    pub dropped_unexpected_sender: u64,
    pub write_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub route_cache_hits: u64,
    pub route_cache_misses: u64,
    pub evictions_outbid: u64,
    pub evictions_overload: u64,
    pub evictions_write_failure: u64,
    pub repair_requests_sent: u64,
    pub fetch_requests_sent: u64,
    pub repaired: u64,
    pub joins_accepted: u64,
    pub joins_rejected: u64,
}

impl ChannelMetrics {
    pub fn record_sent(&mut self, kind: MessageKind, bytes: usize) {
        let c = self.sent.entry(kind).or_default();
        c.count += 1;
        c.bytes += bytes as u64;
    }

    pub fn record_received(&mut self, kind: MessageKind, bytes: usize) {
        let c = self.received.entry(kind).or_default();
        c.count += 1;
        c.bytes += bytes as u64;
    }

    pub fn sent_count(&self, kind: MessageKind) -> u64 {
        self.sent.get(&kind).map_or(0, |c| c.count)
    }

    pub fn received_count(&self, kind: MessageKind) -> u64 {
        self.received.get(&kind).map_or(0, |c| c.count)
    }
}

/// Point-in-time view of a channel for callers.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub topic: String,
    pub root: Identity,
    pub role: Role,
    pub level: u16,
    pub attached: bool,
    pub parent: Option<Identity>,
    pub children: Vec<Identity>,
    pub route_from_root: Option<Vec<Identity>>,
    pub effective_max_children: usize,
    pub next_seq: u32,
    pub next_expected_seq: Option<u32>,
    pub missing: usize,
    pub end_seq_exclusive: Option<u32>,
    pub lazy_peers: Vec<Identity>,
    pub cached_range: Option<(u32, u32)>,
    pub cached_routes: usize,
}

/// Outcome of one join attempt, reported to the join loop.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Accepted,
    Rejected(RejectReason, Vec<PeerAddrs>),
    DialFailed,
    TimedOut,
    /// Not attempted: ourselves, a child, or in cooldown.
    Skipped,
}

#[derive(Debug)]
pub struct PendingJoin {
    pub peer: Identity,
    pub tracker: Option<Identity>,
    pub deadline: Instant,
    pub reply: oneshot::Sender<FanoutResult<AttemptOutcome>>,
}

pub type RouteReply = oneshot::Sender<FanoutResult<RouteToken>>;

/// Who is waiting on a scattered `ROUTE_QUERY`.
#[derive(Debug)]
pub enum RouteRequester {
    Local(RouteReply),
    /// A parent asked; answer with its request id.
    Parent { peer: Identity, req_id: u32 },
    /// A child asked us while we are the root; answer with its request id.
    Child { peer: Identity, req_id: u32 },
}

#[derive(Debug)]
pub struct PendingRouteFanout {
    pub target: Identity,
    pub requester: RouteRequester,
    pub outstanding: HashSet<Identity>,
    pub deadline: Instant,
}

#[derive(Debug)]
pub struct PendingRouteQuery {
    pub target: Identity,
    pub deadline: Instant,
    pub reply: RouteReply,
}

/// Relayed query from a child; the reply goes back under the child's id.
#[derive(Debug, Clone, Copy)]
pub struct RouteProxy {
    pub child: Identity,
    pub child_req_id: u32,
    pub target: Identity,
    pub deadline: Instant,
}

#[derive(Debug)]
pub struct PendingAck {
    pub deadline: Instant,
    pub reply: oneshot::Sender<FanoutResult<()>>,
}

#[derive(Debug)]
pub struct AttachWaiter {
    pub payload: Vec<u8>,
    pub deadline: Instant,
    pub reply: oneshot::Sender<FanoutResult<Option<u32>>>,
}

#[derive(Debug)]
pub struct ChannelState {
    pub id: ChannelId,
    pub options: ChannelOptions,
    pub join_options: Option<JoinOptions>,
    pub level: u16,
    pub parent: Option<Identity>,
    pub children: HashMap<Identity, ChildInfo>,
    pub route_from_root: Option<Vec<Identity>>,
    pub route_by_peer: TtlLru<Identity, Vec<Identity>>,
    pub seq: u32,
    pub cache: SeqRing,
    pub gaps: GapTracker,
    pub have_by_peer: LruCache<Identity, NeighborHave>,
    pub upload: Option<TokenBucket>,
    pub neighbor_egress: Option<TokenBucket>,
    pub lazy_peers: HashSet<Identity>,
    pub peer_hints: TtlLru<Identity, ()>,
    pub cooldowns: LruCache<Identity, Instant>,
    pub overload: OverloadState,
    pub metrics: ChannelMetrics,
    pub last_parent_data: Option<Instant>,
    pub received_any: bool,
    pub last_announce: Option<Instant>,
    pub last_repair: Instant,
    pub last_mesh: Option<Instant>,
    pub pending_joins: HashMap<u32, PendingJoin>,
    pub route_queries: HashMap<u32, PendingRouteQuery>,
    pub route_proxies: HashMap<u32, RouteProxy>,
    pub route_fanouts: HashMap<u32, PendingRouteFanout>,
    pub pending_acks: HashMap<u64, PendingAck>,
    pub attach_waiters: Vec<AttachWaiter>,
    pub join_task: Option<JoinHandle<()>>,
}

impl ChannelState {
    pub fn new(id: ChannelId, options: ChannelOptions) -> Self {
        let is_root = options.role == Role::Root;
        let route_from_root = is_root.then(|| vec![id.root]);
        let upload = (options.upload_limit_bps > 0)
            .then(|| TokenBucket::bytes(options.upload_limit_bps, options.burst_window.as_secs_f64()));
        let neighbor_egress = (options.neighbor_repair.egress_bps > 0)
            .then(|| TokenBucket::bytes(options.neighbor_repair.egress_bps, 1.0));
        let bounded = |n: usize| NonZeroUsize::new(n.max(1)).unwrap_or(NonZeroUsize::MIN);

        Self {
            route_by_peer: TtlLru::new(options.route_cache_size, options.route_cache_ttl),
            peer_hints: TtlLru::new(options.peer_hint_cache_size, options.peer_hint_ttl),
            cache: SeqRing::new(options.repair.window_messages),
            gaps: GapTracker::new(options.repair.max_backfill_messages),
            have_by_peer: LruCache::new(bounded(MAX_HAVE_BY_PEER)),
            cooldowns: LruCache::new(bounded(MAX_COOLDOWNS)),
            level: if is_root { 0 } else { DETACHED_LEVEL },
            parent: None,
            children: HashMap::new(),
            route_from_root,
            seq: 0,
            upload,
            neighbor_egress,
            lazy_peers: HashSet::new(),
            overload: OverloadState::default(),
            metrics: ChannelMetrics::default(),
            last_parent_data: None,
            received_any: false,
            last_announce: None,
            last_repair: Instant::now(),
            last_mesh: None,
            pending_joins: HashMap::new(),
            route_queries: HashMap::new(),
            route_proxies: HashMap::new(),
            route_fanouts: HashMap::new(),
            pending_acks: HashMap::new(),
            attach_waiters: Vec::new(),
            join_task: None,
            join_options: None,
            id,
            options,
        }
    }

    pub fn is_root(&self) -> bool {
        self.options.role == Role::Root
    }

    /// Rooted: the root itself, or a member holding a route from the root.
    pub fn is_attached(&self) -> bool {
        self.route_from_root.is_some()
    }

    pub fn effective_max_children(&self) -> usize {
        effective_max_children(&self.options)
    }

    pub fn free_slots(&self) -> usize {
        self.effective_max_children().saturating_sub(self.children.len())
    }

    pub fn in_cooldown(&mut self, peer: &Identity) -> bool {
        match self.cooldowns.get(peer) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                self.cooldowns.pop(peer);
                false
            }
            None => false,
        }
    }

    pub fn set_cooldown(&mut self, peer: Identity, duration: std::time::Duration) {
        if duration.is_zero() {
            return;
        }
        self.cooldowns.put(peer, Instant::now() + duration);
    }

    pub fn stats(&self) -> ChannelStats {
        let mut children: Vec<Identity> = self.children.keys().copied().collect();
        children.sort();
        let mut lazy_peers: Vec<Identity> = self.lazy_peers.iter().copied().collect();
        lazy_peers.sort();
        ChannelStats {
            topic: self.id.topic.clone(),
            root: self.id.root,
            role: self.options.role,
            level: self.level,
            attached: self.is_attached(),
            parent: self.parent,
            children,
            route_from_root: self.route_from_root.clone(),
            effective_max_children: self.effective_max_children(),
            next_seq: self.seq,
            next_expected_seq: self.gaps.next_expected(),
            missing: self.gaps.missing_len(),
            end_seq_exclusive: self.gaps.end_seq_exclusive(),
            lazy_peers,
            cached_range: self.cache.range(),
            cached_routes: self.route_by_peer.len(),
        }
    }

    /// Fail every parked request with `err`. Join attempts are left to the
    /// caller because detach and close treat them differently.
    pub fn cancel_route_waiters(&mut self, err: FanoutError) {
        for (_, q) in self.route_queries.drain() {
            let _ = q.reply.send(Err(err.clone()));
        }
        for (_, f) in self.route_fanouts.drain() {
            if let RouteRequester::Local(reply) = f.requester {
                let _ = reply.send(Err(err.clone()));
            }
        }
        self.route_proxies.clear();
        for (_, ack) in self.pending_acks.drain() {
            let _ = ack.reply.send(Err(err.clone()));
        }
    }

    pub fn cancel_all(&mut self, err: FanoutError) {
        self.cancel_route_waiters(err.clone());
        for (_, join) in self.pending_joins.drain() {
            let _ = join.reply.send(Err(err.clone()));
        }
        for waiter in self.attach_waiters.drain(..) {
            let _ = waiter.reply.send(Err(err.clone()));
        }
        if let Some(task) = self.join_task.take() {
            task.abort();
        }
    }
}
