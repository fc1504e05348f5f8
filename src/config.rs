//! Channel, join and node configuration.
//!
//! Every option has a named default; callers override individual fields with
//! struct-update syntax:
//!
//! ```
//! use fanout::{ChannelOptions, Role};
//!
//! let opts = ChannelOptions {
//!     role: Role::Root,
//!     max_children: 2,
//!     ..Default::default()
//! };
//! assert!(opts.validate().is_ok());
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FanoutError, FanoutResult};
use crate::identity::Identity;
use crate::messages::MAX_LIST_ENTRIES;

pub const DEFAULT_MSG_SIZE: usize = 1024;
pub const DEFAULT_BURST_WINDOW: Duration = Duration::from_secs(1);
pub const DEFAULT_PER_CHILD_OVERHEAD: usize = 64;
pub const DEFAULT_MAX_CHILDREN: usize = 8;
pub const DEFAULT_PROXY_PUBLISH_RATE: f64 = 50.0;
pub const DEFAULT_PROXY_PUBLISH_BURST: u32 = 100;
pub const DEFAULT_UNICAST_RATE: f64 = 50.0;
pub const DEFAULT_UNICAST_BURST: u32 = 100;
pub const DEFAULT_ROUTE_CACHE_SIZE: usize = 256;
pub const DEFAULT_ROUTE_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_PEER_HINT_CACHE_SIZE: usize = 256;
pub const DEFAULT_PEER_HINT_TTL: Duration = Duration::from_secs(120);
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_OVERLOAD_EVICT_STREAK: u32 = 8;
pub const DEFAULT_OVERLOAD_EVICT_COOLDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_WRITE_FAIL_EVICT_STREAK: u32 = 16;

pub const DEFAULT_REPAIR_WINDOW: usize = 1024;
pub const DEFAULT_MAX_BACKFILL: usize = 256;
pub const DEFAULT_REPAIR_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_PER_REQ: usize = 64;

pub const DEFAULT_NEIGHBOR_PEERS: usize = 2;
pub const DEFAULT_MESH_PEERS: usize = 4;
pub const DEFAULT_NEIGHBOR_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_NEIGHBOR_EGRESS_BPS: u64 = 256 * 1024;

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_TRACKER_QUERY_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_RELAY_REJOIN_COOLDOWN: Duration = Duration::from_secs(1);
pub const DEFAULT_JOIN_CANDIDATES: usize = 4;
pub const DEFAULT_TRACKER_WANT: u8 = 16;
pub const DEFAULT_TOP_K: usize = 4;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_LOW_BID_COOLDOWN_FACTOR: u32 = 12;

pub const DEFAULT_TRACKER_FANOUT: usize = 3;
pub const DEFAULT_TRACKER_MAX_ENTRIES_PER_CHANNEL: usize = 64;
pub const DEFAULT_TRACKER_MAX_CHANNELS: usize = 256;
pub const DEFAULT_PROVIDER_MAX_NAMESPACES: usize = 256;
pub const DEFAULT_PROVIDER_MAX_ENTRIES: usize = 64;
pub const DEFAULT_KNOWN_CANDIDATE_CACHE_SIZE: usize = 1024;
pub const DEFAULT_ROUTE_QUERY_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_UNICAST_ACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PUBLISH_ATTACH_WAIT: Duration = Duration::from_secs(2);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1024 * 1024;
pub const DEFAULT_COMMAND_BUFFER: usize = 1024;
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

pub const DEFAULT_PROVIDE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_PROVIDE_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_PROVIDER_WANT: u8 = 16;
pub const DEFAULT_PROVIDER_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on the TTL a tracker or provider entry may carry.
pub const MAX_ANNOUNCE_TTL: Duration = Duration::from_secs(120);

/// Upper bound on `want` in tracker and provider queries.
pub const MAX_QUERY_WANT: u8 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Root,
    Node,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepairOptions {
    pub enabled: bool,
    /// Ring buffer size; also bounds how far back repair can reach.
    pub window_messages: usize,
    /// Skipped sequences further back than this from the newest are not tracked.
    pub max_backfill_messages: usize,
    pub interval: Duration,
    pub max_per_req: usize,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            window_messages: DEFAULT_REPAIR_WINDOW,
            max_backfill_messages: DEFAULT_MAX_BACKFILL,
            interval: DEFAULT_REPAIR_INTERVAL,
            max_per_req: DEFAULT_MAX_PER_REQ,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NeighborRepairOptions {
    pub enabled: bool,
    /// Lazy peers asked per repair tick.
    pub peers: usize,
    /// Lazy mesh size.
    pub mesh_peers: usize,
    pub announce_interval: Duration,
    /// Egress budget for answering and sending fetches; 0 disables shaping.
    pub egress_bps: u64,
}

impl Default for NeighborRepairOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            peers: DEFAULT_NEIGHBOR_PEERS,
            mesh_peers: DEFAULT_MESH_PEERS,
            announce_interval: DEFAULT_NEIGHBOR_ANNOUNCE_INTERVAL,
            egress_bps: DEFAULT_NEIGHBOR_EGRESS_BPS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOptions {
    pub role: Role,
    /// Declared messages per second; 0 means undeclared.
    pub msg_rate: f64,
    pub msg_size: usize,
    /// Upload budget in bytes per second; 0 means unshaped.
    pub upload_limit_bps: u64,
    pub burst_window: Duration,
    pub per_child_overhead: usize,
    pub max_children: usize,
    pub bid_per_byte: f64,
    pub allow_kick: bool,
    pub repair: RepairOptions,
    pub neighbor_repair: NeighborRepairOptions,
    pub proxy_publish_rate: f64,
    pub proxy_publish_burst: u32,
    pub unicast_rate: f64,
    pub unicast_burst: u32,
    /// Live mode: data older than this is dropped. Zero disables.
    pub max_data_age: Duration,
    pub route_cache_size: usize,
    pub route_cache_ttl: Duration,
    pub peer_hint_cache_size: usize,
    pub peer_hint_ttl: Duration,
    pub announce_interval: Duration,
    pub overload_evict_streak: u32,
    pub overload_evict_cooldown: Duration,
    pub write_fail_evict_streak: u32,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            role: Role::Node,
            msg_rate: 0.0,
            msg_size: DEFAULT_MSG_SIZE,
            upload_limit_bps: 0,
            burst_window: DEFAULT_BURST_WINDOW,
            per_child_overhead: DEFAULT_PER_CHILD_OVERHEAD,
            max_children: DEFAULT_MAX_CHILDREN,
            bid_per_byte: 0.0,
            allow_kick: true,
            repair: RepairOptions::default(),
            neighbor_repair: NeighborRepairOptions::default(),
            proxy_publish_rate: DEFAULT_PROXY_PUBLISH_RATE,
            proxy_publish_burst: DEFAULT_PROXY_PUBLISH_BURST,
            unicast_rate: DEFAULT_UNICAST_RATE,
            unicast_burst: DEFAULT_UNICAST_BURST,
            max_data_age: Duration::ZERO,
            route_cache_size: DEFAULT_ROUTE_CACHE_SIZE,
            route_cache_ttl: DEFAULT_ROUTE_CACHE_TTL,
            peer_hint_cache_size: DEFAULT_PEER_HINT_CACHE_SIZE,
            peer_hint_ttl: DEFAULT_PEER_HINT_TTL,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            overload_evict_streak: DEFAULT_OVERLOAD_EVICT_STREAK,
            overload_evict_cooldown: DEFAULT_OVERLOAD_EVICT_COOLDOWN,
            write_fail_evict_streak: DEFAULT_WRITE_FAIL_EVICT_STREAK,
        }
    }
}

impl ChannelOptions {
    pub fn validate(&self) -> FanoutResult<()> {
        let invalid = |msg: &str| Err(FanoutError::InvalidOptions(msg.to_string()));

        if !self.bid_per_byte.is_finite() || self.bid_per_byte < 0.0 {
            return invalid("bid_per_byte must be finite and non-negative");
        }
        if !self.msg_rate.is_finite() || self.msg_rate < 0.0 {
            return invalid("msg_rate must be finite and non-negative");
        }
        if self.upload_limit_bps > 0 && self.burst_window.is_zero() {
            return invalid("burst_window must be positive when upload is shaped");
        }
        if self.repair.window_messages == 0 {
            return invalid("repair.window_messages must be positive");
        }
        if self.repair.enabled && self.repair.interval.is_zero() {
            return invalid("repair.interval must be positive");
        }
        if self.repair.max_per_req == 0 || self.repair.max_per_req > MAX_LIST_ENTRIES {
            return invalid("repair.max_per_req must be within 1..=255");
        }
        if self.neighbor_repair.enabled && self.neighbor_repair.peers > self.neighbor_repair.mesh_peers {
            return invalid("neighbor_repair.peers cannot exceed mesh_peers");
        }
        if self.announce_interval.is_zero() {
            return invalid("announce_interval must be positive");
        }
        if self.proxy_publish_rate < 0.0 || self.unicast_rate < 0.0 {
            return invalid("ingress rates must be non-negative");
        }
        Ok(())
    }
}

/// Candidate selection policy used by the join loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoringMode {
    RankedStrict,
    #[default]
    RankedShuffle,
    Weighted,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    pub level: f64,
    pub free_slots: f64,
    pub connected: f64,
    pub bid: f64,
    pub source: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            level: 1.0,
            free_slots: 0.5,
            connected: 0.5,
            bid: 0.25,
            source: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapPeer {
    /// Already-connected (or connectable by the transport) identity.
    Peer(Identity),
    /// Transport address to dial.
    Addr(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinOptions {
    /// Overall deadline for `join_channel`.
    pub timeout: Duration,
    /// Per-attempt deadline for a `JOIN_REQ`.
    pub join_timeout: Duration,
    pub tracker_query_timeout: Duration,
    pub retry_interval: Duration,
    /// Abandon a silent parent after this long. `None` disables.
    pub stale_after: Option<Duration>,
    pub relay_rejoin_cooldown: Duration,
    pub bootstrap: Vec<BootstrapPeer>,
    pub candidates: usize,
    pub tracker_want: u8,
    pub scoring: ScoringMode,
    pub top_k: usize,
    pub weights: ScoringWeights,
    pub cooldown: Duration,
    pub low_bid_cooldown_factor: u32,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_JOIN_TIMEOUT,
            join_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            tracker_query_timeout: DEFAULT_TRACKER_QUERY_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            stale_after: None,
            relay_rejoin_cooldown: DEFAULT_RELAY_REJOIN_COOLDOWN,
            bootstrap: Vec::new(),
            candidates: DEFAULT_JOIN_CANDIDATES,
            tracker_want: DEFAULT_TRACKER_WANT,
            scoring: ScoringMode::default(),
            top_k: DEFAULT_TOP_K,
            weights: ScoringWeights::default(),
            cooldown: DEFAULT_COOLDOWN,
            low_bid_cooldown_factor: DEFAULT_LOW_BID_COOLDOWN_FACTOR,
        }
    }
}

impl JoinOptions {
    pub fn validate(&self) -> FanoutResult<()> {
        if self.candidates == 0 {
            return Err(FanoutError::InvalidOptions("candidates must be positive".into()));
        }
        if self.join_timeout.is_zero() || self.timeout.is_zero() {
            return Err(FanoutError::InvalidOptions("timeouts must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvideOptions {
    /// Entry lifetime at the tracker; capped at two minutes.
    pub ttl: Duration,
    pub interval: Duration,
}

impl Default for ProvideOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_PROVIDE_TTL,
            interval: DEFAULT_PROVIDE_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderQueryOptions {
    pub want: u8,
    pub timeout: Duration,
}

impl Default for ProviderQueryOptions {
    fn default() -> Self {
        Self {
            want: DEFAULT_PROVIDER_WANT,
            timeout: DEFAULT_PROVIDER_QUERY_TIMEOUT,
        }
    }
}

/// Node-wide settings shared by every channel.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Answer tracker and provider traffic from other nodes.
    pub serve_tracker: bool,
    /// Fixed tracker set. Empty means "ask connected peers".
    pub trackers: Vec<Identity>,
    pub tracker_fanout: usize,
    pub tracker_max_entries_per_channel: usize,
    pub tracker_max_channels: usize,
    pub provider_max_namespaces: usize,
    pub provider_max_entries: usize,
    pub known_candidate_cache_size: usize,
    pub route_query_timeout: Duration,
    pub unicast_ack_timeout: Duration,
    pub publish_attach_wait: Duration,
    pub tick_interval: Duration,
    pub max_payload_size: usize,
    pub command_buffer: usize,
    pub event_buffer: usize,
    /// Seed for the actor's RNG. `None` seeds from entropy.
    pub rng_seed: Option<u64>,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            serve_tracker: true,
            trackers: Vec::new(),
            tracker_fanout: DEFAULT_TRACKER_FANOUT,
            tracker_max_entries_per_channel: DEFAULT_TRACKER_MAX_ENTRIES_PER_CHANNEL,
            tracker_max_channels: DEFAULT_TRACKER_MAX_CHANNELS,
            provider_max_namespaces: DEFAULT_PROVIDER_MAX_NAMESPACES,
            provider_max_entries: DEFAULT_PROVIDER_MAX_ENTRIES,
            known_candidate_cache_size: DEFAULT_KNOWN_CANDIDATE_CACHE_SIZE,
            route_query_timeout: DEFAULT_ROUTE_QUERY_TIMEOUT,
            unicast_ack_timeout: DEFAULT_UNICAST_ACK_TIMEOUT,
            publish_attach_wait: DEFAULT_PUBLISH_ATTACH_WAIT,
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            event_buffer: DEFAULT_EVENT_BUFFER,
            rng_seed: None,
        }
    }
}
