//! # Fanout Node
//!
//! One actor task per node owns every open channel, the tracker and provider
//! directories and the known-candidate cache. The public [`Fanout`] handle is
//! a cheap clone around the actor's command sender; inbound frames, neighbor
//! notifications and API calls are all commands processed in order, next to a
//! periodic tick that drives announcements, repair, the lazy mesh, staleness
//! checks and request expiry.
//!
//! Handlers never await the transport. They queue frames in an outbox that
//! the actor flushes after every command and tick; write failures seen during
//! the flush feed the per-child eviction streaks.
//!
//! ## Joining
//!
//! The join loop runs on the handle side (like an iterative lookup): it asks
//! the actor to query trackers, rank candidates and attempt one join at a
//! time, each attempt parking a reply until `JOIN_ACCEPT`, `JOIN_REJECT` or
//! the attempt deadline. Redirects from rejections are tried next. Dialing
//! bootstrap addresses and unconnected candidates also happens in the join
//! loop; the actor only hears about the identities that answered.
//!
//! ## Churn
//!
//! Losing the parent (disconnect, `KICK`, staleness) detaches the channel:
//! the route is cleared, children are kicked with `PARENT_LOST` and, for
//! channels opened through [`Fanout::join_channel`], a single background
//! rejoin task is started.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::admission::{
    cooldown_for, decide_admission, merge_candidates, select_candidates, AdmissionContext,
    AdmissionDecision, Candidate, CandidateSource,
};
use crate::channel::{
    AttachWaiter, AttemptOutcome, ChannelId, ChannelMetrics, ChannelState, ChannelStats, ChildInfo,
    PendingAck, PendingJoin, PendingRouteFanout, PendingRouteQuery, RouteProxy, RouteRequester,
    DETACHED_LEVEL,
};
use crate::config::{
    ChannelOptions, FanoutConfig, JoinOptions, ProvideOptions, ProviderQueryOptions, Role,
    BootstrapPeer, DEFAULT_ATTEMPT_TIMEOUT, MAX_ANNOUNCE_TTL,
};
use crate::error::{FanoutError, FanoutResult, RejectReason};
use crate::forwarder::{plan_fanout, record_write};
use crate::identity::{now_ms, Identity};
use crate::messages::{
    message_id, parse_message_id, ChannelKey, FeedbackEvent, KickReason, Message, MessageId,
    MessageKind, PeerAddrs, TrackerRecord, KEY_SUFFIX_LEN, MAX_REDIRECTS,
};
use crate::protocols::{FanoutHandler, FanoutRpc, NeighborCallback};
use crate::repair::{plan_neighbor_fetch, NeighborHave, Observed};
use crate::route::{is_valid_route, next_hop_down, route_after_accept, NextHop, RouteToken};
use crate::tracker::{ProviderDirectory, TrackerDirectory, TrackerEntry};

/// Connected peers considered as last-resort join candidates.
const MAX_FALLBACK_CANDIDATES: usize = 16;

/// Directory pruning and peer list refresh cadence.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum FanoutEvent {
    Data {
        channel: ChannelId,
        seq: u32,
        origin_ts: u64,
        payload: Vec<u8>,
        from: Identity,
    },
    Unicast {
        channel: ChannelId,
        route: RouteToken,
        payload: Vec<u8>,
        /// Set for `unicast_ack`; the reply has already been sent.
        ack_token: Option<u64>,
        reply_route: Option<RouteToken>,
    },
    Joined {
        channel: ChannelId,
        parent: Identity,
        level: u16,
    },
    Kicked {
        channel: ChannelId,
        by: Identity,
        reason: KickReason,
    },
    Ended {
        channel: ChannelId,
        end_seq_exclusive: u32,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    pub channels: usize,
    pub connected_peers: usize,
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub unknown_channel_frames: u64,
    pub events_dropped: u64,
    pub tracker_channels: usize,
    pub provider_namespaces: usize,
    pub known_candidates: usize,
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    OpenChannel {
        topic: String,
        root: Identity,
        options: ChannelOptions,
        join: Option<JoinOptions>,
        reply: oneshot::Sender<FanoutResult<ChannelId>>,
    },
    CloseChannel {
        key: ChannelKey,
        reply: oneshot::Sender<FanoutResult<()>>,
    },
    Publish {
        key: ChannelKey,
        payload: Vec<u8>,
        reply: oneshot::Sender<FanoutResult<Option<u32>>>,
    },
    PublishEnd {
        key: ChannelKey,
        end: u32,
        reply: oneshot::Sender<FanoutResult<()>>,
    },
    IsAttached {
        key: ChannelKey,
        reply: oneshot::Sender<FanoutResult<bool>>,
    },
    QueryTrackers {
        key: ChannelKey,
        want: u8,
        timeout: Duration,
        reply: oneshot::Sender<Vec<Candidate>>,
    },
    SelectCandidates {
        key: ChannelKey,
        tracker_results: Vec<Candidate>,
        bootstrap: Vec<Identity>,
        reply: oneshot::Sender<FanoutResult<Vec<Candidate>>>,
    },
    PlanAttempt {
        key: ChannelKey,
        peer: Identity,
        addrs: Vec<Vec<u8>>,
        reply: oneshot::Sender<FanoutResult<AttemptPlan>>,
    },
    Dialed {
        peer: Identity,
        addr: Vec<u8>,
    },
    DialFailed {
        key: ChannelKey,
        peer: Identity,
        tracker: Option<Identity>,
    },
    AttemptJoin {
        key: ChannelKey,
        candidate: Candidate,
        reply: oneshot::Sender<FanoutResult<AttemptOutcome>>,
    },
    ResolveRoute {
        key: ChannelKey,
        target: Identity,
        reply: oneshot::Sender<FanoutResult<RouteToken>>,
    },
    OwnRoute {
        key: ChannelKey,
        reply: oneshot::Sender<FanoutResult<Option<RouteToken>>>,
    },
    RouteHint {
        key: ChannelKey,
        target: Identity,
        reply: oneshot::Sender<FanoutResult<Option<RouteToken>>>,
    },
    Unicast {
        key: ChannelKey,
        route: RouteToken,
        payload: Vec<u8>,
        reply: oneshot::Sender<FanoutResult<()>>,
    },
    UnicastAck {
        key: ChannelKey,
        route: RouteToken,
        payload: Vec<u8>,
        reply: oneshot::Sender<FanoutResult<()>>,
    },
    Provide {
        namespace: ChannelKey,
        options: ProvideOptions,
    },
    QueryProviders {
        namespace: ChannelKey,
        options: ProviderQueryOptions,
        reply: oneshot::Sender<Vec<PeerAddrs>>,
    },
    ChannelStats {
        key: ChannelKey,
        reply: oneshot::Sender<FanoutResult<ChannelStats>>,
    },
    ChannelMetrics {
        key: ChannelKey,
        reply: oneshot::Sender<FanoutResult<ChannelMetrics>>,
    },
    ChannelPeerHashes {
        key: ChannelKey,
        reply: oneshot::Sender<FanoutResult<Vec<String>>>,
    },
    NodeStats(oneshot::Sender<NodeStats>),
    HandleFrame(Identity, Vec<u8>),
    NeighborUp(Identity),
    NeighborDown(Identity),
    Quit,
}

// ============================================================================
// Fanout Handle (public API - cheap to clone)
// ============================================================================

/// What the join loop has to do before a join request can go out.
enum AttemptPlan {
    Done(AttemptOutcome),
    Dial(Vec<Vec<u8>>),
    Ready,
}

pub struct Fanout<N: FanoutRpc> {
    cmd_tx: mpsc::Sender<Command>,
    local: Identity,
    network: Arc<N>,
}

impl<N: FanoutRpc> Clone for Fanout<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            local: self.local,
            network: Arc::clone(&self.network),
        }
    }
}

/// Keeps re-announcing this node as a provider until stopped or dropped.
#[derive(Debug)]
pub struct ProvideHandle {
    task: JoinHandle<()>,
}

impl ProvideHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ProvideHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<N: FanoutRpc> Fanout<N> {
    pub fn spawn(network: Arc<N>, config: FanoutConfig) -> (Self, mpsc::Receiver<FanoutEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let local = network.local_identity();

        let actor = FanoutActor::new(Arc::clone(&network), config, event_tx, cmd_tx.downgrade());
        tokio::spawn(actor.run(cmd_rx));

        (Self::from_sender(cmd_tx, local, network), event_rx)
    }

    fn from_sender(cmd_tx: mpsc::Sender<Command>, local: Identity, network: Arc<N>) -> Self {
        Self { cmd_tx, local, network }
    }

    pub fn identity(&self) -> Identity {
        self.local
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> FanoutResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| FanoutError::ActorClosed)?;
        rx.await.map_err(|_| FanoutError::ActorClosed)
    }

    fn key(topic: &str, root: &Identity) -> FanoutResult<ChannelKey> {
        Ok(ChannelId::new(topic, *root)?.key)
    }

    /// Open a channel without joining. A `Root` role requires `root` to be
    /// this node.
    pub async fn open_channel(
        &self,
        topic: &str,
        root: &Identity,
        options: ChannelOptions,
    ) -> FanoutResult<ChannelId> {
        let topic = topic.to_string();
        let root = *root;
        self.request(|reply| Command::OpenChannel { topic, root, options, join: None, reply })
            .await?
    }

    /// Open (if needed) and join a channel; resolves once attached.
    ///
    /// The channel remembers `join` and rejoins on its own after losing its
    /// parent. On failure the channel stays open and detached.
    pub async fn join_channel(
        &self,
        topic: &str,
        root: &Identity,
        options: ChannelOptions,
        join: JoinOptions,
    ) -> FanoutResult<ChannelId> {
        let name = topic.to_string();
        let root_id = *root;
        let join_opts = join.clone();
        let id = self
            .request(|reply| Command::OpenChannel {
                topic: name,
                root: root_id,
                options,
                join: Some(join_opts),
                reply,
            })
            .await??;

        match tokio::time::timeout(join.timeout, self.join_loop(id.key, &join)).await {
            Ok(Ok(())) => Ok(id),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FanoutError::Timeout("join")),
        }
    }

    async fn join_loop(&self, key: ChannelKey, opts: &JoinOptions) -> FanoutResult<()> {
        let cancelled = |e: FanoutError| match e {
            FanoutError::ChannelNotFound => FanoutError::Cancelled,
            other => other,
        };
        loop {
            if self
                .request(|reply| Command::IsAttached { key, reply })
                .await?
                .map_err(cancelled)?
            {
                return Ok(());
            }

            let mut bootstrap = Vec::new();
            for peer in &opts.bootstrap {
                match peer {
                    BootstrapPeer::Peer(id) => bootstrap.push(*id),
                    BootstrapPeer::Addr(addr) => bootstrap.extend(self.dial(addr).await),
                }
            }

            let want = opts.tracker_want;
            let timeout = opts.tracker_query_timeout;
            let tracker_results = self
                .request(|reply| Command::QueryTrackers { key, want, timeout, reply })
                .await?;
            let selected = self
                .request(|reply| Command::SelectCandidates { key, tracker_results, bootstrap, reply })
                .await?
                .map_err(cancelled)?;

            let mut queue: VecDeque<Candidate> = selected.into();
            let mut tried: HashSet<Identity> = HashSet::new();
            while let Some(candidate) = queue.pop_front() {
                if !tried.insert(candidate.peer) {
                    continue;
                }
                let peer = candidate.peer;
                let outcome = self.attempt(key, candidate).await.map_err(cancelled)?;
                match outcome {
                    AttemptOutcome::Accepted => return Ok(()),
                    AttemptOutcome::Rejected(reason, redirects) => {
                        debug!(
                            peer = %peer.short(),
                            reason = %reason,
                            redirects = redirects.len(),
                            "join rejected"
                        );
                        for r in redirects.into_iter().take(MAX_REDIRECTS).rev() {
                            if tried.contains(&r.peer) || r.peer == self.local {
                                continue;
                            }
                            let mut c = Candidate::unknown(r.peer, CandidateSource::Redirect);
                            c.addrs = r.addrs;
                            queue.push_front(c);
                        }
                    }
                    AttemptOutcome::DialFailed | AttemptOutcome::TimedOut | AttemptOutcome::Skipped => {
                        trace!(peer = %peer.short(), outcome = ?outcome, "join attempt failed");
                    }
                }
            }
            tokio::time::sleep(opts.retry_interval).await;
        }
    }

    /// Dial `addr` from the caller's task and let the actor record the peer.
    async fn dial(&self, addr: &[u8]) -> Option<Identity> {
        match self.network.dial(addr).await {
            Ok(peer) => {
                let addr = addr.to_vec();
                let _ = self.cmd_tx.send(Command::Dialed { peer, addr }).await;
                Some(peer)
            }
            Err(e) => {
                debug!(error = %e, "dial failed");
                None
            }
        }
    }

    /// One join attempt: connect to the candidate if needed, then send the
    /// request through the actor and wait for its outcome.
    async fn attempt(&self, key: ChannelKey, candidate: Candidate) -> FanoutResult<AttemptOutcome> {
        let peer = candidate.peer;
        let addrs = candidate.addrs.clone();
        match self.request(|reply| Command::PlanAttempt { key, peer, addrs, reply }).await?? {
            AttemptPlan::Done(outcome) => return Ok(outcome),
            AttemptPlan::Ready => {}
            AttemptPlan::Dial(addrs) => {
                let mut reached = false;
                for addr in &addrs {
                    match self.dial(addr).await {
                        Some(id) if id == peer => {
                            reached = true;
                            break;
                        }
                        Some(id) => {
                            debug!(expected = %peer.short(), got = %id.short(), "dialed address answered with another identity");
                        }
                        None => {}
                    }
                }
                if !reached {
                    debug!(peer = %peer.short(), "join candidate unreachable");
                    let tracker = candidate.tracker;
                    let _ = self.cmd_tx.send(Command::DialFailed { key, peer, tracker }).await;
                    return Ok(AttemptOutcome::DialFailed);
                }
            }
        }
        self.request(|reply| Command::AttemptJoin { key, candidate, reply }).await?
    }

    /// Background rejoin after losing the parent. Keeps trying until
    /// attached or the channel goes away.
    async fn rejoin_loop(&self, key: ChannelKey, opts: JoinOptions) {
        loop {
            match tokio::time::timeout(opts.timeout, self.join_loop(key, &opts)).await {
                Ok(Ok(())) => {
                    debug!(channel = %hex::encode(&key[..8]), "rejoined channel");
                    return;
                }
                Ok(Err(FanoutError::Cancelled | FanoutError::ChannelNotFound | FanoutError::ActorClosed)) => {
                    return;
                }
                Ok(Err(e)) => debug!(channel = %hex::encode(&key[..8]), error = %e, "rejoin attempt failed"),
                Err(_) => debug!(channel = %hex::encode(&key[..8]), "rejoin timed out, retrying"),
            }
            tokio::time::sleep(opts.retry_interval).await;
        }
    }

    /// Root: returns the assigned sequence. Member: proxies to the root and
    /// returns `None`; waits briefly for attachment when detached.
    pub async fn publish_to_channel(
        &self,
        topic: &str,
        root: &Identity,
        payload: Vec<u8>,
    ) -> FanoutResult<Option<u32>> {
        let key = Self::key(topic, root)?;
        self.request(|reply| Command::Publish { key, payload, reply }).await?
    }

    pub async fn publish_end(&self, topic: &str, root: &Identity, last_seq_exclusive: u32) -> FanoutResult<()> {
        let key = Self::key(topic, root)?;
        self.request(|reply| Command::PublishEnd { key, end: last_seq_exclusive, reply })
            .await?
    }

    pub async fn unicast(
        &self,
        topic: &str,
        root: &Identity,
        route: &RouteToken,
        payload: Vec<u8>,
    ) -> FanoutResult<()> {
        let key = Self::key(topic, root)?;
        let route = route.clone();
        self.request(|reply| Command::Unicast { key, route, payload, reply }).await?
    }

    /// Unicast and wait for the target's acknowledgement.
    pub async fn unicast_ack(
        &self,
        topic: &str,
        root: &Identity,
        route: &RouteToken,
        payload: Vec<u8>,
    ) -> FanoutResult<()> {
        let key = Self::key(topic, root)?;
        let route = route.clone();
        self.request(|reply| Command::UnicastAck { key, route, payload, reply })
            .await?
    }

    pub async fn unicast_to(
        &self,
        topic: &str,
        root: &Identity,
        target: &Identity,
        payload: Vec<u8>,
    ) -> FanoutResult<()> {
        let route = self.resolve_route_token(topic, root, target).await?;
        self.unicast(topic, root, &route, payload).await
    }

    pub async fn resolve_route_token(
        &self,
        topic: &str,
        root: &Identity,
        target: &Identity,
    ) -> FanoutResult<RouteToken> {
        let key = Self::key(topic, root)?;
        let target = *target;
        self.request(|reply| Command::ResolveRoute { key, target, reply })
            .await?
    }

    /// This node's own route from the root, if attached.
    pub async fn get_route_token(&self, topic: &str, root: &Identity) -> FanoutResult<Option<RouteToken>> {
        let key = Self::key(topic, root)?;
        self.request(|reply| Command::OwnRoute { key, reply }).await?
    }

    /// Cached route to `target`, without any network traffic.
    pub async fn get_route_hint(
        &self,
        topic: &str,
        root: &Identity,
        target: &Identity,
    ) -> FanoutResult<Option<RouteToken>> {
        let key = Self::key(topic, root)?;
        let target = *target;
        self.request(|reply| Command::RouteHint { key, target, reply }).await?
    }

    /// Announce this node under `namespace` every `options.interval`.
    pub async fn provide(&self, namespace: &str, options: ProvideOptions) -> FanoutResult<ProvideHandle> {
        let namespace = crate::channel::namespace_key(namespace);
        let cmd_tx = self.cmd_tx.clone();
        let interval = options.interval.max(Duration::from_millis(10));
        let task = tokio::spawn(async move {
            loop {
                let cmd = Command::Provide { namespace, options: options.clone() };
                if cmd_tx.send(cmd).await.is_err() {
                    return;
                }
                tokio::time::sleep(interval).await;
            }
        });
        Ok(ProvideHandle { task })
    }

    pub async fn query_provider_candidates(
        &self,
        namespace: &str,
        options: ProviderQueryOptions,
    ) -> FanoutResult<Vec<PeerAddrs>> {
        let namespace = crate::channel::namespace_key(namespace);
        self.request(|reply| Command::QueryProviders { namespace, options, reply })
            .await
    }

    pub async fn channel_stats(&self, topic: &str, root: &Identity) -> FanoutResult<ChannelStats> {
        let key = Self::key(topic, root)?;
        self.request(|reply| Command::ChannelStats { key, reply }).await?
    }

    pub async fn channel_metrics(&self, topic: &str, root: &Identity) -> FanoutResult<ChannelMetrics> {
        let key = Self::key(topic, root)?;
        self.request(|reply| Command::ChannelMetrics { key, reply }).await?
    }

    /// Short hashes of the peers this node knows in the channel.
    pub async fn channel_peer_hashes(&self, topic: &str, root: &Identity) -> FanoutResult<Vec<String>> {
        let key = Self::key(topic, root)?;
        self.request(|reply| Command::ChannelPeerHashes { key, reply })
            .await?
    }

    pub async fn node_stats(&self) -> FanoutResult<NodeStats> {
        self.request(Command::NodeStats).await
    }

    pub async fn close_channel(&self, topic: &str, root: &Identity) -> FanoutResult<()> {
        let key = Self::key(topic, root)?;
        self.request(|reply| Command::CloseChannel { key, reply }).await?
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

#[async_trait::async_trait]
impl<N: FanoutRpc> NeighborCallback for Fanout<N> {
    async fn neighbor_up(&self, peer: Identity) {
        let _ = self.cmd_tx.send(Command::NeighborUp(peer)).await;
    }

    async fn neighbor_down(&self, peer: &Identity) {
        let _ = self.cmd_tx.send(Command::NeighborDown(*peer)).await;
    }
}

#[async_trait::async_trait]
impl<N: FanoutRpc> FanoutHandler for Fanout<N> {
    async fn handle_frame(&self, from: &Identity, frame: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::HandleFrame(*from, frame)).await;
    }
}

// ============================================================================
// Outbox
// ============================================================================

struct Outgoing {
    peer: Identity,
    key: Option<ChannelKey>,
    kind: MessageKind,
    frame: Vec<u8>,
    /// Count write failures towards the child's eviction streak.
    child_write: bool,
}

impl Outgoing {
    fn control(peer: Identity, msg: &Message) -> Self {
        Self {
            peer,
            key: msg.channel_key().copied(),
            kind: msg.kind(),
            frame: msg.encode(),
            child_write: false,
        }
    }

    fn data(peer: Identity, key: ChannelKey, frame: Vec<u8>, child_write: bool) -> Self {
        Self {
            peer,
            key: Some(key),
            kind: MessageKind::Data,
            frame,
            child_write,
        }
    }
}

fn emit(event_tx: &mpsc::Sender<FanoutEvent>, stats: &mut NodeStats, event: FanoutEvent) {
    if let Err(e) = event_tx.try_send(event) {
        stats.events_dropped += 1;
        match e {
            mpsc::error::TrySendError::Full(_) => warn!("event channel full, dropping event"),
            mpsc::error::TrySendError::Closed(_) => trace!("event channel closed"),
        }
    }
}

/// Send a data frame to the children the upload budget allows, and kick the
/// lowest starved bidder once overload persists.
fn fanout_frame(state: &mut ChannelState, frame: &[u8], outbox: &mut Vec<Outgoing>) {
    if state.children.is_empty() {
        return;
    }
    let plan = plan_fanout(
        &state.children,
        frame.len(),
        state.options.per_child_overhead,
        state.upload.as_mut(),
    );
    state.metrics.dropped_upload += plan.starved.len() as u64;
    for child in &plan.targets {
        outbox.push(Outgoing::data(*child, state.id.key, frame.to_vec(), true));
    }
    if let Some(victim) = state.overload.record(&plan, &mut state.children, &state.options) {
        state.children.remove(&victim);
        state.metrics.evictions_overload += 1;
        warn!(
            channel = %state.id.key_hex(),
            child = %victim.short(),
            "evicting starved child after sustained overload"
        );
        outbox.push(Outgoing::control(
            victim,
            &Message::Kick { key: state.id.key, reason: KickReason::Overload },
        ));
    }
}

fn data_frame(state: &ChannelState, seq: u32) -> Option<Vec<u8>> {
    let cached = state.cache.get(seq)?;
    Some(
        Message::Data {
            msg_id: message_id(seq, &state.id.suffix),
            origin_ts: cached.origin_ts,
            payload: cached.payload.clone(),
        }
        .encode(),
    )
}

/// Cached route to `target` that is still structurally valid. At the root
/// the second hop must also still be a child.
fn cached_route(state: &mut ChannelState, target: &Identity) -> Option<Vec<Identity>> {
    let route = state.route_by_peer.get(target)?.clone();
    let live = !state.is_root() || route.get(1).is_some_and(|hop| state.children.contains_key(hop));
    if !is_valid_route(&route, &state.id.root, target) || !live {
        state.route_by_peer.remove(target);
        return None;
    }
    Some(route)
}

fn finish_route_fanout(
    requester: RouteRequester,
    key: ChannelKey,
    route: Option<Vec<Identity>>,
    outbox: &mut Vec<Outgoing>,
) {
    match requester {
        RouteRequester::Local(reply) => {
            let result = route.ok_or(FanoutError::RouteNotFound).and_then(RouteToken::new);
            let _ = reply.send(result);
        }
        RouteRequester::Parent { peer, req_id } | RouteRequester::Child { peer, req_id } => {
            outbox.push(Outgoing::control(peer, &Message::RouteReply { key, req_id, route }));
        }
    }
}

/// Up to four peers a rejected joiner could try instead: children first,
/// then tracker rows with free slots, then recently seen candidates.
fn collect_redirects(
    children: Option<&HashMap<Identity, ChildInfo>>,
    trackers: &TrackerDirectory,
    known: &LruCache<Identity, Vec<Vec<u8>>>,
    key: &ChannelKey,
    requester: &Identity,
    local: &Identity,
) -> Vec<PeerAddrs> {
    let mut seen: HashSet<Identity> = HashSet::new();
    seen.insert(*requester);
    seen.insert(*local);
    let mut redirects = Vec::new();

    if let Some(children) = children {
        let mut kids: Vec<(&Identity, &ChildInfo)> = children.iter().collect();
        kids.sort_by(|a, b| a.1.joined_at.cmp(&b.1.joined_at));
        for (peer, info) in kids {
            if seen.insert(*peer) {
                redirects.push(PeerAddrs { peer: *peer, addrs: info.addrs.clone() });
            }
        }
    }

    let mut tracked = trackers.peers(key);
    tracked.retain(|(_, e)| e.free_slots > 0);
    tracked.sort_by(|a, b| a.1.level.cmp(&b.1.level).then_with(|| b.1.free_slots.cmp(&a.1.free_slots)));
    for (peer, entry) in tracked {
        if seen.insert(peer) {
            redirects.push(PeerAddrs { peer, addrs: entry.addrs });
        }
    }

    for (peer, addrs) in known.iter() {
        if redirects.len() >= MAX_REDIRECTS {
            break;
        }
        if seen.insert(*peer) {
            redirects.push(PeerAddrs { peer: *peer, addrs: addrs.clone() });
        }
    }

    redirects.truncate(MAX_REDIRECTS);
    redirects
}

fn xor_distance(a: &Identity, key: &ChannelKey) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a.as_bytes()[i] ^ key[i];
    }
    out
}

fn record_to_candidate(record: TrackerRecord, tracker: Identity) -> Candidate {
    Candidate {
        peer: record.peer,
        addrs: record.addrs,
        level: record.level,
        free_slots: record.free_slots,
        bid_per_byte: record.bid_per_byte,
        source: CandidateSource::Tracker,
        connected: false,
        tracker: Some(tracker),
    }
}

// ============================================================================
// Fanout Actor (owns state)
// ============================================================================

struct PendingTrackerQuery {
    key: ChannelKey,
    outstanding: HashSet<Identity>,
    results: Vec<Candidate>,
    deadline: Instant,
    reply: oneshot::Sender<Vec<Candidate>>,
}

struct PendingProviderQuery {
    key: ChannelKey,
    outstanding: HashSet<Identity>,
    results: Vec<PeerAddrs>,
    deadline: Instant,
    reply: oneshot::Sender<Vec<PeerAddrs>>,
}

fn dedup_providers(entries: Vec<PeerAddrs>) -> Vec<PeerAddrs> {
    let mut seen = HashSet::new();
    entries.into_iter().filter(|e| seen.insert(e.peer)).collect()
}

enum RouteStep {
    Deliver,
    Sent,
    Dropped,
}

struct FanoutActor<N: FanoutRpc> {
    network: Arc<N>,
    local: Identity,
    config: FanoutConfig,
    channels: HashMap<ChannelKey, ChannelState>,
    by_suffix: HashMap<[u8; KEY_SUFFIX_LEN], ChannelKey>,
    trackers: TrackerDirectory,
    providers: ProviderDirectory,
    known: LruCache<Identity, Vec<Vec<u8>>>,
    connected: HashSet<Identity>,
    tracker_queries: HashMap<u32, PendingTrackerQuery>,
    provider_queries: HashMap<u32, PendingProviderQuery>,
    outbox: Vec<Outgoing>,
    rng: StdRng,
    event_tx: mpsc::Sender<FanoutEvent>,
    cmd_tx: mpsc::WeakSender<Command>,
    stats: NodeStats,
    last_maintenance: Instant,
}

impl<N: FanoutRpc> FanoutActor<N> {
    fn new(
        network: Arc<N>,
        config: FanoutConfig,
        event_tx: mpsc::Sender<FanoutEvent>,
        cmd_tx: mpsc::WeakSender<Command>,
    ) -> Self {
        let local = network.local_identity();
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let known_cap = NonZeroUsize::new(config.known_candidate_cache_size.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            trackers: TrackerDirectory::new(config.tracker_max_channels, config.tracker_max_entries_per_channel),
            providers: ProviderDirectory::new(config.provider_max_namespaces, config.provider_max_entries),
            known: LruCache::new(known_cap),
            network,
            local,
            config,
            channels: HashMap::new(),
            by_suffix: HashMap::new(),
            connected: HashSet::new(),
            tracker_queries: HashMap::new(),
            provider_queries: HashMap::new(),
            outbox: Vec::new(),
            rng,
            event_tx,
            cmd_tx,
            stats: NodeStats::default(),
            last_maintenance: Instant::now(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        self.connected = self.network.peers().await.into_iter().collect();

        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Quit) => {
                            debug!("fanout actor quitting");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            debug!("fanout actor quitting (all handles dropped)");
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    self.tick().await;
                }
            }
            self.flush().await;
        }

        self.shutdown();
        self.flush().await;
    }

    fn shutdown(&mut self) {
        for (key, mut state) in self.channels.drain() {
            if let Some(parent) = state.parent {
                self.outbox.push(Outgoing::control(parent, &Message::Leave { key }));
            }
            for child in state.children.keys() {
                self.outbox.push(Outgoing::control(
                    *child,
                    &Message::Kick { key, reason: KickReason::Closing },
                ));
            }
            state.cancel_all(FanoutError::ActorClosed);
        }
        self.by_suffix.clear();
        for (_, q) in self.tracker_queries.drain() {
            let _ = q.reply.send(q.results);
        }
        for (_, q) in self.provider_queries.drain() {
            let _ = q.reply.send(dedup_providers(q.results));
        }
    }

    /// Send everything queued by handlers. Child write failures count
    /// towards eviction; an eviction queues a `KICK`, sent in the next pass.
    async fn flush(&mut self) {
        while !self.outbox.is_empty() {
            let batch = std::mem::take(&mut self.outbox);
            for out in batch {
                let len = out.frame.len();
                let ok = match self.network.send_to_peer(&out.peer, out.frame, out.kind.priority()).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        trace!(peer = %out.peer.short(), kind = ?out.kind, error = %e, "send failed");
                        false
                    }
                };
                let Some(state) = out.key.and_then(|k| self.channels.get_mut(&k)) else {
                    continue;
                };
                if ok {
                    state.metrics.record_sent(out.kind, len);
                } else {
                    state.metrics.write_failures += 1;
                }
                if !out.child_write {
                    continue;
                }
                let evict_streak = state.options.write_fail_evict_streak;
                let evict = state
                    .children
                    .get_mut(&out.peer)
                    .is_some_and(|child| record_write(child, ok, evict_streak));
                if evict {
                    state.children.remove(&out.peer);
                    state.metrics.evictions_write_failure += 1;
                    warn!(
                        channel = %state.id.key_hex(),
                        child = %out.peer.short(),
                        "evicting child after repeated write failures"
                    );
                    self.outbox.push(Outgoing::control(
                        out.peer,
                        &Message::Kick { key: state.id.key, reason: KickReason::WriteFailure },
                    ));
                }
            }
        }
    }

    fn emit(&mut self, event: FanoutEvent) {
        emit(&self.event_tx, &mut self.stats, event);
    }

    fn push(&mut self, peer: Identity, msg: &Message) {
        self.outbox.push(Outgoing::control(peer, msg));
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::OpenChannel { topic, root, options, join, reply } => {
                let _ = reply.send(self.open_channel(&topic, root, options, join));
            }
            Command::CloseChannel { key, reply } => {
                let _ = reply.send(self.close_channel(&key));
            }
            Command::Publish { key, payload, reply } => self.publish(key, payload, reply),
            Command::PublishEnd { key, end, reply } => {
                let _ = reply.send(self.publish_end(key, end));
            }
            Command::IsAttached { key, reply } => {
                let result = self
                    .channels
                    .get(&key)
                    .map(|s| s.is_attached())
                    .ok_or(FanoutError::ChannelNotFound);
                let _ = reply.send(result);
            }
            Command::QueryTrackers { key, want, timeout, reply } => {
                self.query_trackers(key, want, timeout, reply);
            }
            Command::SelectCandidates { key, tracker_results, bootstrap, reply } => {
                let _ = reply.send(self.select_join_candidates(key, tracker_results, bootstrap));
            }
            Command::PlanAttempt { key, peer, addrs, reply } => {
                let _ = reply.send(self.plan_attempt(key, peer, addrs));
            }
            Command::Dialed { peer, addr } => {
                self.connected.insert(peer);
                match self.known.get_mut(&peer) {
                    Some(addrs) if !addrs.contains(&addr) => addrs.push(addr),
                    Some(_) => {}
                    None => {
                        self.known.put(peer, vec![addr]);
                    }
                }
            }
            Command::DialFailed { key, peer, tracker } => {
                self.record_attempt_failure(key, peer, tracker, FeedbackEvent::DialFailed);
            }
            Command::AttemptJoin { key, candidate, reply } => self.attempt_join(key, candidate, reply),
            Command::ResolveRoute { key, target, reply } => self.resolve_route(key, target, reply),
            Command::OwnRoute { key, reply } => {
                let result = self
                    .channels
                    .get(&key)
                    .ok_or(FanoutError::ChannelNotFound)
                    .and_then(|s| s.route_from_root.clone().map(RouteToken::new).transpose());
                let _ = reply.send(result);
            }
            Command::RouteHint { key, target, reply } => {
                let result = match self.channels.get_mut(&key) {
                    Some(state) => cached_route(state, &target).map(RouteToken::new).transpose(),
                    None => Err(FanoutError::ChannelNotFound),
                };
                let _ = reply.send(result);
            }
            Command::Unicast { key, route, payload, reply } => {
                let _ = reply.send(self.unicast(key, route, payload));
            }
            Command::UnicastAck { key, route, payload, reply } => {
                self.unicast_ack(key, route, payload, reply);
            }
            Command::Provide { namespace, options } => self.provide_announce(namespace, &options),
            Command::QueryProviders { namespace, options, reply } => {
                self.query_providers(namespace, &options, reply);
            }
            Command::ChannelStats { key, reply } => {
                let result = self.channels.get(&key).map(|s| s.stats()).ok_or(FanoutError::ChannelNotFound);
                let _ = reply.send(result);
            }
            Command::ChannelMetrics { key, reply } => {
                let result = self
                    .channels
                    .get(&key)
                    .map(|s| s.metrics.clone())
                    .ok_or(FanoutError::ChannelNotFound);
                let _ = reply.send(result);
            }
            Command::ChannelPeerHashes { key, reply } => {
                let _ = reply.send(self.channel_peer_hashes(&key));
            }
            Command::NodeStats(reply) => {
                let mut stats = self.stats.clone();
                stats.channels = self.channels.len();
                stats.connected_peers = self.connected.len();
                stats.tracker_channels = self.trackers.channel_count();
                stats.provider_namespaces = self.providers.namespace_count();
                stats.known_candidates = self.known.len();
                let _ = reply.send(stats);
            }
            Command::HandleFrame(from, frame) => self.handle_frame(from, frame),
            Command::NeighborUp(peer) => {
                trace!(peer = %peer.short(), "neighbor up");
                self.connected.insert(peer);
            }
            Command::NeighborDown(peer) => self.neighbor_down(peer),
            Command::Quit => {}
        }
    }

    // ------------------------------------------------------------------------
    // Channel lifecycle and publishing
    // ------------------------------------------------------------------------

    fn open_channel(
        &mut self,
        topic: &str,
        root: Identity,
        options: ChannelOptions,
        join: Option<JoinOptions>,
    ) -> FanoutResult<ChannelId> {
        let id = ChannelId::new(topic, root)?;
        options.validate()?;
        if let Some(join) = &join {
            join.validate()?;
        }
        match options.role {
            Role::Root if root != self.local => {
                return Err(FanoutError::InvalidOptions("root role requires the local identity as root".into()));
            }
            Role::Node if root == self.local => {
                return Err(FanoutError::InvalidOptions("the root cannot join its own channel".into()));
            }
            _ => {}
        }

        if let Some(state) = self.channels.get_mut(&id.key) {
            if join.is_some() && !state.is_root() {
                state.join_options = join;
                return Ok(state.id.clone());
            }
            return Err(FanoutError::ChannelExists);
        }

        info!(
            channel = %id.key_hex(),
            topic = %id.topic,
            role = ?options.role,
            "opened channel"
        );
        let mut state = ChannelState::new(id.clone(), options);
        state.join_options = join;
        self.by_suffix.insert(id.suffix, id.key);
        self.channels.insert(id.key, state);
        Ok(id)
    }

    fn close_channel(&mut self, key: &ChannelKey) -> FanoutResult<()> {
        let mut state = self.channels.remove(key).ok_or(FanoutError::ChannelNotFound)?;
        self.by_suffix.remove(&state.id.suffix);

        if let Some(parent) = state.parent {
            self.push(parent, &Message::Leave { key: *key });
        }
        for child in state.children.keys() {
            self.outbox.push(Outgoing::control(
                *child,
                &Message::Kick { key: *key, reason: KickReason::Closing },
            ));
        }
        if state.is_attached() && !state.is_root() {
            self.withdraw_announcement(*key);
        }
        state.cancel_all(FanoutError::Cancelled);
        info!(channel = %state.id.key_hex(), "closed channel");
        Ok(())
    }

    fn publish(
        &mut self,
        key: ChannelKey,
        payload: Vec<u8>,
        reply: oneshot::Sender<FanoutResult<Option<u32>>>,
    ) {
        if payload.len() > self.config.max_payload_size {
            let _ = reply.send(Err(FanoutError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            }));
            return;
        }
        let attach_wait = self.config.publish_attach_wait;
        let Some(state) = self.channels.get_mut(&key) else {
            let _ = reply.send(Err(FanoutError::ChannelNotFound));
            return;
        };

        if state.is_root() {
            let seq = self.root_publish(key, payload);
            let _ = reply.send(Ok(seq));
            return;
        }
        match state.parent {
            Some(parent) if state.is_attached() => {
                self.push(parent, &Message::ProxyPublish { key, payload });
                let _ = reply.send(Ok(None));
            }
            _ => {
                trace!(channel = %state.id.key_hex(), "publish waiting for attachment");
                state.attach_waiters.push(AttachWaiter {
                    payload,
                    deadline: Instant::now() + attach_wait,
                    reply,
                });
            }
        }
    }

    /// Assign the next sequence, cache and fan out. Root only.
    fn root_publish(&mut self, key: ChannelKey, payload: Vec<u8>) -> Option<u32> {
        let state = self.channels.get_mut(&key)?;
        if !state.is_root() {
            return None;
        }
        let seq = state.seq;
        if state.gaps.end_seq_exclusive().is_some_and(|end| seq >= end) {
            debug!(channel = %state.id.key_hex(), seq, "publish after end of stream");
        }
        state.seq = state.seq.wrapping_add(1);

        let origin_ts = now_ms();
        state.cache.insert(seq, origin_ts, payload.clone());
        let frame = Message::Data {
            msg_id: message_id(seq, &state.id.suffix),
            origin_ts,
            payload,
        }
        .encode();
        trace!(channel = %state.id.key_hex(), seq, children = state.children.len(), "publishing");
        fanout_frame(state, &frame, &mut self.outbox);
        Some(seq)
    }

    fn publish_end(&mut self, key: ChannelKey, end: u32) -> FanoutResult<()> {
        let state = self.channels.get_mut(&key).ok_or(FanoutError::ChannelNotFound)?;
        if !state.is_root() {
            return Err(FanoutError::NotRoot);
        }
        state.gaps.mark_end(end);
        let children: Vec<Identity> = state.children.keys().copied().collect();
        info!(channel = %state.id.key_hex(), end, "ending stream");
        let msg = Message::End { key, end_seq_exclusive: end };
        for child in children {
            self.push(child, &msg);
        }
        Ok(())
    }

    fn channel_peer_hashes(&self, key: &ChannelKey) -> FanoutResult<Vec<String>> {
        let state = self.channels.get(key).ok_or(FanoutError::ChannelNotFound)?;
        let mut peers: HashSet<Identity> = state.children.keys().copied().collect();
        peers.extend(state.parent);
        peers.extend(state.lazy_peers.iter().copied());
        peers.extend(state.peer_hints.iter().map(|(p, _)| *p));
        peers.remove(&self.local);
        let mut hashes: Vec<String> = peers.iter().map(|p| p.peer_hash()).collect();
        hashes.sort();
        Ok(hashes)
    }

    // ------------------------------------------------------------------------
    // Trackers and providers
    // ------------------------------------------------------------------------

    /// Tracker peers for a key: the configured list, else the connected
    /// peers closest to the key by XOR distance.
    fn tracker_set(&self, key: &ChannelKey) -> Vec<Identity> {
        if !self.config.trackers.is_empty() {
            return self
                .config
                .trackers
                .iter()
                .copied()
                .filter(|t| *t != self.local)
                .collect();
        }
        let mut peers: Vec<Identity> = self.connected.iter().copied().collect();
        peers.sort_by_key(|p| xor_distance(p, key));
        peers.truncate(self.config.tracker_fanout);
        peers
    }

    fn announce_channel(&mut self, key: ChannelKey) {
        let addrs = self.network.local_addrs();
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        if !state.is_attached() {
            return;
        }
        state.last_announce = Some(Instant::now());
        let ttl = state.options.announce_interval.saturating_mul(3).min(MAX_ANNOUNCE_TTL);
        let entry = TrackerEntry {
            level: state.level,
            max_children: state.effective_max_children().min(u16::MAX as usize) as u16,
            free_slots: state.free_slots().min(u16::MAX as usize) as u16,
            bid_per_byte: state.options.bid_per_byte,
            addrs,
        };
        let msg = Message::TrackerAnnounce {
            key,
            ttl_secs: ttl.as_secs().max(1) as u16,
            level: entry.level,
            max_children: entry.max_children,
            free_slots: entry.free_slots,
            bid_per_byte: entry.bid_per_byte,
            addrs: entry.addrs.clone(),
        };
        trace!(channel = %state.id.key_hex(), level = entry.level, free = entry.free_slots, "announcing");
        if self.config.serve_tracker {
            self.trackers.announce(key, self.local, entry, ttl);
        }
        for tracker in self.tracker_set(&key) {
            self.push(tracker, &msg);
        }
    }

    /// Zero-TTL announcement: trackers drop our entry.
    fn withdraw_announcement(&mut self, key: ChannelKey) {
        let entry = TrackerEntry {
            level: DETACHED_LEVEL,
            max_children: 0,
            free_slots: 0,
            bid_per_byte: 0.0,
            addrs: Vec::new(),
        };
        if self.config.serve_tracker {
            self.trackers.announce(key, self.local, entry, Duration::ZERO);
        }
        let msg = Message::TrackerAnnounce {
            key,
            ttl_secs: 0,
            level: DETACHED_LEVEL,
            max_children: 0,
            free_slots: 0,
            bid_per_byte: 0.0,
            addrs: Vec::new(),
        };
        for tracker in self.tracker_set(&key) {
            self.push(tracker, &msg);
        }
    }

    fn query_trackers(
        &mut self,
        key: ChannelKey,
        want: u8,
        timeout: Duration,
        reply: oneshot::Sender<Vec<Candidate>>,
    ) {
        let mut results = Vec::new();
        if self.config.serve_tracker {
            let local = self.local;
            results.extend(
                self.trackers
                    .query(&key, &local, want, &mut self.rng)
                    .into_iter()
                    .map(|r| record_to_candidate(r, local)),
            );
        }
        let trackers = self.tracker_set(&key);
        if trackers.is_empty() {
            let _ = reply.send(results);
            return;
        }

        let req_id: u32 = self.rng.gen();
        let msg = Message::TrackerQuery { key, req_id, want };
        for tracker in &trackers {
            self.push(*tracker, &msg);
        }
        trace!(channel = %hex::encode(&key[..8]), trackers = trackers.len(), "querying trackers");
        self.tracker_queries.insert(
            req_id,
            PendingTrackerQuery {
                key,
                outstanding: trackers.into_iter().collect(),
                results,
                deadline: Instant::now() + timeout,
                reply,
            },
        );
    }

    fn send_feedback(&mut self, key: ChannelKey, candidate: Identity, tracker: Option<Identity>, event: FeedbackEvent) {
        match tracker {
            Some(t) if t == self.local => self.trackers.feedback(&key, &candidate, event),
            Some(t) => self.push(t, &Message::TrackerFeedback { key, candidate, event }),
            None => {}
        }
    }

    /// Cooldown and tracker feedback after an unsuccessful attempt.
    fn record_attempt_failure(&mut self, key: ChannelKey, peer: Identity, tracker: Option<Identity>, event: FeedbackEvent) {
        if let Some(state) = self.channels.get_mut(&key) {
            let opts = state.join_options.clone().unwrap_or_default();
            state.set_cooldown(peer, cooldown_for(event, &opts));
        }
        self.send_feedback(key, peer, tracker, event);
    }

    fn provide_announce(&mut self, namespace: ChannelKey, options: &ProvideOptions) {
        let ttl = options.ttl.min(MAX_ANNOUNCE_TTL);
        let addrs = self.network.local_addrs();
        if self.config.serve_tracker {
            self.providers.announce(namespace, self.local, addrs.clone(), ttl);
        }
        let msg = Message::ProviderAnnounce { key: namespace, ttl_secs: ttl.as_secs() as u16, addrs };
        for tracker in self.tracker_set(&namespace) {
            self.push(tracker, &msg);
        }
    }

    fn query_providers(
        &mut self,
        namespace: ChannelKey,
        options: &ProviderQueryOptions,
        reply: oneshot::Sender<Vec<PeerAddrs>>,
    ) {
        let mut results = Vec::new();
        if self.config.serve_tracker {
            let local = self.local;
            results = self.providers.query(&namespace, &local, options.want, &mut self.rng);
        }
        let trackers = self.tracker_set(&namespace);
        if trackers.is_empty() {
            let _ = reply.send(dedup_providers(results));
            return;
        }
        let req_id: u32 = self.rng.gen();
        let msg = Message::ProviderQuery { key: namespace, req_id, want: options.want };
        for tracker in &trackers {
            self.push(*tracker, &msg);
        }
        self.provider_queries.insert(
            req_id,
            PendingProviderQuery {
                key: namespace,
                outstanding: trackers.into_iter().collect(),
                results,
                deadline: Instant::now() + options.timeout,
                reply,
            },
        );
    }

    // ------------------------------------------------------------------------
    // Joining
    // ------------------------------------------------------------------------

    fn select_join_candidates(
        &mut self,
        key: ChannelKey,
        tracker_results: Vec<Candidate>,
        bootstrap: Vec<Identity>,
    ) -> FanoutResult<Vec<Candidate>> {
        let local = self.local;
        let state = self.channels.get_mut(&key).ok_or(FanoutError::ChannelNotFound)?;
        let opts = state.join_options.clone().unwrap_or_default();
        let root = state.id.root;
        let mut pool: Vec<Candidate> = Vec::new();

        if self.connected.contains(&root) {
            pool.push(Candidate {
                peer: root,
                addrs: self.known.peek(&root).cloned().unwrap_or_default(),
                level: 0,
                free_slots: 1,
                bid_per_byte: 0.0,
                source: CandidateSource::Root,
                connected: true,
                tracker: None,
            });
        }
        pool.extend(tracker_results);
        let hinted: Vec<Identity> = state.peer_hints.iter().map(|(p, _)| *p).collect();
        for peer in hinted.into_iter().chain(bootstrap) {
            let mut c = Candidate::unknown(peer, CandidateSource::Known);
            c.addrs = self.known.peek(&peer).cloned().unwrap_or_default();
            pool.push(c);
        }
        let mut fallback: Vec<Identity> = self.connected.iter().copied().collect();
        fallback.sort_by_key(|p| xor_distance(p, &key));
        for peer in fallback.into_iter().take(MAX_FALLBACK_CANDIDATES) {
            pool.push(Candidate::unknown(peer, CandidateSource::Fallback));
        }
        for c in pool.iter_mut() {
            c.connected = self.connected.contains(&c.peer);
        }

        let mut excluded: HashSet<Identity> = state.children.keys().copied().collect();
        excluded.insert(local);
        for c in &pool {
            if state.in_cooldown(&c.peer) {
                excluded.insert(c.peer);
            }
        }
        let ranked = merge_candidates(pool, |p| excluded.contains(p));
        let picked = select_candidates(ranked, opts.scoring, opts.top_k, &opts.weights, opts.candidates, &mut self.rng);
        trace!(
            channel = %state.id.key_hex(),
            candidates = picked.len(),
            "selected join candidates"
        );
        Ok(picked)
    }

    /// Outcome of an attempt that needs no join request at all.
    fn attempt_shortcut(&mut self, key: &ChannelKey, peer: &Identity) -> FanoutResult<Option<AttemptOutcome>> {
        let state = self.channels.get_mut(key).ok_or(FanoutError::Cancelled)?;
        if state.is_attached() {
            return Ok(Some(AttemptOutcome::Accepted));
        }
        if *peer == self.local || state.children.contains_key(peer) || state.in_cooldown(peer) {
            return Ok(Some(AttemptOutcome::Skipped));
        }
        Ok(None)
    }

    fn plan_attempt(&mut self, key: ChannelKey, peer: Identity, mut addrs: Vec<Vec<u8>>) -> FanoutResult<AttemptPlan> {
        if let Some(outcome) = self.attempt_shortcut(&key, &peer)? {
            return Ok(AttemptPlan::Done(outcome));
        }
        if self.connected.contains(&peer) {
            return Ok(AttemptPlan::Ready);
        }
        if let Some(known) = self.known.get(&peer) {
            for a in known {
                if !addrs.contains(a) {
                    addrs.push(a.clone());
                }
            }
        }
        Ok(AttemptPlan::Dial(addrs))
    }

    fn attempt_join(
        &mut self,
        key: ChannelKey,
        candidate: Candidate,
        reply: oneshot::Sender<FanoutResult<AttemptOutcome>>,
    ) {
        match self.attempt_shortcut(&key, &candidate.peer) {
            Ok(None) => {}
            Ok(Some(outcome)) => {
                let _ = reply.send(Ok(outcome));
                return;
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        }
        let Some(state) = self.channels.get_mut(&key) else {
            let _ = reply.send(Err(FanoutError::Cancelled));
            return;
        };
        let bid = state.options.bid_per_byte;
        let attempt_timeout = state
            .join_options
            .as_ref()
            .map_or(DEFAULT_ATTEMPT_TIMEOUT, |j| j.join_timeout);
        let req_id: u32 = self.rng.gen();
        state.pending_joins.insert(
            req_id,
            PendingJoin {
                peer: candidate.peer,
                tracker: candidate.tracker,
                deadline: Instant::now() + attempt_timeout,
                reply,
            },
        );
        debug!(
            channel = %state.id.key_hex(),
            peer = %candidate.peer.short(),
            source = ?candidate.source,
            "sending join request"
        );
        let addrs = self.network.local_addrs();
        self.push(candidate.peer, &Message::JoinReq { key, req_id, bid_per_byte: bid, addrs });
    }

    /// Drop the parent and everything derived from it, kick our children
    /// and schedule a rejoin for channels joined through the join loop.
    fn detach(&mut self, key: ChannelKey, cause: &'static str) {
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        if state.is_root() {
            return;
        }
        let was_attached = state.is_attached();
        let old_parent = state.parent.take();
        state.route_from_root = None;
        state.level = DETACHED_LEVEL;
        state.last_parent_data = None;
        state.route_by_peer.clear();
        state.cancel_route_waiters(FanoutError::Cancelled);

        let children: Vec<Identity> = state.children.drain().map(|(id, _)| id).collect();
        let delay = match &state.join_options {
            Some(j) if !children.is_empty() => j.relay_rejoin_cooldown,
            _ => Duration::ZERO,
        };
        let rejoin = state.join_options.clone();
        info!(
            channel = %state.id.key_hex(),
            parent = ?old_parent.map(|p| p.short()),
            children = children.len(),
            cause,
            "detached from tree"
        );

        for child in children {
            self.push(child, &Message::Kick { key, reason: KickReason::ParentLost });
        }
        if was_attached {
            self.withdraw_announcement(key);
        }
        if let Some(opts) = rejoin {
            self.spawn_rejoin(key, opts, delay);
        }
    }

    fn spawn_rejoin(&mut self, key: ChannelKey, opts: JoinOptions, delay: Duration) {
        let local = self.local;
        let Some(cmd_tx) = self.cmd_tx.upgrade() else {
            return;
        };
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        if state.join_task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let handle = Fanout::from_sender(cmd_tx, local, Arc::clone(&self.network));
        state.join_task = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            handle.rejoin_loop(key, opts).await;
        }));
    }

    // ------------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------------

    fn handle_frame(&mut self, from: Identity, frame: Vec<u8>) {
        self.stats.frames_received += 1;
        let msg = match Message::decode(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                self.stats.malformed_frames += 1;
                debug!(from = %from.short(), error = %e, "dropping malformed frame");
                return;
            }
        };
        if let Some(state) = msg.channel_key().and_then(|k| self.channels.get_mut(k)) {
            state.metrics.record_received(msg.kind(), frame.len());
        }

        match msg {
            Message::JoinReq { key, req_id, bid_per_byte, addrs } => {
                self.on_join_req(from, key, req_id, bid_per_byte, addrs);
            }
            Message::JoinAccept { key, req_id, level, route } => {
                self.on_join_accept(from, key, req_id, level, route);
            }
            Message::JoinReject { key, req_id, reason, redirects } => {
                self.on_join_reject(from, key, req_id, reason, redirects);
            }
            Message::Kick { key, reason } => self.on_kick(from, key, reason),
            Message::Leave { key } => self.on_leave(from, key),
            Message::Data { msg_id, origin_ts, payload } => {
                self.on_data(from, msg_id, origin_ts, payload, &frame);
            }
            Message::End { key, end_seq_exclusive } => self.on_end(from, key, end_seq_exclusive),
            Message::ProxyPublish { key, payload } => self.on_proxy_publish(from, key, payload),
            Message::RepairReq { key, seqs } => self.on_repair_req(from, key, &seqs),
            Message::FetchReq { key, seqs } => self.on_fetch_req(from, key, &seqs),
            Message::IHave { key, have_from, have_to_exclusive } => {
                self.on_ihave(from, key, have_from, have_to_exclusive);
            }
            Message::TrackerAnnounce { key, ttl_secs, level, max_children, free_slots, bid_per_byte, addrs } => {
                let entry = TrackerEntry { level, max_children, free_slots, bid_per_byte, addrs };
                self.on_tracker_announce(from, key, ttl_secs, entry);
            }
            Message::TrackerQuery { key, req_id, want } => {
                let entries = if self.config.serve_tracker {
                    self.trackers.query(&key, &from, want, &mut self.rng)
                } else {
                    Vec::new()
                };
                self.push(from, &Message::TrackerReply { key, req_id, entries });
            }
            Message::TrackerReply { key, req_id, entries } => self.on_tracker_reply(from, key, req_id, entries),
            Message::TrackerFeedback { key, candidate, event } => {
                if self.config.serve_tracker {
                    self.trackers.feedback(&key, &candidate, event);
                }
            }
            Message::ProviderAnnounce { key, ttl_secs, addrs } => {
                if self.config.serve_tracker {
                    if !addrs.is_empty() {
                        self.known.put(from, addrs.clone());
                    }
                    self.providers.announce(key, from, addrs, Duration::from_secs(ttl_secs as u64));
                }
            }
            Message::ProviderQuery { key, req_id, want } => {
                let entries = if self.config.serve_tracker {
                    self.providers.query(&key, &from, want, &mut self.rng)
                } else {
                    Vec::new()
                };
                self.push(from, &Message::ProviderReply { key, req_id, entries });
            }
            Message::ProviderReply { key, req_id, entries } => self.on_provider_reply(from, key, req_id, entries),
            Message::RouteQuery { key, req_id, target } => self.on_route_query(from, key, req_id, target),
            Message::RouteReply { key, req_id, route } => self.on_route_reply(from, key, req_id, route),
            Message::Unicast { key, route, payload } => self.on_unicast(from, key, route, payload),
            Message::UnicastAck { key, token, route, reply_route, payload } => {
                self.on_unicast_ack(from, key, token, route, reply_route, payload);
            }
            Message::UnicastAckReply { key, token, route } => self.on_unicast_ack_reply(from, key, token, route),
        }
    }

    fn on_join_req(&mut self, from: Identity, key: ChannelKey, req_id: u32, bid: f64, addrs: Vec<Vec<u8>>) {
        if !addrs.is_empty() {
            self.known.put(from, addrs.clone());
        }
        let Some(state) = self.channels.get_mut(&key) else {
            let redirects = collect_redirects(None, &self.trackers, &self.known, &key, &from, &self.local);
            self.push(
                from,
                &Message::JoinReject { key, req_id, reason: RejectReason::NotAttached, redirects },
            );
            return;
        };

        let route = state.route_from_root.clone().unwrap_or_default();
        let ctx = AdmissionContext {
            attached: state.is_attached(),
            route: &route,
            capacity: state.effective_max_children(),
            allow_kick: state.options.allow_kick,
        };
        let decision = decide_admission(&from, bid, ctx, &state.children);

        let victim = match decision {
            AdmissionDecision::Reject(reason) => {
                state.metrics.joins_rejected += 1;
                let redirects = collect_redirects(Some(&state.children), &self.trackers, &self.known, &key, &from, &self.local);
                debug!(
                    channel = %state.id.key_hex(),
                    peer = %from.short(),
                    reason = %reason,
                    "rejecting join"
                );
                self.push(from, &Message::JoinReject { key, req_id, reason, redirects });
                return;
            }
            AdmissionDecision::AcceptEvicting(victim) => Some(victim),
            AdmissionDecision::Accept => None,
        };

        if let Some(victim) = victim {
            state.children.remove(&victim);
            state.metrics.evictions_outbid += 1;
            info!(
                channel = %state.id.key_hex(),
                evicted = %victim.short(),
                by = %from.short(),
                "child outbid"
            );
            self.outbox.push(Outgoing::control(victim, &Message::Kick { key, reason: KickReason::Outbid }));
        }

        match state.children.get_mut(&from) {
            Some(child) => {
                child.bid_per_byte = bid;
                child.addrs = addrs;
            }
            None => {
                let child = ChildInfo::new(bid, addrs, &state.options);
                state.children.insert(from, child);
                debug!(
                    channel = %state.id.key_hex(),
                    child = %from.short(),
                    children = state.children.len(),
                    "accepted child"
                );
            }
        }
        state.lazy_peers.remove(&from);
        state.peer_hints.insert(from, ());
        state.metrics.joins_accepted += 1;

        let level = state.level;
        let horizon = state.cache.range();
        self.outbox.push(Outgoing::control(from, &Message::JoinAccept { key, req_id, level, route }));
        if let Some((have_from, have_to_exclusive)) = horizon {
            self.push(from, &Message::IHave { key, have_from, have_to_exclusive });
        }
    }

    fn on_join_accept(&mut self, from: Identity, key: ChannelKey, req_id: u32, level: u16, route: Vec<Identity>) {
        let local = self.local;
        let Some(state) = self.channels.get_mut(&key) else {
            self.push(from, &Message::Leave { key });
            return;
        };

        let pending = match state.pending_joins.remove(&req_id) {
            Some(p) if p.peer == from => Some(p),
            Some(p) => {
                state.pending_joins.insert(req_id, p);
                None
            }
            None => None,
        };
        let Some(pending) = pending else {
            if state.parent == Some(from) {
                if let Some(new_route) = route_after_accept(&route, &state.id.root, &from, &local) {
                    state.route_from_root = Some(new_route);
                    state.level = level.saturating_add(1).min(DETACHED_LEVEL - 1);
                }
            } else {
                self.push(from, &Message::Leave { key });
            }
            return;
        };

        if state.is_attached() {
            debug!(channel = %state.id.key_hex(), peer = %from.short(), "late accept while attached");
            let _ = pending.reply.send(Ok(AttemptOutcome::Accepted));
            self.push(from, &Message::Leave { key });
            return;
        }

        let Some(new_route) = route_after_accept(&route, &state.id.root, &from, &local) else {
            warn!(channel = %state.id.key_hex(), peer = %from.short(), "accept carried an invalid route");
            let tracker = pending.tracker;
            let _ = pending
                .reply
                .send(Ok(AttemptOutcome::Rejected(RejectReason::NotAttached, Vec::new())));
            self.push(from, &Message::Leave { key });
            self.record_attempt_failure(key, from, tracker, FeedbackEvent::JoinReject(RejectReason::NotAttached));
            return;
        };

        let level = level.saturating_add(1).min(DETACHED_LEVEL - 1);
        state.parent = Some(from);
        state.level = level;
        state.route_from_root = Some(new_route);
        state.last_parent_data = Some(Instant::now());
        state.lazy_peers.remove(&from);
        state.have_by_peer.pop(&from);
        state.peer_hints.insert(from, ());
        state.cooldowns.pop(&from);

        let waiters = std::mem::take(&mut state.attach_waiters);
        let channel = state.id.clone();
        info!(
            channel = %channel.key_hex(),
            parent = %from.short(),
            level,
            "joined channel"
        );
        for waiter in waiters {
            self.outbox.push(Outgoing::control(from, &Message::ProxyPublish { key, payload: waiter.payload }));
            let _ = waiter.reply.send(Ok(None));
        }
        self.emit(FanoutEvent::Joined { channel, parent: from, level });
        let _ = pending.reply.send(Ok(AttemptOutcome::Accepted));
        self.send_feedback(key, from, pending.tracker, FeedbackEvent::Joined);
        self.announce_channel(key);
    }

    fn on_join_reject(
        &mut self,
        from: Identity,
        key: ChannelKey,
        req_id: u32,
        reason: RejectReason,
        redirects: Vec<PeerAddrs>,
    ) {
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        let pending = match state.pending_joins.remove(&req_id) {
            Some(p) if p.peer == from => p,
            Some(p) => {
                state.pending_joins.insert(req_id, p);
                return;
            }
            None => return,
        };
        for r in &redirects {
            if r.peer == self.local {
                continue;
            }
            state.peer_hints.insert(r.peer, ());
            if !r.addrs.is_empty() {
                self.known.put(r.peer, r.addrs.clone());
            }
        }
        let _ = pending.reply.send(Ok(AttemptOutcome::Rejected(reason, redirects)));
        self.record_attempt_failure(key, from, pending.tracker, FeedbackEvent::JoinReject(reason));
    }

    fn on_kick(&mut self, from: Identity, key: ChannelKey, reason: KickReason) {
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        if state.parent != Some(from) {
            trace!(channel = %state.id.key_hex(), from = %from.short(), "ignoring kick from non-parent");
            return;
        }
        let opts = state.join_options.clone().unwrap_or_default();
        let cooldown = match reason {
            KickReason::Outbid => cooldown_for(FeedbackEvent::JoinReject(RejectReason::LowBid), &opts),
            _ => opts.cooldown,
        };
        state.set_cooldown(from, cooldown);
        let channel = state.id.clone();
        warn!(channel = %channel.key_hex(), parent = %from.short(), reason = ?reason, "kicked by parent");
        self.emit(FanoutEvent::Kicked { channel, by: from, reason });
        self.detach(key, "kicked");
    }

    fn on_leave(&mut self, from: Identity, key: ChannelKey) {
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        if state.children.remove(&from).is_some() {
            debug!(channel = %state.id.key_hex(), child = %from.short(), "child left");
        }
        state.lazy_peers.remove(&from);
        state.have_by_peer.pop(&from);
    }

    fn on_data(&mut self, from: Identity, msg_id: MessageId, origin_ts: u64, payload: Vec<u8>, frame: &[u8]) {
        let Some((seq, suffix)) = parse_message_id(&msg_id) else {
            self.stats.malformed_frames += 1;
            return;
        };
        let Some(key) = self.by_suffix.get(&suffix).copied() else {
            self.stats.unknown_channel_frames += 1;
            return;
        };
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        state.metrics.record_received(MessageKind::Data, frame.len());
        if state.is_root() {
            return;
        }

        let from_parent = state.parent == Some(from);
        if !from_parent && !state.lazy_peers.contains(&from) && !state.have_by_peer.contains(&from) {
            state.metrics.dropped_unexpected_sender += 1;
            return;
        }
        if from_parent {
            state.last_parent_data = Some(Instant::now());
            state.received_any = true;
        }
        if state.gaps.end_seq_exclusive().is_some_and(|end| seq >= end) {
            state.metrics.dropped_stale += 1;
            return;
        }

        let observed = state.gaps.observe(seq);
        if observed == Observed::Duplicate {
            state.metrics.dropped_duplicate += 1;
            return;
        }
        let max_age = state.options.max_data_age;
        if !max_age.is_zero() && now_ms().saturating_sub(origin_ts) > max_age.as_millis() as u64 {
            state.metrics.dropped_stale += 1;
            trace!(channel = %state.id.key_hex(), seq, "dropping stale data");
            return;
        }
        if observed == Observed::Repaired {
            state.metrics.repaired += 1;
        }
        if !from_parent {
            if let Some(have) = state.have_by_peer.get_mut(&from) {
                have.successes += 1;
            }
        }

        state.cache.insert(seq, origin_ts, payload.clone());
        state.metrics.delivered += 1;
        fanout_frame(state, frame, &mut self.outbox);

        let channel = state.id.clone();
        trace!(channel = %channel.key_hex(), seq, from = %from.short(), "delivering data");
        self.emit(FanoutEvent::Data { channel, seq, origin_ts, payload, from });
    }

    fn on_end(&mut self, from: Identity, key: ChannelKey, end: u32) {
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        if state.parent != Some(from) || state.gaps.end_seq_exclusive() == Some(end) {
            return;
        }
        state.gaps.mark_end(end);
        let children: Vec<Identity> = state.children.keys().copied().collect();
        let channel = state.id.clone();
        info!(channel = %channel.key_hex(), end, "stream ended");
        let msg = Message::End { key, end_seq_exclusive: end };
        for child in children {
            self.push(child, &msg);
        }
        self.emit(FanoutEvent::Ended { channel, end_seq_exclusive: end });
    }

    fn on_proxy_publish(&mut self, from: Identity, key: ChannelKey, payload: Vec<u8>) {
        let max_payload = self.config.max_payload_size;
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        let Some(child) = state.children.get_mut(&from) else {
            state.metrics.dropped_unexpected_sender += 1;
            return;
        };
        if !child.proxy_ingress.try_consume_one() {
            state.metrics.dropped_rate_limited += 1;
            trace!(channel = %state.id.key_hex(), child = %from.short(), "proxy publish rate limited");
            return;
        }
        if payload.len() > max_payload {
            return;
        }
        if state.is_root() {
            self.root_publish(key, payload);
        } else if let Some(parent) = state.parent {
            self.push(parent, &Message::ProxyPublish { key, payload });
        }
    }

    fn on_repair_req(&mut self, from: Identity, key: ChannelKey, seqs: &[u32]) {
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        if !state.children.contains_key(&from) {
            state.metrics.dropped_unexpected_sender += 1;
            return;
        }
        for &seq in seqs {
            match data_frame(state, seq) {
                Some(frame) => {
                    state.metrics.cache_hits += 1;
                    self.outbox.push(Outgoing::data(from, key, frame, false));
                }
                None => state.metrics.cache_misses += 1,
            }
        }
    }

    fn on_fetch_req(&mut self, from: Identity, key: ChannelKey, seqs: &[u32]) {
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        for &seq in seqs {
            let Some(frame) = data_frame(state, seq) else {
                state.metrics.cache_misses += 1;
                continue;
            };
            if let Some(bucket) = state.neighbor_egress.as_mut() {
                if !bucket.try_consume(frame.len() as f64) {
                    state.metrics.dropped_rate_limited += 1;
                    break;
                }
            }
            state.metrics.cache_hits += 1;
            self.outbox.push(Outgoing::data(from, key, frame, false));
        }
    }

    fn on_ihave(&mut self, from: Identity, key: ChannelKey, have_from: u32, have_to_exclusive: u32) {
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        if state.parent == Some(from) {
            state.gaps.observe_horizon(have_to_exclusive);
            return;
        }
        if !state.options.neighbor_repair.enabled || state.children.contains_key(&from) {
            return;
        }
        let have = state.have_by_peer.get_or_insert_mut(from, NeighborHave::default);
        have.have_from = have_from;
        have.have_to_exclusive = have_to_exclusive;
        state.peer_hints.insert(from, ());
        if state.is_attached()
            && !state.lazy_peers.contains(&from)
            && state.lazy_peers.len() < state.options.neighbor_repair.mesh_peers
        {
            state.lazy_peers.insert(from);
        }
    }

    fn on_tracker_announce(&mut self, from: Identity, key: ChannelKey, ttl_secs: u16, entry: TrackerEntry) {
        if !entry.addrs.is_empty() {
            self.known.put(from, entry.addrs.clone());
        }
        if let Some(state) = self.channels.get_mut(&key) {
            if ttl_secs > 0 {
                state.peer_hints.insert(from, ());
            }
        }
        if self.config.serve_tracker {
            self.trackers.announce(key, from, entry, Duration::from_secs(ttl_secs as u64));
        }
    }

    fn on_tracker_reply(&mut self, from: Identity, key: ChannelKey, req_id: u32, entries: Vec<TrackerRecord>) {
        let Some(query) = self.tracker_queries.get_mut(&req_id) else {
            return;
        };
        if query.key != key || !query.outstanding.remove(&from) {
            return;
        }
        for record in entries {
            if record.peer == self.local {
                continue;
            }
            if !record.addrs.is_empty() {
                self.known.put(record.peer, record.addrs.clone());
            }
            if let Some(state) = self.channels.get_mut(&key) {
                state.peer_hints.insert(record.peer, ());
            }
            query.results.push(record_to_candidate(record, from));
        }
        if query.outstanding.is_empty() {
            if let Some(query) = self.tracker_queries.remove(&req_id) {
                let _ = query.reply.send(query.results);
            }
        }
    }

    fn on_provider_reply(&mut self, from: Identity, key: ChannelKey, req_id: u32, entries: Vec<PeerAddrs>) {
        let Some(query) = self.provider_queries.get_mut(&req_id) else {
            return;
        };
        if query.key != key || !query.outstanding.remove(&from) {
            return;
        }
        for entry in entries {
            if entry.peer == self.local {
                continue;
            }
            if !entry.addrs.is_empty() {
                self.known.put(entry.peer, entry.addrs.clone());
            }
            query.results.push(entry);
        }
        if query.outstanding.is_empty() {
            if let Some(query) = self.provider_queries.remove(&req_id) {
                let _ = query.reply.send(dedup_providers(query.results));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Route resolution
    // ------------------------------------------------------------------------

    fn resolve_route(&mut self, key: ChannelKey, target: Identity, reply: oneshot::Sender<FanoutResult<RouteToken>>) {
        let local = self.local;
        let deadline = Instant::now() + self.config.route_query_timeout;
        let Some(state) = self.channels.get_mut(&key) else {
            let _ = reply.send(Err(FanoutError::ChannelNotFound));
            return;
        };
        let Some(own) = state.route_from_root.clone() else {
            let _ = reply.send(Err(FanoutError::NotAttached));
            return;
        };
        if target == local {
            let _ = reply.send(RouteToken::new(own));
            return;
        }
        if let Some(route) = cached_route(state, &target) {
            state.metrics.route_cache_hits += 1;
            let _ = reply.send(RouteToken::new(route));
            return;
        }
        state.metrics.route_cache_misses += 1;

        if state.children.contains_key(&target) {
            let mut route = own;
            route.push(target);
            state.route_by_peer.insert(target, route.clone());
            let _ = reply.send(RouteToken::new(route));
            return;
        }

        let req_id: u32 = self.rng.gen();
        let msg = Message::RouteQuery { key, req_id, target };
        if state.is_root() {
            if state.children.is_empty() {
                let _ = reply.send(Err(FanoutError::RouteNotFound));
                return;
            }
            let outstanding: HashSet<Identity> = state.children.keys().copied().collect();
            for child in &outstanding {
                self.outbox.push(Outgoing::control(*child, &msg));
            }
            state.route_fanouts.insert(
                req_id,
                PendingRouteFanout { target, requester: RouteRequester::Local(reply), outstanding, deadline },
            );
        } else if let Some(parent) = state.parent {
            state.route_queries.insert(req_id, PendingRouteQuery { target, deadline, reply });
            self.outbox.push(Outgoing::control(parent, &msg));
        } else {
            let _ = reply.send(Err(FanoutError::NotAttached));
        }
    }

    fn on_route_query(&mut self, from: Identity, key: ChannelKey, req_id: u32, target: Identity) {
        let local = self.local;
        let deadline = Instant::now() + self.config.route_query_timeout;
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        let from_child = state.children.contains_key(&from);
        let from_parent = state.parent == Some(from);
        if !from_child && !from_parent {
            state.metrics.dropped_unexpected_sender += 1;
            return;
        }
        let Some(own) = state.route_from_root.clone() else {
            self.push(from, &Message::RouteReply { key, req_id, route: None });
            return;
        };

        let direct = if target == local {
            Some(own.clone())
        } else if state.children.contains_key(&target) {
            let mut route = own.clone();
            route.push(target);
            Some(route)
        } else if from_child {
            let cached = cached_route(state, &target);
            if cached.is_some() {
                state.metrics.route_cache_hits += 1;
            }
            cached
        } else {
            None
        };
        if let Some(route) = direct {
            self.push(from, &Message::RouteReply { key, req_id, route: Some(route) });
            return;
        }

        if from_child && !state.is_root() {
            let Some(parent) = state.parent else {
                self.push(from, &Message::RouteReply { key, req_id, route: None });
                return;
            };
            let proxy_id: u32 = self.rng.gen();
            state.route_proxies.insert(
                proxy_id,
                RouteProxy { child: from, child_req_id: req_id, target, deadline },
            );
            self.outbox.push(Outgoing::control(parent, &Message::RouteQuery { key, req_id: proxy_id, target }));
            return;
        }

        // Search our subtree: the root on behalf of a child, or a member on
        // behalf of its parent.
        if state.children.is_empty() {
            self.push(from, &Message::RouteReply { key, req_id, route: None });
            return;
        }
        let requester = if from_child {
            RouteRequester::Child { peer: from, req_id }
        } else {
            RouteRequester::Parent { peer: from, req_id }
        };
        let fanout_id: u32 = self.rng.gen();
        let outstanding: HashSet<Identity> = state.children.keys().copied().collect();
        let msg = Message::RouteQuery { key, req_id: fanout_id, target };
        for child in &outstanding {
            self.outbox.push(Outgoing::control(*child, &msg));
        }
        state.route_fanouts.insert(fanout_id, PendingRouteFanout { target, requester, outstanding, deadline });
    }

    fn on_route_reply(&mut self, from: Identity, key: ChannelKey, req_id: u32, route: Option<Vec<Identity>>) {
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        let root = state.id.root;

        if state.parent == Some(from) {
            if let Some(query) = state.route_queries.remove(&req_id) {
                let result = match route.filter(|r| is_valid_route(r, &root, &query.target)) {
                    Some(r) => {
                        state.route_by_peer.insert(query.target, r.clone());
                        RouteToken::new(r)
                    }
                    None => Err(FanoutError::RouteNotFound),
                };
                let _ = query.reply.send(result);
                return;
            }
            if let Some(proxy) = state.route_proxies.remove(&req_id) {
                let route = route.filter(|r| is_valid_route(r, &root, &proxy.target));
                if let Some(r) = &route {
                    state.route_by_peer.insert(proxy.target, r.clone());
                }
                self.outbox.push(Outgoing::control(
                    proxy.child,
                    &Message::RouteReply { key, req_id: proxy.child_req_id, route },
                ));
                return;
            }
        }

        let Some(fanout) = state.route_fanouts.get_mut(&req_id) else {
            return;
        };
        if !fanout.outstanding.remove(&from) {
            return;
        }
        let found = route.filter(|r| is_valid_route(r, &root, &fanout.target));
        if found.is_none() && !fanout.outstanding.is_empty() {
            return;
        }
        if let Some(fanout) = state.route_fanouts.remove(&req_id) {
            if let Some(r) = &found {
                state.route_by_peer.insert(fanout.target, r.clone());
            }
            finish_route_fanout(fanout.requester, key, found, &mut self.outbox);
        }
    }

    // ------------------------------------------------------------------------
    // Unicast
    // ------------------------------------------------------------------------

    /// Move a routed frame one step: up towards the root when it comes from
    /// below (or from us, off-root), down along `route` otherwise.
    fn relay_along_route(&mut self, from: Identity, key: ChannelKey, route: &[Identity], msg: &Message) -> RouteStep {
        let local = self.local;
        let Some(state) = self.channels.get_mut(&key) else {
            return RouteStep::Dropped;
        };
        let local_origin = from == local;
        let from_parent = state.parent == Some(from);
        let from_child = match state.children.get_mut(&from) {
            Some(child) => {
                if !child.unicast_ingress.try_consume_one() {
                    state.metrics.dropped_rate_limited += 1;
                    return RouteStep::Dropped;
                }
                true
            }
            None => false,
        };
        if !from_child && !from_parent && !local_origin {
            state.metrics.dropped_unexpected_sender += 1;
            return RouteStep::Dropped;
        }

        if (from_child || local_origin) && !state.is_root() {
            return match state.parent {
                Some(parent) => {
                    self.outbox.push(Outgoing::control(parent, msg));
                    RouteStep::Sent
                }
                None => RouteStep::Dropped,
            };
        }
        if route.first() != Some(&state.id.root) {
            state.metrics.dropped_unexpected_sender += 1;
            return RouteStep::Dropped;
        }
        match next_hop_down(route, &local) {
            NextHop::Deliver => RouteStep::Deliver,
            NextHop::Down(next) if state.children.contains_key(&next) => {
                self.outbox.push(Outgoing::control(next, msg));
                RouteStep::Sent
            }
            _ => {
                trace!(channel = %state.id.key_hex(), "unicast next hop is not a child");
                RouteStep::Dropped
            }
        }
    }

    fn check_unicast(&self, key: &ChannelKey, route: &RouteToken, payload: &[u8]) -> FanoutResult<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(FanoutError::PayloadTooLarge { size: payload.len(), max: self.config.max_payload_size });
        }
        let state = self.channels.get(key).ok_or(FanoutError::ChannelNotFound)?;
        if !state.is_attached() {
            return Err(FanoutError::NotAttached);
        }
        if route.root() != &state.id.root {
            return Err(FanoutError::InvalidRouteToken("route does not start at the channel root".into()));
        }
        Ok(())
    }

    fn channel_id(&self, key: &ChannelKey) -> Option<ChannelId> {
        self.channels.get(key).map(|s| s.id.clone())
    }

    fn unicast(&mut self, key: ChannelKey, route: RouteToken, payload: Vec<u8>) -> FanoutResult<()> {
        self.check_unicast(&key, &route, &payload)?;
        let msg = Message::Unicast { key, route: route.hops().to_vec(), payload };
        match self.relay_along_route(self.local, key, route.hops(), &msg) {
            RouteStep::Sent => Ok(()),
            RouteStep::Deliver => {
                if let (Some(channel), Message::Unicast { payload, .. }) = (self.channel_id(&key), msg) {
                    self.emit(FanoutEvent::Unicast { channel, route, payload, ack_token: None, reply_route: None });
                }
                Ok(())
            }
            RouteStep::Dropped => Err(FanoutError::RouteNotFound),
        }
    }

    fn unicast_ack(
        &mut self,
        key: ChannelKey,
        route: RouteToken,
        payload: Vec<u8>,
        reply: oneshot::Sender<FanoutResult<()>>,
    ) {
        if let Err(e) = self.check_unicast(&key, &route, &payload) {
            let _ = reply.send(Err(e));
            return;
        }
        let Some(reply_route) = self.channels.get(&key).and_then(|s| s.route_from_root.clone()) else {
            let _ = reply.send(Err(FanoutError::NotAttached));
            return;
        };
        let token: u64 = self.rng.gen();
        let msg = Message::UnicastAck {
            key,
            token,
            route: route.hops().to_vec(),
            reply_route,
            payload,
        };
        match self.relay_along_route(self.local, key, route.hops(), &msg) {
            RouteStep::Sent => {
                let deadline = Instant::now() + self.config.unicast_ack_timeout;
                if let Some(state) = self.channels.get_mut(&key) {
                    state.pending_acks.insert(token, PendingAck { deadline, reply });
                }
            }
            RouteStep::Deliver => {
                if let (Some(channel), Message::UnicastAck { payload, reply_route, .. }) = (self.channel_id(&key), msg) {
                    let reply_route = RouteToken::new(reply_route).ok();
                    self.emit(FanoutEvent::Unicast { channel, route, payload, ack_token: Some(token), reply_route });
                }
                let _ = reply.send(Ok(()));
            }
            RouteStep::Dropped => {
                let _ = reply.send(Err(FanoutError::RouteNotFound));
            }
        }
    }

    fn on_unicast(&mut self, from: Identity, key: ChannelKey, route: Vec<Identity>, payload: Vec<u8>) {
        let msg = Message::Unicast { key, route: route.clone(), payload };
        if !matches!(self.relay_along_route(from, key, &route, &msg), RouteStep::Deliver) {
            return;
        }
        let Message::Unicast { payload, .. } = msg else {
            return;
        };
        let (Some(channel), Ok(route)) = (self.channel_id(&key), RouteToken::new(route)) else {
            return;
        };
        trace!(channel = %channel.key_hex(), "unicast delivered");
        self.emit(FanoutEvent::Unicast { channel, route, payload, ack_token: None, reply_route: None });
    }

    fn on_unicast_ack(
        &mut self,
        from: Identity,
        key: ChannelKey,
        token: u64,
        route: Vec<Identity>,
        reply_route: Vec<Identity>,
        payload: Vec<u8>,
    ) {
        let hops = route.clone();
        let msg = Message::UnicastAck { key, token, route, reply_route, payload };
        if !matches!(self.relay_along_route(from, key, &hops, &msg), RouteStep::Deliver) {
            return;
        }
        let Message::UnicastAck { reply_route, payload, .. } = msg else {
            return;
        };
        let Some(channel) = self.channel_id(&key) else {
            return;
        };
        if let Ok(route) = RouteToken::new(hops) {
            let reply_token = RouteToken::new(reply_route.clone()).ok();
            self.emit(FanoutEvent::Unicast {
                channel,
                route,
                payload,
                ack_token: Some(token),
                reply_route: reply_token,
            });
        }
        let ack = Message::UnicastAckReply { key, token, route: reply_route.clone() };
        let local = self.local;
        if let RouteStep::Deliver = self.relay_along_route(local, key, &reply_route, &ack) {
            self.resolve_ack(key, token);
        }
    }

    fn on_unicast_ack_reply(&mut self, from: Identity, key: ChannelKey, token: u64, route: Vec<Identity>) {
        let msg = Message::UnicastAckReply { key, token, route: route.clone() };
        if let RouteStep::Deliver = self.relay_along_route(from, key, &route, &msg) {
            self.resolve_ack(key, token);
        }
    }

    fn resolve_ack(&mut self, key: ChannelKey, token: u64) {
        if let Some(ack) = self.channels.get_mut(&key).and_then(|s| s.pending_acks.remove(&token)) {
            let _ = ack.reply.send(Ok(()));
        }
    }

    // ------------------------------------------------------------------------
    // Periodic maintenance
    // ------------------------------------------------------------------------

    async fn tick(&mut self) {
        let now = Instant::now();
        self.expire_queries(now);

        let keys: Vec<ChannelKey> = self.channels.keys().copied().collect();
        for key in keys {
            self.expire_channel_requests(key, now);
            self.maybe_announce(key, now);
            self.maybe_repair(key, now);
            self.maybe_refresh_mesh(key, now);
            self.check_staleness(key, now);
        }

        if now.duration_since(self.last_maintenance) >= MAINTENANCE_INTERVAL {
            self.last_maintenance = now;
            self.trackers.prune();
            self.providers.prune();
            for state in self.channels.values_mut() {
                state.route_by_peer.prune_expired();
                state.peer_hints.prune_expired();
                state.gaps.prune();
            }
            self.connected = self.network.peers().await.into_iter().collect();
        }
    }

    fn expire_queries(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .tracker_queries
            .iter()
            .filter(|(_, q)| q.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(q) = self.tracker_queries.remove(&id) {
                trace!(pending = q.outstanding.len(), "tracker query timed out");
                let _ = q.reply.send(q.results);
            }
        }
        let expired: Vec<u32> = self
            .provider_queries
            .iter()
            .filter(|(_, q)| q.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(q) = self.provider_queries.remove(&id) {
                let _ = q.reply.send(dedup_providers(q.results));
            }
        }
    }

    fn expire_channel_requests(&mut self, key: ChannelKey, now: Instant) {
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };

        let expired: Vec<u32> = state
            .pending_joins
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let timed_out: Vec<PendingJoin> = expired
            .into_iter()
            .filter_map(|id| state.pending_joins.remove(&id))
            .collect();

        let expired: Vec<u32> = state
            .route_queries
            .iter()
            .filter(|(_, q)| q.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(q) = state.route_queries.remove(&id) {
                let _ = q.reply.send(Err(FanoutError::Timeout("route query")));
            }
        }

        let expired: Vec<u32> = state
            .route_proxies
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(p) = state.route_proxies.remove(&id) {
                self.outbox.push(Outgoing::control(
                    p.child,
                    &Message::RouteReply { key, req_id: p.child_req_id, route: None },
                ));
            }
        }

        let expired: Vec<u32> = state
            .route_fanouts
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(f) = state.route_fanouts.remove(&id) {
                finish_route_fanout(f.requester, key, None, &mut self.outbox);
            }
        }

        let expired: Vec<u64> = state
            .pending_acks
            .iter()
            .filter(|(_, a)| a.deadline <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(ack) = state.pending_acks.remove(&token) {
                let _ = ack.reply.send(Err(FanoutError::Timeout("unicast ack")));
            }
        }

        if state.attach_waiters.iter().any(|w| w.deadline <= now) {
            let (expired, waiting): (Vec<AttachWaiter>, Vec<AttachWaiter>) =
                std::mem::take(&mut state.attach_waiters).into_iter().partition(|w| w.deadline <= now);
            state.attach_waiters = waiting;
            for waiter in expired {
                let _ = waiter.reply.send(Err(FanoutError::NotAttached));
            }
        }

        for join in timed_out {
            debug!(peer = %join.peer.short(), "join attempt timed out");
            let _ = join.reply.send(Ok(AttemptOutcome::TimedOut));
            self.record_attempt_failure(key, join.peer, join.tracker, FeedbackEvent::JoinTimeout);
        }
    }

    fn maybe_announce(&mut self, key: ChannelKey, now: Instant) {
        let due = self.channels.get(&key).is_some_and(|s| {
            s.is_attached()
                && s.last_announce
                    .map_or(true, |last| now.duration_since(last) >= s.options.announce_interval)
        });
        if due {
            self.announce_channel(key);
        }
    }

    fn maybe_repair(&mut self, key: ChannelKey, now: Instant) {
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        if state.is_root() || !state.options.repair.enabled {
            return;
        }
        if now.duration_since(state.last_repair) < state.options.repair.interval {
            return;
        }
        state.last_repair = now;
        if state.gaps.missing_len() == 0 {
            return;
        }
        let max_per_req = state.options.repair.max_per_req.min(crate::messages::MAX_LIST_ENTRIES);

        if let Some(parent) = state.parent {
            let seqs = state.gaps.next_request(max_per_req);
            trace!(channel = %state.id.key_hex(), count = seqs.len(), "requesting repair from parent");
            state.metrics.repair_requests_sent += 1;
            self.outbox.push(Outgoing::control(parent, &Message::RepairReq { key, seqs }));
        }

        if !state.options.neighbor_repair.enabled {
            return;
        }
        let parent = state.parent;
        let plan = plan_neighbor_fetch(
            state.gaps.missing(),
            state.have_by_peer.iter().filter(|(peer, _)| Some(**peer) != parent),
            state.options.neighbor_repair.peers,
            max_per_req,
        );
        for (peer, seqs) in plan {
            let msg = Message::FetchReq { key, seqs };
            let out = Outgoing::control(peer, &msg);
            if let Some(bucket) = state.neighbor_egress.as_mut() {
                if !bucket.try_consume(out.frame.len() as f64) {
                    state.metrics.dropped_rate_limited += 1;
                    break;
                }
            }
            if let Some(have) = state.have_by_peer.get_mut(&peer) {
                have.requests += 1;
            }
            state.metrics.fetch_requests_sent += 1;
            self.outbox.push(out);
        }
    }

    /// Keep up to `mesh_peers` lazy neighbors and advertise our cached range
    /// to them.
    fn maybe_refresh_mesh(&mut self, key: ChannelKey, now: Instant) {
        let local = self.local;
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        let opts = &state.options.neighbor_repair;
        if !opts.enabled || state.is_root() || !state.is_attached() {
            return;
        }
        if state.last_mesh.is_some_and(|last| now.duration_since(last) < opts.announce_interval) {
            return;
        }
        state.last_mesh = Some(now);
        let mesh_peers = opts.mesh_peers;

        let parent = state.parent;
        let connected = &self.connected;
        state
            .lazy_peers
            .retain(|p| connected.contains(p) && Some(*p) != parent && !state.children.contains_key(p));

        if state.lazy_peers.len() < mesh_peers {
            let mut fresh: Vec<Identity> = state
                .peer_hints
                .iter()
                .map(|(p, _)| *p)
                .filter(|p| {
                    *p != local
                        && connected.contains(p)
                        && Some(*p) != parent
                        && !state.children.contains_key(p)
                        && !state.lazy_peers.contains(p)
                })
                .collect();
            fresh.shuffle(&mut self.rng);
            let room = mesh_peers - state.lazy_peers.len();
            state.lazy_peers.extend(fresh.into_iter().take(room));
        }

        if let Some((have_from, have_to_exclusive)) = state.cache.range() {
            let msg = Message::IHave { key, have_from, have_to_exclusive };
            for peer in &state.lazy_peers {
                self.outbox.push(Outgoing::control(*peer, &msg));
            }
        }
    }

    /// A parent that has gone silent while we still expect data is
    /// abandoned.
    fn check_staleness(&mut self, key: ChannelKey, now: Instant) {
        let Some(state) = self.channels.get_mut(&key) else {
            return;
        };
        let Some(stale_after) = state.join_options.as_ref().and_then(|j| j.stale_after) else {
            return;
        };
        let Some(parent) = state.parent else {
            return;
        };
        let expecting = state.gaps.missing_len() > 0
            || (!state.options.max_data_age.is_zero() && state.received_any);
        let silent = state
            .last_parent_data
            .map_or(true, |t| now.duration_since(t) >= stale_after);
        if !expecting || !silent {
            return;
        }
        let cooldown = state.join_options.as_ref().map_or(Duration::ZERO, |j| j.cooldown);
        state.set_cooldown(parent, cooldown);
        warn!(channel = %state.id.key_hex(), parent = %parent.short(), "parent went stale");
        self.push(parent, &Message::Leave { key });
        self.detach(key, "stale parent");
    }

    fn neighbor_down(&mut self, peer: Identity) {
        trace!(peer = %peer.short(), "neighbor down");
        self.connected.remove(&peer);

        let keys: Vec<ChannelKey> = self.channels.keys().copied().collect();
        for key in keys {
            let Some(state) = self.channels.get_mut(&key) else {
                continue;
            };
            state.lazy_peers.remove(&peer);
            state.have_by_peer.pop(&peer);
            if state.children.remove(&peer).is_some() {
                debug!(channel = %state.id.key_hex(), child = %peer.short(), "child disconnected");
            }
            state.route_proxies.retain(|_, p| p.child != peer);

            let finished: Vec<u32> = state
                .route_fanouts
                .iter_mut()
                .filter_map(|(id, f)| (f.outstanding.remove(&peer) && f.outstanding.is_empty()).then_some(*id))
                .collect();
            for id in finished {
                if let Some(f) = state.route_fanouts.remove(&id) {
                    finish_route_fanout(f.requester, key, None, &mut self.outbox);
                }
            }

            if state.parent == Some(peer) {
                self.detach(key, "parent disconnected");
            }
        }

        let done: Vec<u32> = self
            .tracker_queries
            .iter_mut()
            .filter_map(|(id, q)| (q.outstanding.remove(&peer) && q.outstanding.is_empty()).then_some(*id))
            .collect();
        for id in done {
            if let Some(q) = self.tracker_queries.remove(&id) {
                let _ = q.reply.send(q.results);
            }
        }
        let done: Vec<u32> = self
            .provider_queries
            .iter_mut()
            .filter_map(|(id, q)| (q.outstanding.remove(&peer) && q.outstanding.is_empty()).then_some(*id))
            .collect();
        for id in done {
            if let Some(q) = self.provider_queries.remove(&id) {
                let _ = q.reply.send(dedup_providers(q.results));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingRpc {
        local: Identity,
        peers: Vec<Identity>,
        sent: Mutex<Vec<(Identity, Vec<u8>)>>,
    }

    impl RecordingRpc {
        fn new(local: Identity, peers: Vec<Identity>) -> Arc<Self> {
            Arc::new(Self { local, peers, sent: Mutex::new(Vec::new()) })
        }

        fn sent(&self) -> Vec<(Identity, Message)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(peer, frame)| (*peer, Message::decode(frame).unwrap()))
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl FanoutRpc for RecordingRpc {
        fn local_identity(&self) -> Identity {
            self.local
        }

        fn local_addrs(&self) -> Vec<Vec<u8>> {
            vec![b"rec://local".to_vec()]
        }

        async fn send_to_peer(&self, peer: &Identity, frame: Vec<u8>, _priority: crate::messages::Priority) -> anyhow::Result<bool> {
            self.sent.lock().unwrap().push((*peer, frame));
            Ok(true)
        }

        async fn peers(&self) -> Vec<Identity> {
            self.peers.clone()
        }

        async fn dial(&self, _addr: &[u8]) -> anyhow::Result<Identity> {
            anyhow::bail!("dialing not supported")
        }
    }

    fn id(n: u8) -> Identity {
        Identity::from_bytes([n; 32])
    }

    fn root_opts() -> ChannelOptions {
        ChannelOptions { role: Role::Root, ..Default::default() }
    }

    #[tokio::test]
    async fn role_must_match_root_identity() {
        let rpc = RecordingRpc::new(id(1), vec![]);
        let (node, _events) = Fanout::spawn(rpc, FanoutConfig::default());

        let err = node.open_channel("t", &id(2), root_opts()).await.unwrap_err();
        assert!(matches!(err, FanoutError::InvalidOptions(_)));
        let err = node.open_channel("t", &id(1), ChannelOptions::default()).await.unwrap_err();
        assert!(matches!(err, FanoutError::InvalidOptions(_)));

        node.open_channel("t", &id(1), root_opts()).await.unwrap();
        assert_eq!(
            node.open_channel("t", &id(1), root_opts()).await.unwrap_err(),
            FanoutError::ChannelExists
        );
        assert_eq!(node.open_channel("", &id(1), root_opts()).await.unwrap_err(), FanoutError::InvalidTopic);
    }

    #[tokio::test]
    async fn root_assigns_sequences_without_local_delivery() {
        let rpc = RecordingRpc::new(id(1), vec![]);
        let (node, mut events) = Fanout::spawn(rpc, FanoutConfig::default());
        node.open_channel("t", &id(1), root_opts()).await.unwrap();

        for expected in 0..3u32 {
            let seq = node.publish_to_channel("t", &id(1), vec![expected as u8]).await.unwrap();
            assert_eq!(seq, Some(expected));
        }
        let stats = node.channel_stats("t", &id(1)).await.unwrap();
        assert_eq!(stats.next_seq, 3);
        assert_eq!(stats.cached_range, Some((0, 3)));
        assert!(events.try_recv().is_err());

        let err = node
            .publish_to_channel("t", &id(1), vec![0; DEFAULT_MAX_PAYLOAD + 1])
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::PayloadTooLarge { .. }));
    }

    const DEFAULT_MAX_PAYLOAD: usize = crate::config::DEFAULT_MAX_PAYLOAD_SIZE;

    #[tokio::test]
    async fn malformed_frames_are_counted_and_dropped() {
        let rpc = RecordingRpc::new(id(1), vec![id(2)]);
        let (node, _events) = Fanout::spawn(rpc.clone(), FanoutConfig::default());

        node.handle_frame(&id(2), vec![0xEE, 1, 2, 3]).await;
        node.handle_frame(&id(2), vec![]).await;
        let stats = node.node_stats().await.unwrap();
        assert_eq!(stats.malformed_frames, 2);
        assert_eq!(stats.frames_received, 2);
        assert!(rpc.sent().is_empty());
    }

    #[tokio::test]
    async fn join_for_unknown_channel_is_rejected_not_attached() {
        let rpc = RecordingRpc::new(id(1), vec![id(2)]);
        let config = FanoutConfig { tick_interval: Duration::from_secs(3600), ..Default::default() };
        let (node, _events) = Fanout::spawn(rpc.clone(), config);

        let key = crate::channel::channel_key("t", &id(9));
        let req = Message::JoinReq { key, req_id: 7, bid_per_byte: 1.0, addrs: vec![] };
        node.handle_frame(&id(2), req.encode()).await;
        node.node_stats().await.unwrap();

        let sent = rpc.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            (peer, Message::JoinReject { req_id, reason, .. }) => {
                assert_eq!(*peer, id(2));
                assert_eq!(*req_id, 7);
                assert_eq!(*reason, RejectReason::NotAttached);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_joiner_is_redirected_to_known_candidates() {
        let rpc = RecordingRpc::new(id(1), vec![id(2), id(3)]);
        let config = FanoutConfig { tick_interval: Duration::from_secs(3600), ..Default::default() };
        let (node, _events) = Fanout::spawn(rpc.clone(), config);

        // id(3) leaves its address behind with an earlier join request.
        let other = crate::channel::channel_key("other", &id(8));
        let addrs = vec![b"rec://three".to_vec()];
        let req = Message::JoinReq { key: other, req_id: 1, bid_per_byte: 1.0, addrs: addrs.clone() };
        node.handle_frame(&id(3), req.encode()).await;

        let key = crate::channel::channel_key("t", &id(9));
        let req = Message::JoinReq { key, req_id: 2, bid_per_byte: 1.0, addrs: vec![b"rec://two".to_vec()] };
        node.handle_frame(&id(2), req.encode()).await;
        node.node_stats().await.unwrap();

        let reject = rpc
            .sent()
            .into_iter()
            .find_map(|(peer, msg)| match msg {
                Message::JoinReject { req_id: 2, reason, redirects, .. } if peer == id(2) => Some((reason, redirects)),
                _ => None,
            })
            .expect("reject for id(2)");
        assert_eq!(reject.0, RejectReason::NotAttached);
        assert_eq!(reject.1, vec![PeerAddrs { peer: id(3), addrs }]);
    }

    #[tokio::test]
    async fn root_accepts_child_and_advertises_cache() {
        let rpc = RecordingRpc::new(id(1), vec![id(2)]);
        let config = FanoutConfig { tick_interval: Duration::from_secs(3600), ..Default::default() };
        let (node, _events) = Fanout::spawn(rpc.clone(), config);
        let channel = node.open_channel("t", &id(1), root_opts()).await.unwrap();
        node.publish_to_channel("t", &id(1), b"x".to_vec()).await.unwrap();

        let req = Message::JoinReq { key: channel.key, req_id: 1, bid_per_byte: 0.0, addrs: vec![] };
        node.handle_frame(&id(2), req.encode()).await;
        let stats = node.channel_stats("t", &id(1)).await.unwrap();
        assert_eq!(stats.children, vec![id(2)]);

        let sent = rpc.sent();
        assert!(sent.iter().any(|(p, m)| *p == id(2)
            && matches!(m, Message::JoinAccept { level: 0, route, .. } if route == &vec![id(1)])));
        assert!(sent.iter().any(|(p, m)| *p == id(2)
            && matches!(m, Message::IHave { have_from: 0, have_to_exclusive: 1, .. })));
    }

    #[tokio::test]
    async fn publish_end_requires_root() {
        let rpc = RecordingRpc::new(id(1), vec![]);
        let (node, _events) = Fanout::spawn(rpc, FanoutConfig::default());
        node.open_channel("t", &id(9), ChannelOptions::default()).await.unwrap();
        assert_eq!(node.publish_end("t", &id(9), 10).await.unwrap_err(), FanoutError::NotRoot);
        assert_eq!(node.publish_end("x", &id(9), 10).await.unwrap_err(), FanoutError::ChannelNotFound);
    }
}
