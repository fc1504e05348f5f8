//! Shared harness for the integration tests: in-memory nodes with short
//! timers.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use fanout::memory::{MemoryNetwork, MemoryTransport};
use fanout::{
    ChannelOptions, Fanout, FanoutConfig, FanoutEvent, FanoutRpc, Identity, JoinOptions, Keypair, RepairOptions,
    Role, ScoringMode,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct TestNode {
    pub fanout: Fanout<MemoryTransport>,
    pub events: mpsc::Receiver<FanoutEvent>,
    pub id: Identity,
    pub addr: Vec<u8>,
}

pub fn fast_config() -> FanoutConfig {
    FanoutConfig {
        tick_interval: Duration::from_millis(10),
        route_query_timeout: Duration::from_millis(500),
        unicast_ack_timeout: Duration::from_secs(2),
        publish_attach_wait: Duration::from_secs(1),
        ..Default::default()
    }
}

pub fn fast_join() -> JoinOptions {
    JoinOptions {
        timeout: Duration::from_secs(5),
        join_timeout: Duration::from_millis(300),
        tracker_query_timeout: Duration::from_millis(200),
        retry_interval: Duration::from_millis(50),
        relay_rejoin_cooldown: Duration::from_millis(50),
        cooldown: Duration::from_secs(1),
        scoring: ScoringMode::RankedStrict,
        ..Default::default()
    }
}

pub fn channel(role: Role) -> ChannelOptions {
    ChannelOptions {
        role,
        announce_interval: Duration::from_millis(200),
        repair: RepairOptions {
            interval: Duration::from_millis(30),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn root_channel() -> ChannelOptions {
    channel(Role::Root)
}

pub fn member_channel() -> ChannelOptions {
    channel(Role::Node)
}

pub async fn spawn_node(net: &MemoryNetwork, config: FanoutConfig) -> TestNode {
    let transport = net.register(Keypair::generate()).await;
    let id = transport.local_identity();
    let addr = transport.addr().to_vec();
    let (fanout, events) = Fanout::spawn(transport, config);
    net.attach(&id, fanout.clone()).await.expect("attach failed");
    TestNode { fanout, events, id, addr }
}

pub async fn spawn_nodes(net: &MemoryNetwork, count: usize) -> Vec<TestNode> {
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        nodes.push(spawn_node(net, fast_config()).await);
    }
    nodes
}

/// Receive events until every sequence in `want` has been delivered or the
/// test timeout passes. Returns what arrived.
pub async fn collect_seqs(node: &mut TestNode, want: &BTreeSet<u32>, got: &mut BTreeSet<u32>) {
    let _ = timeout(TEST_TIMEOUT, async {
        while !want.is_subset(got) {
            match node.events.recv().await {
                Some(FanoutEvent::Data { seq, .. }) => {
                    got.insert(seq);
                }
                Some(_) => {}
                None => break,
            }
        }
    })
    .await;
}

/// Like [`collect_seqs`], but counts every delivery so duplicates show up.
pub async fn count_seqs(node: &mut TestNode, want: &BTreeSet<u32>, counts: &mut BTreeMap<u32, usize>) {
    let _ = timeout(TEST_TIMEOUT, async {
        while !want.iter().all(|seq| counts.contains_key(seq)) {
            match node.events.recv().await {
                Some(FanoutEvent::Data { seq, .. }) => *counts.entry(seq).or_default() += 1,
                Some(_) => {}
                None => break,
            }
        }
    })
    .await;
}

/// Count data already queued for `node` without waiting.
pub fn drain_seqs(node: &mut TestNode, counts: &mut BTreeMap<u32, usize>) {
    while let Ok(event) = node.events.try_recv() {
        if let FanoutEvent::Data { seq, .. } = event {
            *counts.entry(seq).or_default() += 1;
        }
    }
}

/// Wait for the next event matching `pred`.
pub async fn next_event<F>(node: &mut TestNode, mut pred: F) -> Option<FanoutEvent>
where
    F: FnMut(&FanoutEvent) -> bool,
{
    timeout(TEST_TIMEOUT, async {
        while let Some(event) = node.events.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Poll `check` until it holds or the test timeout passes.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

pub fn seqs(range: std::ops::Range<u32>) -> BTreeSet<u32> {
    range.collect()
}
