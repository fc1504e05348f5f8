//! Tree formation, delivery, admission and repair over the in-memory network.

mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use common::*;
use fanout::memory::MemoryNetwork;
use fanout::{
    BootstrapPeer, ChannelOptions, FanoutError, FanoutEvent, Identity, JoinOptions, KickReason, MessageKind,
    NeighborRepairOptions, Role,
};

const TOPIC: &str = "tree";

async fn join(node: &TestNode, root: &Identity) {
    join_with(node, root, member_channel()).await;
}

async fn join_with(node: &TestNode, root: &Identity, options: ChannelOptions) {
    node.fanout
        .join_channel(TOPIC, root, options, fast_join())
        .await
        .expect("join failed");
}

async fn children_of(node: &TestNode, root: &Identity) -> BTreeSet<Identity> {
    node.fanout
        .channel_stats(TOPIC, root)
        .await
        .expect("stats")
        .children
        .into_iter()
        .collect()
}

/// Wait until `child` is (or is no longer) a child of `parent`.
async fn wait_for_child(parent: &TestNode, root: &Identity, child: &Identity, present: bool) -> bool {
    wait_until(|| async move { children_of(parent, root).await.contains(child) == present }).await
}

async fn lazy_peers_of(node: &TestNode, root: &Identity) -> Vec<Identity> {
    node.fanout.channel_stats(TOPIC, root).await.expect("stats").lazy_peers
}

#[tokio::test]
async fn full_root_redirects_joiners_to_children() {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut nodes = spawn_nodes(&net, 5).await;
    let root = nodes[0].id;

    nodes[0]
        .fanout
        .open_channel(TOPIC, &root, ChannelOptions { max_children: 2, ..root_channel() })
        .await
        .expect("open root");
    // Everyone only knows the root; deeper parents are reached by redirect.
    for node in &nodes[1..] {
        assert!(net.connect(&root, &node.id).await);
    }

    join(&nodes[1], &root).await;
    join(&nodes[2], &root).await;
    join(&nodes[3], &root).await;
    join(&nodes[4], &root).await;

    let first_level: BTreeSet<Identity> = [nodes[1].id, nodes[2].id].into_iter().collect();
    assert_eq!(children_of(&nodes[0], &root).await, first_level);
    for node in &nodes[3..] {
        let stats = node.fanout.channel_stats(TOPIC, &root).await.expect("stats");
        assert!(stats.attached);
        assert_eq!(stats.level, 2);
        let parent = stats.parent.expect("parent");
        assert!(first_level.contains(&parent));
        let route = stats.route_from_root.expect("route");
        assert_eq!(route, vec![root, parent, node.id]);
    }

    for i in 0..6u32 {
        let seq = nodes[0]
            .fanout
            .publish_to_channel(TOPIC, &root, format!("msg {i}").into_bytes())
            .await
            .expect("publish");
        assert_eq!(seq, Some(i));
    }

    let want = seqs(0..6);
    for node in nodes[1..].iter_mut() {
        let mut got = BTreeSet::new();
        collect_seqs(node, &want, &mut got).await;
        assert_eq!(got, want, "node {} missed data", node.id.short());
    }
}

#[tokio::test]
async fn higher_bid_displaces_lowest_child() {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut nodes = spawn_nodes(&net, 4).await;
    let root = nodes[0].id;

    nodes[0]
        .fanout
        .open_channel(
            TOPIC,
            &root,
            ChannelOptions { max_children: 2, allow_kick: true, ..root_channel() },
        )
        .await
        .expect("open root");
    for node in &nodes[1..] {
        net.connect(&root, &node.id).await;
    }

    let bids = [1.0, 5.0, 10.0];
    for (node, bid) in nodes[1..].iter().zip(bids) {
        join_with(node, &root, ChannelOptions { bid_per_byte: bid, ..member_channel() }).await;
    }

    let (low, mid, high) = (nodes[1].id, nodes[2].id, nodes[3].id);
    let expected: BTreeSet<Identity> = [mid, high].into_iter().collect();
    assert_eq!(children_of(&nodes[0], &root).await, expected);

    let kicked = next_event(&mut nodes[1], |e| matches!(e, FanoutEvent::Kicked { .. })).await;
    match kicked {
        Some(FanoutEvent::Kicked { by, reason, .. }) => {
            assert_eq!(by, root);
            assert_eq!(reason, KickReason::Outbid);
        }
        other => panic!("expected kick, got {other:?}"),
    }

    let metrics = nodes[0].fanout.channel_metrics(TOPIC, &root).await.expect("metrics");
    assert_eq!(metrics.evictions_outbid, 1);

    // The displaced child cannot outbid its way back under the root.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!children_of(&nodes[0], &root).await.contains(&low));
}

#[tokio::test]
async fn rejoin_under_neighbor_converges_after_parent_loss() {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut nodes = spawn_nodes(&net, 3).await;
    let (root, a, b) = (nodes[0].id, nodes[1].id, nodes[2].id);

    nodes[0].fanout.open_channel(TOPIC, &root, root_channel()).await.expect("open root");
    net.connect(&root, &a).await;
    net.connect(&root, &b).await;
    join(&nodes[1], &root).await;
    join(&nodes[2], &root).await;
    net.connect(&a, &b).await;

    for i in 0..5u32 {
        nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![i as u8]).await.expect("publish");
    }
    let mut counts = BTreeMap::new();
    count_seqs(&mut nodes[2], &seqs(0..5), &mut counts).await;
    assert_eq!(counts.keys().copied().collect::<BTreeSet<_>>(), seqs(0..5));

    // The root stays unreachable, so the only way back is through A.
    net.partition(&root, &b).await;
    for i in 5..10u32 {
        nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![i as u8]).await.expect("publish");
    }

    count_seqs(&mut nodes[2], &seqs(0..10), &mut counts).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    drain_seqs(&mut nodes[2], &mut counts);
    assert_eq!(counts.keys().copied().collect::<BTreeSet<_>>(), seqs(0..10));
    assert!(counts.values().all(|&n| n == 1), "duplicate deliveries: {counts:?}");

    let stats = nodes[2].fanout.channel_stats(TOPIC, &root).await.expect("stats");
    assert!(stats.attached);
    assert_eq!(stats.parent, Some(a));
    assert_eq!(stats.level, 2);
    assert_eq!(stats.missing, 0);
}

#[tokio::test]
async fn lost_data_is_repaired_from_parent() {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut nodes = spawn_nodes(&net, 2).await;
    let (root, member) = (nodes[0].id, nodes[1].id);

    nodes[0].fanout.open_channel(TOPIC, &root, root_channel()).await.expect("open root");
    net.connect(&root, &member).await;
    join(&nodes[1], &root).await;

    for i in 0..2u8 {
        nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![i]).await.expect("publish");
    }
    let mut got = BTreeSet::new();
    collect_seqs(&mut nodes[1], &seqs(0..2), &mut got).await;
    assert_eq!(got, seqs(0..2));

    net.drop_next(&root, &member, MessageKind::Data, 1).await;
    for i in 2..5u8 {
        nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![i]).await.expect("publish");
    }
    collect_seqs(&mut nodes[1], &seqs(0..5), &mut got).await;
    assert_eq!(got, seqs(0..5));

    let member_metrics = nodes[1].fanout.channel_metrics(TOPIC, &root).await.expect("metrics");
    assert_eq!(member_metrics.repaired, 1);
    assert!(member_metrics.repair_requests_sent >= 1);
    let root_metrics = nodes[0].fanout.channel_metrics(TOPIC, &root).await.expect("metrics");
    assert!(root_metrics.cache_hits >= 1);
}

#[tokio::test]
async fn member_publish_is_proxied_through_root() {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut nodes = spawn_nodes(&net, 3).await;
    let (root, a, b) = (nodes[0].id, nodes[1].id, nodes[2].id);

    nodes[0]
        .fanout
        .open_channel(TOPIC, &root, ChannelOptions { max_children: 1, ..root_channel() })
        .await
        .expect("open root");
    net.connect(&root, &a).await;
    net.connect(&a, &b).await;
    join(&nodes[1], &root).await;
    join(&nodes[2], &root).await;
    assert_eq!(
        nodes[2].fanout.channel_stats(TOPIC, &root).await.expect("stats").parent,
        Some(a)
    );

    let seq = nodes[2]
        .fanout
        .publish_to_channel(TOPIC, &root, b"from the edge".to_vec())
        .await
        .expect("proxy publish");
    assert_eq!(seq, None);

    for node in nodes[1..].iter_mut() {
        let event = next_event(node, |e| matches!(e, FanoutEvent::Data { .. })).await;
        match event {
            Some(FanoutEvent::Data { seq, payload, from, .. }) => {
                assert_eq!(seq, 0);
                assert_eq!(payload, b"from the edge".to_vec());
                assert_ne!(from, node.id);
            }
            other => panic!("expected data, got {other:?}"),
        }
    }
    // The root never delivers its own stream locally.
    assert!(nodes[0].events.try_recv().is_err());
}

#[tokio::test]
async fn end_of_stream_reaches_every_member() {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut nodes = spawn_nodes(&net, 3).await;
    let (root, a, b) = (nodes[0].id, nodes[1].id, nodes[2].id);

    nodes[0]
        .fanout
        .open_channel(TOPIC, &root, ChannelOptions { max_children: 1, ..root_channel() })
        .await
        .expect("open root");
    net.connect(&root, &a).await;
    net.connect(&a, &b).await;
    join(&nodes[1], &root).await;
    join(&nodes[2], &root).await;

    for i in 0..3u8 {
        nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![i]).await.expect("publish");
    }
    nodes[0].fanout.publish_end(TOPIC, &root, 3).await.expect("end");
    assert_eq!(
        nodes[1].fanout.publish_end(TOPIC, &root, 3).await,
        Err(FanoutError::NotRoot)
    );

    for node in nodes[1..].iter_mut() {
        let ended = next_event(node, |e| matches!(e, FanoutEvent::Ended { .. })).await;
        assert!(
            matches!(ended, Some(FanoutEvent::Ended { end_seq_exclusive: 3, .. })),
            "got {ended:?}"
        );
        let stats = node.fanout.channel_stats(TOPIC, &root).await.expect("stats");
        assert_eq!(stats.end_seq_exclusive, Some(3));
    }
}

#[tokio::test]
async fn join_without_candidates_times_out_and_stays_open() {
    init_tracing();
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 2).await;
    let root = nodes[0].id;

    let result = nodes[1]
        .fanout
        .join_channel(
            TOPIC,
            &root,
            member_channel(),
            JoinOptions { timeout: Duration::from_millis(300), ..fast_join() },
        )
        .await;
    assert_eq!(result, Err(FanoutError::Timeout("join")));

    let stats = nodes[1].fanout.channel_stats(TOPIC, &root).await.expect("still open");
    assert!(!stats.attached);
    assert_eq!(stats.role, Role::Node);

    nodes[1].fanout.close_channel(TOPIC, &root).await.expect("close");
    assert_eq!(
        nodes[1].fanout.channel_stats(TOPIC, &root).await.map(|_| ()),
        Err(FanoutError::ChannelNotFound)
    );
}

#[tokio::test]
async fn unwritable_child_is_evicted_and_returns_after_going_stale() {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut nodes = spawn_nodes(&net, 2).await;
    let (root, member) = (nodes[0].id, nodes[1].id);

    nodes[0]
        .fanout
        .open_channel(TOPIC, &root, ChannelOptions { write_fail_evict_streak: 3, ..root_channel() })
        .await
        .expect("open root");
    net.connect(&root, &member).await;
    let join = JoinOptions {
        stale_after: Some(Duration::from_millis(300)),
        cooldown: Duration::from_millis(200),
        ..fast_join()
    };
    let live = ChannelOptions { max_data_age: Duration::from_secs(60), ..member_channel() };
    nodes[1].fanout.join_channel(TOPIC, &root, live, join).await.expect("join");

    nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![0]).await.expect("publish");
    let mut got = BTreeSet::new();
    collect_seqs(&mut nodes[1], &seqs(0..1), &mut got).await;
    assert_eq!(got, seqs(0..1));

    net.set_writable(&root, &member, false).await;
    for i in 1..3u8 {
        nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![i]).await.expect("publish");
    }
    assert!(wait_for_child(&nodes[0], &root, &member, false).await, "child was never evicted");
    net.set_writable(&root, &member, true).await;

    let metrics = nodes[0].fanout.channel_metrics(TOPIC, &root).await.expect("metrics");
    assert_eq!(metrics.evictions_write_failure, 1);
    assert!(metrics.write_failures >= 3);

    // The KICK was lost with the data; silence brings the member back.
    assert!(wait_for_child(&nodes[0], &root, &member, true).await, "member never came back");
    nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![3]).await.expect("publish");
    collect_seqs(&mut nodes[1], &seqs(0..4), &mut got).await;
    assert_eq!(got, seqs(0..4));
}

#[tokio::test]
async fn silent_parent_is_abandoned() {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut nodes = spawn_nodes(&net, 2).await;
    let (root, member) = (nodes[0].id, nodes[1].id);

    nodes[0].fanout.open_channel(TOPIC, &root, root_channel()).await.expect("open root");
    net.connect(&root, &member).await;
    let join = JoinOptions {
        stale_after: Some(Duration::from_millis(200)),
        cooldown: Duration::from_secs(30),
        ..fast_join()
    };
    let live = ChannelOptions { max_data_age: Duration::from_secs(60), ..member_channel() };
    nodes[1].fanout.join_channel(TOPIC, &root, live, join).await.expect("join");

    nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![0]).await.expect("publish");
    let mut got = BTreeSet::new();
    collect_seqs(&mut nodes[1], &seqs(0..1), &mut got).await;

    net.drop_next(&root, &member, MessageKind::Data, u32::MAX).await;
    for i in 1..4u8 {
        nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![i]).await.expect("publish");
    }

    assert!(wait_for_child(&nodes[0], &root, &member, false).await, "member never left");
    let stats = nodes[1].fanout.channel_stats(TOPIC, &root).await.expect("stats");
    assert!(!stats.attached);
    assert_eq!(stats.parent, None);
    // Abandoned, not disconnected.
    assert!(net.is_connected(&root, &member).await);
}

#[tokio::test]
async fn live_mode_drops_data_older_than_max_age() {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut nodes = spawn_nodes(&net, 2).await;
    let (root, member) = (nodes[0].id, nodes[1].id);

    nodes[0].fanout.open_channel(TOPIC, &root, root_channel()).await.expect("open root");
    net.connect(&root, &member).await;
    join_with(
        &nodes[1],
        &root,
        ChannelOptions { max_data_age: Duration::from_millis(150), ..member_channel() },
    )
    .await;

    nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![0]).await.expect("publish");
    let mut got = BTreeSet::new();
    collect_seqs(&mut nodes[1], &seqs(0..1), &mut got).await;

    // Seq 1 is lost and only noticed, then repaired, once it is too old.
    net.drop_next(&root, &member, MessageKind::Data, 1).await;
    nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![1]).await.expect("publish");
    tokio::time::sleep(Duration::from_millis(400)).await;
    nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![2]).await.expect("publish");

    let want: BTreeSet<u32> = [0, 2].into_iter().collect();
    collect_seqs(&mut nodes[1], &want, &mut got).await;
    assert_eq!(got, want);

    let member_node = &nodes[1];
    let dropped = wait_until(|| async move {
        member_node
            .fanout
            .channel_metrics(TOPIC, &root)
            .await
            .is_ok_and(|m| m.dropped_stale == 1)
    })
    .await;
    assert!(dropped, "stale repair was never dropped");

    let mut counts = BTreeMap::new();
    drain_seqs(&mut nodes[1], &mut counts);
    assert!(!counts.contains_key(&1));
    let metrics = nodes[1].fanout.channel_metrics(TOPIC, &root).await.expect("metrics");
    assert_eq!(metrics.repaired, 0);
    let stats = nodes[1].fanout.channel_stats(TOPIC, &root).await.expect("stats");
    assert_eq!(stats.missing, 0);
}

#[tokio::test]
async fn neighbors_fill_gaps_the_parent_cannot() {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut nodes = spawn_nodes(&net, 3).await;
    let (root, a, b) = (nodes[0].id, nodes[1].id, nodes[2].id);

    nodes[0]
        .fanout
        .open_channel(TOPIC, &root, ChannelOptions { max_children: 2, ..root_channel() })
        .await
        .expect("open root");
    net.connect(&root, &a).await;
    net.connect(&root, &b).await;
    net.connect(&a, &b).await;

    let mesh = ChannelOptions {
        neighbor_repair: NeighborRepairOptions {
            enabled: true,
            announce_interval: Duration::from_millis(50),
            ..Default::default()
        },
        ..member_channel()
    };
    join_with(&nodes[1], &root, mesh.clone()).await;
    join_with(&nodes[2], &root, mesh).await;
    let stats = nodes[2].fanout.channel_stats(TOPIC, &root).await.expect("stats");
    assert_eq!(stats.parent, Some(root));

    nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![0]).await.expect("publish");
    for node in nodes[1..].iter_mut() {
        let mut got = BTreeSet::new();
        collect_seqs(node, &seqs(0..1), &mut got).await;
        assert_eq!(got, seqs(0..1));
    }

    let (node_a, node_b) = (&nodes[1], &nodes[2]);
    let meshed = wait_until(|| async move {
        lazy_peers_of(node_a, &root).await.contains(&b) && lazy_peers_of(node_b, &root).await.contains(&a)
    })
    .await;
    assert!(meshed, "lazy mesh never formed");

    // The parent can neither resend seq 1 nor hear B's repair requests.
    net.drop_next(&root, &b, MessageKind::Data, 1).await;
    net.drop_next(&b, &root, MessageKind::RepairReq, u32::MAX).await;
    for i in 1..3u8 {
        nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![i]).await.expect("publish");
    }

    let mut got = BTreeSet::new();
    collect_seqs(&mut nodes[2], &seqs(1..3), &mut got).await;
    assert_eq!(got, seqs(1..3));

    let b_metrics = nodes[2].fanout.channel_metrics(TOPIC, &root).await.expect("metrics");
    assert_eq!(b_metrics.repaired, 1);
    assert!(b_metrics.fetch_requests_sent >= 1);
    let a_metrics = nodes[1].fanout.channel_metrics(TOPIC, &root).await.expect("metrics");
    assert!(a_metrics.cache_hits >= 1);
}

#[tokio::test]
async fn repair_beyond_the_cache_window_goes_unanswered() {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut nodes = spawn_nodes(&net, 2).await;
    let (root, member) = (nodes[0].id, nodes[1].id);

    let mut options = root_channel();
    options.repair.window_messages = 4;
    nodes[0].fanout.open_channel(TOPIC, &root, options).await.expect("open root");
    net.connect(&root, &member).await;
    join(&nodes[1], &root).await;

    nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![0]).await.expect("publish");
    let mut got = BTreeSet::new();
    collect_seqs(&mut nodes[1], &seqs(0..1), &mut got).await;

    net.drop_next(&root, &member, MessageKind::Data, 10).await;
    for i in 1..12u8 {
        nodes[0].fanout.publish_to_channel(TOPIC, &root, vec![i]).await.expect("publish");
    }

    // After seq 11 the root only holds 8..=11.
    let want: BTreeSet<u32> = [0, 8, 9, 10, 11].into_iter().collect();
    collect_seqs(&mut nodes[1], &want, &mut got).await;
    assert_eq!(got, want);

    let root_node = &nodes[0];
    let refused = wait_until(|| async move {
        root_node
            .fanout
            .channel_metrics(TOPIC, &root)
            .await
            .is_ok_and(|m| m.cache_misses >= 7)
    })
    .await;
    assert!(refused, "old sequences were never requested");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut counts = BTreeMap::new();
    drain_seqs(&mut nodes[1], &mut counts);
    assert!(counts.keys().all(|seq| *seq >= 8), "served outside the window: {counts:?}");
    let stats = nodes[1].fanout.channel_stats(TOPIC, &root).await.expect("stats");
    assert_eq!(stats.missing, 7);
}

#[tokio::test]
async fn slow_bootstrap_dial_does_not_stall_the_node() {
    init_tracing();
    let net = MemoryNetwork::new();
    let nodes = spawn_nodes(&net, 2).await;
    let root = nodes[0].id;

    nodes[0].fanout.open_channel(TOPIC, &root, root_channel()).await.expect("open root");
    net.set_dial_delay(&nodes[0].addr, Duration::from_secs(1)).await;

    let joiner = nodes[1].fanout.clone();
    let join = JoinOptions { bootstrap: vec![BootstrapPeer::Addr(nodes[0].addr.clone())], ..fast_join() };
    let pending = tokio::spawn(async move { joiner.join_channel(TOPIC, &root, member_channel(), join).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = tokio::time::timeout(Duration::from_millis(200), nodes[1].fanout.channel_stats(TOPIC, &root))
        .await
        .expect("node stalled behind the dial")
        .expect("stats");
    assert!(!stats.attached);

    tokio::time::timeout(TEST_TIMEOUT, pending)
        .await
        .expect("join never finished")
        .expect("task panicked")
        .expect("join failed");
    let stats = nodes[1].fanout.channel_stats(TOPIC, &root).await.expect("stats");
    assert_eq!(stats.parent, Some(root));
}
