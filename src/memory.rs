//! In-process transport for tests and simulations.
//!
//! A [`MemoryNetwork`] is a shared switchboard: nodes register with their
//! keypair and get a [`MemoryTransport`] implementing [`FanoutRpc`]. Links
//! are explicit (`connect`/`disconnect`) and both ends are notified through
//! [`NeighborCallback`]. Every frame is signed by the sender and verified
//! before delivery, so the handler only ever sees authenticated senders.
//!
//! Each receiver drains a single FIFO inbox, which keeps neighbor
//! notifications and frames in send order.
//!
//! Fault injection: [`MemoryNetwork::set_writable`] makes a direction report
//! backpressure, [`MemoryNetwork::drop_next`] silently loses frames of one
//! kind, [`MemoryNetwork::partition`] cuts a link and refuses to restore it,
//! and [`MemoryNetwork::set_dial_delay`] slows down dials to a node.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{trace, warn};

use crate::identity::{Identity, Keypair};
use crate::messages::{MessageKind, Priority};
use crate::protocols::{FanoutHandler, FanoutRpc, NeighborCallback};

/// Anything that can sit on the receiving end of the network.
pub trait Endpoint: FanoutHandler + NeighborCallback + 'static {}

impl<T: FanoutHandler + NeighborCallback + 'static> Endpoint for T {}

enum Envelope {
    Frame {
        from: Identity,
        frame: Vec<u8>,
        signature: Vec<u8>,
    },
    Up(Identity),
    Down(Identity),
}

struct NodeSlot {
    inbox: mpsc::UnboundedSender<Envelope>,
    pending_rx: Option<mpsc::UnboundedReceiver<Envelope>>,
}

#[derive(Default)]
struct Switchboard {
    nodes: HashMap<Identity, NodeSlot>,
    by_addr: HashMap<Vec<u8>, Identity>,
    links: HashSet<(Identity, Identity)>,
    blocked: HashSet<(Identity, Identity)>,
    partitioned: HashSet<(Identity, Identity)>,
    drops: HashMap<(Identity, Identity, MessageKind), u32>,
    dial_delays: HashMap<Vec<u8>, Duration>,
}

fn link(a: Identity, b: Identity) -> (Identity, Identity) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl Switchboard {
    fn notify(&self, to: &Identity, envelope: Envelope) {
        if let Some(slot) = self.nodes.get(to) {
            let _ = slot.inbox.send(envelope);
        }
    }

    fn connect(&mut self, a: Identity, b: Identity) -> bool {
        if a == b || !self.nodes.contains_key(&a) || !self.nodes.contains_key(&b) {
            return false;
        }
        if self.partitioned.contains(&link(a, b)) {
            return false;
        }
        if self.links.insert(link(a, b)) {
            self.notify(&a, Envelope::Up(b));
            self.notify(&b, Envelope::Up(a));
        }
        true
    }

    fn disconnect(&mut self, a: Identity, b: Identity) {
        if self.links.remove(&link(a, b)) {
            self.notify(&a, Envelope::Down(b));
            self.notify(&b, Envelope::Down(a));
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Switchboard>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Its address is `mem://<identity hex>`.
    pub async fn register(&self, keypair: Keypair) -> Arc<MemoryTransport> {
        let identity = keypair.identity();
        let addr = format!("mem://{}", identity.to_hex()).into_bytes();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut board = self.inner.lock().await;
        board.by_addr.insert(addr.clone(), identity);
        board.nodes.insert(
            identity,
            NodeSlot { inbox: tx, pending_rx: Some(rx) },
        );

        Arc::new(MemoryTransport {
            network: self.clone(),
            keypair,
            identity,
            addr,
        })
    }

    /// Start delivering the node's inbox to `endpoint`. Anything sent to the
    /// node before this call is buffered.
    pub async fn attach<E: Endpoint>(&self, identity: &Identity, endpoint: E) -> Result<()> {
        let mut rx = {
            let mut board = self.inner.lock().await;
            let slot = board
                .nodes
                .get_mut(identity)
                .ok_or_else(|| anyhow!("unknown node {}", identity.short()))?;
            slot.pending_rx
                .take()
                .ok_or_else(|| anyhow!("node {} already attached", identity.short()))?
        };
        let local = *identity;
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match envelope {
                    Envelope::Frame { from, frame, signature } => {
                        if !from.verify(&frame, &signature) {
                            warn!(to = %local.short(), from = %from.short(), "dropping frame with bad signature");
                            continue;
                        }
                        endpoint.handle_frame(&from, frame).await;
                    }
                    Envelope::Up(peer) => endpoint.neighbor_up(peer).await,
                    Envelope::Down(peer) => endpoint.neighbor_down(&peer).await,
                }
            }
        });
        Ok(())
    }

    pub async fn connect(&self, a: &Identity, b: &Identity) -> bool {
        self.inner.lock().await.connect(*a, *b)
    }

    pub async fn disconnect(&self, a: &Identity, b: &Identity) {
        self.inner.lock().await.disconnect(*a, *b);
    }

    /// Disconnect `a` and `b` and refuse connects and dials between them
    /// until [`heal`](Self::heal).
    pub async fn partition(&self, a: &Identity, b: &Identity) {
        let mut board = self.inner.lock().await;
        board.partitioned.insert(link(*a, *b));
        board.disconnect(*a, *b);
    }

    pub async fn heal(&self, a: &Identity, b: &Identity) {
        self.inner.lock().await.partitioned.remove(&link(*a, *b));
    }

    pub async fn is_connected(&self, a: &Identity, b: &Identity) -> bool {
        self.inner.lock().await.links.contains(&link(*a, *b))
    }

    /// While unwritable, sends from `from` to `to` report backpressure.
    pub async fn set_writable(&self, from: &Identity, to: &Identity, writable: bool) {
        let mut board = self.inner.lock().await;
        if writable {
            board.blocked.remove(&(*from, *to));
        } else {
            board.blocked.insert((*from, *to));
        }
    }

    /// Silently lose the next `count` frames of `kind` from `from` to `to`.
    pub async fn drop_next(&self, from: &Identity, to: &Identity, kind: MessageKind, count: u32) {
        let mut board = self.inner.lock().await;
        *board.drops.entry((*from, *to, kind)).or_default() += count;
    }

    /// Every dial to `addr` takes `delay` before it connects.
    pub async fn set_dial_delay(&self, addr: &[u8], delay: Duration) {
        self.inner.lock().await.dial_delays.insert(addr.to_vec(), delay);
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    keypair: Keypair,
    identity: Identity,
    addr: Vec<u8>,
}

impl MemoryTransport {
    pub fn addr(&self) -> &[u8] {
        &self.addr
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl FanoutRpc for MemoryTransport {
    fn local_identity(&self) -> Identity {
        self.identity
    }

    fn local_addrs(&self) -> Vec<Vec<u8>> {
        vec![self.addr.clone()]
    }

    async fn send_to_peer(&self, peer: &Identity, frame: Vec<u8>, _priority: Priority) -> Result<bool> {
        let mut board = self.network.inner.lock().await;
        if !board.links.contains(&link(self.identity, *peer)) {
            bail!("not connected to {}", peer.short());
        }
        if board.blocked.contains(&(self.identity, *peer)) {
            return Ok(false);
        }
        if let Some(kind) = frame.first().copied().and_then(MessageKind::from_byte) {
            if let Some(left) = board.drops.get_mut(&(self.identity, *peer, kind)) {
                if *left > 0 {
                    *left -= 1;
                    trace!(from = %self.identity.short(), to = %peer.short(), kind = ?kind, "dropping frame");
                    return Ok(true);
                }
            }
        }
        let signature = self.keypair.sign(&frame).to_bytes().to_vec();
        let slot = board
            .nodes
            .get(peer)
            .ok_or_else(|| anyhow!("unknown node {}", peer.short()))?;
        slot.inbox
            .send(Envelope::Frame { from: self.identity, frame, signature })
            .map_err(|_| anyhow!("node {} is gone", peer.short()))?;
        Ok(true)
    }

    async fn peers(&self) -> Vec<Identity> {
        let board = self.network.inner.lock().await;
        board
            .links
            .iter()
            .filter_map(|(a, b)| {
                if *a == self.identity {
                    Some(*b)
                } else if *b == self.identity {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }

    async fn dial(&self, addr: &[u8]) -> Result<Identity> {
        let delay = self.network.inner.lock().await.dial_delays.get(addr).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut board = self.network.inner.lock().await;
        let peer = *board
            .by_addr
            .get(addr)
            .ok_or_else(|| anyhow!("no node at {}", String::from_utf8_lossy(addr)))?;
        if !board.connect(self.identity, peer) {
            bail!("cannot connect to {}", peer.short());
        }
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default, Clone)]
    struct Recorder {
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl FanoutHandler for Recorder {
        async fn handle_frame(&self, from: &Identity, frame: Vec<u8>) {
            self.log.lock().unwrap().push(format!("frame {} {:?}", from.short(), frame));
        }
    }

    #[async_trait]
    impl NeighborCallback for Recorder {
        async fn neighbor_up(&self, peer: Identity) {
            self.log.lock().unwrap().push(format!("up {}", peer.short()));
        }

        async fn neighbor_down(&self, peer: &Identity) {
            self.log.lock().unwrap().push(format!("down {}", peer.short()));
        }
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn frames_follow_links_in_order() {
        let net = MemoryNetwork::new();
        let a = net.register(Keypair::generate()).await;
        let b = net.register(Keypair::generate()).await;
        let rec = Recorder::default();
        net.attach(&b.local_identity(), rec.clone()).await.unwrap();

        let frame = vec![MessageKind::Leave as u8, 1];
        assert!(a.send_to_peer(&b.local_identity(), frame.clone(), Priority::High).await.is_err());

        assert!(net.connect(&a.local_identity(), &b.local_identity()).await);
        assert!(a.send_to_peer(&b.local_identity(), frame.clone(), Priority::High).await.unwrap());
        settle().await;

        let log = rec.log.lock().unwrap().clone();
        assert_eq!(log.len(), 2);
        assert!(log[0].starts_with("up "));
        assert!(log[1].starts_with("frame "));
        assert_eq!(b.peers().await, vec![a.local_identity()]);
    }

    #[tokio::test]
    async fn dial_connects_by_address() {
        let net = MemoryNetwork::new();
        let a = net.register(Keypair::generate()).await;
        let b = net.register(Keypair::generate()).await;

        assert_eq!(a.dial(b.addr()).await.unwrap(), b.local_identity());
        assert!(net.is_connected(&a.local_identity(), &b.local_identity()).await);
        assert!(a.dial(b"mem://nowhere").await.is_err());
    }

    #[tokio::test]
    async fn partition_refuses_reconnects_until_healed() {
        let net = MemoryNetwork::new();
        let a = net.register(Keypair::generate()).await;
        let b = net.register(Keypair::generate()).await;
        let (ai, bi) = (a.local_identity(), b.local_identity());
        net.connect(&ai, &bi).await;

        net.partition(&ai, &bi).await;
        assert!(!net.is_connected(&ai, &bi).await);
        assert!(!net.connect(&ai, &bi).await);
        assert!(a.dial(b.addr()).await.is_err());

        net.heal(&ai, &bi).await;
        assert_eq!(a.dial(b.addr()).await.unwrap(), bi);
    }

    #[tokio::test(start_paused = true)]
    async fn dial_delay_holds_back_the_connection() {
        let net = MemoryNetwork::new();
        let a = net.register(Keypair::generate()).await;
        let b = net.register(Keypair::generate()).await;
        net.set_dial_delay(b.addr(), std::time::Duration::from_secs(5)).await;

        let started = tokio::time::Instant::now();
        assert_eq!(a.dial(b.addr()).await.unwrap(), b.local_identity());
        assert!(started.elapsed() >= std::time::Duration::from_secs(5));
        assert!(net.is_connected(&a.local_identity(), &b.local_identity()).await);
    }

    #[tokio::test]
    async fn fault_injection() {
        let net = MemoryNetwork::new();
        let a = net.register(Keypair::generate()).await;
        let b = net.register(Keypair::generate()).await;
        let rec = Recorder::default();
        net.attach(&b.local_identity(), rec.clone()).await.unwrap();
        net.connect(&a.local_identity(), &b.local_identity()).await;
        let (ai, bi) = (a.local_identity(), b.local_identity());

        net.set_writable(&ai, &bi, false).await;
        assert!(!a.send_to_peer(&bi, vec![MessageKind::Leave as u8], Priority::High).await.unwrap());
        net.set_writable(&ai, &bi, true).await;

        net.drop_next(&ai, &bi, MessageKind::Data, 1).await;
        assert!(a.send_to_peer(&bi, vec![MessageKind::Data as u8, 0], Priority::Low).await.unwrap());
        assert!(a.send_to_peer(&bi, vec![MessageKind::Data as u8, 1], Priority::Low).await.unwrap());
        settle().await;

        let frames: Vec<String> = rec
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with("frame"))
            .cloned()
            .collect();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].ends_with(&format!("{:?}", vec![MessageKind::Data as u8, 1])));

        net.disconnect(&ai, &bi).await;
        settle().await;
        assert!(rec.log.lock().unwrap().last().unwrap().starts_with("down "));
    }
}
