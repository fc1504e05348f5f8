//! Transport seam.
//!
//! The overlay never opens connections or frames bytes on its own. It sends
//! through a [`FanoutRpc`] implementation and is fed through
//! [`FanoutHandler`] and [`NeighborCallback`], both implemented by the
//! [`Fanout`](crate::Fanout) handle.
//!
//! | Direction | Trait | Purpose |
//! |-----------|-------|---------|
//! | outbound | [`FanoutRpc`] | send frames, list peers, dial addresses |
//! | inbound | [`FanoutHandler`] | frames from directly connected peers |
//! | inbound | [`NeighborCallback`] | connect/disconnect notifications |

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::Identity;
use crate::messages::Priority;

#[async_trait]
pub trait FanoutRpc: Send + Sync + 'static {
    fn local_identity(&self) -> Identity;

    /// Addresses other nodes can dial us at; advertised in joins and
    /// tracker announcements.
    fn local_addrs(&self) -> Vec<Vec<u8>>;

    /// Queue a frame for a directly connected peer.
    ///
    /// Returns `Ok(false)` when the peer is not writable right now.
    /// Implementations must not wait on a slow peer.
    async fn send_to_peer(&self, peer: &Identity, frame: Vec<u8>, priority: Priority) -> Result<bool>;

    /// Currently connected peers.
    async fn peers(&self) -> Vec<Identity>;

    /// Connect to the node at `addr` and return its identity.
    async fn dial(&self, addr: &[u8]) -> Result<Identity>;
}

/// Inbound frames. `from` is the verified sender identity.
#[async_trait]
pub trait FanoutHandler: Send + Sync {
    async fn handle_frame(&self, from: &Identity, frame: Vec<u8>);
}

#[async_trait]
pub trait NeighborCallback: Send + Sync {
    async fn neighbor_up(&self, peer: Identity);

    async fn neighbor_down(&self, peer: &Identity);
}
