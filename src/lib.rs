//! Capacity-aware broadcast trees over an existing peer-to-peer transport.
//!
//! Each channel is a `(topic, root)` pair. The root assigns sequence numbers
//! and streams data down a tree whose parents admit children by capacity and
//! bid. Members find parents through trackers, repair gaps from their parent
//! or lazy neighbors, and can address each other with source routes through
//! the root.
//!
//! ```ignore
//! use fanout::{ChannelOptions, Fanout, FanoutConfig, Role};
//!
//! let (node, mut events) = Fanout::spawn(transport, FanoutConfig::default());
//! node.open_channel("news", &node.identity(), ChannelOptions { role: Role::Root, ..Default::default() })
//!     .await?;
//! node.publish_to_channel("news", &node.identity(), b"hello".to_vec()).await?;
//! ```

mod admission;
mod cache;
mod channel;
mod config;
mod error;
mod forwarder;
mod identity;
pub mod memory;
mod messages;
mod node;
mod protocols;
mod ratelimit;
mod repair;
mod route;
mod tracker;

pub use admission::{Candidate, CandidateSource};
pub use channel::{channel_key, namespace_key, ChannelId, ChannelMetrics, ChannelStats, KindCounter};
pub use config::{
    BootstrapPeer, ChannelOptions, FanoutConfig, JoinOptions, NeighborRepairOptions, ProvideOptions,
    ProviderQueryOptions, RepairOptions, Role, ScoringMode, ScoringWeights,
};
pub use error::{FanoutError, FanoutResult, RejectReason};
pub use identity::{Identity, Keypair};
pub use messages::{ChannelKey, KickReason, MessageKind, PeerAddrs, Priority};
pub use node::{Fanout, FanoutEvent, NodeStats, ProvideHandle};
pub use protocols::{FanoutHandler, FanoutRpc, NeighborCallback};
pub use route::RouteToken;
