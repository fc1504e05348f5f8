//! Error taxonomy for the overlay's public API.
//!
//! Admission rejections, timeouts and cancellation are distinct variants so
//! callers (and the join loop) can react differently to each. Data-plane
//! drops are never errors; they only show up in channel metrics.

use thiserror::Error;

/// Structured reason carried by `JOIN_REJECT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The receiver has no rooted path itself.
    NotAttached,
    /// At capacity and kicking is disabled.
    NoCapacity,
    /// At capacity and the bid does not beat the lowest incumbent.
    LowBid,
}

impl RejectReason {
    pub fn to_byte(self) -> u8 {
        match self {
            RejectReason::NotAttached => 1,
            RejectReason::NoCapacity => 2,
            RejectReason::LowBid => 3,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(RejectReason::NotAttached),
            2 => Some(RejectReason::NoCapacity),
            3 => Some(RejectReason::LowBid),
            _ => None,
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::NotAttached => write!(f, "NOT_ATTACHED"),
            RejectReason::NoCapacity => write!(f, "NO_CAPACITY"),
            RejectReason::LowBid => write!(f, "LOW_BID"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FanoutError {
    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error("channel not found")]
    ChannelNotFound,

    #[error("channel already open")]
    ChannelExists,

    #[error("operation requires the channel root")]
    NotRoot,

    #[error("channel is not attached to a rooted tree")]
    NotAttached,

    #[error("invalid route token: {0}")]
    InvalidRouteToken(String),

    #[error("no route to target")]
    RouteNotFound,

    #[error("invalid topic name")]
    InvalidTopic,

    #[error("payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid channel options: {0}")]
    InvalidOptions(String),

    #[error("fanout actor closed")]
    ActorClosed,
}

pub type FanoutResult<T> = Result<T, FanoutError>;
