//! Route tokens: the ordered path from the root down to a member.
//!
//! Serialized as `[hops:u8][hop:32]*`, at most [`MAX_ROUTE_HOPS`] hops.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{FanoutError, FanoutResult};
use crate::identity::Identity;
use crate::messages::MAX_ROUTE_HOPS;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteToken(Vec<Identity>);

impl RouteToken {
    pub fn new(hops: Vec<Identity>) -> FanoutResult<Self> {
        if hops.is_empty() {
            return Err(FanoutError::InvalidRouteToken("empty route".into()));
        }
        if hops.len() > MAX_ROUTE_HOPS {
            return Err(FanoutError::InvalidRouteToken(format!(
                "{} hops exceeds {}",
                hops.len(),
                MAX_ROUTE_HOPS
            )));
        }
        if has_duplicates(&hops) {
            return Err(FanoutError::InvalidRouteToken("repeated hop".into()));
        }
        Ok(Self(hops))
    }

    pub fn hops(&self) -> &[Identity] {
        &self.0
    }

    pub fn into_hops(self) -> Vec<Identity> {
        self.0
    }

    pub fn root(&self) -> &Identity {
        &self.0[0]
    }

    pub fn target(&self) -> &Identity {
        &self.0[self.0.len() - 1]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.0.len() * Identity::LEN);
        out.push(self.0.len() as u8);
        for hop in &self.0 {
            out.extend_from_slice(hop.as_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> FanoutResult<Self> {
        let (&hops, rest) = bytes
            .split_first()
            .ok_or_else(|| FanoutError::InvalidRouteToken("empty token".into()))?;
        if rest.len() != hops as usize * Identity::LEN {
            return Err(FanoutError::InvalidRouteToken(format!(
                "expected {} hop bytes, got {}",
                hops as usize * Identity::LEN,
                rest.len()
            )));
        }
        let route = rest
            .chunks_exact(Identity::LEN)
            .map(|chunk| {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(chunk);
                Identity::from_bytes(arr)
            })
            .collect();
        Self::new(route)
    }
}

fn has_duplicates(route: &[Identity]) -> bool {
    let mut seen = HashSet::with_capacity(route.len());
    !route.iter().all(|hop| seen.insert(*hop))
}

/// Structural validity of a route towards `target` in the channel of `root`.
pub fn is_valid_route(route: &[Identity], root: &Identity, target: &Identity) -> bool {
    !route.is_empty()
        && route.len() <= MAX_ROUTE_HOPS
        && route[0] == *root
        && route[route.len() - 1] == *target
        && !has_duplicates(route)
}

/// Validate the route offered in a `JOIN_ACCEPT` and derive our own.
///
/// The acceptor's route must start at the root, end at the acceptor and not
/// contain us; an acceptor that is the root may send `[root]` or nothing.
pub fn route_after_accept(
    offered: &[Identity],
    root: &Identity,
    acceptor: &Identity,
    local: &Identity,
) -> Option<Vec<Identity>> {
    let mut route = if offered.is_empty() && acceptor == root {
        vec![*root]
    } else {
        offered.to_vec()
    };
    if !is_valid_route(&route, root, acceptor) || route.contains(local) {
        return None;
    }
    if route.len() >= MAX_ROUTE_HOPS {
        return None;
    }
    route.push(*local);
    Some(route)
}

/// Where a unicast travelling along `route` goes next from `local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop {
    /// We are the target.
    Deliver,
    /// Forward down to this child.
    Down(Identity),
    /// We are not on the route.
    NotOnRoute,
}

pub fn next_hop_down(route: &[Identity], local: &Identity) -> NextHop {
    match route.iter().position(|hop| hop == local) {
        Some(idx) if idx + 1 == route.len() => NextHop::Deliver,
        Some(idx) => NextHop::Down(route[idx + 1]),
        None => NextHop::NotOnRoute,
    }
}
