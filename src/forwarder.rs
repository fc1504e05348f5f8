//! Upload-shaped fanout to children.
//!
//! Children are served in bid order (ties to the earlier joiner). When the
//! upload bucket cannot cover every child the tail is skipped, and repeated
//! overload eventually evicts the lowest bidder among the starved.

use std::collections::HashMap;

use tokio::time::Instant;

use crate::channel::ChildInfo;
use crate::config::ChannelOptions;
use crate::identity::Identity;
use crate::ratelimit::TokenBucket;

/// `min(max_children, floor(upload / (rate × (size + overhead))))` when both
/// an upload limit and a message rate are declared.
pub fn effective_max_children(opts: &ChannelOptions) -> usize {
    if opts.upload_limit_bps == 0 || opts.msg_rate <= 0.0 {
        return opts.max_children;
    }
    let per_child = opts.msg_rate * (opts.msg_size + opts.per_child_overhead) as f64;
    if per_child <= 0.0 {
        return opts.max_children;
    }
    let affordable = (opts.upload_limit_bps as f64 / per_child).floor() as usize;
    opts.max_children.min(affordable)
}

/// Children by bid descending, earlier joiner first on ties.
pub fn order_by_bid(children: &HashMap<Identity, ChildInfo>) -> Vec<Identity> {
    let mut ordered: Vec<(&Identity, &ChildInfo)> = children.iter().collect();
    ordered.sort_by(|(a_id, a), (b_id, b)| {
        b.bid_per_byte
            .total_cmp(&a.bid_per_byte)
            .then_with(|| a.joined_at.cmp(&b.joined_at))
            .then_with(|| a_id.cmp(b_id))
    });
    ordered.into_iter().map(|(id, _)| *id).collect()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanoutPlan {
    pub targets: Vec<Identity>,
    pub starved: Vec<Identity>,
}

/// Decide who receives a frame of `frame_len` bytes. Each target costs
/// `frame_len + per_child_overhead` from the upload bucket; `None` is
/// unshaped.
pub fn plan_fanout(
    children: &HashMap<Identity, ChildInfo>,
    frame_len: usize,
    per_child_overhead: usize,
    mut upload: Option<&mut TokenBucket>,
) -> FanoutPlan {
    let cost = (frame_len + per_child_overhead) as f64;
    let mut plan = FanoutPlan::default();
    for child in order_by_bid(children) {
        let affordable = match upload.as_deref_mut() {
            Some(bucket) => plan.starved.is_empty() && bucket.try_consume(cost),
            None => true,
        };
        if affordable {
            plan.targets.push(child);
        } else {
            plan.starved.push(child);
        }
    }
    plan
}

#[derive(Debug, Default)]
pub struct OverloadState {
    pub streak: u32,
    pub last_eviction: Option<Instant>,
}

impl OverloadState {
    /// Update streaks after a send. Returns the child to kick for overload,
    /// if the streak and cooldown allow it.
    pub fn record(
        &mut self,
        plan: &FanoutPlan,
        children: &mut HashMap<Identity, ChildInfo>,
        opts: &ChannelOptions,
    ) -> Option<Identity> {
        for id in &plan.targets {
            if let Some(child) = children.get_mut(id) {
                child.starved_streak = 0;
            }
        }
        if plan.starved.is_empty() {
            self.streak = 0;
            return None;
        }
        for id in &plan.starved {
            if let Some(child) = children.get_mut(id) {
                child.starved_streak += 1;
            }
        }
        self.streak += 1;

        if opts.overload_evict_streak == 0 || self.streak < opts.overload_evict_streak {
            return None;
        }
        let now = Instant::now();
        if let Some(last) = self.last_eviction {
            if now.duration_since(last) < opts.overload_evict_cooldown {
                return None;
            }
        }
        let victim = plan
            .starved
            .iter()
            .filter_map(|id| children.get(id).map(|c| (*id, c)))
            .min_by(|(_, a), (_, b)| {
                a.bid_per_byte
                    .total_cmp(&b.bid_per_byte)
                    .then_with(|| b.joined_at.cmp(&a.joined_at))
            })
            .map(|(id, _)| id)?;
        self.streak = 0;
        self.last_eviction = Some(now);
        Some(victim)
    }
}

/// Track a send outcome. Returns true once the child crossed the
/// write-failure eviction threshold.
pub fn record_write(child: &mut ChildInfo, ok: bool, evict_streak: u32) -> bool {
    if ok {
        child.write_fail_streak = 0;
        return false;
    }
    child.write_fail_streak += 1;
    evict_streak > 0 && child.write_fail_streak >= evict_streak
}
