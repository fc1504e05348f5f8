//! Join candidate ranking and receiver-side admission.
//!
//! The joiner merges candidates from several sources, ranks them by
//! `(level asc, free_slots desc, bid_per_byte desc, source asc)`, drops those
//! in cooldown and picks a few according to [`ScoringMode`]. The receiver runs
//! [`decide_admission`] on each `JOIN_REQ`.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::channel::ChildInfo;
use crate::config::{JoinOptions, ScoringMode, ScoringWeights};
use crate::error::RejectReason;
use crate::identity::Identity;
use crate::messages::FeedbackEvent;

/// Level reported for candidates we know nothing about yet.
pub const UNKNOWN_LEVEL: u16 = u16::MAX - 1;

/// Where a candidate came from. Lower sorts first at equal rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CandidateSource {
    Root = 0,
    Tracker = 1,
    Known = 2,
    Fallback = 3,
    Redirect = 4,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub peer: Identity,
    pub addrs: Vec<Vec<u8>>,
    pub level: u16,
    pub free_slots: u16,
    pub bid_per_byte: f64,
    pub source: CandidateSource,
    pub connected: bool,
    /// Tracker that suggested this candidate, for feedback.
    pub tracker: Option<Identity>,
}

impl Candidate {
    pub fn unknown(peer: Identity, source: CandidateSource) -> Self {
        Self {
            peer,
            addrs: Vec::new(),
            level: UNKNOWN_LEVEL,
            free_slots: 0,
            bid_per_byte: 0.0,
            source,
            connected: false,
            tracker: None,
        }
    }
}

pub fn rank_cmp(a: &Candidate, b: &Candidate) -> Ordering {
    a.level
        .cmp(&b.level)
        .then_with(|| b.free_slots.cmp(&a.free_slots))
        .then_with(|| b.bid_per_byte.total_cmp(&a.bid_per_byte))
        .then_with(|| a.source.cmp(&b.source))
}

/// Deduplicate by peer (keeping the best-ranked record, with addresses and
/// connectivity merged), drop excluded peers, and sort by rank.
pub fn merge_candidates<I, F>(candidates: I, mut exclude: F) -> Vec<Candidate>
where
    I: IntoIterator<Item = Candidate>,
    F: FnMut(&Identity) -> bool,
{
    let mut by_peer: HashMap<Identity, Candidate> = HashMap::new();
    for c in candidates {
        if exclude(&c.peer) {
            continue;
        }
        match by_peer.get_mut(&c.peer) {
            Some(existing) => {
                let connected = existing.connected || c.connected;
                let mut addrs = std::mem::take(&mut existing.addrs);
                for a in &c.addrs {
                    if !addrs.contains(a) {
                        addrs.push(a.clone());
                    }
                }
                if rank_cmp(&c, existing) == Ordering::Less {
                    *existing = c;
                }
                existing.connected = connected;
                existing.addrs = addrs;
            }
            None => {
                by_peer.insert(c.peer, c);
            }
        }
    }
    let mut ranked: Vec<Candidate> = by_peer.into_values().collect();
    ranked.sort_by(|a, b| rank_cmp(a, b).then_with(|| a.peer.cmp(&b.peer)));
    ranked
}

fn weighted_score(c: &Candidate, w: &ScoringWeights, max_bid: f64) -> f64 {
    let level = 1.0 / (1.0 + c.level.min(UNKNOWN_LEVEL) as f64);
    let free = (c.free_slots.min(16) as f64) / 16.0;
    let connected = if c.connected { 1.0 } else { 0.0 };
    let bid = if max_bid > 0.0 { c.bid_per_byte / max_bid } else { 0.0 };
    let source = 1.0 / (1.0 + c.source as u8 as f64);
    let score = w.level * level + w.free_slots * free + w.connected * connected + w.bid * bid + w.source * source;
    score.max(1e-6)
}

/// Pick up to `count` candidates from an already ranked list.
pub fn select_candidates<R: Rng>(
    mut ranked: Vec<Candidate>,
    mode: ScoringMode,
    top_k: usize,
    weights: &ScoringWeights,
    count: usize,
    rng: &mut R,
) -> Vec<Candidate> {
    let k = top_k.max(1).min(ranked.len());
    match mode {
        ScoringMode::RankedStrict => {}
        ScoringMode::RankedShuffle => ranked[..k].shuffle(rng),
        ScoringMode::Weighted => {
            let max_bid = ranked[..k].iter().map(|c| c.bid_per_byte).fold(0.0, f64::max);
            let mut pool: Vec<Candidate> = ranked.drain(..k).collect();
            let mut picked = Vec::with_capacity(k);
            while !pool.is_empty() {
                let scores: Vec<f64> = pool.iter().map(|c| weighted_score(c, weights, max_bid)).collect();
                let total: f64 = scores.iter().sum();
                let mut target = rng.gen::<f64>() * total;
                let mut idx = pool.len() - 1;
                for (i, s) in scores.iter().enumerate() {
                    if target < *s {
                        idx = i;
                        break;
                    }
                    target -= s;
                }
                picked.push(pool.swap_remove(idx));
            }
            picked.extend(ranked);
            ranked = picked;
        }
    }
    ranked.truncate(count);
    ranked
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdmissionDecision {
    Accept,
    /// Accept after kicking the named child.
    AcceptEvicting(Identity),
    Reject(RejectReason),
}

/// What the receiver knows when a `JOIN_REQ` arrives.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionContext<'a> {
    pub attached: bool,
    pub route: &'a [Identity],
    pub capacity: usize,
    pub allow_kick: bool,
}

/// Lowest bidder among the children; ties evict the latest joiner.
pub fn lowest_bidder(children: &HashMap<Identity, ChildInfo>) -> Option<(Identity, f64)> {
    children
        .iter()
        .min_by(|(_, a), (_, b)| {
            a.bid_per_byte
                .total_cmp(&b.bid_per_byte)
                .then_with(|| b.joined_at.cmp(&a.joined_at))
        })
        .map(|(id, info)| (*id, info.bid_per_byte))
}

pub fn decide_admission(
    requester: &Identity,
    bid_per_byte: f64,
    ctx: AdmissionContext<'_>,
    children: &HashMap<Identity, ChildInfo>,
) -> AdmissionDecision {
    if children.contains_key(requester) {
        return AdmissionDecision::Accept;
    }
    if !ctx.attached || ctx.route.contains(requester) {
        return AdmissionDecision::Reject(RejectReason::NotAttached);
    }
    if children.len() < ctx.capacity {
        return AdmissionDecision::Accept;
    }
    if !ctx.allow_kick {
        return AdmissionDecision::Reject(RejectReason::NoCapacity);
    }
    match lowest_bidder(children) {
        Some((lowest, lowest_bid)) if bid_per_byte > lowest_bid => AdmissionDecision::AcceptEvicting(lowest),
        Some(_) => AdmissionDecision::Reject(RejectReason::LowBid),
        None => AdmissionDecision::Reject(RejectReason::NoCapacity),
    }
}

/// How long a candidate stays out of selection after an attempt outcome.
pub fn cooldown_for(event: FeedbackEvent, opts: &JoinOptions) -> Duration {
    match event {
        FeedbackEvent::Joined => Duration::ZERO,
        FeedbackEvent::DialFailed | FeedbackEvent::JoinTimeout => opts.cooldown,
        FeedbackEvent::JoinReject(RejectReason::NoCapacity) => opts.cooldown,
        FeedbackEvent::JoinReject(RejectReason::NotAttached) => opts.cooldown / 2,
        FeedbackEvent::JoinReject(RejectReason::LowBid) => {
            opts.cooldown.saturating_mul(opts.low_bid_cooldown_factor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelOptions;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn id(n: u8) -> Identity {
        Identity::from_bytes([n; 32])
    }

    fn cand(n: u8, level: u16, free: u16, bid: f64, source: CandidateSource) -> Candidate {
        Candidate {
            peer: id(n),
            addrs: vec![],
            level,
            free_slots: free,
            bid_per_byte: bid,
            source,
            connected: false,
            tracker: None,
        }
    }

    fn children(bids: &[(u8, f64)]) -> HashMap<Identity, ChildInfo> {
        let opts = ChannelOptions::default();
        bids.iter()
            .map(|(n, bid)| (id(*n), ChildInfo::new(*bid, vec![], &opts)))
            .collect()
    }

    fn ctx(capacity: usize, allow_kick: bool) -> AdmissionContext<'static> {
        AdmissionContext { attached: true, route: &[], capacity, allow_kick }
    }

    #[test]
    fn ranking_order() {
        let ranked = merge_candidates(
            vec![
                cand(1, 2, 5, 1.0, CandidateSource::Tracker),
                cand(2, 1, 1, 0.0, CandidateSource::Tracker),
                cand(3, 1, 3, 0.0, CandidateSource::Known),
                cand(4, 1, 3, 2.0, CandidateSource::Fallback),
                cand(5, 0, 0, 0.0, CandidateSource::Root),
            ],
            |_| false,
        );
        let order: Vec<Identity> = ranked.iter().map(|c| c.peer).collect();
        assert_eq!(order, vec![id(5), id(4), id(3), id(2), id(1)]);
    }

    #[test]
    fn merge_deduplicates_and_excludes() {
        let mut known = cand(1, UNKNOWN_LEVEL, 0, 0.0, CandidateSource::Known);
        known.addrs = vec![b"addr".to_vec()];
        known.connected = true;
        let tracker = cand(1, 2, 4, 0.0, CandidateSource::Tracker);

        let ranked = merge_candidates(
            vec![known, tracker, cand(9, 1, 1, 0.0, CandidateSource::Tracker)],
            |peer| *peer == id(9),
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].level, 2);
        assert_eq!(ranked[0].source, CandidateSource::Tracker);
        assert!(ranked[0].connected);
        assert_eq!(ranked[0].addrs, vec![b"addr".to_vec()]);
    }

    #[test]
    fn strict_selection_keeps_rank_order() {
        let ranked: Vec<Candidate> = (1..=6).map(|n| cand(n, n as u16, 1, 0.0, CandidateSource::Tracker)).collect();
        let mut rng = StdRng::seed_from_u64(7);
        let picked = select_candidates(ranked, ScoringMode::RankedStrict, 3, &ScoringWeights::default(), 4, &mut rng);
        let order: Vec<Identity> = picked.iter().map(|c| c.peer).collect();
        assert_eq!(order, vec![id(1), id(2), id(3), id(4)]);
    }

    #[test]
    fn shuffle_only_touches_top_k() {
        let ranked: Vec<Candidate> = (1..=6).map(|n| cand(n, n as u16, 1, 0.0, CandidateSource::Tracker)).collect();
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let picked =
                select_candidates(ranked.clone(), ScoringMode::RankedShuffle, 3, &ScoringWeights::default(), 6, &mut rng);
            let mut head: Vec<Identity> = picked[..3].iter().map(|c| c.peer).collect();
            head.sort();
            assert_eq!(head, vec![id(1), id(2), id(3)]);
            let tail: Vec<Identity> = picked[3..].iter().map(|c| c.peer).collect();
            assert_eq!(tail, vec![id(4), id(5), id(6)]);
        }
    }

    #[test]
    fn weighted_selection_is_a_permutation_of_top_k() {
        let ranked: Vec<Candidate> = (1..=5).map(|n| cand(n, n as u16, n as u16, n as f64, CandidateSource::Tracker)).collect();
        let mut rng = StdRng::seed_from_u64(3);
        let picked = select_candidates(ranked, ScoringMode::Weighted, 4, &ScoringWeights::default(), 5, &mut rng);
        assert_eq!(picked.len(), 5);
        assert_eq!(picked[4].peer, id(5));
        let mut head: Vec<Identity> = picked[..4].iter().map(|c| c.peer).collect();
        head.sort();
        assert_eq!(head, vec![id(1), id(2), id(3), id(4)]);
    }

    #[test]
    fn existing_child_is_reaccepted() {
        let kids = children(&[(1, 1.0), (2, 2.0)]);
        assert_eq!(decide_admission(&id(1), 0.0, ctx(2, false), &kids), AdmissionDecision::Accept);
    }

    #[test]
    fn detached_or_looping_requests_rejected() {
        let kids = children(&[]);
        let detached = AdmissionContext { attached: false, ..ctx(4, true) };
        assert_eq!(
            decide_admission(&id(1), 1.0, detached, &kids),
            AdmissionDecision::Reject(RejectReason::NotAttached)
        );

        let route = [id(0), id(7)];
        let looping = AdmissionContext { route: &route, ..ctx(4, true) };
        assert_eq!(
            decide_admission(&id(7), 1.0, looping, &kids),
            AdmissionDecision::Reject(RejectReason::NotAttached)
        );
    }

    #[test]
    fn full_without_kick_is_no_capacity() {
        let kids = children(&[(1, 1.0)]);
        assert_eq!(
            decide_admission(&id(2), 100.0, ctx(1, false), &kids),
            AdmissionDecision::Reject(RejectReason::NoCapacity)
        );
    }

    #[test]
    fn higher_bid_takes_last_slot_equal_bid_keeps_incumbent() {
        let kids = children(&[(1, 1.0), (2, 5.0)]);

        assert_eq!(
            decide_admission(&id(3), 10.0, ctx(2, true), &kids),
            AdmissionDecision::AcceptEvicting(id(1))
        );
        assert_eq!(
            decide_admission(&id(3), 1.0, ctx(2, true), &kids),
            AdmissionDecision::Reject(RejectReason::LowBid)
        );
        assert_eq!(
            decide_admission(&id(3), 0.5, ctx(2, true), &kids),
            AdmissionDecision::Reject(RejectReason::LowBid)
        );
    }

    #[test]
    fn scenario_bids_one_five_ten_keep_five_and_ten() {
        let opts = ChannelOptions::default();
        let mut kids: HashMap<Identity, ChildInfo> = HashMap::new();

        for (n, bid) in [(1u8, 1.0), (5, 5.0), (10, 10.0)] {
            match decide_admission(&id(n), bid, ctx(2, true), &kids) {
                AdmissionDecision::Accept => {}
                AdmissionDecision::AcceptEvicting(victim) => {
                    kids.remove(&victim);
                }
                AdmissionDecision::Reject(r) => panic!("unexpected reject {}", r),
            }
            kids.insert(id(n), ChildInfo::new(bid, vec![], &opts));
        }

        let mut ids: Vec<Identity> = kids.keys().copied().collect();
        ids.sort();
        assert_eq!(ids, vec![id(5), id(10)]);

        assert_eq!(
            decide_admission(&id(1), 1.0, ctx(2, true), &kids),
            AdmissionDecision::Reject(RejectReason::LowBid)
        );
    }

    #[test]
    fn cooldowns_scale_by_outcome() {
        let opts = JoinOptions { cooldown: Duration::from_secs(4), ..Default::default() };
        assert_eq!(cooldown_for(FeedbackEvent::DialFailed, &opts), Duration::from_secs(4));
        assert_eq!(cooldown_for(FeedbackEvent::JoinTimeout, &opts), Duration::from_secs(4));
        assert_eq!(
            cooldown_for(FeedbackEvent::JoinReject(RejectReason::NoCapacity), &opts),
            Duration::from_secs(4)
        );
        assert_eq!(
            cooldown_for(FeedbackEvent::JoinReject(RejectReason::NotAttached), &opts),
            Duration::from_secs(2)
        );
        assert_eq!(
            cooldown_for(FeedbackEvent::JoinReject(RejectReason::LowBid), &opts),
            Duration::from_secs(48)
        );
        assert_eq!(cooldown_for(FeedbackEvent::Joined, &opts), Duration::ZERO);
    }
}
