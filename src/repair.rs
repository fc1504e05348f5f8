//! Gap tracking and neighbor selection for repair.
//!
//! [`GapTracker`] follows the next expected sequence and the bounded set of
//! missing sequences. Parent pull-repair asks for the smallest missing
//! sequences; neighbor-assisted repair ranks lazy peers by how much of the
//! missing set their advertised range covers, weighted by past success.

use std::collections::BTreeSet;

use crate::identity::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    /// At or beyond the next expected sequence.
    New,
    /// Filled a known gap.
    Repaired,
    Duplicate,
}

#[derive(Debug)]
pub struct GapTracker {
    next_expected: Option<u32>,
    missing: BTreeSet<u32>,
    max_backfill: u32,
    end_seq_exclusive: Option<u32>,
}

impl GapTracker {
    pub fn new(max_backfill: usize) -> Self {
        Self {
            next_expected: None,
            missing: BTreeSet::new(),
            max_backfill: max_backfill.min(u32::MAX as usize) as u32,
            end_seq_exclusive: None,
        }
    }

    pub fn next_expected(&self) -> Option<u32> {
        self.next_expected
    }

    pub fn missing_len(&self) -> usize {
        self.missing.len()
    }

    pub fn missing(&self) -> &BTreeSet<u32> {
        &self.missing
    }

    pub fn end_seq_exclusive(&self) -> Option<u32> {
        self.end_seq_exclusive
    }

    fn cap(&self) -> usize {
        (self.max_backfill as usize).saturating_mul(4)
    }

    /// Record `[from, to)` as missing, keeping only sequences within the
    /// backfill distance of `newest`.
    fn add_gap(&mut self, from: u32, to: u32, newest: u32) {
        let start = from.max(newest.saturating_sub(self.max_backfill));
        for seq in start..to {
            self.missing.insert(seq);
        }
        let cap = self.cap();
        while self.missing.len() > cap {
            self.missing.pop_first();
        }
    }

    pub fn observe(&mut self, seq: u32) -> Observed {
        let Some(next) = self.next_expected else {
            self.next_expected = Some(seq.saturating_add(1));
            return Observed::New;
        };
        if seq >= next {
            self.add_gap(next, seq, seq);
            self.next_expected = Some(seq.saturating_add(1));
            self.prune();
            Observed::New
        } else if self.missing.remove(&seq) {
            Observed::Repaired
        } else {
            Observed::Duplicate
        }
    }

    /// A peer advertises data up to `to_exclusive`; anything we have not seen
    /// below it becomes a repair target. Ignored before the first sequence.
    pub fn observe_horizon(&mut self, to_exclusive: u32) {
        let Some(next) = self.next_expected else {
            return;
        };
        if to_exclusive > next {
            let newest = to_exclusive - 1;
            self.add_gap(next, to_exclusive, newest);
            self.next_expected = Some(to_exclusive);
            self.prune();
        }
    }

    /// The stream ends before `end`. Sequences at or past it are no longer
    /// expected.
    pub fn mark_end(&mut self, end: u32) {
        self.end_seq_exclusive = Some(end);
        self.observe_horizon(end);
        let tail: Vec<u32> = self.missing.range(end..).copied().collect();
        for seq in tail {
            self.missing.remove(&seq);
        }
    }

    /// Drop missing entries older than the backfill distance.
    pub fn prune(&mut self) {
        let Some(next) = self.next_expected else {
            return;
        };
        let newest = next.saturating_sub(1);
        let floor = newest.saturating_sub(self.max_backfill);
        while let Some(&first) = self.missing.first() {
            if first >= floor {
                break;
            }
            self.missing.pop_first();
        }
    }

    /// Smallest `max` missing sequences.
    pub fn next_request(&self, max: usize) -> Vec<u32> {
        self.missing.iter().take(max).copied().collect()
    }
}

/// What a lazy neighbor told us it holds, plus how it served us.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NeighborHave {
    pub have_from: u32,
    pub have_to_exclusive: u32,
    pub requests: u32,
    pub successes: u32,
}

impl NeighborHave {
    pub fn covers(&self, seq: u32) -> bool {
        seq >= self.have_from && seq < self.have_to_exclusive
    }

    pub fn score(&self, coverage: usize) -> f64 {
        coverage as f64 * (self.successes as f64 + 1.0) / (self.requests as f64 + 2.0)
    }
}

/// Pick up to `peers` neighbors for a fetch round, each with the missing
/// sequences it covers (at most `max_per_req`). Neighbors covering nothing
/// are skipped.
pub fn plan_neighbor_fetch<'a, I>(
    missing: &BTreeSet<u32>,
    neighbors: I,
    peers: usize,
    max_per_req: usize,
) -> Vec<(Identity, Vec<u32>)>
where
    I: IntoIterator<Item = (&'a Identity, &'a NeighborHave)>,
{
    let mut scored: Vec<(f64, Identity, Vec<u32>)> = neighbors
        .into_iter()
        .filter_map(|(peer, have)| {
            let covered: Vec<u32> = missing.iter().copied().filter(|seq| have.covers(*seq)).collect();
            if covered.is_empty() {
                return None;
            }
            let score = have.score(covered.len());
            let mut seqs = covered;
            seqs.truncate(max_per_req);
            Some((score, *peer, seqs))
        })
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored.into_iter().take(peers).map(|(_, peer, seqs)| (peer, seqs)).collect()
}
