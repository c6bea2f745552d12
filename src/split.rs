//! Node split policies.
//!
//! An overflowing node's entries are partitioned into two groups by the
//! tree's configured policy. The policies are plain functions over entry
//! vectors, dispatched through a table indexed by the persisted policy code,
//! so leaf and branch splits share one implementation (both entry kinds are
//! an envelope plus a u64 payload).

use crate::envelope::Envelope;
use crate::errors::{IndexError, IndexResult};
use crate::hilbert::center_index;
use crate::types::NodeEntry;

/// How an overflowing node is partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPolicy {
    /// Guttman's linear split: seed with the pair of maximal normalized
    /// separation along one axis, then assign by least enlargement.
    Linear,
    /// Guttman's quadratic split: seed with the pair wasting the most area,
    /// then greedily assign the entry with the strongest preference.
    Quadratic,
    /// The "star" variant; shares the quadratic partitioning.
    Star,
    /// Keep entries ordered by the Hilbert rank of their centers and cut at
    /// the midpoint, the way a B-tree splits a page. The order is the curve
    /// precision in bits per axis.
    Hilbert(u8),
}

impl SplitPolicy {
    /// Persisted policy code; also the index into the dispatch table.
    pub(crate) fn code(&self) -> u8 {
        match self {
            SplitPolicy::Linear => 0,
            SplitPolicy::Quadratic => 1,
            SplitPolicy::Star => 2,
            SplitPolicy::Hilbert(_) => 3,
        }
    }

    /// Hilbert curve order, 0 for the non-Hilbert policies.
    pub(crate) fn hilbert_order(&self) -> u8 {
        match self {
            SplitPolicy::Hilbert(order) => *order,
            _ => 0,
        }
    }

    pub(crate) fn from_code(code: u8, hilbert_order: u8) -> IndexResult<SplitPolicy> {
        match code {
            0 => Ok(SplitPolicy::Linear),
            1 => Ok(SplitPolicy::Quadratic),
            2 => Ok(SplitPolicy::Star),
            3 if hilbert_order >= 1 => Ok(SplitPolicy::Hilbert(hilbert_order)),
            _ => Err(IndexError::format(format!(
                "unknown split policy code {} (order {})",
                code, hilbert_order
            ))),
        }
    }
}

/// Parameters a split function needs besides the entries.
pub(crate) struct SplitContext {
    pub min_fill: usize,
    pub hilbert_order: u32,
}

type SplitFn = fn(&SplitContext, Vec<NodeEntry>) -> (Vec<NodeEntry>, Vec<NodeEntry>);

/// Dispatch table indexed by [`SplitPolicy::code`].
const SPLIT_ALGORITHMS: [SplitFn; 4] = [linear_split, quadratic_split, quadratic_split, hilbert_split];

/// Partitions the entries of an overflowing node into two groups, each
/// holding at least `min_fill` entries.
pub(crate) fn split_entries(
    policy: SplitPolicy,
    ctx: &SplitContext,
    entries: Vec<NodeEntry>,
) -> (Vec<NodeEntry>, Vec<NodeEntry>) {
    debug_assert!(entries.len() >= 2);
    SPLIT_ALGORITHMS[policy.code() as usize](ctx, entries)
}

/// Sorted insertion position for a new entry under the Hilbert policy.
pub(crate) fn hilbert_position(entries: &[NodeEntry], envelope: &Envelope, order: u32) -> usize {
    let rank = center_index(envelope, order);
    entries.partition_point(|e| center_index(&e.envelope, order) <= rank)
}

fn linear_split(
    ctx: &SplitContext,
    mut entries: Vec<NodeEntry>,
) -> (Vec<NodeEntry>, Vec<NodeEntry>) {
    let dimension = entries[0].envelope.dimension();

    // Pick the axis with the greatest normalized separation between the
    // highest low side and the lowest high side; those two entries seed the
    // groups.
    let mut best_score = f64::NEG_INFINITY;
    let mut seeds = (0, entries.len() - 1);
    for axis in 0..dimension {
        let mut lowest = f64::INFINITY;
        let mut highest = f64::NEG_INFINITY;
        let mut highest_low = (f64::NEG_INFINITY, 0usize);
        let mut lowest_high = (f64::INFINITY, 0usize);
        for (i, e) in entries.iter().enumerate() {
            let lo = e.envelope.min()[axis];
            let hi = e.envelope.max()[axis];
            lowest = lowest.min(lo);
            highest = highest.max(hi);
            if lo > highest_low.0 {
                highest_low = (lo, i);
            }
            if hi < lowest_high.0 {
                lowest_high = (hi, i);
            }
        }
        let width = highest - lowest;
        let separation = if width > 0.0 {
            (highest_low.0 - lowest_high.0) / width
        } else {
            0.0
        };
        if separation > best_score && highest_low.1 != lowest_high.1 {
            best_score = separation;
            seeds = (lowest_high.1, highest_low.1);
        }
    }

    let (a, b) = seeds;
    let (first, second) = if a < b { (b, a) } else { (a, b) };
    let seed_b = entries.remove(first);
    let seed_a = entries.remove(second);
    distribute_by_enlargement(ctx, seed_a, seed_b, entries)
}

fn quadratic_split(
    ctx: &SplitContext,
    mut entries: Vec<NodeEntry>,
) -> (Vec<NodeEntry>, Vec<NodeEntry>) {
    // Seed with the pair whose combined envelope wastes the most area.
    let mut worst = f64::NEG_INFINITY;
    let mut seeds = (0, 1);
    for i in 0..entries.len() {
        for j in i + 1..entries.len() {
            let waste = entries[i].envelope.union(&entries[j].envelope).area()
                - entries[i].envelope.area()
                - entries[j].envelope.area();
            if waste > worst {
                worst = waste;
                seeds = (i, j);
            }
        }
    }

    let (a, b) = seeds;
    let seed_b = entries.remove(b);
    let seed_a = entries.remove(a);

    let mut left = vec![seed_a];
    let mut right = vec![seed_b];
    let mut left_env = left[0].envelope.clone();
    let mut right_env = right[0].envelope.clone();

    while !entries.is_empty() {
        // If one group must take everything left to reach min_fill, stop
        // choosing.
        if left.len() + entries.len() == ctx.min_fill {
            for e in entries.drain(..) {
                left_env.expand(&e.envelope);
                left.push(e);
            }
            break;
        }
        if right.len() + entries.len() == ctx.min_fill {
            for e in entries.drain(..) {
                right_env.expand(&e.envelope);
                right.push(e);
            }
            break;
        }

        // Pick the entry with the strongest group preference.
        let mut pick = 0;
        let mut pick_diff = f64::NEG_INFINITY;
        for (i, e) in entries.iter().enumerate() {
            let diff =
                (left_env.enlargement(&e.envelope) - right_env.enlargement(&e.envelope)).abs();
            if diff > pick_diff {
                pick_diff = diff;
                pick = i;
            }
        }
        let e = entries.remove(pick);
        if prefers_left(&left_env, &right_env, left.len(), right.len(), &e.envelope) {
            left_env.expand(&e.envelope);
            left.push(e);
        } else {
            right_env.expand(&e.envelope);
            right.push(e);
        }
    }

    (left, right)
}

fn hilbert_split(ctx: &SplitContext, mut entries: Vec<NodeEntry>) -> (Vec<NodeEntry>, Vec<NodeEntry>) {
    entries.sort_by_key(|e| center_index(&e.envelope, ctx.hilbert_order));
    let right = entries.split_off(entries.len() / 2);
    (entries, right)
}

/// Assigns the remaining entries to the seeded groups by least enlargement,
/// forcing assignment when a group would otherwise miss `min_fill`.
fn distribute_by_enlargement(
    ctx: &SplitContext,
    seed_a: NodeEntry,
    seed_b: NodeEntry,
    rest: Vec<NodeEntry>,
) -> (Vec<NodeEntry>, Vec<NodeEntry>) {
    let mut left_env = seed_a.envelope.clone();
    let mut right_env = seed_b.envelope.clone();
    let mut left = vec![seed_a];
    let mut right = vec![seed_b];

    let mut remaining = rest.len();
    for e in rest {
        let assign_left = if left.len() + remaining == ctx.min_fill {
            true
        } else if right.len() + remaining == ctx.min_fill {
            false
        } else {
            prefers_left(&left_env, &right_env, left.len(), right.len(), &e.envelope)
        };
        if assign_left {
            left_env.expand(&e.envelope);
            left.push(e);
        } else {
            right_env.expand(&e.envelope);
            right.push(e);
        }
        remaining -= 1;
    }

    (left, right)
}

fn prefers_left(
    left_env: &Envelope,
    right_env: &Envelope,
    left_len: usize,
    right_len: usize,
    envelope: &Envelope,
) -> bool {
    let dl = left_env.enlargement(envelope);
    let dr = right_env.enlargement(envelope);
    if dl != dr {
        return dl < dr;
    }
    let al = left_env.area();
    let ar = right_env.area();
    if al != ar {
        return al < ar;
    }
    left_len <= right_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::min_fill;
    use crate::envelope::Envelope;

    fn point_entry(x: f64, y: f64, value: u64) -> NodeEntry {
        NodeEntry::new(Envelope::point(&[x, y]).unwrap(), value)
    }

    fn entries_of(group: &[NodeEntry]) -> Vec<u64> {
        let mut ids: Vec<u64> = group.iter().map(|e| e.value).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_policy_codes_roundtrip() {
        for policy in [
            SplitPolicy::Linear,
            SplitPolicy::Quadratic,
            SplitPolicy::Star,
            SplitPolicy::Hilbert(16),
        ] {
            let decoded =
                SplitPolicy::from_code(policy.code(), policy.hilbert_order()).unwrap();
            assert_eq!(decoded, policy);
        }
        assert!(SplitPolicy::from_code(7, 0).is_err());
        assert!(SplitPolicy::from_code(3, 0).is_err(), "hilbert needs an order");
    }

    #[test]
    fn test_linear_split_separates_clusters() {
        let entries = vec![
            point_entry(0.0, 0.0, 0),
            point_entry(1.0, 0.5, 1),
            point_entry(100.0, 100.0, 2),
            point_entry(101.0, 99.0, 3),
        ];
        let ctx = SplitContext { min_fill: min_fill(3), hilbert_order: 0 };
        let (left, right) = split_entries(SplitPolicy::Linear, &ctx, entries);
        let (mut low, mut high) = (entries_of(&left), entries_of(&right));
        if low.contains(&2) {
            std::mem::swap(&mut low, &mut high);
        }
        assert_eq!(low, vec![0, 1]);
        assert_eq!(high, vec![2, 3]);
    }

    #[test]
    fn test_quadratic_split_separates_clusters() {
        let entries = vec![
            point_entry(0.0, 0.0, 0),
            point_entry(2.0, 1.0, 1),
            point_entry(50.0, 50.0, 2),
            point_entry(51.0, 52.0, 3),
            point_entry(1.0, 1.0, 4),
        ];
        let ctx = SplitContext { min_fill: min_fill(4), hilbert_order: 0 };
        let (left, right) = split_entries(SplitPolicy::Quadratic, &ctx, entries);
        let (mut low, mut high) = (entries_of(&left), entries_of(&right));
        if low.contains(&2) {
            std::mem::swap(&mut low, &mut high);
        }
        assert_eq!(low, vec![0, 1, 4]);
        assert_eq!(high, vec![2, 3]);
    }

    #[test]
    fn test_star_aliases_quadratic() {
        let entries = vec![
            point_entry(0.0, 0.0, 0),
            point_entry(9.0, 9.0, 1),
            point_entry(0.5, 0.5, 2),
        ];
        let ctx = SplitContext { min_fill: 1, hilbert_order: 0 };
        let a = split_entries(SplitPolicy::Quadratic, &ctx, entries.clone());
        let b = split_entries(SplitPolicy::Star, &ctx, entries);
        assert_eq!(entries_of(&a.0), entries_of(&b.0));
        assert_eq!(entries_of(&a.1), entries_of(&b.1));
    }

    #[test]
    fn test_splits_respect_min_fill() {
        // Nine near-identical entries plus one outlier: the outlier's group
        // must still be topped up to min_fill.
        let mut entries: Vec<NodeEntry> =
            (0..9).map(|i| point_entry(i as f64 * 0.01, 0.0, i)).collect();
        entries.push(point_entry(1000.0, 1000.0, 9));
        let fill = min_fill(9);
        let ctx = SplitContext { min_fill: fill, hilbert_order: 0 };
        for policy in [SplitPolicy::Linear, SplitPolicy::Quadratic] {
            let (left, right) = split_entries(policy, &ctx, entries.clone());
            assert!(left.len() >= fill, "{:?} left fill {}", policy, left.len());
            assert!(right.len() >= fill, "{:?} right fill {}", policy, right.len());
            assert_eq!(left.len() + right.len(), 10);
        }
    }

    #[test]
    fn test_hilbert_split_cuts_at_midpoint() {
        let entries: Vec<NodeEntry> =
            (0..5).map(|i| point_entry(i as f64, i as f64, i)).collect();
        let ctx = SplitContext { min_fill: 1, hilbert_order: 16 };
        let (left, right) = split_entries(SplitPolicy::Hilbert(16), &ctx, entries);
        assert_eq!(left.len(), 2);
        assert_eq!(right.len(), 3);
        // Contiguous rank ranges: every left rank precedes every right rank.
        let max_left = left
            .iter()
            .map(|e| center_index(&e.envelope, 16))
            .max()
            .unwrap();
        let min_right = right
            .iter()
            .map(|e| center_index(&e.envelope, 16))
            .min()
            .unwrap();
        assert!(max_left <= min_right);
    }

    #[test]
    fn test_hilbert_position_keeps_order() {
        let mut entries: Vec<NodeEntry> = Vec::new();
        for (i, (x, y)) in [(3.0, 7.0), (40.0, 2.0), (15.0, 15.0), (0.1, 0.2)]
            .iter()
            .enumerate()
        {
            let env = Envelope::point(&[*x, *y]).unwrap();
            let at = hilbert_position(&entries, &env, 16);
            entries.insert(at, NodeEntry::new(env, i as u64));
        }
        let ranks: Vec<u64> = entries
            .iter()
            .map(|e| center_index(&e.envelope, 16))
            .collect();
        let mut sorted = ranks.clone();
        sorted.sort_unstable();
        assert_eq!(ranks, sorted);
    }
}
