//! Pairwise confidence accumulation and threshold-triggered label merging.
//!
//! Co-occurrence evidence between label pairs accumulates across frames;
//! once a pair's counter clears the configured threshold the larger label is
//! merged into the smaller one: every voxel carrying the retired label has
//! its confidence folded into the survivor, per-label voxel counts are
//! adjusted, and the pairwise table is rebalanced.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bookkeeping::Bookkeeping;
use crate::config::LabelFusionConfig;
use crate::store::{FrameBookkeeping, Label, LabelLayer};

/// A label merge: `loser` was absorbed into `winner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeEvent {
    /// The surviving label.
    pub winner: Label,

    /// The retired label; never reissued.
    pub loser: Label,
}

/// Co-occurrence counts keyed by canonically ordered label pairs.
///
/// The outer key is always the smaller label of the pair; this ordering is
/// a storage convention, not a semantic ranking. Self-pairs are never
/// stored.
#[derive(Debug, Default)]
pub struct PairwiseConfidence {
    counts: BTreeMap<Label, BTreeMap<Label, i32>>,
}

impl PairwiseConfidence {
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn count(&self, a: Label, b: Label) -> i32 {
        let (smaller, larger) = (a.min(b), a.max(b));
        self.counts
            .get(&smaller)
            .and_then(|row| row.get(&larger))
            .copied()
            .unwrap_or(0)
    }

    pub fn contains_label(&self, label: Label) -> bool {
        self.counts.contains_key(&label)
            || self.counts.values().any(|row| row.contains_key(&label))
    }

    /// All stored pairs in canonical `(smaller, larger)` order.
    pub fn pairs(&self) -> impl Iterator<Item = ((Label, Label), i32)> + '_ {
        self.counts.iter().flat_map(|(&smaller, row)| {
            row.iter().map(move |(&larger, &count)| ((smaller, larger), count))
        })
    }

    fn add(&mut self, smaller: Label, larger: Label, count: i32) {
        debug_assert!(smaller < larger, "pairwise table stores no self-pairs");
        *self
            .counts
            .entry(smaller)
            .or_default()
            .entry(larger)
            .or_insert(0) += count;
    }

    /// Record one frame's co-occurrence for every unordered pair in a
    /// segment's merge-candidate label set.
    pub fn record_candidates(&mut self, labels: &[Label]) {
        for (i, &a) in labels.iter().enumerate() {
            for &b in &labels[i + 1..] {
                if a != b {
                    self.add(a.min(b), a.max(b), 1);
                }
            }
        }
    }

    /// Pop the next pair whose count exceeds `threshold`, returning
    /// `(winner, loser)`. No mutation when nothing qualifies.
    pub fn next_merge(&mut self, threshold: i32) -> Option<(Label, Label)> {
        let (winner, loser) = self.pairs().find(|&(_, count)| count > threshold)?.0;
        let row = self.counts.get_mut(&winner).expect("pair row exists");
        row.remove(&loser);
        if row.is_empty() {
            self.counts.remove(&winner);
        }
        Some((winner, loser))
    }

    /// Redirect every counter touching the retired label to the survivor,
    /// summing where both already exist, preserving canonical ordering.
    pub(crate) fn rebalance_after_merge(&mut self, winner: Label, loser: Label) {
        debug_assert!(winner < loser);
        // Counts keyed (loser, x): x > loser > winner, so they fold into
        // (winner, x) directly.
        if let Some(row) = self.counts.remove(&loser) {
            for (other, count) in row {
                self.add(winner, other, count);
            }
        }
        // Counts keyed (x, loser): redirect to the (x, winner) pair. The
        // (winner, loser) pair itself was consumed by `next_merge`.
        let rows: Vec<Label> = self.counts.keys().copied().collect();
        for row_label in rows {
            let Some(row) = self.counts.get_mut(&row_label) else {
                continue;
            };
            let Some(count) = row.remove(&loser) else {
                continue;
            };
            if row.is_empty() {
                self.counts.remove(&row_label);
            }
            if row_label != winner {
                self.add(row_label.min(winner), row_label.max(winner), count);
            }
        }
    }
}

/// Rewrite every voxel carrying `loser` so its confidence accrues to
/// `winner`, recomputing cached best labels and voxel counts.
///
/// Single-threaded; must not run concurrently with the fusion phase.
fn swap_labels(
    layer: &mut LabelLayer,
    books: &mut FrameBookkeeping,
    loser: Label,
    winner: Label,
) {
    let mut updated_labels = std::mem::take(&mut books.updated_labels);
    let voxel_counts = &mut books.voxel_counts;
    layer.for_each_voxel_mut(|voxel| {
        let confidence = voxel.take_confidence(loser);
        if confidence <= 0.0 {
            return false;
        }
        let previous = voxel.best_label();
        // Added, not replaced: existing winner evidence accumulates.
        voxel.add_confidence(winner, confidence);
        voxel.update_best(winner);
        let current = voxel.best_label();
        if current != previous {
            updated_labels.insert(current);
            voxel_counts.adjust(current, 1);
            voxel_counts.adjust(previous, -1);
        }
        true
    });
    books.updated_labels = updated_labels;
}

/// Apply every pending merge: pop qualifying pairs one at a time, rewrite
/// the store, drop the retired label's lifecycle state and rebalance the
/// pairwise table. Terminates because each merge strictly shrinks the table.
pub fn merge_labels(
    layer: &mut LabelLayer,
    books: &mut FrameBookkeeping,
    pairwise: &mut PairwiseConfidence,
    lifecycle: &mut Bookkeeping,
    config: &LabelFusionConfig,
) -> Vec<MergeEvent> {
    let mut events = Vec::new();
    if !config.enable_pairwise_confidence_merging {
        return events;
    }
    while let Some((winner, loser)) =
        pairwise.next_merge(config.pairwise_confidence_count_threshold)
    {
        info!(winner, loser, "merging labels");
        swap_labels(layer, books, loser, winner);

        // Any staged publishing for the retired label is dropped.
        lifecycle.drop_label(loser);
        books.updated_labels.remove(&loser);

        pairwise.rebalance_after_merge(winner, loser);
        events.push(MergeEvent { winner, loser });
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UNASSIGNED_LABEL;
    use proptest::prelude::*;

    fn seeded_layer(entries: &[([i64; 3], Label, f32)]) -> LabelLayer {
        let mut layer = LabelLayer::new(1.0, 4);
        for &(index, label, confidence) in entries {
            layer.allocate_block(layer.block_index_of(&index));
            let voxel = layer.voxel_mut(&index).unwrap();
            voxel.add_confidence(label, confidence);
            voxel.update_best(UNASSIGNED_LABEL);
        }
        layer
    }

    #[test]
    fn test_record_candidates_stores_canonical_pairs() {
        let mut pairwise = PairwiseConfidence::default();
        pairwise.record_candidates(&[7, 3, 5]);
        assert_eq!(pairwise.count(3, 7), 1);
        assert_eq!(pairwise.count(7, 3), 1);
        assert_eq!(pairwise.count(3, 5), 1);
        assert_eq!(pairwise.count(5, 7), 1);
    }

    #[test]
    fn test_next_merge_below_threshold_is_idempotent() {
        let mut pairwise = PairwiseConfidence::default();
        for _ in 0..30 {
            pairwise.record_candidates(&[3, 7]);
        }
        assert_eq!(pairwise.next_merge(30), None);
        assert_eq!(pairwise.count(3, 7), 30);
    }

    #[test]
    fn test_next_merge_pops_exactly_one_pair() {
        let mut pairwise = PairwiseConfidence::default();
        for _ in 0..31 {
            pairwise.record_candidates(&[3, 7]);
        }
        assert_eq!(pairwise.next_merge(30), Some((3, 7)));
        assert_eq!(pairwise.count(3, 7), 0);
        assert!(pairwise.is_empty());
    }

    #[test]
    fn test_rebalance_redirects_and_sums_counts() {
        let mut pairwise = PairwiseConfidence::default();
        // Pairs touching the loser (7): (2, 7) and (7, 9); survivor 3
        // already pairs with 9.
        for _ in 0..4 {
            pairwise.record_candidates(&[2, 7]);
        }
        for _ in 0..5 {
            pairwise.record_candidates(&[7, 9]);
        }
        for _ in 0..2 {
            pairwise.record_candidates(&[3, 9]);
        }
        pairwise.rebalance_after_merge(3, 7);

        assert_eq!(pairwise.count(2, 3), 4);
        assert_eq!(pairwise.count(3, 9), 7);
        assert!(!pairwise.contains_label(7));
    }

    #[test]
    fn test_merge_rewrites_store_and_counts() {
        // Scenario: labels 3 and 7 co-occur past the threshold; 7 retires.
        let mut layer = seeded_layer(&[
            ([0, 0, 0], 3, 2.0),
            ([1, 0, 0], 7, 1.5),
            ([2, 0, 0], 7, 1.0),
        ]);
        let mut books = FrameBookkeeping::default();
        books.voxel_counts.adjust(3, 1);
        books.voxel_counts.adjust(7, 2);

        let mut pairwise = PairwiseConfidence::default();
        for _ in 0..31 {
            pairwise.record_candidates(&[3, 7]);
        }
        let mut lifecycle = Bookkeeping::default();
        lifecycle.reset_age(7);

        let config = LabelFusionConfig {
            pairwise_confidence_count_threshold: 30,
            ..Default::default()
        };
        let events = merge_labels(&mut layer, &mut books, &mut pairwise, &mut lifecycle, &config);

        assert_eq!(events, vec![MergeEvent { winner: 3, loser: 7 }]);
        assert!(layer.voxels_with_label(7).is_empty());
        assert_eq!(layer.voxels_with_label(3).len(), 3);
        assert_eq!(books.voxel_counts.count(3), 3);
        assert!(!books.voxel_counts.contains(7));
        assert!(!pairwise.contains_label(7));
        assert!(!lifecycle.has_publish_age(7));
        // Confidence transferred, not replaced.
        let voxel = layer.voxel_at_index(&[1, 0, 0]).unwrap();
        assert_eq!(voxel.confidence_of(3), Some(1.5));
        assert_eq!(voxel.confidence_of(7), None);
    }

    #[test]
    fn test_merge_accumulates_existing_winner_evidence() {
        let mut layer = seeded_layer(&[([0, 0, 0], 3, 2.0)]);
        {
            let voxel = layer.voxel_mut(&[0, 0, 0]).unwrap();
            voxel.add_confidence(7, 5.0);
            voxel.update_best(UNASSIGNED_LABEL);
        }
        let mut books = FrameBookkeeping::default();
        books.voxel_counts.adjust(7, 1);

        let mut pairwise = PairwiseConfidence::default();
        for _ in 0..31 {
            pairwise.record_candidates(&[3, 7]);
        }
        let mut lifecycle = Bookkeeping::default();
        let config = LabelFusionConfig::default();
        merge_labels(&mut layer, &mut books, &mut pairwise, &mut lifecycle, &config);

        let voxel = layer.voxel_at_index(&[0, 0, 0]).unwrap();
        assert_eq!(voxel.confidence_of(3), Some(7.0));
        assert_eq!(voxel.best_label(), 3);
        assert_eq!(books.voxel_counts.count(3), 1);
    }

    #[test]
    fn test_merging_disabled_applies_nothing() {
        let mut layer = seeded_layer(&[([0, 0, 0], 7, 1.0)]);
        let mut books = FrameBookkeeping::default();
        let mut pairwise = PairwiseConfidence::default();
        for _ in 0..50 {
            pairwise.record_candidates(&[3, 7]);
        }
        let mut lifecycle = Bookkeeping::default();
        let config = LabelFusionConfig {
            enable_pairwise_confidence_merging: false,
            ..Default::default()
        };
        let events = merge_labels(&mut layer, &mut books, &mut pairwise, &mut lifecycle, &config);
        assert!(events.is_empty());
        assert_eq!(pairwise.count(3, 7), 50);
    }

    proptest! {
        #[test]
        fn prop_table_never_stores_self_or_unordered_pairs(
            sets in proptest::collection::vec(
                proptest::collection::btree_set(1u32..50, 0..6),
                1..20,
            )
        ) {
            let mut pairwise = PairwiseConfidence::default();
            for set in &sets {
                let labels: Vec<Label> = set.iter().copied().collect();
                pairwise.record_candidates(&labels);
            }
            for ((smaller, larger), count) in pairwise.pairs() {
                prop_assert!(smaller < larger);
                prop_assert!(count > 0);
            }
        }
    }
}
