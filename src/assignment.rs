//! Greedy segment-to-label assignment - stage 2 of the per-frame pipeline.
//!
//! Repeatedly picks the (segment, label) pair with the globally highest
//! support count, claims the label, and recomputes the candidates of every
//! segment displaced by the claim. Segments left over when no pair clears
//! the minimum-voxel-count threshold receive fresh labels.

use std::collections::BTreeSet;

use tracing::debug;

use crate::candidates::{compute_segment_label_candidates, CandidateTable, MergeCandidates};
use crate::config::LabelFusionConfig;
use crate::fusion::VolumetricBackend;
use crate::merge::PairwiseConfidence;
use crate::segment::{Segment, SegmentId};
use crate::store::{Label, LabelAllocator, LabelLayer};

/// The globally best unclaimed (segment, label) pair, or `None` when no
/// pair clears `min_label_voxel_count`.
///
/// On success the label is claimed and every other segment that shared the
/// claimed label's row is purged and recomputed under the grown exclusion
/// set, which can promote a second-choice label to primary. The candidate
/// table shrinks (one label row removed per claim) so resolution always
/// terminates.
#[allow(clippy::too_many_arguments)]
fn next_segment_label_pair(
    segments: &[Segment],
    layer: &LabelLayer,
    backend: &dyn VolumetricBackend,
    allocator: &LabelAllocator,
    config: &LabelFusionConfig,
    resolved: &BTreeSet<SegmentId>,
    assigned_labels: &mut BTreeSet<Label>,
    candidates: &mut CandidateTable,
    merge_candidates: &mut MergeCandidates,
) -> Option<(SegmentId, Label)> {
    let mut max_count = 0;
    let mut max_pair = None;
    let mut cohort: Vec<SegmentId> = Vec::new();

    for (label, supports) in candidates.iter() {
        for (&segment_id, &count) in supports {
            if count > max_count
                && count > config.min_label_voxel_count
                && !resolved.contains(&segment_id)
            {
                max_count = count;
                max_pair = Some((segment_id, label));
                cohort = supports.keys().copied().collect();
            }
        }
    }

    let (segment_id, label) = max_pair?;
    assigned_labels.insert(label);
    candidates.remove_label(label);

    for other in cohort {
        if other == segment_id || resolved.contains(&other) {
            continue;
        }
        candidates.purge_segment_except(other, label);
        compute_segment_label_candidates(
            other,
            &segments[other],
            layer,
            backend,
            allocator,
            config,
            assigned_labels,
            candidates,
            merge_candidates,
        );
    }

    Some((segment_id, label))
}

/// Resolve every pending segment to exactly one non-zero label and fold the
/// frame's merge-candidate sets into the pairwise confidence table.
///
/// Returns the set of labels claimed through candidate support (fresh
/// labels for leftover segments are issued but not part of the exclusion
/// set, matching candidate recomputation semantics).
pub fn decide_segment_labels(
    segments: &mut [Segment],
    layer: &LabelLayer,
    backend: &dyn VolumetricBackend,
    allocator: &LabelAllocator,
    config: &LabelFusionConfig,
    candidates: &mut CandidateTable,
    merge_candidates: &mut MergeCandidates,
    pairwise: &mut PairwiseConfidence,
) -> BTreeSet<Label> {
    let mut assigned_labels = BTreeSet::new();
    let mut resolved = BTreeSet::new();

    while let Some((segment_id, label)) = next_segment_label_pair(
        segments,
        layer,
        backend,
        allocator,
        config,
        &resolved,
        &mut assigned_labels,
        candidates,
        merge_candidates,
    ) {
        let segment = &mut segments[segment_id];
        segment.labels = vec![label; segment.len()];
        resolved.insert(segment_id);
    }

    if config.enable_pairwise_confidence_merging {
        for (_, labels) in merge_candidates.iter() {
            let labels: Vec<Label> = labels.iter().copied().collect();
            pairwise.record_candidates(&labels);
        }
    }

    // Segments whose counts never cleared the threshold get unseen labels.
    let mut fresh_count = 0;
    for (segment_id, segment) in segments.iter_mut().enumerate() {
        if !resolved.contains(&segment_id) {
            let fresh = allocator.fresh_label();
            segment.labels = vec![fresh; segment.len()];
            fresh_count += 1;
        }
    }
    debug!(
        resolved = resolved.len(),
        fresh = fresh_count,
        "segment label resolution finished"
    );

    assigned_labels
}
