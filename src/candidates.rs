//! Candidate-label computation - stage 1 of the per-frame pipeline.
//!
//! For each incoming segment, scan the voxels its points land in and count,
//! per candidate label, how many points support it. Labels overlapping a
//! large enough fraction of the segment also become merge candidates.
//! A segment with no observed candidates synthesizes a fresh label so every
//! segment can eventually be assigned.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::LabelFusionConfig;
use crate::fusion::VolumetricBackend;
use crate::segment::{Segment, SegmentId};
use crate::store::{Label, LabelAllocator, LabelLayer, LabelVoxel, UNASSIGNED_LABEL};

/// Transient per-frame mapping: label -> (segment -> supporting point count).
///
/// Ordered maps keep pair selection deterministic (lowest label, then lowest
/// segment id, wins ties).
#[derive(Debug, Default)]
pub struct CandidateTable {
    by_label: BTreeMap<Label, BTreeMap<SegmentId, usize>>,
}

impl CandidateTable {
    pub fn is_empty(&self) -> bool {
        self.by_label.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_label.clear();
    }

    pub fn support(&self, label: Label, segment: SegmentId) -> usize {
        self.by_label
            .get(&label)
            .and_then(|segments| segments.get(&segment))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn iter(
        &self,
    ) -> impl Iterator<Item = (Label, &BTreeMap<SegmentId, usize>)> {
        self.by_label.iter().map(|(label, segments)| (*label, segments))
    }

    /// Increment support for (label, segment), returning the new count.
    fn increment(&mut self, label: Label, segment: SegmentId) -> usize {
        let count = self
            .by_label
            .entry(label)
            .or_default()
            .entry(segment)
            .or_insert(0);
        *count += 1;
        *count
    }

    /// Synthetic entry guaranteeing a previously unobserved segment gets
    /// assigned: full-count support under a fresh label.
    fn insert_fresh(&mut self, label: Label, segment: SegmentId, count: usize) {
        self.by_label.entry(label).or_default().insert(segment, count);
    }

    /// Drop the whole row of a claimed label.
    pub(crate) fn remove_label(&mut self, label: Label) {
        self.by_label.remove(&label);
    }

    /// Remove a segment's entries under every label except `keep`; done
    /// before its candidates are recomputed under a new exclusion set.
    pub(crate) fn purge_segment_except(&mut self, segment: SegmentId, keep: Label) {
        self.by_label.retain(|label, segments| {
            if *label != keep {
                segments.remove(&segment);
            }
            !segments.is_empty()
        });
    }
}

/// Per-segment merge-candidate label sets for the current frame; rewritten
/// whenever a segment's candidates are recomputed.
#[derive(Debug, Default)]
pub struct MergeCandidates {
    by_segment: BTreeMap<SegmentId, BTreeSet<Label>>,
}

impl MergeCandidates {
    pub fn clear(&mut self) {
        self.by_segment.clear();
    }

    pub fn labels_for(&self, segment: SegmentId) -> Option<&BTreeSet<Label>> {
        self.by_segment.get(&segment)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (SegmentId, &BTreeSet<Label>)> {
        self.by_segment.iter().map(|(id, labels)| (*id, labels))
    }

    fn set(&mut self, segment: SegmentId, labels: BTreeSet<Label>) {
        self.by_segment.insert(segment, labels);
    }
}

/// The next label this voxel can offer under the frame's exclusion set.
///
/// If the cached best label is unclaimed it wins directly; otherwise the
/// highest-confidence unclaimed entry wins, lowest label id on ties.
pub(crate) fn next_unassigned_label(
    voxel: &LabelVoxel,
    assigned_labels: &BTreeSet<Label>,
) -> Label {
    if !assigned_labels.contains(&voxel.best_label()) {
        return voxel.best_label();
    }
    let mut label = UNASSIGNED_LABEL;
    let mut max_confidence = 0.0;
    for entry in voxel.entries() {
        if assigned_labels.contains(&entry.label) {
            continue;
        }
        if entry.confidence > max_confidence
            || (entry.confidence == max_confidence
                && (label == UNASSIGNED_LABEL || entry.label < label))
        {
            max_confidence = entry.confidence;
            label = entry.label;
        }
    }
    label
}

/// Scan one segment against the store and populate the candidate table and
/// its merge-candidate set. Never mutates the store.
#[allow(clippy::too_many_arguments)]
pub fn compute_segment_label_candidates(
    segment_id: SegmentId,
    segment: &Segment,
    layer: &LabelLayer,
    backend: &dyn VolumetricBackend,
    allocator: &LabelAllocator,
    config: &LabelFusionConfig,
    assigned_labels: &BTreeSet<Label>,
    candidates: &mut CandidateTable,
    merge_candidates: &mut MergeCandidates,
) {
    let segment_points_count = segment.len();
    let band = config.label_propagation_td_factor * layer.voxel_size();
    let mut candidate_label_exists = false;
    let mut merge_labels = BTreeSet::new();

    for index in 0..segment_points_count {
        let point_world = segment.point_in_world(index);
        let Some(voxel) = layer.voxel_at_point(&point_world) else {
            continue;
        };
        let label = next_unassigned_label(voxel, assigned_labels);
        if label == UNASSIGNED_LABEL {
            // Allocated but unobserved voxel, or every entry is claimed.
            continue;
        }
        let within_band = backend
            .distance_at(&point_world)
            .is_some_and(|distance| distance.abs() < band);
        if !within_band {
            continue;
        }
        candidate_label_exists = true;
        let count = candidates.increment(label, segment_id);

        // Overlap is only judged from a label's second supporting point;
        // a single vote is not co-occurrence evidence.
        if config.enable_pairwise_confidence_merging && count > 1 {
            let overlap_ratio = count as f32 / segment_points_count as f32;
            if overlap_ratio > config.pairwise_confidence_ratio_threshold {
                merge_labels.insert(label);
            }
        }
    }

    if config.enable_pairwise_confidence_merging {
        merge_candidates.set(segment_id, merge_labels);
    }

    // Previously unobserved segment gets an unseen label.
    if !candidate_label_exists {
        let fresh = allocator.fresh_label();
        candidates.insert_fresh(fresh, segment_id, segment_points_count);
    }
}
