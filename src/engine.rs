//! The frame-oriented fusion engine - the crate's public facade.
//!
//! Owns the voxel label store and every cross-frame table, and sequences one
//! frame through its three stages: candidate computation at submission,
//! greedy label resolution, and concurrent fusion into the store. Merging
//! and publish scheduling run between frames on the accumulated evidence.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::assignment::decide_segment_labels;
use crate::bookkeeping::Bookkeeping;
use crate::candidates::{compute_segment_label_candidates, CandidateTable, MergeCandidates};
use crate::config::LabelFusionConfig;
use crate::error::FusionError;
use crate::fusion::{integrate_segment, ConfidenceWeight, ShardedVoxelLocks, VolumetricBackend};
use crate::merge::{merge_labels, MergeEvent, PairwiseConfidence};
use crate::segment::{Segment, SegmentId};
use crate::store::{
    FrameBookkeeping, GlobalVoxelIndex, InstanceId, Label, LabelAllocator, LabelLayer,
    SemanticClass,
};

/// What one completed frame produced: labels merged away and labels whose
/// geometry settled long enough to be worth publishing downstream.
#[derive(Debug, Default)]
pub struct FrameOutcome {
    pub merges: Vec<MergeEvent>,
    pub publish_ready: Vec<Label>,
}

/// Incremental multi-frame segment fusion over a sparse voxel label grid.
///
/// `B` is the base volumetric engine carrying the distance field; label
/// fusion layers object identity on top of it. All state between frames
/// lives here, so dropping the engine drops the map.
#[derive(Debug)]
pub struct SegmentFusion<B: VolumetricBackend> {
    config: LabelFusionConfig,
    backend: B,
    layer: LabelLayer,
    allocator: LabelAllocator,

    // Cross-frame fusion state.
    books: FrameBookkeeping,
    lifecycle: Bookkeeping,
    pairwise: PairwiseConfidence,
    locks: ShardedVoxelLocks,
    weight: ConfidenceWeight,

    // Rebuilt every frame.
    pending: Vec<Segment>,
    candidates: CandidateTable,
    merge_candidates: MergeCandidates,

    /// winner -> retired labels, drained by `take_merge_notifications`.
    merges_to_publish: BTreeMap<Label, BTreeSet<Label>>,
}

impl<B: VolumetricBackend> SegmentFusion<B> {
    pub fn new(
        config: LabelFusionConfig,
        backend: B,
        voxels_per_side: usize,
    ) -> Result<Self, FusionError> {
        Self::with_checkpoint(config, backend, voxels_per_side, 0, 0)
    }

    /// Resume from checkpointed label/instance counters so a reloaded map
    /// never reissues an identity it already handed out.
    pub fn with_checkpoint(
        config: LabelFusionConfig,
        backend: B,
        voxels_per_side: usize,
        highest_label: Label,
        highest_instance: InstanceId,
    ) -> Result<Self, FusionError> {
        if config.fusion_threads == 0 {
            return Err(FusionError::NoFusionWorkers);
        }
        let weight = ConfidenceWeight::from_config(&config)?;
        let layer = LabelLayer::new(backend.voxel_size(), voxels_per_side);
        Ok(Self {
            config,
            backend,
            layer,
            allocator: LabelAllocator::with_highest(highest_label, highest_instance),
            books: FrameBookkeeping::default(),
            lifecycle: Bookkeeping::default(),
            pairwise: PairwiseConfidence::default(),
            locks: ShardedVoxelLocks::new(),
            weight,
            pending: Vec::new(),
            candidates: CandidateTable::default(),
            merge_candidates: MergeCandidates::default(),
            merges_to_publish: BTreeMap::new(),
        })
    }

    // ========================================================================
    // FRAME PIPELINE
    // ========================================================================

    /// Queue one segment for the current frame and scan the store for its
    /// candidate labels. Empty segments are dropped; `None` is returned.
    pub fn submit_segment(&mut self, segment: Segment) -> Option<SegmentId> {
        if segment.is_empty() {
            debug!("dropping empty segment");
            return None;
        }
        let segment_id = self.pending.len();
        compute_segment_label_candidates(
            segment_id,
            &segment,
            &self.layer,
            &self.backend,
            &self.allocator,
            &self.config,
            &BTreeSet::new(),
            &mut self.candidates,
            &mut self.merge_candidates,
        );
        self.pending.push(segment);
        Some(segment_id)
    }

    /// Resolve every queued segment to one label and fold the frame's
    /// instance and class predictions into the persistent vote tables.
    pub fn resolve_frame(&mut self) {
        decide_segment_labels(
            &mut self.pending,
            &self.layer,
            &self.backend,
            &self.allocator,
            &self.config,
            &mut self.candidates,
            &mut self.merge_candidates,
            &mut self.pairwise,
        );
        self.candidates.clear();
        self.merge_candidates.clear();

        // Persistent instance association: larger segments claim first so
        // the dominant view of an object anchors its identity.
        let mut order: Vec<SegmentId> = (0..self.pending.len()).collect();
        order.sort_by_key(|&id| std::cmp::Reverse(self.pending[id].len()));
        let mut claimed: BTreeSet<InstanceId> = BTreeSet::new();

        for id in order {
            let segment = &self.pending[id];
            let label = segment.label();
            self.lifecycle.record_frame(label);
            if segment.instance == 0 {
                // An unpredicted segment still reserves its label's current
                // instance so no predicted segment claims it this frame.
                let current = self.lifecycle.best_instance(
                    label,
                    &claimed,
                    self.config.instance_vote_sufficiency_factor,
                );
                if current != 0 {
                    claimed.insert(current);
                }
                continue;
            }
            let persistent = match self.lifecycle.lookup_frame_instance(segment.instance) {
                Some(persistent) => persistent,
                None => {
                    let best = self.lifecycle.best_instance(
                        label,
                        &claimed,
                        self.config.instance_vote_sufficiency_factor,
                    );
                    let persistent = if best != 0 {
                        best
                    } else {
                        self.allocator.fresh_instance()
                    };
                    self.lifecycle.map_frame_instance(segment.instance, persistent);
                    persistent
                }
            };
            claimed.insert(persistent);
            self.lifecycle.vote_instance(label, persistent);
            if let Some(class) = segment.semantic_class {
                self.lifecycle.vote_class(label, class);
            }
        }
    }

    /// Fuse every resolved segment into the store. Errors if any queued
    /// segment was never resolved; `resolve_frame` must run first. On error
    /// the already-fused prefix leaves the queue, so a retry after fixing
    /// the failing segment never fuses a segment twice.
    pub fn integrate_frame(&mut self) -> Result<(), FusionError> {
        for id in 0..self.pending.len() {
            if let Err(error) = integrate_segment(
                id,
                &self.pending[id],
                &mut self.layer,
                &mut self.books,
                &self.backend,
                &self.config,
                &self.locks,
                &self.weight,
            ) {
                self.pending.drain(..id);
                return Err(error);
            }
        }
        self.pending.clear();
        Ok(())
    }

    /// Apply every merge whose pairwise evidence cleared the threshold and
    /// stage the retired labels for downstream notification.
    pub fn apply_pending_merges(&mut self) -> Vec<MergeEvent> {
        let events = merge_labels(
            &mut self.layer,
            &mut self.books,
            &mut self.pairwise,
            &mut self.lifecycle,
            &self.config,
        );
        self.stage_merge_notifications(&events);
        events
    }

    fn stage_merge_notifications(&mut self, events: &[MergeEvent]) {
        for event in events {
            // A loser that had already absorbed labels hands them on.
            let mut retired = self
                .merges_to_publish
                .remove(&event.loser)
                .unwrap_or_default();
            retired.insert(event.loser);
            self.merges_to_publish
                .entry(event.winner)
                .or_default()
                .extend(retired);
        }
    }

    /// End-of-frame publish scheduling: labels touched this frame restart
    /// their age clock; untouched labels age, and those past the flushing
    /// threshold drain out as ready to publish.
    pub fn labels_to_publish(&mut self) -> Vec<Label> {
        let touched = std::mem::take(&mut self.books.updated_labels);
        for label in touched {
            self.lifecycle.reset_age(label);
        }
        self.lifecycle.clear_frame_instances();
        self.lifecycle
            .flush_publish_ready(self.config.object_flushing_age_threshold)
    }

    /// Run the remaining frame stages in order: resolution, fusion, merging
    /// and publish scheduling.
    pub fn finish_frame(&mut self) -> Result<FrameOutcome, FusionError> {
        let queued = self.pending.len();
        self.resolve_frame();
        self.integrate_frame()?;
        let merges = self.apply_pending_merges();
        let publish_ready = self.labels_to_publish();
        info!(
            segments = queued,
            merges = merges.len(),
            publish_ready = publish_ready.len(),
            "frame finished"
        );
        Ok(FrameOutcome { merges, publish_ready })
    }

    /// Winner -> retired-labels notifications accumulated since the last
    /// call; drains the table.
    pub fn take_merge_notifications(&mut self) -> BTreeMap<Label, BTreeSet<Label>> {
        std::mem::take(&mut self.merges_to_publish)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn config(&self) -> &LabelFusionConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn layer(&self) -> &LabelLayer {
        &self.layer
    }

    /// Voxels currently won by `label`. Errors when the label holds none.
    pub fn extract_label(&self, label: Label) -> Result<Vec<GlobalVoxelIndex>, FusionError> {
        if !self.books.voxel_counts().contains(label) {
            return Err(FusionError::UnknownLabel(label));
        }
        Ok(self.layer.voxels_with_label(label))
    }

    pub fn voxel_count(&self, label: Label) -> i64 {
        self.books.voxel_counts().count(label)
    }

    /// Labels currently winning at least one voxel.
    pub fn labels_with_voxels(&self) -> Vec<Label> {
        self.books.voxel_counts().labels()
    }

    /// The persistent instance currently associated with `label`, or 0.
    pub fn instance_of_label(&self, label: Label) -> InstanceId {
        self.lifecycle.best_instance(
            label,
            &BTreeSet::new(),
            self.config.instance_vote_sufficiency_factor,
        )
    }

    pub fn class_of_label(&self, label: Label) -> Option<SemanticClass> {
        self.lifecycle.best_class(label)
    }

    /// Snapshot of the instance segmentation: persistent instance -> labels
    /// currently voting for it, over labels that still hold voxels.
    pub fn instance_map(&self) -> BTreeMap<InstanceId, Vec<Label>> {
        let mut instances: BTreeMap<InstanceId, Vec<Label>> = BTreeMap::new();
        for label in self.labels_with_voxels() {
            let instance = self.instance_of_label(label);
            if instance != 0 {
                instances.entry(instance).or_default().push(label);
            }
        }
        instances
    }

    pub fn highest_label(&self) -> Label {
        self.allocator.highest_label()
    }

    pub fn highest_instance(&self) -> InstanceId {
        self.allocator.highest_instance()
    }
}
