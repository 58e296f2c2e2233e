//! The Voxel Label Store - sparse block-structured grid of label hypotheses.
//!
//! Each voxel holds a small fixed-capacity set of (label, confidence) entries
//! plus a cached best label. Blocks are addressed by integer index; the layer
//! grows on demand. The base volumetric engine owns the distance field; this
//! store only carries the label-specific state on top of it.

use std::cell::UnsafeCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use nalgebra::Point3;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Persistent integer identity for a fused object across frames.
/// 0 means "unassigned".
pub type Label = u32;

/// Persistent identity of a whole recognized object occurrence, coarser
/// than a label. 0 means "no instance".
pub type InstanceId = u32;

/// Semantic class identifier (detector vocabulary index).
pub type SemanticClass = u8;

/// Accumulated per-voxel support for one label.
pub type LabelConfidence = f32;

pub const UNASSIGNED_LABEL: Label = 0;

/// Integer index of a voxel in the global grid.
pub type GlobalVoxelIndex = [i64; 3];

/// Integer index of a block in the sparse layer.
pub type BlockIndex = [i64; 3];

/// Maximum competing label hypotheses stored per voxel. Only a few are
/// expected; votes for further labels are dropped until a merge frees a slot.
pub const MAX_LABELS_PER_VOXEL: usize = 8;

// ============================================================================
// LABEL VOXEL
// ============================================================================

/// One (label, confidence) entry of a voxel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LabelCount {
    pub label: Label,
    pub confidence: LabelConfidence,
}

/// Per spatial cell: bounded competing label entries plus the cached best.
#[derive(Debug, Clone, Default)]
pub struct LabelVoxel {
    entries: [LabelCount; MAX_LABELS_PER_VOXEL],
    best_label: Label,
    best_confidence: LabelConfidence,
}

impl LabelVoxel {
    /// The cached winning label (0 while unobserved).
    #[inline]
    pub fn best_label(&self) -> Label {
        self.best_label
    }

    #[inline]
    pub fn best_confidence(&self) -> LabelConfidence {
        self.best_confidence
    }

    /// The live (label, confidence) entries, skipping empty slots.
    pub fn entries(&self) -> impl Iterator<Item = &LabelCount> {
        self.entries
            .iter()
            .filter(|e| e.label != UNASSIGNED_LABEL)
    }

    pub fn confidence_of(&self, label: Label) -> Option<LabelConfidence> {
        self.entries().find(|e| e.label == label).map(|e| e.confidence)
    }

    /// Accumulate `confidence` onto `label`, reusing an existing entry or
    /// claiming the first free slot. A vote for an unseen label on a full
    /// voxel is dropped.
    pub fn add_confidence(&mut self, label: Label, confidence: LabelConfidence) {
        debug_assert!(label != UNASSIGNED_LABEL);
        debug_assert!(confidence >= 0.0);
        for entry in &mut self.entries {
            if entry.label == label {
                entry.confidence += confidence;
                return;
            }
        }
        for entry in &mut self.entries {
            if entry.label == UNASSIGNED_LABEL {
                entry.label = label;
                entry.confidence = confidence;
                return;
            }
        }
        debug!(label, "voxel label capacity exhausted, dropping vote");
    }

    /// Zero the entry for `label`, returning the confidence it held.
    pub fn take_confidence(&mut self, label: Label) -> LabelConfidence {
        for entry in &mut self.entries {
            if entry.label == label {
                let confidence = entry.confidence;
                *entry = LabelCount::default();
                return confidence;
            }
        }
        0.0
    }

    /// Recompute the cached best label from the stored entries.
    ///
    /// Deterministic tie-break at equal confidence: a non-zero
    /// `preferred` label wins, otherwise the lowest label id wins.
    pub fn update_best(&mut self, preferred: Label) {
        let mut best_label = UNASSIGNED_LABEL;
        let mut best_confidence = 0.0;
        for entry in self.entries.iter().filter(|e| e.label != UNASSIGNED_LABEL) {
            let wins = if entry.confidence != best_confidence {
                entry.confidence > best_confidence
            } else if best_label == UNASSIGNED_LABEL {
                true
            } else if preferred != UNASSIGNED_LABEL && best_label == preferred {
                false
            } else if preferred != UNASSIGNED_LABEL && entry.label == preferred {
                true
            } else {
                entry.label < best_label
            };
            if wins {
                best_label = entry.label;
                best_confidence = entry.confidence;
            }
        }
        self.best_label = best_label;
        self.best_confidence = best_confidence;
    }
}

// ============================================================================
// LABEL BLOCK
// ============================================================================

/// A cubic block of label voxels.
///
/// Voxel slots sit in `UnsafeCell` so the parallel fusion phase can mutate
/// distinct voxels through a shared reference while holding the sharded
/// voxel lock. All other mutation goes through `&mut LabelLayer`.
pub(crate) struct LabelBlock {
    voxels: Vec<UnsafeCell<LabelVoxel>>,
    updated: AtomicBool,
}

// SAFETY: concurrent access to a voxel slot only happens inside the fusion
// protocol, which serializes every read-modify-write of a given voxel index
// behind its shard lock (see `fusion::ShardedVoxelLocks`). Distinct voxels
// are distinct `UnsafeCell` slots.
unsafe impl Sync for LabelBlock {}
unsafe impl Send for LabelBlock {}

impl LabelBlock {
    pub(crate) fn new(voxels_per_side: usize) -> Self {
        let count = voxels_per_side * voxels_per_side * voxels_per_side;
        Self {
            voxels: (0..count).map(|_| UnsafeCell::new(LabelVoxel::default())).collect(),
            updated: AtomicBool::new(false),
        }
    }

    pub(crate) fn num_voxels(&self) -> usize {
        self.voxels.len()
    }

    pub(crate) fn mark_updated(&self) {
        self.updated.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_updated(&self) -> bool {
        self.updated.load(Ordering::Relaxed)
    }

    /// Read a voxel. Callers must not race this with a concurrent writer;
    /// outside the parallel fusion phase no writer exists.
    pub(crate) fn voxel(&self, linear: usize) -> &LabelVoxel {
        // SAFETY: see `Sync` impl; single-threaded phases have no writers.
        unsafe { &*self.voxels[linear].get() }
    }

    /// Mutable access through a shared reference.
    ///
    /// # Safety
    /// The caller must guarantee exclusive access to this voxel slot, either
    /// by holding its shard lock during the parallel fusion phase or by
    /// owning `&mut LabelLayer` outside it.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn voxel_mut_unchecked(&self, linear: usize) -> &mut LabelVoxel {
        &mut *self.voxels[linear].get()
    }
}

impl std::fmt::Debug for LabelBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabelBlock")
            .field("num_voxels", &self.voxels.len())
            .field("updated", &self.is_updated())
            .finish()
    }
}

// ============================================================================
// LABEL LAYER
// ============================================================================

/// Sparse map from block index to label block, plus the grid geometry.
#[derive(Debug)]
pub struct LabelLayer {
    blocks: FxHashMap<BlockIndex, Arc<LabelBlock>>,
    voxel_size: f32,
    voxel_size_inv: f32,
    voxels_per_side: usize,
}

impl LabelLayer {
    pub fn new(voxel_size: f32, voxels_per_side: usize) -> Self {
        assert!(voxel_size > 0.0, "voxel size must be positive");
        assert!(voxels_per_side > 0, "voxels per side must be positive");
        Self {
            blocks: FxHashMap::default(),
            voxel_size,
            voxel_size_inv: 1.0 / voxel_size,
            voxels_per_side,
        }
    }

    #[inline]
    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    #[inline]
    pub fn voxels_per_side(&self) -> usize {
        self.voxels_per_side
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    // ========================================================================
    // ADDRESSING
    // ========================================================================

    /// Global voxel index containing a world-frame point.
    pub fn global_index_of_point(&self, point: &Point3<f32>) -> GlobalVoxelIndex {
        [
            (point.x * self.voxel_size_inv).floor() as i64,
            (point.y * self.voxel_size_inv).floor() as i64,
            (point.z * self.voxel_size_inv).floor() as i64,
        ]
    }

    /// Block containing a global voxel index.
    pub fn block_index_of(&self, global: &GlobalVoxelIndex) -> BlockIndex {
        let vps = self.voxels_per_side as i64;
        [
            global[0].div_euclid(vps),
            global[1].div_euclid(vps),
            global[2].div_euclid(vps),
        ]
    }

    /// Linear in-block index of a global voxel index.
    pub fn linear_index_of(&self, global: &GlobalVoxelIndex) -> usize {
        let vps = self.voxels_per_side as i64;
        let x = global[0].rem_euclid(vps) as usize;
        let y = global[1].rem_euclid(vps) as usize;
        let z = global[2].rem_euclid(vps) as usize;
        x + self.voxels_per_side * (y + self.voxels_per_side * z)
    }

    /// Inverse of `block_index_of`/`linear_index_of`.
    pub fn global_index_from(&self, block: &BlockIndex, linear: usize) -> GlobalVoxelIndex {
        let vps = self.voxels_per_side;
        let x = linear % vps;
        let y = (linear / vps) % vps;
        let z = linear / (vps * vps);
        [
            block[0] * vps as i64 + x as i64,
            block[1] * vps as i64 + y as i64,
            block[2] * vps as i64 + z as i64,
        ]
    }

    // ========================================================================
    // VOXEL ACCESS
    // ========================================================================

    pub fn voxel_at_index(&self, global: &GlobalVoxelIndex) -> Option<&LabelVoxel> {
        let block = self.blocks.get(&self.block_index_of(global))?;
        Some(block.voxel(self.linear_index_of(global)))
    }

    pub fn voxel_at_point(&self, point: &Point3<f32>) -> Option<&LabelVoxel> {
        self.voxel_at_index(&self.global_index_of_point(point))
    }

    pub(crate) fn block(&self, index: &BlockIndex) -> Option<&Arc<LabelBlock>> {
        self.blocks.get(index)
    }

    pub(crate) fn allocate_block(&mut self, index: BlockIndex) -> &Arc<LabelBlock> {
        let vps = self.voxels_per_side;
        self.blocks
            .entry(index)
            .or_insert_with(|| Arc::new(LabelBlock::new(vps)))
    }

    /// Merge a staged block into the layer. Blocks discovered during the
    /// parallel fusion phase land here after all workers have joined.
    pub(crate) fn insert_block(&mut self, index: BlockIndex, block: Arc<LabelBlock>) {
        debug_assert!(
            !self.blocks.contains_key(&index),
            "staged block already allocated in layer"
        );
        self.blocks.insert(index, block);
    }

    /// Exclusive voxel access for the single-threaded phases.
    pub(crate) fn voxel_mut(&mut self, global: &GlobalVoxelIndex) -> Option<&mut LabelVoxel> {
        let linear = self.linear_index_of(global);
        let block = self.blocks.get(&self.block_index_of(global))?;
        // SAFETY: `&mut self` proves no other layer access is live. Block
        // Arcs never leave this crate and the fusion staging map is empty
        // outside the parallel phase, so no alias of this slot exists.
        Some(unsafe { block.voxel_mut_unchecked(linear) })
    }

    /// Visit every allocated voxel mutably; `f` returns whether it changed
    /// the voxel, which marks the owning block as updated.
    pub(crate) fn for_each_voxel_mut(
        &mut self,
        mut f: impl FnMut(&mut LabelVoxel) -> bool,
    ) {
        for block in self.blocks.values() {
            let mut touched = false;
            for linear in 0..block.num_voxels() {
                // SAFETY: as in `voxel_mut`; `&mut self` is exclusive.
                let voxel = unsafe { block.voxel_mut_unchecked(linear) };
                touched |= f(voxel);
            }
            if touched {
                block.mark_updated();
            }
        }
    }

    /// Indices of all voxels whose cached best label equals `label`.
    pub fn voxels_with_label(&self, label: Label) -> Vec<GlobalVoxelIndex> {
        let mut indices = Vec::new();
        for (block_index, block) in &self.blocks {
            for linear in 0..block.num_voxels() {
                if block.voxel(linear).best_label() == label {
                    indices.push(self.global_index_from(block_index, linear));
                }
            }
        }
        indices
    }
}

// ============================================================================
// PER-LABEL AGGREGATES
// ============================================================================

/// Live voxel count per label; entries are removed when they reach zero.
#[derive(Debug, Default)]
pub struct LabelVoxelCounts {
    counts: BTreeMap<Label, i64>,
}

impl LabelVoxelCounts {
    pub fn adjust(&mut self, label: Label, delta: i64) {
        if label == UNASSIGNED_LABEL {
            return;
        }
        match self.counts.get_mut(&label) {
            Some(count) => {
                *count += delta;
                if *count <= 0 {
                    self.counts.remove(&label);
                }
            }
            None => {
                debug_assert!(delta > 0, "count for unseen label went negative");
                if delta > 0 {
                    self.counts.insert(label, delta);
                }
            }
        }
    }

    pub fn count(&self, label: Label) -> i64 {
        self.counts.get(&label).copied().unwrap_or(0)
    }

    pub fn contains(&self, label: Label) -> bool {
        self.counts.contains_key(&label)
    }

    /// All labels currently holding at least one voxel.
    pub fn labels(&self) -> Vec<Label> {
        self.counts.keys().copied().collect()
    }
}

/// Cross-voxel bookkeeping mutated during a frame's fusion: which labels
/// were touched and how many voxels each label holds. Guarded by a single
/// coarse lock during the parallel phase.
#[derive(Debug, Default)]
pub struct FrameBookkeeping {
    pub(crate) updated_labels: BTreeSet<Label>,
    pub(crate) voxel_counts: LabelVoxelCounts,
}

impl FrameBookkeeping {
    pub fn voxel_counts(&self) -> &LabelVoxelCounts {
        &self.voxel_counts
    }
}

// ============================================================================
// LABEL / INSTANCE ALLOCATION
// ============================================================================

/// Issues monotonically increasing labels and instance ids.
///
/// Atomic so the fusion workers and the single-threaded resolution phases
/// share one counter without a lock-ordering window.
#[derive(Debug)]
pub struct LabelAllocator {
    highest_label: AtomicU32,
    highest_instance: AtomicU32,
}

impl LabelAllocator {
    pub fn new() -> Self {
        Self::with_highest(0, 0)
    }

    /// Resume from checkpointed counters.
    pub fn with_highest(highest_label: Label, highest_instance: InstanceId) -> Self {
        Self {
            highest_label: AtomicU32::new(highest_label),
            highest_instance: AtomicU32::new(highest_instance),
        }
    }

    /// Issue a never-before-seen label.
    ///
    /// # Panics
    /// Panics on counter overflow: continuing would alias an existing
    /// object identity and silently corrupt the shared grid.
    pub fn fresh_label(&self) -> Label {
        let previous = self.highest_label.fetch_add(1, Ordering::Relaxed);
        assert!(previous < Label::MAX, "label counter overflow");
        previous + 1
    }

    /// Issue a never-before-seen persistent instance id.
    ///
    /// # Panics
    /// Panics on counter overflow, as for `fresh_label`.
    pub fn fresh_instance(&self) -> InstanceId {
        let previous = self.highest_instance.fetch_add(1, Ordering::Relaxed);
        assert!(previous < InstanceId::MAX, "instance counter overflow");
        previous + 1
    }

    pub fn highest_label(&self) -> Label {
        self.highest_label.load(Ordering::Relaxed)
    }

    pub fn highest_instance(&self) -> InstanceId {
        self.highest_instance.load(Ordering::Relaxed)
    }
}

impl Default for LabelAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
