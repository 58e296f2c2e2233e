//! The concurrent fusion protocol - writing resolved labels into the store.
//!
//! A fixed worker pool strides over the frame's bundled rays (a static,
//! lock-free partition), casts each ray through the base volumetric engine
//! and folds label confidence into every visited voxel. Per-voxel mutation
//! is guarded by a sharded lock keyed by a hash of the voxel index; global
//! per-label counters live behind one separate coarse lock. Blocks
//! discovered outside allocated storage are staged in a mutex-guarded side
//! table and merged into the layer single-threaded after all workers join.

use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use nalgebra::{Point3, Vector3};
use rustc_hash::{FxHashMap, FxHasher};
use statrs::distribution::{Continuous, LogNormal};
use tracing::{debug, trace};

use crate::config::LabelFusionConfig;
use crate::error::FusionError;
use crate::segment::{Segment, SegmentId};
use crate::store::{
    BlockIndex, FrameBookkeeping, GlobalVoxelIndex, Label, LabelBlock, LabelConfidence,
    LabelLayer, UNASSIGNED_LABEL,
};

// ============================================================================
// BASE ENGINE INTERFACE
// ============================================================================

/// The ray-to-voxel fusion capability supplied by the base volumetric
/// integration engine. The label engine composes with it instead of
/// inheriting from it: distance-field numerics stay on the other side of
/// this trait.
pub trait VolumetricBackend: Sync {
    /// Edge length of one voxel, in meters.
    fn voxel_size(&self) -> f32;

    /// Signed distance-field value at a world-frame point, or `None` where
    /// nothing has been observed yet.
    fn distance_at(&self, point: &Point3<f32>) -> Option<f32>;

    /// The voxel indices to fuse along the ray from `origin` to
    /// `endpoint`, bounded by the base engine's truncation band.
    fn cast_ray(&self, origin: &Point3<f32>, endpoint: &Point3<f32>) -> Vec<GlobalVoxelIndex>;
}

// ============================================================================
// SHARDED VOXEL LOCKS
// ============================================================================

/// One mutex per voxel would cost too much memory and one mutex per block
/// would bottleneck neighboring rays, so locks are sharded by the first
/// bits of the voxel index hash. With a uniform hash the chance of two
/// workers colliding on unrelated voxels is workers / 2^bits; 12 bits at
/// 8 workers gives ~0.2%.
pub(crate) struct ShardedVoxelLocks {
    shards: Vec<Mutex<()>>,
}

impl ShardedVoxelLocks {
    const SHARD_BITS: u32 = 12;

    pub(crate) fn new() -> Self {
        Self {
            shards: (0..1usize << Self::SHARD_BITS).map(|_| Mutex::new(())).collect(),
        }
    }

    pub(crate) fn guard(&self, index: &GlobalVoxelIndex) -> MutexGuard<'_, ()> {
        let mut hasher = FxHasher::default();
        index.hash(&mut hasher);
        let shard = hasher.finish() as usize & (self.shards.len() - 1);
        self.shards[shard].lock().unwrap()
    }
}

impl std::fmt::Debug for ShardedVoxelLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedVoxelLocks")
            .field("shards", &self.shards.len())
            .finish()
    }
}

// ============================================================================
// CONFIDENCE WEIGHT DROPOFF
// ============================================================================

/// Distance-based label confidence attenuation: a log-normal pdf over the
/// ray length past a fixed offset. Disabled, every vote weighs 1.0.
#[derive(Debug, Clone)]
pub(crate) struct ConfidenceWeight {
    distribution: Option<LogNormal>,
    offset: f64,
}

impl ConfidenceWeight {
    pub(crate) fn from_config(config: &LabelFusionConfig) -> Result<Self, FusionError> {
        if !config.enable_confidence_weight_dropoff {
            return Ok(Self { distribution: None, offset: 0.0 });
        }
        let distribution = LogNormal::new(config.lognormal_weight_mean, config.lognormal_weight_sigma)
            .map_err(|_| FusionError::InvalidWeightParams {
                sigma: config.lognormal_weight_sigma,
            })?;
        Ok(Self {
            distribution: Some(distribution),
            offset: config.lognormal_weight_offset,
        })
    }

    pub(crate) fn weight(&self, ray_distance: f32) -> LabelConfidence {
        match &self.distribution {
            None => 1.0,
            Some(distribution) => {
                let x = (ray_distance as f64 - self.offset).max(0.0);
                distribution.pdf(x) as LabelConfidence
            }
        }
    }
}

// ============================================================================
// INTEGRATION
// ============================================================================

/// Fuse one resolved, labeled segment into the store.
///
/// Parallel over the segment's bundled rays; single-threaded before
/// (bundling) and after (staged block insertion). Must not run while the
/// resolver or the merge engine is mutating the layer.
#[allow(clippy::too_many_arguments)]
pub fn integrate_segment(
    segment_id: SegmentId,
    segment: &Segment,
    layer: &mut LabelLayer,
    books: &mut FrameBookkeeping,
    backend: &dyn VolumetricBackend,
    config: &LabelFusionConfig,
    locks: &ShardedVoxelLocks,
    weight: &ConfidenceWeight,
) -> Result<(), FusionError> {
    if segment.is_empty() {
        return Ok(());
    }
    if segment.labels.len() != segment.len() || segment.label() == UNASSIGNED_LABEL {
        return Err(FusionError::UnresolvedSegment(segment_id));
    }
    let workers = config.fusion_threads;
    if workers == 0 {
        return Err(FusionError::NoFusionWorkers);
    }

    // All points of a segment carry the same resolved label.
    let label = segment.label();
    let origin = Point3::from(segment.pose.translation.vector);

    // Pre-compute the set of unique endpoint voxels and the points landing
    // in each; one ray is cast per bundle.
    let mut bundles: FxHashMap<GlobalVoxelIndex, Vec<usize>> = FxHashMap::default();
    for index in 0..segment.len() {
        let point_world = segment.point_in_world(index);
        bundles
            .entry(layer.global_index_of_point(&point_world))
            .or_default()
            .push(index);
    }
    let bundles: Vec<(&GlobalVoxelIndex, &Vec<usize>)> = {
        let mut entries: Vec<_> = bundles.iter().collect();
        // Deterministic work order regardless of hash-map iteration.
        entries.sort_by_key(|(index, _)| **index);
        entries
    };

    let staged: Mutex<FxHashMap<BlockIndex, Arc<LabelBlock>>> = Mutex::new(FxHashMap::default());
    let shared_books = Mutex::new(&mut *books);
    let layer_ref: &LabelLayer = layer;
    let bundle_count = bundles.len();

    crossbeam::thread::scope(|scope| {
        for worker in 0..workers {
            let bundles = &bundles;
            let staged = &staged;
            let shared_books = &shared_books;
            scope.spawn(move |_| {
                for (slot, (voxel_index, point_indices)) in bundles.iter().enumerate() {
                    // Interleaved striding: worker w takes every w-th bundle.
                    if slot % workers != worker {
                        continue;
                    }
                    trace!(worker, ?voxel_index, "fusing bundle");

                    let mut merged = Vector3::zeros();
                    for &point in point_indices.iter() {
                        merged += segment.points[point].coords;
                    }
                    let merged_sensor = Point3::from(merged / point_indices.len() as f32);
                    let confidence = weight.weight(merged_sensor.coords.norm());
                    let merged_world = segment.pose * merged_sensor;

                    for ray_voxel in backend.cast_ray(&origin, &merged_world) {
                        update_label_voxel(
                            layer_ref,
                            staged,
                            locks,
                            shared_books,
                            &ray_voxel,
                            label,
                            confidence,
                        );
                    }
                }
            });
        }
    })
    .expect("fusion worker panicked");

    // Strictly single-threaded: fold newly discovered blocks into the
    // layer's block index now that every worker has joined.
    let staged = staged.into_inner().unwrap();
    let staged_blocks = staged.len();
    for (index, block) in staged {
        layer.insert_block(index, block);
    }
    debug!(
        segment = segment_id,
        label,
        bundles = bundle_count,
        staged_blocks,
        "integrated segment"
    );
    Ok(())
}

/// One voxel's label update: accumulate confidence, recompute the cached
/// best label, and adjust the frame's global counters when the best label
/// changed. Thread safe.
fn update_label_voxel(
    layer: &LabelLayer,
    staged: &Mutex<FxHashMap<BlockIndex, Arc<LabelBlock>>>,
    locks: &ShardedVoxelLocks,
    books: &Mutex<&mut FrameBookkeeping>,
    global: &GlobalVoxelIndex,
    label: Label,
    confidence: LabelConfidence,
) {
    let block_index = layer.block_index_of(global);
    let block = match layer.block(&block_index) {
        Some(block) => Arc::clone(block),
        None => {
            // The staging table may only grow with one thread inside.
            let mut staged = staged.lock().unwrap();
            Arc::clone(
                staged
                    .entry(block_index)
                    .or_insert_with(|| Arc::new(LabelBlock::new(layer.voxels_per_side()))),
            )
        }
    };
    block.mark_updated();
    let linear = layer.linear_index_of(global);

    let previous;
    let current;
    {
        let _guard = locks.guard(global);
        // SAFETY: the shard lock serializes every access to this voxel for
        // the duration of the read-modify-write.
        let voxel = unsafe { block.voxel_mut_unchecked(linear) };
        previous = voxel.best_label();
        voxel.add_confidence(label, confidence);
        voxel.update_best(label);
        current = voxel.best_label();
    }

    if current != previous {
        // One segment gains a voxel, one loses a voxel. Updated far less
        // often than raw voxel writes, so a single coarse lock suffices.
        let mut books = books.lock().unwrap();
        books.updated_labels.insert(current);
        books.voxel_counts.adjust(current, 1);
        if previous != UNASSIGNED_LABEL {
            books.updated_labels.insert(previous);
            books.voxel_counts.adjust(previous, -1);
        }
    }
}

// ============================================================================
// TEST SUPPORT
// ============================================================================


#[cfg(test)]
mod tests {
    use super::testing::FlatBackend;
    use super::*;
    use nalgebra::Isometry3;

    fn labeled_segment(n: usize, label: Label) -> Segment {
        let points = (0..n)
            .map(|i| Point3::new(i as f32 + 0.5, 0.5, 0.5))
            .collect::<Vec<_>>();
        let colors = vec![[0, 0, 0]; n];
        let mut segment = Segment::new(points, Isometry3::identity(), colors).unwrap();
        segment.labels = vec![label; n];
        segment
    }

    fn config_with_threads(threads: usize) -> LabelFusionConfig {
        LabelFusionConfig {
            fusion_threads: threads,
            ..Default::default()
        }
    }

    #[test]
    fn test_unresolved_segment_is_rejected() {
        let mut segment = labeled_segment(2, 4);
        segment.labels.clear();
        let mut layer = LabelLayer::new(1.0, 8);
        let mut books = FrameBookkeeping::default();
        let backend = FlatBackend::new(1.0);
        let config = config_with_threads(1);
        let locks = ShardedVoxelLocks::new();
        let weight = ConfidenceWeight::from_config(&config).unwrap();

        let result = integrate_segment(
            3, &segment, &mut layer, &mut books, &backend, &config, &locks, &weight,
        );
        assert!(matches!(result, Err(FusionError::UnresolvedSegment(3))));
    }

    #[test]
    fn test_integration_writes_confidence_and_counts() {
        let segment = labeled_segment(5, 4);
        let mut layer = LabelLayer::new(1.0, 8);
        let mut books = FrameBookkeeping::default();
        let backend = FlatBackend::new(1.0);
        let config = config_with_threads(1);
        let locks = ShardedVoxelLocks::new();
        let weight = ConfidenceWeight::from_config(&config).unwrap();

        integrate_segment(
            0, &segment, &mut layer, &mut books, &backend, &config, &locks, &weight,
        )
        .unwrap();

        // Blocks were discovered through staging, then merged in.
        assert!(layer.num_blocks() > 0);
        assert_eq!(books.voxel_counts().count(4), 5);
        assert!(books.updated_labels.contains(&4));
        for x in 0..5 {
            let voxel = layer.voxel_at_index(&[x, 0, 0]).unwrap();
            assert_eq!(voxel.best_label(), 4);
            assert_eq!(voxel.confidence_of(4), Some(1.0));
        }
    }

    #[test]
    fn test_parallel_integration_matches_bundle_count() {
        // 64 points in distinct voxels, 4 workers: every voxel gets exactly
        // one vote, and the per-label count equals the bundle count.
        let segment = labeled_segment(64, 9);
        let mut layer = LabelLayer::new(1.0, 8);
        let mut books = FrameBookkeeping::default();
        let backend = FlatBackend::new(1.0);
        let config = config_with_threads(4);
        let locks = ShardedVoxelLocks::new();
        let weight = ConfidenceWeight::from_config(&config).unwrap();

        integrate_segment(
            0, &segment, &mut layer, &mut books, &backend, &config, &locks, &weight,
        )
        .unwrap();

        assert_eq!(books.voxel_counts().count(9), 64);
        for x in 0..64 {
            assert_eq!(layer.voxel_at_index(&[x, 0, 0]).unwrap().confidence_of(9), Some(1.0));
        }
    }

    #[test]
    fn test_repeated_integration_accumulates_monotonically() {
        let segment = labeled_segment(3, 2);
        let mut layer = LabelLayer::new(1.0, 8);
        let mut books = FrameBookkeeping::default();
        let backend = FlatBackend::new(1.0);
        let config = config_with_threads(2);
        let locks = ShardedVoxelLocks::new();
        let weight = ConfidenceWeight::from_config(&config).unwrap();

        for _ in 0..3 {
            integrate_segment(
                0, &segment, &mut layer, &mut books, &backend, &config, &locks, &weight,
            )
            .unwrap();
        }
        assert_eq!(layer.voxel_at_index(&[0, 0, 0]).unwrap().confidence_of(2), Some(3.0));
        // Count stays at the number of voxels, not votes.
        assert_eq!(books.voxel_counts().count(2), 3);
    }

    #[test]
    fn test_confidence_dropoff_attenuates_with_distance() {
        let config = LabelFusionConfig {
            enable_confidence_weight_dropoff: true,
            ..Default::default()
        };
        let weight = ConfidenceWeight::from_config(&config).unwrap();
        let near = weight.weight(config.lognormal_weight_offset as f32 + 1.0);
        let far = weight.weight(config.lognormal_weight_offset as f32 + 30.0);
        assert!(near > 0.0);
        assert!(far < near);

        let flat = ConfidenceWeight::from_config(&LabelFusionConfig::default()).unwrap();
        assert_eq!(flat.weight(100.0), 1.0);
    }

    #[test]
    fn test_invalid_lognormal_sigma_is_rejected() {
        let config = LabelFusionConfig {
            enable_confidence_weight_dropoff: true,
            lognormal_weight_sigma: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            ConfidenceWeight::from_config(&config),
            Err(FusionError::InvalidWeightParams { .. })
        ));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let segment = labeled_segment(1, 1);
        let mut layer = LabelLayer::new(1.0, 8);
        let mut books = FrameBookkeeping::default();
        let backend = FlatBackend::new(1.0);
        let config = config_with_threads(0);
        let locks = ShardedVoxelLocks::new();
        let weight = ConfidenceWeight::from_config(&LabelFusionConfig::default()).unwrap();

        assert!(matches!(
            integrate_segment(
                0, &segment, &mut layer, &mut books, &backend, &config, &locks, &weight,
            ),
            Err(FusionError::NoFusionWorkers)
        ));
    }
}
