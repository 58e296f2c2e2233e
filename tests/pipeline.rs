//! End-to-end frame pipeline tests against a stub volumetric backend.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{Isometry3, Point3};
use segfuse::{
    GlobalVoxelIndex, LabelFusionConfig, MergeEvent, Segment, SegmentFusion, VolumetricBackend,
};

/// Everything sits on the observed surface and rays collapse to their
/// endpoint voxel; label semantics are exercised without TSDF numerics.
struct SlabBackend {
    voxel_size: f32,
}

impl VolumetricBackend for SlabBackend {
    fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    fn distance_at(&self, _point: &Point3<f32>) -> Option<f32> {
        Some(0.0)
    }

    fn cast_ray(&self, _origin: &Point3<f32>, endpoint: &Point3<f32>) -> Vec<GlobalVoxelIndex> {
        vec![[
            (endpoint.x / self.voxel_size).floor() as i64,
            (endpoint.y / self.voxel_size).floor() as i64,
            (endpoint.z / self.voxel_size).floor() as i64,
        ]]
    }
}

fn strip(xs: std::ops::Range<i64>) -> Segment {
    let points = xs
        .map(|x| Point3::new(x as f32 + 0.5, 0.5, 0.5))
        .collect::<Vec<_>>();
    let colors = vec![[128, 128, 128]; points.len()];
    Segment::new(points, Isometry3::identity(), colors).unwrap()
}

fn engine(config: LabelFusionConfig) -> SegmentFusion<SlabBackend> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    SegmentFusion::new(config, SlabBackend { voxel_size: 1.0 }, 8).unwrap()
}

#[test]
fn checkpointed_engine_issues_labels_past_the_counter() {
    let config = LabelFusionConfig {
        min_label_voxel_count: 1,
        fusion_threads: 2,
        ..Default::default()
    };
    let mut fusion = SegmentFusion::with_checkpoint(
        config,
        SlabBackend { voxel_size: 1.0 },
        8,
        5,
        0,
    )
    .unwrap();

    fusion.submit_segment(strip(0..10)).unwrap();
    fusion.finish_frame().unwrap();

    assert_eq!(fusion.labels_with_voxels(), vec![6]);
    assert_eq!(fusion.voxel_count(6), 10);
}

#[test]
fn contested_label_goes_to_the_larger_segment() {
    let config = LabelFusionConfig {
        min_label_voxel_count: 20,
        fusion_threads: 2,
        ..Default::default()
    };
    let mut fusion = engine(config);

    // Frame 1 establishes label 1 over thirty voxels.
    fusion.submit_segment(strip(0..30)).unwrap();
    fusion.finish_frame().unwrap();
    assert_eq!(fusion.labels_with_voxels(), vec![1]);

    // Frame 2: a partial view and a full view compete for label 1. The
    // full view wins; the partial view is displaced onto a fresh label.
    fusion.submit_segment(strip(0..25)).unwrap();
    fusion.submit_segment(strip(0..30)).unwrap();
    fusion.finish_frame().unwrap();

    assert_eq!(fusion.highest_label(), 2);
    // The fresh label's confidence never outweighs the reinforced label 1,
    // so label 1 still owns every voxel.
    assert_eq!(fusion.labels_with_voxels(), vec![1]);
    assert_eq!(fusion.voxel_count(1), 30);
}

#[test]
fn cooccurring_labels_merge_once_evidence_accumulates() {
    let config = LabelFusionConfig {
        min_label_voxel_count: 1,
        pairwise_confidence_count_threshold: 3,
        fusion_threads: 2,
        ..Default::default()
    };
    let mut fusion = engine(config);

    // Frame 1: two disjoint views of the same object get separate labels.
    fusion.submit_segment(strip(0..10)).unwrap();
    fusion.submit_segment(strip(20..30)).unwrap();
    fusion.finish_frame().unwrap();
    assert_eq!(fusion.labels_with_voxels(), vec![1, 2]);

    // Subsequent frames see the whole object as one segment (plus the
    // right half on its own), accumulating co-occurrence between 1 and 2.
    let mut merges: Vec<MergeEvent> = Vec::new();
    for _ in 0..4 {
        fusion.submit_segment(strip(0..30)).unwrap();
        fusion.submit_segment(strip(20..30)).unwrap();
        let outcome = fusion.finish_frame().unwrap();
        merges.extend(outcome.merges);
    }

    assert_eq!(merges, vec![MergeEvent { winner: 1, loser: 2 }]);
    assert_eq!(fusion.labels_with_voxels(), vec![1]);
    assert_eq!(fusion.voxel_count(1), 30);
    assert!(fusion.extract_label(2).is_err());
    assert_eq!(fusion.extract_label(1).unwrap().len(), 30);
    assert_eq!(
        fusion.take_merge_notifications(),
        BTreeMap::from([(1, BTreeSet::from([2]))])
    );
}

#[test]
fn settled_labels_flush_after_idle_frames() {
    let config = LabelFusionConfig {
        min_label_voxel_count: 1,
        object_flushing_age_threshold: 2,
        fusion_threads: 2,
        ..Default::default()
    };
    let mut fusion = engine(config);

    fusion.submit_segment(strip(0..5)).unwrap();
    let outcome = fusion.finish_frame().unwrap();
    assert!(outcome.publish_ready.is_empty());

    // One idle frame ages the label to 2; the next pushes it past the
    // threshold and flushes it.
    assert!(fusion.finish_frame().unwrap().publish_ready.is_empty());
    assert_eq!(fusion.finish_frame().unwrap().publish_ready, vec![1]);

    // Flushed means forgotten until the label claims voxels again; a
    // grown observation flips fresh voxels and restarts the clock.
    assert!(fusion.finish_frame().unwrap().publish_ready.is_empty());
    fusion.submit_segment(strip(0..8)).unwrap();
    assert!(fusion.finish_frame().unwrap().publish_ready.is_empty());
    assert!(fusion.finish_frame().unwrap().publish_ready.is_empty());
    assert_eq!(fusion.finish_frame().unwrap().publish_ready, vec![1]);
}

#[test]
fn instance_identity_survives_frames_and_merges() {
    let config = LabelFusionConfig {
        min_label_voxel_count: 1,
        fusion_threads: 2,
        ..Default::default()
    };
    let mut fusion = engine(config);

    for frame in 0..3 {
        let mut segment = strip(0..8);
        segment.semantic_class = Some(12);
        // The detector's frame-local instance id varies per frame.
        segment.instance = 100 + frame;
        fusion.submit_segment(segment).unwrap();
        fusion.finish_frame().unwrap();
    }

    let label = fusion.labels_with_voxels()[0];
    assert_eq!(fusion.highest_instance(), 1);
    assert_eq!(fusion.instance_of_label(label), 1);
    assert_eq!(fusion.class_of_label(label), Some(12));
    assert_eq!(fusion.instance_map(), BTreeMap::from([(1, vec![label])]));
}

#[test]
fn resolution_is_deterministic_across_runs() {
    let run = || {
        let config = LabelFusionConfig {
            min_label_voxel_count: 1,
            pairwise_confidence_count_threshold: 3,
            fusion_threads: 4,
            ..Default::default()
        };
        let mut fusion = engine(config);
        fusion.submit_segment(strip(0..10)).unwrap();
        fusion.submit_segment(strip(20..30)).unwrap();
        fusion.finish_frame().unwrap();
        for _ in 0..4 {
            fusion.submit_segment(strip(0..30)).unwrap();
            fusion.submit_segment(strip(20..30)).unwrap();
            fusion.finish_frame().unwrap();
        }
        (
            fusion.labels_with_voxels(),
            fusion.highest_label(),
            fusion.take_merge_notifications(),
        )
    };
    assert_eq!(run(), run());
}
