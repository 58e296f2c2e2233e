//! segfuse: incremental segment-label fusion over a sparse voxel grid.
//!
//! Depth-camera segments arrive frame by frame; the engine associates each
//! with a persistent object label, fuses per-voxel label confidence in
//! parallel, merges labels whose co-occurrence evidence says they are the
//! same object, and schedules settled labels for publishing. The distance
//! field itself belongs to a base volumetric engine behind the
//! [`VolumetricBackend`] trait; this crate layers object identity on top.

pub mod assignment;
pub mod bookkeeping;
pub mod candidates;
pub mod config;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod merge;
pub mod segment;
pub mod store;

pub use config::LabelFusionConfig;
pub use engine::{FrameOutcome, SegmentFusion};
pub use error::FusionError;
pub use fusion::VolumetricBackend;
pub use merge::MergeEvent;
pub use segment::{Segment, SegmentId};
pub use store::{
    GlobalVoxelIndex, InstanceId, Label, LabelConfidence, LabelLayer, LabelVoxel, SemanticClass,
    UNASSIGNED_LABEL,
};
