//! Runtime configuration for the label fusion engine.

use serde::{Deserialize, Serialize};

/// Configuration for label propagation, pairwise merging and publishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelFusionConfig {
    /// Minimum supporting voxel count for a label assignment to qualify
    /// (default: 20)
    pub min_label_voxel_count: usize,

    /// Multiplies the voxel size to bound the surface-distance band
    /// eligible for label propagation (default: 1.0)
    pub label_propagation_td_factor: f32,

    /// Accumulate pairwise co-occurrence evidence and merge labels once
    /// it clears `pairwise_confidence_count_threshold` (default: true)
    pub enable_pairwise_confidence_merging: bool,

    /// Fraction of a segment's points a label must support to become a
    /// merge candidate (default: 0.2)
    pub pairwise_confidence_ratio_threshold: f32,

    /// Co-occurrence count past which two labels are merged (default: 30)
    pub pairwise_confidence_count_threshold: i32,

    /// Frames of inactivity before a label is reported publish-ready
    /// (default: 3)
    pub object_flushing_age_threshold: i32,

    /// Attenuate per-voxel label confidence with ray distance using a
    /// log-normal pdf (default: false)
    pub enable_confidence_weight_dropoff: bool,

    /// Location parameter of the log-normal dropoff (default: 0.0)
    pub lognormal_weight_mean: f64,

    /// Scale parameter of the log-normal dropoff (default: 1.8)
    pub lognormal_weight_sigma: f64,

    /// Distance subtracted from the ray length before evaluating the pdf
    /// (default: 0.7)
    pub lognormal_weight_offset: f64,

    /// An instance must hold more than `factor * (frames_seen - votes)`
    /// votes to be reused for a label (default: 0.0)
    pub instance_vote_sufficiency_factor: f32,

    /// Worker threads for the parallel fusion phase (default: 8)
    pub fusion_threads: usize,
}

impl Default for LabelFusionConfig {
    fn default() -> Self {
        Self {
            min_label_voxel_count: 20,
            label_propagation_td_factor: 1.0,
            enable_pairwise_confidence_merging: true,
            pairwise_confidence_ratio_threshold: 0.2,
            pairwise_confidence_count_threshold: 30,
            object_flushing_age_threshold: 3,
            enable_confidence_weight_dropoff: false,
            lognormal_weight_mean: 0.0,
            lognormal_weight_sigma: 1.8,
            lognormal_weight_offset: 0.7,
            instance_vote_sufficiency_factor: 0.0,
            fusion_threads: 8,
        }
    }
}
