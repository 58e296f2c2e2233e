//! One frame's point cluster hypothesized to belong to a single object.

use nalgebra::{Isometry3, Point3};

use crate::error::FusionError;
use crate::store::{InstanceId, Label, SemanticClass};

/// Index of a segment within the current frame's submission order.
pub type SegmentId = usize;

/// A labeled point segment from the perception front end.
///
/// Owned by the frame pipeline and dropped once the frame is integrated.
/// `labels` stays empty until the assignment resolver fills it.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Point positions in the sensor frame.
    pub points: Vec<Point3<f32>>,

    /// Pose of the sensor frame in the world frame.
    pub pose: Isometry3<f32>,

    /// Per-point colors (unused by label fusion, carried for the base
    /// volumetric integration).
    pub colors: Vec<[u8; 3]>,

    /// Per-point assigned labels, filled in by the resolver.
    pub labels: Vec<Label>,

    /// Semantic class predicted for this segment, if any.
    pub semantic_class: Option<SemanticClass>,

    /// Frame-local transient instance id; 0 means no instance prediction.
    pub instance: InstanceId,
}

impl Segment {
    /// Build a segment, rejecting mismatched per-point arrays.
    pub fn new(
        points: Vec<Point3<f32>>,
        pose: Isometry3<f32>,
        colors: Vec<[u8; 3]>,
    ) -> Result<Self, FusionError> {
        if colors.len() != points.len() {
            return Err(FusionError::LengthMismatch {
                field: "colors",
                expected: points.len(),
                actual: colors.len(),
            });
        }
        Ok(Self {
            points,
            pose,
            colors,
            labels: Vec::new(),
            semantic_class: None,
            instance: 0,
        })
    }

    /// Build a segment carrying a semantic class and transient instance id.
    pub fn with_semantics(
        points: Vec<Point3<f32>>,
        pose: Isometry3<f32>,
        colors: Vec<[u8; 3]>,
        semantic_class: SemanticClass,
        instance: InstanceId,
    ) -> Result<Self, FusionError> {
        let mut segment = Self::new(points, pose, colors)?;
        segment.semantic_class = Some(semantic_class);
        segment.instance = instance;
        Ok(segment)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// A point transformed into the world frame.
    #[inline]
    pub fn point_in_world(&self, index: usize) -> Point3<f32> {
        self.pose * self.points[index]
    }

    /// The segment's resolved label (all points share one label), or 0.
    pub fn label(&self) -> Label {
        self.labels.first().copied().unwrap_or(0)
    }

    pub fn is_resolved(&self) -> bool {
        !self.labels.is_empty()
    }
}
