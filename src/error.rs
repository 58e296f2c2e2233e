use crate::store::Label;

/// Errors that can occur during segment fusion operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FusionError {
    #[error("per-point array length mismatch: expected {expected} {field}, got {actual}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("segment {0} has no resolved labels; run assignment first")]
    UnresolvedSegment(usize),

    #[error("label {0} carries no voxels")]
    UnknownLabel(Label),

    #[error("invalid log-normal weight parameters (sigma must be positive, got {sigma})")]
    InvalidWeightParams { sigma: f64 },

    #[error("fusion worker count must be non-zero")]
    NoFusionWorkers,
}
