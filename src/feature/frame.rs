//! Per-image tracker output consumed by the estimator.

use std::collections::BTreeMap;

use nalgebra::{Vector2, Vector3};

pub type FeatureId = u64;

/// One tracked point on one camera of one image.
#[derive(Debug, Clone, Copy)]
pub struct TrackedPoint {
    pub camera_id: usize,
    /// Projective ray in the camera frame (z = 1 for pinhole, unit-norm for
    /// fisheye).
    pub point: Vector3<f64>,
    /// Raw pixel coordinates.
    pub uv: Vector2<f64>,
    /// Time derivative of the undistorted normalized coordinates.
    pub velocity: Vector2<f64>,
}

/// All observations of one image, keyed by feature id. Each entry carries the
/// main-camera observation first, followed by any right-camera observation.
pub type FeatureFrame = BTreeMap<FeatureId, Vec<TrackedPoint>>;
