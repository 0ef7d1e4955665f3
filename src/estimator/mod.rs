//! Sliding-window visual-inertial estimator.

pub mod sliding_window;

use nalgebra::{Matrix3, Vector3};

use crate::feature::FeatureFrame;
use crate::imu::Preintegration;

/// One image epoch buffered between initialization attempts: the raw
/// feature observations, the pose assigned by SfM/PnP, and the IMU delta
/// since the previous image.
pub struct ImageFrame {
    pub timestamp: f64,
    pub points: FeatureFrame,
    /// Body-to-world rotation.
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub pre_integration: Option<Preintegration>,
    pub is_key_frame: bool,
}

impl ImageFrame {
    pub fn new(timestamp: f64, points: FeatureFrame) -> Self {
        Self {
            timestamp,
            points,
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
            pre_integration: None,
            is_key_frame: false,
        }
    }
}

pub use sliding_window::{Estimator, MarginalizationFlag, SolverFlag};
