//! Feature tracker contract and the built-in KLT implementation.
//!
//! The estimator only consumes `FeatureFrame`s; anything that can produce
//! one (CPU KLT, GPU trackers, replay from disk) plugs in behind the
//! `FeatureTracker` trait.

pub mod klt;

use std::collections::HashMap;

use anyhow::Result;
use nalgebra::Vector3;
use opencv::core::Mat;

use crate::feature::{FeatureFrame, FeatureId};

/// Synchronous per-image feature tracker.
pub trait FeatureTracker: Send {
    /// Track one image (pair) and emit the per-frame feature observations.
    fn track_image(&mut self, t: f64, left: &Mat, right: Option<&Mat>) -> Result<FeatureFrame>;

    /// Hint where features should appear in the next frame, as camera-frame
    /// points for the main camera.
    fn set_prediction(&mut self, predictions: &HashMap<FeatureId, Vector3<f64>>);

    /// Load per-camera intrinsics from calibration files.
    fn read_intrinsic_parameter(&mut self, calib_files: &[String]) -> Result<()>;
}

pub use klt::KltTracker;
