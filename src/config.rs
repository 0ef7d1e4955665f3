//! Process-wide configuration.
//!
//! Built once at startup and passed by reference; nothing here mutates after
//! construction. The extrinsic seed loader reads the same OpenCV-YAML layout
//! the calibration tooling writes (`R` 3×3, `T` 3×1, optional `Roo` re-basing
//! rotation).

use anyhow::{bail, Context, Result};
use nalgebra::{Matrix3, Vector3};
use opencv::core::{FileStorage, FileStorageTraitConst, FileNodeTraitConst, Mat};
use opencv::prelude::MatTraitConst;

use crate::imu::ImuNoise;

/// How camera-body extrinsics are treated by the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtrinsicMode {
    /// Use the configured extrinsics as-is.
    Fixed,
    /// Refine the configured extrinsics in the window optimization.
    Refine,
    /// No usable seed: calibrate the rotation online first, then refine.
    CalibrateOnline,
}

/// Semi-global block matching parameters for the depth generator.
#[derive(Debug, Clone, Copy)]
pub struct SgbmParams {
    pub min_disparity: i32,
    pub num_disparities: i32,
    pub block_size: i32,
    pub p1: i32,
    pub p2: i32,
    pub disp12_max_diff: i32,
    pub prefilter_cap: i32,
    pub uniqueness_ratio: i32,
    pub speckle_window_size: i32,
    pub speckle_range: i32,
    pub mode: i32,
}

impl Default for SgbmParams {
    fn default() -> Self {
        let block = 9;
        Self {
            min_disparity: 0,
            num_disparities: 64,
            block_size: block,
            p1: 8 * block * block,
            p2: 32 * block * block,
            disp12_max_diff: 1,
            prefilter_cap: 63,
            uniqueness_ratio: 10,
            speckle_window_size: 100,
            speckle_range: 2,
            mode: 0,
        }
    }
}

/// Estimator configuration. Defaults match a 460 px-focal stereo rig with a
/// few-hundred-Hz IMU.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of keyframe intervals in the window (slots 0..=window_size).
    pub window_size: usize,
    /// Number of cameras feeding the estimator (1 mono, 2 stereo).
    pub num_cameras: usize,
    pub use_imu: bool,
    pub stereo: bool,
    /// Fisheye rigs use unit-sphere reprojection residuals.
    pub fisheye: bool,
    pub enable_depth: bool,

    /// Focal length used to scale reprojection residuals (sqrt-information
    /// is `focal_length / 1.5` on normalized coordinates).
    pub focal_length: f64,
    /// Focal length used only by the keyframe-parallax threshold. The
    /// historical value is 460 regardless of the actual optics; it is kept
    /// as the default for behavioral compatibility.
    pub parallax_focal: f64,
    /// Keyframe threshold: mean parallax in pixels (at `parallax_focal`).
    pub min_parallax_px: f64,
    /// Keyframe threshold: minimum co-visible track count.
    pub min_covisible_tracks: usize,

    pub imu_freq: f64,
    pub image_freq: f64,
    /// Wall-clock budget for one window solve, seconds. The MARG_OLD path
    /// gets 4/5 of it, reserving the remainder for marginalization.
    pub solver_time: f64,
    pub num_iterations: usize,

    pub estimate_extrinsic: ExtrinsicMode,
    pub estimate_td: bool,
    /// Initial camera-IMU clock offset, seconds.
    pub td: f64,
    /// Camera-to-body translations, one per camera.
    pub tic: Vec<Vector3<f64>>,
    /// Camera-to-body rotations, one per camera.
    pub ric: Vec<Matrix3<f64>>,

    /// |g|, m/s².
    pub gravity_magnitude: f64,
    pub imu_noise: ImuNoise,

    /// Triangulated depths outside [min_depth, max_depth] are rejected.
    pub min_depth: f64,
    pub max_depth: f64,
    /// Mean reprojection error (pixels) above which a feature is an outlier.
    pub outlier_threshold_px: f64,

    /// Tracker: reverse optical-flow consistency check.
    pub flow_back: bool,
    /// Tracker: target number of maintained features.
    pub max_feature_count: usize,
    /// Tracker: minimum pixel spacing between maintained features.
    pub min_feature_distance: f64,

    /// Emit IMU timing warnings (sample-interval band checks).
    pub warn_imu_duration: bool,

    /// Depth generator z-range, meters.
    pub depth_z_min: f64,
    pub depth_z_max: f64,
    pub sgbm: SgbmParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_size: 10,
            num_cameras: 2,
            use_imu: true,
            stereo: true,
            fisheye: false,
            enable_depth: false,
            focal_length: 460.0,
            parallax_focal: 460.0,
            min_parallax_px: 10.0,
            min_covisible_tracks: 20,
            imu_freq: 400.0,
            image_freq: 20.0,
            solver_time: 0.04,
            num_iterations: 8,
            estimate_extrinsic: ExtrinsicMode::Fixed,
            estimate_td: false,
            td: 0.0,
            tic: vec![Vector3::zeros(), Vector3::new(0.1, 0.0, 0.0)],
            ric: vec![Matrix3::identity(), Matrix3::identity()],
            gravity_magnitude: 9.81,
            imu_noise: ImuNoise::default(),
            min_depth: 0.1,
            max_depth: 80.0,
            outlier_threshold_px: 3.0,
            flow_back: true,
            max_feature_count: 150,
            min_feature_distance: 30.0,
            warn_imu_duration: true,
            depth_z_min: 0.3,
            depth_z_max: 10.0,
            sgbm: SgbmParams::default(),
        }
    }
}

impl Config {
    /// World gravity vector (pointing down).
    pub fn gravity(&self) -> Vector3<f64> {
        Vector3::new(0.0, 0.0, -self.gravity_magnitude)
    }

    /// Keyframe-parallax threshold in normalized image coordinates.
    pub fn min_parallax(&self) -> f64 {
        self.min_parallax_px / self.parallax_focal
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size < 2 {
            bail!("window_size must be at least 2");
        }
        if self.tic.len() < self.num_cameras || self.ric.len() < self.num_cameras {
            bail!(
                "{} extrinsic seeds configured for {} cameras",
                self.tic.len().min(self.ric.len()),
                self.num_cameras
            );
        }
        if self.enable_depth && !self.stereo {
            bail!("depth generation requires a stereo configuration");
        }
        Ok(())
    }
}

/// Rigid extrinsic seed loaded from an OpenCV-YAML file.
#[derive(Debug, Clone)]
pub struct ExtrinsicSeed {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

/// Read an extrinsic seed: matrices `R` (3×3) and `T` (3×1), plus an optional
/// `Roo` (3×3) re-basing rotation applied as `R ← Roo·R·Rooᵀ`, `T ← Roo·T`.
pub fn load_extrinsic_seed(path: &str) -> Result<ExtrinsicSeed> {
    let fs = FileStorage::new(path, opencv::core::FileStorage_READ, "")
        .with_context(|| format!("opening extrinsic file {path}"))?;

    let r = read_matrix3(&fs, "R").with_context(|| format!("reading R from {path}"))?;
    let t = read_vector3(&fs, "T").with_context(|| format!("reading T from {path}"))?;

    let (rotation, translation) = match read_matrix3(&fs, "Roo") {
        Ok(roo) => (roo * r * roo.transpose(), roo * t),
        Err(_) => (r, t),
    };

    Ok(ExtrinsicSeed {
        rotation,
        translation,
    })
}

fn read_matrix3(fs: &FileStorage, name: &str) -> Result<Matrix3<f64>> {
    let mat: Mat = fs.get(name)?.mat()?;
    if mat.rows() != 3 || mat.cols() != 3 {
        bail!("{name} is {}x{}, expected 3x3", mat.rows(), mat.cols());
    }
    let mut out = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            out[(r, c)] = *mat.at_2d::<f64>(r as i32, c as i32)?;
        }
    }
    Ok(out)
}

fn read_vector3(fs: &FileStorage, name: &str) -> Result<Vector3<f64>> {
    let mat: Mat = fs.get(name)?.mat()?;
    if mat.rows() * mat.cols() != 3 {
        bail!("{name} has {} elements, expected 3", mat.rows() * mat.cols());
    }
    let mut out = Vector3::zeros();
    for i in 0..3 {
        out[i] = if mat.rows() == 3 {
            *mat.at_2d::<f64>(i as i32, 0)?
        } else {
            *mat.at_2d::<f64>(0, i as i32)?
        };
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_depth_without_stereo_rejected() {
        let cfg = Config {
            stereo: false,
            enable_depth: true,
            num_cameras: 1,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_min_parallax_uses_parallax_focal() {
        let cfg = Config {
            parallax_focal: 460.0,
            min_parallax_px: 10.0,
            ..Config::default()
        };
        approx::assert_relative_eq!(cfg.min_parallax(), 10.0 / 460.0);
    }
}
