//! Stereo depth generation: rectification, semi-global block matching, and
//! back-projection into a world-frame point cloud.

use anyhow::{Context, Result};
use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};
use opencv::calib3d;
use opencv::core::{Mat, Rect, Size, CV_32F, CV_32FC1, CV_8UC1, NORM_MINMAX};
use opencv::prelude::*;
use opencv::imgproc;
use tracing::{debug, info};

use crate::config::SgbmParams;

/// Rectification products computed once from the first pair.
struct Rectification {
    map_l1: Mat,
    map_l2: Mat,
    map_r1: Mat,
    map_r2: Mat,
    q: Matrix4<f64>,
}

/// Per-pair disparity and point-cloud generator for one stereo rig.
pub struct DepthEstimator {
    params: SgbmParams,
    camera_matrix: Mat,
    /// Left-to-right rotation and translation.
    r: Matrix3<f64>,
    t: Vector3<f64>,
    z_min: f64,
    z_max: f64,
    rectification: Option<Rectification>,
}

impl DepthEstimator {
    pub fn new(
        params: SgbmParams,
        r01: Matrix3<f64>,
        t01: Vector3<f64>,
        k: Matrix3<f64>,
        z_min: f64,
        z_max: f64,
    ) -> Result<Self> {
        let camera_matrix = Mat::from_slice_2d(&[
            [k[(0, 0)], k[(0, 1)], k[(0, 2)]],
            [k[(1, 0)], k[(1, 1)], k[(1, 2)]],
            [k[(2, 0)], k[(2, 1)], k[(2, 2)]],
        ])?;
        Ok(Self {
            params,
            camera_matrix,
            r: r01,
            t: t01,
            z_min,
            z_max,
            rectification: None,
        })
    }

    /// Construct with the stereo R/T read from an extrinsic seed file.
    pub fn from_seed_file(
        params: SgbmParams,
        path: &str,
        k: Matrix3<f64>,
        z_min: f64,
        z_max: f64,
    ) -> Result<Self> {
        let seed = crate::config::load_extrinsic_seed(path)
            .with_context(|| format!("stereo seed {path}"))?;
        info!(rotation = ?seed.rotation, translation = ?seed.translation, "stereo extrinsics from file");
        Self::new(params, seed.rotation, seed.translation, k, z_min, z_max)
    }

    fn init_rectification(&mut self, size: Size) -> Result<()> {
        let r = Mat::from_slice_2d(&[
            [self.r[(0, 0)], self.r[(0, 1)], self.r[(0, 2)]],
            [self.r[(1, 0)], self.r[(1, 1)], self.r[(1, 2)]],
            [self.r[(2, 0)], self.r[(2, 1)], self.r[(2, 2)]],
        ])?;
        let t = Mat::from_slice_2d(&[[self.t.x], [self.t.y], [self.t.z]])?;
        let dist = Mat::default();

        let mut r1 = Mat::default();
        let mut r2 = Mat::default();
        let mut p1 = Mat::default();
        let mut p2 = Mat::default();
        let mut q_mat = Mat::default();
        calib3d::stereo_rectify(
            &self.camera_matrix,
            &dist,
            &self.camera_matrix,
            &dist,
            size,
            &r,
            &t,
            &mut r1,
            &mut r2,
            &mut p1,
            &mut p2,
            &mut q_mat,
            0,
            -1.0,
            Size::new(0, 0),
            &mut Rect::default(),
            &mut Rect::default(),
        )?;

        let mut map_l1 = Mat::default();
        let mut map_l2 = Mat::default();
        calib3d::init_undistort_rectify_map(
            &self.camera_matrix,
            &dist,
            &r1,
            &p1,
            size,
            CV_32FC1,
            &mut map_l1,
            &mut map_l2,
        )?;
        let mut map_r1 = Mat::default();
        let mut map_r2 = Mat::default();
        calib3d::init_undistort_rectify_map(
            &self.camera_matrix,
            &dist,
            &r2,
            &p2,
            size,
            CV_32FC1,
            &mut map_r1,
            &mut map_r2,
        )?;

        let mut q_f32 = Mat::default();
        q_mat.convert_to(&mut q_f32, CV_32F, 1.0, 0.0)?;
        let mut q = Matrix4::zeros();
        for i in 0..4 {
            for j in 0..4 {
                q[(i, j)] = *q_f32.at_2d::<f32>(i as i32, j as i32)? as f64;
            }
        }
        debug!(?q, "stereo rectification initialized");

        self.rectification = Some(Rectification {
            map_l1,
            map_l2,
            map_r1,
            map_r2,
            q,
        });
        Ok(())
    }

    /// Rectify, normalize, and run SGBM. Output is the S16 fixed-point
    /// disparity map (1/16 px units, negative where unmatched).
    pub fn disparity(&mut self, left: &Mat, right: &Mat) -> Result<Mat> {
        if self.rectification.is_none() {
            self.init_rectification(left.size()?)?;
        }
        let rect = self.rectification.as_ref().unwrap();

        let mut left_rect = Mat::default();
        let mut right_rect = Mat::default();
        imgproc::remap(
            left,
            &mut left_rect,
            &rect.map_l1,
            &rect.map_l2,
            imgproc::INTER_LINEAR,
            opencv::core::BORDER_CONSTANT,
            opencv::core::Scalar::all(0.0),
        )?;
        imgproc::remap(
            right,
            &mut right_rect,
            &rect.map_r1,
            &rect.map_r2,
            imgproc::INTER_LINEAR,
            opencv::core::BORDER_CONSTANT,
            opencv::core::Scalar::all(0.0),
        )?;

        let mut left_norm = Mat::default();
        let mut right_norm = Mat::default();
        opencv::core::normalize(
            &left_rect,
            &mut left_norm,
            0.0,
            255.0,
            NORM_MINMAX,
            CV_8UC1,
            &Mat::default(),
        )?;
        opencv::core::normalize(
            &right_rect,
            &mut right_norm,
            0.0,
            255.0,
            NORM_MINMAX,
            CV_8UC1,
            &Mat::default(),
        )?;

        let mut sgbm = calib3d::StereoSGBM::create(
            self.params.min_disparity,
            self.params.num_disparities,
            self.params.block_size,
            self.params.p1,
            self.params.p2,
            self.params.disp12_max_diff,
            self.params.prefilter_cap,
            self.params.uniqueness_ratio,
            self.params.speckle_window_size,
            self.params.speckle_range,
            self.params.mode,
        )?;
        let mut disparity = Mat::default();
        sgbm.compute(&left_norm, &right_norm, &mut disparity)?;
        Ok(disparity)
    }

    /// Disparity → camera-frame points via the rectification's Q matrix,
    /// dropping unmatched pixels and depths outside [z_min, z_max].
    pub fn points_from_disparity(&self, disparity: &Mat) -> Result<Vec<Vector3<f64>>> {
        let rect = self
            .rectification
            .as_ref()
            .context("disparity requested before rectification")?;
        let q = rect.q;

        let mut points = Vec::new();
        for y in 0..disparity.rows() {
            for x in 0..disparity.cols() {
                let raw = *disparity.at_2d::<i16>(y, x)?;
                if raw <= 0 {
                    continue;
                }
                let d = raw as f64 / 16.0;
                let h = q * Vector4::new(x as f64, y as f64, d, 1.0);
                if h.w.abs() < 1e-12 {
                    continue;
                }
                let p = Vector3::new(h.x / h.w, h.y / h.w, h.z / h.w);
                if p.z < self.z_min || p.z > self.z_max {
                    continue;
                }
                points.push(p);
            }
        }
        Ok(points)
    }

    /// Full pipeline for one pair: camera-frame cloud transformed into the
    /// world by the supplied left-camera pose.
    pub fn world_points(
        &mut self,
        left: &Mat,
        right: &Mat,
        r_wc: &Matrix3<f64>,
        t_wc: &Vector3<f64>,
    ) -> Result<Vec<Vector3<f64>>> {
        let disparity = self.disparity(left, right)?;
        let cloud = self.points_from_disparity(&disparity)?;
        Ok(cloud.iter().map(|p| r_wc * p + t_wc).collect())
    }
}
