//! Bookkeeping of visual features across the sliding window.
//!
//! The manager owns every feature currently observed by the window: its
//! anchor slot (`start_frame`), the contiguous per-slot observation list, and
//! the inverse depth expressed in the anchor frame's main camera. Window
//! slides call back into the manager to shift anchors and re-express depths.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{Matrix3, Matrix4, SMatrix, Vector2, Vector3};
use opencv::calib3d;
use opencv::core::{Mat, Point2d, Point3d, Vector};
use opencv::prelude::*;
use tracing::{debug, warn};

use super::frame::{FeatureFrame, FeatureId};
use crate::config::Config;

/// Depth assigned is valid only inside this state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveFlag {
    Unestimated,
    Estimated,
    Rejected,
}

/// One stored observation of a feature in one window slot.
#[derive(Debug, Clone)]
pub struct FeatureObservation {
    pub point: Vector3<f64>,
    pub uv: Vector2<f64>,
    pub velocity: Vector2<f64>,
    /// Right-camera observation, when the tracker matched it across the pair.
    pub point_right: Option<Vector3<f64>>,
    pub velocity_right: Option<Vector2<f64>>,
    /// Camera-IMU time offset in effect when this observation was taken.
    pub td: f64,
}

impl FeatureObservation {
    pub fn is_stereo(&self) -> bool {
        self.point_right.is_some()
    }
}

/// A feature tracked across consecutive window slots.
#[derive(Debug, Clone)]
pub struct Feature {
    pub feature_id: FeatureId,
    /// First window slot observing this feature.
    pub start_frame: usize,
    /// Observations for slots start_frame, start_frame+1, … (contiguous).
    pub observations: Vec<FeatureObservation>,
    /// Depth in the anchor frame's main camera; negative when unestimated.
    pub estimated_depth: f64,
    pub solve_flag: SolveFlag,
    pub main_cam: usize,
}

impl Feature {
    fn new(feature_id: FeatureId, start_frame: usize) -> Self {
        Self {
            feature_id,
            start_frame,
            observations: Vec::new(),
            estimated_depth: -1.0,
            solve_flag: SolveFlag::Unestimated,
            main_cam: 0,
        }
    }

    /// Last window slot observing this feature.
    pub fn end_frame(&self) -> usize {
        self.start_frame + self.observations.len() - 1
    }

    /// Whether this feature carries enough observations to enter the window
    /// optimization: four slots of track, or a stereo anchor with a second
    /// slot.
    pub fn solvable(&self) -> bool {
        self.observations.len() >= 4
            || (self.observations.len() >= 2
                && self.observations.first().map_or(false, |o| o.is_stereo()))
    }
}

/// Feature bookkeeping layer shared by the estimator, initializer, and
/// optimizer.
pub struct FeatureManager {
    pub features: BTreeMap<FeatureId, Feature>,
    /// Number of features tracked into the newest frame.
    pub last_track_num: usize,
    min_parallax: f64,
    min_covisible: usize,
    min_depth: f64,
    max_depth: f64,
}

impl FeatureManager {
    pub fn new(config: &Config) -> Self {
        Self {
            features: BTreeMap::new(),
            last_track_num: 0,
            min_parallax: config.min_parallax(),
            min_covisible: config.min_covisible_tracks,
            min_depth: config.min_depth,
            max_depth: config.max_depth,
        }
    }

    pub fn clear(&mut self) {
        self.features.clear();
        self.last_track_num = 0;
    }

    /// Insert one image's observations at `frame_count` and decide whether
    /// the previous frame should be kept as a keyframe.
    ///
    /// Returns true for the MARG_OLD path (keyframe), false for
    /// MARG_SECOND_NEW.
    pub fn add_frame_and_check_parallax(
        &mut self,
        frame_count: usize,
        frame: &FeatureFrame,
        td: f64,
    ) -> bool {
        self.last_track_num = 0;

        for (&feature_id, points) in frame {
            let main = match points.iter().find(|p| p.camera_id == 0) {
                Some(p) => p,
                None => continue,
            };
            let right = points.iter().find(|p| p.camera_id == 1);

            let obs = FeatureObservation {
                point: main.point,
                uv: main.uv,
                velocity: main.velocity,
                point_right: right.map(|p| p.point),
                velocity_right: right.map(|p| p.velocity),
                td,
            };

            if let Some(feature) = self.features.get_mut(&feature_id) {
                feature.observations.push(obs);
                self.last_track_num += 1;
            } else {
                let mut feature = Feature::new(feature_id, frame_count);
                feature.observations.push(obs);
                self.features.insert(feature_id, feature);
            }
        }

        if frame_count < 2 || self.last_track_num < self.min_covisible {
            return true;
        }

        let mut parallax_sum = 0.0;
        let mut parallax_num = 0;
        for feature in self.features.values() {
            if feature.start_frame + 2 <= frame_count && feature.end_frame() + 1 >= frame_count {
                parallax_sum += compensated_parallax(feature, frame_count);
                parallax_num += 1;
            }
        }

        if parallax_num == 0 {
            true
        } else {
            let mean = parallax_sum / parallax_num as f64;
            debug!(mean_parallax = mean, parallax_num, "keyframe parallax");
            mean >= self.min_parallax
        }
    }

    /// Paired bearings of every feature observed in both slots l and r.
    pub fn get_corresponding(&self, l: usize, r: usize) -> Vec<(Vector3<f64>, Vector3<f64>)> {
        let mut corres = Vec::new();
        for feature in self.features.values() {
            if feature.start_frame <= l && feature.end_frame() >= r {
                let a = &feature.observations[l - feature.start_frame];
                let b = &feature.observations[r - feature.start_frame];
                corres.push((a.point, b.point));
            }
        }
        corres
    }

    /// Seed slot `frame_count`'s pose by PnP against features that already
    /// have depth, starting from the previous slot's pose.
    pub fn init_frame_pose_by_pnp(
        &self,
        frame_count: usize,
        ps: &mut [Vector3<f64>],
        rs: &mut [Matrix3<f64>],
        tic: &[Vector3<f64>],
        ric: &[Matrix3<f64>],
    ) {
        if frame_count == 0 {
            return;
        }

        let mut pts_3d: Vector<Point3d> = Vector::new();
        let mut pts_2d: Vector<Point2d> = Vector::new();
        for feature in self.features.values() {
            if feature.estimated_depth <= 0.0 || feature.end_frame() < frame_count {
                continue;
            }
            let anchor = &feature.observations[0];
            let pt_cam = anchor.point * feature.estimated_depth;
            let i = feature.start_frame;
            let pt_world = rs[i] * (ric[0] * pt_cam + tic[0]) + ps[i];
            let obs = &feature.observations[frame_count - feature.start_frame];
            pts_3d.push(Point3d::new(pt_world.x, pt_world.y, pt_world.z));
            pts_2d.push(Point2d::new(obs.point.x / obs.point.z, obs.point.y / obs.point.z));
        }

        if pts_3d.len() < 6 {
            debug!(candidates = pts_3d.len(), "too few depth features for PnP seed");
            return;
        }

        // Initial guess: previous slot's camera pose, world-to-camera.
        let r_wc = rs[frame_count - 1] * ric[0];
        let p_wc = ps[frame_count - 1] + rs[frame_count - 1] * tic[0];
        let r_cw = r_wc.transpose();
        let p_cw = -(r_cw * p_wc);

        let (rvec, tvec) = match solve_pnp(&pts_3d, &pts_2d, &r_cw, &p_cw) {
            Some(rt) => rt,
            None => {
                warn!("PnP pose seed failed");
                return;
            }
        };

        let r_cw = rvec;
        let p_cw = tvec;
        let r_wc = r_cw.transpose();
        let p_wc = -(r_wc * p_cw);
        rs[frame_count] = r_wc * ric[0].transpose();
        ps[frame_count] = p_wc - rs[frame_count] * tic[0];
    }

    /// Triangulate every feature without a depth estimate.
    ///
    /// Stereo anchors use the one-frame-two-camera pair; mono features use
    /// their first two observations. Depths outside [min_depth, max_depth]
    /// are rejected.
    pub fn triangulate(
        &mut self,
        ps: &[Vector3<f64>],
        rs: &[Matrix3<f64>],
        tic: &[Vector3<f64>],
        ric: &[Matrix3<f64>],
    ) {
        for feature in self.features.values_mut() {
            if feature.estimated_depth > 0.0 {
                continue;
            }

            let i = feature.start_frame;
            let anchor = &feature.observations[0];

            let depth = if anchor.is_stereo() {
                let t0 = ps[i] + rs[i] * tic[0];
                let r0 = rs[i] * ric[0];
                let t1 = ps[i] + rs[i] * tic[1];
                let r1 = rs[i] * ric[1];
                let point = triangulate_point(
                    &r0,
                    &t0,
                    &r1,
                    &t1,
                    &normalized(&anchor.point),
                    &normalized(&anchor.point_right.unwrap()),
                );
                point.map(|w| (r0.transpose() * (w - t0)).z)
            } else if feature.observations.len() >= 2 {
                let j = i + 1;
                let t0 = ps[i] + rs[i] * tic[0];
                let r0 = rs[i] * ric[0];
                let t1 = ps[j] + rs[j] * tic[0];
                let r1 = rs[j] * ric[0];
                let second = &feature.observations[1];
                let point = triangulate_point(
                    &r0,
                    &t0,
                    &r1,
                    &t1,
                    &normalized(&anchor.point),
                    &normalized(&second.point),
                );
                point.map(|w| (r0.transpose() * (w - t0)).z)
            } else {
                None
            };

            if let Some(depth) = depth {
                if depth > self.min_depth && depth < self.max_depth {
                    feature.estimated_depth = depth;
                }
            }
        }
    }

    /// MARG_OLD slide without a depth re-expression (pre-initialization).
    pub fn remove_back(&mut self) {
        self.features.retain(|_, feature| {
            if feature.start_frame != 0 {
                feature.start_frame -= 1;
                true
            } else {
                feature.observations.remove(0);
                !feature.observations.is_empty()
            }
        });
    }

    /// MARG_OLD slide with depth re-expression: features anchored at the
    /// marginalized slot move their anchor to the next slot, transporting the
    /// 3-D point through the old and new anchor camera poses.
    pub fn remove_back_shift_depth(
        &mut self,
        marg_r: &Matrix3<f64>,
        marg_p: &Vector3<f64>,
        new_r: &Matrix3<f64>,
        new_p: &Vector3<f64>,
    ) {
        self.features.retain(|_, feature| {
            if feature.start_frame != 0 {
                feature.start_frame -= 1;
                return true;
            }

            let anchor_point = feature.observations[0].point;
            feature.observations.remove(0);
            if feature.observations.len() < 2 {
                return false;
            }
            if feature.estimated_depth > 0.0 {
                let pt_marg = anchor_point * feature.estimated_depth;
                let pt_world = marg_r * pt_marg + marg_p;
                let pt_new = new_r.transpose() * (pt_world - new_p);
                if pt_new.z > 0.0 {
                    feature.estimated_depth = pt_new.z;
                } else {
                    feature.estimated_depth = -1.0;
                    feature.solve_flag = SolveFlag::Rejected;
                }
            }
            true
        });
    }

    /// MARG_SECOND_NEW slide: drop the observation at the discarded slot.
    pub fn remove_front(&mut self, frame_count: usize) {
        self.features.retain(|_, feature| {
            if feature.start_frame == frame_count {
                feature.start_frame -= 1;
                true
            } else {
                if feature.end_frame() < frame_count - 1 {
                    return true;
                }
                let j = frame_count - 1 - feature.start_frame;
                feature.observations.remove(j);
                !feature.observations.is_empty()
            }
        });
    }

    pub fn remove_outliers(&mut self, ids: &BTreeSet<FeatureId>) {
        self.features.retain(|id, _| !ids.contains(id));
    }

    /// Drop every feature whose depth solve was rejected.
    pub fn remove_failures(&mut self) {
        self.features
            .retain(|_, f| f.solve_flag != SolveFlag::Rejected);
    }

    pub fn clear_depth(&mut self) {
        for feature in self.features.values_mut() {
            feature.estimated_depth = -1.0;
            feature.solve_flag = SolveFlag::Unestimated;
        }
    }

    /// Inverse depths of every solvable feature, keyed by id.
    pub fn get_depth_vector(&self) -> BTreeMap<FeatureId, f64> {
        self.features
            .iter()
            .filter(|(_, f)| f.solvable() && f.estimated_depth > 0.0)
            .map(|(&id, f)| (id, 1.0 / f.estimated_depth))
            .collect()
    }

    /// Write back optimized inverse depths; non-positive depths are tagged
    /// rejected and reaped by `remove_failures`.
    pub fn set_depth(&mut self, depths: &BTreeMap<FeatureId, f64>) {
        for (id, &inv_depth) in depths {
            if let Some(feature) = self.features.get_mut(id) {
                feature.estimated_depth = 1.0 / inv_depth;
                feature.solve_flag = if feature.estimated_depth < 0.0 {
                    SolveFlag::Rejected
                } else {
                    SolveFlag::Estimated
                };
            }
        }
    }
}

/// Parallax of a feature between the second-last and third-last frames, in
/// normalized image coordinates. The rotation-compensated term reduces to
/// the uncompensated one here (identity compensation), kept as two terms to
/// mirror the original metric.
fn compensated_parallax(feature: &Feature, frame_count: usize) -> f64 {
    let frame_i = &feature.observations[frame_count - 2 - feature.start_frame];
    let frame_j = &feature.observations[frame_count - 1 - feature.start_frame];

    let p_j = frame_j.point;
    let (u_j, v_j) = (p_j.x / p_j.z, p_j.y / p_j.z);

    let p_i = frame_i.point;
    let (u_i, v_i) = (p_i.x / p_i.z, p_i.y / p_i.z);
    let du = u_i - u_j;
    let dv = v_i - v_j;

    let p_i_comp = p_i;
    let (u_i_comp, v_i_comp) = (p_i_comp.x / p_i_comp.z, p_i_comp.y / p_i_comp.z);
    let du_comp = u_i_comp - u_j;
    let dv_comp = v_i_comp - v_j;

    ((du * du + dv * dv).min(du_comp * du_comp + dv_comp * dv_comp)).sqrt()
}

fn normalized(point: &Vector3<f64>) -> Vector2<f64> {
    Vector2::new(point.x / point.z, point.y / point.z)
}

/// Linear (DLT) triangulation from two world-to-camera poses given as
/// camera-to-world (r, t) pairs.
fn triangulate_point(
    r0: &Matrix3<f64>,
    t0: &Vector3<f64>,
    r1: &Matrix3<f64>,
    t1: &Vector3<f64>,
    point0: &Vector2<f64>,
    point1: &Vector2<f64>,
) -> Option<Vector3<f64>> {
    let pose0 = projection_from_cam_pose(r0, t0);
    let pose1 = projection_from_cam_pose(r1, t1);

    let mut design = Matrix4::<f64>::zeros();
    for j in 0..4 {
        design[(0, j)] = point0.x * pose0[(2, j)] - pose0[(0, j)];
        design[(1, j)] = point0.y * pose0[(2, j)] - pose0[(1, j)];
        design[(2, j)] = point1.x * pose1[(2, j)] - pose1[(0, j)];
        design[(3, j)] = point1.y * pose1[(2, j)] - pose1[(1, j)];
    }

    let svd = design.svd(true, true);
    let v = svd.v_t?.transpose();
    let h = v.column(3);
    if h[3].abs() < 1e-10 {
        return None;
    }
    Some(Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}

/// World-to-camera 3×4 projection from a camera-to-world pose.
fn projection_from_cam_pose(r_wc: &Matrix3<f64>, t_wc: &Vector3<f64>) -> SMatrix<f64, 3, 4> {
    let r_cw = r_wc.transpose();
    let t_cw = -(r_cw * t_wc);
    let mut p = SMatrix::<f64, 3, 4>::zeros();
    p.fixed_view_mut::<3, 3>(0, 0).copy_from(&r_cw);
    p.fixed_view_mut::<3, 1>(0, 3).copy_from(&t_cw);
    p
}

/// Iterative PnP with an extrinsic guess; identity intrinsics because the
/// image points are already normalized.
pub(crate) fn solve_pnp(
    pts_3d: &Vector<Point3d>,
    pts_2d: &Vector<Point2d>,
    r_guess: &Matrix3<f64>,
    t_guess: &Vector3<f64>,
) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    let k = Mat::from_slice_2d(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]).ok()?;
    let dist = Mat::default();

    let mut rmat = Mat::from_slice_2d(&[
        [r_guess[(0, 0)], r_guess[(0, 1)], r_guess[(0, 2)]],
        [r_guess[(1, 0)], r_guess[(1, 1)], r_guess[(1, 2)]],
        [r_guess[(2, 0)], r_guess[(2, 1)], r_guess[(2, 2)]],
    ])
    .ok()?;
    let mut rvec = Mat::default();
    calib3d::rodrigues(&rmat, &mut rvec, &mut Mat::default()).ok()?;
    let mut tvec =
        Mat::from_slice_2d(&[[t_guess.x], [t_guess.y], [t_guess.z]]).ok()?;

    let ok = calib3d::solve_pnp(
        pts_3d,
        pts_2d,
        &k,
        &dist,
        &mut rvec,
        &mut tvec,
        true,
        calib3d::SOLVEPNP_ITERATIVE,
    )
    .ok()?;
    if !ok {
        return None;
    }

    rmat = Mat::default();
    calib3d::rodrigues(&rvec, &mut rmat, &mut Mat::default()).ok()?;
    let mut r = Matrix3::zeros();
    for i in 0..3 {
        for j in 0..3 {
            r[(i, j)] = *rmat.at_2d::<f64>(i as i32, j as i32).ok()?;
        }
    }
    let t = Vector3::new(
        *tvec.at_2d::<f64>(0, 0).ok()?,
        *tvec.at_2d::<f64>(1, 0).ok()?,
        *tvec.at_2d::<f64>(2, 0).ok()?,
    );
    Some((r, t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::frame::TrackedPoint;
    use approx::assert_relative_eq;

    fn manager() -> FeatureManager {
        FeatureManager::new(&Config::default())
    }

    fn mono_frame(points: &[(FeatureId, f64, f64)]) -> FeatureFrame {
        let mut frame = FeatureFrame::new();
        for &(id, x, y) in points {
            frame.insert(
                id,
                vec![TrackedPoint {
                    camera_id: 0,
                    point: Vector3::new(x, y, 1.0),
                    uv: Vector2::new(460.0 * x + 376.0, 460.0 * y + 240.0),
                    velocity: Vector2::zeros(),
                }],
            );
        }
        frame
    }

    #[test]
    fn test_first_frames_are_keyframes() {
        let mut fm = manager();
        let frame = mono_frame(&[(1, 0.0, 0.0), (2, 0.1, 0.1)]);
        assert!(fm.add_frame_and_check_parallax(0, &frame, 0.0));
        assert!(fm.add_frame_and_check_parallax(1, &frame, 0.0));
    }

    #[test]
    fn test_pure_rotation_is_not_a_keyframe() {
        // 20 features with zero translation in normalized coordinates across
        // three frames: parallax is zero, so the frame is a non-keyframe.
        let mut fm = manager();
        let points: Vec<(FeatureId, f64, f64)> =
            (0..20).map(|i| (i as FeatureId, 0.01 * i as f64, 0.0)).collect();
        let frame = mono_frame(&points);
        fm.add_frame_and_check_parallax(0, &frame, 0.0);
        fm.add_frame_and_check_parallax(1, &frame, 0.0);
        assert!(!fm.add_frame_and_check_parallax(2, &frame, 0.0));
    }

    #[test]
    fn test_translation_above_threshold_is_a_keyframe() {
        let mut fm = manager();
        let make = |shift: f64| {
            mono_frame(
                &(0..20)
                    .map(|i| (i as FeatureId, 0.01 * i as f64 + shift, 0.0))
                    .collect::<Vec<_>>(),
            )
        };
        fm.add_frame_and_check_parallax(0, &make(0.0), 0.0);
        fm.add_frame_and_check_parallax(1, &make(40.0 / 460.0), 0.0);
        // Parallax between slots 0 and 1 (the second-last pair) is 40 px at
        // the 460 parallax focal, far above the 10 px threshold.
        assert!(fm.add_frame_and_check_parallax(2, &make(80.0 / 460.0), 0.0));
    }

    #[test]
    fn test_low_covisibility_forces_keyframe() {
        let mut fm = manager();
        let frame = mono_frame(&[(1, 0.0, 0.0), (2, 0.1, 0.1)]);
        fm.add_frame_and_check_parallax(0, &frame, 0.0);
        fm.add_frame_and_check_parallax(1, &frame, 0.0);
        // Only 2 co-visible tracks, below the 20 minimum.
        assert!(fm.add_frame_and_check_parallax(2, &frame, 0.0));
    }

    #[test]
    fn test_remove_back_shifts_start_frames() {
        let mut fm = manager();
        let frame = mono_frame(&[(1, 0.0, 0.0)]);
        for i in 0..3 {
            fm.add_frame_and_check_parallax(i, &frame, 0.0);
        }
        let late = mono_frame(&[(2, 0.2, 0.0)]);
        fm.add_frame_and_check_parallax(3, &late, 0.0);

        fm.remove_back();
        assert_eq!(fm.features[&1].start_frame, 0);
        assert_eq!(fm.features[&1].observations.len(), 2);
        assert_eq!(fm.features[&2].start_frame, 2);
    }

    #[test]
    fn test_remove_back_drops_single_observation_features() {
        let mut fm = manager();
        fm.add_frame_and_check_parallax(0, &mono_frame(&[(7, 0.0, 0.0)]), 0.0);
        fm.remove_back();
        assert!(fm.features.is_empty());
    }

    #[test]
    fn test_remove_front_drops_second_newest_observation() {
        let mut fm = manager();
        let frame = mono_frame(&[(1, 0.0, 0.0)]);
        for i in 0..5 {
            fm.add_frame_and_check_parallax(i, &frame, 0.0);
        }
        fm.remove_front(4);
        let f = &fm.features[&1];
        assert_eq!(f.observations.len(), 4);
        assert_eq!(f.start_frame, 0);
    }

    #[test]
    fn test_shift_depth_reexpresses_anchor() {
        let mut fm = manager();
        let frame = mono_frame(&[(1, 0.0, 0.0)]);
        for i in 0..3 {
            fm.add_frame_and_check_parallax(i, &frame, 0.0);
        }
        fm.features.get_mut(&1).unwrap().estimated_depth = 5.0;

        // New anchor camera sits 1 m forward along the old optical axis.
        let r = Matrix3::identity();
        let p_old = Vector3::zeros();
        let p_new = Vector3::new(0.0, 0.0, 1.0);
        fm.remove_back_shift_depth(&r, &p_old, &r, &p_new);

        assert_relative_eq!(fm.features[&1].estimated_depth, 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_shift_depth_rejects_behind_camera() {
        let mut fm = manager();
        let frame = mono_frame(&[(1, 0.0, 0.0)]);
        for i in 0..3 {
            fm.add_frame_and_check_parallax(i, &frame, 0.0);
        }
        fm.features.get_mut(&1).unwrap().estimated_depth = 5.0;

        let r = Matrix3::identity();
        let p_new = Vector3::new(0.0, 0.0, 10.0);
        fm.remove_back_shift_depth(&r, &Vector3::zeros(), &r, &p_new);

        assert_eq!(fm.features[&1].solve_flag, SolveFlag::Rejected);
        fm.remove_failures();
        assert!(fm.features.is_empty());
    }

    #[test]
    fn test_triangulation_recovers_depth() {
        let mut fm = manager();
        // Point at (0, 0, 5) seen from two camera positions 0.5 m apart.
        let p_world = Vector3::new(0.0, 0.0, 5.0);
        let cam0 = Vector3::zeros();
        let cam1 = Vector3::new(0.5, 0.0, 0.0);
        let obs = |c: &Vector3<f64>| {
            let local = p_world - c;
            (local.x / local.z, local.y / local.z)
        };
        let (x0, y0) = obs(&cam0);
        let (x1, y1) = obs(&cam1);

        fm.add_frame_and_check_parallax(0, &mono_frame(&[(1, x0, y0)]), 0.0);
        fm.add_frame_and_check_parallax(1, &mono_frame(&[(1, x1, y1)]), 0.0);

        let ps = [cam0, cam1];
        let rs = [Matrix3::identity(), Matrix3::identity()];
        let tic = [Vector3::zeros(), Vector3::zeros()];
        let ric = [Matrix3::identity(), Matrix3::identity()];
        fm.triangulate(&ps, &rs, &tic, &ric);

        assert_relative_eq!(fm.features[&1].estimated_depth, 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_depth_vector_round_trip() {
        let mut fm = manager();
        let frame = mono_frame(&[(1, 0.0, 0.0)]);
        for i in 0..5 {
            fm.add_frame_and_check_parallax(i, &frame, 0.0);
        }
        fm.features.get_mut(&1).unwrap().estimated_depth = 4.0;

        let deps = fm.get_depth_vector();
        assert_relative_eq!(deps[&1], 0.25);

        let mut updated = BTreeMap::new();
        updated.insert(1, 0.5);
        fm.set_depth(&updated);
        assert_relative_eq!(fm.features[&1].estimated_depth, 2.0);
        assert_eq!(fm.features[&1].solve_flag, SolveFlag::Estimated);
    }
}
