//! Pyramidal Lucas-Kanade feature tracker for pinhole stereo rigs.
//!
//! Tracks corners frame-to-frame with optional reverse-flow verification,
//! replenishes up to the configured feature count with minimum-distance
//! masking, matches survivors left-to-right, and reports undistorted
//! bearings plus pixel velocities.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use nalgebra::{Vector2, Vector3};
use opencv::core::{
    FileStorageTraitConst, FileNodeTraitConst, Mat, Point2f, Scalar, Size, TermCriteria, Vector,
    CV_8UC1,
};
use opencv::prelude::*;
use opencv::{imgproc, video};
use tracing::debug;

use super::FeatureTracker;
use crate::camera::{CameraModel, PinholeCamera};
use crate::feature::{FeatureFrame, FeatureId, TrackedPoint};

/// Forward/backward track agreement threshold, pixels.
const FLOW_BACK_DIST: f64 = 0.5;
/// LK window.
const LK_WIN: i32 = 21;

pub struct KltTracker {
    max_count: usize,
    min_distance: f64,
    flow_back: bool,

    cameras: Vec<Box<dyn CameraModel>>,

    prev_img: Mat,
    prev_pts: Vector<Point2f>,
    ids: Vec<FeatureId>,
    track_cnt: Vec<u32>,
    next_id: FeatureId,

    prev_un_pts: HashMap<FeatureId, Vector2<f64>>,
    prev_un_right_pts: HashMap<FeatureId, Vector2<f64>>,
    prev_time: f64,

    has_prediction: bool,
    predict_pts: Vector<Point2f>,
}

impl KltTracker {
    pub fn new(max_count: usize, min_distance: f64, flow_back: bool) -> Self {
        Self {
            max_count,
            min_distance,
            flow_back,
            cameras: Vec::new(),
            prev_img: Mat::default(),
            prev_pts: Vector::new(),
            ids: Vec::new(),
            track_cnt: Vec::new(),
            next_id: 0,
            prev_un_pts: HashMap::new(),
            prev_un_right_pts: HashMap::new(),
            prev_time: 0.0,
            has_prediction: false,
            predict_pts: Vector::new(),
        }
    }

    pub fn with_cameras(
        max_count: usize,
        min_distance: f64,
        flow_back: bool,
        cameras: Vec<Box<dyn CameraModel>>,
    ) -> Self {
        let mut tracker = Self::new(max_count, min_distance, flow_back);
        tracker.cameras = cameras;
        tracker
    }

    fn in_border(&self, pt: &Point2f) -> bool {
        let (w, h) = self.cameras[0].image_size();
        let x = pt.x.round() as i32;
        let y = pt.y.round() as i32;
        x >= 1 && x < w as i32 - 1 && y >= 1 && y < h as i32 - 1
    }

    /// Keep long-tracked features first and blank a min-distance disc around
    /// each survivor so replenishment spreads out.
    fn set_mask(&mut self, cur_pts: &mut Vector<Point2f>) -> Result<Mat> {
        let (w, h) = self.cameras[0].image_size();
        let mut mask =
            Mat::new_rows_cols_with_default(h as i32, w as i32, CV_8UC1, Scalar::all(255.0))?;

        let mut order: Vec<usize> = (0..cur_pts.len()).collect();
        let track_cnt = self.track_cnt.clone();
        order.sort_by(|&a, &b| track_cnt[b].cmp(&track_cnt[a]));

        let old_pts = cur_pts.clone();
        let old_ids = std::mem::take(&mut self.ids);
        let old_cnt = std::mem::take(&mut self.track_cnt);
        cur_pts.clear();

        for idx in order {
            let pt = old_pts.get(idx)?;
            let px = opencv::core::Point::new(pt.x.round() as i32, pt.y.round() as i32);
            if *mask.at_2d::<u8>(px.y, px.x)? == 255 {
                cur_pts.push(pt);
                self.ids.push(old_ids[idx]);
                self.track_cnt.push(old_cnt[idx]);
                imgproc::circle(
                    &mut mask,
                    px,
                    self.min_distance as i32,
                    Scalar::all(0.0),
                    -1,
                    imgproc::LINE_8,
                    0,
                )?;
            }
        }
        Ok(mask)
    }

    fn undistorted(&self, pts: &Vector<Point2f>, cam: usize) -> Vec<Vector2<f64>> {
        pts.iter()
            .map(|p| {
                let ray = self.cameras[cam].lift(&Vector2::new(p.x as f64, p.y as f64));
                Vector2::new(ray.x / ray.z, ray.y / ray.z)
            })
            .collect()
    }

    /// Velocity of each undistorted point against the previous frame's map.
    fn pts_velocity(
        ids: &[FeatureId],
        un_pts: &[Vector2<f64>],
        prev_map: &HashMap<FeatureId, Vector2<f64>>,
        dt: f64,
    ) -> Vec<Vector2<f64>> {
        ids.iter()
            .zip(un_pts)
            .map(|(id, p)| match prev_map.get(id) {
                Some(prev) if dt > 0.0 => (p - prev) / dt,
                _ => Vector2::zeros(),
            })
            .collect()
    }
}

impl FeatureTracker for KltTracker {
    fn track_image(&mut self, t: f64, left: &Mat, right: Option<&Mat>) -> Result<FeatureFrame> {
        if self.cameras.is_empty() {
            bail!("tracker has no intrinsics; call read_intrinsic_parameter first");
        }
        let cur_img = left.clone();
        let mut cur_pts: Vector<Point2f> = Vector::new();

        if !self.prev_pts.is_empty() {
            let mut status: Vector<u8> = Vector::new();
            let mut err: Vector<f32> = Vector::new();
            let criteria = TermCriteria::new(
                opencv::core::TermCriteria_COUNT + opencv::core::TermCriteria_EPS,
                30,
                0.01,
            )?;

            if self.has_prediction {
                cur_pts = self.predict_pts.clone();
                video::calc_optical_flow_pyr_lk(
                    &self.prev_img,
                    &cur_img,
                    &self.prev_pts,
                    &mut cur_pts,
                    &mut status,
                    &mut err,
                    Size::new(LK_WIN, LK_WIN),
                    1,
                    criteria,
                    video::OPTFLOW_USE_INITIAL_FLOW,
                    1e-4,
                )?;
                let succeeded = status.iter().filter(|&s| s != 0).count();
                if succeeded < 10 {
                    video::calc_optical_flow_pyr_lk(
                        &self.prev_img,
                        &cur_img,
                        &self.prev_pts,
                        &mut cur_pts,
                        &mut status,
                        &mut err,
                        Size::new(LK_WIN, LK_WIN),
                        3,
                        criteria,
                        0,
                        1e-4,
                    )?;
                }
            } else {
                video::calc_optical_flow_pyr_lk(
                    &self.prev_img,
                    &cur_img,
                    &self.prev_pts,
                    &mut cur_pts,
                    &mut status,
                    &mut err,
                    Size::new(LK_WIN, LK_WIN),
                    3,
                    criteria,
                    0,
                    1e-4,
                )?;
            }

            if self.flow_back {
                let mut reverse_status: Vector<u8> = Vector::new();
                let mut reverse_pts = self.prev_pts.clone();
                video::calc_optical_flow_pyr_lk(
                    &cur_img,
                    &self.prev_img,
                    &cur_pts,
                    &mut reverse_pts,
                    &mut reverse_status,
                    &mut err,
                    Size::new(LK_WIN, LK_WIN),
                    1,
                    criteria,
                    video::OPTFLOW_USE_INITIAL_FLOW,
                    1e-4,
                )?;
                for i in 0..status.len() {
                    let keep = status.get(i)? != 0
                        && reverse_status.get(i)? != 0
                        && pt_distance(&self.prev_pts.get(i)?, &reverse_pts.get(i)?)
                            <= FLOW_BACK_DIST;
                    status.set(i, u8::from(keep))?;
                }
            }

            for i in 0..cur_pts.len() {
                if status.get(i)? != 0 && !self.in_border(&cur_pts.get(i)?) {
                    status.set(i, 0)?;
                }
            }

            let keep: Vec<bool> = status.iter().map(|s| s != 0).collect();
            cur_pts = filter_points(&cur_pts, &keep)?;
            self.ids = filter_vec(&self.ids, &keep);
            self.track_cnt = filter_vec(&self.track_cnt, &keep);
        }

        for n in self.track_cnt.iter_mut() {
            *n += 1;
        }

        let mask = self.set_mask(&mut cur_pts)?;
        let missing = self.max_count.saturating_sub(cur_pts.len());
        if missing > self.max_count / 4 {
            let mut new_pts: Vector<Point2f> = Vector::new();
            imgproc::good_features_to_track(
                &cur_img,
                &mut new_pts,
                missing as i32,
                0.01,
                self.min_distance,
                &mask,
                3,
                false,
                0.04,
            )?;
            for p in new_pts.iter() {
                cur_pts.push(p);
                self.ids.push(self.next_id);
                self.track_cnt.push(1);
                self.next_id += 1;
            }
        }

        let dt = t - self.prev_time;
        let cur_un_pts = self.undistorted(&cur_pts, 0);
        let velocities = Self::pts_velocity(&self.ids, &cur_un_pts, &self.prev_un_pts, dt);

        let mut frame = FeatureFrame::new();
        for (i, id) in self.ids.iter().enumerate() {
            let px = cur_pts.get(i)?;
            frame.insert(
                *id,
                vec![TrackedPoint {
                    camera_id: 0,
                    point: Vector3::new(cur_un_pts[i].x, cur_un_pts[i].y, 1.0),
                    uv: Vector2::new(px.x as f64, px.y as f64),
                    velocity: velocities[i],
                }],
            );
        }

        let mut cur_un_right = HashMap::new();
        if let Some(right_img) = right {
            if self.cameras.len() >= 2 && !cur_pts.is_empty() {
                let mut right_pts: Vector<Point2f> = Vector::new();
                let mut status: Vector<u8> = Vector::new();
                let mut err: Vector<f32> = Vector::new();
                let criteria = TermCriteria::new(
                    opencv::core::TermCriteria_COUNT + opencv::core::TermCriteria_EPS,
                    30,
                    0.01,
                )?;
                video::calc_optical_flow_pyr_lk(
                    &cur_img,
                    right_img,
                    &cur_pts,
                    &mut right_pts,
                    &mut status,
                    &mut err,
                    Size::new(LK_WIN, LK_WIN),
                    3,
                    criteria,
                    0,
                    1e-4,
                )?;
                if self.flow_back {
                    let mut reverse_left: Vector<Point2f> = Vector::new();
                    let mut reverse_status: Vector<u8> = Vector::new();
                    video::calc_optical_flow_pyr_lk(
                        right_img,
                        &cur_img,
                        &right_pts,
                        &mut reverse_left,
                        &mut reverse_status,
                        &mut err,
                        Size::new(LK_WIN, LK_WIN),
                        3,
                        criteria,
                        0,
                        1e-4,
                    )?;
                    for i in 0..status.len() {
                        let keep = status.get(i)? != 0
                            && reverse_status.get(i)? != 0
                            && self.in_border(&right_pts.get(i)?)
                            && pt_distance(&cur_pts.get(i)?, &reverse_left.get(i)?)
                                <= FLOW_BACK_DIST;
                        status.set(i, u8::from(keep))?;
                    }
                }

                let keep: Vec<bool> = status.iter().map(|s| s != 0).collect();
                let matched_pts = filter_points(&right_pts, &keep)?;
                let matched_ids = filter_vec(&self.ids, &keep);
                let un_right = self.undistorted(&matched_pts, 1);
                let right_vel =
                    Self::pts_velocity(&matched_ids, &un_right, &self.prev_un_right_pts, dt);

                for (i, id) in matched_ids.iter().enumerate() {
                    let px = matched_pts.get(i)?;
                    if let Some(obs) = frame.get_mut(id) {
                        obs.push(TrackedPoint {
                            camera_id: 1,
                            point: Vector3::new(un_right[i].x, un_right[i].y, 1.0),
                            uv: Vector2::new(px.x as f64, px.y as f64),
                            velocity: right_vel[i],
                        });
                    }
                    cur_un_right.insert(*id, un_right[i]);
                }
            }
        }

        debug!(
            tracked = self.ids.len(),
            stereo = cur_un_right.len(),
            "tracked image"
        );

        self.prev_img = cur_img;
        self.prev_pts = cur_pts;
        self.prev_un_pts = self.ids.iter().copied().zip(cur_un_pts).collect();
        self.prev_un_right_pts = cur_un_right;
        self.prev_time = t;
        self.has_prediction = false;

        Ok(frame)
    }

    fn set_prediction(&mut self, predictions: &HashMap<FeatureId, Vector3<f64>>) {
        self.has_prediction = true;
        self.predict_pts.clear();
        for (i, id) in self.ids.iter().enumerate() {
            match predictions.get(id) {
                Some(p_cam) if p_cam.z > 0.0 => {
                    let uv = self.cameras[0].project(p_cam);
                    self.predict_pts.push(Point2f::new(uv.x as f32, uv.y as f32));
                }
                _ => {
                    if let Ok(p) = self.prev_pts.get(i) {
                        self.predict_pts.push(p);
                    }
                }
            }
        }
    }

    fn read_intrinsic_parameter(&mut self, calib_files: &[String]) -> Result<()> {
        self.cameras.clear();
        for path in calib_files {
            let fs = opencv::core::FileStorage::new(path, opencv::core::FileStorage_READ, "")
                .with_context(|| format!("opening intrinsic file {path}"))?;
            let k: Mat = fs.get("K")?.mat()?;
            let width = fs.get("image_width")?.to_i32()? as u32;
            let height = fs.get("image_height")?.to_i32()? as u32;
            self.cameras.push(Box::new(PinholeCamera::new(
                *k.at_2d::<f64>(0, 0)?,
                *k.at_2d::<f64>(1, 1)?,
                *k.at_2d::<f64>(0, 2)?,
                *k.at_2d::<f64>(1, 2)?,
                width,
                height,
            )));
        }
        Ok(())
    }
}

fn pt_distance(a: &Point2f, b: &Point2f) -> f64 {
    let dx = (a.x - b.x) as f64;
    let dy = (a.y - b.y) as f64;
    (dx * dx + dy * dy).sqrt()
}

fn filter_points(pts: &Vector<Point2f>, keep: &[bool]) -> opencv::Result<Vector<Point2f>> {
    let mut out = Vector::new();
    for (i, &k) in keep.iter().enumerate() {
        if k {
            out.push(pts.get(i)?);
        }
    }
    Ok(out)
}

fn filter_vec<T: Copy>(v: &[T], keep: &[bool]) -> Vec<T> {
    v.iter()
        .zip(keep)
        .filter_map(|(x, &k)| k.then_some(*x))
        .collect()
}
