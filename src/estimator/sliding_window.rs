//! The sliding-window core: window state, IMU propagation, keyframe
//! management, initialization dispatch, window optimization, and
//! marginalization.
//!
//! One instance is owned by the measurement pipeline's process thread; no
//! other thread touches it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use nalgebra::{Matrix3, UnitQuaternion, Vector2, Vector3};
use tracing::{debug, info, warn};

use super::ImageFrame;
use crate::config::{Config, ExtrinsicMode};
use crate::feature::{FeatureFrame, FeatureId, FeatureManager};
use crate::geometry::{gravity_to_rotation, rotation_to_ypr, ypr_to_rotation};
use crate::imu::Preintegration;
use crate::init::{
    check_imu_excitation, linear_alignment, solve_gyroscope_bias, solve_relative_rt, GlobalSfm,
    InitialExRotation, SfmFeature,
};
use crate::marginalization::{MarginalPrior, Marginalizer, PriorFactor};
use crate::optimizer::{
    BlockId, HuberLoss, ImuFactor, Problem, ProjectionObservation, ProjectionOneFrameTwoCam,
    ProjectionTwoFrameOneCam, ProjectionTwoFrameTwoCam, SolveOptions,
};

/// Maximum preintegration span before an IMU factor is dropped, seconds.
const MAX_IMU_FACTOR_DT: f64 = 10.0;
/// Speed threshold gating extrinsic/td estimation, m/s.
const MIN_SPEED_FOR_CALIB: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverFlag {
    Initial,
    NonLinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginalizationFlag {
    MargOld,
    MargSecondNew,
}

/// Snapshot of the newest window state, used to (re)seed the fast-forward
/// predictor.
#[derive(Debug, Clone, Copy)]
pub struct TailState {
    pub time: f64,
    pub p: Vector3<f64>,
    pub q: UnitQuaternion<f64>,
    pub v: Vector3<f64>,
    pub ba: Vector3<f64>,
    pub bg: Vector3<f64>,
    pub acc_0: Vector3<f64>,
    pub gyr_0: Vector3<f64>,
    pub gravity: Vector3<f64>,
}

pub struct Estimator {
    config: Arc<Config>,

    // Window state, slot 0 oldest. Arrays sized window_size + 1.
    pub ps: Vec<Vector3<f64>>,
    pub rs: Vec<Matrix3<f64>>,
    pub vs: Vec<Vector3<f64>>,
    pub bas: Vec<Vector3<f64>>,
    pub bgs: Vec<Vector3<f64>>,
    pub headers: Vec<f64>,
    pre_integrations: Vec<Option<Preintegration>>,

    pub frame_count: usize,
    pub solver_flag: SolverFlag,
    pub marginalization_flag: MarginalizationFlag,

    pub f_manager: FeatureManager,
    pub tic: Vec<Vector3<f64>>,
    pub ric: Vec<Matrix3<f64>>,
    pub td: f64,
    g: Vector3<f64>,

    first_imu: bool,
    acc_0: Vector3<f64>,
    gyr_0: Vector3<f64>,
    tmp_pre_integration: Option<Preintegration>,
    all_image_frame: Vec<(f64, ImageFrame)>,
    initial_timestamp: f64,
    initial_ex_rotation: InitialExRotation,
    estimate_extrinsic: ExtrinsicMode,
    open_ex_estimation: bool,
    init_first_pose_flag: bool,

    last_prior: Option<MarginalPrior>,

    // Gauge bookkeeping across failure resets.
    back_r0: Matrix3<f64>,
    back_p0: Vector3<f64>,
    last_r: Matrix3<f64>,
    last_p: Vector3<f64>,
    last_r0: Matrix3<f64>,
    last_p0: Vector3<f64>,
    failure_occur: bool,

    pub key_poses: Vec<Vector3<f64>>,
}

impl Estimator {
    pub fn new(config: Arc<Config>) -> Self {
        let w = config.window_size;
        let mut estimator = Self {
            ps: vec![Vector3::zeros(); w + 1],
            rs: vec![Matrix3::identity(); w + 1],
            vs: vec![Vector3::zeros(); w + 1],
            bas: vec![Vector3::zeros(); w + 1],
            bgs: vec![Vector3::zeros(); w + 1],
            headers: vec![0.0; w + 1],
            pre_integrations: (0..=w).map(|_| None).collect(),
            frame_count: 0,
            solver_flag: SolverFlag::Initial,
            marginalization_flag: MarginalizationFlag::MargOld,
            f_manager: FeatureManager::new(&config),
            tic: config.tic.clone(),
            ric: config.ric.clone(),
            td: config.td,
            g: config.gravity(),
            first_imu: false,
            acc_0: Vector3::zeros(),
            gyr_0: Vector3::zeros(),
            tmp_pre_integration: None,
            all_image_frame: Vec::new(),
            initial_timestamp: 0.0,
            initial_ex_rotation: InitialExRotation::new(w),
            estimate_extrinsic: config.estimate_extrinsic,
            open_ex_estimation: false,
            init_first_pose_flag: false,
            last_prior: None,
            back_r0: Matrix3::identity(),
            back_p0: Vector3::zeros(),
            last_r: Matrix3::identity(),
            last_p: Vector3::zeros(),
            last_r0: Matrix3::identity(),
            last_p0: Vector3::zeros(),
            failure_occur: false,
            key_poses: Vec::new(),
            config,
        };
        estimator.clear_state();
        estimator
    }

    /// Reset every estimate and start over from the configured seeds.
    pub fn clear_state(&mut self) {
        let w = self.config.window_size;
        for i in 0..=w {
            self.ps[i] = Vector3::zeros();
            self.rs[i] = Matrix3::identity();
            self.vs[i] = Vector3::zeros();
            self.bas[i] = Vector3::zeros();
            self.bgs[i] = Vector3::zeros();
            self.headers[i] = 0.0;
            self.pre_integrations[i] = None;
        }
        self.tic = self.config.tic.clone();
        self.ric = self.config.ric.clone();
        self.td = self.config.td;
        self.g = self.config.gravity();
        self.frame_count = 0;
        self.solver_flag = SolverFlag::Initial;
        self.first_imu = false;
        self.tmp_pre_integration = None;
        self.all_image_frame.clear();
        self.initial_timestamp = 0.0;
        self.estimate_extrinsic = self.config.estimate_extrinsic;
        self.open_ex_estimation = false;
        self.init_first_pose_flag = false;
        self.last_prior = None;
        self.failure_occur = false;
        self.f_manager.clear();
        self.key_poses.clear();
    }

    pub fn initialized(&self) -> bool {
        self.solver_flag == SolverFlag::NonLinear
    }

    pub fn first_pose_initialized(&self) -> bool {
        self.init_first_pose_flag
    }

    /// Level the first window pose from averaged static accelerometer
    /// readings: gravity aligned, yaw zeroed.
    pub fn init_first_imu_pose(&mut self, acc_samples: &[(f64, Vector3<f64>)]) {
        if acc_samples.is_empty() {
            return;
        }
        self.init_first_pose_flag = true;
        let mut aver_acc = Vector3::zeros();
        for (_, acc) in acc_samples {
            aver_acc += acc;
        }
        aver_acc /= acc_samples.len() as f64;
        info!(?aver_acc, "averaged accelerometer for first pose");

        self.rs[0] = gravity_to_rotation(&aver_acc);
        debug!(r0 = ?self.rs[0], "initial attitude");
    }

    /// Accumulate one IMU sample into the current interval and advance the
    /// nominal state by midpoint integration.
    pub fn process_imu(&mut self, dt: f64, acc: Vector3<f64>, gyr: Vector3<f64>) {
        if !self.first_imu {
            self.first_imu = true;
            self.acc_0 = acc;
            self.gyr_0 = gyr;
        }

        let j = self.frame_count;
        if self.pre_integrations[j].is_none() {
            self.pre_integrations[j] = Some(Preintegration::new(
                self.acc_0,
                self.gyr_0,
                self.bas[j],
                self.bgs[j],
                &self.config.imu_noise,
            ));
        }

        if j != 0 {
            if let Some(pre) = self.pre_integrations[j].as_mut() {
                pre.push(dt, acc, gyr);
            }
            if let Some(tmp) = self.tmp_pre_integration.as_mut() {
                tmp.push(dt, acc, gyr);
            }

            let un_acc_0 = self.rs[j] * (self.acc_0 - self.bas[j]) + self.g;
            let un_gyr = 0.5 * (self.gyr_0 + gyr) - self.bgs[j];
            self.rs[j] *= crate::geometry::delta_q(&(un_gyr * dt))
                .to_rotation_matrix()
                .into_inner();
            let un_acc_1 = self.rs[j] * (acc - self.bas[j]) + self.g;
            let un_acc = 0.5 * (un_acc_0 + un_acc_1);
            self.ps[j] += dt * self.vs[j] + 0.5 * dt * dt * un_acc;
            self.vs[j] += dt * un_acc;
        }
        self.acc_0 = acc;
        self.gyr_0 = gyr;
    }

    /// Ingest one feature frame: keyframe decision, initialization or
    /// window optimization, outlier rejection, and the slide.
    pub fn process_image(&mut self, image: &FeatureFrame, header: f64) {
        debug!(features = image.len(), header, "new image");
        if self
            .f_manager
            .add_frame_and_check_parallax(self.frame_count, image, self.td)
        {
            self.marginalization_flag = MarginalizationFlag::MargOld;
        } else {
            self.marginalization_flag = MarginalizationFlag::MargSecondNew;
        }
        debug!(keyframe = self.marginalization_flag == MarginalizationFlag::MargOld);

        self.headers[self.frame_count] = header;

        let mut image_frame = ImageFrame::new(header, image.clone());
        image_frame.pre_integration = self.tmp_pre_integration.take();
        self.all_image_frame.push((header, image_frame));
        self.tmp_pre_integration = Some(Preintegration::new(
            self.acc_0,
            self.gyr_0,
            self.bas[self.frame_count],
            self.bgs[self.frame_count],
            &self.config.imu_noise,
        ));

        if self.estimate_extrinsic == ExtrinsicMode::CalibrateOnline && self.frame_count != 0 {
            info!("calibrating extrinsic rotation, rotation movement is needed");
            let corres = self
                .f_manager
                .get_corresponding(self.frame_count - 1, self.frame_count);
            if let Some(pre) = self.pre_integrations[self.frame_count].as_ref() {
                if let Some(calib_ric) =
                    self.initial_ex_rotation.calibrate(&corres, &pre.delta_q)
                {
                    warn!("initial extrinsic rotation calibration succeeded");
                    self.ric[0] = calib_ric;
                    self.estimate_extrinsic = ExtrinsicMode::Refine;
                }
            }
        }

        if self.solver_flag == SolverFlag::Initial {
            self.process_initial(header);
        } else {
            if !self.config.use_imu {
                self.f_manager.init_frame_pose_by_pnp(
                    self.frame_count,
                    &mut self.ps,
                    &mut self.rs,
                    &self.tic,
                    &self.ric,
                );
            }
            self.f_manager
                .triangulate(&self.ps, &self.rs, &self.tic, &self.ric);

            self.optimization();

            let remove_ids = self.outliers_rejection();
            self.f_manager.remove_outliers(&remove_ids);

            if self.failure_detection() {
                warn!("failure detected, resetting estimator state");
                self.failure_occur = true;
                self.clear_state();
                return;
            }

            self.slide_window();
            self.f_manager.remove_failures();

            self.key_poses = self.ps[..=self.config.window_size].to_vec();
            self.last_r = self.rs[self.config.window_size];
            self.last_p = self.ps[self.config.window_size];
            self.last_r0 = self.rs[0];
            self.last_p0 = self.ps[0];
        }
    }

    fn process_initial(&mut self, header: f64) {
        let w = self.config.window_size;

        if !self.config.stereo && self.config.use_imu {
            // Monocular-inertial bootstrap once the window fills.
            if self.frame_count == w {
                let mut result = false;
                if self.estimate_extrinsic != ExtrinsicMode::CalibrateOnline
                    && (header - self.initial_timestamp) > 0.1
                {
                    result = self.initial_structure();
                    self.initial_timestamp = header;
                }
                if result {
                    self.solver_flag = SolverFlag::NonLinear;
                    self.optimization();
                    self.slide_window();
                    info!("initialization finished");
                } else {
                    self.slide_window();
                }
            }
        }

        if self.config.stereo && self.config.use_imu {
            self.f_manager.init_frame_pose_by_pnp(
                self.frame_count,
                &mut self.ps,
                &mut self.rs,
                &self.tic,
                &self.ric,
            );
            self.f_manager
                .triangulate(&self.ps, &self.rs, &self.tic, &self.ric);

            if self.frame_count == w {
                for (i, (_, frame)) in self.all_image_frame.iter_mut().enumerate() {
                    if i <= w {
                        frame.rotation = self.rs[i];
                        frame.translation = self.ps[i];
                    }
                }
                let delta_bg = solve_gyroscope_bias(&self.all_image_frame);
                for bg in self.bgs.iter_mut() {
                    *bg += delta_bg;
                }
                for i in 0..=w {
                    if let Some(pre) = self.pre_integrations[i].as_mut() {
                        pre.repropagate(Vector3::zeros(), self.bgs[i]);
                    }
                }
                self.solver_flag = SolverFlag::NonLinear;
                self.optimization();
                self.slide_window();
                info!("initialization finished");
            }
        }

        if self.config.stereo && !self.config.use_imu {
            self.f_manager.init_frame_pose_by_pnp(
                self.frame_count,
                &mut self.ps,
                &mut self.rs,
                &self.tic,
                &self.ric,
            );
            self.f_manager
                .triangulate(&self.ps, &self.rs, &self.tic, &self.ric);
            self.optimization();

            if self.frame_count == w {
                self.solver_flag = SolverFlag::NonLinear;
                self.slide_window();
                info!("initialization finished");
            }
        }

        if self.frame_count < w {
            self.frame_count += 1;
            let prev = self.frame_count - 1;
            self.ps[self.frame_count] = self.ps[prev];
            self.vs[self.frame_count] = self.vs[prev];
            self.rs[self.frame_count] = self.rs[prev];
            self.bas[self.frame_count] = self.bas[prev];
            self.bgs[self.frame_count] = self.bgs[prev];
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Monocular initialization
    // ───────────────────────────────────────────────────────────────────

    fn initial_structure(&mut self) -> bool {
        check_imu_excitation(&self.all_image_frame);

        let mut sfm_features: Vec<SfmFeature> = self
            .f_manager
            .features
            .values()
            .map(|f| {
                let obs = f
                    .observations
                    .iter()
                    .enumerate()
                    .map(|(k, o)| {
                        (
                            f.start_frame + k,
                            Vector2::new(o.point.x / o.point.z, o.point.y / o.point.z),
                        )
                    })
                    .collect();
                SfmFeature::new(f.feature_id, obs)
            })
            .collect();

        let Some((relative_r, relative_t, l)) = self.relative_pose() else {
            info!("not enough features or parallax; move device around");
            return false;
        };

        let Some(sfm) = GlobalSfm::construct(
            self.frame_count + 1,
            l,
            &relative_r,
            &relative_t,
            &mut sfm_features,
        ) else {
            debug!("global SfM failed");
            self.marginalization_flag = MarginalizationFlag::MargOld;
            return false;
        };

        // Place every buffered frame: keyframes take the SfM pose, the rest
        // are solved by PnP against the SfM points.
        let mut i = 0;
        for (t, frame) in self.all_image_frame.iter_mut() {
            if i <= self.frame_count && *t == self.headers[i] {
                frame.is_key_frame = true;
                frame.rotation =
                    sfm.rotations[i].to_rotation_matrix().into_inner() * self.ric[0].transpose();
                frame.translation = sfm.translations[i];
                i += 1;
                continue;
            }
            if i <= self.frame_count && *t > self.headers[i] {
                i += 1;
            }

            frame.is_key_frame = false;
            let idx = i.min(self.frame_count);
            let r_guess = sfm.rotations[idx]
                .inverse()
                .to_rotation_matrix()
                .into_inner();
            let t_guess = -(r_guess * sfm.translations[idx]);

            let mut pts_3d = opencv::core::Vector::new();
            let mut pts_2d = opencv::core::Vector::new();
            for (id, points) in &frame.points {
                if let Some(world) = sfm.points.get(id) {
                    for p in points.iter().filter(|p| p.camera_id == 0) {
                        pts_3d.push(opencv::core::Point3d::new(world.x, world.y, world.z));
                        pts_2d.push(opencv::core::Point2d::new(
                            p.point.x / p.point.z,
                            p.point.y / p.point.z,
                        ));
                    }
                }
            }
            if pts_3d.len() < 6 {
                debug!(pts = pts_3d.len(), "not enough points for frame PnP");
                return false;
            }
            let Some((r_cw, t_cw)) =
                crate::feature::manager::solve_pnp(&pts_3d, &pts_2d, &r_guess, &t_guess)
            else {
                debug!("frame PnP failed");
                return false;
            };
            let r_wc = r_cw.transpose();
            frame.rotation = r_wc * self.ric[0].transpose();
            frame.translation = -(r_wc * t_cw);
        }

        if self.visual_initial_align() {
            true
        } else {
            info!("misaligned visual structure with IMU");
            false
        }
    }

    fn visual_initial_align(&mut self) -> bool {
        let delta_bg = solve_gyroscope_bias(&self.all_image_frame);
        for bg in self.bgs.iter_mut() {
            *bg += delta_bg;
        }
        let bg0 = self.bgs[0];
        for (_, frame) in self.all_image_frame.iter_mut().skip(1) {
            if let Some(pre) = frame.pre_integration.as_mut() {
                pre.repropagate(Vector3::zeros(), bg0);
            }
        }

        let Some(result) = linear_alignment(
            &self.all_image_frame,
            &self.config.tic[0],
            self.config.gravity_magnitude,
        ) else {
            debug!("solving gravity and scale failed");
            return false;
        };

        // Adopt the SfM poses for the window and flag every frame a
        // keyframe.
        for i in 0..=self.frame_count {
            let (_, frame) = self
                .all_image_frame
                .iter_mut()
                .find(|(t, _)| *t == self.headers[i])
                .expect("window header missing from frame buffer");
            self.rs[i] = frame.rotation;
            self.ps[i] = frame.translation;
            frame.is_key_frame = true;
        }

        for i in 0..=self.config.window_size {
            if let Some(pre) = self.pre_integrations[i].as_mut() {
                pre.repropagate(Vector3::zeros(), self.bgs[i]);
            }
        }

        let s = result.scale;
        for i in (0..=self.frame_count).rev() {
            self.ps[i] = s * self.ps[i]
                - self.rs[i] * self.config.tic[0]
                - (s * self.ps[0] - self.rs[0] * self.config.tic[0]);
        }

        let mut kv = 0;
        for (k, (_, frame)) in self.all_image_frame.iter().enumerate() {
            if frame.is_key_frame {
                self.vs[kv] = frame.rotation * result.velocities[k];
                kv += 1;
            }
        }

        // Rotate the world so gravity points straight down with zero yaw on
        // the first frame. `result.gravity` is the static specific-force
        // direction (opposite to gravity).
        let mut r0 = gravity_to_rotation(&result.gravity);
        let yaw = rotation_to_ypr(&(r0 * self.rs[0])).x;
        r0 = ypr_to_rotation(&Vector3::new(-yaw, 0.0, 0.0)) * r0;
        let rot_diff = r0;
        self.g = -(r0 * result.gravity);
        debug!(gravity = ?self.g, "aligned gravity");

        for i in 0..=self.frame_count {
            self.ps[i] = rot_diff * self.ps[i];
            self.rs[i] = rot_diff * self.rs[i];
            self.vs[i] = rot_diff * self.vs[i];
        }

        self.f_manager.clear_depth();
        self.f_manager
            .triangulate(&self.ps, &self.rs, &self.tic, &self.ric);

        true
    }

    /// Find a reference frame l with enough correspondences and parallax to
    /// the newest frame, and the relative pose between them.
    fn relative_pose(&self) -> Option<(Matrix3<f64>, Vector3<f64>, usize)> {
        let w = self.config.window_size;
        for i in 0..w {
            let corres = self.f_manager.get_corresponding(i, w);
            if corres.len() <= 20 {
                continue;
            }
            let sum_parallax: f64 = corres
                .iter()
                .map(|(a, b)| {
                    (Vector2::new(a.x, a.y) - Vector2::new(b.x, b.y)).norm()
                })
                .sum();
            let average_parallax = sum_parallax / corres.len() as f64;
            if average_parallax * self.config.parallax_focal > 30.0 {
                if let Some((r, t)) = solve_relative_rt(&corres) {
                    debug!(
                        average_parallax = average_parallax * self.config.parallax_focal,
                        l = i,
                        "reference frame chosen"
                    );
                    return Some((r, t, i));
                }
            }
        }
        None
    }

    // ───────────────────────────────────────────────────────────────────
    // Window optimization
    // ───────────────────────────────────────────────────────────────────

    fn pose_params(&self, i: usize) -> [f64; 7] {
        let q = UnitQuaternion::from_rotation_matrix(
            &nalgebra::Rotation3::from_matrix_unchecked(self.rs[i]),
        );
        let p = self.ps[i];
        [p.x, p.y, p.z, q.i, q.j, q.k, q.w]
    }

    fn speed_bias_params(&self, i: usize) -> [f64; 9] {
        [
            self.vs[i].x,
            self.vs[i].y,
            self.vs[i].z,
            self.bas[i].x,
            self.bas[i].y,
            self.bas[i].z,
            self.bgs[i].x,
            self.bgs[i].y,
            self.bgs[i].z,
        ]
    }

    fn extrinsic_params(&self, c: usize) -> [f64; 7] {
        let q = UnitQuaternion::from_rotation_matrix(
            &nalgebra::Rotation3::from_matrix_unchecked(self.ric[c]),
        );
        let t = self.tic[c];
        [t.x, t.y, t.z, q.i, q.j, q.k, q.w]
    }

    /// Current value of any block, for the marginalizer's linearization.
    fn block_values(&self, id: BlockId, depths: &BTreeMap<FeatureId, f64>) -> Vec<f64> {
        match id {
            BlockId::Pose(i) => self.pose_params(i).to_vec(),
            BlockId::SpeedBias(i) => self.speed_bias_params(i).to_vec(),
            BlockId::Extrinsic(c) => self.extrinsic_params(c).to_vec(),
            BlockId::Td => vec![self.td],
            BlockId::Feature(fid) => vec![depths[&fid]],
        }
    }

    fn projection_observation(
        &self,
        feature: &crate::feature::Feature,
        k: usize,
        right: bool,
    ) -> ProjectionObservation {
        let anchor = &feature.observations[0];
        let target = &feature.observations[k];
        let (pts_j, velocity_j, td_j) = if right {
            (
                target.point_right.unwrap(),
                target.velocity_right.unwrap_or_default(),
                target.td,
            )
        } else {
            (target.point, target.velocity, target.td)
        };
        ProjectionObservation {
            pts_i: anchor.point,
            pts_j,
            velocity_i: Vector3::new(anchor.velocity.x, anchor.velocity.y, 0.0),
            velocity_j: Vector3::new(velocity_j.x, velocity_j.y, 0.0),
            td_i: anchor.td,
            td_j,
        }
    }

    fn optimization(&mut self) {
        let w = self.config.window_size;
        let deps = self.f_manager.get_depth_vector();
        debug!(features = deps.len(), "features entering the solve");

        let mut problem = Problem::new();

        for i in 0..=self.frame_count {
            problem.add_parameter_block(BlockId::Pose(i), &self.pose_params(i));
            if self.config.use_imu {
                problem.add_parameter_block(BlockId::SpeedBias(i), &self.speed_bias_params(i));
            }
        }
        if !self.config.use_imu {
            problem.set_constant(BlockId::Pose(0));
        }

        for c in 0..self.config.num_cameras {
            problem.add_parameter_block(BlockId::Extrinsic(c), &self.extrinsic_params(c));
            let calibrating = self.estimate_extrinsic != ExtrinsicMode::Fixed
                && self.frame_count == w
                && self.vs[0].norm() > MIN_SPEED_FOR_CALIB;
            if calibrating || self.open_ex_estimation {
                self.open_ex_estimation = true;
            } else {
                problem.set_constant(BlockId::Extrinsic(c));
            }
        }

        problem.add_parameter_block(BlockId::Td, &[self.td]);
        if !self.config.estimate_td || self.vs[0].norm() < MIN_SPEED_FOR_CALIB {
            problem.set_constant(BlockId::Td);
        }

        for (&id, &inv_depth) in &deps {
            problem.add_parameter_block(BlockId::Feature(id), &[inv_depth]);
        }

        if let Some(prior) = &self.last_prior {
            problem.add_residual(Box::new(PriorFactor::new(prior.clone())), None);
        }

        if self.config.use_imu {
            for i in 0..self.frame_count {
                let j = i + 1;
                let Some(pre) = self.pre_integrations[j].as_ref() else {
                    continue;
                };
                if pre.sum_dt > MAX_IMU_FACTOR_DT {
                    continue;
                }
                problem.add_residual(
                    Box::new(ImuFactor::new(i, j, pre.clone(), self.g)),
                    None,
                );
            }
        }

        let sqrt_info = self.config.focal_length / 1.5;
        let loss = HuberLoss::new(1.0);
        let mut visual_count = 0usize;
        for &id in deps.keys() {
            let feature = &self.f_manager.features[&id];
            let i = feature.start_frame;
            for k in 0..feature.observations.len() {
                let j = i + k;
                if j != i {
                    problem.add_residual(
                        Box::new(ProjectionTwoFrameOneCam::new(
                            i,
                            j,
                            feature.main_cam,
                            id,
                            self.projection_observation(feature, k, false),
                            sqrt_info,
                            self.config.fisheye,
                        )),
                        Some(loss),
                    );
                    visual_count += 1;
                }
                if self.config.stereo && feature.observations[k].is_stereo() {
                    let obs = self.projection_observation(feature, k, true);
                    if j != i {
                        problem.add_residual(
                            Box::new(ProjectionTwoFrameTwoCam::new(
                                i, j, id, obs, sqrt_info, self.config.fisheye,
                            )),
                            Some(loss),
                        );
                    } else {
                        problem.add_residual(
                            Box::new(ProjectionOneFrameTwoCam::new(
                                id, obs, sqrt_info, self.config.fisheye,
                            )),
                            Some(loss),
                        );
                    }
                    visual_count += 1;
                }
            }
        }
        debug!(visual_count, "visual measurements");

        let budget = if self.marginalization_flag == MarginalizationFlag::MargOld {
            self.config.solver_time * 4.0 / 5.0
        } else {
            self.config.solver_time
        };
        let report = problem.solve(&SolveOptions {
            max_iterations: self.config.num_iterations,
            max_time: Duration::from_secs_f64(budget),
        });
        debug!(
            iterations = report.iterations,
            initial_cost = report.initial_cost,
            final_cost = report.final_cost,
            "window solve finished"
        );

        self.write_back(&problem, &deps);

        if self.frame_count < w {
            return;
        }

        // Marginalization runs at the post-solve linearization point.
        let deps = self.f_manager.get_depth_vector();
        match self.marginalization_flag {
            MarginalizationFlag::MargOld => self.marginalize_old(&deps),
            MarginalizationFlag::MargSecondNew => self.marginalize_second_new(&deps),
        }
    }

    /// Write optimized parameters back into the window, restoring the yaw
    /// and position gauge of slot 0.
    fn write_back(&mut self, problem: &Problem, deps: &BTreeMap<FeatureId, f64>) {
        let mut origin_r0 = rotation_to_ypr(&self.rs[0]);
        let mut origin_p0 = self.ps[0];
        if self.failure_occur {
            origin_r0 = rotation_to_ypr(&self.last_r0);
            origin_p0 = self.last_p0;
            self.failure_occur = false;
        }

        let read_pose = |id: BlockId| {
            let x = problem.values(id).expect("missing pose block");
            (
                Vector3::new(x[0], x[1], x[2]),
                UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                    x[6], x[3], x[4], x[5],
                )),
            )
        };

        if self.config.use_imu {
            let (p0_new, q0_new) = read_pose(BlockId::Pose(0));
            let origin_r00 =
                rotation_to_ypr(&q0_new.to_rotation_matrix().into_inner());
            let y_diff = origin_r0.x - origin_r00.x;
            let mut rot_diff = ypr_to_rotation(&Vector3::new(y_diff, 0.0, 0.0));
            if (origin_r0.y.abs() - 90.0).abs() < 1.0 || (origin_r00.y.abs() - 90.0).abs() < 1.0
            {
                debug!("euler singular point, falling back to full rotation gauge");
                rot_diff =
                    self.rs[0] * q0_new.to_rotation_matrix().into_inner().transpose();
            }

            for i in 0..=self.frame_count {
                let (p, q) = read_pose(BlockId::Pose(i));
                self.rs[i] = rot_diff * q.to_rotation_matrix().into_inner();
                self.ps[i] = rot_diff * (p - p0_new) + origin_p0;

                let sb = problem
                    .values(BlockId::SpeedBias(i))
                    .expect("missing speed-bias block");
                self.vs[i] = rot_diff * Vector3::new(sb[0], sb[1], sb[2]);
                self.bas[i] = Vector3::new(sb[3], sb[4], sb[5]);
                self.bgs[i] = Vector3::new(sb[6], sb[7], sb[8]);
            }
        } else {
            for i in 0..=self.frame_count {
                let (p, q) = read_pose(BlockId::Pose(i));
                self.rs[i] = q.to_rotation_matrix().into_inner();
                self.ps[i] = p;
            }
        }

        if self.config.use_imu {
            for c in 0..self.config.num_cameras {
                let (t, q) = read_pose(BlockId::Extrinsic(c));
                self.tic[c] = t;
                self.ric[c] = q.to_rotation_matrix().into_inner();
            }
            self.td = problem.values(BlockId::Td).expect("missing td block")[0];
        }

        let mut updated = BTreeMap::new();
        for &id in deps.keys() {
            if let Some(v) = problem.values(BlockId::Feature(id)) {
                updated.insert(id, v[0]);
            }
        }
        self.f_manager.set_depth(&updated);
    }

    // ───────────────────────────────────────────────────────────────────
    // Marginalization
    // ───────────────────────────────────────────────────────────────────

    fn marginalize_old(&mut self, deps: &BTreeMap<FeatureId, f64>) {
        let mut marg = Marginalizer::new();

        for i in 0..=self.frame_count {
            marg.set_block_value(BlockId::Pose(i), &self.pose_params(i));
            if self.config.use_imu {
                marg.set_block_value(BlockId::SpeedBias(i), &self.speed_bias_params(i));
            }
        }
        for c in 0..self.config.num_cameras {
            marg.set_block_value(BlockId::Extrinsic(c), &self.extrinsic_params(c));
        }
        marg.set_block_value(BlockId::Td, &[self.td]);
        for (&id, &inv) in deps {
            marg.set_block_value(BlockId::Feature(id), &[inv]);
        }

        if let Some(prior) = &self.last_prior {
            let drop_set: Vec<usize> = prior
                .keep_blocks
                .iter()
                .enumerate()
                .filter(|(_, id)| {
                    matches!(id, BlockId::Pose(0) | BlockId::SpeedBias(0))
                })
                .map(|(k, _)| k)
                .collect();
            marg.add_residual(Box::new(PriorFactor::new(prior.clone())), None, drop_set);
        }

        if self.config.use_imu {
            if let Some(pre) = self.pre_integrations[1].as_ref() {
                if pre.sum_dt < MAX_IMU_FACTOR_DT {
                    marg.add_residual(
                        Box::new(ImuFactor::new(0, 1, pre.clone(), self.g)),
                        None,
                        vec![0, 1],
                    );
                }
            }
        }

        let sqrt_info = self.config.focal_length / 1.5;
        let loss = HuberLoss::new(1.0);
        for &id in deps.keys() {
            let feature = &self.f_manager.features[&id];
            if feature.start_frame != 0 {
                continue;
            }
            let i = 0;
            for k in 0..feature.observations.len() {
                let j = i + k;
                if j != i {
                    marg.add_residual(
                        Box::new(ProjectionTwoFrameOneCam::new(
                            i,
                            j,
                            feature.main_cam,
                            id,
                            self.projection_observation(feature, k, false),
                            sqrt_info,
                            self.config.fisheye,
                        )),
                        Some(loss),
                        vec![0, 3],
                    );
                }
                if self.config.stereo && feature.observations[k].is_stereo() {
                    let obs = self.projection_observation(feature, k, true);
                    if j != i {
                        marg.add_residual(
                            Box::new(ProjectionTwoFrameTwoCam::new(
                                i, j, id, obs, sqrt_info, self.config.fisheye,
                            )),
                            Some(loss),
                            vec![0, 4],
                        );
                    } else {
                        marg.add_residual(
                            Box::new(ProjectionOneFrameTwoCam::new(
                                id, obs, sqrt_info, self.config.fisheye,
                            )),
                            Some(loss),
                            vec![2],
                        );
                    }
                }
            }
        }

        self.last_prior = marg.marginalize(|id| match id {
            BlockId::Pose(i) => BlockId::Pose(i - 1),
            BlockId::SpeedBias(i) => BlockId::SpeedBias(i - 1),
            other => other,
        });
    }

    fn marginalize_second_new(&mut self, deps: &BTreeMap<FeatureId, f64>) {
        let w = self.config.window_size;
        let Some(prior) = self.last_prior.clone() else {
            return;
        };
        if !prior.touches(BlockId::Pose(w - 1)) {
            return;
        }
        assert!(
            !prior.touches(BlockId::SpeedBias(w - 1)),
            "speed-bias of the second-newest frame must never appear in the prior"
        );

        let mut marg = Marginalizer::new();
        for id in &prior.keep_blocks {
            marg.set_block_value(*id, &self.block_values(*id, deps));
        }
        let drop_set: Vec<usize> = prior
            .keep_blocks
            .iter()
            .enumerate()
            .filter(|(_, id)| **id == BlockId::Pose(w - 1))
            .map(|(k, _)| k)
            .collect();
        marg.add_residual(Box::new(PriorFactor::new(prior)), None, drop_set);

        self.last_prior = marg.marginalize(|id| match id {
            BlockId::Pose(i) if i == w => BlockId::Pose(w - 1),
            BlockId::SpeedBias(i) if i == w => BlockId::SpeedBias(w - 1),
            other => other,
        });
    }

    // ───────────────────────────────────────────────────────────────────
    // Window slide
    // ───────────────────────────────────────────────────────────────────

    fn slide_window(&mut self) {
        let w = self.config.window_size;
        if self.marginalization_flag == MarginalizationFlag::MargOld {
            let t0 = self.headers[0];
            self.back_r0 = self.rs[0];
            self.back_p0 = self.ps[0];
            if self.frame_count == w {
                for i in 0..w {
                    self.headers[i] = self.headers[i + 1];
                    self.rs.swap(i, i + 1);
                    self.ps.swap(i, i + 1);
                    if self.config.use_imu {
                        self.pre_integrations.swap(i, i + 1);
                        self.vs.swap(i, i + 1);
                        self.bas.swap(i, i + 1);
                        self.bgs.swap(i, i + 1);
                    }
                }
                self.headers[w] = self.headers[w - 1];
                self.ps[w] = self.ps[w - 1];
                self.rs[w] = self.rs[w - 1];
                if self.config.use_imu {
                    self.vs[w] = self.vs[w - 1];
                    self.bas[w] = self.bas[w - 1];
                    self.bgs[w] = self.bgs[w - 1];
                    self.pre_integrations[w] = Some(Preintegration::new(
                        self.acc_0,
                        self.gyr_0,
                        self.bas[w],
                        self.bgs[w],
                        &self.config.imu_noise,
                    ));
                }
                self.all_image_frame.retain(|(t, _)| *t > t0);
                self.slide_window_old();
            }
        } else if self.frame_count == w {
            self.headers[w - 1] = self.headers[w];
            self.ps[w - 1] = self.ps[w];
            self.rs[w - 1] = self.rs[w];
            if self.config.use_imu {
                let samples: Vec<(f64, Vector3<f64>, Vector3<f64>)> = self.pre_integrations
                    [w]
                    .as_ref()
                    .map(|p| p.samples().to_vec())
                    .unwrap_or_default();
                if let Some(prev) = self.pre_integrations[w - 1].as_mut() {
                    for (dt, acc, gyr) in samples {
                        prev.push(dt, acc, gyr);
                    }
                }
                self.vs[w - 1] = self.vs[w];
                self.bas[w - 1] = self.bas[w];
                self.bgs[w - 1] = self.bgs[w];
                self.pre_integrations[w] = Some(Preintegration::new(
                    self.acc_0,
                    self.gyr_0,
                    self.bas[w],
                    self.bgs[w],
                    &self.config.imu_noise,
                ));
            }
            self.slide_window_new();
        }
    }

    fn slide_window_old(&mut self) {
        if self.solver_flag == SolverFlag::NonLinear {
            let r0 = self.back_r0 * self.ric[0];
            let r1 = self.rs[0] * self.ric[0];
            let p0 = self.back_p0 + self.back_r0 * self.tic[0];
            let p1 = self.ps[0] + self.rs[0] * self.tic[0];
            self.f_manager.remove_back_shift_depth(&r0, &p0, &r1, &p1);
        } else {
            self.f_manager.remove_back();
        }
    }

    fn slide_window_new(&mut self) {
        self.f_manager.remove_front(self.frame_count);
    }

    // ───────────────────────────────────────────────────────────────────
    // Outliers, failure, prediction
    // ───────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn reprojection_error(
        &self,
        r_i: &Matrix3<f64>,
        p_i: &Vector3<f64>,
        ric_i: &Matrix3<f64>,
        tic_i: &Vector3<f64>,
        r_j: &Matrix3<f64>,
        p_j: &Vector3<f64>,
        ric_j: &Matrix3<f64>,
        tic_j: &Vector3<f64>,
        depth: f64,
        uv_i: &Vector3<f64>,
        uv_j: &Vector3<f64>,
    ) -> f64 {
        let pts_w = r_i * (ric_i * (depth * uv_i) + tic_i) + p_i;
        let pts_cj = ric_j.transpose() * (r_j.transpose() * (pts_w - p_j) - tic_j);
        if self.config.fisheye {
            (pts_cj.normalize() - uv_j).norm()
        } else {
            Vector2::new(
                pts_cj.x / pts_cj.z - uv_j.x / uv_j.z,
                pts_cj.y / pts_cj.z - uv_j.y / uv_j.z,
            )
            .norm()
        }
    }

    /// Mean reprojection check over every solved feature; ids above the
    /// pixel threshold are handed back for removal.
    pub fn outliers_rejection(&self) -> BTreeSet<FeatureId> {
        let mut remove = BTreeSet::new();
        for (&id, feature) in &self.f_manager.features {
            if !feature.solvable() || feature.estimated_depth <= 0.0 {
                continue;
            }
            let i = feature.start_frame;
            let uv_i = feature.observations[0].point;
            let depth = feature.estimated_depth;
            let main = feature.main_cam;

            let mut err = 0.0;
            let mut err_cnt = 0usize;
            for (k, obs) in feature.observations.iter().enumerate() {
                let j = i + k;
                if j != i {
                    err += self.reprojection_error(
                        &self.rs[i], &self.ps[i], &self.ric[main], &self.tic[main],
                        &self.rs[j], &self.ps[j], &self.ric[main], &self.tic[main],
                        depth, &uv_i, &obs.point,
                    );
                    err_cnt += 1;
                }
                if self.config.stereo && obs.is_stereo() {
                    let uv_j_right = obs.point_right.unwrap();
                    err += self.reprojection_error(
                        &self.rs[i], &self.ps[i], &self.ric[0], &self.tic[0],
                        &self.rs[j], &self.ps[j], &self.ric[1], &self.tic[1],
                        depth, &uv_i, &uv_j_right,
                    );
                    err_cnt += 1;
                }
            }
            if err_cnt == 0 {
                continue;
            }
            let ave_err = err / err_cnt as f64;
            if ave_err * self.config.focal_length > self.config.outlier_threshold_px {
                remove.insert(id);
            }
        }
        remove
    }

    /// Divergence checks. Detection is log-only: the reset path is
    /// disabled, so this always reports no failure.
    fn failure_detection(&self) -> bool {
        let w = self.config.window_size;
        if self.bas[w].norm() > 2.5 {
            warn!(ba = self.bas[w].norm(), "large accelerometer bias estimate");
        }
        if self.bgs[w].norm() > 1.0 {
            warn!(bg = self.bgs[w].norm(), "large gyroscope bias estimate");
        }
        false
    }

    /// Constant-velocity prediction of tracked features in the next frame,
    /// as camera-frame points for the tracker's seeding.
    pub fn predict_pts_in_next_frame(&self) -> HashMap<FeatureId, Vector3<f64>> {
        let mut predictions = HashMap::new();
        if self.frame_count < 2 {
            return predictions;
        }
        let cur_r = self.rs[self.frame_count];
        let cur_p = self.ps[self.frame_count];
        let prev_r = self.rs[self.frame_count - 1];
        let prev_p = self.ps[self.frame_count - 1];

        // next = cur * (prev⁻¹ * cur)
        let rel_r = prev_r.transpose() * cur_r;
        let rel_p = prev_r.transpose() * (cur_p - prev_p);
        let next_r = cur_r * rel_r;
        let next_p = cur_r * rel_p + cur_p;

        for (&id, feature) in &self.f_manager.features {
            if feature.estimated_depth <= 0.0 {
                continue;
            }
            if feature.observations.len() >= 2 && feature.end_frame() == self.frame_count {
                let first = feature.start_frame;
                let pts_cam =
                    self.ric[0] * (feature.estimated_depth * feature.observations[0].point)
                        + self.tic[0];
                let pts_w = self.rs[first] * pts_cam + self.ps[first];
                let pts_local = next_r.transpose() * (pts_w - next_p);
                let pts_cam_next = self.ric[0].transpose() * (pts_local - self.tic[0]);
                predictions.insert(id, pts_cam_next);
            }
        }
        predictions
    }

    /// World-frame positions of every solved feature, for publishing.
    pub fn point_cloud(&self) -> Vec<Vector3<f64>> {
        self.f_manager
            .features
            .values()
            .filter(|f| f.estimated_depth > 0.0)
            .map(|f| {
                let i = f.start_frame;
                let pts_cam =
                    self.ric[0] * (f.estimated_depth * f.observations[0].point) + self.tic[0];
                self.rs[i] * pts_cam + self.ps[i]
            })
            .collect()
    }

    /// Snapshot of the newest slot for the fast-forward predictor.
    pub fn tail_state(&self) -> TailState {
        let i = self.frame_count;
        TailState {
            time: self.headers[i] + self.td,
            p: self.ps[i],
            q: UnitQuaternion::from_rotation_matrix(
                &nalgebra::Rotation3::from_matrix_unchecked(self.rs[i]),
            ),
            v: self.vs[i],
            ba: self.bas[i],
            bg: self.bgs[i],
            acc_0: self.acc_0,
            gyr_0: self.gyr_0,
            gravity: self.g,
        }
    }

    pub fn gravity(&self) -> Vector3<f64> {
        self.g
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::TrackedPoint;
    use approx::assert_relative_eq;

    fn stereo_config() -> Arc<Config> {
        Arc::new(Config {
            stereo: true,
            use_imu: true,
            num_cameras: 2,
            focal_length: 400.0,
            tic: vec![Vector3::zeros(), Vector3::new(0.1, 0.0, 0.0)],
            ric: vec![Matrix3::identity(), Matrix3::identity()],
            solver_time: 10.0,
            num_iterations: 10,
            ..Config::default()
        })
    }

    /// Fixed landmarks in front of the rig, visible in both cameras for the
    /// whole trajectory. Depths of a few meters give consecutive frames
    /// enough parallax to be keyframes.
    fn landmarks() -> Vec<Vector3<f64>> {
        let mut pts = Vec::new();
        for k in 0..30 {
            pts.push(Vector3::new(
                -1.0 + 0.35 * (k % 10) as f64 + 0.8 * (k / 10) as f64,
                -0.8 + 0.8 * (k / 10) as f64,
                3.0 + 0.3 * (k % 5) as f64,
            ));
        }
        pts
    }

    fn observe(
        landmarks: &[Vector3<f64>],
        body_p: &Vector3<f64>,
        baseline: &Vector3<f64>,
    ) -> FeatureFrame {
        let mut frame = FeatureFrame::new();
        for (id, pt) in landmarks.iter().enumerate() {
            let left = pt - body_p;
            let right = pt - (body_p + baseline);
            if left.z <= 0.5 || right.z <= 0.5 {
                continue;
            }
            frame.insert(
                id as FeatureId,
                vec![
                    TrackedPoint {
                        camera_id: 0,
                        point: Vector3::new(left.x / left.z, left.y / left.z, 1.0),
                        uv: Vector2::new(
                            400.0 * left.x / left.z + 320.0,
                            400.0 * left.y / left.z + 240.0,
                        ),
                        velocity: Vector2::zeros(),
                    },
                    TrackedPoint {
                        camera_id: 1,
                        point: Vector3::new(right.x / right.z, right.y / right.z, 1.0),
                        uv: Vector2::new(
                            400.0 * right.x / right.z + 320.0,
                            400.0 * right.y / right.z + 240.0,
                        ),
                        velocity: Vector2::zeros(),
                    },
                ],
            );
        }
        frame
    }

    /// Straight-line constant-velocity trajectory with a static-attitude
    /// IMU: the estimator must initialize and track the motion.
    #[test]
    fn test_stereo_imu_straight_line() {
        let config = stereo_config();
        let mut estimator = Estimator::new(config.clone());
        let pts = landmarks();
        let baseline = Vector3::new(0.1, 0.0, 0.0);
        let vel = Vector3::new(1.0, 0.0, 0.0);

        let imu_dt = 0.005;
        let frame_dt = 0.1;
        let acc = Vector3::new(0.0, 0.0, 9.81);
        let gyr = Vector3::zeros();

        estimator.init_first_imu_pose(&[(0.0, acc)]);

        let mut last_header = 0.0;
        for f in 0..26 {
            let header = f as f64 * frame_dt;
            if f > 0 {
                let steps = (frame_dt / imu_dt).round() as usize;
                for _ in 0..steps {
                    estimator.process_imu(imu_dt, acc, gyr);
                }
            }
            let body_p = vel * header;
            let frame = observe(&pts, &body_p, &baseline);
            estimator.process_image(&frame, header);
            last_header = header;
        }

        assert!(estimator.initialized());
        let w = config.window_size;
        let expected = vel * last_header;
        assert!(
            (estimator.ps[w] - expected).norm() < 0.05,
            "final position {:?} expected {:?}",
            estimator.ps[w],
            expected
        );
        assert!(
            estimator.bgs[w].norm() < 1e-3,
            "gyro bias {}",
            estimator.bgs[w].norm()
        );
        assert_relative_eq!(
            estimator.gravity(),
            Vector3::new(0.0, 0.0, -9.81),
            epsilon = 0.02
        );
    }

    /// Round trip through the parameter blocks must not move the state when
    /// nothing is optimized.
    #[test]
    fn test_params_round_trip_preserves_window() {
        let config = stereo_config();
        let mut estimator = Estimator::new(config);
        estimator.frame_count = 2;
        estimator.ps[1] = Vector3::new(0.5, -0.2, 0.1);
        estimator.rs[1] = ypr_to_rotation(&Vector3::new(20.0, 5.0, -3.0));
        estimator.vs[1] = Vector3::new(0.3, 0.0, -0.1);

        let mut problem = Problem::new();
        for i in 0..=estimator.frame_count {
            problem.add_parameter_block(BlockId::Pose(i), &estimator.pose_params(i));
            problem
                .add_parameter_block(BlockId::SpeedBias(i), &estimator.speed_bias_params(i));
        }
        for c in 0..2 {
            problem.add_parameter_block(BlockId::Extrinsic(c), &estimator.extrinsic_params(c));
        }
        problem.add_parameter_block(BlockId::Td, &[estimator.td]);

        let ps_before = estimator.ps.clone();
        let rs_before = estimator.rs.clone();
        let vs_before = estimator.vs.clone();
        estimator.write_back(&problem, &BTreeMap::new());

        for i in 0..=estimator.frame_count {
            assert_relative_eq!(estimator.ps[i], ps_before[i], epsilon = 1e-9);
            assert_relative_eq!(estimator.rs[i], rs_before[i], epsilon = 1e-9);
            assert_relative_eq!(estimator.vs[i], vs_before[i], epsilon = 1e-9);
        }
    }

    /// A slot-W feature with one corrupted observation must be flagged by
    /// the reprojection check and disappear from the depth vector.
    #[test]
    fn test_outlier_rejection_flags_corrupted_track() {
        let config = stereo_config();
        let mut estimator = Estimator::new(config.clone());
        let depth = 5.0;
        let pt_world = Vector3::new(0.2, 0.1, depth);

        // Four slots translating along x, all observing the same landmark.
        estimator.frame_count = 3;
        for i in 0..=3usize {
            estimator.ps[i] = Vector3::new(0.1 * i as f64, 0.0, 0.0);
            estimator.rs[i] = Matrix3::identity();
            estimator.headers[i] = i as f64 * 0.1;
        }

        for i in 0..=3usize {
            let local = pt_world - estimator.ps[i];
            let mut uv = Vector2::new(local.x / local.z, local.y / local.z);
            if i == 2 {
                // 10 px at the 400 px focal: with three residual frames the
                // mean error is 10/3 px, above the 3 px threshold.
                uv.x += 10.0 / 400.0;
            }
            let mut frame = FeatureFrame::new();
            frame.insert(
                7,
                vec![TrackedPoint {
                    camera_id: 0,
                    point: Vector3::new(uv.x, uv.y, 1.0),
                    uv: Vector2::new(400.0 * uv.x + 320.0, 400.0 * uv.y + 240.0),
                    velocity: Vector2::zeros(),
                }],
            );
            estimator
                .f_manager
                .add_frame_and_check_parallax(i, &frame, 0.0);
        }
        estimator.f_manager.features.get_mut(&7).unwrap().estimated_depth = depth;

        assert!(estimator.f_manager.get_depth_vector().contains_key(&7));
        let remove = estimator.outliers_rejection();
        assert!(remove.contains(&7));

        estimator.f_manager.remove_outliers(&remove);
        assert!(!estimator.f_manager.get_depth_vector().contains_key(&7));
    }

    /// MARG_OLD slide: headers shift down by one, the tail keeps the newest
    /// value, and feature anchors follow.
    #[test]
    fn test_slide_window_shifts_headers() {
        let config = stereo_config();
        let w = config.window_size;
        let mut estimator = Estimator::new(config.clone());
        let pts = landmarks();
        let baseline = Vector3::new(0.1, 0.0, 0.0);
        let acc = Vector3::new(0.0, 0.0, 9.81);

        estimator.init_first_imu_pose(&[(0.0, acc)]);
        for f in 0..=(w + 1) {
            let header = f as f64 * 0.1;
            if f > 0 {
                for _ in 0..20 {
                    estimator.process_imu(0.005, acc, Vector3::zeros());
                }
            }
            let body_p = Vector3::new(header, 0.0, 0.0);
            let frame = observe(&pts, &body_p, &baseline);

            let headers_before = estimator.headers.clone();
            let was_full = estimator.frame_count == w;
            estimator.process_image(&frame, header);

            if was_full
                && estimator.marginalization_flag == MarginalizationFlag::MargOld
            {
                for i in 0..w {
                    assert_eq!(estimator.headers[i], headers_before[i + 1]);
                }
            }
        }
        for feature in estimator.f_manager.features.values() {
            assert!(feature.start_frame <= w);
            assert!(feature.end_frame() <= w);
        }
    }
}
