//! Residual factors of the sliding-window problem.
//!
//! Every factor evaluates against the raw parameter-block storage and
//! reports Jacobians in the blocks' tangent spaces (6 columns for poses).
//! The IMU factor carries full analytic Jacobians; the stereo projection
//! variants differentiate numerically on the manifold, which keeps their
//! extrinsic chain rules out of the code at no observable cost for window
//! sized problems.

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix3, Matrix4, UnitQuaternion, Vector2, Vector3};

use super::blocks::BlockId;
use crate::geometry::skew;
use crate::imu::types::{Matrix15, O_BA, O_BG, O_P, O_R, O_V};
use crate::imu::Preintegration;

/// Perturbation used by the numeric manifold Jacobians.
const NUMERIC_EPS: f64 = 1e-6;

/// Residual factor interface.
pub trait Factor: Send + Sync {
    fn blocks(&self) -> &[BlockId];
    fn num_residuals(&self) -> usize;
    fn evaluate(&self, params: &[&[f64]]) -> DVector<f64>;
    fn jacobians(&self, params: &[&[f64]]) -> Vec<DMatrix<f64>>;
}

/// Central-difference Jacobians on each block's tangent space.
pub fn numeric_jacobians(factor: &dyn Factor, params: &[&[f64]]) -> Vec<DMatrix<f64>> {
    let blocks = factor.blocks();
    let m = factor.num_residuals();
    let mut jacobians = Vec::with_capacity(blocks.len());

    for (k, id) in blocks.iter().enumerate() {
        let kind = id.kind();
        let local = kind.local_size();
        let mut jac = DMatrix::zeros(m, local);
        for d in 0..local {
            let mut delta = vec![0.0; local];

            delta[d] = NUMERIC_EPS;
            let mut plus = params[k].to_vec();
            kind.plus(params[k], &delta, &mut plus);
            let mut stacked: Vec<&[f64]> = params.to_vec();
            stacked[k] = &plus;
            let r_plus = factor.evaluate(&stacked);

            delta[d] = -NUMERIC_EPS;
            let mut minus = params[k].to_vec();
            kind.plus(params[k], &delta, &mut minus);
            stacked[k] = &minus;
            let r_minus = factor.evaluate(&stacked);

            let col = (r_plus - r_minus) / (2.0 * NUMERIC_EPS);
            jac.column_mut(d).copy_from(&col);
        }
        jacobians.push(jac);
    }
    jacobians
}

/// Huber loss with the convention ρ(s) = s for s ≤ b, 2√(bs) − b otherwise,
/// where s is the squared residual norm and b the squared scale.
#[derive(Debug, Clone, Copy)]
pub struct HuberLoss {
    b: f64,
}

impl HuberLoss {
    pub fn new(scale: f64) -> Self {
        Self { b: scale * scale }
    }

    pub fn rho(&self, s: f64) -> f64 {
        if s <= self.b {
            s
        } else {
            2.0 * (self.b * s).sqrt() - self.b
        }
    }

    /// IRLS weight √ρ′(s) applied to residual and Jacobian rows.
    pub fn weight(&self, s: f64) -> f64 {
        if s <= self.b {
            1.0
        } else {
            ((self.b / s).sqrt()).sqrt()
        }
    }
}

pub fn read_pose(x: &[f64]) -> (Vector3<f64>, UnitQuaternion<f64>) {
    (
        Vector3::new(x[0], x[1], x[2]),
        UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(x[6], x[3], x[4], x[5])),
    )
}

fn read_vec3(x: &[f64], offset: usize) -> Vector3<f64> {
    Vector3::new(x[offset], x[offset + 1], x[offset + 2])
}

/// Left quaternion product matrix in [w, x, y, z] ordering.
fn q_left(q: &UnitQuaternion<f64>) -> Matrix4<f64> {
    let (w, v) = (q.w, Vector3::new(q.i, q.j, q.k));
    let mut m = Matrix4::zeros();
    m[(0, 0)] = w;
    m.fixed_view_mut::<1, 3>(0, 1).copy_from(&(-v.transpose()));
    m.fixed_view_mut::<3, 1>(1, 0).copy_from(&v);
    m.fixed_view_mut::<3, 3>(1, 1)
        .copy_from(&(Matrix3::identity() * w + skew(&v)));
    m
}

/// Right quaternion product matrix in [w, x, y, z] ordering.
fn q_right(q: &UnitQuaternion<f64>) -> Matrix4<f64> {
    let (w, v) = (q.w, Vector3::new(q.i, q.j, q.k));
    let mut m = Matrix4::zeros();
    m[(0, 0)] = w;
    m.fixed_view_mut::<1, 3>(0, 1).copy_from(&(-v.transpose()));
    m.fixed_view_mut::<3, 1>(1, 0).copy_from(&v);
    m.fixed_view_mut::<3, 3>(1, 1)
        .copy_from(&(Matrix3::identity() * w - skew(&v)));
    m
}

// ───────────────────────────────────────────────────────────────────────────
// IMU factor
// ───────────────────────────────────────────────────────────────────────────

/// Preintegrated IMU constraint between adjacent window slots.
pub struct ImuFactor {
    pre: Preintegration,
    gravity: Vector3<f64>,
    sqrt_info: Matrix15,
    blocks: [BlockId; 4],
}

impl ImuFactor {
    pub fn new(i: usize, j: usize, pre: Preintegration, gravity: Vector3<f64>) -> Self {
        let sqrt_info = pre
            .covariance()
            .try_inverse()
            .and_then(|info| nalgebra::Cholesky::new(info).map(|c| c.l().transpose()))
            .unwrap_or_else(Matrix15::identity);
        Self {
            pre,
            gravity,
            sqrt_info,
            blocks: [
                BlockId::Pose(i),
                BlockId::SpeedBias(i),
                BlockId::Pose(j),
                BlockId::SpeedBias(j),
            ],
        }
    }
}

impl Factor for ImuFactor {
    fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    fn num_residuals(&self) -> usize {
        15
    }

    fn evaluate(&self, params: &[&[f64]]) -> DVector<f64> {
        let (p_i, q_i) = read_pose(params[0]);
        let v_i = read_vec3(params[1], 0);
        let ba_i = read_vec3(params[1], 3);
        let bg_i = read_vec3(params[1], 6);
        let (p_j, q_j) = read_pose(params[2]);
        let v_j = read_vec3(params[3], 0);
        let ba_j = read_vec3(params[3], 3);
        let bg_j = read_vec3(params[3], 6);

        let raw = self.pre.evaluate(
            &p_i, &q_i, &v_i, &ba_i, &bg_i, &p_j, &q_j, &v_j, &ba_j, &bg_j, &self.gravity,
        );
        DVector::from_column_slice((self.sqrt_info * raw).as_slice())
    }

    fn jacobians(&self, params: &[&[f64]]) -> Vec<DMatrix<f64>> {
        let (p_i, q_i) = read_pose(params[0]);
        let v_i = read_vec3(params[1], 0);
        let bg_i = read_vec3(params[1], 6);
        let (p_j, q_j) = read_pose(params[2]);
        let v_j = read_vec3(params[3], 0);

        let dt = self.pre.sum_dt;
        let g = self.gravity;
        let ri_inv = q_i.inverse().to_rotation_matrix().into_inner();

        let dq_dbg = self.pre.dq_dbg();
        let corrected_q = self.pre.delta_q
            * crate::geometry::delta_q(&(dq_dbg * (bg_i - self.pre.linearized_bg)));

        let mut j_pose_i = DMatrix::zeros(15, 6);
        j_pose_i
            .view_mut((O_P, 0), (3, 3))
            .copy_from(&(-ri_inv));
        j_pose_i.view_mut((O_P, 3), (3, 3)).copy_from(&skew(
            &(q_i.inverse() * (p_j - p_i - v_i * dt - 0.5 * g * dt * dt)),
        ));
        let ql = q_left(&(q_j.inverse() * q_i)) * q_right(&corrected_q);
        j_pose_i
            .view_mut((O_R, 3), (3, 3))
            .copy_from(&(-ql.fixed_view::<3, 3>(1, 1).into_owned()));
        j_pose_i
            .view_mut((O_V, 3), (3, 3))
            .copy_from(&skew(&(q_i.inverse() * (v_j - v_i - g * dt))));

        let mut j_sb_i = DMatrix::zeros(15, 9);
        j_sb_i.view_mut((O_P, 0), (3, 3)).copy_from(&(-ri_inv * dt));
        j_sb_i
            .view_mut((O_P, 3), (3, 3))
            .copy_from(&(-self.pre.dp_dba()));
        j_sb_i
            .view_mut((O_P, 6), (3, 3))
            .copy_from(&(-self.pre.dp_dbg()));
        let ql_bg = q_left(&(q_j.inverse() * q_i * self.pre.delta_q));
        j_sb_i
            .view_mut((O_R, 6), (3, 3))
            .copy_from(&(-(ql_bg.fixed_view::<3, 3>(1, 1).into_owned()) * dq_dbg));
        j_sb_i.view_mut((O_V, 0), (3, 3)).copy_from(&(-ri_inv));
        j_sb_i
            .view_mut((O_V, 3), (3, 3))
            .copy_from(&(-self.pre.dv_dba()));
        j_sb_i
            .view_mut((O_V, 6), (3, 3))
            .copy_from(&(-self.pre.dv_dbg()));
        j_sb_i
            .view_mut((O_BA, 3), (3, 3))
            .copy_from(&(-Matrix3::identity()));
        j_sb_i
            .view_mut((O_BG, 6), (3, 3))
            .copy_from(&(-Matrix3::identity()));

        let mut j_pose_j = DMatrix::zeros(15, 6);
        j_pose_j.view_mut((O_P, 0), (3, 3)).copy_from(&ri_inv);
        let ql_j = q_left(&(corrected_q.inverse() * q_i.inverse() * q_j));
        j_pose_j
            .view_mut((O_R, 3), (3, 3))
            .copy_from(&ql_j.fixed_view::<3, 3>(1, 1).into_owned());

        let mut j_sb_j = DMatrix::zeros(15, 9);
        j_sb_j.view_mut((O_V, 0), (3, 3)).copy_from(&ri_inv);
        j_sb_j
            .view_mut((O_BA, 3), (3, 3))
            .copy_from(&Matrix3::identity());
        j_sb_j
            .view_mut((O_BG, 6), (3, 3))
            .copy_from(&Matrix3::identity());

        let sqrt_info = DMatrix::from_column_slice(15, 15, self.sqrt_info.as_slice());
        vec![
            &sqrt_info * j_pose_i,
            &sqrt_info * j_sb_i,
            &sqrt_info * j_pose_j,
            &sqrt_info * j_sb_j,
        ]
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Projection factors
// ───────────────────────────────────────────────────────────────────────────

/// Shared observation payload of the projection factors.
#[derive(Debug, Clone)]
pub struct ProjectionObservation {
    pub pts_i: Vector3<f64>,
    pub pts_j: Vector3<f64>,
    pub velocity_i: Vector3<f64>,
    pub velocity_j: Vector3<f64>,
    pub td_i: f64,
    pub td_j: f64,
}

impl ProjectionObservation {
    fn compensated(&self, td: f64) -> (Vector3<f64>, Vector3<f64>) {
        (
            self.pts_i - (td - self.td_i) * self.velocity_i,
            self.pts_j - (td - self.td_j) * self.velocity_j,
        )
    }
}

fn projection_residual(
    pts_camera_j: &Vector3<f64>,
    pts_j_td: &Vector3<f64>,
    sqrt_info: f64,
    unit_sphere: bool,
) -> DVector<f64> {
    if unit_sphere {
        let diff = pts_camera_j.normalize() - pts_j_td.normalize();
        DVector::from_column_slice((sqrt_info * diff).as_slice())
    } else {
        let r = Vector2::new(
            pts_camera_j.x / pts_camera_j.z - pts_j_td.x / pts_j_td.z,
            pts_camera_j.y / pts_camera_j.z - pts_j_td.y / pts_j_td.z,
        );
        DVector::from_column_slice((sqrt_info * r).as_slice())
    }
}

/// Reprojection of a feature anchored at slot i onto the main camera at
/// slot j. Blocks: [Pose(i), Pose(j), Extrinsic(cam), Feature, Td].
pub struct ProjectionTwoFrameOneCam {
    obs: ProjectionObservation,
    sqrt_info: f64,
    unit_sphere: bool,
    blocks: [BlockId; 5],
}

impl ProjectionTwoFrameOneCam {
    pub fn new(
        i: usize,
        j: usize,
        cam: usize,
        feature: crate::feature::FeatureId,
        obs: ProjectionObservation,
        sqrt_info: f64,
        unit_sphere: bool,
    ) -> Self {
        Self {
            obs,
            sqrt_info,
            unit_sphere,
            blocks: [
                BlockId::Pose(i),
                BlockId::Pose(j),
                BlockId::Extrinsic(cam),
                BlockId::Feature(feature),
                BlockId::Td,
            ],
        }
    }
}

impl Factor for ProjectionTwoFrameOneCam {
    fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    fn num_residuals(&self) -> usize {
        if self.unit_sphere {
            3
        } else {
            2
        }
    }

    fn evaluate(&self, params: &[&[f64]]) -> DVector<f64> {
        let (p_i, q_i) = read_pose(params[0]);
        let (p_j, q_j) = read_pose(params[1]);
        let (tic, qic) = read_pose(params[2]);
        let inv_dep = params[3][0];
        let td = params[4][0];

        let (pts_i_td, pts_j_td) = self.obs.compensated(td);
        let pts_camera_i = pts_i_td / inv_dep;
        let pts_imu_i = qic * pts_camera_i + tic;
        let pts_w = q_i * pts_imu_i + p_i;
        let pts_imu_j = q_j.inverse() * (pts_w - p_j);
        let pts_camera_j = qic.inverse() * (pts_imu_j - tic);

        projection_residual(&pts_camera_j, &pts_j_td, self.sqrt_info, self.unit_sphere)
    }

    fn jacobians(&self, params: &[&[f64]]) -> Vec<DMatrix<f64>> {
        if self.unit_sphere {
            return numeric_jacobians(self, params);
        }

        let (p_i, q_i) = read_pose(params[0]);
        let (p_j, q_j) = read_pose(params[1]);
        let (tic, qic) = read_pose(params[2]);
        let inv_dep = params[3][0];
        let td = params[4][0];

        let (pts_i_td, pts_j_td) = self.obs.compensated(td);
        let pts_camera_i = pts_i_td / inv_dep;
        let pts_imu_i = qic * pts_camera_i + tic;
        let pts_w = q_i * pts_imu_i + p_i;
        let pts_imu_j = q_j.inverse() * (pts_w - p_j);
        let pts_camera_j = qic.inverse() * (pts_imu_j - tic);

        let ri = q_i.to_rotation_matrix().into_inner();
        let rj = q_j.to_rotation_matrix().into_inner();
        let ric = qic.to_rotation_matrix().into_inner();

        let (x, y, z) = (pts_camera_j.x, pts_camera_j.y, pts_camera_j.z);
        let reduce = self.sqrt_info
            * Matrix2x3::new(
                1.0 / z, 0.0, -x / (z * z),
                0.0, 1.0 / z, -y / (z * z),
            );

        let mut jaco_i = nalgebra::Matrix3x6::zeros();
        jaco_i
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(ric.transpose() * rj.transpose()));
        jaco_i
            .fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(ric.transpose() * rj.transpose() * ri * -skew(&pts_imu_i)));

        let mut jaco_j = nalgebra::Matrix3x6::zeros();
        jaco_j
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(-(ric.transpose() * rj.transpose())));
        jaco_j
            .fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(ric.transpose() * skew(&pts_imu_j)));

        let tmp_r = ric.transpose() * rj.transpose() * ri * ric;
        let mut jaco_ex = nalgebra::Matrix3x6::zeros();
        jaco_ex
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(ric.transpose() * (rj.transpose() * ri - Matrix3::identity())));
        jaco_ex.fixed_view_mut::<3, 3>(0, 3).copy_from(
            &(-tmp_r * skew(&pts_camera_i)
                + skew(&(tmp_r * pts_camera_i))
                + skew(&(ric.transpose()
                    * (rj.transpose() * (ri * tic + p_i - p_j) - tic)))),
        );

        let jaco_depth =
            tmp_r * pts_i_td * (-1.0 / (inv_dep * inv_dep));
        let jaco_td = tmp_r * self.obs.velocity_i / inv_dep * -1.0;
        let td_tail = self.sqrt_info
            * Vector2::new(self.obs.velocity_j.x, self.obs.velocity_j.y);

        let to_dmatrix = |m: &nalgebra::Matrix3x6<f64>| {
            let full = reduce * m;
            DMatrix::from_column_slice(2, 6, full.as_slice())
        };

        let j_depth = reduce * jaco_depth;
        let j_td = reduce * jaco_td + td_tail;

        vec![
            to_dmatrix(&jaco_i),
            to_dmatrix(&jaco_j),
            to_dmatrix(&jaco_ex),
            DMatrix::from_column_slice(2, 1, j_depth.as_slice()),
            DMatrix::from_column_slice(2, 1, j_td.as_slice()),
        ]
    }
}

/// Reprojection of a feature anchored in cam 0 at slot i onto cam 1 at
/// slot j. Blocks: [Pose(i), Pose(j), Extrinsic(0), Extrinsic(1), Feature,
/// Td].
pub struct ProjectionTwoFrameTwoCam {
    obs: ProjectionObservation,
    sqrt_info: f64,
    unit_sphere: bool,
    blocks: [BlockId; 6],
}

impl ProjectionTwoFrameTwoCam {
    pub fn new(
        i: usize,
        j: usize,
        feature: crate::feature::FeatureId,
        obs: ProjectionObservation,
        sqrt_info: f64,
        unit_sphere: bool,
    ) -> Self {
        Self {
            obs,
            sqrt_info,
            unit_sphere,
            blocks: [
                BlockId::Pose(i),
                BlockId::Pose(j),
                BlockId::Extrinsic(0),
                BlockId::Extrinsic(1),
                BlockId::Feature(feature),
                BlockId::Td,
            ],
        }
    }
}

impl Factor for ProjectionTwoFrameTwoCam {
    fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    fn num_residuals(&self) -> usize {
        if self.unit_sphere {
            3
        } else {
            2
        }
    }

    fn evaluate(&self, params: &[&[f64]]) -> DVector<f64> {
        let (p_i, q_i) = read_pose(params[0]);
        let (p_j, q_j) = read_pose(params[1]);
        let (tic0, qic0) = read_pose(params[2]);
        let (tic1, qic1) = read_pose(params[3]);
        let inv_dep = params[4][0];
        let td = params[5][0];

        let (pts_i_td, pts_j_td) = self.obs.compensated(td);
        let pts_camera_i = pts_i_td / inv_dep;
        let pts_imu_i = qic0 * pts_camera_i + tic0;
        let pts_w = q_i * pts_imu_i + p_i;
        let pts_imu_j = q_j.inverse() * (pts_w - p_j);
        let pts_camera_j = qic1.inverse() * (pts_imu_j - tic1);

        projection_residual(&pts_camera_j, &pts_j_td, self.sqrt_info, self.unit_sphere)
    }

    fn jacobians(&self, params: &[&[f64]]) -> Vec<DMatrix<f64>> {
        numeric_jacobians(self, params)
    }
}

/// Stereo constraint inside one frame: the anchor observation in cam 0
/// against the right-camera observation in cam 1. Blocks: [Extrinsic(0),
/// Extrinsic(1), Feature, Td].
pub struct ProjectionOneFrameTwoCam {
    obs: ProjectionObservation,
    sqrt_info: f64,
    unit_sphere: bool,
    blocks: [BlockId; 4],
}

impl ProjectionOneFrameTwoCam {
    pub fn new(
        feature: crate::feature::FeatureId,
        obs: ProjectionObservation,
        sqrt_info: f64,
        unit_sphere: bool,
    ) -> Self {
        Self {
            obs,
            sqrt_info,
            unit_sphere,
            blocks: [
                BlockId::Extrinsic(0),
                BlockId::Extrinsic(1),
                BlockId::Feature(feature),
                BlockId::Td,
            ],
        }
    }
}

impl Factor for ProjectionOneFrameTwoCam {
    fn blocks(&self) -> &[BlockId] {
        &self.blocks
    }

    fn num_residuals(&self) -> usize {
        if self.unit_sphere {
            3
        } else {
            2
        }
    }

    fn evaluate(&self, params: &[&[f64]]) -> DVector<f64> {
        let (tic0, qic0) = read_pose(params[0]);
        let (tic1, qic1) = read_pose(params[1]);
        let inv_dep = params[2][0];
        let td = params[3][0];

        let (pts_i_td, pts_j_td) = self.obs.compensated(td);
        let pts_camera_i = pts_i_td / inv_dep;
        let pts_imu = qic0 * pts_camera_i + tic0;
        let pts_camera_j = qic1.inverse() * (pts_imu - tic1);

        projection_residual(&pts_camera_j, &pts_j_td, self.sqrt_info, self.unit_sphere)
    }

    fn jacobians(&self, params: &[&[f64]]) -> Vec<DMatrix<f64>> {
        numeric_jacobians(self, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::ImuNoise;
    use approx::assert_relative_eq;

    fn pose_params(p: Vector3<f64>, q: UnitQuaternion<f64>) -> [f64; 7] {
        [p.x, p.y, p.z, q.i, q.j, q.k, q.w]
    }

    #[test]
    fn test_imu_factor_zero_residual_for_consistent_states() {
        let gravity = Vector3::new(0.0, 0.0, -9.81);
        let acc = Vector3::new(0.0, 0.0, 9.81);
        let gyr = Vector3::zeros();
        let mut pre = Preintegration::new(
            acc,
            gyr,
            Vector3::zeros(),
            Vector3::zeros(),
            &ImuNoise::default(),
        );
        for _ in 0..100 {
            pre.push(0.005, acc, gyr);
        }
        let factor = ImuFactor::new(0, 1, pre, gravity);

        let pose = pose_params(Vector3::zeros(), UnitQuaternion::identity());
        let sb = [0.0; 9];
        let r = factor.evaluate(&[&pose, &sb, &pose, &sb]);
        assert!(r.norm() < 1e-6, "residual norm {}", r.norm());
    }

    #[test]
    fn test_imu_factor_analytic_matches_numeric() {
        let gravity = Vector3::new(0.0, 0.0, -9.81);
        let acc = Vector3::new(0.3, -0.2, 9.9);
        let gyr = Vector3::new(0.02, 0.01, -0.03);
        let mut pre = Preintegration::new(
            acc,
            gyr,
            Vector3::zeros(),
            Vector3::zeros(),
            &ImuNoise::default(),
        );
        for _ in 0..40 {
            pre.push(0.005, acc, gyr);
        }
        let factor = ImuFactor::new(0, 1, pre, gravity);

        let pose_i = pose_params(
            Vector3::new(0.1, -0.2, 0.05),
            UnitQuaternion::from_euler_angles(0.02, -0.01, 0.1),
        );
        let pose_j = pose_params(
            Vector3::new(0.15, -0.18, 0.06),
            UnitQuaternion::from_euler_angles(0.025, -0.012, 0.11),
        );
        let sb_i = [0.2, 0.1, 0.0, 0.01, -0.01, 0.0, 1e-3, 2e-3, -1e-3];
        let sb_j = [0.22, 0.12, 0.01, 0.01, -0.01, 0.0, 1e-3, 2e-3, -1e-3];
        let params: [&[f64]; 4] = [&pose_i, &sb_i, &pose_j, &sb_j];

        let analytic = factor.jacobians(&params);
        let numeric = numeric_jacobians(&factor, &params);
        // The sqrt-information weighting amplifies finite-difference noise,
        // so the comparison is loose in absolute terms.
        for (a, n) in analytic.iter().zip(&numeric) {
            assert_relative_eq!(a, n, epsilon = 1e-2, max_relative = 1e-2);
        }
    }

    #[test]
    fn test_projection_factor_zero_residual_for_perfect_geometry() {
        // Feature 4 m ahead of an identity anchor pose, second pose shifted
        // 0.5 m right.
        let depth = 4.0;
        let p_world = Vector3::new(0.2, -0.1, depth);
        let pts_i = Vector3::new(p_world.x / depth, p_world.y / depth, 1.0);

        let p_j = Vector3::new(0.5, 0.0, 0.0);
        let local_j = p_world - p_j;
        let pts_j = Vector3::new(local_j.x / local_j.z, local_j.y / local_j.z, 1.0);

        let obs = ProjectionObservation {
            pts_i,
            pts_j,
            velocity_i: Vector3::zeros(),
            velocity_j: Vector3::zeros(),
            td_i: 0.0,
            td_j: 0.0,
        };
        let factor =
            ProjectionTwoFrameOneCam::new(0, 1, 0, 1, obs, 460.0 / 1.5, false);

        let pose_i = pose_params(Vector3::zeros(), UnitQuaternion::identity());
        let pose_j = pose_params(p_j, UnitQuaternion::identity());
        let extrinsic = pose_params(Vector3::zeros(), UnitQuaternion::identity());
        let inv_dep = [1.0 / depth];
        let td = [0.0];

        let r = factor.evaluate(&[&pose_i, &pose_j, &extrinsic, &inv_dep, &td]);
        assert!(r.norm() < 1e-9, "residual norm {}", r.norm());
    }

    #[test]
    fn test_projection_factor_analytic_matches_numeric() {
        let obs = ProjectionObservation {
            pts_i: Vector3::new(0.1, -0.05, 1.0),
            pts_j: Vector3::new(0.03, -0.04, 1.0),
            velocity_i: Vector3::new(0.2, 0.1, 0.0),
            velocity_j: Vector3::new(0.15, 0.05, 0.0),
            td_i: 0.0,
            td_j: 0.0,
        };
        let factor =
            ProjectionTwoFrameOneCam::new(0, 1, 0, 1, obs, 460.0 / 1.5, false);

        let pose_i = pose_params(
            Vector3::new(0.0, 0.1, 0.0),
            UnitQuaternion::from_euler_angles(0.01, 0.02, -0.01),
        );
        let pose_j = pose_params(
            Vector3::new(0.3, 0.1, 0.02),
            UnitQuaternion::from_euler_angles(0.015, 0.018, -0.012),
        );
        let extrinsic = pose_params(
            Vector3::new(0.02, 0.0, 0.01),
            UnitQuaternion::from_euler_angles(0.0, 0.0, 0.005),
        );
        let inv_dep = [0.25];
        let td = [0.001];
        let params: [&[f64]; 5] = [&pose_i, &pose_j, &extrinsic, &inv_dep, &td];

        let analytic = factor.jacobians(&params);
        let numeric = numeric_jacobians(&factor, &params);
        for (a, n) in analytic.iter().zip(&numeric) {
            assert_relative_eq!(a, n, epsilon = 1e-3, max_relative = 1e-3);
        }
    }

    #[test]
    fn test_one_frame_two_cam_sees_baseline() {
        // Stereo pair with 0.1 m baseline looking at a point 2 m ahead.
        let depth = 2.0;
        let pts_i = Vector3::new(0.0, 0.0, 1.0);
        let right_local = Vector3::new(-0.1, 0.0, depth);
        let pts_j = Vector3::new(right_local.x / right_local.z, 0.0, 1.0);

        let obs = ProjectionObservation {
            pts_i,
            pts_j,
            velocity_i: Vector3::zeros(),
            velocity_j: Vector3::zeros(),
            td_i: 0.0,
            td_j: 0.0,
        };
        let factor = ProjectionOneFrameTwoCam::new(1, obs, 460.0 / 1.5, false);

        let ex0 = pose_params(Vector3::zeros(), UnitQuaternion::identity());
        let ex1 = pose_params(Vector3::new(0.1, 0.0, 0.0), UnitQuaternion::identity());
        let inv_dep = [1.0 / depth];
        let td = [0.0];

        let r = factor.evaluate(&[&ex0, &ex1, &inv_dep, &td]);
        assert!(r.norm() < 1e-9, "residual norm {}", r.norm());

        // A wrong depth must produce a nonzero residual.
        let wrong = [1.0 / (depth * 2.0)];
        let r = factor.evaluate(&[&ex0, &ex1, &wrong, &td]);
        assert!(r.norm() > 1.0);
    }

    #[test]
    fn test_huber_weight_downweights_large_residuals() {
        let loss = HuberLoss::new(1.0);
        assert_relative_eq!(loss.weight(0.5), 1.0);
        assert!(loss.weight(100.0) < 0.5);
        assert_relative_eq!(loss.rho(0.25), 0.25);
        assert_relative_eq!(loss.rho(4.0), 2.0 * 2.0 - 1.0);
    }
}
