//! IMU preintegration between consecutive window keyframes.
//!
//! Accumulates high-rate IMU samples into a relative motion delta
//! (δp, δq, δv) referenced at fixed biases, together with the 15×15
//! covariance of [δp, δθ, δv, δba, δbg] and the Jacobian used for
//! first-order bias correction. Raw samples are buffered so the delta can
//! be replayed from scratch when the reference biases move too far for the
//! linear correction to hold.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use super::sample::ImuNoise;
use super::types::{Matrix15, Matrix15x18, Matrix18, Vector15, O_BA, O_BG, O_P, O_R, O_V};
use crate::geometry::{delta_q, skew};

/// Preintegrated IMU delta over one keyframe interval.
#[derive(Debug, Clone)]
pub struct Preintegration {
    /// Previous sample fed to the midpoint rule.
    acc_0: Vector3<f64>,
    gyr_0: Vector3<f64>,
    /// First sample of the interval, restored on repropagation.
    linearized_acc: Vector3<f64>,
    linearized_gyr: Vector3<f64>,
    /// Reference biases the delta is linearized at.
    pub linearized_ba: Vector3<f64>,
    pub linearized_bg: Vector3<f64>,

    /// d[δp, δθ, δv, δba, δbg] / d[initial state]; the bias columns feed the
    /// first-order correction in `evaluate`.
    jacobian: Matrix15,
    covariance: Matrix15,
    noise: Matrix18,

    pub sum_dt: f64,
    pub delta_p: Vector3<f64>,
    pub delta_q: UnitQuaternion<f64>,
    pub delta_v: Vector3<f64>,

    /// Buffered (dt, acc, gyr) for repropagation.
    buf: Vec<(f64, Vector3<f64>, Vector3<f64>)>,
}

impl Preintegration {
    /// Start an empty delta at the given reference biases, seeded with the
    /// sample at the interval start.
    pub fn new(
        acc_0: Vector3<f64>,
        gyr_0: Vector3<f64>,
        linearized_ba: Vector3<f64>,
        linearized_bg: Vector3<f64>,
        noise: &ImuNoise,
    ) -> Self {
        Self {
            acc_0,
            gyr_0,
            linearized_acc: acc_0,
            linearized_gyr: gyr_0,
            linearized_ba,
            linearized_bg,
            jacobian: Matrix15::identity(),
            covariance: Matrix15::zeros(),
            noise: noise.input_covariance(),
            sum_dt: 0.0,
            delta_p: Vector3::zeros(),
            delta_q: UnitQuaternion::identity(),
            delta_v: Vector3::zeros(),
            buf: Vec::new(),
        }
    }

    /// Append one sample and propagate mean, covariance, and bias Jacobian.
    pub fn push(&mut self, dt: f64, acc: Vector3<f64>, gyr: Vector3<f64>) {
        self.buf.push((dt, acc, gyr));
        self.propagate(dt, acc, gyr);
    }

    /// Replay every buffered sample from scratch with new reference biases.
    pub fn repropagate(&mut self, linearized_ba: Vector3<f64>, linearized_bg: Vector3<f64>) {
        self.sum_dt = 0.0;
        self.acc_0 = self.linearized_acc;
        self.gyr_0 = self.linearized_gyr;
        self.delta_p = Vector3::zeros();
        self.delta_q = UnitQuaternion::identity();
        self.delta_v = Vector3::zeros();
        self.linearized_ba = linearized_ba;
        self.linearized_bg = linearized_bg;
        self.jacobian = Matrix15::identity();
        self.covariance = Matrix15::zeros();

        let buf = std::mem::take(&mut self.buf);
        for &(dt, acc, gyr) in &buf {
            self.propagate(dt, acc, gyr);
        }
        self.buf = buf;
    }

    /// Midpoint integration of a single step, including the discrete
    /// covariance propagation Σ ← FΣFᵀ + VQVᵀ.
    fn propagate(&mut self, dt: f64, acc_1: Vector3<f64>, gyr_1: Vector3<f64>) {
        let dt2 = dt * dt;

        let un_acc_0 = self.delta_q * (self.acc_0 - self.linearized_ba);
        let un_gyr = 0.5 * (self.gyr_0 + gyr_1) - self.linearized_bg;
        let result_delta_q = self.delta_q * delta_q(&(un_gyr * dt));
        let un_acc_1 = result_delta_q * (acc_1 - self.linearized_ba);
        let un_acc = 0.5 * (un_acc_0 + un_acc_1);
        let result_delta_p = self.delta_p + self.delta_v * dt + 0.5 * un_acc * dt2;
        let result_delta_v = self.delta_v + un_acc * dt;

        let w_x = skew(&un_gyr);
        let a_0_x = skew(&(self.acc_0 - self.linearized_ba));
        let a_1_x = skew(&(acc_1 - self.linearized_ba));
        let r = self.delta_q.to_rotation_matrix().into_inner();
        let r1 = result_delta_q.to_rotation_matrix().into_inner();
        let eye = Matrix3::<f64>::identity();

        let mut f = Matrix15::identity();
        f.fixed_view_mut::<3, 3>(O_P, O_R).copy_from(
            &(-0.25 * r * a_0_x * dt2 - 0.25 * r1 * a_1_x * (eye - w_x * dt) * dt2),
        );
        f.fixed_view_mut::<3, 3>(O_P, O_V).copy_from(&(eye * dt));
        f.fixed_view_mut::<3, 3>(O_P, O_BA)
            .copy_from(&(-0.25 * (r + r1) * dt2));
        f.fixed_view_mut::<3, 3>(O_P, O_BG)
            .copy_from(&(0.25 * r1 * a_1_x * dt2 * dt));
        f.fixed_view_mut::<3, 3>(O_R, O_R).copy_from(&(eye - w_x * dt));
        f.fixed_view_mut::<3, 3>(O_R, O_BG).copy_from(&(-eye * dt));
        f.fixed_view_mut::<3, 3>(O_V, O_R).copy_from(
            &(-0.5 * r * a_0_x * dt - 0.5 * r1 * a_1_x * (eye - w_x * dt) * dt),
        );
        f.fixed_view_mut::<3, 3>(O_V, O_BA)
            .copy_from(&(-0.5 * (r + r1) * dt));
        f.fixed_view_mut::<3, 3>(O_V, O_BG)
            .copy_from(&(0.5 * r1 * a_1_x * dt2));

        let mut v = Matrix15x18::zeros();
        v.fixed_view_mut::<3, 3>(O_P, 0).copy_from(&(0.25 * r * dt2));
        v.fixed_view_mut::<3, 3>(O_P, 3)
            .copy_from(&(-0.125 * r1 * a_1_x * dt2 * dt));
        v.fixed_view_mut::<3, 3>(O_P, 6).copy_from(&(0.25 * r1 * dt2));
        v.fixed_view_mut::<3, 3>(O_P, 9)
            .copy_from(&(-0.125 * r1 * a_1_x * dt2 * dt));
        v.fixed_view_mut::<3, 3>(O_R, 3).copy_from(&(0.5 * eye * dt));
        v.fixed_view_mut::<3, 3>(O_R, 9).copy_from(&(0.5 * eye * dt));
        v.fixed_view_mut::<3, 3>(O_V, 0).copy_from(&(0.5 * r * dt));
        v.fixed_view_mut::<3, 3>(O_V, 3)
            .copy_from(&(-0.25 * r1 * a_1_x * dt2));
        v.fixed_view_mut::<3, 3>(O_V, 6).copy_from(&(0.5 * r1 * dt));
        v.fixed_view_mut::<3, 3>(O_V, 9)
            .copy_from(&(-0.25 * r1 * a_1_x * dt2));
        v.fixed_view_mut::<3, 3>(O_BA, 12).copy_from(&(eye * dt));
        v.fixed_view_mut::<3, 3>(O_BG, 15).copy_from(&(eye * dt));

        self.jacobian = f * self.jacobian;
        self.covariance =
            f * self.covariance * f.transpose() + v * self.noise * v.transpose();

        self.delta_p = result_delta_p;
        self.delta_q = result_delta_q;
        self.delta_v = result_delta_v;
        self.sum_dt += dt;
        self.acc_0 = acc_1;
        self.gyr_0 = gyr_1;
    }

    /// 15-dim residual of the delta against the free-body motion between two
    /// states, linearly corrected for the deviation of (Bai, Bgi) from the
    /// reference biases. `gravity` is the world gravity vector (pointing
    /// down).
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        p_i: &Vector3<f64>,
        q_i: &UnitQuaternion<f64>,
        v_i: &Vector3<f64>,
        ba_i: &Vector3<f64>,
        bg_i: &Vector3<f64>,
        p_j: &Vector3<f64>,
        q_j: &UnitQuaternion<f64>,
        v_j: &Vector3<f64>,
        ba_j: &Vector3<f64>,
        bg_j: &Vector3<f64>,
        gravity: &Vector3<f64>,
    ) -> Vector15 {
        let dt = self.sum_dt;
        let dba = ba_i - self.linearized_ba;
        let dbg = bg_i - self.linearized_bg;

        let corrected_delta_q = self.delta_q * delta_q(&(self.dq_dbg() * dbg));
        let corrected_delta_v = self.delta_v + self.dv_dba() * dba + self.dv_dbg() * dbg;
        let corrected_delta_p = self.delta_p + self.dp_dba() * dba + self.dp_dbg() * dbg;

        let r_p = q_i.inverse() * (p_j - p_i - v_i * dt - 0.5 * gravity * dt * dt)
            - corrected_delta_p;
        let q_err = corrected_delta_q.inverse() * (q_i.inverse() * q_j);
        let r_q = 2.0 * Vector3::new(q_err.i, q_err.j, q_err.k);
        let r_v = q_i.inverse() * (v_j - v_i - gravity * dt) - corrected_delta_v;
        let r_ba = ba_j - ba_i;
        let r_bg = bg_j - bg_i;

        let mut residual = Vector15::zeros();
        residual.fixed_view_mut::<3, 1>(O_P, 0).copy_from(&r_p);
        residual.fixed_view_mut::<3, 1>(O_R, 0).copy_from(&r_q);
        residual.fixed_view_mut::<3, 1>(O_V, 0).copy_from(&r_v);
        residual.fixed_view_mut::<3, 1>(O_BA, 0).copy_from(&r_ba);
        residual.fixed_view_mut::<3, 1>(O_BG, 0).copy_from(&r_bg);
        residual
    }

    pub fn covariance(&self) -> &Matrix15 {
        &self.covariance
    }

    /// Buffered raw samples, in push order.
    pub fn samples(&self) -> &[(f64, Vector3<f64>, Vector3<f64>)] {
        &self.buf
    }

    pub fn dp_dba(&self) -> Matrix3<f64> {
        self.jacobian.fixed_view::<3, 3>(O_P, O_BA).into_owned()
    }

    pub fn dp_dbg(&self) -> Matrix3<f64> {
        self.jacobian.fixed_view::<3, 3>(O_P, O_BG).into_owned()
    }

    pub fn dq_dbg(&self) -> Matrix3<f64> {
        self.jacobian.fixed_view::<3, 3>(O_R, O_BG).into_owned()
    }

    pub fn dv_dba(&self) -> Matrix3<f64> {
        self.jacobian.fixed_view::<3, 3>(O_V, O_BA).into_owned()
    }

    pub fn dv_dbg(&self) -> Matrix3<f64> {
        self.jacobian.fixed_view::<3, 3>(O_V, O_BG).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);

    fn static_sample() -> (Vector3<f64>, Vector3<f64>) {
        // A static accelerometer measures specific force, i.e. +g upward.
        (Vector3::new(0.0, 0.0, 9.81), Vector3::zeros())
    }

    #[test]
    fn test_static_body_evaluates_to_zero() {
        let (acc, gyr) = static_sample();
        let mut pre = Preintegration::new(
            acc,
            gyr,
            Vector3::zeros(),
            Vector3::zeros(),
            &ImuNoise::default(),
        );
        for _ in 0..200 {
            pre.push(0.005, acc, gyr);
        }

        let p = Vector3::zeros();
        let q = UnitQuaternion::identity();
        let v = Vector3::zeros();
        let b = Vector3::zeros();
        let residual = pre.evaluate(&p, &q, &v, &b, &b, &p, &q, &v, &b, &b, &GRAVITY);

        assert!(residual.norm() < 1e-6, "residual {}", residual.norm());
    }

    #[test]
    fn test_constant_velocity_evaluates_to_zero() {
        let (acc, gyr) = static_sample();
        let mut pre = Preintegration::new(
            acc,
            gyr,
            Vector3::zeros(),
            Vector3::zeros(),
            &ImuNoise::default(),
        );
        let dt = 0.005;
        let steps = 100;
        for _ in 0..steps {
            pre.push(dt, acc, gyr);
        }

        let total = dt * steps as f64;
        let vel = Vector3::new(1.0, 0.0, 0.0);
        let p_i = Vector3::zeros();
        let p_j = vel * total;
        let q = UnitQuaternion::identity();
        let b = Vector3::zeros();
        let residual =
            pre.evaluate(&p_i, &q, &vel, &b, &b, &p_j, &q, &vel, &b, &b, &GRAVITY);

        assert!(residual.norm() < 1e-6, "residual {}", residual.norm());
    }

    #[test]
    fn test_repropagate_matches_fresh_integration() {
        let acc = Vector3::new(0.3, -0.1, 9.6);
        let gyr = Vector3::new(0.02, 0.05, -0.01);
        let ba = Vector3::new(0.01, 0.0, -0.02);
        let bg = Vector3::new(1e-3, -2e-3, 5e-4);

        let mut a = Preintegration::new(acc, gyr, Vector3::zeros(), Vector3::zeros(),
            &ImuNoise::default());
        let mut b = Preintegration::new(acc, gyr, ba, bg, &ImuNoise::default());
        for i in 0..50 {
            let wiggle = Vector3::new(0.0, 0.001 * i as f64, 0.0);
            a.push(0.005, acc + wiggle, gyr);
            b.push(0.005, acc + wiggle, gyr);
        }

        // Replaying `a` at (ba, bg) must reproduce `b` exactly.
        a.repropagate(ba, bg);
        assert_eq!(a.delta_p, b.delta_p);
        assert_eq!(a.delta_v, b.delta_v);
        assert_eq!(a.delta_q, b.delta_q);
        assert_eq!(a.sum_dt, b.sum_dt);
    }

    #[test]
    fn test_covariance_symmetric_positive_diagonal() {
        let (acc, gyr) = static_sample();
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

        let cov = pre.covariance();
        for i in 0..15 {
            assert!(cov[(i, i)] > 0.0, "diagonal {} not positive", i);
            for j in 0..15 {
                assert_relative_eq!(cov[(i, j)], cov[(j, i)], epsilon = 1e-15);
            }
        }
    }

    #[test]
    fn test_bias_correction_tracks_small_bias_change() {
        let acc = Vector3::new(0.2, 0.1, 9.7);
        let gyr = Vector3::new(0.1, -0.05, 0.02);
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

        let dbg = Vector3::new(1e-4, -5e-5, 2e-4);
        let corrected = pre.delta_q * delta_q(&(pre.dq_dbg() * dbg));

        let mut replayed = pre.clone();
        replayed.repropagate(Vector3::zeros(), dbg);

        // First-order correction should stay close to the exact replay.
        assert!(corrected.angle_to(&replayed.delta_q) < 1e-6);
    }
}
