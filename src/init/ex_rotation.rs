//! Online camera-IMU rotation calibration.
//!
//! Accumulates frame-to-frame camera rotations (from the essential matrix)
//! against the gyro preintegration deltas and solves the hand-eye rotation
//! with a robust-weighted quaternion least squares. Used when no usable
//! extrinsic seed is configured.

use nalgebra::{DMatrix, Matrix3, Matrix4, UnitQuaternion, Vector3, Vector4};
use tracing::{debug, info};

use super::relative::solve_relative_rt;
use crate::geometry::skew;

pub struct InitialExRotation {
    rc: Vec<Matrix3<f64>>,
    rimu: Vec<Matrix3<f64>>,
    rc_g: Vec<Matrix3<f64>>,
    ric: Matrix3<f64>,
    frame_count: usize,
    window_size: usize,
}

impl InitialExRotation {
    pub fn new(window_size: usize) -> Self {
        Self {
            rc: Vec::new(),
            rimu: Vec::new(),
            rc_g: Vec::new(),
            ric: Matrix3::identity(),
            frame_count: 0,
            window_size,
        }
    }

    /// Feed one frame pair; returns the calibrated rotation once enough
    /// rotation excitation has accumulated.
    pub fn calibrate(
        &mut self,
        corres: &[(Vector3<f64>, Vector3<f64>)],
        delta_q_imu: &UnitQuaternion<f64>,
    ) -> Option<Matrix3<f64>> {
        self.frame_count += 1;
        let rel = solve_relative_rt(corres)?;
        self.rc.push(rel.0);
        self.rimu.push(delta_q_imu.to_rotation_matrix().into_inner());
        self.rc_g
            .push(self.ric.transpose() * self.rimu.last().unwrap() * self.ric);

        let n = self.rc.len();
        let mut a = DMatrix::<f64>::zeros(n * 4, 4);
        for i in 0..n {
            let q1 = UnitQuaternion::from_rotation_matrix(
                &nalgebra::Rotation3::from_matrix_unchecked(self.rc[i]),
            );
            let q2 = UnitQuaternion::from_rotation_matrix(
                &nalgebra::Rotation3::from_matrix_unchecked(self.rc_g[i]),
            );
            let angular_distance = q1.angle_to(&q2).to_degrees();
            let huber = if angular_distance > 5.0 {
                5.0 / angular_distance
            } else {
                1.0
            };
            debug!(i, angular_distance, "ex-rotation pair");

            let l = quat_matrix_left(&q1);
            let r = quat_matrix_right(&q2);
            a.view_mut((i * 4, 0), (4, 4))
                .copy_from(&(huber * (l - r)));
        }

        // Null-space direction of A is the calibrated rotation.
        let svd = a.svd(true, true);
        let v_t = svd.v_t?;
        let x = v_t.row(3);
        let q = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
            x[0], x[1], x[2], x[3],
        ));
        self.ric = q
            .to_rotation_matrix()
            .into_inner()
            .transpose();

        if self.frame_count >= self.window_size && svd.singular_values[2] > 0.25 {
            info!(ric = ?self.ric, "extrinsic rotation calibrated");
            Some(self.ric)
        } else {
            None
        }
    }
}

/// Left quaternion product matrix in [w, x, y, z] ordering.
fn quat_matrix_left(q: &UnitQuaternion<f64>) -> Matrix4<f64> {
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
fn quat_matrix_right(q: &UnitQuaternion<f64>) -> Matrix4<f64> {
    let (w, v) = (q.w, Vector3::new(q.i, q.j, q.k));
    let mut m = Matrix4::zeros();
    m[(0, 0)] = w;
    m.fixed_view_mut::<1, 3>(0, 1).copy_from(&(-v.transpose()));
    m.fixed_view_mut::<3, 1>(1, 0).copy_from(&v);
    m.fixed_view_mut::<3, 3>(1, 1)
        .copy_from(&(Matrix3::identity() * w - skew(&v)));
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quat_matrices_reproduce_products() {
        let p = UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3);
        let q = UnitQuaternion::from_euler_angles(-0.2, 0.1, 0.05);

        let pq = (p * q).into_inner();
        let via_left = quat_matrix_left(&p) * Vector4::new(q.w, q.i, q.j, q.k);
        let via_right = quat_matrix_right(&q) * Vector4::new(p.w, p.i, p.j, p.k);

        for (got, want) in [
            (via_left, Vector4::new(pq.w, pq.i, pq.j, pq.k)),
            (via_right, Vector4::new(pq.w, pq.i, pq.j, pq.k)),
        ] {
            approx::assert_relative_eq!(got, want, epsilon = 1e-12);
        }
    }
}
