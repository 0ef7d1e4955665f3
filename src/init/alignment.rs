//! Visual-inertial alignment: gyroscope bias, per-frame velocities, gravity,
//! and metric scale from the vision-only structure and the preintegrated
//! IMU deltas.

use std::ops::AddAssign;

use nalgebra::{DMatrix, DVector, Matrix3, Matrix3x2, UnitQuaternion, Vector3};
use tracing::{debug, info, warn};

use crate::estimator::ImageFrame;

/// Minimum variance of per-interval (δv / Δt) for the IMU to count as
/// excited. Below it the alignment is attempted anyway; the check only
/// warns.
pub const MIN_IMU_EXCITATION: f64 = 0.25;

/// Closed-form gyroscope bias from window rotations: minimize
/// ∑‖δq(bg) ⊖ Rᵢᵀ Rⱼ‖² linearized at the current delta. One Gauss-Newton
/// step suffices; the caller repropagates afterwards.
pub fn solve_gyroscope_bias(frames: &[(f64, ImageFrame)]) -> Vector3<f64> {
    let mut a = Matrix3::<f64>::zeros();
    let mut b = Vector3::<f64>::zeros();

    for w in frames.windows(2) {
        let (_, frame_i) = &w[0];
        let (_, frame_j) = &w[1];
        let Some(pre) = frame_j.pre_integration.as_ref() else {
            continue;
        };

        let q_ij = UnitQuaternion::from_rotation_matrix(
            &nalgebra::Rotation3::from_matrix_unchecked(
                frame_i.rotation.transpose() * frame_j.rotation,
            ),
        );
        let tmp_a = pre.dq_dbg();
        let err = pre.delta_q.inverse() * q_ij;
        let tmp_b = 2.0 * Vector3::new(err.i, err.j, err.k);

        a += tmp_a.transpose() * tmp_a;
        b += tmp_a.transpose() * tmp_b;
    }

    let delta_bg = a
        .cholesky()
        .map(|c| c.solve(&b))
        .unwrap_or_else(Vector3::zeros);
    info!(?delta_bg, "gyroscope bias from initialization");
    delta_bg
}

/// Warn-only excitation check: variance of per-interval mean specific force.
pub fn check_imu_excitation(frames: &[(f64, ImageFrame)]) -> f64 {
    let deltas: Vec<Vector3<f64>> = frames
        .iter()
        .skip(1)
        .filter_map(|(_, f)| {
            f.pre_integration
                .as_ref()
                .map(|p| p.delta_v / p.sum_dt)
        })
        .collect();
    if deltas.len() < 2 {
        return 0.0;
    }

    let mean: Vector3<f64> = deltas.iter().sum::<Vector3<f64>>() / deltas.len() as f64;
    let var = deltas
        .iter()
        .map(|g| (g - mean).norm_squared())
        .sum::<f64>()
        / deltas.len() as f64;
    let var = var.sqrt();

    if var < MIN_IMU_EXCITATION {
        warn!(variance = var, "IMU excitation not enough");
    }
    var
}

/// Result of the linear alignment.
pub struct AlignmentResult {
    /// Per-keyframe body-frame velocities, in frame order.
    pub velocities: Vec<Vector3<f64>>,
    /// Gravity in the vision reference frame.
    pub gravity: Vector3<f64>,
    /// Metric scale of the vision-only structure.
    pub scale: f64,
}

/// Jointly solve per-frame velocity, gravity, and scale from the
/// preintegrated deltas, then refine gravity on its 2-DoF tangent with the
/// magnitude pinned to `gravity_norm`.
pub fn linear_alignment(
    frames: &[(f64, ImageFrame)],
    tic0: &Vector3<f64>,
    gravity_norm: f64,
) -> Option<AlignmentResult> {
    let n = frames.len();
    if n < 2 {
        return None;
    }
    let n_state = n * 3 + 3 + 1;

    let mut a = DMatrix::<f64>::zeros(n_state, n_state);
    let mut b = DVector::<f64>::zeros(n_state);

    for (i, w) in frames.windows(2).enumerate() {
        let (_, frame_i) = &w[0];
        let (_, frame_j) = &w[1];
        let pre = frame_j.pre_integration.as_ref()?;
        let dt = pre.sum_dt;

        let r_i = frame_i.rotation;
        let r_j = frame_j.rotation;
        let r_i_t = r_i.transpose();

        let mut tmp_a = DMatrix::<f64>::zeros(6, 10);
        let mut tmp_b = DVector::<f64>::zeros(6);

        tmp_a
            .view_mut((0, 0), (3, 3))
            .copy_from(&(-dt * Matrix3::identity()));
        tmp_a
            .view_mut((0, 6), (3, 3))
            .copy_from(&(r_i_t * dt * dt / 2.0));
        tmp_a
            .view_mut((0, 9), (3, 1))
            .copy_from(&(r_i_t * (frame_j.translation - frame_i.translation) / 100.0));
        tmp_b
            .rows_mut(0, 3)
            .copy_from(&(pre.delta_p + r_i_t * r_j * tic0 - tic0));

        tmp_a
            .view_mut((3, 0), (3, 3))
            .copy_from(&(-Matrix3::identity()));
        tmp_a.view_mut((3, 3), (3, 3)).copy_from(&(r_i_t * r_j));
        tmp_a.view_mut((3, 6), (3, 3)).copy_from(&(r_i_t * dt));
        tmp_b.rows_mut(3, 3).copy_from(&pre.delta_v);

        let h = tmp_a.transpose() * &tmp_a;
        let g = tmp_a.transpose() * &tmp_b;

        // Velocity blocks of frames i and i+1 sit at 3i and 3(i+1); gravity
        // and scale close the state vector.
        a.view_mut((i * 3, i * 3), (6, 6))
            .add_assign(&h.view((0, 0), (6, 6)));
        b.rows_mut(i * 3, 6).add_assign(&g.rows(0, 6));

        a.view_mut((n * 3, n * 3), (4, 4))
            .add_assign(&h.view((6, 6), (4, 4)));
        b.rows_mut(n * 3, 4).add_assign(&g.rows(6, 4));

        a.view_mut((i * 3, n * 3), (6, 4))
            .add_assign(&h.view((0, 6), (6, 4)));
        a.view_mut((n * 3, i * 3), (4, 6))
            .add_assign(&h.view((6, 0), (4, 6)));
    }

    a *= 1000.0;
    b *= 1000.0;
    let x = a.clone().cholesky()?.solve(&b);

    let scale = x[n_state - 1] / 100.0;
    let gravity = Vector3::new(x[n * 3], x[n * 3 + 1], x[n * 3 + 2]);
    debug!(scale, ?gravity, "linear alignment first pass");

    if scale < 0.0 || (gravity.norm() - gravity_norm).abs() > 1.0 {
        warn!(
            scale,
            gravity_norm = gravity.norm(),
            "linear alignment rejected"
        );
        return None;
    }

    let (gravity, x) = refine_gravity(frames, tic0, gravity_norm, &gravity)?;
    let scale = x[x.len() - 1] / 100.0;
    if scale < 0.0 {
        return None;
    }

    let velocities = (0..n)
        .map(|i| Vector3::new(x[i * 3], x[i * 3 + 1], x[i * 3 + 2]))
        .collect();

    Some(AlignmentResult {
        velocities,
        gravity,
        scale,
    })
}

/// Orthonormal basis of the tangent plane at a gravity direction.
fn tangent_basis(g0: &Vector3<f64>) -> Matrix3x2<f64> {
    let a = g0.normalize();
    let mut tmp = Vector3::new(0.0, 0.0, 1.0);
    if (a - tmp).norm() < 1e-6 {
        tmp = Vector3::new(1.0, 0.0, 0.0);
    }
    let b = (tmp - a * a.dot(&tmp)).normalize();
    let c = a.cross(&b);
    Matrix3x2::from_columns(&[b, c])
}

/// Re-solve the alignment with gravity constrained to the sphere of radius
/// `gravity_norm`, iterating on the 2-DoF tangent parameterization.
fn refine_gravity(
    frames: &[(f64, ImageFrame)],
    tic0: &Vector3<f64>,
    gravity_norm: f64,
    g_init: &Vector3<f64>,
) -> Option<(Vector3<f64>, DVector<f64>)> {
    let n = frames.len();
    let n_state = n * 3 + 2 + 1;

    let mut g0 = g_init.normalize() * gravity_norm;
    let mut x = DVector::zeros(n_state);

    for _ in 0..4 {
        let lxly = tangent_basis(&g0);
        let mut a = DMatrix::<f64>::zeros(n_state, n_state);
        let mut b = DVector::<f64>::zeros(n_state);

        for (i, w) in frames.windows(2).enumerate() {
            let (_, frame_i) = &w[0];
            let (_, frame_j) = &w[1];
            let pre = frame_j.pre_integration.as_ref()?;
            let dt = pre.sum_dt;

            let r_i_t = frame_i.rotation.transpose();
            let r_j = frame_j.rotation;

            let mut tmp_a = DMatrix::<f64>::zeros(6, 9);
            let mut tmp_b = DVector::<f64>::zeros(6);

            tmp_a
                .view_mut((0, 0), (3, 3))
                .copy_from(&(-dt * Matrix3::identity()));
            tmp_a
                .view_mut((0, 6), (3, 2))
                .copy_from(&(r_i_t * dt * dt / 2.0 * lxly));
            tmp_a
                .view_mut((0, 8), (3, 1))
                .copy_from(&(r_i_t * (frame_j.translation - frame_i.translation) / 100.0));
            tmp_b.rows_mut(0, 3).copy_from(
                &(pre.delta_p + r_i_t * r_j * tic0 - tic0 - r_i_t * dt * dt / 2.0 * g0),
            );

            tmp_a
                .view_mut((3, 0), (3, 3))
                .copy_from(&(-Matrix3::identity()));
            tmp_a.view_mut((3, 3), (3, 3)).copy_from(&(r_i_t * r_j));
            tmp_a
                .view_mut((3, 6), (3, 2))
                .copy_from(&(r_i_t * dt * lxly));
            tmp_b
                .rows_mut(3, 3)
                .copy_from(&(pre.delta_v - r_i_t * dt * g0));

            let h = tmp_a.transpose() * &tmp_a;
            let g = tmp_a.transpose() * &tmp_b;

            a.view_mut((i * 3, i * 3), (6, 6))
                .add_assign(&h.view((0, 0), (6, 6)));
            b.rows_mut(i * 3, 6).add_assign(&g.rows(0, 6));

            a.view_mut((n * 3, n * 3), (3, 3))
                .add_assign(&h.view((6, 6), (3, 3)));
            b.rows_mut(n * 3, 3).add_assign(&g.rows(6, 3));

            a.view_mut((i * 3, n * 3), (6, 3))
                .add_assign(&h.view((0, 6), (6, 3)));
            a.view_mut((n * 3, i * 3), (3, 6))
                .add_assign(&h.view((6, 0), (3, 6)));
        }

        a *= 1000.0;
        b *= 1000.0;
        x = a.clone().cholesky()?.solve(&b);

        let dg = nalgebra::Vector2::new(x[n * 3], x[n * 3 + 1]);
        g0 = (g0 + lxly * dg).normalize() * gravity_norm;
    }

    Some((g0, x))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tangent_basis_is_orthonormal() {
        let g = Vector3::new(0.3, -0.4, 9.7);
        let basis = tangent_basis(&g);
        let b0 = basis.column(0);
        let b1 = basis.column(1);

        approx::assert_relative_eq!(b0.norm(), 1.0, epsilon = 1e-12);
        approx::assert_relative_eq!(b1.norm(), 1.0, epsilon = 1e-12);
        approx::assert_relative_eq!(b0.dot(&b1), 0.0, epsilon = 1e-12);
        approx::assert_relative_eq!(b0.dot(&g.normalize()), 0.0, epsilon = 1e-12);
    }
}
