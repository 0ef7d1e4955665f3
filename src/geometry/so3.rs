//! SO(3) utilities shared by the preintegrator, the optimizer, and the
//! initializer.
//!
//! Provides skew-symmetric matrix construction, small-angle quaternions,
//! Euler-angle conversions, and gravity alignment. Euler angles are in
//! degrees, ordered yaw-pitch-roll, matching the gauge bookkeeping in the
//! estimator.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// First-order quaternion for a small rotation vector θ: q ≈ [1, θ/2].
///
/// The preintegrator and the fast-forward predictor both advance attitude
/// with this half-angle form rather than the exact exponential, so that a
/// repropagation replays to the same bits.
pub fn delta_q(theta: &Vector3<f64>) -> UnitQuaternion<f64> {
    let half = 0.5 * theta;
    UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(1.0, half.x, half.y, half.z))
}

/// Rotation matrix → yaw-pitch-roll in degrees.
pub fn rotation_to_ypr(r: &Matrix3<f64>) -> Vector3<f64> {
    let n = r.column(0);
    let o = r.column(1);
    let a = r.column(2);

    let yaw = n[1].atan2(n[0]);
    let pitch = (-n[2]).atan2(n[0] * yaw.cos() + n[1] * yaw.sin());
    let roll = (a[0] * yaw.sin() - a[1] * yaw.cos())
        .atan2(-o[0] * yaw.sin() + o[1] * yaw.cos());

    Vector3::new(yaw, pitch, roll) / std::f64::consts::PI * 180.0
}

/// Yaw-pitch-roll in degrees → rotation matrix.
pub fn ypr_to_rotation(ypr: &Vector3<f64>) -> Matrix3<f64> {
    let y = ypr.x / 180.0 * std::f64::consts::PI;
    let p = ypr.y / 180.0 * std::f64::consts::PI;
    let r = ypr.z / 180.0 * std::f64::consts::PI;

    let rz = Matrix3::new(
        y.cos(), -y.sin(), 0.0,
        y.sin(), y.cos(), 0.0,
        0.0, 0.0, 1.0,
    );
    let ry = Matrix3::new(
        p.cos(), 0.0, p.sin(),
        0.0, 1.0, 0.0,
        -p.sin(), 0.0, p.cos(),
    );
    let rx = Matrix3::new(
        1.0, 0.0, 0.0,
        0.0, r.cos(), -r.sin(),
        0.0, r.sin(), r.cos(),
    );

    rz * ry * rx
}

/// Rotation that aligns a measured gravity direction with +z, with zero yaw.
///
/// `g_measured` is the averaged accelerometer reading of a static body
/// (which points opposite to gravity, i.e. up). The returned R0 satisfies
/// `R0 * g_measured ∝ (0, 0, 1)` and `yaw(R0) = 0`.
pub fn gravity_to_rotation(g_measured: &Vector3<f64>) -> Matrix3<f64> {
    let ng1 = g_measured.normalize();
    let ng2 = Vector3::new(0.0, 0.0, 1.0);
    let r0 = UnitQuaternion::rotation_between(&ng1, &ng2)
        .unwrap_or_else(UnitQuaternion::identity)
        .to_rotation_matrix()
        .into_inner();
    let yaw = rotation_to_ypr(&r0).x;
    ypr_to_rotation(&Vector3::new(-yaw, 0.0, 0.0)) * r0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        assert_relative_eq!(v.cross(&u), skew(&v) * u, epsilon = 1e-12);
    }

    #[test]
    fn test_ypr_round_trip() {
        let ypr = Vector3::new(31.0, -12.0, 45.0);
        let r = ypr_to_rotation(&ypr);
        assert_relative_eq!(rotation_to_ypr(&r), ypr, epsilon = 1e-9);
    }

    #[test]
    fn test_gravity_alignment_zero_yaw() {
        // Tilted static accelerometer reading
        let g_measured = Vector3::new(1.0, -0.5, 9.5);
        let r0 = gravity_to_rotation(&g_measured);

        let aligned = r0 * g_measured.normalize();
        assert_relative_eq!(aligned, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-9);
        assert_relative_eq!(rotation_to_ypr(&r0).x, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_delta_q_matches_exponential_for_small_angles() {
        let theta = Vector3::new(1e-4, -2e-4, 5e-5);
        let approx_q = delta_q(&theta);
        let exact_q = UnitQuaternion::from_scaled_axis(theta);
        assert!(approx_q.angle_to(&exact_q) < 1e-10);
    }
}
