//! Rigid-body transform.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// SE(3) transform stored as unit quaternion + translation.
///
/// Used for extrinsics (camera-to-body) and published poses. The window
/// itself keeps rotations as matrices for the gauge arithmetic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a rotation matrix and translation.
    pub fn from_parts(r: &Matrix3<f64>, t: &Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(
                &nalgebra::Rotation3::from_matrix_unchecked(*r),
            ),
            translation: *t,
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose: self then other, i.e. `(self ∘ other)(p) = self(other(p))`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_inverse_round_trip() {
        let t = SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            Vector3::new(1.0, 2.0, -0.5),
        );
        let p = Vector3::new(0.3, -4.0, 2.2);

        let round = t.inverse().transform_point(&t.transform_point(&p));
        assert_relative_eq!(round, p, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_matches_sequential_application() {
        let a = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.5, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
        );
        let b = SE3::new(
            UnitQuaternion::from_euler_angles(0.2, 0.0, -0.1),
            Vector3::new(0.0, -1.0, 2.0),
        );
        let p = Vector3::new(0.7, 0.7, 0.7);

        assert_relative_eq!(
            a.compose(&b).transform_point(&p),
            a.transform_point(&b.transform_point(&p)),
            epsilon = 1e-12
        );
    }
}
