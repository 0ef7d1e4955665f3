//! Parameter-block identities and parameterizations.
//!
//! Blocks are keyed by what they are, not where they live, so the
//! marginalizer's post-slide remapping is a pure function on ids.

use nalgebra::UnitQuaternion;

use crate::feature::FeatureId;
use crate::geometry::delta_q;

/// Stable identity of one optimizer parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockId {
    /// Window slot pose: translation + unit quaternion.
    Pose(usize),
    /// Window slot velocity + accelerometer bias + gyroscope bias.
    SpeedBias(usize),
    /// Camera-to-body extrinsic pose for one camera.
    Extrinsic(usize),
    /// Camera-IMU time offset.
    Td,
    /// Inverse depth of one feature in its anchor frame.
    Feature(FeatureId),
}

/// Parameterization class of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// 7 global parameters [p, qx, qy, qz, qw], 6-dim tangent.
    Pose,
    /// 9 parameters [v, ba, bg].
    SpeedBias,
    /// 1 parameter.
    Scalar,
}

impl BlockId {
    pub fn kind(&self) -> BlockKind {
        match self {
            BlockId::Pose(_) | BlockId::Extrinsic(_) => BlockKind::Pose,
            BlockId::SpeedBias(_) => BlockKind::SpeedBias,
            BlockId::Td | BlockId::Feature(_) => BlockKind::Scalar,
        }
    }

    pub fn global_size(&self) -> usize {
        self.kind().global_size()
    }

    pub fn local_size(&self) -> usize {
        self.kind().local_size()
    }
}

impl BlockKind {
    pub fn global_size(&self) -> usize {
        match self {
            BlockKind::Pose => 7,
            BlockKind::SpeedBias => 9,
            BlockKind::Scalar => 1,
        }
    }

    pub fn local_size(&self) -> usize {
        match self {
            BlockKind::Pose => 6,
            BlockKind::SpeedBias => 9,
            BlockKind::Scalar => 1,
        }
    }

    /// x ⊟ x0 on the block's manifold, in tangent coordinates. The pose
    /// rotation difference is 2·vec(q0⁻¹·q) with the sign fixed so the
    /// scalar part is non-negative.
    pub fn minus(&self, x: &[f64], x0: &[f64]) -> Vec<f64> {
        match self {
            BlockKind::Pose => {
                let q = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                    x[6], x[3], x[4], x[5],
                ));
                let q0 = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                    x0[6], x0[3], x0[4], x0[5],
                ));
                let mut dq = (q0.inverse() * q).into_inner();
                if dq.w < 0.0 {
                    dq = -dq;
                }
                vec![
                    x[0] - x0[0],
                    x[1] - x0[1],
                    x[2] - x0[2],
                    2.0 * dq.i,
                    2.0 * dq.j,
                    2.0 * dq.k,
                ]
            }
            _ => x.iter().zip(x0).map(|(a, b)| a - b).collect(),
        }
    }

    /// x ⊞ δ on the block's manifold. Poses translate additively and rotate
    /// by a right-multiplied small quaternion.
    pub fn plus(&self, x: &[f64], delta: &[f64], out: &mut [f64]) {
        match self {
            BlockKind::Pose => {
                out[0] = x[0] + delta[0];
                out[1] = x[1] + delta[1];
                out[2] = x[2] + delta[2];
                let q = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                    x[6], x[3], x[4], x[5],
                ));
                let dq = delta_q(&nalgebra::Vector3::new(delta[3], delta[4], delta[5]));
                let q_new = q * dq;
                out[3] = q_new.i;
                out[4] = q_new.j;
                out[5] = q_new.k;
                out[6] = q_new.w;
            }
            _ => {
                for i in 0..x.len() {
                    out[i] = x[i] + delta[i];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(BlockId::Pose(0).global_size(), 7);
        assert_eq!(BlockId::Pose(0).local_size(), 6);
        assert_eq!(BlockId::SpeedBias(3).global_size(), 9);
        assert_eq!(BlockId::Td.global_size(), 1);
        assert_eq!(BlockId::Feature(42).local_size(), 1);
    }

    #[test]
    fn test_pose_plus_keeps_quaternion_normalized() {
        let x = [1.0, 2.0, 3.0, 0.0, 0.0, 0.0, 1.0];
        let delta = [0.1, 0.0, 0.0, 0.02, -0.01, 0.03];
        let mut out = [0.0; 7];
        BlockKind::Pose.plus(&x, &delta, &mut out);

        assert_eq!(out[0], 1.1);
        let norm =
            (out[3] * out[3] + out[4] * out[4] + out[5] * out[5] + out[6] * out[6]).sqrt();
        approx::assert_relative_eq!(norm, 1.0, epsilon = 1e-12);
    }
}
