//! Estimator bootstrapping: relative pose, vision-only SfM, extrinsic
//! rotation calibration, and visual-inertial alignment.

pub mod alignment;
pub mod ex_rotation;
pub mod relative;
pub mod sfm;

pub use alignment::{
    check_imu_excitation, linear_alignment, solve_gyroscope_bias, AlignmentResult,
};
pub use ex_rotation::InitialExRotation;
pub use relative::solve_relative_rt;
pub use sfm::{GlobalSfm, SfmFeature, SfmResult};
