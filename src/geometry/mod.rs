//! Geometry utilities: SO(3) helpers, SE3 transforms.

pub mod se3;
pub mod so3;

pub use se3::SE3;
pub use so3::{delta_q, gravity_to_rotation, rotation_to_ypr, skew, ypr_to_rotation};
