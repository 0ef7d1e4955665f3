//! Two-view relative pose from tracked correspondences.

use nalgebra::{Matrix3, Vector3};
use opencv::calib3d;
use opencv::core::{Mat, Point2f, Vector};
use opencv::prelude::*;
use tracing::debug;

/// Minimum RANSAC inliers for a trusted relative pose.
const MIN_INLIERS: i32 = 12;

/// Solve the essential matrix over normalized correspondences and recover
/// (R, T) such that `p_i = R · p_j + T` maps the newer camera frame into the
/// reference frame.
pub fn solve_relative_rt(
    corres: &[(Vector3<f64>, Vector3<f64>)],
) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    if corres.len() < 15 {
        return None;
    }

    let mut ll: Vector<Point2f> = Vector::new();
    let mut rr: Vector<Point2f> = Vector::new();
    for (a, b) in corres {
        ll.push(Point2f::new((a.x / a.z) as f32, (a.y / a.z) as f32));
        rr.push(Point2f::new((b.x / b.z) as f32, (b.y / b.z) as f32));
    }

    let mut mask = Mat::default();
    let e = calib3d::find_fundamental_mat(
        &ll,
        &rr,
        calib3d::FM_RANSAC,
        0.3 / 460.0,
        0.99,
        1000,
        &mut mask,
    )
    .ok()?;
    if e.rows() != 3 {
        return None;
    }

    let mut rot = Mat::default();
    let mut trans = Mat::default();
    let inliers = calib3d::recover_pose_estimated(
        &e,
        &ll,
        &rr,
        &mut rot,
        &mut trans,
        1.0,
        opencv::core::Point2d::new(0.0, 0.0),
        &mut mask,
    )
    .ok()?;
    debug!(inliers, "relative pose RANSAC");
    if inliers < MIN_INLIERS {
        return None;
    }

    let mut r = Matrix3::zeros();
    for i in 0..3 {
        for j in 0..3 {
            r[(i, j)] = *rot.at_2d::<f64>(i as i32, j as i32).ok()?;
        }
    }
    let t = Vector3::new(
        *trans.at_2d::<f64>(0, 0).ok()?,
        *trans.at_2d::<f64>(1, 0).ok()?,
        *trans.at_2d::<f64>(2, 0).ok()?,
    );

    // recover_pose gives the transform of frame i expressed in frame j;
    // return the inverse so the reference frame is on the left.
    let r_out = r.transpose();
    let t_out = -(r.transpose() * t);
    Some((r_out, t_out))
}
