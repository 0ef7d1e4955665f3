//! Vision-only structure from motion over the first full window.
//!
//! Given a reference frame l with known relative pose to the newest frame,
//! chains PnP and pairwise triangulation to cover every frame, then refines
//! all camera poses and points with a damped Gauss-Newton pass. Everything
//! operates on normalized image coordinates; scale is arbitrary until the
//! inertial alignment fixes it.

use std::collections::BTreeMap;

use nalgebra::{
    DMatrix, DVector, Matrix2x3, Matrix3, Matrix4, SMatrix, UnitQuaternion, Vector2, Vector3,
};
use tracing::debug;

use crate::feature::FeatureId;
use crate::geometry::skew;

/// One feature entering SfM: all its (frame, normalized observation) pairs.
pub struct SfmFeature {
    pub id: FeatureId,
    pub observations: Vec<(usize, Vector2<f64>)>,
    pub state: bool,
    pub position: Vector3<f64>,
}

impl SfmFeature {
    pub fn new(id: FeatureId, observations: Vec<(usize, Vector2<f64>)>) -> Self {
        Self {
            id,
            observations,
            state: false,
            position: Vector3::zeros(),
        }
    }

    fn observation_at(&self, frame: usize) -> Option<Vector2<f64>> {
        self.observations
            .iter()
            .find(|(f, _)| *f == frame)
            .map(|(_, obs)| *obs)
    }
}

/// Camera pose as world-to-camera rotation and translation.
#[derive(Clone, Copy)]
struct CamPose {
    q: UnitQuaternion<f64>,
    t: Vector3<f64>,
}

impl CamPose {
    fn transform(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.q * p + self.t
    }
}

pub struct SfmResult {
    /// Camera-to-world rotations per frame.
    pub rotations: Vec<UnitQuaternion<f64>>,
    /// World positions per frame.
    pub translations: Vec<Vector3<f64>>,
    /// Triangulated points by feature id.
    pub points: BTreeMap<FeatureId, Vector3<f64>>,
}

pub struct GlobalSfm;

impl GlobalSfm {
    /// Build the window structure with frame l at the origin and the given
    /// relative pose between l and the newest frame.
    pub fn construct(
        frame_num: usize,
        l: usize,
        relative_r: &Matrix3<f64>,
        relative_t: &Vector3<f64>,
        features: &mut [SfmFeature],
    ) -> Option<SfmResult> {
        let last = frame_num - 1;

        // Frame l is the origin; the newest frame carries the relative pose.
        let mut poses = vec![
            CamPose {
                q: UnitQuaternion::identity(),
                t: Vector3::zeros(),
            };
            frame_num
        ];
        let q_last = UnitQuaternion::from_rotation_matrix(
            &nalgebra::Rotation3::from_matrix_unchecked(*relative_r),
        );
        poses[last] = CamPose {
            q: q_last.inverse(),
            t: -(q_last.inverse() * relative_t),
        };

        // Forward sweep: place l+1..last-1 by PnP, triangulating each frame
        // against the newest one.
        for i in l..last {
            if i > l {
                let mut pose = poses[i - 1];
                if !solve_frame_pnp(&mut pose, i, features) {
                    debug!(frame = i, "SfM forward PnP failed");
                    return None;
                }
                poses[i] = pose;
            }
            triangulate_two_frames(i, &poses[i].clone(), last, &poses[last].clone(), features);
        }
        // Fill between l and last against l.
        for i in (l + 1)..last {
            triangulate_two_frames(l, &poses[l].clone(), i, &poses[i].clone(), features);
        }
        // Backward sweep for 0..l.
        for i in (0..l).rev() {
            let mut pose = poses[i + 1];
            if !solve_frame_pnp(&mut pose, i, features) {
                debug!(frame = i, "SfM backward PnP failed");
                return None;
            }
            poses[i] = pose;
            triangulate_two_frames(i, &poses[i].clone(), l, &poses[l].clone(), features);
        }
        // Any feature still untriangulated: use its first and last
        // observations.
        for feature in features.iter_mut() {
            if feature.state || feature.observations.len() < 2 {
                continue;
            }
            let (f0, obs0) = feature.observations[0];
            let (f1, obs1) = *feature.observations.last().unwrap();
            if let Some(p) = triangulate_pair(&poses[f0], &obs0, &poses[f1], &obs1) {
                feature.state = true;
                feature.position = p;
            }
        }

        refine(&mut poses, l, last, features);

        let mut rotations = Vec::with_capacity(frame_num);
        let mut translations = Vec::with_capacity(frame_num);
        for pose in &poses {
            let q = pose.q.inverse();
            rotations.push(q);
            translations.push(-(q * pose.t));
        }
        let points = features
            .iter()
            .filter(|f| f.state)
            .map(|f| (f.id, f.position))
            .collect();

        Some(SfmResult {
            rotations,
            translations,
            points,
        })
    }
}

/// Gauss-Newton PnP over the already-triangulated points seen by `frame`,
/// starting from the supplied pose.
fn solve_frame_pnp(pose: &mut CamPose, frame: usize, features: &[SfmFeature]) -> bool {
    let mut pts: Vec<(Vector3<f64>, Vector2<f64>)> = Vec::new();
    for feature in features {
        if !feature.state {
            continue;
        }
        if let Some(obs) = feature.observation_at(frame) {
            pts.push((feature.position, obs));
        }
    }
    if pts.len() < 6 {
        return false;
    }

    for _ in 0..10 {
        let mut h = SMatrix::<f64, 6, 6>::zeros();
        let mut g = SMatrix::<f64, 6, 1>::zeros();
        for (p_w, obs) in &pts {
            let p_c = pose.transform(p_w);
            if p_c.z <= 1e-6 {
                continue;
            }
            let r = Vector2::new(p_c.x / p_c.z - obs.x, p_c.y / p_c.z - obs.y);
            let reduce = Matrix2x3::new(
                1.0 / p_c.z, 0.0, -p_c.x / (p_c.z * p_c.z),
                0.0, 1.0 / p_c.z, -p_c.y / (p_c.z * p_c.z),
            );
            // Perturbation q ← q·exp(δθ), t ← t + δt.
            let mut j = SMatrix::<f64, 2, 6>::zeros();
            let dtheta = -(pose.q.to_rotation_matrix().into_inner() * skew(p_w));
            j.fixed_view_mut::<2, 3>(0, 0).copy_from(&(reduce * dtheta));
            j.fixed_view_mut::<2, 3>(0, 3).copy_from(&reduce);

            h += j.transpose() * j;
            g += j.transpose() * r;
        }
        let Some(chol) = h.cholesky() else { return false };
        let dx = chol.solve(&(-g));
        pose.q *= UnitQuaternion::from_scaled_axis(Vector3::new(dx[0], dx[1], dx[2]));
        pose.t += Vector3::new(dx[3], dx[4], dx[5]);
        if dx.norm() < 1e-10 {
            break;
        }
    }
    true
}

fn triangulate_two_frames(
    f0: usize,
    pose0: &CamPose,
    f1: usize,
    pose1: &CamPose,
    features: &mut [SfmFeature],
) {
    if f0 == f1 {
        return;
    }
    for feature in features.iter_mut() {
        if feature.state {
            continue;
        }
        let (Some(obs0), Some(obs1)) = (feature.observation_at(f0), feature.observation_at(f1))
        else {
            continue;
        };
        if let Some(p) = triangulate_pair(pose0, &obs0, pose1, &obs1) {
            feature.state = true;
            feature.position = p;
        }
    }
}

fn triangulate_pair(
    pose0: &CamPose,
    obs0: &Vector2<f64>,
    pose1: &CamPose,
    obs1: &Vector2<f64>,
) -> Option<Vector3<f64>> {
    let proj = |pose: &CamPose| {
        let mut p = SMatrix::<f64, 3, 4>::zeros();
        p.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&pose.q.to_rotation_matrix().into_inner());
        p.fixed_view_mut::<3, 1>(0, 3).copy_from(&pose.t);
        p
    };
    let p0 = proj(pose0);
    let p1 = proj(pose1);

    let mut design = Matrix4::<f64>::zeros();
    for j in 0..4 {
        design[(0, j)] = obs0.x * p0[(2, j)] - p0[(0, j)];
        design[(1, j)] = obs0.y * p0[(2, j)] - p0[(1, j)];
        design[(2, j)] = obs1.x * p1[(2, j)] - p1[(0, j)];
        design[(3, j)] = obs1.y * p1[(2, j)] - p1[(1, j)];
    }
    let svd = design.svd(true, true);
    let v = svd.v_t?.transpose();
    let h = v.column(3);
    if h[3].abs() < 1e-10 {
        return None;
    }
    Some(Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}

/// Joint damped Gauss-Newton over all camera poses and points. Frame l's
/// rotation and the translations of l and the newest frame stay fixed to pin
/// the gauge and scale.
fn refine(poses: &mut [CamPose], l: usize, last: usize, features: &mut [SfmFeature]) {
    let frame_num = poses.len();
    let point_ids: Vec<usize> = features
        .iter()
        .enumerate()
        .filter(|(_, f)| f.state)
        .map(|(i, _)| i)
        .collect();
    if point_ids.is_empty() {
        return;
    }

    let pose_dim = frame_num * 6;
    let n = pose_dim + point_ids.len() * 3;
    let point_col: BTreeMap<usize, usize> = point_ids
        .iter()
        .enumerate()
        .map(|(k, &i)| (i, pose_dim + k * 3))
        .collect();

    let lambda = 1e-6;

    for _ in 0..10 {
        let mut h = DMatrix::<f64>::zeros(n, n);
        let mut g = DVector::<f64>::zeros(n);
        let mut cost = 0.0;

        for (fi, feature) in features.iter().enumerate() {
            if !feature.state {
                continue;
            }
            let pc = point_col[&fi];
            for (frame, obs) in &feature.observations {
                let pose = &poses[*frame];
                let p_c = pose.transform(&feature.position);
                if p_c.z <= 1e-6 {
                    continue;
                }
                let r = Vector2::new(p_c.x / p_c.z - obs.x, p_c.y / p_c.z - obs.y);
                cost += r.norm_squared();

                let reduce = Matrix2x3::new(
                    1.0 / p_c.z, 0.0, -p_c.x / (p_c.z * p_c.z),
                    0.0, 1.0 / p_c.z, -p_c.y / (p_c.z * p_c.z),
                );
                let rot = pose.q.to_rotation_matrix().into_inner();
                let j_theta = reduce * (-(rot * skew(&feature.position)));
                let j_t = reduce;
                let j_p = reduce * rot;

                let row = frame * 6;
                accumulate(&mut h, &mut g, row, &j_theta, row, &j_theta, &r, true);
                accumulate(&mut h, &mut g, row, &j_theta, row + 3, &j_t, &r, false);
                accumulate(&mut h, &mut g, row + 3, &j_t, row, &j_theta, &r, false);
                accumulate(&mut h, &mut g, row + 3, &j_t, row + 3, &j_t, &r, true);
                accumulate(&mut h, &mut g, row, &j_theta, pc, &j_p, &r, false);
                accumulate(&mut h, &mut g, pc, &j_p, row, &j_theta, &r, false);
                accumulate(&mut h, &mut g, row + 3, &j_t, pc, &j_p, &r, false);
                accumulate(&mut h, &mut g, pc, &j_p, row + 3, &j_t, &r, false);
                accumulate(&mut h, &mut g, pc, &j_p, pc, &j_p, &r, true);
            }
        }

        // Gauge: freeze rotation of l, translations of l and last.
        let mut frozen: Vec<usize> = (l * 6..l * 6 + 6).collect();
        frozen.extend(last * 6 + 3..last * 6 + 6);
        for d in frozen {
            for k in 0..n {
                h[(d, k)] = 0.0;
                h[(k, d)] = 0.0;
            }
            h[(d, d)] = 1.0;
            g[d] = 0.0;
        }

        for d in 0..n {
            h[(d, d)] += lambda * h[(d, d)].max(1e-10);
        }
        let Some(dx) = h.clone().cholesky().map(|c| c.solve(&(-&g))) else {
            return;
        };

        for (frame, pose) in poses.iter_mut().enumerate() {
            let row = frame * 6;
            pose.q *= UnitQuaternion::from_scaled_axis(Vector3::new(
                dx[row],
                dx[row + 1],
                dx[row + 2],
            ));
            pose.t += Vector3::new(dx[row + 3], dx[row + 4], dx[row + 5]);
        }
        for (&fi, &col) in &point_col {
            features[fi].position += Vector3::new(dx[col], dx[col + 1], dx[col + 2]);
        }
        debug!(cost, step = dx.norm(), "SfM refinement iteration");
        if dx.norm() < 1e-10 {
            break;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn accumulate(
    h: &mut DMatrix<f64>,
    g: &mut DVector<f64>,
    row: usize,
    ja: &Matrix2x3<f64>,
    col: usize,
    jb: &Matrix2x3<f64>,
    r: &Vector2<f64>,
    with_gradient: bool,
) {
    let block = ja.transpose() * jb;
    for i in 0..3 {
        for j in 0..3 {
            h[(row + i, col + j)] += block[(i, j)];
        }
    }
    if with_gradient && row == col {
        let grad = ja.transpose() * r;
        for i in 0..3 {
            g[row + i] += grad[i];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Five frames translating along +x watching a grid of points: the SfM
    /// must recover the trajectory shape (up to its fixed gauge).
    #[test]
    fn test_construct_recovers_translation_direction() {
        let frame_num = 5;
        let l = 0;

        let points: Vec<Vector3<f64>> = (0..30)
            .map(|k| {
                Vector3::new(
                    -1.5 + 0.3 * (k % 10) as f64,
                    -1.0 + 0.7 * (k / 10) as f64,
                    6.0 + 0.2 * (k % 7) as f64,
                )
            })
            .collect();
        let cam_positions: Vec<Vector3<f64>> = (0..frame_num)
            .map(|i| Vector3::new(0.4 * i as f64, 0.0, 0.0))
            .collect();

        let mut features: Vec<SfmFeature> = points
            .iter()
            .enumerate()
            .map(|(id, p)| {
                let obs = cam_positions
                    .iter()
                    .enumerate()
                    .map(|(f, c)| {
                        let local = p - c;
                        (f, Vector2::new(local.x / local.z, local.y / local.z))
                    })
                    .collect();
                SfmFeature::new(id as FeatureId, obs)
            })
            .collect();

        // True relative pose between l and the newest frame (identity
        // rotation, translation scaled arbitrarily).
        let relative_r = Matrix3::identity();
        let relative_t = cam_positions[frame_num - 1] - cam_positions[l];

        let result =
            GlobalSfm::construct(frame_num, l, &relative_r, &relative_t, &mut features)
                .expect("SfM should succeed on clean synthetic data");

        // Middle frames must land between the endpoints, on the +x axis.
        for i in 0..frame_num {
            let t = result.translations[i];
            assert_relative_eq!(t.y, 0.0, epsilon = 1e-3);
            assert_relative_eq!(t.z, 0.0, epsilon = 1e-3);
            assert_relative_eq!(t.x, 0.4 * i as f64, epsilon = 1e-3);
        }
        assert!(result.points.len() >= 25);
    }
}
