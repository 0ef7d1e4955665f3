//! Dense nonlinear least-squares over BlockId-keyed parameter blocks.
//!
//! The window problem is a few hundred tangent parameters, so the normal
//! equations are assembled densely and solved with a damped (Levenberg-
//! Marquardt) trust-region loop: accept a step when the cost drops, raise
//! the damping otherwise. Wall-clock budget and iteration cap both bound
//! the loop.

use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::time::{Duration, Instant};

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use super::blocks::BlockId;
use super::factors::{Factor, HuberLoss};

pub struct ResidualBlock {
    pub factor: Box<dyn Factor>,
    pub loss: Option<HuberLoss>,
}

struct ParamBlock {
    values: Vec<f64>,
    constant: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    pub max_iterations: usize,
    pub max_time: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct SolveReport {
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub converged: bool,
}

#[derive(Default)]
pub struct Problem {
    blocks: BTreeMap<BlockId, ParamBlock>,
    residuals: Vec<ResidualBlock>,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_parameter_block(&mut self, id: BlockId, values: &[f64]) {
        debug_assert_eq!(values.len(), id.global_size());
        self.blocks.insert(
            id,
            ParamBlock {
                values: values.to_vec(),
                constant: false,
            },
        );
    }

    pub fn set_constant(&mut self, id: BlockId) {
        if let Some(block) = self.blocks.get_mut(&id) {
            block.constant = true;
        }
    }

    pub fn add_residual(&mut self, factor: Box<dyn Factor>, loss: Option<HuberLoss>) {
        debug_assert!(
            factor.blocks().iter().all(|b| self.blocks.contains_key(b)),
            "residual references unregistered parameter block"
        );
        self.residuals.push(ResidualBlock { factor, loss });
    }

    pub fn values(&self, id: BlockId) -> Option<&[f64]> {
        self.blocks.get(&id).map(|b| b.values.as_slice())
    }

    fn gather<'a>(
        blocks: &'a BTreeMap<BlockId, ParamBlock>,
        ids: &[BlockId],
    ) -> Vec<&'a [f64]> {
        ids.iter()
            .map(|id| blocks[id].values.as_slice())
            .collect()
    }

    fn total_cost(&self, blocks: &BTreeMap<BlockId, ParamBlock>) -> f64 {
        let mut cost = 0.0;
        for rb in &self.residuals {
            let params = Self::gather(blocks, rb.factor.blocks());
            let r = rb.factor.evaluate(&params);
            let s = r.norm_squared();
            cost += match &rb.loss {
                Some(loss) => loss.rho(s),
                None => s,
            };
        }
        0.5 * cost
    }

    /// Run the damped Gauss-Newton loop and write the solution back into the
    /// parameter blocks.
    pub fn solve(&mut self, options: &SolveOptions) -> SolveReport {
        let start = Instant::now();

        // Tangent-space offsets for every free block.
        let mut offsets: BTreeMap<BlockId, usize> = BTreeMap::new();
        let mut n = 0;
        for (id, block) in &self.blocks {
            if !block.constant {
                offsets.insert(*id, n);
                n += id.local_size();
            }
        }
        if n == 0 || self.residuals.is_empty() {
            let cost = self.total_cost(&self.blocks);
            return SolveReport {
                iterations: 0,
                initial_cost: cost,
                final_cost: cost,
                converged: true,
            };
        }

        let initial_cost = self.total_cost(&self.blocks);
        let mut current_cost = initial_cost;
        let mut lambda = 1e-4;
        let mut converged = false;
        let mut iterations = 0;

        for _ in 0..options.max_iterations {
            if start.elapsed() > options.max_time {
                debug!("solver time budget exhausted after {} iterations", iterations);
                break;
            }
            iterations += 1;

            let mut h = DMatrix::<f64>::zeros(n, n);
            let mut g = DVector::<f64>::zeros(n);

            for rb in &self.residuals {
                let ids = rb.factor.blocks();
                let params = Self::gather(&self.blocks, ids);
                let mut r = rb.factor.evaluate(&params);
                let mut jacobians = rb.factor.jacobians(&params);

                if let Some(loss) = &rb.loss {
                    let w = loss.weight(r.norm_squared());
                    if w != 1.0 {
                        r *= w;
                        for j in jacobians.iter_mut() {
                            *j *= w;
                        }
                    }
                }

                for (a, id_a) in ids.iter().enumerate() {
                    let Some(&row) = offsets.get(id_a) else { continue };
                    let ja = &jacobians[a];
                    g.rows_mut(row, id_a.local_size())
                        .add_assign(&(ja.transpose() * &r));
                    for (b, id_b) in ids.iter().enumerate() {
                        let Some(&col) = offsets.get(id_b) else { continue };
                        let jb = &jacobians[b];
                        h.view_mut((row, col), (id_a.local_size(), id_b.local_size()))
                            .add_assign(&(ja.transpose() * jb));
                    }
                }
            }

            // Damped normal equations.
            let mut h_lm = h.clone();
            for d in 0..n {
                h_lm[(d, d)] += lambda * h[(d, d)].max(1e-10);
            }

            let dx = match h_lm.clone().cholesky() {
                Some(chol) => chol.solve(&(-&g)),
                None => match h_lm.lu().solve(&(-&g)) {
                    Some(d) => d,
                    None => {
                        lambda *= 10.0;
                        continue;
                    }
                },
            };

            // Trial state.
            let mut trial: BTreeMap<BlockId, ParamBlock> = BTreeMap::new();
            for (id, block) in &self.blocks {
                let values = if let Some(&off) = offsets.get(id) {
                    let delta = dx.as_slice()[off..off + id.local_size()].to_vec();
                    let mut out = block.values.clone();
                    id.kind().plus(&block.values, &delta, &mut out);
                    out
                } else {
                    block.values.clone()
                };
                trial.insert(
                    *id,
                    ParamBlock {
                        values,
                        constant: block.constant,
                    },
                );
            }

            let trial_cost = self.total_cost(&trial);
            if trial_cost < current_cost {
                self.blocks = trial;
                current_cost = trial_cost;
                lambda = (lambda * 0.1).max(1e-12);
                if dx.norm() < 1e-10 {
                    converged = true;
                    break;
                }
            } else {
                lambda *= 10.0;
                if lambda > 1e8 {
                    break;
                }
            }
        }

        debug!(
            iterations,
            initial_cost, final_cost = current_cost, converged, "window solve"
        );

        SolveReport {
            iterations,
            initial_cost,
            final_cost: current_cost,
            converged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::factors::ProjectionObservation;
    use crate::optimizer::factors::ProjectionTwoFrameOneCam;
    use nalgebra::{UnitQuaternion, Vector3};

    fn pose_params(p: Vector3<f64>, q: UnitQuaternion<f64>) -> [f64; 7] {
        [p.x, p.y, p.z, q.i, q.j, q.k, q.w]
    }

    #[test]
    fn test_depth_converges_from_perturbed_start() {
        // Two poses, fixed; only the inverse depth is free. With perfect
        // observations the solver must recover the true depth.
        let depth = 5.0;
        let p_world = Vector3::new(0.4, -0.2, depth);
        let pts_i = Vector3::new(p_world.x / depth, p_world.y / depth, 1.0);
        let p_j = Vector3::new(0.8, 0.0, 0.0);
        let local = p_world - p_j;
        let pts_j = Vector3::new(local.x / local.z, local.y / local.z, 1.0);

        let mut problem = Problem::new();
        problem.add_parameter_block(
            BlockId::Pose(0),
            &pose_params(Vector3::zeros(), UnitQuaternion::identity()),
        );
        problem.add_parameter_block(
            BlockId::Pose(1),
            &pose_params(p_j, UnitQuaternion::identity()),
        );
        problem.add_parameter_block(
            BlockId::Extrinsic(0),
            &pose_params(Vector3::zeros(), UnitQuaternion::identity()),
        );
        problem.add_parameter_block(BlockId::Feature(9), &[1.0 / (depth * 2.0)]);
        problem.add_parameter_block(BlockId::Td, &[0.0]);
        problem.set_constant(BlockId::Pose(0));
        problem.set_constant(BlockId::Pose(1));
        problem.set_constant(BlockId::Extrinsic(0));
        problem.set_constant(BlockId::Td);

        let obs = ProjectionObservation {
            pts_i,
            pts_j,
            velocity_i: Vector3::zeros(),
            velocity_j: Vector3::zeros(),
            td_i: 0.0,
            td_j: 0.0,
        };
        problem.add_residual(
            Box::new(ProjectionTwoFrameOneCam::new(0, 1, 0, 9, obs, 460.0 / 1.5, false)),
            Some(HuberLoss::new(1.0)),
        );

        let report = problem.solve(&SolveOptions {
            max_iterations: 20,
            max_time: Duration::from_secs(1),
        });

        let inv_dep = problem.values(BlockId::Feature(9)).unwrap()[0];
        approx::assert_relative_eq!(1.0 / inv_dep, depth, epsilon = 1e-6);
        assert!(report.final_cost < 1e-12);
    }

    #[test]
    fn test_all_constant_problem_is_a_noop() {
        let mut problem = Problem::new();
        problem.add_parameter_block(BlockId::Td, &[0.25]);
        problem.set_constant(BlockId::Td);
        let report = problem.solve(&SolveOptions {
            max_iterations: 5,
            max_time: Duration::from_millis(10),
        });
        assert_eq!(report.iterations, 0);
        assert_eq!(problem.values(BlockId::Td).unwrap()[0], 0.25);
    }
}
