//! Schur-complement marginalization of dropped window states into a linear
//! prior on the remaining blocks.
//!
//! The estimator collects the residuals touching the states it is about to
//! drop, linearizes them at the current estimate, eliminates the drop set
//! from the normal equations, and recovers a square-root prior (J′, b′)
//! whose residual `b′ + J′·(x ⊟ x₀)` re-enters the next window problem as an
//! ordinary factor. Blocks are tracked by `BlockId`, so the post-slide
//! renaming is a pure id mapping.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use tracing::debug;

use crate::optimizer::factors::{Factor, HuberLoss};
use crate::optimizer::BlockId;

/// Eigenvalues below this are treated as zero in the pseudo-inverse and the
/// square-root recovery.
const EIG_EPS: f64 = 1e-8;

/// One residual scheduled for marginalization: which of its blocks fall in
/// the drop set is recorded by index into `factor.blocks()`.
struct MarginalResidual {
    factor: Box<dyn Factor>,
    loss: Option<HuberLoss>,
    drop_set: Vec<usize>,
}

/// Linear Gaussian prior produced by marginalization.
#[derive(Clone)]
pub struct MarginalPrior {
    /// Remaining blocks, in the prior's column order, already renamed to
    /// their post-slide identities.
    pub keep_blocks: Vec<BlockId>,
    /// Linearization point per keep block (pre-slide values).
    pub linearization: Vec<Vec<f64>>,
    pub linearized_jacobian: DMatrix<f64>,
    pub linearized_residual: DVector<f64>,
}

impl MarginalPrior {
    /// Whether the prior constrains the given block.
    pub fn touches(&self, id: BlockId) -> bool {
        self.keep_blocks.contains(&id)
    }

    pub fn local_dim(&self) -> usize {
        self.keep_blocks.iter().map(|b| b.local_size()).sum()
    }
}

/// Collects residual blocks and performs the elimination.
pub struct Marginalizer {
    residuals: Vec<MarginalResidual>,
    values: BTreeMap<BlockId, Vec<f64>>,
}

impl Marginalizer {
    pub fn new() -> Self {
        Self {
            residuals: Vec::new(),
            values: BTreeMap::new(),
        }
    }

    /// Register the current value of a parameter block. Every block
    /// referenced by an added residual must be registered.
    pub fn set_block_value(&mut self, id: BlockId, values: &[f64]) {
        self.values.insert(id, values.to_vec());
    }

    /// Add a residual with the factor-local indices of its dropped blocks.
    pub fn add_residual(
        &mut self,
        factor: Box<dyn Factor>,
        loss: Option<HuberLoss>,
        drop_set: Vec<usize>,
    ) {
        self.residuals.push(MarginalResidual {
            factor,
            loss,
            drop_set,
        });
    }

    /// Eliminate the drop set and build the prior. `remap` renames each
    /// surviving block to its post-slide identity.
    pub fn marginalize(&self, remap: impl Fn(BlockId) -> BlockId) -> Option<MarginalPrior> {
        // Partition referenced blocks into drop (first) and keep offsets.
        let mut drop_ids: Vec<BlockId> = Vec::new();
        let mut keep_ids: Vec<BlockId> = Vec::new();
        for rb in &self.residuals {
            for (k, id) in rb.factor.blocks().iter().enumerate() {
                if rb.drop_set.contains(&k) {
                    if !drop_ids.contains(id) {
                        drop_ids.push(*id);
                    }
                } else if !keep_ids.contains(id) {
                    keep_ids.push(*id);
                }
            }
        }
        keep_ids.retain(|id| !drop_ids.contains(id));

        let m: usize = drop_ids.iter().map(|b| b.local_size()).sum();
        let n: usize = keep_ids.iter().map(|b| b.local_size()).sum();
        if m == 0 || n == 0 {
            debug!(m, n, "nothing to marginalize");
            return None;
        }

        let mut offsets: BTreeMap<BlockId, usize> = BTreeMap::new();
        let mut cursor = 0;
        for id in drop_ids.iter().chain(keep_ids.iter()) {
            offsets.insert(*id, cursor);
            cursor += id.local_size();
        }

        // Normal equations at the linearization point.
        let total = m + n;
        let mut h = DMatrix::<f64>::zeros(total, total);
        let mut b = DVector::<f64>::zeros(total);

        for rb in &self.residuals {
            let ids = rb.factor.blocks();
            let params: Vec<&[f64]> = ids
                .iter()
                .map(|id| {
                    self.values
                        .get(id)
                        .expect("marginalizer block value not registered")
                        .as_slice()
                })
                .collect();
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
                let row = offsets[id_a];
                let ja = &jacobians[a];
                let mut gb = b.rows_mut(row, id_a.local_size());
                gb += ja.transpose() * &r;
                for (c, id_c) in ids.iter().enumerate() {
                    let col = offsets[id_c];
                    let jc = &jacobians[c];
                    let mut hb = h.view_mut((row, col), (id_a.local_size(), id_c.local_size()));
                    hb += ja.transpose() * jc;
                }
            }
        }

        // Schur complement onto the keep set, with a pseudo-inverse of the
        // (symmetrized) drop-drop block.
        let amm = 0.5
            * (h.view((0, 0), (m, m)).into_owned()
                + h.view((0, 0), (m, m)).transpose());
        let eig = SymmetricEigen::new(amm);
        let mut inv_vals = eig.eigenvalues.clone();
        for v in inv_vals.iter_mut() {
            *v = if v.abs() > EIG_EPS { 1.0 / *v } else { 0.0 };
        }
        let amm_inv =
            &eig.eigenvectors * DMatrix::from_diagonal(&inv_vals) * eig.eigenvectors.transpose();

        let bmm = b.rows(0, m).into_owned();
        let amr = h.view((0, m), (m, n)).into_owned();
        let arm = h.view((m, 0), (n, m)).into_owned();
        let arr = h.view((m, m), (n, n)).into_owned();
        let brr = b.rows(m, n).into_owned();

        let a_prior = arr - &arm * &amm_inv * &amr;
        let b_prior = brr - &arm * &amm_inv * &bmm;

        // Recover (J′, b′) with J′ᵀJ′ = A and J′ᵀb′ = g via the eigen square
        // root.
        let eig = SymmetricEigen::new(0.5 * (&a_prior + a_prior.transpose()));
        let mut sqrt_vals = eig.eigenvalues.clone();
        let mut inv_sqrt_vals = eig.eigenvalues.clone();
        for (s, si) in sqrt_vals.iter_mut().zip(inv_sqrt_vals.iter_mut()) {
            if *s > EIG_EPS {
                *si = 1.0 / s.sqrt();
                *s = s.sqrt();
            } else {
                *s = 0.0;
                *si = 0.0;
            }
        }
        let linearized_jacobian =
            DMatrix::from_diagonal(&sqrt_vals) * eig.eigenvectors.transpose();
        let linearized_residual =
            DMatrix::from_diagonal(&inv_sqrt_vals) * eig.eigenvectors.transpose() * b_prior;

        let linearization = keep_ids
            .iter()
            .map(|id| self.values[id].clone())
            .collect();
        let keep_blocks = keep_ids.iter().map(|id| remap(*id)).collect();

        debug!(dropped = m, kept = n, "marginalized");

        Some(MarginalPrior {
            keep_blocks,
            linearization,
            linearized_jacobian,
            linearized_residual,
        })
    }
}

impl Default for Marginalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// The prior as an optimizer factor: residual b′ + J′·(x ⊟ x₀).
pub struct PriorFactor {
    prior: MarginalPrior,
}

impl PriorFactor {
    pub fn new(prior: MarginalPrior) -> Self {
        Self { prior }
    }
}

impl Factor for PriorFactor {
    fn blocks(&self) -> &[BlockId] {
        &self.prior.keep_blocks
    }

    fn num_residuals(&self) -> usize {
        self.prior.linearized_residual.len()
    }

    fn evaluate(&self, params: &[&[f64]]) -> DVector<f64> {
        let n = self.prior.local_dim();
        let mut dx = DVector::<f64>::zeros(n);
        let mut cursor = 0;
        for (k, id) in self.prior.keep_blocks.iter().enumerate() {
            let local = id.local_size();
            let diff = id.kind().minus(params[k], &self.prior.linearization[k]);
            dx.rows_mut(cursor, local)
                .copy_from(&DVector::from_column_slice(&diff));
            cursor += local;
        }
        &self.prior.linearized_residual + &self.prior.linearized_jacobian * dx
    }

    fn jacobians(&self, _params: &[&[f64]]) -> Vec<DMatrix<f64>> {
        let mut out = Vec::with_capacity(self.prior.keep_blocks.len());
        let mut cursor = 0;
        for id in &self.prior.keep_blocks {
            let local = id.local_size();
            out.push(
                self.prior
                    .linearized_jacobian
                    .columns(cursor, local)
                    .into_owned(),
            );
            cursor += local;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::blocks::BlockId;
    use nalgebra::{DMatrix, DVector};

    /// A linear factor r = A·x + c over scalar/feature blocks, for exercising
    /// the elimination against a hand-computed Schur complement.
    struct LinearFactor {
        blocks: Vec<BlockId>,
        a: DMatrix<f64>,
        c: DVector<f64>,
    }

    impl Factor for LinearFactor {
        fn blocks(&self) -> &[BlockId] {
            &self.blocks
        }

        fn num_residuals(&self) -> usize {
            self.c.len()
        }

        fn evaluate(&self, params: &[&[f64]]) -> DVector<f64> {
            let x: Vec<f64> = params.iter().flat_map(|p| p.iter().copied()).collect();
            &self.a * DVector::from_column_slice(&x) + &self.c
        }

        fn jacobians(&self, _params: &[&[f64]]) -> Vec<DMatrix<f64>> {
            let mut out = Vec::new();
            let mut cursor = 0;
            for id in &self.blocks {
                out.push(self.a.columns(cursor, id.local_size()).into_owned());
                cursor += id.local_size();
            }
            out
        }
    }

    #[test]
    fn test_two_variable_gaussian_schur_equivalence() {
        // r = A [x; y] + c with x = Feature(0) dropped, y = Feature(1) kept.
        let a = DMatrix::from_row_slice(3, 2, &[2.0, 1.0, 0.5, -1.0, 1.0, 3.0]);
        let c = DVector::from_column_slice(&[0.3, -0.2, 0.7]);

        let mut marg = Marginalizer::new();
        marg.set_block_value(BlockId::Feature(0), &[0.1]);
        marg.set_block_value(BlockId::Feature(1), &[-0.4]);
        marg.add_residual(
            Box::new(LinearFactor {
                blocks: vec![BlockId::Feature(0), BlockId::Feature(1)],
                a: a.clone(),
                c: c.clone(),
            }),
            None,
            vec![0],
        );

        let prior = marg.marginalize(|id| id).unwrap();
        assert_eq!(prior.keep_blocks, vec![BlockId::Feature(1)]);

        // Reference Schur complement of H = AᵀA at the linearization point.
        let x0 = DVector::from_column_slice(&[0.1, -0.4]);
        let h = a.transpose() * &a;
        let g = a.transpose() * (&a * &x0 + &c);
        let h_kept = h[(1, 1)] - h[(1, 0)] / h[(0, 0)] * h[(0, 1)];
        let g_kept = g[1] - h[(1, 0)] / h[(0, 0)] * g[0];

        let jp = &prior.linearized_jacobian;
        let bp = &prior.linearized_residual;
        let h_prior = (jp.transpose() * jp)[(0, 0)];
        let g_prior = (jp.transpose() * bp)[0];

        approx::assert_relative_eq!(h_prior, h_kept, epsilon = 1e-8);
        approx::assert_relative_eq!(g_prior, g_kept, epsilon = 1e-8);
    }

    #[test]
    fn test_prior_factor_residual_is_linear_in_offset() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.3, 2.0]);
        let c = DVector::from_column_slice(&[1.0, -1.0]);

        let mut marg = Marginalizer::new();
        marg.set_block_value(BlockId::Feature(0), &[0.0]);
        marg.set_block_value(BlockId::Feature(1), &[0.0]);
        marg.add_residual(
            Box::new(LinearFactor {
                blocks: vec![BlockId::Feature(0), BlockId::Feature(1)],
                a,
                c,
            }),
            None,
            vec![0],
        );
        let prior = marg.marginalize(|id| id).unwrap();
        let factor = PriorFactor::new(prior);

        let r0 = factor.evaluate(&[&[0.0]]);
        let r1 = factor.evaluate(&[&[0.5]]);
        let r2 = factor.evaluate(&[&[1.0]]);

        // Linear: r(1.0) - r(0.5) == r(0.5) - r(0.0).
        approx::assert_relative_eq!((&r2 - &r1), (&r1 - &r0), epsilon = 1e-12);
    }

    #[test]
    fn test_remap_renames_surviving_blocks() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.2, 0.0, 1.0]);
        let c = DVector::zeros(2);

        let mut marg = Marginalizer::new();
        marg.set_block_value(BlockId::Feature(0), &[0.0]);
        marg.set_block_value(BlockId::Feature(7), &[0.0]);
        marg.add_residual(
            Box::new(LinearFactor {
                blocks: vec![BlockId::Feature(0), BlockId::Feature(7)],
                a,
                c,
            }),
            None,
            vec![0],
        );

        let prior = marg
            .marginalize(|id| match id {
                BlockId::Feature(7) => BlockId::Feature(6),
                other => other,
            })
            .unwrap();
        assert_eq!(prior.keep_blocks, vec![BlockId::Feature(6)]);
    }

    #[test]
    fn test_empty_drop_set_yields_no_prior() {
        let marg = Marginalizer::new();
        assert!(marg.marginalize(|id| id).is_none());
    }

    /// Three-pose IMU chain: solving the full problem with a hard anchor on
    /// the first state must agree with anchoring, marginalizing the first
    /// state, and solving the remainder against the resulting prior.
    #[test]
    fn test_three_pose_chain_marginalization_equivalence() {
        use crate::imu::{ImuNoise, Preintegration};
        use crate::optimizer::{ImuFactor, Problem, SolveOptions};
        use nalgebra::{UnitQuaternion, Vector3};
        use std::time::Duration;

        let gravity = Vector3::new(0.0, 0.0, -9.81);
        let acc = Vector3::new(0.0, 0.0, 9.81);
        let vel = Vector3::new(1.0, 0.0, 0.0);
        let interval = 0.1;

        let make_pre = || {
            let mut pre = Preintegration::new(
                acc,
                Vector3::zeros(),
                Vector3::zeros(),
                Vector3::zeros(),
                &ImuNoise::default(),
            );
            for _ in 0..20 {
                pre.push(interval / 20.0, acc, Vector3::zeros());
            }
            pre
        };

        let pose_true = |i: usize| {
            let p = vel * interval * i as f64;
            [p.x, p.y, p.z, 0.0, 0.0, 0.0, 1.0]
        };
        let sb_true = [vel.x, vel.y, vel.z, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];

        // Hard anchor on state 0, expressed as a handmade square-root prior.
        let anchor = |pose_id: usize, sb_id: usize| {
            PriorFactor::new(MarginalPrior {
                keep_blocks: vec![BlockId::Pose(pose_id), BlockId::SpeedBias(sb_id)],
                linearization: vec![pose_true(0).to_vec(), sb_true.to_vec()],
                linearized_jacobian: DMatrix::identity(15, 15) * 1e3,
                linearized_residual: DVector::zeros(15),
            })
        };

        let options = SolveOptions {
            max_iterations: 30,
            max_time: Duration::from_secs(5),
        };
        let perturbed_pose = |i: usize| {
            let mut x = pose_true(i);
            x[0] += 0.01;
            x[2] -= 0.02;
            x
        };

        // Path A: full solve over all three states.
        let mut full = Problem::new();
        full.add_parameter_block(BlockId::Pose(0), &pose_true(0));
        full.add_parameter_block(BlockId::SpeedBias(0), &sb_true);
        for i in 1..=2usize {
            full.add_parameter_block(BlockId::Pose(i), &perturbed_pose(i));
            full.add_parameter_block(BlockId::SpeedBias(i), &sb_true);
        }
        full.add_residual(Box::new(anchor(0, 0)), None);
        full.add_residual(Box::new(ImuFactor::new(0, 1, make_pre(), gravity)), None);
        full.add_residual(Box::new(ImuFactor::new(1, 2, make_pre(), gravity)), None);
        full.solve(&options);

        // Path B: marginalize state 0 at the same linearization, then solve
        // states 1..2 against the recovered prior.
        let mut marg = Marginalizer::new();
        marg.set_block_value(BlockId::Pose(0), &pose_true(0));
        marg.set_block_value(BlockId::SpeedBias(0), &sb_true);
        marg.set_block_value(BlockId::Pose(1), &pose_true(1));
        marg.set_block_value(BlockId::SpeedBias(1), &sb_true);
        marg.add_residual(Box::new(anchor(0, 0)), None, vec![0, 1]);
        marg.add_residual(
            Box::new(ImuFactor::new(0, 1, make_pre(), gravity)),
            None,
            vec![0, 1],
        );
        let prior = marg.marginalize(|id| id).unwrap();

        let mut reduced = Problem::new();
        for i in 1..=2usize {
            reduced.add_parameter_block(BlockId::Pose(i), &perturbed_pose(i));
            reduced.add_parameter_block(BlockId::SpeedBias(i), &sb_true);
        }
        reduced.add_residual(Box::new(PriorFactor::new(prior)), None);
        reduced.add_residual(Box::new(ImuFactor::new(1, 2, make_pre(), gravity)), None);
        reduced.solve(&options);

        for i in 1..=2usize {
            let a = full.values(BlockId::Pose(i)).unwrap();
            let b = reduced.values(BlockId::Pose(i)).unwrap();
            for k in 0..3 {
                approx::assert_relative_eq!(a[k], b[k], epsilon = 1e-6);
            }
            let qa = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                a[6], a[3], a[4], a[5],
            ));
            let qb = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                b[6], b[3], b[4], b[5],
            ));
            assert!(qa.angle_to(&qb) < 1e-6);
        }
    }
}
