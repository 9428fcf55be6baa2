//! Weighted mixture of every candidate primitive on one edge

use rand::Rng;

use super::operations::{CandidateOp, Primitive};
use crate::autograd::Var;
use crate::error::{DartsError, Result};
use crate::nn::{BatchNorm2d, BufferStore, Forward, ParamStore};

/// One branch of a mixed op; pooling branches are followed by a non-affine
/// batch norm
#[derive(Debug, Clone)]
struct Branch {
    op: CandidateOp,
    norm: Option<BatchNorm2d>,
}

/// Dense convex combination of all primitives on an edge
#[derive(Debug, Clone)]
pub struct MixedOp {
    branches: Vec<Branch>,
}

impl MixedOp {
    pub fn new(
        params: &mut ParamStore,
        buffers: &mut BufferStore,
        name: &str,
        primitives: &[Primitive],
        channels: usize,
        stride: usize,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let mut branches = Vec::with_capacity(primitives.len());
        for (k, primitive) in primitives.iter().enumerate() {
            let prefix = format!("{}._ops.{}", name, k);
            let op = primitive.build(params, buffers, &prefix, channels, stride, false, rng)?;
            let norm = primitive
                .is_pool()
                .then(|| BatchNorm2d::new(params, buffers, &format!("{}.bn", prefix), channels, false));
            branches.push(Branch { op, norm });
        }
        Ok(Self { branches })
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// `Σ_k weights[row, k] · op_k(x)`; `weights` is the softmaxed matrix of
    /// the cell type and `row` the edge index
    pub fn forward(&self, f: &mut Forward<'_>, x: Var, weights: Var, row: usize) -> Result<Var> {
        let columns = f.tape.value(weights).shape().get(1).copied().unwrap_or(0);
        if columns != self.branches.len() {
            return Err(DartsError::shape(format!("{} primitive weights", self.branches.len()), format!("{}", columns)));
        }
        let mut terms = Vec::with_capacity(self.branches.len());
        for (k, branch) in self.branches.iter().enumerate() {
            let mut y = branch.op.forward(f, x)?;
            if let Some(norm) = &branch.norm {
                y = norm.forward(f, y)?;
            }
            terms.push(f.tape.scale_by_coeff(y, weights, row, k)?);
        }
        f.tape.sum(&terms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array4};
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_one_hot_weight_selects_single_branch() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(11);
        let mut params = ParamStore::new();
        let mut buffers = BufferStore::new();
        let primitives = [Primitive::None, Primitive::SkipConnect, Primitive::MaxPool3x3];
        let op = MixedOp::new(&mut params, &mut buffers, "edge", &primitives, 2, 1, &mut rng).unwrap();
        assert_eq!(op.len(), 3);
        // only the pool branch carries running statistics
        assert_eq!(buffers.len(), 2);

        let x = Array4::from_shape_fn((1, 2, 3, 3), |(_, c, h, w)| (c * 9 + h * 3 + w) as f64);
        let mut weights = Array2::zeros((1, 3));
        weights[[0, 1]] = 1.0;

        let mut f = Forward::new(&params, &mut buffers, true);
        let input = f.tape.constant(x.clone().into_dyn());
        let w = f.tape.leaf(weights.into_dyn());
        let out = op.forward(&mut f, input, w, 0).unwrap();
        assert_eq!(f.tape.value(out), &x.into_dyn());
    }

    #[test]
    fn test_weight_width_must_match() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(11);
        let mut params = ParamStore::new();
        let mut buffers = BufferStore::new();
        let op = MixedOp::new(&mut params, &mut buffers, "edge", &[Primitive::SkipConnect], 2, 1, &mut rng).unwrap();
        let mut f = Forward::new(&params, &mut buffers, true);
        let input = f.tape.constant(Array4::zeros((1, 2, 2, 2)).into_dyn());
        let w = f.tape.leaf(Array2::zeros((1, 2)).into_dyn());
        assert!(op.forward(&mut f, input, w, 0).is_err());
    }
}
