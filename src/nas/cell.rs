//! Search cell: a small DAG of mixed ops over two input states

use rand::Rng;

use super::edges::{edges, node_rows, num_edges};
use super::mixed_op::MixedOp;
use super::operations::{FactorizedReduce, Primitive, ReLUConvBN};
use crate::autograd::Var;
use crate::error::{DartsError, Result};
use crate::nn::{BufferStore, ConvSpec, Forward, ParamStore};

/// Projection of a cell input to the cell's channel width
#[derive(Debug, Clone)]
enum Preprocess {
    /// 1x1 ReLU-conv-BN
    Project(ReLUConvBN),
    /// Halve the resolution of `s0` when the previous cell was a reduction
    Reduce(FactorizedReduce),
}

impl Preprocess {
    fn forward(&self, f: &mut Forward<'_>, x: Var) -> Result<Var> {
        match self {
            Self::Project(op) => op.forward(f, x),
            Self::Reduce(op) => op.forward(f, x),
        }
    }
}

/// Channel widths a cell is built with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellShape {
    pub steps: usize,
    pub multiplier: usize,
    /// Channels of the output two cells back
    pub c_prev_prev: usize,
    /// Channels of the previous output
    pub c_prev: usize,
    /// Channels of every node inside the cell
    pub channels: usize,
    pub reduction: bool,
    pub reduction_prev: bool,
}

/// A search cell. Holds no architecture weights of its own: the softmaxed
/// matrix of its type is passed to every forward call.
#[derive(Debug, Clone)]
pub struct Cell {
    shape: CellShape,
    preprocess0: Preprocess,
    preprocess1: ReLUConvBN,
    ops: Vec<MixedOp>,
}

impl Cell {
    pub fn new(
        params: &mut ParamStore,
        buffers: &mut BufferStore,
        name: &str,
        shape: CellShape,
        primitives: &[Primitive],
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let c = shape.channels;
        let preprocess0 = if shape.reduction_prev {
            Preprocess::Reduce(FactorizedReduce::new(
                params,
                buffers,
                &format!("{}.preprocess0", name),
                shape.c_prev_prev,
                c,
                false,
                rng,
            )?)
        } else {
            Preprocess::Project(ReLUConvBN::new(
                params,
                buffers,
                &format!("{}.preprocess0", name),
                ConvSpec::new(shape.c_prev_prev, c, 1),
                false,
                rng,
            )?)
        };
        let preprocess1 = ReLUConvBN::new(
            params,
            buffers,
            &format!("{}.preprocess1", name),
            ConvSpec::new(shape.c_prev, c, 1),
            false,
            rng,
        )?;

        let mut ops = Vec::with_capacity(num_edges(shape.steps));
        for edge in edges(shape.steps) {
            // Only edges leaving the cell inputs downsample
            let stride = if shape.reduction && edge.from_input() { 2 } else { 1 };
            let op_name = format!("{}._ops.{}", name, edge.index);
            ops.push(MixedOp::new(params, buffers, &op_name, primitives, c, stride, rng)?);
        }

        Ok(Self {
            shape,
            preprocess0,
            preprocess1,
            ops,
        })
    }

    pub fn shape(&self) -> CellShape {
        self.shape
    }

    pub fn is_reduction(&self) -> bool {
        self.shape.reduction
    }

    /// Channels of the cell output
    pub fn out_channels(&self) -> usize {
        self.shape.multiplier * self.shape.channels
    }

    /// Run the cell on `s0` (two cells back) and `s1` (previous cell) with the
    /// softmaxed weight matrix of this cell's type
    pub fn forward(&self, f: &mut Forward<'_>, s0: Var, s1: Var, weights: Var) -> Result<Var> {
        let rows = f.tape.value(weights).shape().first().copied().unwrap_or(0);
        if rows != self.ops.len() {
            return Err(DartsError::shape(format!("{} edge rows", self.ops.len()), format!("{}", rows)));
        }

        let s0 = self.preprocess0.forward(f, s0)?;
        let s1 = self.preprocess1.forward(f, s1)?;

        let mut states = vec![s0, s1];
        for node in 0..self.shape.steps {
            let mut incoming = Vec::with_capacity(node + 2);
            for (source, row) in node_rows(node).enumerate() {
                incoming.push(self.ops[row].forward(f, states[source], weights, row)?);
            }
            states.push(f.tape.sum(&incoming)?);
        }

        let keep = self.shape.multiplier.min(states.len());
        f.tape.concat_channels(&states[states.len() - keep..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array4};
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn build(reduction: bool, reduction_prev: bool) -> (Cell, ParamStore, BufferStore) {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        let mut params = ParamStore::new();
        let mut buffers = BufferStore::new();
        let shape = CellShape {
            steps: 2,
            multiplier: 2,
            c_prev_prev: 6,
            c_prev: 6,
            channels: 2,
            reduction,
            reduction_prev,
        };
        let primitives = [Primitive::SkipConnect, Primitive::AvgPool3x3];
        let cell = Cell::new(&mut params, &mut buffers, "cells.0", shape, &primitives, &mut rng).unwrap();
        (cell, params, buffers)
    }

    fn run(cell: &Cell, params: &ParamStore, buffers: &mut BufferStore, s0_hw: usize) -> Vec<usize> {
        let mut f = Forward::new(params, buffers, true);
        let s0 = f.tape.constant(Array4::from_elem((2, 6, s0_hw, s0_hw), 0.5).into_dyn());
        let s1 = f
            .tape
            .constant(Array4::from_shape_fn((2, 6, 4, 4), |(n, c, h, w)| (n + c + h * w) as f64).into_dyn());
        let w = f.tape.leaf(Array2::from_elem((5, 2), 0.5).into_dyn());
        let out = cell.forward(&mut f, s0, s1, w).unwrap();
        f.tape.value(out).shape().to_vec()
    }

    #[test]
    fn test_normal_cell_keeps_resolution() {
        let (cell, params, mut buffers) = build(false, false);
        assert_eq!(cell.out_channels(), 4);
        assert_eq!(run(&cell, &params, &mut buffers, 4), vec![2, 4, 4, 4]);
    }

    #[test]
    fn test_reduction_cell_halves_resolution() {
        let (cell, params, mut buffers) = build(true, false);
        assert!(cell.is_reduction());
        assert_eq!(run(&cell, &params, &mut buffers, 4), vec![2, 4, 2, 2]);
    }

    #[test]
    fn test_reduced_previous_input_is_aligned() {
        let (cell, params, mut buffers) = build(false, true);
        assert_eq!(run(&cell, &params, &mut buffers, 8), vec![2, 4, 4, 4]);
    }

    #[test]
    fn test_parameter_names_follow_edge_order() {
        let (_, params, _) = build(false, false);
        let names: Vec<&str> = params.named_parameters().map(|(n, _)| n).collect();
        assert_eq!(names[0], "cells.0.preprocess0.conv.weight");
        assert_eq!(names[1], "cells.0.preprocess1.conv.weight");
        assert_eq!(names.len(), 2);
    }
}
