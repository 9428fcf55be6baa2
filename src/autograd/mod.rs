//! Reverse-mode automatic differentiation
//!
//! A Wengert tape: every op appends a node holding its forward value and the
//! data its vector-Jacobian product needs. [`Tape::backward`] replays the
//! nodes in reverse and returns the accumulated [`Gradients`].
//!
//! Parameters enter the tape as leaves, which snapshot their value. Mutating
//! the source array afterwards does not affect a recorded graph.

pub mod kernels;

use ndarray::{s, Array1, Array2, Array4, ArrayD, Axis, Ix2, Ix4, IxDyn};

use crate::error::{DartsError, Result};
pub use kernels::{ConvGeometry, NormStats, PoolGeometry};

/// Handle to a node on a [`Tape`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var(usize);

impl Var {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Per-channel statistics of a batch norm evaluated on batch statistics
#[derive(Debug, Clone)]
pub struct BatchMoments {
    pub mean: Array1<f64>,
    /// Biased variance
    pub var: Array1<f64>,
    /// Number of elements reduced per channel
    pub count: usize,
}

#[derive(Debug, Clone)]
enum Op {
    Leaf,
    Constant,
    Add(Var, Var),
    Scale(Var, f64),
    ScaleByCoeff { input: Var, coeffs: Var, row: usize, col: usize },
    Relu(Var),
    Conv2d { input: Var, weight: Var, geometry: ConvGeometry },
    BatchNorm {
        input: Var,
        affine: Option<(Var, Var)>,
        normalized: Array4<f64>,
        inv_std: Array1<f64>,
        batch_stats: bool,
    },
    MaxPool { input: Var, argmax: Vec<usize> },
    AvgPool { input: Var, geometry: PoolGeometry },
    Crop(Var),
    Concat { inputs: Vec<Var>, widths: Vec<usize> },
    GlobalAvgPool(Var),
    Linear { input: Var, weight: Var, bias: Option<Var> },
    Softmax(Var),
    Sigmoid(Var),
    WeightedRowSum { input: Var, divisors: Array1<f64> },
    CrossEntropy { logits: Var, targets: Vec<usize>, probs: Array2<f64> },
}

#[derive(Debug, Clone)]
struct Node {
    value: ArrayD<f64>,
    op: Op,
    requires_grad: bool,
}

/// Recorded computation graph
#[derive(Debug, Clone, Default)]
pub struct Tape {
    nodes: Vec<Node>,
}

/// Gradients produced by [`Tape::backward`]
#[derive(Debug, Clone)]
pub struct Gradients {
    grads: Vec<Option<ArrayD<f64>>>,
}

impl Gradients {
    /// Gradient reaching `var`, or `None` if no path connects it to the root
    pub fn get(&self, var: Var) -> Option<&ArrayD<f64>> {
        self.grads.get(var.0).and_then(|g| g.as_ref())
    }

    /// Gradients for `vars`, zero-filled for vars the root does not depend on
    pub fn wrt(&self, tape: &Tape, vars: &[Var]) -> Vec<ArrayD<f64>> {
        vars.iter()
            .map(|&v| match self.get(v) {
                Some(g) => g.clone(),
                None => ArrayD::zeros(tape.value(v).raw_dim()),
            })
            .collect()
    }
}

fn scalar_array(value: f64) -> ArrayD<f64> {
    ArrayD::from_elem(IxDyn(&[]), value)
}

fn as4(value: &ArrayD<f64>) -> Result<ndarray::ArrayView4<'_, f64>> {
    Ok(value.view().into_dimensionality::<Ix4>()?)
}

fn as2(value: &ArrayD<f64>) -> Result<ndarray::ArrayView2<'_, f64>> {
    Ok(value.view().into_dimensionality::<Ix2>()?)
}

fn accumulate(grads: &mut [Option<ArrayD<f64>>], var: Var, grad: ArrayD<f64>) {
    match &mut grads[var.0] {
        Some(existing) => *existing += &grad,
        slot => *slot = Some(grad),
    }
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn value(&self, var: Var) -> &ArrayD<f64> {
        &self.nodes[var.0].value
    }

    /// Value of a single-element node
    pub fn scalar(&self, var: Var) -> Result<f64> {
        let value = self.value(var);
        if value.len() != 1 {
            return Err(DartsError::shape("scalar", format!("{:?}", value.shape())));
        }
        Ok(value.iter().copied().next().unwrap_or(0.0))
    }

    fn push(&mut self, value: ArrayD<f64>, op: Op, requires_grad: bool) -> Var {
        self.nodes.push(Node { value, op, requires_grad });
        Var(self.nodes.len() - 1)
    }

    fn requires_grad(&self, var: Var) -> bool {
        self.nodes[var.0].requires_grad
    }

    /// Differentiable input
    pub fn leaf(&mut self, value: ArrayD<f64>) -> Var {
        self.push(value, Op::Leaf, true)
    }

    /// Input that never receives a gradient
    pub fn constant(&mut self, value: ArrayD<f64>) -> Var {
        self.push(value, Op::Constant, false)
    }

    pub fn add(&mut self, a: Var, b: Var) -> Result<Var> {
        let (va, vb) = (self.value(a), self.value(b));
        if va.shape() != vb.shape() {
            return Err(DartsError::shape(format!("{:?}", va.shape()), format!("{:?}", vb.shape())));
        }
        let value = va + vb;
        let rg = self.requires_grad(a) || self.requires_grad(b);
        Ok(self.push(value, Op::Add(a, b), rg))
    }

    /// Left fold of [`Tape::add`] over `vars`
    pub fn sum(&mut self, vars: &[Var]) -> Result<Var> {
        let (&first, rest) = vars
            .split_first()
            .ok_or_else(|| DartsError::InvalidInput("sum over an empty list".to_string()))?;
        rest.iter().try_fold(first, |acc, &v| self.add(acc, v))
    }

    pub fn scale(&mut self, x: Var, factor: f64) -> Var {
        let value = self.value(x) * factor;
        let rg = self.requires_grad(x);
        self.push(value, Op::Scale(x, factor), rg)
    }

    /// `coeffs[row, col] * x`, differentiable in both `x` and `coeffs`
    pub fn scale_by_coeff(&mut self, x: Var, coeffs: Var, row: usize, col: usize) -> Result<Var> {
        let weight = {
            let c = as2(self.value(coeffs))?;
            *c.get((row, col))
                .ok_or_else(|| DartsError::shape(format!("coefficient ({}, {})", row, col), format!("{:?}", c.shape())))?
        };
        let value = self.value(x) * weight;
        let rg = self.requires_grad(x) || self.requires_grad(coeffs);
        Ok(self.push(value, Op::ScaleByCoeff { input: x, coeffs, row, col }, rg))
    }

    pub fn relu(&mut self, x: Var) -> Var {
        let value = self.value(x).mapv(|v| v.max(0.0));
        let rg = self.requires_grad(x);
        self.push(value, Op::Relu(x), rg)
    }

    pub fn conv2d(&mut self, x: Var, weight: Var, geometry: ConvGeometry) -> Result<Var> {
        let out = kernels::conv2d_forward(as4(self.value(x))?, as4(self.value(weight))?, &geometry)?;
        let rg = self.requires_grad(x) || self.requires_grad(weight);
        Ok(self.push(out.into_dyn(), Op::Conv2d { input: x, weight, geometry }, rg))
    }

    /// Batch norm over NCHW input. Returns the batch moments when batch
    /// statistics were used so the caller can update running estimates.
    pub fn batch_norm(
        &mut self,
        x: Var,
        affine: Option<(Var, Var)>,
        stats: NormStats<'_>,
        eps: f64,
    ) -> Result<(Var, Option<BatchMoments>)> {
        let input = as4(self.value(x))?;
        let count = input.len() / input.dim().1.max(1);
        let out = match affine {
            Some((g, b)) => {
                let gamma = self.value(g).view().into_dimensionality::<ndarray::Ix1>()?;
                let beta = self.value(b).view().into_dimensionality::<ndarray::Ix1>()?;
                kernels::batch_norm_forward(input, Some((gamma, beta)), stats, eps)?
            }
            None => kernels::batch_norm_forward(input, None, stats, eps)?,
        };
        let batch_stats = matches!(stats, NormStats::Batch);
        let moments = batch_stats.then(|| BatchMoments {
            mean: out.mean.clone(),
            var: out.var.clone(),
            count,
        });
        let rg = self.requires_grad(x) || affine.map_or(false, |(g, b)| self.requires_grad(g) || self.requires_grad(b));
        let var = self.push(
            out.output.into_dyn(),
            Op::BatchNorm {
                input: x,
                affine,
                normalized: out.normalized,
                inv_std: out.inv_std,
                batch_stats,
            },
            rg,
        );
        Ok((var, moments))
    }

    pub fn max_pool2d(&mut self, x: Var, geometry: PoolGeometry) -> Result<Var> {
        let (out, argmax) = kernels::max_pool_forward(as4(self.value(x))?, &geometry)?;
        let rg = self.requires_grad(x);
        Ok(self.push(out.into_dyn(), Op::MaxPool { input: x, argmax }, rg))
    }

    pub fn avg_pool2d(&mut self, x: Var, geometry: PoolGeometry) -> Result<Var> {
        let out = kernels::avg_pool_forward(as4(self.value(x))?, &geometry)?;
        let rg = self.requires_grad(x);
        Ok(self.push(out.into_dyn(), Op::AvgPool { input: x, geometry }, rg))
    }

    /// Zeros shaped like `x[:, :, ::stride, ::stride]`; carries no gradient
    pub fn zeros_strided(&mut self, x: Var, stride: usize) -> Result<Var> {
        if stride == 0 {
            return Err(DartsError::InvalidInput("zero stride".to_string()));
        }
        let (n, c, h, w) = as4(self.value(x))?.dim();
        let shape = (n, c, h.div_ceil(stride), w.div_ceil(stride));
        Ok(self.constant(Array4::<f64>::zeros(shape).into_dyn()))
    }

    /// `x[:, :, 1:, 1:]`
    pub fn crop(&mut self, x: Var) -> Result<Var> {
        let value = as4(self.value(x))?.slice(s![.., .., 1.., 1..]).to_owned();
        let rg = self.requires_grad(x);
        Ok(self.push(value.into_dyn(), Op::Crop(x), rg))
    }

    /// Concatenation along the channel axis
    pub fn concat_channels(&mut self, inputs: &[Var]) -> Result<Var> {
        if inputs.is_empty() {
            return Err(DartsError::InvalidInput("concat over an empty list".to_string()));
        }
        let views = inputs
            .iter()
            .map(|&v| as4(self.value(v)))
            .collect::<Result<Vec<_>>>()?;
        let widths = views.iter().map(|v| v.dim().1).collect();
        let value = ndarray::concatenate(Axis(1), &views)?;
        let rg = inputs.iter().any(|&v| self.requires_grad(v));
        Ok(self.push(value.into_dyn(), Op::Concat { inputs: inputs.to_vec(), widths }, rg))
    }

    /// Mean over the spatial axes: [N, C, H, W] -> [N, C]
    pub fn global_avg_pool(&mut self, x: Var) -> Result<Var> {
        let input = as4(self.value(x))?;
        let (n, c, h, w) = input.dim();
        let hw = (h * w) as f64;
        let value = Array2::from_shape_fn((n, c), |(i, j)| input.slice(s![i, j, .., ..]).sum() / hw);
        let rg = self.requires_grad(x);
        Ok(self.push(value.into_dyn(), Op::GlobalAvgPool(x), rg))
    }

    /// `x · Wᵀ + b` with `W: [out, in]`
    pub fn linear(&mut self, x: Var, weight: Var, bias: Option<Var>) -> Result<Var> {
        let input = as2(self.value(x))?;
        let w = as2(self.value(weight))?;
        if input.dim().1 != w.dim().1 {
            return Err(DartsError::shape(format!("input width {}", w.dim().1), format!("{}", input.dim().1)));
        }
        let mut value = input.dot(&w.t());
        if let Some(b) = bias {
            let b = self.value(b).view().into_dimensionality::<ndarray::Ix1>()?;
            value += &b;
        }
        let rg = self.requires_grad(x) || self.requires_grad(weight) || bias.map_or(false, |b| self.requires_grad(b));
        Ok(self.push(value.into_dyn(), Op::Linear { input: x, weight, bias }, rg))
    }

    /// Row-wise softmax of a 2D node
    pub fn softmax(&mut self, x: Var) -> Result<Var> {
        let value = kernels::softmax_rows(as2(self.value(x))?);
        let rg = self.requires_grad(x);
        Ok(self.push(value.into_dyn(), Op::Softmax(x), rg))
    }

    pub fn sigmoid(&mut self, x: Var) -> Var {
        let value = self.value(x).mapv(|v| 1.0 / (1.0 + (-v).exp()));
        let rg = self.requires_grad(x);
        self.push(value, Op::Sigmoid(x), rg)
    }

    /// `Σ_r Σ_c x[r, c] / divisors[r]`, accumulated row by row
    pub fn weighted_row_sum(&mut self, x: Var, divisors: Array1<f64>) -> Result<Var> {
        let input = as2(self.value(x))?;
        if input.nrows() != divisors.len() {
            return Err(DartsError::shape(format!("{} row divisors", input.nrows()), format!("{}", divisors.len())));
        }
        let total = input
            .rows()
            .into_iter()
            .zip(divisors.iter())
            .fold(0.0, |acc, (row, &d)| acc + row.mapv(|v| v / d).sum());
        let rg = self.requires_grad(x);
        Ok(self.push(scalar_array(total), Op::WeightedRowSum { input: x, divisors }, rg))
    }

    /// Mean negative log-likelihood of `targets` under `softmax(logits)`
    pub fn cross_entropy(&mut self, logits: Var, targets: &[usize]) -> Result<Var> {
        let l = as2(self.value(logits))?;
        let (n, classes) = l.dim();
        if n != targets.len() || n == 0 {
            return Err(DartsError::shape(format!("{} targets", n), format!("{}", targets.len())));
        }
        if let Some(&bad) = targets.iter().find(|&&t| t >= classes) {
            return Err(DartsError::InvalidInput(format!("target class {} out of range for {} classes", bad, classes)));
        }
        let probs = kernels::softmax_rows(l);
        let loss = targets
            .iter()
            .enumerate()
            .map(|(i, &t)| -probs[[i, t]].max(f64::MIN_POSITIVE).ln())
            .sum::<f64>()
            / n as f64;
        let rg = self.requires_grad(logits);
        Ok(self.push(
            scalar_array(loss),
            Op::CrossEntropy { logits, targets: targets.to_vec(), probs },
            rg,
        ))
    }

    /// Backpropagate from `root`, seeding it with ones
    pub fn backward(&self, root: Var) -> Result<Gradients> {
        let mut grads: Vec<Option<ArrayD<f64>>> = vec![None; root.0 + 1];
        grads[root.0] = Some(ArrayD::ones(self.value(root).raw_dim()));

        for idx in (0..=root.0).rev() {
            let node = &self.nodes[idx];
            if !node.requires_grad {
                continue;
            }
            let Some(upstream) = grads[idx].take() else {
                continue;
            };
            self.propagate(node, &upstream, &mut grads)?;
            grads[idx] = Some(upstream);
        }
        Ok(Gradients { grads })
    }

    fn propagate(&self, node: &Node, upstream: &ArrayD<f64>, grads: &mut [Option<ArrayD<f64>>]) -> Result<()> {
        match &node.op {
            Op::Leaf | Op::Constant => {}
            Op::Add(a, b) => {
                for &v in [a, b] {
                    if self.requires_grad(v) {
                        accumulate(grads, v, upstream.clone());
                    }
                }
            }
            Op::Scale(x, factor) => {
                accumulate(grads, *x, upstream * *factor);
            }
            &Op::ScaleByCoeff { input, coeffs, row, col } => {
                if self.requires_grad(input) {
                    let weight = as2(self.value(coeffs))?[[row, col]];
                    accumulate(grads, input, upstream * weight);
                }
                if self.requires_grad(coeffs) {
                    let dot = ndarray::Zip::from(upstream)
                        .and(self.value(input))
                        .fold(0.0, |acc, &g, &x| acc + g * x);
                    let mut d = ArrayD::zeros(self.value(coeffs).raw_dim());
                    d[[row, col].as_slice()] = dot;
                    accumulate(grads, coeffs, d);
                }
            }
            Op::Relu(x) => {
                let mut d = upstream.clone();
                d.zip_mut_with(self.value(*x), |g, &v| {
                    if v <= 0.0 {
                        *g = 0.0;
                    }
                });
                accumulate(grads, *x, d);
            }
            &Op::Conv2d { input, weight, geometry } => {
                let (d_input, d_weight) = kernels::conv2d_backward(
                    as4(self.value(input))?,
                    as4(self.value(weight))?,
                    as4(upstream)?,
                    &geometry,
                    self.requires_grad(input),
                )?;
                if let Some(dx) = d_input {
                    accumulate(grads, input, dx.into_dyn());
                }
                if self.requires_grad(weight) {
                    accumulate(grads, weight, d_weight.into_dyn());
                }
            }
            Op::BatchNorm { input, affine, normalized, inv_std, batch_stats } => {
                let gamma = match affine {
                    Some((g, _)) => Some(self.value(*g).view().into_dimensionality::<ndarray::Ix1>()?),
                    None => None,
                };
                let (dx, d_affine) =
                    kernels::batch_norm_backward(as4(upstream)?, normalized.view(), inv_std.view(), gamma, *batch_stats);
                if self.requires_grad(*input) {
                    accumulate(grads, *input, dx.into_dyn());
                }
                if let (Some((g, b)), Some((dg, db))) = (affine, d_affine) {
                    if self.requires_grad(*g) {
                        accumulate(grads, *g, dg.into_dyn());
                    }
                    if self.requires_grad(*b) {
                        accumulate(grads, *b, db.into_dyn());
                    }
                }
            }
            Op::MaxPool { input, argmax } => {
                let dim = as4(self.value(*input))?.dim();
                let dx = kernels::max_pool_backward(as4(upstream)?, argmax, dim);
                accumulate(grads, *input, dx.into_dyn());
            }
            Op::AvgPool { input, geometry } => {
                let dim = as4(self.value(*input))?.dim();
                let dx = kernels::avg_pool_backward(as4(upstream)?, dim, geometry);
                accumulate(grads, *input, dx.into_dyn());
            }
            Op::Crop(x) => {
                let mut dx = Array4::zeros(as4(self.value(*x))?.raw_dim());
                dx.slice_mut(s![.., .., 1.., 1..]).assign(&as4(upstream)?);
                accumulate(grads, *x, dx.into_dyn());
            }
            Op::Concat { inputs, widths } => {
                let up = as4(upstream)?;
                let mut offset = 0;
                for (&v, &width) in inputs.iter().zip(widths.iter()) {
                    if self.requires_grad(v) {
                        let part = up.slice(s![.., offset..offset + width, .., ..]).to_owned();
                        accumulate(grads, v, part.into_dyn());
                    }
                    offset += width;
                }
            }
            Op::GlobalAvgPool(x) => {
                let (n, c, h, w) = as4(self.value(*x))?.dim();
                let up = as2(upstream)?;
                let hw = (h * w) as f64;
                let dx = Array4::from_shape_fn((n, c, h, w), |(i, j, _, _)| up[[i, j]] / hw);
                accumulate(grads, *x, dx.into_dyn());
            }
            &Op::Linear { input, weight, bias } => {
                let up = as2(upstream)?;
                if self.requires_grad(input) {
                    let dx = up.dot(&as2(self.value(weight))?);
                    accumulate(grads, input, dx.into_dyn());
                }
                if self.requires_grad(weight) {
                    let dw = up.t().dot(&as2(self.value(input))?);
                    accumulate(grads, weight, dw.into_dyn());
                }
                if let Some(b) = bias.filter(|&b| self.requires_grad(b)) {
                    accumulate(grads, b, up.sum_axis(Axis(0)).into_dyn());
                }
            }
            Op::Softmax(x) => {
                let y = as2(&node.value)?;
                let up = as2(upstream)?;
                let mut dx = Array2::zeros(y.raw_dim());
                for ((mut d, yr), gr) in dx.rows_mut().into_iter().zip(y.rows()).zip(up.rows()) {
                    let dot = yr.dot(&gr);
                    ndarray::Zip::from(&mut d).and(&yr).and(&gr).for_each(|o, &yv, &gv| *o = yv * (gv - dot));
                }
                accumulate(grads, *x, dx.into_dyn());
            }
            Op::Sigmoid(x) => {
                let mut dx = upstream.clone();
                dx.zip_mut_with(&node.value, |g, &y| *g *= y * (1.0 - y));
                accumulate(grads, *x, dx);
            }
            Op::WeightedRowSum { input, divisors } => {
                let up = upstream.iter().copied().next().unwrap_or(0.0);
                let (rows, cols) = as2(self.value(*input))?.dim();
                let dx = Array2::from_shape_fn((rows, cols), |(r, _)| up / divisors[r]);
                accumulate(grads, *input, dx.into_dyn());
            }
            Op::CrossEntropy { logits, targets, probs } => {
                let up = upstream.iter().copied().next().unwrap_or(0.0);
                let n = targets.len() as f64;
                let mut dx = probs.clone();
                for (i, &t) in targets.iter().enumerate() {
                    dx[[i, t]] -= 1.0;
                }
                dx *= up / n;
                accumulate(grads, *logits, dx.into_dyn());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    fn finite_difference<F: Fn(&ArrayD<f64>) -> f64>(f: F, at: &ArrayD<f64>, idx: &[usize]) -> f64 {
        let h = 1e-6;
        let mut plus = at.clone();
        plus[idx] += h;
        let mut minus = at.clone();
        minus[idx] -= h;
        (f(&plus) - f(&minus)) / (2.0 * h)
    }

    #[test]
    fn test_add_and_scale() {
        let mut tape = Tape::new();
        let a = tape.leaf(scalar_array(2.0));
        let b = tape.leaf(scalar_array(3.0));
        let s = tape.add(a, b).unwrap();
        let out = tape.scale(s, 4.0);
        assert_eq!(tape.scalar(out).unwrap(), 20.0);

        let grads = tape.backward(out).unwrap();
        assert_eq!(grads.get(a).unwrap().sum(), 4.0);
        assert_eq!(grads.get(b).unwrap().sum(), 4.0);
    }

    #[test]
    fn test_add_rejects_shape_mismatch() {
        let mut tape = Tape::new();
        let a = tape.leaf(Array1::zeros(3).into_dyn());
        let b = tape.leaf(Array1::zeros(4).into_dyn());
        assert!(tape.add(a, b).is_err());
    }

    #[test]
    fn test_constants_receive_no_gradient() {
        let mut tape = Tape::new();
        let x = tape.constant(array![1.0, -2.0].into_dyn());
        let y = tape.relu(x);
        let grads = tape.backward(y).unwrap();
        assert!(grads.get(x).is_none());
        let wrt = grads.wrt(&tape, &[x]);
        assert_eq!(wrt[0], ArrayD::<f64>::zeros(IxDyn(&[2])));
    }

    #[test]
    fn test_softmax_sigmoid_chain_gradient() {
        let alphas = array![[0.1, -0.3, 0.7], [0.0, 0.2, -0.5]].into_dyn();
        let objective = |a: &ArrayD<f64>| {
            let mut tape = Tape::new();
            let x = tape.leaf(a.clone());
            let p = tape.softmax(x).unwrap();
            let s = tape.sigmoid(p);
            let out = tape.weighted_row_sum(s, array![1.0, 1.6]).unwrap();
            tape.scalar(out).unwrap()
        };

        let mut tape = Tape::new();
        let x = tape.leaf(alphas.clone());
        let p = tape.softmax(x).unwrap();
        let s = tape.sigmoid(p);
        let out = tape.weighted_row_sum(s, array![1.0, 1.6]).unwrap();
        let grads = tape.backward(out).unwrap();
        let analytic = grads.get(x).unwrap();

        for idx in [[0, 0], [0, 2], [1, 1]] {
            let numeric = finite_difference(&objective, &alphas, &idx);
            assert!((numeric - analytic[idx.as_slice()]).abs() < 1e-8);
        }
    }

    #[test]
    fn test_scale_by_coeff_gradient() {
        let mut tape = Tape::new();
        let coeffs = tape.leaf(array![[0.25, 0.75]].into_dyn());
        let x = tape.leaf(array![1.0, 2.0, 3.0].into_dyn());
        let y = tape.scale_by_coeff(x, coeffs, 0, 1).unwrap();
        let grads = tape.backward(y).unwrap();
        // d/dc Σ c·x = Σ x
        assert_eq!(grads.get(coeffs).unwrap()[[0, 1].as_slice()], 6.0);
        assert_eq!(grads.get(coeffs).unwrap()[[0, 0].as_slice()], 0.0);
        assert_eq!(grads.get(x).unwrap()[[2].as_slice()], 0.75);
    }

    #[test]
    fn test_cross_entropy_linear_gradient() {
        let input = Array::linspace(-1.0, 1.0, 6).into_shape_with_order((2, 3)).unwrap();
        let weight = array![[0.1, 0.2, -0.1], [0.4, -0.3, 0.2], [0.0, 0.1, 0.1]].into_dyn();
        let targets = [2usize, 0];
        let objective = |w: &ArrayD<f64>| {
            let mut tape = Tape::new();
            let x = tape.constant(input.clone().into_dyn());
            let w = tape.leaf(w.clone());
            let logits = tape.linear(x, w, None).unwrap();
            let loss = tape.cross_entropy(logits, &targets).unwrap();
            tape.scalar(loss).unwrap()
        };

        let mut tape = Tape::new();
        let x = tape.constant(input.clone().into_dyn());
        let w = tape.leaf(weight.clone());
        let logits = tape.linear(x, w, None).unwrap();
        let loss = tape.cross_entropy(logits, &targets).unwrap();
        let grads = tape.backward(loss).unwrap();

        for idx in [[0, 0], [1, 2], [2, 1]] {
            let numeric = finite_difference(&objective, &weight, &idx);
            assert!((numeric - grads.get(w).unwrap()[idx.as_slice()]).abs() < 1e-8);
        }
    }

    #[test]
    fn test_batch_norm_input_gradient() {
        let input = Array::linspace(-2.0, 3.0, 2 * 2 * 3 * 3)
            .mapv(|v: f64| v * v.sin())
            .into_shape_with_order((2, 2, 3, 3))
            .unwrap()
            .into_dyn();
        // Per-sample channel means weighted differently so the objective is not
        // annihilated by the normalisation
        let build = |x_val: &ArrayD<f64>, tape: &mut Tape| -> (Var, Var) {
            let x = tape.leaf(x_val.clone());
            let (y, moments) = tape.batch_norm(x, None, NormStats::Batch, 1e-5).unwrap();
            assert!(moments.is_some());
            let g = tape.global_avg_pool(y).unwrap();
            let total = tape.weighted_row_sum(g, array![1.0, 2.0]).unwrap();
            (x, total)
        };
        let objective = |x_val: &ArrayD<f64>| {
            let mut tape = Tape::new();
            let (_, total) = build(x_val, &mut tape);
            tape.scalar(total).unwrap()
        };

        let mut tape = Tape::new();
        let (x, total) = build(&input, &mut tape);
        let grads = tape.backward(total).unwrap();
        for idx in [[0, 0, 1, 1], [1, 1, 2, 0], [0, 1, 0, 2]] {
            let numeric = finite_difference(&objective, &input, &idx);
            assert!((numeric - grads.get(x).unwrap()[idx.as_slice()]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_concat_and_crop_shapes() {
        let mut tape = Tape::new();
        let a = tape.leaf(Array4::<f64>::ones((1, 2, 4, 4)).into_dyn());
        let b = tape.leaf(Array4::<f64>::ones((1, 3, 4, 4)).into_dyn());
        let cat = tape.concat_channels(&[a, b]).unwrap();
        assert_eq!(tape.value(cat).shape(), &[1, 5, 4, 4]);
        let cropped = tape.crop(cat).unwrap();
        assert_eq!(tape.value(cropped).shape(), &[1, 5, 3, 3]);
        let z = tape.zeros_strided(cat, 2).unwrap();
        assert_eq!(tape.value(z).shape(), &[1, 5, 2, 2]);
    }
}
