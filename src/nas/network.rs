//! DARTS search network
//!
//! A stem, a stack of search cells and a linear classifier. All normal cells
//! share `alphas_normal` and all reduction cells share `alphas_reduce`; the
//! matrices are owned here and handed to each cell as a softmaxed tape node
//! on every forward pass.

use std::sync::Arc;

use ndarray::{Array2, Array4, ArrayD, Ix2};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use super::cell::{Cell, CellShape};
use super::criterion::Criterion;
use super::edges::num_edges;
use super::genotype::{concat_indices, parse_cell, Genotype};
use super::operations::Primitive;
use super::regularizer;
use crate::autograd::{kernels::softmax_rows, Tape, Var};
use crate::error::{DartsError, Result};
use crate::nn::{BatchNorm2d, BufferStore, Conv2d, ConvSpec, Forward, Linear, ParamStore};

/// Input channels of the stem (RGB images)
pub const INPUT_CHANNELS: usize = 3;

/// Scale of the initial architecture weights
const ALPHA_INIT_SCALE: f64 = 1e-3;

/// Network hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Channels of the first cell
    pub init_channels: usize,
    pub num_classes: usize,
    /// Number of cells
    pub layers: usize,
    /// Intermediate nodes per cell
    pub steps: usize,
    /// Nodes concatenated into a cell output
    pub multiplier: usize,
    /// Stem width as a multiple of `init_channels`
    pub stem_multiplier: usize,
    /// Candidate primitives; the order is the column order of the weights
    pub primitives: Vec<Primitive>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            init_channels: 16,
            num_classes: 10,
            layers: 8,
            steps: 4,
            multiplier: 4,
            stem_multiplier: 3,
            primitives: Primitive::darts(),
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("init_channels", self.init_channels),
            ("num_classes", self.num_classes),
            ("layers", self.layers),
            ("steps", self.steps),
            ("multiplier", self.multiplier),
            ("stem_multiplier", self.stem_multiplier),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(DartsError::InvalidParameter {
                    name: name.to_string(),
                    value: "0".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }
        if self.multiplier > self.steps + 2 {
            return Err(DartsError::InvalidParameter {
                name: "multiplier".to_string(),
                value: self.multiplier.to_string(),
                reason: format!("a cell only has {} states", self.steps + 2),
            });
        }
        if self.primitives.is_empty() {
            return Err(DartsError::ConfigError("empty primitive list".to_string()));
        }
        Ok(())
    }

    /// Rows of each architecture weight matrix
    pub fn num_edges(&self) -> usize {
        num_edges(self.steps)
    }

    /// Indices of the reduction cells
    pub fn reduction_layers(&self) -> [usize; 2] {
        [self.layers / 3, 2 * self.layers / 3]
    }
}

/// The two architecture weight matrices, shape `[edges, primitives]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureWeights {
    pub alphas_normal: Array2<f64>,
    pub alphas_reduce: Array2<f64>,
}

impl ArchitectureWeights {
    /// `1e-3 · N(0, 1)` entries
    pub fn new(edges: usize, ops: usize, rng: &mut impl Rng) -> Self {
        let alphas_normal =
            Array2::from_shape_simple_fn((edges, ops), || ALPHA_INIT_SCALE * rng.sample::<f64, _>(StandardNormal));
        let alphas_reduce =
            Array2::from_shape_simple_fn((edges, ops), || ALPHA_INIT_SCALE * rng.sample::<f64, _>(StandardNormal));
        Self { alphas_normal, alphas_reduce }
    }

    /// Row-wise softmax of the normal weights
    pub fn normal_probs(&self) -> Array2<f64> {
        softmax_rows(self.alphas_normal.view())
    }

    /// Row-wise softmax of the reduction weights
    pub fn reduce_probs(&self) -> Array2<f64> {
        softmax_rows(self.alphas_reduce.view())
    }
}

/// Gradients read off a [`LossGraph`]
#[derive(Debug, Clone)]
pub struct GraphGradients {
    /// One tensor per weight, in `named_parameters` order
    pub weights: Vec<ArrayD<f64>>,
    /// `[d alphas_normal, d alphas_reduce]`
    pub alphas: [Array2<f64>; 2],
}

impl GraphGradients {
    /// L2 norm over all weight gradients
    pub fn weight_norm(&self) -> f64 {
        self.weights.iter().flat_map(|g| g.iter()).map(|v| v * v).sum::<f64>().sqrt()
    }
}

/// A recorded loss evaluation. The objective starts as the task loss and can
/// be extended with the topology penalty before differentiation.
#[derive(Debug, Clone)]
pub struct LossGraph {
    tape: Tape,
    loss: Var,
    objective: Var,
    logits: Var,
    weights: Vec<Var>,
    alphas: [Var; 2],
    targets: Vec<usize>,
}

impl LossGraph {
    /// Task loss
    pub fn loss(&self) -> Result<f64> {
        self.tape.scalar(self.loss)
    }

    /// Value that [`LossGraph::backward`] differentiates
    pub fn objective(&self) -> Result<f64> {
        self.tape.scalar(self.objective)
    }

    /// Add `rate · regularizer(alphas_normal)` to the objective and return the
    /// regularizer value
    pub fn add_regularizer(&mut self, rate: f64, steps: usize, sn_width: f64) -> Result<f64> {
        let reg = regularizer::penalty(&mut self.tape, self.alphas[0], steps, sn_width)?;
        let value = self.tape.scalar(reg)?;
        let scaled = self.tape.scale(reg, rate);
        self.objective = self.tape.add(self.objective, scaled)?;
        Ok(value)
    }

    /// Gradients of the objective with respect to every weight and both
    /// architecture matrices
    pub fn backward(&self) -> Result<GraphGradients> {
        let grads = self.tape.backward(self.objective)?;
        let weights = grads.wrt(&self.tape, &self.weights);
        let mut alphas = grads.wrt(&self.tape, &self.alphas).into_iter();
        let mut next = || -> Result<Array2<f64>> {
            let g = alphas
                .next()
                .ok_or_else(|| DartsError::Numerical("missing architecture gradient".to_string()))?;
            Ok(g.into_dimensionality::<Ix2>()?)
        };
        let normal = next()?;
        let reduce = next()?;
        Ok(GraphGradients {
            weights,
            alphas: [normal, reduce],
        })
    }

    pub fn logits(&self) -> Result<Array2<f64>> {
        Ok(self.tape.value(self.logits).clone().into_dimensionality::<Ix2>()?)
    }

    /// Fraction of samples whose arg-max logit is the target
    pub fn accuracy(&self) -> Result<f64> {
        let logits = self.logits()?;
        let correct = logits
            .rows()
            .into_iter()
            .zip(&self.targets)
            .filter(|(row, target)| {
                let mut best = 0;
                for (k, &v) in row.iter().enumerate() {
                    if v > row[best] {
                        best = k;
                    }
                }
                best == **target
            })
            .count();
        Ok(correct as f64 / self.targets.len().max(1) as f64)
    }

    /// Number of nodes recorded
    pub fn len(&self) -> usize {
        self.tape.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tape.is_empty()
    }
}

/// DARTS supernet
#[derive(Debug, Clone)]
pub struct Network {
    config: NetworkConfig,
    criterion: Arc<dyn Criterion>,
    params: ParamStore,
    buffers: BufferStore,
    stem_conv: Conv2d,
    stem_bn: BatchNorm2d,
    cells: Vec<Cell>,
    classifier: Linear,
    alphas: ArchitectureWeights,
    alpha_grads: [Option<Array2<f64>>; 2],
    training: bool,
}

impl Network {
    /// Build a network with fresh weights and fresh architecture weights
    pub fn new(config: NetworkConfig, criterion: Arc<dyn Criterion>, rng: &mut impl Rng) -> Result<Self> {
        config.validate()?;
        let mut params = ParamStore::new();
        let mut buffers = BufferStore::new();

        let c_stem = config.stem_multiplier * config.init_channels;
        let stem_conv = Conv2d::new(
            &mut params,
            "stem.0",
            ConvSpec::new(INPUT_CHANNELS, c_stem, 3).with_padding(1),
            rng,
        )?;
        let stem_bn = BatchNorm2d::new(&mut params, &mut buffers, "stem.1", c_stem, true);

        let (mut c_prev_prev, mut c_prev, mut c_curr) = (c_stem, c_stem, config.init_channels);
        let reductions = config.reduction_layers();
        let mut reduction_prev = false;
        let mut cells = Vec::with_capacity(config.layers);
        for i in 0..config.layers {
            let reduction = reductions.contains(&i);
            if reduction {
                c_curr *= 2;
            }
            let shape = CellShape {
                steps: config.steps,
                multiplier: config.multiplier,
                c_prev_prev,
                c_prev,
                channels: c_curr,
                reduction,
                reduction_prev,
            };
            let cell = Cell::new(&mut params, &mut buffers, &format!("cells.{}", i), shape, &config.primitives, rng)?;
            reduction_prev = reduction;
            c_prev_prev = c_prev;
            c_prev = cell.out_channels();
            cells.push(cell);
        }

        let classifier = Linear::new(&mut params, "classifier", c_prev, config.num_classes, rng);
        let alphas = ArchitectureWeights::new(config.num_edges(), config.primitives.len(), rng);

        Ok(Self {
            config,
            criterion,
            params,
            buffers,
            stem_conv,
            stem_bn,
            cells,
            classifier,
            alphas,
            alpha_grads: [None, None],
            training: true,
        })
    }

    /// A network with the same hyperparameters and criterion, freshly
    /// initialised weights and a copy of this network's architecture weights
    pub fn scaffold(&self, rng: &mut impl Rng) -> Result<Self> {
        let mut model = Self::new(self.config.clone(), Arc::clone(&self.criterion), rng)?;
        model.alphas = self.alphas.clone();
        model.training = self.training;
        Ok(model)
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn criterion(&self) -> &Arc<dyn Criterion> {
        &self.criterion
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// All weights except the architecture matrices
    pub fn parameters(&self) -> &ParamStore {
        &self.params
    }

    pub fn parameters_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    /// Batch norm running statistics
    pub fn buffers(&self) -> &BufferStore {
        &self.buffers
    }

    /// Overwrite the running statistics from a network of the same layout
    pub fn load_buffers(&mut self, other: &BufferStore) -> Result<()> {
        self.buffers.copy_from(other)
    }

    /// `[alphas_normal, alphas_reduce]`, in that order
    pub fn arch_parameters(&self) -> [&Array2<f64>; 2] {
        [&self.alphas.alphas_normal, &self.alphas.alphas_reduce]
    }

    pub fn arch_parameters_mut(&mut self) -> [&mut Array2<f64>; 2] {
        [&mut self.alphas.alphas_normal, &mut self.alphas.alphas_reduce]
    }

    pub fn architecture(&self) -> &ArchitectureWeights {
        &self.alphas
    }

    /// Replace both architecture matrices; shapes must match
    pub fn set_architecture(&mut self, alphas: ArchitectureWeights) -> Result<()> {
        let expected = self.alphas.alphas_normal.dim();
        for actual in [alphas.alphas_normal.dim(), alphas.alphas_reduce.dim()] {
            if actual != expected {
                return Err(DartsError::shape(format!("{:?}", expected), format!("{:?}", actual)));
            }
        }
        self.alphas = alphas;
        Ok(())
    }

    /// Architecture gradients, `None` until one has been stored
    pub fn arch_grads(&self) -> [Option<&Array2<f64>>; 2] {
        [self.alpha_grads[0].as_ref(), self.alpha_grads[1].as_ref()]
    }

    /// Zero any stored architecture gradient in place
    pub fn zero_arch_grads(&mut self) {
        for grad in self.alpha_grads.iter_mut().flatten() {
            grad.fill(0.0);
        }
    }

    /// Store architecture gradients, copying into existing tensors when present
    pub fn set_arch_grads(&mut self, grads: [Array2<f64>; 2]) -> Result<()> {
        let expected = self.alphas.alphas_normal.dim();
        if let Some(bad) = grads.iter().find(|g| g.dim() != expected) {
            return Err(DartsError::shape(format!("{:?}", expected), format!("{:?}", bad.dim())));
        }
        for (slot, grad) in self.alpha_grads.iter_mut().zip(grads) {
            match slot {
                Some(existing) => existing.assign(&grad),
                None => *slot = Some(grad),
            }
        }
        Ok(())
    }

    fn record(&mut self, input: &Array4<f64>) -> Result<(Tape, Var, Vec<Var>, [Var; 2])> {
        if input.dim().1 != INPUT_CHANNELS {
            return Err(DartsError::shape(
                format!("{} input channels", INPUT_CHANNELS),
                format!("{}", input.dim().1),
            ));
        }
        let mut f = Forward::new(&self.params, &mut self.buffers, self.training);
        let alphas_normal = f.tape.leaf(self.alphas.alphas_normal.clone().into_dyn());
        let alphas_reduce = f.tape.leaf(self.alphas.alphas_reduce.clone().into_dyn());
        let weights_normal = f.tape.softmax(alphas_normal)?;
        let weights_reduce = f.tape.softmax(alphas_reduce)?;

        let x = f.tape.constant(input.clone().into_dyn());
        let x = self.stem_conv.forward(&mut f, x)?;
        let stem = self.stem_bn.forward(&mut f, x)?;

        let (mut s0, mut s1) = (stem, stem);
        for cell in &self.cells {
            let weights = if cell.is_reduction() { weights_reduce } else { weights_normal };
            let out = cell.forward(&mut f, s0, s1, weights)?;
            s0 = s1;
            s1 = out;
        }
        let pooled = f.tape.global_avg_pool(s1)?;
        let logits = self.classifier.forward(&mut f, pooled)?;

        let (tape, weights) = f.finish();
        Ok((tape, logits, weights, [alphas_normal, alphas_reduce]))
    }

    /// Logits for a batch of `[N, 3, H, W]` images
    pub fn forward(&mut self, input: &Array4<f64>) -> Result<Array2<f64>> {
        let (tape, logits, _, _) = self.record(input)?;
        Ok(tape.value(logits).clone().into_dimensionality::<Ix2>()?)
    }

    /// Record `criterion(forward(input), targets)`
    pub fn loss(&mut self, input: &Array4<f64>, targets: &[usize]) -> Result<LossGraph> {
        let (mut tape, logits, weights, alphas) = self.record(input)?;
        let loss = self.criterion.loss(&mut tape, logits, targets)?;
        Ok(LossGraph {
            tape,
            loss,
            objective: loss,
            logits,
            weights,
            alphas,
            targets: targets.to_vec(),
        })
    }

    /// Topology regularizer of the current normal weights
    pub fn regularizer(&self, sn_width: f64) -> Result<f64> {
        regularizer::value(self.alphas.alphas_normal.view(), self.config.steps, sn_width)
    }

    /// Discrete architecture of the current weights
    pub fn genotype(&self) -> Result<Genotype> {
        let steps = self.config.steps;
        let primitives = &self.config.primitives;
        let concat = concat_indices(steps, self.config.multiplier);
        Ok(Genotype {
            normal: parse_cell(self.alphas.normal_probs().view(), steps, primitives)?,
            normal_concat: concat.clone(),
            reduce: parse_cell(self.alphas.reduce_probs().view(), steps, primitives)?,
            reduce_concat: concat,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas::criterion::CrossEntropyLoss;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn tiny() -> NetworkConfig {
        NetworkConfig {
            init_channels: 2,
            num_classes: 3,
            layers: 3,
            steps: 2,
            multiplier: 2,
            stem_multiplier: 1,
            primitives: vec![Primitive::None, Primitive::SkipConnect, Primitive::AvgPool3x3],
        }
    }

    fn input() -> Array4<f64> {
        Array4::from_shape_fn((2, 3, 8, 8), |(n, c, h, w)| ((n * 7 + c * 3 + h) as f64 * 0.3 - w as f64 * 0.2).sin())
    }

    #[test]
    fn test_layout() {
        let config = NetworkConfig::default();
        assert_eq!(config.reduction_layers(), [2, 5]);
        assert_eq!(config.num_edges(), 14);

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let net = Network::new(tiny(), Arc::new(CrossEntropyLoss), &mut rng).unwrap();
        let flags: Vec<bool> = net.cells().iter().map(Cell::is_reduction).collect();
        assert_eq!(flags, vec![false, true, true]);
        assert_eq!(net.arch_parameters()[0].dim(), (5, 3));
        let (_, first) = net.parameters().named_parameters().next().unwrap();
        assert_eq!(first.shape(), &[2, 3, 3, 3]);
    }

    #[test]
    fn test_alpha_init_is_small_and_seeded() {
        let mut a = Xoshiro256PlusPlus::seed_from_u64(9);
        let mut b = Xoshiro256PlusPlus::seed_from_u64(9);
        let wa = ArchitectureWeights::new(14, 8, &mut a);
        let wb = ArchitectureWeights::new(14, 8, &mut b);
        assert_eq!(wa, wb);
        assert!(wa.alphas_normal.iter().all(|v| v.abs() < 1e-2));
        assert_ne!(wa.alphas_normal, wa.alphas_reduce);
    }

    #[test]
    fn test_forward_shape_and_probabilities() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let mut net = Network::new(tiny(), Arc::new(CrossEntropyLoss), &mut rng).unwrap();
        let logits = net.forward(&input()).unwrap();
        assert_eq!(logits.dim(), (2, 3));
        for row in net.architecture().normal_probs().rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_scaffold_copies_alphas_only() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2);
        let net = Network::new(tiny(), Arc::new(CrossEntropyLoss), &mut rng).unwrap();
        let copy = net.scaffold(&mut rng).unwrap();
        assert_eq!(copy.architecture(), net.architecture());
        assert_eq!(copy.parameters().numel(), net.parameters().numel());
        assert_ne!(copy.parameters().flatten(), net.parameters().flatten());
    }

    #[test]
    fn test_loss_gradients_cover_everything() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let mut net = Network::new(tiny(), Arc::new(CrossEntropyLoss), &mut rng).unwrap();
        let mut graph = net.loss(&input(), &[0, 2]).unwrap();
        let loss = graph.loss().unwrap();
        let reg = graph.add_regularizer(0.5, 2, 0.3).unwrap();
        assert!((graph.objective().unwrap() - (loss + 0.5 * reg)).abs() < 1e-12);
        assert!((reg - net.regularizer(0.3).unwrap()).abs() < 1e-12);

        let grads = graph.backward().unwrap();
        assert_eq!(grads.weights.len(), net.parameters().len());
        assert_eq!(grads.alphas[0].dim(), (5, 3));
        assert!(grads.alphas[1].iter().any(|g| *g != 0.0));
        assert!(grads.weight_norm() > 0.0);
    }

    #[test]
    fn test_set_arch_grads_checks_shape() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(4);
        let mut net = Network::new(tiny(), Arc::new(CrossEntropyLoss), &mut rng).unwrap();
        assert!(net.arch_grads()[0].is_none());
        net.set_arch_grads([Array2::ones((5, 3)), Array2::ones((5, 3))]).unwrap();
        net.zero_arch_grads();
        assert_eq!(net.arch_grads()[1].unwrap().sum(), 0.0);
        assert!(net.set_arch_grads([Array2::ones((4, 3)), Array2::ones((5, 3))]).is_err());
    }

    #[test]
    fn test_genotype_has_two_edges_per_node() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        let net = Network::new(tiny(), Arc::new(CrossEntropyLoss), &mut rng).unwrap();
        let g = net.genotype().unwrap();
        assert_eq!(g.normal.len(), 4);
        assert_eq!(g.reduce.len(), 4);
        assert_eq!(g.normal_concat, vec![2, 3]);
    }
}
