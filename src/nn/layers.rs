//! Convolution, batch normalization and linear layers

use ndarray::{Array1, Array2, Array4};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{BufferId, BufferStore, Forward, ParamId, ParamStore};
use crate::autograd::{ConvGeometry, NormStats, Var};
use crate::error::{DartsError, Result};

/// Shape and geometry of a bias-free 2D convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvSpec {
    pub c_in: usize,
    pub c_out: usize,
    pub kernel: (usize, usize),
    pub geometry: ConvGeometry,
}

impl ConvSpec {
    /// Square kernel, stride 1, no padding
    pub fn new(c_in: usize, c_out: usize, kernel: usize) -> Self {
        Self::rect(c_in, c_out, (kernel, kernel))
    }

    pub fn rect(c_in: usize, c_out: usize, kernel: (usize, usize)) -> Self {
        Self {
            c_in,
            c_out,
            kernel,
            geometry: ConvGeometry::default(),
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.geometry.stride = (stride, stride);
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.geometry.padding = (padding, padding);
        self
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.geometry.dilation = (dilation, dilation);
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.geometry.groups = groups;
        self
    }

    /// Replace the whole geometry (for asymmetric stride/padding)
    pub fn with_geometry(mut self, geometry: ConvGeometry) -> Self {
        self.geometry = geometry;
        self
    }
}

/// Bias-free 2D convolution
#[derive(Debug, Clone)]
pub struct Conv2d {
    weight: ParamId,
    geometry: ConvGeometry,
}

impl Conv2d {
    /// Register a convolution weight, initialised uniformly in ±1/√fan_in
    pub fn new(store: &mut ParamStore, name: &str, spec: ConvSpec, rng: &mut impl Rng) -> Result<Self> {
        let groups = spec.geometry.groups;
        if groups == 0 || spec.c_in % groups != 0 || spec.c_out % groups != 0 {
            return Err(DartsError::InvalidParameter {
                name: format!("{}.groups", name),
                value: groups.to_string(),
                reason: format!("must divide both {} input and {} output channels", spec.c_in, spec.c_out),
            });
        }
        let fan_in = spec.c_in / groups * spec.kernel.0 * spec.kernel.1;
        let bound = 1.0 / (fan_in as f64).sqrt();
        let shape = (spec.c_out, spec.c_in / groups, spec.kernel.0, spec.kernel.1);
        let weight = Array4::from_shape_simple_fn(shape, || rng.gen_range(-bound..bound));
        Ok(Self {
            weight: store.register(format!("{}.weight", name), weight.into_dyn()),
            geometry: spec.geometry,
        })
    }

    pub fn weight(&self) -> ParamId {
        self.weight
    }

    pub fn forward(&self, f: &mut Forward<'_>, x: Var) -> Result<Var> {
        let w = f.param(self.weight);
        f.tape.conv2d(x, w, self.geometry)
    }
}

/// Batch normalization over the channel axis with running statistics
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    affine: Option<(ParamId, ParamId)>,
    running_mean: BufferId,
    running_var: BufferId,
    momentum: f64,
    eps: f64,
}

impl BatchNorm2d {
    pub fn new(params: &mut ParamStore, buffers: &mut BufferStore, name: &str, channels: usize, affine: bool) -> Self {
        let affine = affine.then(|| {
            (
                params.register(format!("{}.weight", name), Array1::<f64>::ones(channels).into_dyn()),
                params.register(format!("{}.bias", name), Array1::<f64>::zeros(channels).into_dyn()),
            )
        });
        Self {
            affine,
            running_mean: buffers.register(format!("{}.running_mean", name), Array1::zeros(channels)),
            running_var: buffers.register(format!("{}.running_var", name), Array1::ones(channels)),
            momentum: 0.1,
            eps: 1e-5,
        }
    }

    pub fn forward(&self, f: &mut Forward<'_>, x: Var) -> Result<Var> {
        let affine = self.affine.map(|(g, b)| (f.param(g), f.param(b)));
        if !f.training {
            let stats = NormStats::Running {
                mean: f.buffers.get(self.running_mean),
                var: f.buffers.get(self.running_var),
            };
            return Ok(f.tape.batch_norm(x, affine, stats, self.eps)?.0);
        }

        let (y, moments) = f.tape.batch_norm(x, affine, NormStats::Batch, self.eps)?;
        if let Some(moments) = moments {
            let m = self.momentum;
            let unbias = if moments.count > 1 {
                moments.count as f64 / (moments.count - 1) as f64
            } else {
                1.0
            };
            let running_mean = f.buffers.get_mut(self.running_mean);
            running_mean.zip_mut_with(&moments.mean, |r, &v| *r = (1.0 - m) * *r + m * v);
            let running_var = f.buffers.get_mut(self.running_var);
            running_var.zip_mut_with(&moments.var, |r, &v| *r = (1.0 - m) * *r + m * v * unbias);
        }
        Ok(y)
    }
}

/// Fully connected layer, `y = x · Wᵀ + b`
#[derive(Debug, Clone)]
pub struct Linear {
    weight: ParamId,
    bias: ParamId,
}

impl Linear {
    pub fn new(store: &mut ParamStore, name: &str, in_features: usize, out_features: usize, rng: &mut impl Rng) -> Self {
        let bound = 1.0 / (in_features as f64).sqrt();
        let weight = Array2::from_shape_simple_fn((out_features, in_features), || rng.gen_range(-bound..bound));
        let bias = Array1::from_shape_simple_fn(out_features, || rng.gen_range(-bound..bound));
        Self {
            weight: store.register(format!("{}.weight", name), weight.into_dyn()),
            bias: store.register(format!("{}.bias", name), bias.into_dyn()),
        }
    }

    pub fn forward(&self, f: &mut Forward<'_>, x: Var) -> Result<Var> {
        let (w, b) = (f.param(self.weight), f.param(self.bias));
        f.tape.linear(x, w, Some(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_conv_registers_grouped_weight() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let mut store = ParamStore::new();
        let conv = Conv2d::new(&mut store, "dw", ConvSpec::new(4, 4, 3).with_groups(4), &mut rng).unwrap();
        assert_eq!(store.get(conv.weight()).shape(), &[4, 1, 3, 3]);
        assert_eq!(store.name(conv.weight()), "dw.weight");
    }

    #[test]
    fn test_conv_rejects_bad_groups() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let mut store = ParamStore::new();
        assert!(Conv2d::new(&mut store, "bad", ConvSpec::new(4, 6, 1).with_groups(4), &mut rng).is_err());
    }

    #[test]
    fn test_batch_norm_updates_running_stats_in_training() {
        let mut params = ParamStore::new();
        let mut buffers = BufferStore::new();
        let bn = BatchNorm2d::new(&mut params, &mut buffers, "bn", 2, true);
        assert_eq!(params.len(), 2);

        let x = Array4::from_shape_fn((2, 2, 2, 2), |(n, c, h, w)| (n + 2 * c + h * w) as f64);
        {
            let mut f = Forward::new(&params, &mut buffers, true);
            let input = f.tape.constant(x.clone().into_dyn());
            bn.forward(&mut f, input).unwrap();
        }
        let (_, mean) = buffers.named_buffers().next().unwrap();
        assert!(mean.iter().all(|&v| v > 0.0));

        // Evaluation mode leaves the statistics untouched
        let snapshot = buffers.clone();
        {
            let mut f = Forward::new(&params, &mut buffers, false);
            let input = f.tape.constant(x.into_dyn());
            bn.forward(&mut f, input).unwrap();
        }
        assert_eq!(
            buffers.named_buffers().map(|(_, v)| v.clone()).collect::<Vec<_>>(),
            snapshot.named_buffers().map(|(_, v)| v.clone()).collect::<Vec<_>>()
        );
    }
}
