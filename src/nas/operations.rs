//! Candidate operation catalog
//!
//! Defines the primitives that can sit on a cell edge. The order of
//! [`Primitive::darts`] is the column order of the architecture weights, so it
//! must stay stable across runs.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::autograd::{ConvGeometry, PoolGeometry, Var};
use crate::error::{DartsError, Result};
use crate::nn::{BatchNorm2d, BufferStore, Conv2d, ConvSpec, Forward, ParamStore};

/// Types of operations in the search space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Primitive {
    /// Zero output (drops the edge)
    #[serde(rename = "none")]
    None,
    /// 3x3 max pooling
    #[serde(rename = "max_pool_3x3")]
    MaxPool3x3,
    /// 3x3 average pooling, padding excluded from the average
    #[serde(rename = "avg_pool_3x3")]
    AvgPool3x3,
    /// Identity, or a factorized reduce on strided edges
    #[serde(rename = "skip_connect")]
    SkipConnect,
    /// Two stacked depthwise-separable 3x3 convolutions
    #[serde(rename = "sep_conv_3x3")]
    SepConv3x3,
    /// Two stacked depthwise-separable 5x5 convolutions
    #[serde(rename = "sep_conv_5x5")]
    SepConv5x5,
    /// Two stacked depthwise-separable 7x7 convolutions
    #[serde(rename = "sep_conv_7x7")]
    SepConv7x7,
    /// Dilated (rate 2) depthwise-separable 3x3 convolution
    #[serde(rename = "dil_conv_3x3")]
    DilConv3x3,
    /// Dilated (rate 2) depthwise-separable 5x5 convolution
    #[serde(rename = "dil_conv_5x5")]
    DilConv5x5,
    /// 7x1 followed by 1x7 convolution
    #[serde(rename = "conv_7x1_1x7")]
    Conv7x1And1x7,
}

impl Primitive {
    /// The standard DARTS search space
    pub fn darts() -> Vec<Self> {
        vec![
            Self::None,
            Self::MaxPool3x3,
            Self::AvgPool3x3,
            Self::SkipConnect,
            Self::SepConv3x3,
            Self::SepConv5x5,
            Self::DilConv3x3,
            Self::DilConv5x5,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::MaxPool3x3 => "max_pool_3x3",
            Self::AvgPool3x3 => "avg_pool_3x3",
            Self::SkipConnect => "skip_connect",
            Self::SepConv3x3 => "sep_conv_3x3",
            Self::SepConv5x5 => "sep_conv_5x5",
            Self::SepConv7x7 => "sep_conv_7x7",
            Self::DilConv3x3 => "dil_conv_3x3",
            Self::DilConv5x5 => "dil_conv_5x5",
            Self::Conv7x1And1x7 => "conv_7x1_1x7",
        }
    }

    /// Look a primitive up by its canonical name
    pub fn from_name(name: &str) -> Result<Self> {
        Self::all()
            .into_iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| DartsError::UnknownPrimitive(name.to_string()))
    }

    fn all() -> [Self; 10] {
        [
            Self::None,
            Self::MaxPool3x3,
            Self::AvgPool3x3,
            Self::SkipConnect,
            Self::SepConv3x3,
            Self::SepConv5x5,
            Self::SepConv7x7,
            Self::DilConv3x3,
            Self::DilConv5x5,
            Self::Conv7x1And1x7,
        ]
    }

    /// Whether the mixed op follows this primitive with a non-affine batch norm
    pub fn is_pool(&self) -> bool {
        matches!(self, Self::MaxPool3x3 | Self::AvgPool3x3)
    }

    /// Build the operation for `channels` channels at `stride`
    pub fn build(
        &self,
        params: &mut ParamStore,
        buffers: &mut BufferStore,
        name: &str,
        channels: usize,
        stride: usize,
        affine: bool,
        rng: &mut impl Rng,
    ) -> Result<CandidateOp> {
        let c = channels;
        let op = match self {
            Self::None => CandidateOp::Zero { stride },
            Self::MaxPool3x3 => CandidateOp::MaxPool(PoolGeometry::new(3, stride, 1)),
            Self::AvgPool3x3 => CandidateOp::AvgPool(PoolGeometry::new(3, stride, 1)),
            Self::SkipConnect if stride == 1 => CandidateOp::Identity,
            Self::SkipConnect => {
                CandidateOp::FactorizedReduce(FactorizedReduce::new(params, buffers, name, c, c, affine, rng)?)
            }
            Self::SepConv3x3 => CandidateOp::SepConv(SepConv::new(params, buffers, name, c, c, 3, stride, 1, affine, rng)?),
            Self::SepConv5x5 => CandidateOp::SepConv(SepConv::new(params, buffers, name, c, c, 5, stride, 2, affine, rng)?),
            Self::SepConv7x7 => CandidateOp::SepConv(SepConv::new(params, buffers, name, c, c, 7, stride, 3, affine, rng)?),
            Self::DilConv3x3 => {
                CandidateOp::DilConv(DilConv::new(params, buffers, name, c, c, 3, stride, 2, 2, affine, rng)?)
            }
            Self::DilConv5x5 => {
                CandidateOp::DilConv(DilConv::new(params, buffers, name, c, c, 5, stride, 4, 2, affine, rng)?)
            }
            Self::Conv7x1And1x7 => CandidateOp::Conv7x1And1x7(Conv7x1And1x7::new(params, buffers, name, c, stride, affine, rng)?),
        };
        Ok(op)
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Primitive {
    type Err = DartsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

/// A constructed primitive
#[derive(Debug, Clone)]
pub enum CandidateOp {
    Zero { stride: usize },
    Identity,
    MaxPool(PoolGeometry),
    AvgPool(PoolGeometry),
    FactorizedReduce(FactorizedReduce),
    SepConv(SepConv),
    DilConv(DilConv),
    Conv7x1And1x7(Conv7x1And1x7),
}

impl CandidateOp {
    pub fn forward(&self, f: &mut Forward<'_>, x: Var) -> Result<Var> {
        match self {
            Self::Zero { stride } => f.tape.zeros_strided(x, *stride),
            Self::Identity => Ok(x),
            Self::MaxPool(geometry) => f.tape.max_pool2d(x, *geometry),
            Self::AvgPool(geometry) => f.tape.avg_pool2d(x, *geometry),
            Self::FactorizedReduce(op) => op.forward(f, x),
            Self::SepConv(op) => op.forward(f, x),
            Self::DilConv(op) => op.forward(f, x),
            Self::Conv7x1And1x7(op) => op.forward(f, x),
        }
    }
}

/// ReLU, convolution, batch norm
#[derive(Debug, Clone)]
pub struct ReLUConvBN {
    conv: Conv2d,
    bn: BatchNorm2d,
}

impl ReLUConvBN {
    pub fn new(
        params: &mut ParamStore,
        buffers: &mut BufferStore,
        name: &str,
        spec: ConvSpec,
        affine: bool,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        Ok(Self {
            conv: Conv2d::new(params, &format!("{}.conv", name), spec, rng)?,
            bn: BatchNorm2d::new(params, buffers, &format!("{}.bn", name), spec.c_out, affine),
        })
    }

    pub fn forward(&self, f: &mut Forward<'_>, x: Var) -> Result<Var> {
        let x = f.tape.relu(x);
        let x = self.conv.forward(f, x)?;
        self.bn.forward(f, x)
    }
}

/// Halves the spatial size with two offset stride-2 1x1 convolutions whose
/// outputs are concatenated
#[derive(Debug, Clone)]
pub struct FactorizedReduce {
    conv_1: Conv2d,
    conv_2: Conv2d,
    bn: BatchNorm2d,
}

impl FactorizedReduce {
    pub fn new(
        params: &mut ParamStore,
        buffers: &mut BufferStore,
        name: &str,
        c_in: usize,
        c_out: usize,
        affine: bool,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if c_out % 2 != 0 {
            return Err(DartsError::InvalidParameter {
                name: format!("{}.c_out", name),
                value: c_out.to_string(),
                reason: "factorized reduce needs an even channel count".to_string(),
            });
        }
        let spec = ConvSpec::new(c_in, c_out / 2, 1).with_stride(2);
        Ok(Self {
            conv_1: Conv2d::new(params, &format!("{}.conv_1", name), spec, rng)?,
            conv_2: Conv2d::new(params, &format!("{}.conv_2", name), spec, rng)?,
            bn: BatchNorm2d::new(params, buffers, &format!("{}.bn", name), c_out, affine),
        })
    }

    pub fn forward(&self, f: &mut Forward<'_>, x: Var) -> Result<Var> {
        let x = f.tape.relu(x);
        let a = self.conv_1.forward(f, x)?;
        let shifted = f.tape.crop(x)?;
        let b = self.conv_2.forward(f, shifted)?;
        let cat = f.tape.concat_channels(&[a, b])?;
        self.bn.forward(f, cat)
    }
}

/// ReLU, dilated depthwise conv, pointwise conv, batch norm
#[derive(Debug, Clone)]
pub struct DilConv {
    depthwise: Conv2d,
    pointwise: Conv2d,
    bn: BatchNorm2d,
}

impl DilConv {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: &mut ParamStore,
        buffers: &mut BufferStore,
        name: &str,
        c_in: usize,
        c_out: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        dilation: usize,
        affine: bool,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let depthwise = ConvSpec::new(c_in, c_in, kernel)
            .with_stride(stride)
            .with_padding(padding)
            .with_dilation(dilation)
            .with_groups(c_in);
        Ok(Self {
            depthwise: Conv2d::new(params, &format!("{}.depthwise", name), depthwise, rng)?,
            pointwise: Conv2d::new(params, &format!("{}.pointwise", name), ConvSpec::new(c_in, c_out, 1), rng)?,
            bn: BatchNorm2d::new(params, buffers, &format!("{}.bn", name), c_out, affine),
        })
    }

    pub fn forward(&self, f: &mut Forward<'_>, x: Var) -> Result<Var> {
        let x = f.tape.relu(x);
        let x = self.depthwise.forward(f, x)?;
        let x = self.pointwise.forward(f, x)?;
        self.bn.forward(f, x)
    }
}

/// Two stacked undilated [`DilConv`] blocks; only the first is strided
#[derive(Debug, Clone)]
pub struct SepConv {
    first: DilConv,
    second: DilConv,
}

impl SepConv {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: &mut ParamStore,
        buffers: &mut BufferStore,
        name: &str,
        c_in: usize,
        c_out: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        affine: bool,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        Ok(Self {
            first: DilConv::new(params, buffers, &format!("{}.0", name), c_in, c_in, kernel, stride, padding, 1, affine, rng)?,
            second: DilConv::new(params, buffers, &format!("{}.1", name), c_in, c_out, kernel, 1, padding, 1, affine, rng)?,
        })
    }

    pub fn forward(&self, f: &mut Forward<'_>, x: Var) -> Result<Var> {
        let x = self.first.forward(f, x)?;
        self.second.forward(f, x)
    }
}

/// ReLU, 1x7 conv, 7x1 conv, batch norm
#[derive(Debug, Clone)]
pub struct Conv7x1And1x7 {
    conv_1x7: Conv2d,
    conv_7x1: Conv2d,
    bn: BatchNorm2d,
}

impl Conv7x1And1x7 {
    pub fn new(
        params: &mut ParamStore,
        buffers: &mut BufferStore,
        name: &str,
        channels: usize,
        stride: usize,
        affine: bool,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let wide = ConvSpec::rect(channels, channels, (1, 7)).with_geometry(ConvGeometry {
            stride: (1, stride),
            padding: (0, 3),
            ..Default::default()
        });
        let tall = ConvSpec::rect(channels, channels, (7, 1)).with_geometry(ConvGeometry {
            stride: (stride, 1),
            padding: (3, 0),
            ..Default::default()
        });
        Ok(Self {
            conv_1x7: Conv2d::new(params, &format!("{}.conv_1x7", name), wide, rng)?,
            conv_7x1: Conv2d::new(params, &format!("{}.conv_7x1", name), tall, rng)?,
            bn: BatchNorm2d::new(params, buffers, &format!("{}.bn", name), channels, affine),
        })
    }

    pub fn forward(&self, f: &mut Forward<'_>, x: Var) -> Result<Var> {
        let x = f.tape.relu(x);
        let x = self.conv_1x7.forward(f, x)?;
        let x = self.conv_7x1.forward(f, x)?;
        self.bn.forward(f, x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_darts_catalog_order() {
        let names: Vec<&str> = Primitive::darts().iter().map(Primitive::name).collect();
        assert_eq!(
            names,
            vec![
                "none",
                "max_pool_3x3",
                "avg_pool_3x3",
                "skip_connect",
                "sep_conv_3x3",
                "sep_conv_5x5",
                "dil_conv_3x3",
                "dil_conv_5x5"
            ]
        );
    }

    #[test]
    fn test_name_round_trip() {
        for p in Primitive::all() {
            assert_eq!(p.name().parse::<Primitive>().unwrap(), p);
            assert_eq!(serde_json::to_string(&p).unwrap(), format!("\"{}\"", p.name()));
        }
        assert!("conv_9x9".parse::<Primitive>().is_err());
    }

    #[test]
    fn test_every_primitive_preserves_or_halves_resolution() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let x = Array4::from_shape_fn((2, 4, 8, 8), |(n, c, h, w)| ((n + c * h) as f64 - w as f64).sin());
        for stride in [1, 2] {
            for p in Primitive::all() {
                let mut params = ParamStore::new();
                let mut buffers = BufferStore::new();
                let op = p.build(&mut params, &mut buffers, p.name(), 4, stride, false, &mut rng).unwrap();
                let mut f = Forward::new(&params, &mut buffers, true);
                let input = f.tape.constant(x.clone().into_dyn());
                let out = op.forward(&mut f, input).unwrap();
                let expected = 8 / stride;
                assert_eq!(f.tape.value(out).shape(), &[2, 4, expected, expected], "{} stride {}", p, stride);
            }
        }
    }

    #[test]
    fn test_factorized_reduce_needs_even_channels() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let mut params = ParamStore::new();
        let mut buffers = BufferStore::new();
        assert!(FactorizedReduce::new(&mut params, &mut buffers, "fr", 4, 3, false, &mut rng).is_err());
    }
}
