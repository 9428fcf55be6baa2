//! Dense forward/backward kernels for convolution, pooling and batch norm
//!
//! All kernels operate on NCHW `f64` arrays. Convolution goes through an
//! im2col lowering so the inner product runs on `ndarray`'s matrix multiply.
//! Samples of a batch are lowered in parallel and reassembled in batch order,
//! so results do not depend on the thread count.

use ndarray::{s, Array1, Array2, Array4, ArrayView1, ArrayView2, ArrayView3, ArrayView4, ArrayViewMut3, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{DartsError, Result};

/// Stride/padding/dilation/groups of a 2D convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvGeometry {
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
    pub groups: usize,
}

impl Default for ConvGeometry {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
        }
    }
}

impl ConvGeometry {
    /// Spatial output size for an input of `input` (H, W) and a kernel of `kernel` (KH, KW)
    pub fn output_size(&self, input: (usize, usize), kernel: (usize, usize)) -> Result<(usize, usize)> {
        let h = output_len(input.0, kernel.0, self.stride.0, self.padding.0, self.dilation.0);
        let w = output_len(input.1, kernel.1, self.stride.1, self.padding.1, self.dilation.1);
        match (h, w) {
            (Some(h), Some(w)) => Ok((h, w)),
            _ => Err(DartsError::shape(
                format!("spatial size covering kernel {:?} with {:?}", kernel, self),
                format!("{:?}", input),
            )),
        }
    }
}

fn output_len(len: usize, kernel: usize, stride: usize, padding: usize, dilation: usize) -> Option<usize> {
    if kernel == 0 || stride == 0 || dilation == 0 {
        return None;
    }
    let span = dilation * (kernel - 1) + 1;
    let padded = len + 2 * padding;
    if padded < span {
        return None;
    }
    Some((padded - span) / stride + 1)
}

/// Window geometry of a square pooling op
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolGeometry {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl PoolGeometry {
    pub fn new(kernel: usize, stride: usize, padding: usize) -> Self {
        Self { kernel, stride, padding }
    }

    pub fn output_size(&self, input: (usize, usize)) -> Result<(usize, usize)> {
        match (
            output_len(input.0, self.kernel, self.stride, self.padding, 1),
            output_len(input.1, self.kernel, self.stride, self.padding, 1),
        ) {
            (Some(h), Some(w)) => Ok((h, w)),
            _ => Err(DartsError::shape(
                format!("spatial size covering pool window {:?}", self),
                format!("{:?}", input),
            )),
        }
    }
}

/// Input coordinate under output position `out` at window offset `offset`, if not padding
#[inline]
fn source_index(out: usize, stride: usize, offset: usize, padding: usize, len: usize) -> Option<usize> {
    let pos = (out * stride + offset) as isize - padding as isize;
    if pos < 0 || pos >= len as isize {
        None
    } else {
        Some(pos as usize)
    }
}

fn im2col(
    x: ArrayView3<f64>,
    kernel: (usize, usize),
    geometry: &ConvGeometry,
    out_hw: (usize, usize),
) -> Array2<f64> {
    let (c, h, w) = x.dim();
    let (kh, kw) = kernel;
    let (oh, ow) = out_hw;
    let mut cols = Array2::zeros((c * kh * kw, oh * ow));
    for ci in 0..c {
        for ki in 0..kh {
            for kj in 0..kw {
                let mut row = cols.row_mut((ci * kh + ki) * kw + kj);
                for oy in 0..oh {
                    let Some(iy) = source_index(oy, geometry.stride.0, ki * geometry.dilation.0, geometry.padding.0, h) else {
                        continue;
                    };
                    for ox in 0..ow {
                        if let Some(ix) = source_index(ox, geometry.stride.1, kj * geometry.dilation.1, geometry.padding.1, w) {
                            row[oy * ow + ox] = x[[ci, iy, ix]];
                        }
                    }
                }
            }
        }
    }
    cols
}

fn col2im(
    cols: ArrayView2<f64>,
    mut dx: ArrayViewMut3<f64>,
    kernel: (usize, usize),
    geometry: &ConvGeometry,
    out_hw: (usize, usize),
) {
    let (c, h, w) = dx.dim();
    let (kh, kw) = kernel;
    let (oh, ow) = out_hw;
    for ci in 0..c {
        for ki in 0..kh {
            for kj in 0..kw {
                let row = cols.row((ci * kh + ki) * kw + kj);
                for oy in 0..oh {
                    let Some(iy) = source_index(oy, geometry.stride.0, ki * geometry.dilation.0, geometry.padding.0, h) else {
                        continue;
                    };
                    for ox in 0..ow {
                        if let Some(ix) = source_index(ox, geometry.stride.1, kj * geometry.dilation.1, geometry.padding.1, w) {
                            dx[[ci, iy, ix]] += row[oy * ow + ox];
                        }
                    }
                }
            }
        }
    }
}

struct ConvDims {
    groups: usize,
    in_per_group: usize,
    out_per_group: usize,
    kernel: (usize, usize),
    out_hw: (usize, usize),
}

fn conv_dims(x: &ArrayView4<f64>, weight: &ArrayView4<f64>, geometry: &ConvGeometry) -> Result<ConvDims> {
    let (_, c, h, w) = x.dim();
    let (o, cg, kh, kw) = weight.dim();
    let g = geometry.groups;
    if g == 0 || c % g != 0 || o % g != 0 || c / g != cg {
        return Err(DartsError::shape(
            format!("weight [{}, {}, _, _] compatible with {} input channels in {} groups", o, c / g.max(1), c, g),
            format!("{:?}", weight.shape()),
        ));
    }
    Ok(ConvDims {
        groups: g,
        in_per_group: cg,
        out_per_group: o / g,
        kernel: (kh, kw),
        out_hw: geometry.output_size((h, w), (kh, kw))?,
    })
}

/// Grouped 2D convolution without bias
pub fn conv2d_forward(x: ArrayView4<f64>, weight: ArrayView4<f64>, geometry: &ConvGeometry) -> Result<Array4<f64>> {
    let dims = conv_dims(&x, &weight, geometry)?;
    let n = x.dim().0;
    let (oh, ow) = dims.out_hw;
    let (og, cg) = (dims.out_per_group, dims.in_per_group);
    let kdim = cg * dims.kernel.0 * dims.kernel.1;

    let mut out = Array4::zeros((n, og * dims.groups, oh, ow));
    for gi in 0..dims.groups {
        let w_slice = weight.slice(s![gi * og..(gi + 1) * og, .., .., ..]);
        let w_g = w_slice.to_shape((og, kdim))?;
        let per_sample: Vec<Array2<f64>> = (0..n)
            .into_par_iter()
            .map(|ni| {
                let cols = im2col(x.slice(s![ni, gi * cg..(gi + 1) * cg, .., ..]), dims.kernel, geometry, dims.out_hw);
                w_g.dot(&cols)
            })
            .collect();
        for (ni, y) in per_sample.into_iter().enumerate() {
            let y = y.into_shape_with_order((og, oh, ow))?;
            out.slice_mut(s![ni, gi * og..(gi + 1) * og, .., ..]).assign(&y);
        }
    }
    Ok(out)
}

/// Gradients of [`conv2d_forward`] with respect to its input (when requested) and weight
pub fn conv2d_backward(
    x: ArrayView4<f64>,
    weight: ArrayView4<f64>,
    grad_out: ArrayView4<f64>,
    geometry: &ConvGeometry,
    need_input_grad: bool,
) -> Result<(Option<Array4<f64>>, Array4<f64>)> {
    let dims = conv_dims(&x, &weight, geometry)?;
    let n = x.dim().0;
    let (oh, ow) = dims.out_hw;
    let (og, cg) = (dims.out_per_group, dims.in_per_group);
    let kdim = cg * dims.kernel.0 * dims.kernel.1;

    let mut d_weight = Array4::zeros(weight.raw_dim());
    let mut d_input = need_input_grad.then(|| Array4::zeros(x.raw_dim()));

    for gi in 0..dims.groups {
        let w_slice = weight.slice(s![gi * og..(gi + 1) * og, .., .., ..]);
        let w_g = w_slice.to_shape((og, kdim))?;
        let per_sample = (0..n)
            .into_par_iter()
            .map(|ni| -> Result<(Array2<f64>, Option<Array2<f64>>)> {
                let cols = im2col(x.slice(s![ni, gi * cg..(gi + 1) * cg, .., ..]), dims.kernel, geometry, dims.out_hw);
                let dy_slice = grad_out.slice(s![ni, gi * og..(gi + 1) * og, .., ..]);
                let dy = dy_slice.to_shape((og, oh * ow))?;
                let dcols = need_input_grad.then(|| w_g.t().dot(&dy));
                Ok((dy.dot(&cols.t()), dcols))
            })
            .collect::<Result<Vec<_>>>()?;

        // accumulate in batch order
        let mut dw_g = Array2::<f64>::zeros((og, kdim));
        for (ni, (dw, dcols)) in per_sample.into_iter().enumerate() {
            dw_g += &dw;
            if let (Some(dx), Some(dcols)) = (d_input.as_mut(), dcols) {
                col2im(
                    dcols.view(),
                    dx.slice_mut(s![ni, gi * cg..(gi + 1) * cg, .., ..]),
                    dims.kernel,
                    geometry,
                    dims.out_hw,
                );
            }
        }
        let dw_g = dw_g.into_shape_with_order((og, cg, dims.kernel.0, dims.kernel.1))?;
        d_weight.slice_mut(s![gi * og..(gi + 1) * og, .., .., ..]).assign(&dw_g);
    }
    Ok((d_input, d_weight))
}

/// Which statistics a batch norm normalises with
#[derive(Debug, Clone, Copy)]
pub enum NormStats<'a> {
    /// Statistics of the current batch (training mode)
    Batch,
    /// Tracked running statistics (evaluation mode)
    Running { mean: &'a Array1<f64>, var: &'a Array1<f64> },
}

/// Everything a batch norm forward pass produces
#[derive(Debug, Clone)]
pub struct BatchNormOutput {
    pub output: Array4<f64>,
    pub normalized: Array4<f64>,
    pub inv_std: Array1<f64>,
    /// Per-channel batch mean (zeros when running stats were used)
    pub mean: Array1<f64>,
    /// Per-channel biased batch variance (zeros when running stats were used)
    pub var: Array1<f64>,
}

pub fn batch_norm_forward(
    x: ArrayView4<f64>,
    affine: Option<(ArrayView1<f64>, ArrayView1<f64>)>,
    stats: NormStats<'_>,
    eps: f64,
) -> Result<BatchNormOutput> {
    let c = x.dim().1;
    if let Some((gamma, beta)) = affine {
        if gamma.len() != c || beta.len() != c {
            return Err(DartsError::shape(format!("affine params of length {}", c), format!("{} / {}", gamma.len(), beta.len())));
        }
    }
    let mut mean = Array1::zeros(c);
    let mut var = Array1::zeros(c);
    let mut inv_std = Array1::zeros(c);
    let mut normalized = Array4::zeros(x.raw_dim());
    let mut output = Array4::zeros(x.raw_dim());

    for ch in 0..c {
        let plane = x.index_axis(Axis(1), ch);
        let (mu, sigma2) = match stats {
            NormStats::Batch => {
                let m = plane.len() as f64;
                let mu = plane.sum() / m;
                let sigma2 = plane.fold(0.0, |acc, &v| acc + (v - mu) * (v - mu)) / m;
                mean[ch] = mu;
                var[ch] = sigma2;
                (mu, sigma2)
            }
            NormStats::Running { mean: rm, var: rv } => {
                if rm.len() != c || rv.len() != c {
                    return Err(DartsError::shape(format!("running stats of length {}", c), format!("{} / {}", rm.len(), rv.len())));
                }
                (rm[ch], rv[ch])
            }
        };
        let istd = 1.0 / (sigma2 + eps).sqrt();
        inv_std[ch] = istd;
        let (scale, shift) = affine.map(|(g, b)| (g[ch], b[ch])).unwrap_or((1.0, 0.0));

        let mut xhat = normalized.index_axis_mut(Axis(1), ch);
        xhat.zip_mut_with(&plane, |o, &v| *o = (v - mu) * istd);
        let mut y = output.index_axis_mut(Axis(1), ch);
        y.zip_mut_with(&xhat, |o, &v| *o = v * scale + shift);
    }

    Ok(BatchNormOutput { output, normalized, inv_std, mean, var })
}

/// Gradients of a batch norm: (d_input, Some((d_gamma, d_beta)) when affine)
pub fn batch_norm_backward(
    grad_out: ArrayView4<f64>,
    normalized: ArrayView4<f64>,
    inv_std: ArrayView1<f64>,
    gamma: Option<ArrayView1<f64>>,
    batch_stats: bool,
) -> (Array4<f64>, Option<(Array1<f64>, Array1<f64>)>) {
    let c = grad_out.dim().1;
    let mut d_input = Array4::zeros(grad_out.raw_dim());
    let mut d_gamma = Array1::zeros(c);
    let mut d_beta = Array1::zeros(c);

    for ch in 0..c {
        let dy = grad_out.index_axis(Axis(1), ch);
        let xhat = normalized.index_axis(Axis(1), ch);
        let sum_dy = dy.sum();
        let sum_dy_xhat = ndarray::Zip::from(&dy).and(&xhat).fold(0.0, |acc, &g, &h| acc + g * h);
        d_beta[ch] = sum_dy;
        d_gamma[ch] = sum_dy_xhat;

        let scale = gamma.map(|g| g[ch]).unwrap_or(1.0);
        let istd = inv_std[ch];
        let mut dx = d_input.index_axis_mut(Axis(1), ch);
        if batch_stats {
            let m = dy.len() as f64;
            let k = scale * istd / m;
            ndarray::Zip::from(&mut dx).and(&dy).and(&xhat).for_each(|o, &g, &h| {
                *o = k * (m * g - sum_dy - h * sum_dy_xhat);
            });
        } else {
            ndarray::Zip::from(&mut dx).and(&dy).for_each(|o, &g| *o = scale * istd * g);
        }
    }

    (d_input, gamma.map(|_| (d_gamma, d_beta)))
}

/// Max pooling; returns the output and, per output element, the flat `h * w`
/// index of the selected input element
pub fn max_pool_forward(x: ArrayView4<f64>, geometry: &PoolGeometry) -> Result<(Array4<f64>, Vec<usize>)> {
    let (n, c, h, w) = x.dim();
    let (oh, ow) = geometry.output_size((h, w))?;
    let mut out = Array4::zeros((n, c, oh, ow));
    let mut argmax = Vec::with_capacity(n * c * oh * ow);
    for ni in 0..n {
        for ci in 0..c {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut best = f64::NEG_INFINITY;
                    let mut best_idx = None;
                    for ki in 0..geometry.kernel {
                        let Some(iy) = source_index(oy, geometry.stride, ki, geometry.padding, h) else {
                            continue;
                        };
                        for kj in 0..geometry.kernel {
                            if let Some(ix) = source_index(ox, geometry.stride, kj, geometry.padding, w) {
                                let v = x[[ni, ci, iy, ix]];
                                if best_idx.is_none() || v > best || v.is_nan() {
                                    best = v;
                                    best_idx = Some(iy * w + ix);
                                }
                            }
                        }
                    }
                    let idx = best_idx.ok_or_else(|| DartsError::shape("pool window overlapping the input", format!("{:?}", geometry)))?;
                    out[[ni, ci, oy, ox]] = best;
                    argmax.push(idx);
                }
            }
        }
    }
    Ok((out, argmax))
}

pub fn max_pool_backward(grad_out: ArrayView4<f64>, argmax: &[usize], input_dim: (usize, usize, usize, usize)) -> Array4<f64> {
    let (n, c, _, w) = input_dim;
    let (_, _, oh, ow) = grad_out.dim();
    let mut d_input = Array4::zeros(input_dim);
    let mut cursor = 0;
    for ni in 0..n {
        for ci in 0..c {
            for oy in 0..oh {
                for ox in 0..ow {
                    let idx = argmax[cursor];
                    cursor += 1;
                    d_input[[ni, ci, idx / w, idx % w]] += grad_out[[ni, ci, oy, ox]];
                }
            }
        }
    }
    d_input
}

/// Number of non-padding elements under each pooling window
fn window_counts(geometry: &PoolGeometry, input: (usize, usize), out: (usize, usize)) -> Array2<f64> {
    let (h, w) = input;
    Array2::from_shape_fn(out, |(oy, ox)| {
        let rows = (0..geometry.kernel)
            .filter(|&k| source_index(oy, geometry.stride, k, geometry.padding, h).is_some())
            .count();
        let cols = (0..geometry.kernel)
            .filter(|&k| source_index(ox, geometry.stride, k, geometry.padding, w).is_some())
            .count();
        (rows * cols) as f64
    })
}

/// Average pooling that excludes padding from the divisor
pub fn avg_pool_forward(x: ArrayView4<f64>, geometry: &PoolGeometry) -> Result<Array4<f64>> {
    let (n, c, h, w) = x.dim();
    let (oh, ow) = geometry.output_size((h, w))?;
    let counts = window_counts(geometry, (h, w), (oh, ow));
    let mut out = Array4::zeros((n, c, oh, ow));
    for ni in 0..n {
        for ci in 0..c {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = 0.0;
                    for ki in 0..geometry.kernel {
                        let Some(iy) = source_index(oy, geometry.stride, ki, geometry.padding, h) else {
                            continue;
                        };
                        for kj in 0..geometry.kernel {
                            if let Some(ix) = source_index(ox, geometry.stride, kj, geometry.padding, w) {
                                acc += x[[ni, ci, iy, ix]];
                            }
                        }
                    }
                    out[[ni, ci, oy, ox]] = acc / counts[[oy, ox]];
                }
            }
        }
    }
    Ok(out)
}

pub fn avg_pool_backward(
    grad_out: ArrayView4<f64>,
    input_dim: (usize, usize, usize, usize),
    geometry: &PoolGeometry,
) -> Array4<f64> {
    let (n, c, h, w) = input_dim;
    let (_, _, oh, ow) = grad_out.dim();
    let counts = window_counts(geometry, (h, w), (oh, ow));
    let mut d_input = Array4::zeros(input_dim);
    for ni in 0..n {
        for ci in 0..c {
            for oy in 0..oh {
                for ox in 0..ow {
                    let g = grad_out[[ni, ci, oy, ox]] / counts[[oy, ox]];
                    for ki in 0..geometry.kernel {
                        let Some(iy) = source_index(oy, geometry.stride, ki, geometry.padding, h) else {
                            continue;
                        };
                        for kj in 0..geometry.kernel {
                            if let Some(ix) = source_index(ox, geometry.stride, kj, geometry.padding, w) {
                                d_input[[ni, ci, iy, ix]] += g;
                            }
                        }
                    }
                }
            }
        }
    }
    d_input
}

/// Row-wise softmax of a 2D array
pub fn softmax_rows(logits: ArrayView2<f64>) -> Array2<f64> {
    let mut out = logits.to_owned();
    for mut row in out.rows_mut() {
        let max_val = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|x| (x - max_val).exp());
        let sum = row.sum();
        row /= sum;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn ramp(shape: (usize, usize, usize, usize)) -> Array4<f64> {
        let len = shape.0 * shape.1 * shape.2 * shape.3;
        Array::linspace(-1.0, 1.0, len).into_shape_with_order(shape).unwrap()
    }

    #[test]
    fn test_output_size() {
        let geo = ConvGeometry { stride: (2, 2), padding: (1, 1), ..Default::default() };
        assert_eq!(geo.output_size((32, 32), (3, 3)).unwrap(), (16, 16));

        let dil = ConvGeometry { padding: (2, 2), dilation: (2, 2), ..Default::default() };
        assert_eq!(dil.output_size((8, 8), (3, 3)).unwrap(), (8, 8));

        assert!(ConvGeometry::default().output_size((2, 2), (3, 3)).is_err());
    }

    #[test]
    fn test_identity_kernel() {
        let x = ramp((2, 3, 4, 4));
        let mut w = Array4::zeros((3, 3, 1, 1));
        for c in 0..3 {
            w[[c, c, 0, 0]] = 1.0;
        }
        let y = conv2d_forward(x.view(), w.view(), &ConvGeometry::default()).unwrap();
        assert_eq!(y, x);
    }

    #[test]
    fn test_depthwise_conv_matches_direct_sum() {
        let x = ramp((1, 2, 5, 5));
        let w = Array4::from_elem((2, 1, 3, 3), 1.0);
        let geo = ConvGeometry { padding: (1, 1), groups: 2, ..Default::default() };
        let y = conv2d_forward(x.view(), w.view(), &geo).unwrap();
        // Centre element sees the full 3x3 neighbourhood of its own channel only
        let expected: f64 = x.slice(s![0, 1, 1..4, 1..4]).sum();
        assert!((y[[0, 1, 2, 2]] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_conv_backward_weight_matches_finite_difference() {
        let x = ramp((2, 2, 4, 4));
        let mut w = ramp((2, 2, 3, 3));
        let geo = ConvGeometry { stride: (2, 2), padding: (1, 1), ..Default::default() };
        let y = conv2d_forward(x.view(), w.view(), &geo).unwrap();
        let grad_out = Array4::from_elem(y.raw_dim(), 1.0);
        let (dx, dw) = conv2d_backward(x.view(), w.view(), grad_out.view(), &geo, true).unwrap();
        assert!(dx.is_some());

        let h = 1e-6;
        let idx = [1, 0, 2, 1];
        w[idx] += h;
        let plus = conv2d_forward(x.view(), w.view(), &geo).unwrap().sum();
        w[idx] -= 2.0 * h;
        let minus = conv2d_forward(x.view(), w.view(), &geo).unwrap().sum();
        let numeric = (plus - minus) / (2.0 * h);
        assert!((numeric - dw[idx]).abs() < 1e-6);
    }

    #[test]
    fn test_batch_norm_normalizes() {
        let x = ramp((2, 3, 2, 2));
        let out = batch_norm_forward(x.view(), None, NormStats::Batch, 1e-5).unwrap();
        for ch in 0..3 {
            let plane = out.output.index_axis(Axis(1), ch);
            assert!(plane.mean().unwrap().abs() < 1e-10);
        }
    }

    #[test]
    fn test_avg_pool_excludes_padding() {
        let x = Array4::from_elem((1, 1, 3, 3), 2.0);
        let y = avg_pool_forward(x.view(), &PoolGeometry::new(3, 1, 1)).unwrap();
        // Corner windows cover 4 real cells; the average stays at 2
        assert!((y[[0, 0, 0, 0]] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_max_pool_routes_gradient_to_argmax() {
        let x = ramp((1, 1, 4, 4));
        let geo = PoolGeometry::new(3, 2, 1);
        let (y, argmax) = max_pool_forward(x.view(), &geo).unwrap();
        assert_eq!(y.dim(), (1, 1, 2, 2));
        let grad = max_pool_backward(Array4::from_elem(y.raw_dim(), 1.0).view(), &argmax, x.dim());
        assert!((grad.sum() - 4.0).abs() < 1e-12);
        // Bottom-right element is the max of the last window
        assert!(grad[[0, 0, 3, 3]] >= 1.0);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let logits = ndarray::array![[1.0, 2.0, 3.0], [-5.0, 0.0, 5.0]];
        let probs = softmax_rows(logits.view());
        for row in probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
    }
}
