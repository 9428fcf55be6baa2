//! Optimizers for network weights and architecture weights
//!
//! - [`Sgd`]: momentum SGD for the network weights
//! - [`Adam`]: the architecture-weight optimizer
//! - [`CosineAnnealing`] and [`clip_grad_norm`] for the search loop

mod adam;
mod schedule;
mod sgd;

pub use adam::{Adam, AdamConfig};
pub use schedule::{clip_grad_norm, CosineAnnealing};
pub use sgd::{Sgd, SgdConfig};

use ndarray::ArrayD;

use crate::error::Result;
use crate::nn::{ParamId, ParamStore};

/// Optimizer of the network weights.
///
/// Besides stepping, it exposes the state the unrolled architecture step
/// needs to replay an update analytically: the hyperparameters and each
/// parameter's momentum buffer.
pub trait WeightOptimizer {
    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn momentum(&self) -> f64;

    fn weight_decay(&self) -> f64;

    /// Momentum buffer of `id`, `None` until that parameter has been stepped
    fn momentum_of(&self, id: ParamId) -> Option<&ArrayD<f64>>;

    /// Apply one update with `grads` in `named_parameters` order
    fn step(&mut self, params: &mut ParamStore, grads: &[ArrayD<f64>]) -> Result<()>;
}
