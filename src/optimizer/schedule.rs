//! Learning-rate schedule and gradient clipping

use std::f64::consts::PI;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Cosine annealing from `lr_max` at epoch 0 to `lr_min` at `t_max`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CosineAnnealing {
    pub lr_max: f64,
    pub lr_min: f64,
    pub t_max: usize,
}

impl CosineAnnealing {
    pub fn new(lr_max: f64, lr_min: f64, t_max: usize) -> Self {
        Self { lr_max, lr_min, t_max }
    }

    pub fn lr_at(&self, epoch: usize) -> f64 {
        if self.t_max == 0 {
            return self.lr_min;
        }
        let progress = epoch.min(self.t_max) as f64 / self.t_max as f64;
        self.lr_min + 0.5 * (self.lr_max - self.lr_min) * (1.0 + (PI * progress).cos())
    }
}

/// Scale `grads` so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut [ArrayD<f64>], max_norm: f64) -> f64 {
    let total = grads
        .iter()
        .flat_map(|g| g.iter())
        .map(|v| v * v)
        .sum::<f64>()
        .sqrt();
    let coef = max_norm / (total + 1e-6);
    if coef < 1.0 {
        for g in grads.iter_mut() {
            g.mapv_inplace(|v| v * coef);
        }
    }
    total
}
