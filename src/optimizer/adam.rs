//! Adam over the architecture weights

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{DartsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// L2 penalty added to the gradient before the moment updates
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            beta1: 0.5,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 1e-3,
        }
    }
}

#[derive(Debug, Clone)]
struct Moments {
    m: Array2<f64>,
    v: Array2<f64>,
}

/// Bias-corrected Adam with coupled L2 weight decay
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    moments: Vec<Moments>,
    step: u32,
}

impl Adam {
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            moments: Vec::new(),
            step: 0,
        }
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Updates taken so far
    pub fn steps(&self) -> u32 {
        self.step
    }

    /// Update every tensor in `params` with the gradient at the same position
    pub fn step(&mut self, params: &mut [&mut Array2<f64>], grads: &[Array2<f64>]) -> Result<()> {
        if params.len() != grads.len() {
            return Err(DartsError::ParameterCount {
                expected: params.len(),
                actual: grads.len(),
            });
        }
        if let Some((p, g)) = params.iter().zip(grads).find(|(p, g)| p.dim() != g.dim()) {
            return Err(DartsError::shape(format!("{:?}", p.dim()), format!("{:?}", g.dim())));
        }
        if self.moments.is_empty() {
            self.moments = params
                .iter()
                .map(|p| Moments {
                    m: Array2::zeros(p.dim()),
                    v: Array2::zeros(p.dim()),
                })
                .collect();
        }

        let c = self.config;
        self.step += 1;
        let t = self.step as i32;
        let bias1 = 1.0 - c.beta1.powi(t);
        let bias2_sqrt = (1.0 - c.beta2.powi(t)).sqrt();
        let step_size = c.learning_rate / bias1;

        for ((p, g), state) in params.iter_mut().zip(grads).zip(self.moments.iter_mut()) {
            let mut grad = g.clone();
            if c.weight_decay != 0.0 {
                grad.scaled_add(c.weight_decay, p);
            }
            state.m.zip_mut_with(&grad, |m, &g| *m = c.beta1 * *m + (1.0 - c.beta1) * g);
            state.v.zip_mut_with(&grad, |v, &g| *v = c.beta2 * *v + (1.0 - c.beta2) * g * g);
            ndarray::Zip::from(&mut **p)
                .and(&state.m)
                .and(&state.v)
                .for_each(|p, &m, &v| *p -= step_size * m / (v.sqrt() / bias2_sqrt + c.eps));
        }
        Ok(())
    }
}
