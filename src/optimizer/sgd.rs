//! Stochastic gradient descent with momentum and L2 weight decay

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use super::WeightOptimizer;
use crate::error::{DartsError, Result};
use crate::nn::{ParamId, ParamStore};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.025,
            momentum: 0.9,
            weight_decay: 3e-4,
        }
    }
}

/// Momentum SGD.
///
/// `d = g + wd · p`, `buf = momentum · buf + d` (the first step sets
/// `buf = d`), `p -= lr · buf`.
#[derive(Debug, Clone)]
pub struct Sgd {
    config: SgdConfig,
    buffers: Vec<Option<ArrayD<f64>>>,
}

impl Sgd {
    pub fn new(config: SgdConfig) -> Self {
        Self {
            config,
            buffers: Vec::new(),
        }
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }
}

impl WeightOptimizer for Sgd {
    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    fn momentum(&self) -> f64 {
        self.config.momentum
    }

    fn weight_decay(&self) -> f64 {
        self.config.weight_decay
    }

    fn momentum_of(&self, id: ParamId) -> Option<&ArrayD<f64>> {
        self.buffers.get(id.index()).and_then(Option::as_ref)
    }

    fn step(&mut self, params: &mut ParamStore, grads: &[ArrayD<f64>]) -> Result<()> {
        if grads.len() != params.len() {
            return Err(DartsError::ParameterCount {
                expected: params.len(),
                actual: grads.len(),
            });
        }
        for (id, grad) in params.ids().zip(grads) {
            let p = params.get(id);
            if p.shape() != grad.shape() {
                return Err(DartsError::shape(
                    format!("{} {:?}", params.name(id), p.shape()),
                    format!("{:?}", grad.shape()),
                ));
            }
        }
        if self.buffers.len() < params.len() {
            self.buffers.resize(params.len(), None);
        }

        let SgdConfig {
            learning_rate: lr,
            momentum,
            weight_decay,
        } = self.config;
        let ids: Vec<ParamId> = params.ids().collect();
        for (id, grad) in ids.into_iter().zip(grads) {
            let p = params.get_mut(id);
            let mut d = grad.clone();
            if weight_decay != 0.0 {
                d.scaled_add(weight_decay, p);
            }
            if momentum != 0.0 {
                let slot = &mut self.buffers[id.index()];
                match slot {
                    Some(buf) => {
                        buf.mapv_inplace(|b| b * momentum);
                        *buf += &d;
                        d.assign(buf);
                    }
                    None => *slot = Some(d.clone()),
                }
            }
            p.scaled_add(-lr, &d);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn store() -> (ParamStore, ParamId) {
        let mut params = ParamStore::new();
        let id = params.register("w", array![1.0, -2.0].into_dyn());
        (params, id)
    }

    #[test]
    fn test_momentum_is_absent_before_first_step() {
        let (mut params, id) = store();
        let mut sgd = Sgd::new(SgdConfig {
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 0.0,
        });
        assert!(sgd.momentum_of(id).is_none());
        sgd.step(&mut params, &[array![1.0, 1.0].into_dyn()]).unwrap();
        assert_eq!(sgd.momentum_of(id).unwrap(), &array![1.0, 1.0].into_dyn());
        let p = params.get(id);
        assert!((p[[0]] - 0.9).abs() < 1e-12 && (p[[1]] + 2.1).abs() < 1e-12);
    }

    #[test]
    fn test_second_step_accumulates_momentum_and_decay() {
        let (mut params, id) = store();
        let mut sgd = Sgd::new(SgdConfig {
            learning_rate: 0.1,
            momentum: 0.5,
            weight_decay: 0.1,
        });
        let g = array![0.0, 0.0].into_dyn();
        sgd.step(&mut params, &[g.clone()]).unwrap();
        // buf = wd · p = [0.1, -0.2]; p = [0.99, -1.98]
        sgd.step(&mut params, &[g]).unwrap();
        // buf = 0.5 · [0.1, -0.2] + 0.1 · [0.99, -1.98]
        let buf = sgd.momentum_of(id).unwrap();
        assert!((buf[[0]] - 0.149).abs() < 1e-12);
        assert!((buf[[1]] + 0.298).abs() < 1e-12);
    }

    #[test]
    fn test_shape_mismatch_leaves_state_untouched() {
        let mut params = ParamStore::new();
        let first = params.register("a", array![1.0, 2.0].into_dyn());
        let second = params.register("b", array![3.0].into_dyn());
        let mut sgd = Sgd::new(SgdConfig::default());

        let grads = [array![0.5, 0.5].into_dyn(), array![0.5, 0.5].into_dyn()];
        assert!(sgd.step(&mut params, &grads).is_err());
        assert_eq!(params.get(first), &array![1.0, 2.0].into_dyn());
        assert_eq!(params.get(second), &array![3.0].into_dyn());
        assert!(sgd.momentum_of(first).is_none());
    }

    #[test]
    fn test_gradient_count_mismatch() {
        let (mut params, _) = store();
        let mut sgd = Sgd::new(SgdConfig::default());
        assert!(sgd.step(&mut params, &[]).is_err());
    }
}
