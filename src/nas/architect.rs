//! Bilevel architecture optimization
//!
//! The [`Architect`] updates the architecture weights α against the
//! validation loss while the weights ω are trained elsewhere on the training
//! loss. The α gradient is either first order (validation loss at the current
//! ω) or second order: the validation loss at the weights after one simulated
//! SGD step, corrected by a finite-difference Hessian-vector product.

use ndarray::{Array1, Array2, ArrayD, ArrayView1};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::network::Network;
use crate::error::{DartsError, Result};
use crate::optimizer::{Adam, AdamConfig, WeightOptimizer};
use crate::search::Batch;

/// Architect hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchitectConfig {
    /// Adam learning rate for α
    pub arch_learning_rate: f64,
    /// L2 weight decay on α
    pub arch_weight_decay: f64,
    /// Adam betas for α
    pub arch_betas: (f64, f64),
    /// Momentum of the weight optimizer, replayed in the unrolled step
    pub momentum: f64,
    /// Weight decay of the weight optimizer, replayed in the unrolled step
    pub weight_decay: f64,
    /// Start-weight slope of the topology regularizer
    pub sn_width: f64,
    /// Scale of the regularizer in the validation objective
    pub r_rate: f64,
    /// Relative step of the Hessian-vector product
    pub finite_difference_radius: f64,
}

impl Default for ArchitectConfig {
    fn default() -> Self {
        Self {
            arch_learning_rate: 3e-4,
            arch_weight_decay: 1e-3,
            arch_betas: (0.5, 0.999),
            momentum: 0.9,
            weight_decay: 3e-4,
            sn_width: 0.3,
            r_rate: 1.0,
            finite_difference_radius: 1e-2,
        }
    }
}

impl ArchitectConfig {
    /// Copy momentum and weight decay from the weight optimizer
    pub fn mirroring(mut self, optimizer: &dyn WeightOptimizer) -> Self {
        self.momentum = optimizer.momentum();
        self.weight_decay = optimizer.weight_decay();
        self
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("arch_learning_rate", self.arch_learning_rate, self.arch_learning_rate > 0.0),
            ("arch_weight_decay", self.arch_weight_decay, self.arch_weight_decay >= 0.0),
            ("arch_betas.0", self.arch_betas.0, (0.0..1.0).contains(&self.arch_betas.0)),
            ("arch_betas.1", self.arch_betas.1, (0.0..1.0).contains(&self.arch_betas.1)),
            ("momentum", self.momentum, self.momentum >= 0.0),
            ("weight_decay", self.weight_decay, self.weight_decay >= 0.0),
            ("sn_width", self.sn_width, self.sn_width >= 0.0),
            ("r_rate", self.r_rate, self.r_rate.is_finite()),
            (
                "finite_difference_radius",
                self.finite_difference_radius,
                self.finite_difference_radius > 0.0,
            ),
        ];
        for (name, value, ok) in checks {
            if !ok || !value.is_finite() {
                return Err(DartsError::InvalidParameter {
                    name: name.to_string(),
                    value: value.to_string(),
                    reason: "out of range".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Outcome of one architecture step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Validation task loss (at the unrolled weights for second-order steps)
    pub loss: f64,
    /// Regularizer value added to the objective
    pub regularizer: f64,
    /// `loss + r_rate · regularizer`
    pub objective: f64,
    pub unrolled: bool,
    /// Set when the Hessian-vector correction was skipped for a zero vector
    pub hessian_skipped: bool,
    /// L2 norm of the α gradient handed to Adam
    pub grad_norm: f64,
}

/// Optimizer of the architecture weights
#[derive(Debug, Clone)]
pub struct Architect {
    config: ArchitectConfig,
    optimizer: Adam,
    reg: f64,
    rng: Xoshiro256PlusPlus,
}

fn flatten(tensors: &[ArrayD<f64>]) -> Array1<f64> {
    tensors.iter().flat_map(|t| t.iter().copied()).collect()
}

fn l2_norm<'a>(tensors: impl IntoIterator<Item = &'a ArrayD<f64>>) -> f64 {
    tensors
        .into_iter()
        .flat_map(|t| t.iter())
        .map(|v| v * v)
        .sum::<f64>()
        .sqrt()
}

impl Architect {
    /// `seed` drives the throwaway initialisation of unrolled models
    pub fn new(config: ArchitectConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let optimizer = Adam::new(AdamConfig {
            learning_rate: config.arch_learning_rate,
            beta1: config.arch_betas.0,
            beta2: config.arch_betas.1,
            eps: 1e-8,
            weight_decay: config.arch_weight_decay,
        });
        Ok(Self {
            config,
            optimizer,
            reg: 0.0,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        })
    }

    pub fn config(&self) -> &ArchitectConfig {
        &self.config
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// Regularizer value of the most recent step
    pub fn last_regularizer(&self) -> f64 {
        self.reg
    }

    /// One α update.
    ///
    /// Clears the stored α gradients, fills them from the first- or
    /// second-order objective and steps Adam. `eta` is the current weight
    /// learning rate. ω is left as it was on entry up to floating-point
    /// rounding from the perturbation sequence.
    pub fn step(
        &mut self,
        model: &mut Network,
        train: &Batch,
        valid: &Batch,
        eta: f64,
        optimizer: &dyn WeightOptimizer,
        unrolled: bool,
    ) -> Result<StepReport> {
        model.zero_arch_grads();
        let mut report = if unrolled {
            self.backward_step_unrolled(model, train, valid, eta, optimizer)?
        } else {
            self.backward_step(model, valid)?
        };

        let grads = match model.arch_grads() {
            [Some(normal), Some(reduce)] => [normal.clone(), reduce.clone()],
            _ => return Err(DartsError::Numerical("architecture gradients were not populated".to_string())),
        };
        report.grad_norm = grads.iter().flat_map(|g| g.iter()).map(|v| v * v).sum::<f64>().sqrt();
        if !report.grad_norm.is_finite() {
            return Err(DartsError::Numerical(format!("architecture gradient norm is {}", report.grad_norm)));
        }
        self.optimizer.step(&mut model.arch_parameters_mut(), &grads)?;

        debug!(
            loss = report.loss,
            regularizer = report.regularizer,
            grad_norm = report.grad_norm,
            unrolled,
            "architecture step"
        );
        Ok(report)
    }

    /// First order: differentiate `L_val(ω, α) + r_rate · reg(α)` at the current ω
    pub fn backward_step(&mut self, model: &mut Network, valid: &Batch) -> Result<StepReport> {
        let mut graph = model.loss(&valid.input, &valid.targets)?;
        let steps = model.config().steps;
        self.reg = graph.add_regularizer(self.config.r_rate, steps, self.config.sn_width)?;
        let grads = graph.backward()?;
        model.set_arch_grads(grads.alphas)?;
        Ok(StepReport {
            loss: graph.loss()?,
            regularizer: self.reg,
            objective: graph.objective()?,
            unrolled: false,
            hessian_skipped: false,
            grad_norm: 0.0,
        })
    }

    /// Second order: differentiate the validation objective at the unrolled
    /// weights ω' and subtract `eta` times the implicit term estimated at ω
    pub fn backward_step_unrolled(
        &mut self,
        model: &mut Network,
        train: &Batch,
        valid: &Batch,
        eta: f64,
        optimizer: &dyn WeightOptimizer,
    ) -> Result<StepReport> {
        let (grads, loss, objective) = {
            let mut unrolled_model = self.unrolled_model(model, train, eta, optimizer)?;
            let mut graph = unrolled_model.loss(&valid.input, &valid.targets)?;
            let steps = unrolled_model.config().steps;
            self.reg = graph.add_regularizer(self.config.r_rate, steps, self.config.sn_width)?;
            (graph.backward()?, graph.loss()?, graph.objective()?)
        };

        let [mut d_normal, mut d_reduce] = grads.alphas;
        let implicit = self.hessian_vector_product(model, &grads.weights, train)?;
        let hessian_skipped = implicit.is_none();
        if let Some([ig_normal, ig_reduce]) = implicit {
            d_normal.scaled_add(-eta, &ig_normal);
            d_reduce.scaled_add(-eta, &ig_reduce);
        }
        model.set_arch_grads([d_normal, d_reduce])?;

        Ok(StepReport {
            loss,
            regularizer: self.reg,
            objective,
            unrolled: true,
            hessian_skipped,
            grad_norm: 0.0,
        })
    }

    /// Copy of `model` after one simulated weight-optimizer step on `train`:
    /// `ω' = ω − eta · (momentum · buf + ∇L_train + wd · ω)`.
    /// A parameter without a momentum buffer contributes zero momentum.
    pub fn unrolled_model(
        &mut self,
        model: &mut Network,
        train: &Batch,
        eta: f64,
        optimizer: &dyn WeightOptimizer,
    ) -> Result<Network> {
        let grads = model.loss(&train.input, &train.targets)?.backward()?;
        let theta = model.parameters().flatten();

        let mut moment = Vec::with_capacity(theta.len());
        for id in model.parameters().ids() {
            let param = model.parameters().get(id);
            match optimizer.momentum_of(id) {
                Some(buf) if buf.shape() == param.shape() => {
                    moment.extend(buf.iter().map(|b| b * self.config.momentum));
                }
                Some(buf) => {
                    return Err(DartsError::shape(
                        format!("momentum for {} {:?}", model.parameters().name(id), param.shape()),
                        format!("{:?}", buf.shape()),
                    ));
                }
                None => moment.extend(std::iter::repeat(0.0).take(param.len())),
            }
        }
        let moment = Array1::from_vec(moment);

        let mut dtheta = flatten(&grads.weights);
        dtheta.scaled_add(self.config.weight_decay, &theta);
        let unrolled = &theta - &((&moment + &dtheta) * eta);
        self.construct_model_from_theta(model, unrolled.view())
    }

    /// A network with `model`'s hyperparameters, α and running statistics and
    /// weights loaded from the flat vector `theta`
    pub fn construct_model_from_theta(&mut self, model: &Network, theta: ArrayView1<f64>) -> Result<Network> {
        let mut model_new = model.scaffold(&mut self.rng)?;
        model_new.load_buffers(model.buffers())?;
        model_new.parameters_mut().load_flat(theta)?;
        Ok(model_new)
    }

    /// Central-difference estimate of `∇_α (∇_ω L_train(ω, α) · v)` at the
    /// current weights.
    ///
    /// The weights are shifted in place by `+R·v`, `−2R·v`, `+R·v` with
    /// `R = radius / ‖v‖`. Returns `None` (and leaves ω untouched) when `‖v‖`
    /// is too small to divide by; a non-finite `‖v‖` is an error.
    pub fn hessian_vector_product(
        &self,
        model: &mut Network,
        vector: &[ArrayD<f64>],
        train: &Batch,
    ) -> Result<Option<[Array2<f64>; 2]>> {
        let norm = l2_norm(vector);
        if !norm.is_finite() {
            return Err(DartsError::Numerical(format!("Hessian-vector product with vector norm {}", norm)));
        }
        if norm < f64::MIN_POSITIVE {
            warn!(norm, "zero weight-gradient vector, skipping the implicit gradient correction");
            return Ok(None);
        }
        let r = self.config.finite_difference_radius / norm;
        if !r.is_finite() {
            return Err(DartsError::Numerical(format!("finite-difference radius {} is not finite", r)));
        }

        let train_alpha_grads = |model: &mut Network| -> Result<[Array2<f64>; 2]> {
            Ok(model.loss(&train.input, &train.targets)?.backward()?.alphas)
        };

        model.parameters_mut().axpy(r, vector)?;
        let grads_p = match train_alpha_grads(model) {
            Ok(g) => g,
            Err(e) => {
                model.parameters_mut().axpy(-r, vector)?;
                return Err(e);
            }
        };
        model.parameters_mut().axpy(-2.0 * r, vector)?;
        let grads_n = match train_alpha_grads(model) {
            Ok(g) => g,
            Err(e) => {
                model.parameters_mut().axpy(r, vector)?;
                return Err(e);
            }
        };
        model.parameters_mut().axpy(r, vector)?;

        let [p_normal, p_reduce] = grads_p;
        let [n_normal, n_reduce] = grads_n;
        let scale = 1.0 / (2.0 * r);
        Ok(Some([(p_normal - n_normal) * scale, (p_reduce - n_reduce) * scale]))
    }
}
