//! Architecture search loop
//!
//! Each epoch anneals the weight learning rate, then for every training
//! batch takes one architecture step against a validation batch followed by
//! one clipped SGD step on the weights.

mod data;

pub use data::{Batch, Dataset};

use std::path::Path;
use std::sync::Arc;

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DartsError, Result};
use crate::nas::{Architect, ArchitectConfig, CrossEntropyLoss, Genotype, Network, NetworkConfig};
use crate::optimizer::{clip_grad_norm, CosineAnnealing, Sgd, SgdConfig, WeightOptimizer};

/// Search hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub network: NetworkConfig,
    pub architect: ArchitectConfig,
    /// Initial weight learning rate
    pub learning_rate: f64,
    /// Final weight learning rate of the cosine schedule
    pub learning_rate_min: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub epochs: usize,
    pub batch_size: usize,
    /// Max global L2 norm of the weight gradients
    pub grad_clip: f64,
    /// Fraction of the data used for weights; the rest drives α
    pub train_portion: f64,
    /// Second-order architecture gradients
    pub unrolled: bool,
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            architect: ArchitectConfig::default(),
            learning_rate: 0.025,
            learning_rate_min: 0.001,
            momentum: 0.9,
            weight_decay: 3e-4,
            epochs: 50,
            batch_size: 64,
            grad_clip: 5.0,
            train_portion: 0.5,
            unrolled: false,
            seed: 2,
        }
    }
}

impl SearchConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.network.validate()?;
        self.architect.validate()?;
        if !(self.learning_rate > 0.0 && self.learning_rate_min >= 0.0 && self.learning_rate_min <= self.learning_rate) {
            return Err(DartsError::ConfigError(format!(
                "learning rate schedule {} -> {} is invalid",
                self.learning_rate, self.learning_rate_min
            )));
        }
        if self.batch_size == 0 {
            return Err(DartsError::ConfigError("batch_size must be positive".to_string()));
        }
        if !(self.grad_clip > 0.0) {
            return Err(DartsError::ConfigError(format!("grad_clip must be positive, got {}", self.grad_clip)));
        }
        if !(self.train_portion > 0.0 && self.train_portion < 1.0) {
            return Err(DartsError::ConfigError(format!(
                "train_portion must lie strictly between 0 and 1, got {}",
                self.train_portion
            )));
        }
        Ok(())
    }

    fn sgd(&self) -> SgdConfig {
        SgdConfig {
            learning_rate: self.learning_rate,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
        }
    }
}

/// Summary of one search epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub valid_loss: f64,
    pub valid_accuracy: f64,
    /// Regularizer of the last architecture step
    pub regularizer: f64,
    /// Genotype at the start of the epoch
    pub genotype: Genotype,
}

/// Runs a DARTS search over an in-memory dataset
#[derive(Debug)]
pub struct Searcher {
    config: SearchConfig,
    model: Network,
    architect: Architect,
    optimizer: Sgd,
    schedule: CosineAnnealing,
    rng: Xoshiro256PlusPlus,
    history: Vec<EpochReport>,
}

impl Searcher {
    pub fn new(config: SearchConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(config.seed);
        let model = Network::new(config.network.clone(), Arc::new(CrossEntropyLoss), &mut rng)?;
        let optimizer = Sgd::new(config.sgd());
        let architect = Architect::new(config.architect.clone().mirroring(&optimizer), config.seed.wrapping_add(1))?;
        let schedule = CosineAnnealing::new(config.learning_rate, config.learning_rate_min, config.epochs);
        info!(
            parameters = model.parameters().numel(),
            cells = model.cells().len(),
            unrolled = config.unrolled,
            "search network ready"
        );
        Ok(Self {
            config,
            model,
            architect,
            optimizer,
            schedule,
            rng,
            history: Vec::new(),
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn model(&self) -> &Network {
        &self.model
    }

    pub fn architect(&self) -> &Architect {
        &self.architect
    }

    pub fn history(&self) -> &[EpochReport] {
        &self.history
    }

    /// Genotype recorded at the start of every epoch so far
    pub fn genotype_history(&self) -> Vec<Genotype> {
        self.history.iter().map(|r| r.genotype.clone()).collect()
    }

    /// Split `data`, run every epoch and return the final genotype
    pub fn run(&mut self, data: &Dataset) -> Result<Genotype> {
        let (train, valid) = data.split(self.config.train_portion)?;
        if train.is_empty() || valid.is_empty() {
            return Err(DartsError::InvalidInput(format!(
                "{} samples are too few to split at {}",
                data.len(),
                self.config.train_portion
            )));
        }
        for epoch in 0..self.config.epochs {
            self.train_epoch(epoch, &train, &valid)?;
        }
        let genotype = self.model.genotype()?;
        info!(%genotype, "search finished");
        Ok(genotype)
    }

    /// One epoch of alternating architecture and weight updates
    pub fn train_epoch(&mut self, epoch: usize, train: &Dataset, valid: &Dataset) -> Result<EpochReport> {
        let lr = self.schedule.lr_at(epoch);
        self.optimizer.set_learning_rate(lr);
        let genotype = self.model.genotype()?;
        info!(epoch, lr, %genotype, "epoch start");

        self.model.train();
        let train_batches = train.batches(self.config.batch_size, &mut self.rng)?;
        let valid_batches = valid.batches(self.config.batch_size, &mut self.rng)?;
        if valid_batches.is_empty() {
            return Err(DartsError::InvalidInput("empty validation split".to_string()));
        }

        let (mut loss_sum, mut correct, mut seen) = (0.0, 0.0, 0usize);
        for (step, batch) in train_batches.iter().enumerate() {
            let valid_batch = &valid_batches[step % valid_batches.len()];
            self.architect.step(
                &mut self.model,
                batch,
                valid_batch,
                lr,
                &self.optimizer,
                self.config.unrolled,
            )?;

            let graph = self.model.loss(&batch.input, &batch.targets)?;
            let mut grads = graph.backward()?;
            let norm = clip_grad_norm(&mut grads.weights, self.config.grad_clip);
            self.optimizer.step(self.model.parameters_mut(), &grads.weights)?;

            let n = batch.len();
            loss_sum += graph.loss()? * n as f64;
            correct += graph.accuracy()? * n as f64;
            seen += n;
            debug!(epoch, step, loss = graph.loss()?, grad_norm = norm, "weight step");
        }

        let (valid_loss, valid_accuracy) = self.evaluate(&valid_batches)?;
        let seen = seen.max(1) as f64;
        let report = EpochReport {
            epoch,
            learning_rate: lr,
            train_loss: loss_sum / seen,
            train_accuracy: correct / seen,
            valid_loss,
            valid_accuracy,
            regularizer: self.architect.last_regularizer(),
            genotype,
        };
        info!(
            epoch,
            train_loss = report.train_loss,
            train_acc = report.train_accuracy,
            valid_loss,
            valid_acc = valid_accuracy,
            reg = report.regularizer,
            "epoch done"
        );
        self.history.push(report.clone());
        Ok(report)
    }

    /// Mean loss and accuracy in evaluation mode
    fn evaluate(&mut self, batches: &[Batch]) -> Result<(f64, f64)> {
        self.model.eval();
        let outcome = (|| -> Result<(f64, f64)> {
            let (mut loss, mut correct, mut seen) = (0.0, 0.0, 0usize);
            for batch in batches {
                let graph = self.model.loss(&batch.input, &batch.targets)?;
                loss += graph.loss()? * batch.len() as f64;
                correct += graph.accuracy()? * batch.len() as f64;
                seen += batch.len();
            }
            let seen = seen.max(1) as f64;
            Ok((loss / seen, correct / seen))
        })();
        self.model.train();
        outcome
    }
}
