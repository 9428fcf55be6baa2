//! Deeper DARTS - Differentiable architecture search
//!
//! This crate searches convolutional cell architectures by gradient descent
//! over a continuous relaxation of the choice of operation on every edge,
//! with a regularizer that favours information flow from the cell inputs.
//!
//! # Modules
//!
//! ## Search
//! - [`nas`] - Operation catalog, cells, supernet, architect, genotypes
//! - [`search`] - Epoch loop, datasets and search configuration
//!
//! ## Numerics
//! - [`autograd`] - Reverse-mode tape over `ndarray` tensors
//! - [`nn`] - Parameter stores and convolution/batch-norm/linear layers
//! - [`optimizer`] - SGD, Adam, cosine schedule, gradient clipping
//!
//! ## Services
//! - [`cli`] - Command-line interface

// Core error handling
pub mod error;

// Numerics
pub mod autograd;
pub mod nn;
pub mod optimizer;

// Search
pub mod nas;
pub mod search;

// Services
pub mod cli;

pub use error::{DartsError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{DartsError, Result};

    // Architecture search
    pub use crate::nas::{
        Architect, ArchitectConfig, ArchitectureWeights, Criterion, CrossEntropyLoss, Genotype, Network,
        NetworkConfig, Primitive, StepReport,
    };

    // Optimizers
    pub use crate::optimizer::{Adam, AdamConfig, CosineAnnealing, Sgd, SgdConfig, WeightOptimizer};

    // Search loop
    pub use crate::search::{Batch, Dataset, EpochReport, SearchConfig, Searcher};
}
