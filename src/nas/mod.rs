//! Differentiable architecture search
//!
//! Provides the DARTS search space and bilevel optimizer:
//! - Candidate operation catalog and per-edge mixed ops
//! - Search cells and the weight-sharing supernet
//! - First- and second-order architecture gradients
//! - Topology regularizer on the normal cell
//! - Genotype extraction and its text/JSON forms

mod architect;
mod cell;
mod criterion;
pub mod edges;
mod genotype;
mod mixed_op;
mod network;
pub mod operations;
pub mod regularizer;

pub use architect::{Architect, ArchitectConfig, StepReport};
pub use cell::{Cell, CellShape};
pub use criterion::{Criterion, CrossEntropyLoss};
pub use genotype::{concat_indices, parse_cell, Genotype, EDGES_PER_NODE};
pub use mixed_op::MixedOp;
pub use network::{ArchitectureWeights, GraphGradients, LossGraph, Network, NetworkConfig, INPUT_CHANNELS};
pub use operations::{CandidateOp, Primitive};
