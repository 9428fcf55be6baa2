//! Task losses

use std::fmt::Debug;

use crate::autograd::{Tape, Var};
use crate::error::Result;

/// Scalar loss recorded on a tape from logits and class targets
pub trait Criterion: Debug + Send + Sync {
    fn loss(&self, tape: &mut Tape, logits: Var, targets: &[usize]) -> Result<Var>;

    fn name(&self) -> &str;
}

/// Mean cross entropy over the batch
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl Criterion for CrossEntropyLoss {
    fn loss(&self, tape: &mut Tape, logits: Var, targets: &[usize]) -> Result<Var> {
        tape.cross_entropy(logits, targets)
    }

    fn name(&self) -> &str {
        "cross_entropy"
    }
}
