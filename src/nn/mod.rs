//! Neural network building blocks
//!
//! Layers own [`ParamId`]s/[`BufferId`]s into the model's stores rather than
//! tensors. A [`Forward`] pass snapshots every parameter onto a fresh tape,
//! so one model value can be evaluated, perturbed and re-evaluated freely.

mod layers;
mod params;

pub use layers::{BatchNorm2d, Conv2d, ConvSpec, Linear};
pub use params::{BufferId, BufferStore, ParamId, ParamStore};

use crate::autograd::{Tape, Var};

/// State of one forward pass: the tape being recorded, the tape handle of
/// every parameter, and mutable access to running statistics
pub struct Forward<'a> {
    pub tape: Tape,
    params: Vec<Var>,
    buffers: &'a mut BufferStore,
    training: bool,
}

impl<'a> Forward<'a> {
    /// Start a pass with every parameter registered as a tape leaf
    pub fn new(params: &ParamStore, buffers: &'a mut BufferStore, training: bool) -> Self {
        let mut tape = Tape::new();
        let vars = params.values().iter().map(|p| tape.leaf(p.clone())).collect();
        Self { tape, params: vars, buffers, training }
    }

    pub fn param(&self, id: ParamId) -> Var {
        self.params[id.index()]
    }

    /// Tape handles of all parameters, in registration order
    pub fn param_vars(&self) -> &[Var] {
        &self.params
    }

    pub fn training(&self) -> bool {
        self.training
    }

    pub fn buffers(&self) -> &BufferStore {
        self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut BufferStore {
        self.buffers
    }

    /// Finish the pass, keeping the tape and parameter handles
    pub fn finish(self) -> (Tape, Vec<Var>) {
        (self.tape, self.params)
    }
}
