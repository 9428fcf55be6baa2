//! Named parameter and buffer storage
//!
//! Parameters are kept in registration order. That order is the model's
//! `named_parameters` order and defines the layout of the flat weight vector
//! used when reconstructing an unrolled model.

use ndarray::{Array1, ArrayD, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{DartsError, Result};

/// Index of a learnable tensor in a [`ParamStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(usize);

impl ParamId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Ordered collection of learnable tensors
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    names: Vec<String>,
    values: Vec<ArrayD<f64>>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tensor and return its id
    pub fn register(&mut self, name: impl Into<String>, value: ArrayD<f64>) -> ParamId {
        self.names.push(name.into());
        self.values.push(value);
        ParamId(self.values.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, id: ParamId) -> &ArrayD<f64> {
        &self.values[id.0]
    }

    pub fn get_mut(&mut self, id: ParamId) -> &mut ArrayD<f64> {
        &mut self.values[id.0]
    }

    pub fn name(&self, id: ParamId) -> &str {
        &self.names[id.0]
    }

    pub fn ids(&self) -> impl Iterator<Item = ParamId> {
        (0..self.values.len()).map(ParamId)
    }

    pub fn values(&self) -> &[ArrayD<f64>] {
        &self.values
    }

    /// `(name, tensor)` pairs in registration order
    pub fn named_parameters(&self) -> impl Iterator<Item = (&str, &ArrayD<f64>)> {
        self.names.iter().map(String::as_str).zip(self.values.iter())
    }

    /// Total number of scalar weights
    pub fn numel(&self) -> usize {
        self.values.iter().map(ArrayD::len).sum()
    }

    /// Concatenate every tensor, row-major, in registration order
    pub fn flatten(&self) -> Array1<f64> {
        let mut flat = Vec::with_capacity(self.numel());
        for value in &self.values {
            flat.extend(value.iter().copied());
        }
        Array1::from_vec(flat)
    }

    /// Overwrite every tensor from a flat vector produced by [`ParamStore::flatten`].
    /// The vector length must match exactly.
    pub fn load_flat(&mut self, theta: ArrayView1<f64>) -> Result<()> {
        let expected = self.numel();
        if theta.len() != expected {
            return Err(DartsError::ParameterCount { expected, actual: theta.len() });
        }
        let mut offset = 0;
        for value in self.values.iter_mut() {
            let len = value.len();
            let chunk = theta.slice(ndarray::s![offset..offset + len]);
            let reshaped = chunk.to_owned().into_shape_with_order(value.raw_dim())?;
            *value = reshaped;
            offset += len;
        }
        debug_assert_eq!(offset, expected);
        Ok(())
    }

    /// `p += alpha * direction[p]` for every tensor, in place
    pub fn axpy(&mut self, alpha: f64, direction: &[ArrayD<f64>]) -> Result<()> {
        if direction.len() != self.values.len() {
            return Err(DartsError::ParameterCount { expected: self.values.len(), actual: direction.len() });
        }
        if let Some((value, d)) = self.values.iter().zip(direction).find(|(v, d)| v.shape() != d.shape()) {
            return Err(DartsError::shape(format!("{:?}", value.shape()), format!("{:?}", d.shape())));
        }
        for (value, d) in self.values.iter_mut().zip(direction) {
            value.scaled_add(alpha, d);
        }
        Ok(())
    }
}

/// Index of a non-learnable tensor in a [`BufferStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(usize);

/// Ordered collection of non-learnable state (batch norm running statistics)
#[derive(Debug, Clone, Default)]
pub struct BufferStore {
    names: Vec<String>,
    values: Vec<Array1<f64>>,
}

impl BufferStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, value: Array1<f64>) -> BufferId {
        self.names.push(name.into());
        self.values.push(value);
        BufferId(self.values.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, id: BufferId) -> &Array1<f64> {
        &self.values[id.0]
    }

    pub fn get_mut(&mut self, id: BufferId) -> &mut Array1<f64> {
        &mut self.values[id.0]
    }

    pub fn named_buffers(&self) -> impl Iterator<Item = (&str, &Array1<f64>)> {
        self.names.iter().map(String::as_str).zip(self.values.iter())
    }

    /// Copy every buffer from a store with the same layout
    pub fn copy_from(&mut self, other: &BufferStore) -> Result<()> {
        if self.names != other.names {
            return Err(DartsError::shape(
                format!("{} buffers", self.names.len()),
                format!("{} buffers with a different layout", other.names.len()),
            ));
        }
        for (dst, src) in self.values.iter_mut().zip(&other.values) {
            dst.assign(src);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    fn store() -> ParamStore {
        let mut store = ParamStore::new();
        store.register("conv.weight", Array::linspace(0.0, 1.0, 8).into_shape_with_order((2, 1, 2, 2)).unwrap().into_dyn());
        store.register("fc.bias", array![-1.0, 2.0, 3.5].into_dyn());
        store
    }

    #[test]
    fn test_flatten_round_trip_is_exact() {
        let original = store();
        let theta = original.flatten();
        assert_eq!(theta.len(), 11);

        let mut restored = store();
        restored.get_mut(ParamId(0)).fill(0.0);
        restored.load_flat(theta.view()).unwrap();
        assert_eq!(restored.values(), original.values());
    }

    #[test]
    fn test_load_flat_rejects_wrong_length() {
        let mut s = store();
        let short = Array1::zeros(10);
        let err = s.load_flat(short.view()).unwrap_err();
        assert!(matches!(err, DartsError::ParameterCount { expected: 11, actual: 10 }));
    }

    #[test]
    fn test_axpy_round_trip() {
        let mut s = store();
        let before = s.flatten();
        let direction: Vec<ArrayD<f64>> = s.values().iter().map(|v| v.mapv(|x| x + 0.5)).collect();
        s.axpy(0.25, &direction).unwrap();
        s.axpy(-0.25, &direction).unwrap();
        for (a, b) in s.flatten().iter().zip(before.iter()) {
            assert!((a - b).abs() < 1e-15);
        }
    }

    #[test]
    fn test_named_parameters_order() {
        let s = store();
        let names: Vec<&str> = s.named_parameters().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["conv.weight", "fc.bias"]);
    }
}
