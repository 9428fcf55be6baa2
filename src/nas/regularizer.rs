//! Topology regularizer on the normal-cell architecture weights
//!
//! Each edge contributes `Σ sigmoid(α[e, :]) / w(e)` where the start weight
//! `w(e)` is 1 for edges leaving a cell input and `1 + sn_width · (j − 1)`
//! for edges leaving intermediate state `j`.

use ndarray::{Array1, ArrayView2};

use super::edges::{edges, num_edges};
use crate::autograd::{Tape, Var};
use crate::error::{DartsError, Result};

/// Start weight of every edge of a cell, in canonical order
pub fn start_weights(steps: usize, sn_width: f64) -> Array1<f64> {
    edges(steps)
        .map(|e| {
            if e.from_input() {
                1.0
            } else {
                1.0 + sn_width * (e.source as f64 - 1.0)
            }
        })
        .collect()
}

fn check_rows(rows: usize, steps: usize) -> Result<()> {
    let expected = num_edges(steps);
    if rows != expected {
        return Err(DartsError::shape(format!("{} edge rows", expected), format!("{}", rows)));
    }
    Ok(())
}

/// Record the regularizer on `tape` for the weight matrix `alphas`
pub fn penalty(tape: &mut Tape, alphas: Var, steps: usize, sn_width: f64) -> Result<Var> {
    let rows = tape.value(alphas).shape().first().copied().unwrap_or(0);
    check_rows(rows, steps)?;
    let activated = tape.sigmoid(alphas);
    tape.weighted_row_sum(activated, start_weights(steps, sn_width))
}

/// Regularizer value without recording a graph
pub fn value(alphas: ArrayView2<f64>, steps: usize, sn_width: f64) -> Result<f64> {
    check_rows(alphas.nrows(), steps)?;
    let weights = start_weights(steps, sn_width);
    Ok(alphas
        .rows()
        .into_iter()
        .zip(weights.iter())
        .map(|(row, &w)| row.mapv(|a| 1.0 / (1.0 + (-a).exp())).sum() / w)
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_start_weights() {
        let w = start_weights(4, 0.5);
        assert_eq!(w.len(), 14);
        // node 3: sources 0..5
        let last: Vec<f64> = w.iter().skip(9).copied().collect();
        assert_eq!(last, vec![1.0, 1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn test_zero_width_is_plain_sigmoid_sum() {
        let alphas = Array2::zeros((14, 8));
        let v = value(alphas.view(), 4, 0.0).unwrap();
        assert!((v - 14.0 * 8.0 * 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_tape_matches_value() {
        let alphas = Array2::from_shape_fn((14, 8), |(i, j)| (i as f64 * 0.1 - j as f64 * 0.07).sin());
        let mut tape = Tape::new();
        let a = tape.leaf(alphas.clone().into_dyn());
        let p = penalty(&mut tape, a, 4, 0.3).unwrap();
        let expected = value(alphas.view(), 4, 0.3).unwrap();
        assert!((tape.scalar(p).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_wrong_row_count() {
        let alphas = Array2::zeros((9, 8));
        assert!(value(alphas.view(), 4, 0.3).is_err());
    }
}
