//! Integration tests for the search network: construction, architecture
//! weights and weight reloading

use std::sync::Arc;

use deeper_darts::nas::{Architect, ArchitectConfig, CrossEntropyLoss, Network, NetworkConfig, Primitive};
use ndarray::{Array4, Axis};
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use rand_xoshiro::Xoshiro256PlusPlus;

fn small_darts() -> NetworkConfig {
    NetworkConfig {
        init_channels: 2,
        num_classes: 10,
        layers: 3,
        ..Default::default()
    }
}

fn images(n: usize, size: usize, seed: u64) -> Array4<f64> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    Array4::from_shape_simple_fn((n, 3, size, size), || StandardNormal.sample(&mut rng))
}

#[test]
fn test_default_cell_has_fourteen_edges() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
    let model = Network::new(small_darts(), Arc::new(CrossEntropyLoss), &mut rng).unwrap();

    let [normal, reduce] = model.arch_parameters();
    assert_eq!(normal.dim(), (14, 8));
    assert_eq!(reduce.dim(), (14, 8));
    assert!(normal.iter().all(|a| a.abs() < 1e-2));

    let genotype = model.genotype().unwrap();
    assert_eq!(genotype.normal.len(), 8);
    assert_eq!(genotype.reduce.len(), 8);
    assert_eq!(genotype.normal_concat, vec![2, 3, 4, 5]);
    assert_eq!(genotype.reduce_concat, vec![2, 3, 4, 5]);
}

#[test]
fn test_reduction_cells_sit_at_thirds() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(2);
    let config = NetworkConfig {
        layers: 6,
        steps: 1,
        multiplier: 1,
        ..small_darts()
    };
    let model = Network::new(config, Arc::new(CrossEntropyLoss), &mut rng).unwrap();
    let reductions: Vec<usize> = model
        .cells()
        .iter()
        .enumerate()
        .filter(|(_, cell)| cell.is_reduction())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(reductions, vec![2, 4]);
}

#[test]
fn test_softmax_rows_sum_to_one() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
    let model = Network::new(small_darts(), Arc::new(CrossEntropyLoss), &mut rng).unwrap();
    for probs in [model.architecture().normal_probs(), model.architecture().reduce_probs()] {
        for total in probs.sum_axis(Axis(1)).iter() {
            assert!((total - 1.0).abs() < 1e-12);
        }
        assert!(probs.iter().all(|&p| p > 0.0));
    }
}

#[test]
fn test_forward_shape() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(4);
    let mut model = Network::new(small_darts(), Arc::new(CrossEntropyLoss), &mut rng).unwrap();
    let logits = model.forward(&images(2, 8, 5)).unwrap();
    assert_eq!(logits.dim(), (2, 10));
    assert!(logits.iter().all(|v| v.is_finite()));
}

#[test]
fn test_wrong_input_channels_is_rejected() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(6);
    let mut model = Network::new(small_darts(), Arc::new(CrossEntropyLoss), &mut rng).unwrap();
    let input = Array4::<f64>::zeros((1, 1, 8, 8));
    assert!(model.forward(&input).is_err());
}

#[test]
fn test_reloaded_weights_reproduce_outputs() {
    let config = NetworkConfig {
        primitives: vec![Primitive::SkipConnect, Primitive::AvgPool3x3, Primitive::SepConv3x3, Primitive::DilConv3x3],
        steps: 2,
        multiplier: 2,
        ..small_darts()
    };
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
    let mut model = Network::new(config, Arc::new(CrossEntropyLoss), &mut rng).unwrap();
    let input = images(2, 8, 8);

    // populate running statistics before switching to eval mode
    model.forward(&input).unwrap();
    model.eval();
    let expected = model.forward(&input).unwrap();

    let mut architect = Architect::new(ArchitectConfig::default(), 9).unwrap();
    let theta = model.parameters().flatten();
    let mut copy = architect.construct_model_from_theta(&model, theta.view()).unwrap();
    assert!(!copy.is_training());
    assert_eq!(copy.architecture(), model.architecture());
    assert_eq!(copy.parameters().flatten(), theta);
    assert_eq!(copy.forward(&input).unwrap(), expected);
}

#[test]
fn test_load_flat_rejects_wrong_length() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(10);
    let mut model = Network::new(small_darts(), Arc::new(CrossEntropyLoss), &mut rng).unwrap();
    let mut theta = model.parameters().flatten().to_vec();
    theta.pop();
    let theta = ndarray::Array1::from_vec(theta);
    assert!(model.parameters_mut().load_flat(theta.view()).is_err());
}
