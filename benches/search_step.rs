use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use deeper_darts::nas::{Architect, ArchitectConfig, CrossEntropyLoss, Network, NetworkConfig};
use deeper_darts::optimizer::{Sgd, SgdConfig, WeightOptimizer};
use deeper_darts::search::Batch;
use ndarray::Array4;
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::Arc;

fn create_batch(n: usize, size: usize, classes: usize, rng: &mut impl Rng) -> Batch {
    let input = Array4::from_shape_simple_fn((n, 3, size, size), || rng.gen::<f64>() - 0.5);
    let targets = (0..n).map(|_| rng.gen_range(0..classes)).collect();
    Batch::new(input, targets).unwrap()
}

fn create_network(rng: &mut impl Rng) -> Network {
    let config = NetworkConfig {
        init_channels: 4,
        layers: 3,
        ..Default::default()
    };
    Network::new(config, Arc::new(CrossEntropyLoss), rng).unwrap()
}

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");
    group.sample_size(10);

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
    let mut model = create_network(&mut rng);

    for size in [8, 16].iter() {
        let batch = create_batch(4, *size, 10, &mut rng);
        group.bench_with_input(BenchmarkId::new("loss_backward", size), &batch, |b, batch| {
            b.iter(|| {
                let graph = model.loss(black_box(&batch.input), &batch.targets).unwrap();
                graph.backward().unwrap()
            })
        });
    }

    group.finish();
}

fn bench_architect(c: &mut Criterion) {
    let mut group = c.benchmark_group("architect_step");
    group.sample_size(10);

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
    let mut model = create_network(&mut rng);
    let train = create_batch(4, 8, 10, &mut rng);
    let valid = create_batch(4, 8, 10, &mut rng);
    let optimizer = Sgd::new(SgdConfig::default());
    let mut architect = Architect::new(ArchitectConfig::default().mirroring(&optimizer), 2).unwrap();

    for unrolled in [false, true].iter() {
        let label = if *unrolled { "second_order" } else { "first_order" };
        group.bench_function(label, |b| {
            b.iter(|| {
                architect
                    .step(&mut model, &train, &valid, optimizer.learning_rate(), &optimizer, *unrolled)
                    .unwrap()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_forward, bench_architect);
criterion_main!(benches);
