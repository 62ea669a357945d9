use burn_core::tensor::{Tensor, TensorData};
use burn_ndarray::NdArray;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use polywgan::penalty::{Metric, PenaltyEngine, PenaltySchedule};

type B = NdArray<f32>;

fn draw(rng: &mut ChaCha8Rng, n: usize) -> Vec<f32> {
    (0..n).map(|_| StandardNormal.sample(&mut *rng)).collect()
}

fn samples(batch: usize, nodes: usize, k: usize, seed: u64) -> (Vec<Tensor<B, 3>>, Vec<Tensor<B, 1>>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let device = Default::default();
    let xs = (0..k)
        .map(|_| {
            let v = draw(&mut rng, batch * nodes * 3);
            Tensor::from_data(TensorData::new(v, [batch, nodes, 3]), &device)
        })
        .collect();
    let ys = (0..k)
        .map(|_| Tensor::from_data(TensorData::new(draw(&mut rng, batch), [batch]), &device))
        .collect();
    (xs, ys)
}

fn bench_penalty(c: &mut Criterion) {
    let mut group = c.benchmark_group("endpoint_penalty");
    group.sample_size(30);

    let schedules = [
        ("one_mix", PenaltySchedule { interpolants: 1, cross_terms: true }),
        ("two_mix", PenaltySchedule { interpolants: 2, cross_terms: true }),
    ];
    for &(batch, nodes) in &[(8usize, 12usize), (64, 12), (64, 48)] {
        for (name, schedule) in schedules {
            let engine = PenaltyEngine::new(1.0, schedule);
            let (xs, ys) = samples(batch, nodes, schedule.n_samples(), 7);
            for metric in [Metric::Crow, Metric::Taxi] {
                group.bench_with_input(
                    BenchmarkId::new(format!("{name}_{metric:?}"), format!("b{batch}_n{nodes}")),
                    &(batch, nodes),
                    |b, _| b.iter(|| engine.total(metric, &xs, &ys).unwrap()),
                );
            }
        }
    }
    group.finish();
}

criterion_group!(benches, bench_penalty);
criterion_main!(benches);
