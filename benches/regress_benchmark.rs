// Training cost of the two trainers on a one-dimensional sine problem, as the
// number of random frequencies grows.

use alacarte::optimize::{SgdConfig, StartConfig, StartStrategy};
use alacarte::regression::{
    Basis, RandomRbf, RegressConfig, bayes_predict, bayes_regress, bayes_regress_sgd,
};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Rows in the training set.
const N_SAMPLES: usize = 400;
/// Random frequencies per basis; the feature count is twice each entry.
const BASIS_SIZES: [usize; 3] = [10, 25, 50];

fn sine_problem(rng: &mut StdRng) -> (Array2<f64>, Array1<f64>) {
    let x = Array2::from_shape_fn((N_SAMPLES, 1), |_| rng.gen_range(-3.0..3.0));
    let y = x.column(0).mapv(f64::sin);
    (x, y)
}

fn bench_trainers(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let (x, y) = sine_problem(&mut rng);

    let closed_form = RegressConfig {
        diagcov: false,
        start: StartConfig {
            strategy: StartStrategy::Random { candidates: 8 },
            n_starts: 1,
            ..StartConfig::default()
        },
    };
    let stochastic = SgdConfig {
        batch_size: 20,
        passes: 5,
        ..SgdConfig::default()
    };

    let mut group = c.benchmark_group("train");
    group.sample_size(10);
    group.throughput(Throughput::Elements(N_SAMPLES as u64));

    for nbases in BASIS_SIZES {
        let basis = match RandomRbf::new(nbases, 1, 1.0, &mut rng) {
            Ok(basis) => basis,
            Err(e) => panic!("basis construction failed: {e}"),
        };
        let hypers = basis.default_hypers();

        group.bench_with_input(BenchmarkId::new("closed_form", nbases), &nbases, |b, _| {
            b.iter(|| {
                let mut run_rng = StdRng::seed_from_u64(7);
                black_box(bayes_regress(
                    x.view(),
                    y.view(),
                    &basis,
                    &hypers,
                    0.1,
                    1.0,
                    &closed_form,
                    &mut run_rng,
                ))
            })
        });

        group.bench_with_input(BenchmarkId::new("sgd", nbases), &nbases, |b, _| {
            b.iter(|| {
                let mut run_rng = StdRng::seed_from_u64(7);
                black_box(bayes_regress_sgd(
                    x.view(),
                    y.view(),
                    &basis,
                    &hypers,
                    0.1,
                    1.0,
                    &stochastic,
                    &mut run_rng,
                ))
            })
        });
    }
    group.finish();
}

fn bench_prediction(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(2);
    let (x, y) = sine_problem(&mut rng);
    let basis = match RandomRbf::new(50, 1, 1.0, &mut rng) {
        Ok(basis) => basis,
        Err(e) => panic!("basis construction failed: {e}"),
    };
    let posterior = match bayes_regress(
        x.view(),
        y.view(),
        &basis,
        &basis.default_hypers(),
        0.1,
        1.0,
        &RegressConfig::default(),
        &mut rng,
    ) {
        Ok(posterior) => posterior,
        Err(e) => panic!("training failed: {e}"),
    };

    let queries = Array2::from_shape_fn((10_000, 1), |(i, _)| -3.0 + i as f64 * 6e-4);
    c.bench_function("predict_10k_rows", |b| {
        b.iter(|| black_box(bayes_predict(queries.view(), &basis, &posterior)))
    });
}

criterion_group!(benches, bench_trainers, bench_prediction);
criterion_main!(benches);
