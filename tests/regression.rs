use alacarte::optimize::{AdaGrad, Bound, RateRule, SgdConfig, sgd};
use alacarte::regression::data::{load_prediction_tsv, load_training_tsv};
use alacarte::regression::{
    BasisKind, LinearBasis, RandomRbf, RegressConfig, TrainedModel, TrainingSettings,
    bayes_predict, bayes_regress, bayes_regress_sgd, msll_against, smse,
};
use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use std::fmt::Write as _;

/// `y = 3x + 1` plus Gaussian noise with standard deviation `noise_sd`.
fn noisy_line(n: usize, noise_sd: f64, rng: &mut StdRng) -> (Array2<f64>, Array1<f64>) {
    let x = Array2::from_shape_fn((n, 1), |_| rng.gen_range(-2.0..2.0));
    let y = x.column(0).mapv(|v| {
        let e: f64 = StandardNormal.sample(&mut *rng);
        3.0 * v + 1.0 + noise_sd * e
    });
    (x, y)
}

#[test]
fn closed_form_recovers_a_noisy_line() {
    let mut rng = StdRng::seed_from_u64(2024);
    let (x, y) = noisy_line(500, 0.1, &mut rng);
    let basis = LinearBasis::new(1, true);

    let posterior = bayes_regress(
        x.view(),
        y.view(),
        &basis,
        &[],
        0.01,
        1.0,
        &RegressConfig::default(),
        &mut rng,
    )
    .unwrap();

    assert_abs_diff_eq!(posterior.weights[0], 3.0, epsilon = 0.1);
    assert_abs_diff_eq!(posterior.weights[1], 1.0, epsilon = 0.1);
    assert!(posterior.noise_variance > 0.0 && posterior.noise_variance < 0.1);

    let queries = array![[0.0], [1.0], [2.0]];
    let prediction = bayes_predict(queries.view(), &basis, &posterior).unwrap();
    for (got, want) in prediction.mean.iter().zip([1.0, 4.0, 7.0]) {
        assert_abs_diff_eq!(*got, want, epsilon = 0.3);
    }
    for (total, latent) in prediction.variance.iter().zip(&prediction.latent_variance) {
        assert!(*latent >= 0.0);
        assert!(*total >= *latent);
    }
}

#[test]
fn more_data_shrinks_the_latent_variance() {
    let basis = LinearBasis::new(1, true);
    let query = array![[0.5]];
    let latent_at = |n: usize| {
        let mut rng = StdRng::seed_from_u64(n as u64);
        let (x, y) = noisy_line(n, 0.5, &mut rng);
        let posterior = bayes_regress(
            x.view(),
            y.view(),
            &basis,
            &[],
            0.25,
            1.0,
            &RegressConfig::default(),
            &mut rng,
        )
        .unwrap();
        let prediction = bayes_predict(query.view(), &basis, &posterior).unwrap();
        assert!(prediction.variance[0] >= prediction.latent_variance[0]);
        prediction.latent_variance[0]
    };

    // Only the latent part shrinks with n. The total keeps the learned noise
    // variance, which stays near 0.25 however many rows there are.
    let small = latent_at(20);
    let large = latent_at(2000);
    assert!(
        large < small,
        "latent variance {large} with 2000 rows should be below {small} with 20"
    );
}

#[test]
fn sgd_objective_falls_over_passes() {
    let mut rng = StdRng::seed_from_u64(5);
    let (x, y) = noisy_line(200, 0.1, &mut rng);
    let config = SgdConfig {
        rule: RateRule::AdaGrad(AdaGrad::new(0.5, 1e-8)),
        batch_size: 10,
        passes: 20,
        eta: 0.0,
        ..SgdConfig::default()
    };

    // Half the mean squared residual of a slope and an intercept.
    let objective = |w: ndarray::ArrayView1<f64>, batch: &[usize]| {
        let m = batch.len() as f64;
        let mut value = 0.0;
        let mut grad = Array1::zeros(2);
        for &i in batch {
            let r = w[0] * x[[i, 0]] + w[1] - y[i];
            value += 0.5 * r * r / m;
            grad[0] += r * x[[i, 0]] / m;
            grad[1] += r / m;
        }
        (value, grad)
    };

    let bounds = vec![Bound::unbounded(); 2];
    let result = sgd(objective, Array1::zeros(2).view(), &bounds, 200, &config, &mut rng).unwrap();

    let per_pass = 200 / 10;
    let first: f64 = result.objectives[..per_pass].iter().sum::<f64>() / per_pass as f64;
    let tail = &result.objectives[result.objectives.len() - per_pass..];
    let last: f64 = tail.iter().sum::<f64>() / per_pass as f64;
    assert!(last < first, "last pass mean {last} should be below first pass mean {first}");
    assert_abs_diff_eq!(result.x[0], 3.0, epsilon = 0.2);
    assert_abs_diff_eq!(result.x[1], 1.0, epsilon = 0.2);
}

#[test]
fn stochastic_trainer_fits_a_line() {
    let mut rng = StdRng::seed_from_u64(9);
    let (x, y) = noisy_line(500, 0.1, &mut rng);
    let basis = LinearBasis::new(1, true);
    let config = SgdConfig {
        rule: RateRule::AdaGrad(AdaGrad::new(0.5, 1e-8)),
        batch_size: 25,
        passes: 60,
        eta: 0.0,
        ..SgdConfig::default()
    };

    let posterior =
        bayes_regress_sgd(x.view(), y.view(), &basis, &[], 1.0, 1.0, &config, &mut rng).unwrap();

    let per_pass = 500 / 25;
    let trace = &posterior.objective_trace;
    assert_eq!(trace.len(), 60 * per_pass);
    let first: f64 = trace[..per_pass].iter().sum::<f64>() / per_pass as f64;
    let last: f64 = trace[trace.len() - per_pass..].iter().sum::<f64>() / per_pass as f64;
    assert!(last < first, "last pass mean -ELBO {last} should be below first pass mean {first}");
    assert_abs_diff_eq!(posterior.weights[0], 3.0, epsilon = 0.15);
    assert_abs_diff_eq!(posterior.weights[1], 1.0, epsilon = 0.15);
}

#[test]
fn stochastic_training_gives_usable_predictions() {
    let mut rng = StdRng::seed_from_u64(77);
    let (x, y) = noisy_line(300, 0.2, &mut rng);
    let settings = TrainingSettings::Stochastic(SgdConfig {
        batch_size: 20,
        passes: 15,
        ..SgdConfig::default()
    });

    let model = TrainedModel::fit(
        x.view(),
        y.view(),
        vec!["x".to_string()],
        BasisKind::Linear(LinearBasis::new(1, true)),
        settings,
        1.0,
        1.0,
        77,
        &mut rng,
    )
    .unwrap();

    let prediction = model.predict(x.view()).unwrap();
    assert!(prediction.mean.iter().all(|m| m.is_finite()));
    for (total, latent) in prediction.variance.iter().zip(&prediction.latent_variance) {
        assert!(*latent >= 0.0);
        assert_abs_diff_eq!(*total - *latent, model.posterior.noise_variance, epsilon = 1e-9);
    }
}

fn write_table(path: &std::path::Path, x: &Array2<f64>, y: &Array1<f64>) {
    let mut contents = String::from("sample_id\tx\ttarget\n");
    for (i, (xi, yi)) in x.column(0).iter().zip(y.iter()).enumerate() {
        writeln!(contents, "s{i}\t{xi}\t{yi}").unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

#[test]
fn tables_to_saved_model_to_scores() {
    let dir = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(31);

    let x = Array2::from_shape_fn((120, 1), |_| rng.gen_range(-3.0..3.0));
    let y = x.column(0).mapv(|v: f64| {
        let e: f64 = StandardNormal.sample(&mut rng);
        v.sin() + 0.05 * e
    });
    let train_path = dir.path().join("train.tsv");
    write_table(&train_path, &x, &y);

    let test_x = Array2::from_shape_fn((30, 1), |(i, _)| -2.5 + i as f64 / 6.0);
    let test_y = test_x.column(0).mapv(f64::sin);
    let test_path = dir.path().join("test.tsv");
    write_table(&test_path, &test_x, &test_y);

    let train = load_training_tsv(&train_path).unwrap();
    assert_eq!(train.feature_names, vec!["x"]);
    let target = train.target.clone().unwrap();
    let basis = BasisKind::RandomRbf(RandomRbf::new(25, 1, 1.0, &mut rng).unwrap());
    let model = TrainedModel::fit(
        train.features.view(),
        target.view(),
        train.feature_names.clone(),
        basis,
        TrainingSettings::ClosedForm(RegressConfig::default()),
        0.1,
        1.0,
        31,
        &mut rng,
    )
    .unwrap();

    let model_path = dir.path().join("model.toml");
    model.save(&model_path).unwrap();
    let loaded = TrainedModel::load(&model_path).unwrap();

    let test = load_prediction_tsv(&test_path, loaded.feature_names.len()).unwrap();
    assert_eq!(test.sample_ids[0], "s0");
    let prediction = loaded.predict(test.features.view()).unwrap();
    let truth = test.target.unwrap();

    let error = smse(truth.view(), prediction.mean.view()).unwrap();
    let log_loss = msll_against(
        truth.view(),
        prediction.mean.view(),
        prediction.variance.view(),
        loaded.target_mean,
        loaded.target_variance,
    )
    .unwrap();
    assert!(error < 0.1, "SMSE {error} too high for a smooth target");
    assert!(log_loss < 0.0, "MSLL {log_loss} should beat the trivial Gaussian");
}
