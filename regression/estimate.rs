//! # Evidence Maximization
//!
//! Both trainers minimize `-ELBO / N`, where for `q(w) = N(m, C)`
//!
//! ```text
//! ELBO = -1/2 [ N log(2πs) + (‖y - Φm‖² + tr(ΦᵀΦC)) / s
//!               + (mᵀm + tr C) / r - M + M log r - log|C| ]
//! ```
//!
//! The closed-form trainer substitutes the optimal `q(w)` at every
//! evaluation, so the gradient with respect to `s`, `r` and `θ` only needs
//! the explicit dependence (`m` and `C` are stationary). The stochastic
//! trainer keeps `m` and a diagonal `C` as free parameters and scales the
//! data term of a minibatch of `M_b` rows by `N / M_b`.

use super::basis::Basis;
use super::linalg::jittered_cholesky;
use super::model::{Posterior, WeightCovariance};
use super::RegressionError;
use crate::optimize::{
    Bound, MultiStart, OptimizeError, SgdConfig, Sgd, StartConfig, logtrick_minimizer,
    logtrick_sgd, shapes_of, structure, structured_minimizer, structured_sgd,
};

use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, Axis, Ix1, arr0};
use ndarray_linalg::{DeterminantC, InverseC, SolveC};
use rand::Rng;
use rand_distr::{Distribution, Gamma, StandardNormal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Settings of the closed-form trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressConfig {
    /// Keep only the diagonal of the posterior covariance.
    pub diagcov: bool,
    pub start: StartConfig,
}

impl Default for RegressConfig {
    fn default() -> Self {
        Self {
            diagcov: false,
            start: StartConfig::default(),
        }
    }
}

fn check_training_data(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), RegressionError> {
    if y.is_empty() {
        return Err(RegressionError::EmptyData);
    }
    if x.nrows() != y.len() {
        return Err(RegressionError::ShapeMismatch {
            context: "input rows versus targets",
            expected: y.len(),
            found: x.nrows(),
        });
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(RegressionError::NonFiniteInput("inputs"));
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(RegressionError::NonFiniteInput("targets"));
    }
    Ok(())
}

fn check_positive(name: &'static str, value: f64) -> Result<(), RegressionError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(RegressionError::InvalidHyperparameter { name, value })
    }
}

fn scalar(block: &ArrayD<f64>) -> f64 {
    block.iter().next().copied().unwrap_or(f64::NAN)
}

fn vector(block: &ArrayD<f64>) -> Result<ArrayView1<f64>, RegressionError> {
    block
        .view()
        .into_dimensionality::<Ix1>()
        .map_err(|_| RegressionError::ShapeMismatch {
            context: "weight block dimensionality",
            expected: 1,
            found: block.ndim(),
        })
}

fn zeros_like(blocks: &[ArrayD<f64>]) -> Vec<ArrayD<f64>> {
    blocks.iter().map(|b| ArrayD::zeros(b.raw_dim())).collect()
}

/// Reshapes per-scalar hyperparameter derivatives into the block shapes.
fn hyper_blocks(flat: Vec<f64>, hypers: &[ArrayD<f64>]) -> Result<Vec<ArrayD<f64>>, RegressionError> {
    Ok(structure(Array1::from(flat).view(), &shapes_of(hypers))?)
}

/// The optimal `q(w)` for fixed `s`, `r` and features.
struct WeightPosterior {
    mean: Array1<f64>,
    covariance: WeightCovariance,
    log_det_covariance: f64,
}

fn solve_weights(
    phi: &Array2<f64>,
    y: ArrayView1<f64>,
    noise_variance: f64,
    regulariser: f64,
    diagcov: bool,
) -> Result<WeightPosterior, RegressionError> {
    let mut precision = phi.t().dot(phi) / noise_variance;
    precision.diag_mut().mapv_inplace(|v| v + 1.0 / regulariser);
    let factor = jittered_cholesky(&precision)?;
    let mean = factor.solvec(&(phi.t().dot(&y) / noise_variance))?;

    let (covariance, log_det_covariance) = if diagcov {
        let diag = precision.diag();
        (
            WeightCovariance::Diagonal(diag.mapv(|v| 1.0 / v)),
            -diag.mapv(f64::ln).sum(),
        )
    } else {
        (WeightCovariance::Full(factor.invc()?), -factor.ln_detc())
    };
    Ok(WeightPosterior {
        mean,
        covariance,
        log_det_covariance,
    })
}

/// `ΦC`, either as a product or a column scaling.
fn phi_times_covariance(phi: &Array2<f64>, covariance: &WeightCovariance) -> Array2<f64> {
    match covariance {
        WeightCovariance::Full(c) => phi.dot(c),
        WeightCovariance::Diagonal(c) => phi * c,
    }
}

/// Value and gradient of `-ELBO / N` for the closed-form trainer, over the
/// blocks `[s, r, θ...]`.
fn closed_form_objective<B: Basis + ?Sized>(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    basis: &B,
    blocks: &[ArrayD<f64>],
    diagcov: bool,
) -> Result<(f64, Vec<ArrayD<f64>>), RegressionError> {
    let s = scalar(&blocks[0]);
    let r = scalar(&blocks[1]);
    let hypers = &blocks[2..];

    let phi = basis.transform(x, hypers)?;
    let d_phis = basis.grad(x, hypers)?;
    let q = solve_weights(&phi, y, s, r, diagcov)?;

    let n = y.len() as f64;
    let m_dim = phi.ncols() as f64;
    let err = &y - &phi.dot(&q.mean);
    let sq_err = err.dot(&err);
    let phi_c = phi_times_covariance(&phi, &q.covariance);
    let trace_ppc = (&phi_c * &phi).sum();
    let trace_c = q.covariance.trace();
    let mtm = q.mean.dot(&q.mean);

    let elbo = -0.5
        * (n * (2.0 * PI * s).ln()
            + (sq_err + trace_ppc) / s
            + (mtm + trace_c) / r
            - m_dim
            + m_dim * r.ln()
            - q.log_det_covariance);

    let d_s = -0.5 * (n / s - (sq_err + trace_ppc) / (s * s));
    let d_r = -0.5 * (m_dim / r - (mtm + trace_c) / (r * r));
    let d_hypers: Vec<f64> = d_phis
        .iter()
        .map(|d_phi| -(-err.dot(&d_phi.dot(&q.mean)) + (&phi_c * d_phi).sum()) / s)
        .collect();

    let mut grads = vec![arr0(-d_s / n).into_dyn(), arr0(-d_r / n).into_dyn()];
    grads.extend(hyper_blocks(
        d_hypers.into_iter().map(|g| -g / n).collect(),
        hypers,
    )?);
    Ok((-elbo / n, grads))
}

/// Trains by maximizing the evidence lower bound with the optimal `q(w)`
/// substituted in closed form.
///
/// `var` and `regulariser` are the starting noise variance and prior weight
/// variance; `hypers` are the starting basis hyperparameters. None of them
/// are modified; the optimized values are returned in the [`Posterior`].
#[allow(clippy::too_many_arguments)]
pub fn bayes_regress<B, R>(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    basis: &B,
    hypers: &[ArrayD<f64>],
    var: f64,
    regulariser: f64,
    config: &RegressConfig,
    rng: &mut R,
) -> Result<Posterior, RegressionError>
where
    B: Basis + ?Sized,
    R: Rng + ?Sized,
{
    check_training_data(x, y)?;
    check_positive("noise variance", var)?;
    check_positive("regulariser", regulariser)?;
    basis.transform(x.slice(ndarray::s![..1, ..]), hypers)?;

    let mut x0 = vec![arr0(var).into_dyn(), arr0(regulariser).into_dyn()];
    x0.extend(hypers.iter().cloned());
    let mut bounds = vec![Bound::positive(), Bound::positive()];
    bounds.extend(basis.hyper_bounds());

    log::info!(
        "Training on {} samples with {} features ({} covariance)",
        y.len(),
        basis.output_dim(),
        if config.diagcov { "diagonal" } else { "full" }
    );

    let mut failure: Option<RegressionError> = None;
    let objective = |blocks: &[ArrayD<f64>]| {
        match closed_form_objective(x, y, basis, blocks, config.diagcov) {
            Ok(evaluation) => evaluation,
            Err(RegressionError::LinearSystemSolveFailed(e)) => {
                log::debug!("Posterior solve failed at a trial point: {e}");
                (f64::NAN, zeros_like(blocks))
            }
            Err(e) => {
                failure.get_or_insert(e);
                (f64::NAN, zeros_like(blocks))
            }
        }
    };

    let mut optimizer = structured_minimizer(logtrick_minimizer(MultiStart::new(
        config.start.clone(),
        rng,
    )));
    let outcome = optimizer.minimize(objective, &x0, &bounds);
    if let Some(e) = failure {
        return Err(e);
    }
    let (optimum, found) = outcome?;

    if !found.converged {
        log::info!("Evidence maximization stopped before meeting its tolerance");
    }
    log::info!(
        "Optimized -ELBO/N = {:.6} after {} evaluations",
        found.value,
        found.evaluations
    );

    let noise_variance = scalar(&optimum[0]);
    let regulariser = scalar(&optimum[1]);
    let hypers = optimum[2..].to_vec();
    let phi = basis.transform(x, &hypers)?;
    let q = solve_weights(&phi, y, noise_variance, regulariser, config.diagcov)?;

    Ok(Posterior {
        weights: q.mean,
        covariance: q.covariance,
        hypers,
        noise_variance,
        regulariser,
        converged: found.converged,
        objective_trace: Vec::new(),
    })
}

/// Value and gradient of the minibatch estimate of `-ELBO / N`, over the
/// blocks `[m, diag C, s, r, θ...]`.
fn minibatch_objective<B: Basis + ?Sized>(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    basis: &B,
    blocks: &[ArrayD<f64>],
    batch: &[usize],
) -> Result<(f64, Vec<ArrayD<f64>>), RegressionError> {
    let m = vector(&blocks[0])?;
    let c = vector(&blocks[1])?;
    let s = scalar(&blocks[2]);
    let r = scalar(&blocks[3]);
    let hypers = &blocks[4..];

    let xb = x.select(Axis(0), batch);
    let yb = y.select(Axis(0), batch);
    let phi = basis.transform(xb.view(), hypers)?;
    let d_phis = basis.grad(xb.view(), hypers)?;

    let n = y.len() as f64;
    let batch_len = batch.len() as f64;
    let scale = n / batch_len;
    let d = m.len() as f64;

    let err = &yb - &phi.dot(&m);
    let sq_err = err.dot(&err);
    let pp_diag = phi.mapv(|v| v * v).sum_axis(Axis(0));
    let trace_ppc = pp_diag.dot(&c);
    let mtm = m.dot(&m);
    let sum_c = c.sum();
    let sum_log_c = c.mapv(f64::ln).sum();

    let elbo = -0.5
        * (scale * (batch_len * (2.0 * PI * s).ln() + (sq_err + trace_ppc) / s)
            + (mtm + sum_c) / r
            - sum_log_c
            + d * r.ln()
            - d);

    let d_m = phi.t().dot(&err) * (scale / s) - &m / r;
    let d_c = -0.5 * (&pp_diag * (scale / s) + 1.0 / r - c.mapv(|v| 1.0 / v));
    let d_s = 0.5 * scale * ((sq_err + trace_ppc) / (s * s) - batch_len / s);
    let d_r = 0.5 * ((mtm + sum_c) / (r * r) - d / r);
    let phi_c = &phi * &c;
    let d_hypers: Vec<f64> = d_phis
        .iter()
        .map(|d_phi| -(scale / s) * (-err.dot(&d_phi.dot(&m)) + (&phi_c * d_phi).sum()))
        .collect();

    let mut grads = vec![
        (d_m / -n).into_dyn(),
        (d_c / -n).into_dyn(),
        arr0(-d_s / n).into_dyn(),
        arr0(-d_r / n).into_dyn(),
    ];
    grads.extend(hyper_blocks(
        d_hypers.into_iter().map(|g| -g / n).collect(),
        hypers,
    )?);
    Ok((-elbo / n, grads))
}

/// Trains by stochastic gradient ascent on a minibatch estimate of the
/// evidence lower bound, with a diagonal posterior covariance.
///
/// The posterior mean starts from `N(0, 1)` draws and the covariance
/// diagonal from `Gamma(2, 0.5)` draws, both taken from `rng`, which also
/// shuffles the minibatches.
#[allow(clippy::too_many_arguments)]
pub fn bayes_regress_sgd<B, R>(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    basis: &B,
    hypers: &[ArrayD<f64>],
    var: f64,
    regulariser: f64,
    config: &SgdConfig,
    rng: &mut R,
) -> Result<Posterior, RegressionError>
where
    B: Basis + ?Sized,
    R: Rng + ?Sized,
{
    check_training_data(x, y)?;
    check_positive("noise variance", var)?;
    check_positive("regulariser", regulariser)?;
    basis.transform(x.slice(ndarray::s![..1, ..]), hypers)?;

    let m_dim = basis.output_dim();
    let gamma = Gamma::new(2.0, 0.5).map_err(|e| RegressionError::Initialization(e.to_string()))?;
    let mean0: Array1<f64> = (0..m_dim).map(|_| StandardNormal.sample(&mut *rng)).collect();
    let cov0: Array1<f64> = (0..m_dim).map(|_| gamma.sample(&mut *rng)).collect();

    let mut x0 = vec![
        mean0.into_dyn(),
        cov0.into_dyn(),
        arr0(var).into_dyn(),
        arr0(regulariser).into_dyn(),
    ];
    x0.extend(hypers.iter().cloned());
    let mut bounds = vec![
        Bound::unbounded(),
        Bound::positive(),
        Bound::positive(),
        Bound::positive(),
    ];
    bounds.extend(basis.hyper_bounds());

    log::info!(
        "Training on {} samples with {} features by SGD (batch size {}, up to {} passes)",
        y.len(),
        m_dim,
        config.batch_size,
        config.passes
    );

    let mut failure: Option<RegressionError> = None;
    let objective = |blocks: &[ArrayD<f64>], batch: &[usize]| {
        minibatch_objective(x, y, basis, blocks, batch).unwrap_or_else(|e| {
            failure.get_or_insert(e);
            (f64::NAN, zeros_like(blocks))
        })
    };

    let mut optimizer = structured_sgd(logtrick_sgd(Sgd::new(config.clone(), rng)));
    let outcome = optimizer.descend(objective, &x0, &bounds, y.len());
    if let Some(e) = failure {
        return Err(e);
    }
    let (blocks, result) = outcome?;

    if !result.converged() {
        log::info!(
            "SGD finished without meeting eta ({:?} after {} passes)",
            result.termination,
            result.passes
        );
    }

    let weights = vector(&blocks[0])?.to_owned();
    let covariance = vector(&blocks[1])?.to_owned();
    if weights.len() != m_dim {
        return Err(OptimizeError::ShapeMismatch {
            context: "posterior mean length",
            expected: m_dim,
            found: weights.len(),
        }
        .into());
    }
    Ok(Posterior {
        weights,
        covariance: WeightCovariance::Diagonal(covariance),
        hypers: blocks[4..].to_vec(),
        noise_variance: scalar(&blocks[2]),
        regulariser: scalar(&blocks[3]),
        converged: result.converged(),
        objective_trace: result.objectives,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regression::basis::{LinearBasis, RandomRbf, RandomRbfArd};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn sine_data(n: usize, rng: &mut StdRng) -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((n, 1), |_| rng.gen_range(-3.0..3.0));
        let y = x.column(0).mapv(|v: f64| v.sin() + 0.1 * v);
        (x, y)
    }

    /// Central-difference check of a block objective's gradient.
    fn check_gradient<F>(mut f: F, blocks: &[ArrayD<f64>])
    where
        F: FnMut(&[ArrayD<f64>]) -> (f64, Vec<ArrayD<f64>>),
    {
        let (_, analytic) = f(blocks);
        let h = 1e-6;
        for b in 0..blocks.len() {
            for e in 0..blocks[b].len() {
                let mut plus = blocks.to_vec();
                let mut minus = blocks.to_vec();
                if let Some(v) = plus[b].iter_mut().nth(e) {
                    *v += h;
                }
                if let Some(v) = minus[b].iter_mut().nth(e) {
                    *v -= h;
                }
                let numeric = (f(&plus).0 - f(&minus).0) / (2.0 * h);
                let exact = analytic[b].iter().nth(e).copied().unwrap_or(f64::NAN);
                assert_abs_diff_eq!(exact, numeric, epsilon = 1e-5 * numeric.abs().max(1.0));
            }
        }
    }

    #[test]
    fn closed_form_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(4);
        let (x, y) = sine_data(30, &mut rng);
        let basis = RandomRbf::new(5, 1, 1.0, &mut rng).unwrap();
        let blocks = vec![arr0(0.3).into_dyn(), arr0(2.0).into_dyn(), arr0(0.8).into_dyn()];
        for diagcov in [false, true] {
            check_gradient(
                |b| closed_form_objective(x.view(), y.view(), &basis, b, diagcov).unwrap(),
                &blocks,
            );
        }
    }

    #[test]
    fn minibatch_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(9);
        let (x, y) = sine_data(25, &mut rng);
        let basis = RandomRbfArd::new(3, array![1.0], &mut rng).unwrap();
        let blocks = vec![
            array![0.2, -0.4, 0.1, 0.7, -0.3, 0.5].into_dyn(),
            array![0.5, 0.9, 0.3, 1.2, 0.8, 0.6].into_dyn(),
            arr0(0.4).into_dyn(),
            arr0(1.5).into_dyn(),
            array![1.1].into_dyn(),
        ];
        let batch = [3, 7, 0, 19];
        check_gradient(
            |b| minibatch_objective(x.view(), y.view(), &basis, b, &batch).unwrap(),
            &blocks,
        );
    }

    #[test]
    fn closed_form_recovers_a_nearly_noiseless_line() {
        let x = Array2::from_shape_fn((50, 1), |(i, _)| i as f64 / 10.0);
        let y = Array1::from_shape_fn(50, |i| -2.0 * x[[i, 0]] + 0.5 + 0.005 * (7.0 * i as f64).sin());
        let basis = LinearBasis::new(1, true);
        let posterior = bayes_regress(
            x.view(),
            y.view(),
            &basis,
            &[],
            0.1,
            1.0,
            &RegressConfig::default(),
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();
        assert_abs_diff_eq!(posterior.weights[0], -2.0, epsilon = 1e-2);
        assert_abs_diff_eq!(posterior.weights[1], 0.5, epsilon = 1e-2);
        assert!(posterior.noise_variance > 0.0 && posterior.noise_variance < 1e-3);
        assert!(posterior.hypers.is_empty());
    }

    #[test]
    fn diagonal_covariance_is_stored_as_a_vector() {
        let mut rng = StdRng::seed_from_u64(2);
        let (x, y) = sine_data(40, &mut rng);
        let basis = RandomRbf::new(10, 1, 1.0, &mut rng).unwrap();
        let config = RegressConfig {
            diagcov: true,
            ..RegressConfig::default()
        };
        let posterior = bayes_regress(
            x.view(),
            y.view(),
            &basis,
            &basis.default_hypers(),
            0.1,
            1.0,
            &config,
            &mut rng,
        )
        .unwrap();
        match &posterior.covariance {
            WeightCovariance::Diagonal(c) => {
                assert_eq!(c.len(), 20);
                assert!(c.iter().all(|v| *v > 0.0));
            }
            WeightCovariance::Full(_) => panic!("expected a diagonal covariance"),
        }
        assert!(posterior.hypers[0][[]] > 0.0);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let basis = LinearBasis::new(1, false);
        let x = array![[1.0], [2.0]];
        let config = RegressConfig::default();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            bayes_regress(x.view(), array![1.0].view(), &basis, &[], 1.0, 1.0, &config, &mut rng),
            Err(RegressionError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            bayes_regress(x.view(), array![1.0, f64::NAN].view(), &basis, &[], 1.0, 1.0, &config, &mut rng),
            Err(RegressionError::NonFiniteInput("targets"))
        ));
        assert!(matches!(
            bayes_regress(x.view(), array![1.0, 2.0].view(), &basis, &[], -1.0, 1.0, &config, &mut rng),
            Err(RegressionError::InvalidHyperparameter { .. })
        ));
        assert!(matches!(
            bayes_regress(
                x.view(),
                array![1.0, 2.0].view(),
                &basis,
                &[arr0(1.0).into_dyn()],
                1.0,
                1.0,
                &config,
                &mut rng
            ),
            Err(RegressionError::Basis(_))
        ));
    }

    #[test]
    fn sgd_handles_batches_smaller_than_the_feature_count() {
        let mut rng = StdRng::seed_from_u64(8);
        let (x, y) = sine_data(60, &mut rng);
        let basis = RandomRbf::new(20, 1, 1.0, &mut rng).unwrap();
        let config = SgdConfig {
            batch_size: 5,
            passes: 5,
            ..SgdConfig::default()
        };
        let posterior = bayes_regress_sgd(
            x.view(),
            y.view(),
            &basis,
            &basis.default_hypers(),
            0.5,
            1.0,
            &config,
            &mut rng,
        )
        .unwrap();
        assert_eq!(posterior.weights.len(), 40);
        assert!(posterior.weights.iter().all(|w| w.is_finite()));
        assert!(posterior.noise_variance > 0.0 && posterior.regulariser > 0.0);
        match &posterior.covariance {
            WeightCovariance::Diagonal(c) => assert!(c.iter().all(|v| *v > 0.0)),
            WeightCovariance::Full(_) => panic!("SGD keeps a diagonal covariance"),
        }
    }
}
