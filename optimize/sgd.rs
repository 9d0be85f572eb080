//! Minibatch stochastic gradient descent with adaptive step rules.
//!
//! Every pass shuffles the row indices `0..n_samples` and hands them to the
//! objective in consecutive minibatches. The step taken after each batch is
//! produced by a [`RateRule`]:
//!
//! ```text
//! AdaDelta:  Eg2 = rho*Eg2 + (1-rho)*g^2
//!            dx  = -sqrt(Edx2 + eps) / sqrt(Eg2 + eps) * g
//!            Edx2 = rho*Edx2 + (1-rho)*dx^2
//! AdaGrad:   G   = G + g^2
//!            dx  = -alpha * g / (sqrt(G) + eps)
//! Momentum:  v   = rho*v - alpha*g
//!            dx  = v
//! ```
//!
//! Convergence is judged once per pass on an exponential moving average of
//! the minibatch objective values.

use super::bounds::{Bound, BoundTransform};
use super::{OptimizeError, StochasticMinimizer, check_start, walltime_budget};

use ndarray::{Array1, ArrayView1, Zip};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaDelta {
    pub rho: f64,
    pub epsilon: f64,
    #[serde(skip)]
    mean_sq_grad: Array1<f64>,
    #[serde(skip)]
    mean_sq_step: Array1<f64>,
}

impl Default for AdaDelta {
    fn default() -> Self {
        Self::new(0.9, 1e-6)
    }
}

impl AdaDelta {
    pub fn new(rho: f64, epsilon: f64) -> Self {
        Self {
            rho,
            epsilon,
            mean_sq_grad: Array1::zeros(0),
            mean_sq_step: Array1::zeros(0),
        }
    }

    fn step(&mut self, grad: ArrayView1<f64>) -> Array1<f64> {
        let (rho, eps) = (self.rho, self.epsilon);
        let mut step = Array1::zeros(grad.len());
        Zip::from(&mut step)
            .and(&grad)
            .and(&mut self.mean_sq_grad)
            .and(&mut self.mean_sq_step)
            .for_each(|dx, &g, eg2, edx2| {
                *eg2 = rho * *eg2 + (1.0 - rho) * g * g;
                *dx = -((*edx2 + eps).sqrt() / (*eg2 + eps).sqrt()) * g;
                *edx2 = rho * *edx2 + (1.0 - rho) * *dx * *dx;
            });
        step
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaGrad {
    pub alpha: f64,
    pub epsilon: f64,
    #[serde(skip)]
    accumulated: Array1<f64>,
}

impl Default for AdaGrad {
    fn default() -> Self {
        Self::new(1.0, 1e-8)
    }
}

impl AdaGrad {
    pub fn new(alpha: f64, epsilon: f64) -> Self {
        Self {
            alpha,
            epsilon,
            accumulated: Array1::zeros(0),
        }
    }

    /// Running sum of squared gradients, one entry per coordinate.
    pub fn accumulated(&self) -> ArrayView1<f64> {
        self.accumulated.view()
    }

    fn step(&mut self, grad: ArrayView1<f64>) -> Array1<f64> {
        let (alpha, eps) = (self.alpha, self.epsilon);
        let mut step = Array1::zeros(grad.len());
        Zip::from(&mut step)
            .and(&grad)
            .and(&mut self.accumulated)
            .for_each(|dx, &g, acc| {
                *acc += g * g;
                *dx = -alpha * g / (acc.sqrt() + eps);
            });
        step
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Momentum {
    pub alpha: f64,
    pub rho: f64,
    #[serde(skip)]
    velocity: Array1<f64>,
}

impl Default for Momentum {
    fn default() -> Self {
        Self::new(0.01, 0.9)
    }
}

impl Momentum {
    pub fn new(alpha: f64, rho: f64) -> Self {
        Self {
            alpha,
            rho,
            velocity: Array1::zeros(0),
        }
    }

    fn step(&mut self, grad: ArrayView1<f64>) -> Array1<f64> {
        let (alpha, rho) = (self.alpha, self.rho);
        self.velocity.zip_mut_with(&grad, |v, &g| *v = rho * *v - alpha * g);
        self.velocity.clone()
    }
}

/// Per-coordinate step-size rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RateRule {
    AdaDelta(AdaDelta),
    AdaGrad(AdaGrad),
    Momentum(Momentum),
}

impl Default for RateRule {
    fn default() -> Self {
        RateRule::AdaDelta(AdaDelta::default())
    }
}

impl RateRule {
    /// Clears the accumulated state and sizes it for `dim` coordinates.
    pub fn reset(&mut self, dim: usize) {
        match self {
            RateRule::AdaDelta(r) => {
                r.mean_sq_grad = Array1::zeros(dim);
                r.mean_sq_step = Array1::zeros(dim);
            }
            RateRule::AdaGrad(r) => r.accumulated = Array1::zeros(dim),
            RateRule::Momentum(r) => r.velocity = Array1::zeros(dim),
        }
    }

    /// Consumes one gradient and returns the step to add to the parameters.
    /// The state is resized on the first call if needed.
    pub fn step(&mut self, grad: ArrayView1<f64>) -> Array1<f64> {
        if self.state_len() != grad.len() {
            self.reset(grad.len());
        }
        match self {
            RateRule::AdaDelta(r) => r.step(grad),
            RateRule::AdaGrad(r) => r.step(grad),
            RateRule::Momentum(r) => r.step(grad),
        }
    }

    fn state_len(&self) -> usize {
        match self {
            RateRule::AdaDelta(r) => r.mean_sq_grad.len(),
            RateRule::AdaGrad(r) => r.accumulated.len(),
            RateRule::Momentum(r) => r.velocity.len(),
        }
    }

    pub fn validate(&self) -> Result<(), OptimizeError> {
        let positive = |name: &str, v: f64| {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(OptimizeError::InvalidConfig(format!(
                    "{name} must be positive and finite, got {v}"
                )))
            }
        };
        let unit = |name: &str, v: f64| {
            if (0.0..1.0).contains(&v) {
                Ok(())
            } else {
                Err(OptimizeError::InvalidConfig(format!(
                    "{name} must lie in [0, 1), got {v}"
                )))
            }
        };
        match self {
            RateRule::AdaDelta(r) => {
                unit("AdaDelta rho", r.rho)?;
                positive("AdaDelta epsilon", r.epsilon)
            }
            RateRule::AdaGrad(r) => {
                positive("AdaGrad alpha", r.alpha)?;
                positive("AdaGrad epsilon", r.epsilon)
            }
            RateRule::Momentum(r) => {
                positive("Momentum alpha", r.alpha)?;
                unit("Momentum rho", r.rho)
            }
        }
    }
}

/// Settings for [`Sgd`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    pub rule: RateRule,
    pub batch_size: usize,
    /// Maximum number of passes over the data.
    pub passes: usize,
    /// Relative change of the smoothed objective between passes below which
    /// the run counts as converged.
    pub eta: f64,
    /// Decay of the exponential moving average of minibatch objectives.
    pub smoothing: f64,
    pub walltime_secs: Option<f64>,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            rule: RateRule::default(),
            batch_size: 10,
            passes: 10,
            eta: 1e-5,
            smoothing: 0.9,
            walltime_secs: None,
        }
    }
}

impl SgdConfig {
    fn validate(&self) -> Result<(), OptimizeError> {
        self.rule.validate()?;
        if self.batch_size == 0 {
            return Err(OptimizeError::InvalidConfig(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.passes == 0 {
            return Err(OptimizeError::InvalidConfig(
                "at least one pass is required".to_string(),
            ));
        }
        if !(self.eta >= 0.0 && self.eta.is_finite()) {
            return Err(OptimizeError::InvalidConfig(format!(
                "eta must be non-negative and finite, got {}",
                self.eta
            )));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(OptimizeError::InvalidConfig(format!(
                "smoothing must lie in [0, 1), got {}",
                self.smoothing
            )));
        }
        Ok(())
    }
}

/// Why a stochastic run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    Converged,
    PassesExhausted,
    WalltimeExhausted,
}

/// Outcome of a stochastic run, in the caller's coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct SgdResult {
    /// Parameters after the last step.
    pub x: Array1<f64>,
    /// Parameters at which the smoothed objective was lowest.
    pub best_x: Array1<f64>,
    /// Minibatch objective value of every iteration.
    pub objectives: Vec<f64>,
    /// Norm of every minibatch gradient, in the search coordinates.
    pub gradient_norms: Vec<f64>,
    pub passes: usize,
    pub iterations: usize,
    pub termination: Termination,
}

impl SgdResult {
    pub fn converged(&self) -> bool {
        self.termination == Termination::Converged
    }
}

/// Minibatch SGD over bounded parameters.
pub struct Sgd<'r, R: Rng + ?Sized> {
    config: SgdConfig,
    rng: &'r mut R,
}

impl<'r, R: Rng + ?Sized> Sgd<'r, R> {
    pub fn new(config: SgdConfig, rng: &'r mut R) -> Self {
        Self { config, rng }
    }
}

impl<R: Rng + ?Sized> StochasticMinimizer for Sgd<'_, R> {
    fn descend(
        &mut self,
        objective: &mut dyn FnMut(ArrayView1<f64>, &[usize]) -> (f64, Array1<f64>),
        x0: ArrayView1<f64>,
        bounds: &[Bound],
        n_samples: usize,
    ) -> Result<SgdResult, OptimizeError> {
        self.config.validate()?;
        check_start(x0, bounds)?;
        if n_samples == 0 {
            return Err(OptimizeError::InvalidConfig(
                "cannot draw minibatches from an empty dataset".to_string(),
            ));
        }
        let budget = walltime_budget(self.config.walltime_secs)?;

        let transform = BoundTransform::new(bounds);
        let mut z = transform.to_unconstrained(x0);
        let mut rule = self.config.rule.clone();
        rule.reset(z.len());

        let batch_size = self.config.batch_size.min(n_samples);
        let decay = self.config.smoothing;
        let mut order: Vec<usize> = (0..n_samples).collect();

        let started = Instant::now();
        let mut objectives = Vec::new();
        let mut gradient_norms = Vec::new();
        let mut smoothed: Option<f64> = None;
        let mut previous_pass: Option<f64> = None;
        let mut best = (f64::INFINITY, x0.to_owned());
        let mut termination = Termination::PassesExhausted;
        let mut passes = 0;

        'passes: for pass in 0..self.config.passes {
            order.shuffle(&mut *self.rng);
            for batch in order.chunks(batch_size) {
                if budget.is_some_and(|b| started.elapsed() >= b) {
                    termination = Termination::WalltimeExhausted;
                    break 'passes;
                }

                let x = transform.to_bounded(z.view());
                let (value, grad) = objective(x.view(), batch);
                if grad.len() != x.len() {
                    return Err(OptimizeError::ShapeMismatch {
                        context: "minibatch gradient",
                        expected: x.len(),
                        found: grad.len(),
                    });
                }
                if !value.is_finite() || grad.iter().any(|g| !g.is_finite()) {
                    return Err(OptimizeError::NumericDivergence {
                        detail: format!(
                            "objective {value} at iteration {} of pass {pass}",
                            objectives.len()
                        ),
                    });
                }

                let grad_z = transform.chain_gradient(z.view(), grad.view());
                let step = rule.step(grad_z.view());
                if step.iter().any(|s| !s.is_finite()) {
                    return Err(OptimizeError::NumericDivergence {
                        detail: format!("non-finite step at iteration {}", objectives.len()),
                    });
                }
                z += &step;

                let average = smoothed.map_or(value, |s| decay * s + (1.0 - decay) * value);
                smoothed = Some(average);
                if average < best.0 {
                    best = (average, x);
                }
                gradient_norms.push(grad_z.dot(&grad_z).sqrt());
                objectives.push(value);
            }
            passes = pass + 1;

            if let (Some(previous), Some(current)) = (previous_pass, smoothed) {
                let change = (previous - current) / previous.abs().max(1.0);
                log::debug!("Pass {passes}: smoothed objective {current:.6e}, relative change {change:.3e}");
                if change.abs() < self.config.eta {
                    termination = Termination::Converged;
                    break;
                }
            }
            previous_pass = smoothed;
        }

        log::info!(
            "SGD stopped after {} iterations over {} passes ({:?})",
            objectives.len(),
            passes,
            termination
        );
        Ok(SgdResult {
            x: transform.to_bounded(z.view()),
            best_x: best.1,
            iterations: objectives.len(),
            objectives,
            gradient_norms,
            passes,
            termination,
        })
    }
}

/// Runs [`Sgd`] on `objective(x, batch) -> (value, gradient)`.
pub fn sgd<F, R>(
    mut objective: F,
    x0: ArrayView1<f64>,
    bounds: &[Bound],
    n_samples: usize,
    config: &SgdConfig,
    rng: &mut R,
) -> Result<SgdResult, OptimizeError>
where
    F: FnMut(ArrayView1<f64>, &[usize]) -> (f64, Array1<f64>),
    R: Rng + ?Sized,
{
    Sgd::new(config.clone(), rng).descend(&mut objective, x0, bounds, n_samples)
}
