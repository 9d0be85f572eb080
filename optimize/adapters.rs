//! Wrappers that change the parameterization an optimizer sees.

use super::bounds::{Bound, positive_exp};
use super::minimize::Minimum;
use super::sgd::SgdResult;
use super::structure::{expand_bounds, flatten, flatten_matching, shapes_of, structure};
use super::{Minimizer, OptimizeError, StochasticMinimizer, check_start};

use ndarray::{Array1, ArrayD, ArrayView1};

/// Optimizes coordinates with a [`Bound::positive`] bound as `ln x`.
///
/// The wrapped optimizer sees those coordinates unbounded, with start
/// candidates drawn within two decades of the initial value; the objective
/// still receives (and results are still reported in) the original scale.
#[derive(Debug, Clone)]
pub struct LogTrick<M> {
    inner: M,
}

pub fn logtrick_minimizer<M: Minimizer>(inner: M) -> LogTrick<M> {
    LogTrick { inner }
}

pub fn logtrick_sgd<S: StochasticMinimizer>(inner: S) -> LogTrick<S> {
    LogTrick { inner }
}

impl<M> LogTrick<M> {
    pub fn into_inner(self) -> M {
        self.inner
    }
}

/// Which coordinates move to log space, and the bounds the inner optimizer
/// sees afterwards.
fn log_space(x0: ArrayView1<f64>, bounds: &[Bound]) -> Result<(Vec<bool>, Vec<Bound>), OptimizeError> {
    check_start(x0, bounds)?;
    let mask: Vec<bool> = bounds.iter().map(Bound::is_positive).collect();
    for (index, (&value, &logged)) in x0.iter().zip(&mask).enumerate() {
        if logged && value <= 0.0 {
            return Err(OptimizeError::BoundViolation {
                index,
                value,
                lower: 0.0,
                upper: f64::INFINITY,
            });
        }
    }
    let inner_bounds = bounds
        .iter()
        .zip(&mask)
        .map(|(&b, &logged)| if logged { Bound::log_coordinate() } else { b })
        .collect();
    Ok((mask, inner_bounds))
}

fn to_log(x: ArrayView1<f64>, mask: &[bool]) -> Array1<f64> {
    Array1::from_iter(
        x.iter()
            .zip(mask)
            .map(|(&v, &logged)| if logged { v.ln() } else { v }),
    )
}

fn from_log(z: ArrayView1<f64>, mask: &[bool]) -> Array1<f64> {
    Array1::from_iter(
        z.iter()
            .zip(mask)
            .map(|(&v, &logged)| if logged { positive_exp(v) } else { v }),
    )
}

/// d/d(ln x) = x * d/dx on logged coordinates.
fn scale_gradient(x: &Array1<f64>, mut grad: Array1<f64>, mask: &[bool]) -> Array1<f64> {
    if grad.len() == x.len() {
        for ((g, &v), &logged) in grad.iter_mut().zip(x.iter()).zip(mask) {
            if logged {
                *g *= v;
            }
        }
    }
    grad
}

impl<M: Minimizer> Minimizer for LogTrick<M> {
    fn minimize(
        &mut self,
        objective: &mut dyn FnMut(ArrayView1<f64>) -> (f64, Array1<f64>),
        x0: ArrayView1<f64>,
        bounds: &[Bound],
    ) -> Result<Minimum, OptimizeError> {
        let (mask, inner_bounds) = log_space(x0, bounds)?;
        let z0 = to_log(x0, &mask);
        let mut in_log_space = |z: ArrayView1<f64>| {
            let x = from_log(z, &mask);
            let (value, grad) = objective(x.view());
            (value, scale_gradient(&x, grad, &mask))
        };
        let mut found = self.inner.minimize(&mut in_log_space, z0.view(), &inner_bounds)?;
        found.x = from_log(found.x.view(), &mask);
        found.start = from_log(found.start.view(), &mask);
        Ok(found)
    }
}

impl<S: StochasticMinimizer> StochasticMinimizer for LogTrick<S> {
    fn descend(
        &mut self,
        objective: &mut dyn FnMut(ArrayView1<f64>, &[usize]) -> (f64, Array1<f64>),
        x0: ArrayView1<f64>,
        bounds: &[Bound],
        n_samples: usize,
    ) -> Result<SgdResult, OptimizeError> {
        let (mask, inner_bounds) = log_space(x0, bounds)?;
        let z0 = to_log(x0, &mask);
        let mut in_log_space = |z: ArrayView1<f64>, batch: &[usize]| {
            let x = from_log(z, &mask);
            let (value, grad) = objective(x.view(), batch);
            (value, scale_gradient(&x, grad, &mask))
        };
        let mut result =
            self.inner
                .descend(&mut in_log_space, z0.view(), &inner_bounds, n_samples)?;
        result.x = from_log(result.x.view(), &mask);
        result.best_x = from_log(result.best_x.view(), &mask);
        Ok(result)
    }
}

/// Lets an objective work with a list of parameter blocks of arbitrary
/// shape. Bounds are given per block and apply to every element of it.
#[derive(Debug, Clone)]
pub struct Structured<M> {
    inner: M,
}

pub fn structured_minimizer<M: Minimizer>(inner: M) -> Structured<M> {
    Structured { inner }
}

pub fn structured_sgd<S: StochasticMinimizer>(inner: S) -> Structured<S> {
    Structured { inner }
}

/// Runs a block objective on a flat vector, parking the first shape error
/// so it can be reported once the optimizer returns.
fn call_blocks<F>(
    objective: &mut F,
    x: ArrayView1<f64>,
    shapes: &[Vec<usize>],
    failure: &mut Option<OptimizeError>,
) -> (f64, Array1<f64>)
where
    F: FnMut(&[ArrayD<f64>]) -> (f64, Vec<ArrayD<f64>>),
{
    let outcome = structure(x, shapes).and_then(|blocks| {
        let (value, grads) = objective(&blocks);
        flatten_matching(&grads, shapes).map(|g| (value, g))
    });
    outcome.unwrap_or_else(|e| {
        failure.get_or_insert(e);
        (f64::NAN, Array1::zeros(x.len()))
    })
}

impl<M: Minimizer> Structured<M> {
    /// Minimizes a block objective `f(blocks) -> (value, gradient blocks)`.
    /// Returns the optimal blocks along with the flat [`Minimum`].
    pub fn minimize<F>(
        &mut self,
        mut objective: F,
        x0: &[ArrayD<f64>],
        bounds: &[Bound],
    ) -> Result<(Vec<ArrayD<f64>>, Minimum), OptimizeError>
    where
        F: FnMut(&[ArrayD<f64>]) -> (f64, Vec<ArrayD<f64>>),
    {
        let shapes = shapes_of(x0);
        let flat_bounds = expand_bounds(bounds, &shapes)?;
        let flat0 = flatten(x0);

        let mut failure = None;
        let mut flat_objective =
            |x: ArrayView1<f64>| call_blocks(&mut objective, x, &shapes, &mut failure);
        let result = self
            .inner
            .minimize(&mut flat_objective, flat0.view(), &flat_bounds);
        if let Some(e) = failure {
            return Err(e);
        }
        let found = result?;
        Ok((structure(found.x.view(), &shapes)?, found))
    }
}

impl<S: StochasticMinimizer> Structured<S> {
    /// Stochastic counterpart of [`Structured::minimize`]; the objective also
    /// receives the minibatch row indices.
    pub fn descend<F>(
        &mut self,
        mut objective: F,
        x0: &[ArrayD<f64>],
        bounds: &[Bound],
        n_samples: usize,
    ) -> Result<(Vec<ArrayD<f64>>, SgdResult), OptimizeError>
    where
        F: FnMut(&[ArrayD<f64>], &[usize]) -> (f64, Vec<ArrayD<f64>>),
    {
        let shapes = shapes_of(x0);
        let flat_bounds = expand_bounds(bounds, &shapes)?;
        let flat0 = flatten(x0);

        let mut failure = None;
        let mut flat_objective = |x: ArrayView1<f64>, batch: &[usize]| {
            let mut with_batch = |blocks: &[ArrayD<f64>]| objective(blocks, batch);
            call_blocks(&mut with_batch, x, &shapes, &mut failure)
        };
        let result = self
            .inner
            .descend(&mut flat_objective, flat0.view(), &flat_bounds, n_samples);
        if let Some(e) = failure {
            return Err(e);
        }
        let result = result?;
        Ok((structure(result.x.view(), &shapes)?, result))
    }
}
