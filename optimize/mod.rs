//! # General-Purpose Numeric Optimization
//!
//! Two families of optimizers live here, both operating on flat `Array1<f64>`
//! parameter vectors:
//!
//! - Deterministic minimization: [`LocalBfgs`] runs a BFGS search with a Wolfe
//!   line search from a single start, and [`MultiStart`] (or the free function
//!   [`minimize_bounded_start`]) screens candidate start points inside the
//!   bounds and keeps the best local optimum.
//! - Stochastic minimization: [`Sgd`] (or the free function [`sgd`]) walks
//!   shuffled minibatches of a dataset, scaling each step with a [`RateRule`].
//!
//! Bounds never reach the underlying search directly. Every bounded coordinate
//! is reparameterized into an unconstrained variable (see [`bounds`]), so the
//! searches always move through the whole real line.
//!
//! Adapters compose on top of either family:
//!
//! - [`LogTrick`] moves coordinates with a [`Bound::positive`] bound into log
//!   space and reports results back exponentiated.
//! - [`Structured`] lets objectives take named parameter blocks of any shape
//!   while the wrapped optimizer only sees the flattened vector.

pub mod adapters;
pub mod bounds;
pub mod minimize;
pub mod sgd;
pub mod structure;

pub use bounds::{Bound, BoundTransform};
pub use minimize::{
    LocalBfgs, MultiStart, Minimum, StartConfig, StartStrategy, candidate_start_points_lattice,
    candidate_start_points_random, minimize_bounded_start,
};
pub use sgd::{AdaDelta, AdaGrad, Momentum, RateRule, Sgd, SgdConfig, SgdResult, Termination, sgd};
pub use adapters::{
    LogTrick, Structured, logtrick_minimizer, logtrick_sgd, structured_minimizer, structured_sgd,
};
pub use structure::{flatten, shapes_of, structure, total_size};

use ndarray::{Array1, ArrayView1};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the optimizers and their adapters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizeError {
    #[error("Dimension mismatch in {context}: expected {expected}, found {found}.")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("The objective or its gradient became non-finite ({detail}).")]
    NumericDivergence { detail: String },

    #[error("Parameter {index} with value {value} lies outside its bound [{lower}, {upper}].")]
    BoundViolation {
        index: usize,
        value: f64,
        lower: f64,
        upper: f64,
    },

    #[error("Invalid bound: lower limit {lower} exceeds upper limit {upper} or is not a number.")]
    InvalidBound { lower: f64, upper: f64 },

    #[error("Invalid optimizer configuration: {0}")]
    InvalidConfig(String),
}

/// A deterministic minimizer of a flat objective `f(x) -> (value, gradient)`.
pub trait Minimizer {
    fn minimize(
        &mut self,
        objective: &mut dyn FnMut(ArrayView1<f64>) -> (f64, Array1<f64>),
        x0: ArrayView1<f64>,
        bounds: &[Bound],
    ) -> Result<Minimum, OptimizeError>;
}

/// A minimizer whose objective is evaluated on minibatches of row indices
/// drawn from a dataset of `n_samples` rows.
pub trait StochasticMinimizer {
    fn descend(
        &mut self,
        objective: &mut dyn FnMut(ArrayView1<f64>, &[usize]) -> (f64, Array1<f64>),
        x0: ArrayView1<f64>,
        bounds: &[Bound],
        n_samples: usize,
    ) -> Result<SgdResult, OptimizeError>;
}

/// Rejects a starting point whose length differs from the bounds or whose
/// coordinates sit outside them.
pub(crate) fn check_start(x0: ArrayView1<f64>, bounds: &[Bound]) -> Result<(), OptimizeError> {
    if x0.len() != bounds.len() {
        return Err(OptimizeError::ShapeMismatch {
            context: "start point versus bounds",
            expected: bounds.len(),
            found: x0.len(),
        });
    }
    for (index, (&value, bound)) in x0.iter().zip(bounds).enumerate() {
        if !bound.contains(value) {
            return Err(OptimizeError::BoundViolation {
                index,
                value,
                lower: bound.lower().unwrap_or(f64::NEG_INFINITY),
                upper: bound.upper().unwrap_or(f64::INFINITY),
            });
        }
    }
    Ok(())
}

/// Converts an optional wall-clock budget in seconds into a `Duration`.
pub(crate) fn walltime_budget(secs: Option<f64>) -> Result<Option<Duration>, OptimizeError> {
    secs.map(|s| {
        Duration::try_from_secs_f64(s).map_err(|_| {
            OptimizeError::InvalidConfig(format!(
                "walltime must be a finite, non-negative number of seconds, got {s}"
            ))
        })
    })
    .transpose()
}
