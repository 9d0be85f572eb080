//! # Bayesian Linear Regression over Random Bases
//!
//! A model `y = Φ(X; θ) w + ε` with prior `w ~ N(0, r I)` and noise
//! `ε ~ N(0, s)`. Training maximizes the evidence lower bound over the noise
//! variance `s`, the regulariser `r` and the basis hyperparameters `θ`, and
//! returns the Gaussian posterior over `w`.
//!
//! - [`bayes_regress`] solves for the optimal `q(w)` in closed form at every
//!   step of a bounded multi-start BFGS search.
//! - [`bayes_regress_sgd`] treats the posterior mean and diagonal covariance
//!   as free parameters and climbs a minibatch estimate of the bound.
//! - [`bayes_predict`] turns a posterior into predictive means and variances.

pub mod basis;
pub mod data;
pub mod estimate;
mod linalg;
pub mod model;
pub mod validation;

pub use basis::{Basis, BasisError, BasisKind, LinearBasis, RandomRbf, RandomRbfArd};
pub use data::{DataError, Dataset, load_prediction_tsv, load_training_tsv, load_tsv};
pub use estimate::{RegressConfig, bayes_regress, bayes_regress_sgd};
pub use model::{
    ModelError, Posterior, Prediction, TrainedModel, TrainingSettings, WeightCovariance,
    bayes_predict,
};
pub use validation::{ValidationError, msll, msll_against, smse};

use crate::optimize::OptimizeError;
use ndarray_linalg::error::LinalgError;
use thiserror::Error;

/// Errors raised by the trainers and by prediction.
#[derive(Error, Debug)]
pub enum RegressionError {
    #[error("Dimension mismatch in {context}: expected {expected}, found {found}.")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("The {0} contain NaN or infinite values.")]
    NonFiniteInput(&'static str),

    #[error("The {name} must be positive and finite, got {value}.")]
    InvalidHyperparameter { name: &'static str, value: f64 },

    #[error("Cannot train on an empty dataset.")]
    EmptyData,

    #[error("Failed to set up the initial variational parameters: {0}")]
    Initialization(String),

    #[error("Basis function evaluation failed: {0}")]
    Basis(#[from] BasisError),

    #[error("Optimization failed: {0}")]
    Optimize(#[from] OptimizeError),

    #[error("Linear system solve failed: {0}")]
    LinearSystemSolveFailed(#[from] LinalgError),
}
