//! Standardized accuracy metrics for probabilistic regression.

use ndarray::ArrayView1;
use std::f64::consts::PI;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Metric inputs have different lengths: {expected} targets but {found} predictions.")]
    LengthMismatch { expected: usize, found: usize },
    #[error("Metrics need at least one target.")]
    Empty,
    #[error("Predictive variance at index {index} is {value}; it must be positive.")]
    NonPositiveVariance { index: usize, value: f64 },
    #[error("The reference targets have zero variance, so the metric is undefined.")]
    DegenerateReference,
}

fn check_lengths(y: ArrayView1<f64>, other: ArrayView1<f64>) -> Result<(), ValidationError> {
    if y.is_empty() {
        return Err(ValidationError::Empty);
    }
    if y.len() != other.len() {
        return Err(ValidationError::LengthMismatch {
            expected: y.len(),
            found: other.len(),
        });
    }
    Ok(())
}

fn mean_and_variance(values: ArrayView1<f64>) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.sum() / n;
    let variance = values.mapv(|v| (v - mean).powi(2)).sum() / n;
    (mean, variance)
}

fn gaussian_nll(y: f64, mean: f64, variance: f64) -> f64 {
    0.5 * (2.0 * PI * variance).ln() + (y - mean).powi(2) / (2.0 * variance)
}

/// Standardized mean squared error: the mean squared error divided by the
/// variance of the targets. Predicting the target mean scores one.
pub fn smse(y: ArrayView1<f64>, mean: ArrayView1<f64>) -> Result<f64, ValidationError> {
    check_lengths(y, mean)?;
    let (_, variance) = mean_and_variance(y);
    if variance <= 0.0 {
        return Err(ValidationError::DegenerateReference);
    }
    let mse = (&y - &mean).mapv(|e| e * e).sum() / y.len() as f64;
    Ok(mse / variance)
}

/// Mean standardized log loss: the average negative log predictive density
/// minus that of a Gaussian fitted to the training targets. Negative values
/// beat the trivial model.
pub fn msll(
    y: ArrayView1<f64>,
    mean: ArrayView1<f64>,
    variance: ArrayView1<f64>,
    y_train: ArrayView1<f64>,
) -> Result<f64, ValidationError> {
    if y_train.is_empty() {
        return Err(ValidationError::Empty);
    }
    let (train_mean, train_variance) = mean_and_variance(y_train);
    msll_against(y, mean, variance, train_mean, train_variance)
}

/// [`msll`] with the training statistics already summarized.
pub fn msll_against(
    y: ArrayView1<f64>,
    mean: ArrayView1<f64>,
    variance: ArrayView1<f64>,
    train_mean: f64,
    train_variance: f64,
) -> Result<f64, ValidationError> {
    check_lengths(y, mean)?;
    check_lengths(y, variance)?;
    if let Some((index, &value)) = variance
        .iter()
        .enumerate()
        .find(|(_, v)| !(**v > 0.0 && v.is_finite()))
    {
        return Err(ValidationError::NonPositiveVariance { index, value });
    }
    if train_variance <= 0.0 {
        return Err(ValidationError::DegenerateReference);
    }

    let total: f64 = y
        .iter()
        .zip(mean.iter())
        .zip(variance.iter())
        .map(|((&t, &m), &v)| gaussian_nll(t, m, v) - gaussian_nll(t, train_mean, train_variance))
        .sum();
    Ok(total / y.len() as f64)
}
