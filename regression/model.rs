use super::RegressionError;
use super::basis::{Basis, BasisError, BasisKind};
use super::estimate::{RegressConfig, bayes_regress, bayes_regress_sgd};
use crate::optimize::SgdConfig;

use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Covariance of the weight posterior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WeightCovariance {
    Full(Array2<f64>),
    /// Only the diagonal, one variance per weight.
    Diagonal(Array1<f64>),
}

impl WeightCovariance {
    pub fn dim(&self) -> usize {
        match self {
            WeightCovariance::Full(c) => c.nrows(),
            WeightCovariance::Diagonal(c) => c.len(),
        }
    }

    pub fn trace(&self) -> f64 {
        match self {
            WeightCovariance::Full(c) => c.diag().sum(),
            WeightCovariance::Diagonal(c) => c.sum(),
        }
    }

    /// `diag(Φ C Φᵀ)`: the variance of each row's latent function value.
    fn latent_variance(&self, phi: &Array2<f64>) -> Array1<f64> {
        match self {
            WeightCovariance::Full(c) => (phi.dot(c) * phi).sum_axis(Axis(1)),
            WeightCovariance::Diagonal(c) => phi.mapv(|v| v * v).dot(c),
        }
    }
}

/// Gaussian posterior over the weights together with the hyperparameters it
/// was computed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posterior {
    pub weights: Array1<f64>,
    pub covariance: WeightCovariance,
    pub hypers: Vec<ArrayD<f64>>,
    pub noise_variance: f64,
    /// Prior variance of each weight.
    pub regulariser: f64,
    /// False when training stopped on a budget rather than a tolerance.
    pub converged: bool,
    /// Minibatch `-ELBO / N` of every stochastic iteration; empty for the
    /// closed-form trainer.
    #[serde(default)]
    pub objective_trace: Vec<f64>,
}

/// Predictive distribution at a set of query rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub mean: Array1<f64>,
    /// Variance of the noise-free function value.
    pub latent_variance: Array1<f64>,
    /// Latent variance plus the noise variance.
    pub variance: Array1<f64>,
}

/// Predictive mean and variances of `posterior` at the rows of `x`.
pub fn bayes_predict<B: Basis + ?Sized>(
    x: ArrayView2<f64>,
    basis: &B,
    posterior: &Posterior,
) -> Result<Prediction, RegressionError> {
    let phi = basis.transform(x, &posterior.hypers)?;
    if phi.ncols() != posterior.weights.len() || posterior.covariance.dim() != phi.ncols() {
        return Err(RegressionError::ShapeMismatch {
            context: "feature count versus posterior",
            expected: posterior.weights.len(),
            found: phi.ncols(),
        });
    }

    let mean = phi.dot(&posterior.weights);
    let latent_variance = posterior
        .covariance
        .latent_variance(&phi)
        .mapv(|v| v.max(0.0));
    let variance = &latent_variance + posterior.noise_variance;
    Ok(Prediction {
        mean,
        latent_variance,
        variance,
    })
}

/// Which trainer produced a model, with the settings it ran under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrainingSettings {
    ClosedForm(RegressConfig),
    Stochastic(SgdConfig),
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Prediction data has {found} feature columns, but the model was trained on {expected}.")]
    FeatureCountMismatch { expected: usize, found: usize },
    #[error("The saved basis does not accept the trained hyperparameters: {0}")]
    Basis(#[from] BasisError),
    #[error("Training or prediction failed: {0}")]
    Regression(#[from] RegressionError),
}

/// Everything needed to predict with a trained model, in a form that can be
/// written to and read from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub settings: TrainingSettings,
    pub seed: u64,
    pub feature_names: Vec<String>,
    /// The feature map, including its random draws and trained
    /// hyperparameters.
    pub basis: BasisKind,
    pub posterior: Posterior,
    /// Mean of the training targets, removed before training and added back
    /// to every prediction.
    pub target_mean: f64,
    pub target_variance: f64,
}

impl TrainedModel {
    /// Centres the targets, runs the selected trainer and packages the
    /// result. The starting hyperparameters are the basis defaults.
    #[allow(clippy::too_many_arguments)]
    pub fn fit<R: Rng + ?Sized>(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        feature_names: Vec<String>,
        basis: BasisKind,
        settings: TrainingSettings,
        var: f64,
        regulariser: f64,
        seed: u64,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        let n = y.len().max(1) as f64;
        let target_mean = y.sum() / n;
        let target_variance = y.mapv(|v| (v - target_mean).powi(2)).sum() / n;
        let centred = y.mapv(|v| v - target_mean);
        let hypers = basis.default_hypers();

        let posterior = match &settings {
            TrainingSettings::ClosedForm(config) => bayes_regress(
                x,
                centred.view(),
                &basis,
                &hypers,
                var,
                regulariser,
                config,
                rng,
            )?,
            TrainingSettings::Stochastic(config) => bayes_regress_sgd(
                x,
                centred.view(),
                &basis,
                &hypers,
                var,
                regulariser,
                config,
                rng,
            )?,
        };
        let basis = basis.with_hypers(&posterior.hypers)?;

        Ok(Self {
            settings,
            seed,
            feature_names,
            basis,
            posterior,
            target_mean,
            target_variance,
        })
    }

    /// Predictions on the original target scale.
    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Prediction, ModelError> {
        if x.ncols() != self.basis.input_dim() {
            return Err(ModelError::FeatureCountMismatch {
                expected: self.basis.input_dim(),
                found: x.ncols(),
            });
        }
        let mut prediction = bayes_predict(x, &self.basis, &self.posterior)?;
        prediction.mean += self.target_mean;
        Ok(prediction)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        fs::write(path, toml_string)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}
