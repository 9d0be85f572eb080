use crate::optimize::Bound;
use ndarray::{Array1, Array2, ArrayD, ArrayView2, Axis, Zip, concatenate};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or evaluating a feature map.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BasisError {
    #[error("Basis expects inputs with {expected} columns, but the input has {found}.")]
    InputDimensionMismatch { expected: usize, found: usize },

    #[error("Basis takes {expected} hyperparameter blocks, but {found} were supplied.")]
    HyperCountMismatch { expected: usize, found: usize },

    #[error("Hyperparameter block {index} has shape {found:?}, expected {expected:?}.")]
    HyperShapeMismatch {
        index: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Hyperparameter block {index} holds {value}, which is outside its bound.")]
    HyperOutOfBounds { index: usize, value: f64 },

    #[error("A random basis needs at least one basis function and one input dimension, got {nbases} and {input_dim}.")]
    InvalidSize { nbases: usize, input_dim: usize },
}

/// A feature map `Φ = transform(X; θ)` with analytic derivatives in `θ`.
///
/// Hyperparameters come in blocks (a zero-dimensional block for a scalar, a
/// vector for per-dimension values). `grad` returns one `N × M` matrix per
/// scalar hyperparameter, in the flattened order of the blocks.
pub trait Basis {
    fn input_dim(&self) -> usize;

    fn output_dim(&self) -> usize;

    /// Starting values for every hyperparameter block.
    fn default_hypers(&self) -> Vec<ArrayD<f64>>;

    /// One bound per hyperparameter block.
    fn hyper_bounds(&self) -> Vec<Bound>;

    fn transform(&self, x: ArrayView2<f64>, hypers: &[ArrayD<f64>]) -> Result<Array2<f64>, BasisError>;

    fn grad(&self, x: ArrayView2<f64>, hypers: &[ArrayD<f64>])
    -> Result<Vec<Array2<f64>>, BasisError>;

    /// Number of scalar hyperparameters across all blocks.
    fn n_hypers(&self) -> usize {
        self.default_hypers().iter().map(|h| h.len()).sum()
    }
}

/// Validates the input width and the hyperparameter blocks against the
/// shapes and bounds a basis declares.
fn check_inputs<B: Basis + ?Sized>(
    basis: &B,
    x: ArrayView2<f64>,
    hypers: &[ArrayD<f64>],
) -> Result<(), BasisError> {
    if x.ncols() != basis.input_dim() {
        return Err(BasisError::InputDimensionMismatch {
            expected: basis.input_dim(),
            found: x.ncols(),
        });
    }
    let expected = basis.default_hypers();
    if hypers.len() != expected.len() {
        return Err(BasisError::HyperCountMismatch {
            expected: expected.len(),
            found: hypers.len(),
        });
    }
    for (index, ((given, reference), bound)) in hypers
        .iter()
        .zip(&expected)
        .zip(basis.hyper_bounds())
        .enumerate()
    {
        if given.shape() != reference.shape() {
            return Err(BasisError::HyperShapeMismatch {
                index,
                expected: reference.shape().to_vec(),
                found: given.shape().to_vec(),
            });
        }
        if let Some(&value) = given.iter().find(|v| !bound.contains(**v) || (bound.is_positive() && **v <= 0.0)) {
            return Err(BasisError::HyperOutOfBounds { index, value });
        }
    }
    Ok(())
}

/// The raw inputs, optionally followed by a column of ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearBasis {
    pub input_dim: usize,
    pub bias: bool,
}

impl LinearBasis {
    pub fn new(input_dim: usize, bias: bool) -> Self {
        Self { input_dim, bias }
    }
}

impl Basis for LinearBasis {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn output_dim(&self) -> usize {
        self.input_dim + usize::from(self.bias)
    }

    fn default_hypers(&self) -> Vec<ArrayD<f64>> {
        Vec::new()
    }

    fn hyper_bounds(&self) -> Vec<Bound> {
        Vec::new()
    }

    fn transform(&self, x: ArrayView2<f64>, hypers: &[ArrayD<f64>]) -> Result<Array2<f64>, BasisError> {
        check_inputs(self, x, hypers)?;
        if !self.bias {
            return Ok(x.to_owned());
        }
        let ones = Array2::ones((x.nrows(), 1));
        concatenate(Axis(1), &[x.view(), ones.view()]).map_err(|_| BasisError::InputDimensionMismatch {
            expected: self.input_dim,
            found: x.ncols(),
        })
    }

    fn grad(&self, x: ArrayView2<f64>, hypers: &[ArrayD<f64>]) -> Result<Vec<Array2<f64>>, BasisError> {
        check_inputs(self, x, hypers)?;
        Ok(Vec::new())
    }
}

/// Draws the `input_dim × nbases` frequency matrix of a random Fourier basis.
fn draw_frequencies<R: Rng + ?Sized>(
    nbases: usize,
    input_dim: usize,
    rng: &mut R,
) -> Result<Array2<f64>, BasisError> {
    if nbases == 0 || input_dim == 0 {
        return Err(BasisError::InvalidSize { nbases, input_dim });
    }
    Ok(Array2::from_shape_fn((input_dim, nbases), |_| {
        StandardNormal.sample(rng)
    }))
}

/// `[cos(P), sin(P)] / sqrt(nbases)` for projections `P`.
fn fourier_features(projection: &Array2<f64>) -> Result<Array2<f64>, BasisError> {
    let scale = 1.0 / (projection.ncols() as f64).sqrt();
    let cos = projection.mapv(|p| p.cos() * scale);
    let sin = projection.mapv(|p| p.sin() * scale);
    concatenate(Axis(1), &[cos.view(), sin.view()]).map_err(|_| BasisError::InvalidSize {
        nbases: projection.ncols(),
        input_dim: projection.nrows(),
    })
}

/// Derivative of [`fourier_features`] given `dP`, the derivative of the
/// projections with respect to one hyperparameter.
fn fourier_features_grad(projection: &Array2<f64>, d_projection: &Array2<f64>) -> Result<Array2<f64>, BasisError> {
    let scale = 1.0 / (projection.ncols() as f64).sqrt();
    let mut d_cos = Array2::zeros(projection.raw_dim());
    let mut d_sin = Array2::zeros(projection.raw_dim());
    Zip::from(&mut d_cos)
        .and(&mut d_sin)
        .and(projection)
        .and(d_projection)
        .for_each(|dc, ds, &p, &dp| {
            *dc = -p.sin() * dp * scale;
            *ds = p.cos() * dp * scale;
        });
    concatenate(Axis(1), &[d_cos.view(), d_sin.view()]).map_err(|_| BasisError::InvalidSize {
        nbases: projection.ncols(),
        input_dim: projection.nrows(),
    })
}

/// Random Fourier features approximating an isotropic RBF kernel, with one
/// scalar length scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomRbf {
    pub lenscale: f64,
    frequencies: Array2<f64>,
}

impl RandomRbf {
    pub fn new<R: Rng + ?Sized>(
        nbases: usize,
        input_dim: usize,
        lenscale: f64,
        rng: &mut R,
    ) -> Result<Self, BasisError> {
        Ok(Self {
            lenscale,
            frequencies: draw_frequencies(nbases, input_dim, rng)?,
        })
    }

    fn projection(&self, x: ArrayView2<f64>, lenscale: f64) -> Array2<f64> {
        x.dot(&self.frequencies) / lenscale
    }
}

fn scalar_hyper(hypers: &[ArrayD<f64>]) -> f64 {
    hypers
        .first()
        .and_then(|h| h.iter().next().copied())
        .unwrap_or(f64::NAN)
}

impl Basis for RandomRbf {
    fn input_dim(&self) -> usize {
        self.frequencies.nrows()
    }

    fn output_dim(&self) -> usize {
        2 * self.frequencies.ncols()
    }

    fn default_hypers(&self) -> Vec<ArrayD<f64>> {
        vec![ndarray::arr0(self.lenscale).into_dyn()]
    }

    fn hyper_bounds(&self) -> Vec<Bound> {
        vec![Bound::positive()]
    }

    fn transform(&self, x: ArrayView2<f64>, hypers: &[ArrayD<f64>]) -> Result<Array2<f64>, BasisError> {
        check_inputs(self, x, hypers)?;
        fourier_features(&self.projection(x, scalar_hyper(hypers)))
    }

    fn grad(&self, x: ArrayView2<f64>, hypers: &[ArrayD<f64>]) -> Result<Vec<Array2<f64>>, BasisError> {
        check_inputs(self, x, hypers)?;
        let lenscale = scalar_hyper(hypers);
        let projection = self.projection(x, lenscale);
        // P = XW / l, so dP/dl = -P / l.
        let d_projection = projection.mapv(|p| -p / lenscale);
        Ok(vec![fourier_features_grad(&projection, &d_projection)?])
    }
}

/// Random Fourier features approximating an RBF kernel with one length
/// scale per input dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomRbfArd {
    pub lenscales: Array1<f64>,
    frequencies: Array2<f64>,
}

impl RandomRbfArd {
    pub fn new<R: Rng + ?Sized>(
        nbases: usize,
        lenscales: Array1<f64>,
        rng: &mut R,
    ) -> Result<Self, BasisError> {
        let frequencies = draw_frequencies(nbases, lenscales.len(), rng)?;
        Ok(Self {
            lenscales,
            frequencies,
        })
    }

    fn lenscales_of(hypers: &[ArrayD<f64>]) -> Array1<f64> {
        hypers
            .first()
            .map(|h| Array1::from_iter(h.iter().copied()))
            .unwrap_or_else(|| Array1::zeros(0))
    }
}

impl Basis for RandomRbfArd {
    fn input_dim(&self) -> usize {
        self.frequencies.nrows()
    }

    fn output_dim(&self) -> usize {
        2 * self.frequencies.ncols()
    }

    fn default_hypers(&self) -> Vec<ArrayD<f64>> {
        vec![self.lenscales.clone().into_dyn()]
    }

    fn hyper_bounds(&self) -> Vec<Bound> {
        vec![Bound::positive()]
    }

    fn transform(&self, x: ArrayView2<f64>, hypers: &[ArrayD<f64>]) -> Result<Array2<f64>, BasisError> {
        check_inputs(self, x, hypers)?;
        let lenscales = Self::lenscales_of(hypers);
        let scaled = &x / &lenscales;
        fourier_features(&scaled.dot(&self.frequencies))
    }

    fn grad(&self, x: ArrayView2<f64>, hypers: &[ArrayD<f64>]) -> Result<Vec<Array2<f64>>, BasisError> {
        check_inputs(self, x, hypers)?;
        let lenscales = Self::lenscales_of(hypers);
        let scaled = &x / &lenscales;
        let projection = scaled.dot(&self.frequencies);

        let mut grads = Vec::with_capacity(lenscales.len());
        for (k, &l) in lenscales.iter().enumerate() {
            // Only column k of X is scaled by l_k: dP/dl_k = -(x_k / l_k^2) w_kᵀ.
            let column = x.column(k).mapv(|v| -v / (l * l));
            let d_projection = column
                .insert_axis(Axis(1))
                .dot(&self.frequencies.row(k).insert_axis(Axis(0)));
            grads.push(fourier_features_grad(&projection, &d_projection)?);
        }
        Ok(grads)
    }
}

/// The feature maps the command line and model files know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BasisKind {
    Linear(LinearBasis),
    RandomRbf(RandomRbf),
    RandomRbfArd(RandomRbfArd),
}

impl BasisKind {
    fn inner(&self) -> &dyn Basis {
        match self {
            BasisKind::Linear(b) => b,
            BasisKind::RandomRbf(b) => b,
            BasisKind::RandomRbfArd(b) => b,
        }
    }

    /// Stores optimized hyperparameters as the basis defaults, so the saved
    /// basis reproduces the trained feature map on its own.
    pub fn with_hypers(mut self, hypers: &[ArrayD<f64>]) -> Result<Self, BasisError> {
        let expected = self.inner().default_hypers();
        if hypers.len() != expected.len() {
            return Err(BasisError::HyperCountMismatch {
                expected: expected.len(),
                found: hypers.len(),
            });
        }
        match &mut self {
            BasisKind::Linear(_) => {}
            BasisKind::RandomRbf(b) => b.lenscale = scalar_hyper(hypers),
            BasisKind::RandomRbfArd(b) => b.lenscales = RandomRbfArd::lenscales_of(hypers),
        }
        Ok(self)
    }
}

impl Basis for BasisKind {
    fn input_dim(&self) -> usize {
        self.inner().input_dim()
    }

    fn output_dim(&self) -> usize {
        self.inner().output_dim()
    }

    fn default_hypers(&self) -> Vec<ArrayD<f64>> {
        self.inner().default_hypers()
    }

    fn hyper_bounds(&self) -> Vec<Bound> {
        self.inner().hyper_bounds()
    }

    fn transform(&self, x: ArrayView2<f64>, hypers: &[ArrayD<f64>]) -> Result<Array2<f64>, BasisError> {
        self.inner().transform(x, hypers)
    }

    fn grad(&self, x: ArrayView2<f64>, hypers: &[ArrayD<f64>]) -> Result<Vec<Array2<f64>>, BasisError> {
        self.inner().grad(x, hypers)
    }
}
