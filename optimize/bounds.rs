//! Box bounds and the reparameterizations that remove them.
//!
//! A bounded coordinate `x` is never handed to a search directly. Instead the
//! search moves an unconstrained `z` and the objective sees `x = t(z)`, where
//! `t` depends on which sides of the bound are finite:
//!
//! | lower | upper | `x = t(z)`                        |
//! |-------|-------|-----------------------------------|
//! | `lo`  | `hi`  | `lo + (hi - lo) * logistic(z)`    |
//! | `lo`  | open  | `lo + exp(z)`                     |
//! | open  | `hi`  | `hi - exp(z)`                     |
//! | open  | open  | `z`                               |
//!
//! A bound with `lo == hi` pins the coordinate and has zero derivative.

use super::OptimizeError;
use ndarray::{Array1, ArrayView1};

/// Half-width, in logistic units, of the start-point search window for a
/// coordinate bounded on both sides. `logistic(4) ≈ 0.982`.
const LOGISTIC_SEARCH_HALF_WIDTH: f64 = 4.0;

/// Half-width, in log units, of the start-point search window for a
/// coordinate bounded on one side: two decades either way.
const LOG_SEARCH_HALF_WIDTH: f64 = 4.605_170_185_988_091;

/// Relative half-width of the start-point search window for an unbounded
/// coordinate.
const LINEAR_SEARCH_SCALE: f64 = 10.0;

/// A closed interval `[lower, upper]` where either side may be open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound {
    lower: Option<f64>,
    upper: Option<f64>,
    /// Open on both sides, but the coordinate is a logarithm, so start
    /// candidates are drawn within two decades of the initial value.
    log_window: bool,
}

impl Default for Bound {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl Bound {
    /// Builds a bound. Infinite limits are treated as open sides.
    pub fn new(lower: Option<f64>, upper: Option<f64>) -> Result<Self, OptimizeError> {
        let lower = lower.filter(|v| *v != f64::NEG_INFINITY);
        let upper = upper.filter(|v| *v != f64::INFINITY);
        let lo = lower.unwrap_or(f64::NEG_INFINITY);
        let hi = upper.unwrap_or(f64::INFINITY);
        if lo.is_nan() || hi.is_nan() || lo == f64::INFINITY || hi == f64::NEG_INFINITY || lo > hi {
            return Err(OptimizeError::InvalidBound {
                lower: lo,
                upper: hi,
            });
        }
        Ok(Self {
            lower,
            upper,
            log_window: false,
        })
    }

    /// A bound finite on both sides.
    pub fn between(lower: f64, upper: f64) -> Result<Self, OptimizeError> {
        Self::new(Some(lower), Some(upper))
    }

    pub const fn unbounded() -> Self {
        Self {
            lower: None,
            upper: None,
            log_window: false,
        }
    }

    /// An unbounded coordinate holding `ln x` for a positive `x`. It moves
    /// freely, but its start window is `ln x0 ± ln 100` rather than the wide
    /// linear window of [`Bound::unbounded`].
    pub(crate) const fn log_coordinate() -> Self {
        Self {
            lower: None,
            upper: None,
            log_window: true,
        }
    }

    /// The strictly positive half-line, realized with the log transform.
    pub const fn positive() -> Self {
        Self {
            lower: Some(0.0),
            upper: None,
            log_window: false,
        }
    }

    pub fn lower(&self) -> Option<f64> {
        self.lower
    }

    pub fn upper(&self) -> Option<f64> {
        self.upper
    }

    pub fn is_positive(&self) -> bool {
        self.lower == Some(0.0) && self.upper.is_none()
    }

    /// Whether `x` lies inside the closed interval. NaN is never inside.
    pub fn contains(&self, x: f64) -> bool {
        if x.is_nan() {
            return false;
        }
        self.lower.is_none_or(|lo| x >= lo) && self.upper.is_none_or(|hi| x <= hi)
    }

    /// Maps an unconstrained value into the bound.
    pub fn to_bounded(&self, z: f64) -> f64 {
        match (self.lower, self.upper) {
            (Some(lo), Some(hi)) if lo == hi => lo,
            (Some(lo), Some(hi)) => (lo + (hi - lo) * logistic(z)).clamp(lo, hi),
            (Some(lo), None) => lo + positive_exp(z),
            (None, Some(hi)) => hi - positive_exp(z),
            (None, None) => z,
        }
    }

    /// Inverse of [`Bound::to_bounded`]. Values on a finite edge map to a
    /// large but finite unconstrained value.
    pub fn to_unconstrained(&self, x: f64) -> f64 {
        match (self.lower, self.upper) {
            (Some(lo), Some(hi)) if lo == hi => 0.0,
            (Some(lo), Some(hi)) => {
                let p = ((x - lo) / (hi - lo)).clamp(1e-15, 1.0 - 1e-15);
                p.ln() - (-p).ln_1p()
            }
            (Some(lo), None) => (x - lo).max(f64::MIN_POSITIVE).ln(),
            (None, Some(hi)) => (hi - x).max(f64::MIN_POSITIVE).ln(),
            (None, None) => x,
        }
    }

    /// Derivative `dx/dz` of [`Bound::to_bounded`] at `z`.
    pub fn derivative(&self, z: f64) -> f64 {
        match (self.lower, self.upper) {
            (Some(lo), Some(hi)) if lo == hi => 0.0,
            (Some(lo), Some(hi)) => {
                let s = logistic(z);
                (hi - lo) * s * (1.0 - s)
            }
            (Some(_), None) => positive_exp(z),
            (None, Some(_)) => -positive_exp(z),
            (None, None) => 1.0,
        }
    }

    /// Interval of unconstrained values to draw start candidates from,
    /// centred on the caller's initial value where a side is open.
    pub(crate) fn search_interval(&self, x0: f64) -> (f64, f64) {
        match (self.lower, self.upper) {
            (Some(lo), Some(hi)) if lo == hi => (0.0, 0.0),
            (Some(_), Some(_)) => (-LOGISTIC_SEARCH_HALF_WIDTH, LOGISTIC_SEARCH_HALF_WIDTH),
            (Some(lo), None) => log_window(x0 - lo),
            (None, Some(hi)) => log_window(hi - x0),
            (None, None) if self.log_window => {
                (x0 - LOG_SEARCH_HALF_WIDTH, x0 + LOG_SEARCH_HALF_WIDTH)
            }
            (None, None) => {
                let half = LINEAR_SEARCH_SCALE * x0.abs().max(1.0);
                (x0 - half, x0 + half)
            }
        }
    }
}

fn log_window(gap: f64) -> (f64, f64) {
    let centre = if gap > 0.0 { gap.ln() } else { 0.0 };
    (centre - LOG_SEARCH_HALF_WIDTH, centre + LOG_SEARCH_HALF_WIDTH)
}

/// `exp(z)` kept strictly positive when it would underflow.
pub(crate) fn positive_exp(z: f64) -> f64 {
    z.exp().max(f64::MIN_POSITIVE)
}

fn logistic(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Coordinate-wise reparameterization of a whole parameter vector.
#[derive(Debug, Clone)]
pub struct BoundTransform {
    bounds: Vec<Bound>,
}

impl BoundTransform {
    pub fn new(bounds: &[Bound]) -> Self {
        Self {
            bounds: bounds.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub fn to_bounded(&self, z: ArrayView1<f64>) -> Array1<f64> {
        Array1::from_iter(z.iter().zip(&self.bounds).map(|(&v, b)| b.to_bounded(v)))
    }

    pub fn to_unconstrained(&self, x: ArrayView1<f64>) -> Array1<f64> {
        Array1::from_iter(
            x.iter()
                .zip(&self.bounds)
                .map(|(&v, b)| b.to_unconstrained(v)),
        )
    }

    /// Chain rule: converts a gradient with respect to `x = t(z)` into a
    /// gradient with respect to `z`.
    pub fn chain_gradient(&self, z: ArrayView1<f64>, grad_x: ArrayView1<f64>) -> Array1<f64> {
        Array1::from_iter(
            z.iter()
                .zip(grad_x.iter())
                .zip(&self.bounds)
                .map(|((&zi, &gx), b)| gx * b.derivative(zi)),
        )
    }
}
