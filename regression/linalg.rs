use ndarray::{Array2, OwnedRepr};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{CholeskyFactorized, FactorizeC, UPLO};

/// Number of increasingly large ridges tried before giving up.
const JITTER_ATTEMPTS: i32 = 8;

/// Cholesky factor of a symmetric positive-definite matrix. If the matrix is
/// numerically indefinite a small ridge, scaled to its mean diagonal, is
/// added until the factorization succeeds.
pub(crate) fn jittered_cholesky(
    matrix: &Array2<f64>,
) -> Result<CholeskyFactorized<OwnedRepr<f64>>, LinalgError> {
    let first_error = match matrix.factorizec(UPLO::Lower) {
        Ok(factor) => return Ok(factor),
        Err(e) => e,
    };

    let n = matrix.nrows().max(1) as f64;
    let scale = (matrix.diag().iter().map(|v| v.abs()).sum::<f64>() / n).max(1e-300);
    for attempt in 0..JITTER_ATTEMPTS {
        let jitter = scale * 1e-10 * 10f64.powi(attempt);
        let mut ridged = matrix.clone();
        ridged.diag_mut().mapv_inplace(|v| v + jitter);
        if let Ok(factor) = ridged.factorizec(UPLO::Lower) {
            log::warn!("Cholesky factorization needed a ridge of {jitter:.3e}");
            return Ok(factor);
        }
    }
    Err(first_error)
}
