//! Linear algebra helpers for covariance handling.
//!
//! Public API:
//!     pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn spd_cholesky(m: &DMatrix<f64>, what: &'static str) -> Result<Cholesky<f64, Dyn>>
//!     pub fn psd_square_root(m: &DMatrix<f64>, what: &'static str) -> Result<DMatrix<f64>>
//!     pub fn matrix_square_root(m: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>>
//!
//! Covariances coming from users are validated strictly (`spd_cholesky`, `psd_square_root`).
//! Covariances produced internally by the Kalman baselines drift numerically and go through the
//! forgiving pipeline instead:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp)
//! 4) Symmetric EVD with eigenvalue floor → S = U * sqrt(Λ⁺) * Uᵀ

use crate::errors::{FilterError, Result};

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DVector, Dyn};

/// Relative tolerance used when checking symmetry and semi-definiteness of user input.
const SYMMETRY_TOLERANCE: f64 = 1e-9;
const INITIAL_JITTER: f64 = 1e-12;
const MAX_JITTER: f64 = 1e-6;
const MAX_TRIES: usize = 6;
const EIGEN_FLOOR: f64 = 1e-12;

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Check that a square matrix is symmetric up to a tolerance relative to its largest entry.
pub fn is_symmetric(m: &DMatrix<f64>) -> bool {
    if !m.is_square() {
        return false;
    }
    let scale = m.amax().max(1.0);
    (m - m.transpose()).amax() <= SYMMETRY_TOLERANCE * scale
}

/// Cholesky factor of a user supplied covariance, rejecting anything that is not square,
/// symmetric, finite, and positive definite.
pub fn spd_cholesky(m: &DMatrix<f64>, what: &'static str) -> Result<Cholesky<f64, Dyn>> {
    if !m.is_square() {
        return Err(FilterError::dimension(what, m.nrows(), m.ncols()));
    }
    if m.iter().any(|v| !v.is_finite()) || !is_symmetric(m) {
        return Err(FilterError::NotPositiveDefinite(what));
    }
    Cholesky::new(symmetrize(m)).ok_or(FilterError::NotPositiveDefinite(what))
}

/// Square root `S` with `S Sᵀ = m` for a positive semi-definite matrix.
///
/// Positive definite input takes the Cholesky path. Singular input (a zero process noise, or
/// noise that only drives some of the states) falls back to a symmetric eigendecomposition
/// where eigenvalues within tolerance of zero are clamped to exactly zero, so a zero matrix
/// yields a zero square root rather than jitter.
pub fn psd_square_root(m: &DMatrix<f64>, what: &'static str) -> Result<DMatrix<f64>> {
    if !m.is_square() {
        return Err(FilterError::dimension(what, m.nrows(), m.ncols()));
    }
    if m.iter().any(|v| !v.is_finite()) || !is_symmetric(m) {
        return Err(FilterError::NotPositiveSemiDefinite(what));
    }
    let p = symmetrize(m);
    if let Some(s) = chol_sqrt(&p) {
        return Ok(s);
    }
    let se = SymmetricEigen::new(p);
    let scale = se.eigenvalues.amax().max(1.0);
    if se.eigenvalues.iter().any(|&l| l < -SYMMETRY_TOLERANCE * scale) {
        return Err(FilterError::NotPositiveSemiDefinite(what));
    }
    let sqrt_vals = se.eigenvalues.map(|l| l.max(0.0).sqrt());
    let u = se.eigenvectors;
    Ok(&u * DMatrix::from_diagonal(&sqrt_vals) * u.transpose())
}

/// Robust symmetric square root `S` such that approximately `matrix ≈ S * Sᵀ`.
///
/// Intended for covariances computed inside the filters, which may lose definiteness through
/// round-off. Never fails for a square input: the last resort floors the eigenvalues.
pub fn matrix_square_root(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    assert!(
        matrix.is_square(),
        "matrix_square_root: matrix must be square"
    );
    let p = symmetrize(matrix);
    if let Some(s) = chol_sqrt(&p) {
        return s;
    }
    if let Some(s) = chol_sqrt_with_jitter(&p, INITIAL_JITTER, MAX_JITTER, MAX_TRIES) {
        return s;
    }
    evd_symmetric_sqrt_with_floor(&p, EIGEN_FLOOR)
}

fn chol_sqrt(p: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    Cholesky::new(p.clone()).map(|ch| ch.l().into_owned())
}

fn with_jitter(p: &DMatrix<f64>, jitter: f64) -> DMatrix<f64> {
    let mut pj = p.clone();
    for i in 0..p.nrows() {
        pj[(i, i)] += jitter;
    }
    pj
}

fn chol_sqrt_with_jitter(
    p: &DMatrix<f64>,
    initial_jitter: f64,
    max_jitter: f64,
    max_tries: usize,
) -> Option<DMatrix<f64>> {
    let mut jitter = initial_jitter;
    for _ in 0..max_tries {
        if let Some(ch) = Cholesky::new(with_jitter(p, jitter)) {
            return Some(ch.l().into_owned());
        }
        jitter *= 10.0;
        if jitter > max_jitter {
            break;
        }
    }
    None
}

/// S = U * sqrt(max(λ, floor)) * Uᵀ
fn evd_symmetric_sqrt_with_floor(p: &DMatrix<f64>, floor: f64) -> DMatrix<f64> {
    let se = SymmetricEigen::new(p.clone());
    let sqrt_vals = se.eigenvalues.map(|l| l.max(floor).sqrt());
    let u = se.eigenvectors;
    &u * DMatrix::<f64>::from_diagonal(&sqrt_vals) * u.transpose()
}

/// Solve A X = B for an SPD-ish A (an innovation covariance), with Cholesky jitter retries
/// and an explicit inverse as the last resort.
pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if a.nrows() != b.nrows() {
        return Err(FilterError::dimension("solve right-hand side", a.nrows(), b.nrows()));
    }
    let a_sym = symmetrize(a);
    let mut jitter = 0.0;
    for _ in 0..=MAX_TRIES {
        if let Some(ch) = Cholesky::new(with_jitter(&a_sym, jitter)) {
            return Ok(ch.solve(b));
        }
        jitter = if jitter == 0.0 { INITIAL_JITTER } else { jitter * 10.0 };
        if jitter > MAX_JITTER {
            break;
        }
    }
    a_sym
        .try_inverse()
        .map(|inv| inv * b)
        .ok_or(FilterError::NotPositiveDefinite("innovation covariance"))
}

/// ln |Σ| from a Cholesky factor of Σ.
pub fn log_determinant(chol: &Cholesky<f64, Dyn>) -> f64 {
    2.0 * chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>()
}

/// Squared Mahalanobis norm rᵀ Σ⁻¹ r from a Cholesky factor of Σ.
pub fn mahalanobis_squared(chol: &Cholesky<f64, Dyn>, residual: &DVector<f64>) -> f64 {
    // Only the lower triangle is read, so the unzeroed factor is enough.
    match chol.l_dirty().solve_lower_triangular(residual) {
        Some(z) => z.norm_squared(),
        None => f64::INFINITY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn max_abs_diff(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
        assert_eq!(a.shape(), b.shape());
        (a - b).amax()
    }

    #[test]
    fn symmetrize_averages_off_diagonal() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 3.0]);
        let expected = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 3.0]);
        assert!(max_abs_diff(&symmetrize(&m), &expected) < 1e-15);
    }

    #[test]
    fn spd_cholesky_rejects_indefinite_and_asymmetric() {
        let indefinite = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(matches!(
            spd_cholesky(&indefinite, "observation covariance"),
            Err(FilterError::NotPositiveDefinite(_))
        ));
        let asymmetric = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.0, 1.0]);
        assert!(spd_cholesky(&asymmetric, "observation covariance").is_err());
        let rect = DMatrix::<f64>::zeros(2, 3);
        assert!(matches!(
            spd_cholesky(&rect, "observation covariance"),
            Err(FilterError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn psd_square_root_of_zero_is_zero() {
        let zero = DMatrix::<f64>::zeros(4, 4);
        let s = psd_square_root(&zero, "transition covariance").unwrap();
        assert_eq!(s.amax(), 0.0);
    }

    #[test]
    fn psd_square_root_reconstructs_singular_matrix() {
        let v = DVector::from_vec(vec![1.0, 2.0, -1.0]);
        let p = &v * v.transpose();
        let s = psd_square_root(&p, "transition covariance").unwrap();
        assert!(max_abs_diff(&(&s * s.transpose()), &p) < 1e-10);
    }

    #[test]
    fn psd_square_root_rejects_negative_eigenvalue() {
        let p = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0]);
        assert!(matches!(
            psd_square_root(&p, "transition covariance"),
            Err(FilterError::NotPositiveSemiDefinite(_))
        ));
    }

    #[test]
    fn matrix_square_root_recovers_nearly_spd() {
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 0.1, 0.0, 0.0, 1.0, 0.2, 0.0, 0.0, 1.0]);
        let mut p = &a * a.transpose();
        p[(2, 2)] -= 1e-10;
        let s = matrix_square_root(&p);
        assert!(max_abs_diff(&(&s * s.transpose()), &symmetrize(&p)) < 1e-8);
    }

    #[test]
    fn robust_solve_matches_direct_inverse() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let b = DMatrix::from_row_slice(2, 1, &[1.0, 2.0]);
        let x = robust_spd_solve(&a, &b).unwrap();
        let expected = a.clone().try_inverse().unwrap() * &b;
        assert!(max_abs_diff(&x, &expected) < 1e-12);
    }

    #[test]
    fn log_determinant_and_mahalanobis() {
        let sigma = DMatrix::from_row_slice(2, 2, &[4.0, 0.0, 0.0, 9.0]);
        let chol = spd_cholesky(&sigma, "sigma").unwrap();
        assert_approx_eq!(log_determinant(&chol), 36.0_f64.ln(), 1e-12);
        let r = DVector::from_vec(vec![2.0, 3.0]);
        assert_approx_eq!(mahalanobis_squared(&chol, &r), 2.0, 1e-12);
    }
}
