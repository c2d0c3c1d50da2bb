//! inference::hessian — symmetric solves for implicit differentiation.
//!
//! Purpose
//! -------
//! The hyperparameter derivatives need `H⁻¹ B` for two kinds of symmetric
//! matrices: the Hessian of the dual objective in the Lagrange multipliers
//! (positive definite whenever `α > 0`), and the total Hessian of the loss
//! in the model parameters (symmetric, not necessarily definite away from a
//! minimum). This module performs those solves with `nalgebra`.
//!
//! Key behaviors
//! -------------
//! - Copy `ndarray` matrices into `nalgebra::DMatrix` ([`fill_dmatrix`]).
//! - Try a Cholesky factorization first.
//! - Fall back to a symmetric eigendecomposition, inverting only eigenvalues
//!   with `|λ| > EIGEN_EPS · max|λ|`. When no eigenvalue is dropped this is
//!   the exact inverse of an indefinite matrix; otherwise it is the
//!   Moore–Penrose pseudo-inverse and the result is flagged `singular`.
//!
//! Invariants & assumptions
//! ------------------------
//! - Inputs are square, finite and symmetric (symmetrization happens in
//!   [`compute_hessian`](crate::optimization::minimizer::finite_diff::compute_hessian)
//!   or by construction).
//!
//! Testing notes
//! -------------
//! - Unit tests cover the Cholesky path, the indefinite path, and a rank
//!   deficient matrix.
use crate::optimization::{
    errors::{OptError, OptResult},
    minimizer::validation::validate_hessian,
    numerical_stability::EIGEN_EPS,
};
use nalgebra::DMatrix;
use ndarray::Array2;

/// Solution of `H X = B` for symmetric `H`.
#[derive(Debug, Clone, PartialEq)]
pub struct SymmetricSolve {
    /// `X`, with the same shape as `B`.
    pub solution: Array2<f64>,
    /// `true` if `H` was numerically singular and a pseudo-inverse was used.
    pub singular: bool,
}

/// Solve `matrix · X = rhs` for a symmetric `matrix`.
///
/// # Errors
/// - [`OptError::HessianDimMismatch`] / [`OptError::InvalidHessian`] if
///   `matrix` is not square and finite.
/// - [`OptError::JacobianDimMismatch`] if `rhs` has a different row count.
pub fn solve_symmetric(matrix: &Array2<f64>, rhs: &Array2<f64>) -> OptResult<SymmetricSolve> {
    let n = matrix.nrows();
    validate_hessian(matrix, n)?;
    if rhs.nrows() != n {
        return Err(OptError::JacobianDimMismatch {
            expected: (n, rhs.ncols()),
            found: rhs.dim(),
        });
    }
    if n == 0 {
        return Ok(SymmetricSolve { solution: rhs.clone(), singular: false });
    }

    let mut h = DMatrix::<f64>::zeros(n, n);
    fill_dmatrix(matrix, &mut h);
    let mut b = DMatrix::<f64>::zeros(n, rhs.ncols());
    fill_dmatrix(rhs, &mut b);

    if let Some(chol) = h.clone().cholesky() {
        let x = chol.solve(&b);
        return Ok(SymmetricSolve { solution: to_ndarray(&x), singular: false });
    }

    let eigen = h.symmetric_eigen();
    let scale = eigen.eigenvalues.iter().fold(0.0_f64, |acc, l| acc.max(l.abs()));
    let cutoff = EIGEN_EPS * scale;
    let q = &eigen.eigenvectors;
    let qt_b = q.transpose() * &b;
    let mut scaled = qt_b.clone();
    let mut singular = scale == 0.0;
    for (k, &lambda) in eigen.eigenvalues.iter().enumerate() {
        let inv = if lambda.abs() > cutoff {
            1.0 / lambda
        } else {
            singular = true;
            0.0
        };
        for j in 0..scaled.ncols() {
            scaled[(k, j)] = qt_b[(k, j)] * inv;
        }
    }
    let x = q * scaled;
    Ok(SymmetricSolve { solution: to_ndarray(&x), singular })
}

/// Inverse (or pseudo-inverse) of a symmetric matrix.
pub fn invert_symmetric(matrix: &Array2<f64>) -> OptResult<SymmetricSolve> {
    solve_symmetric(matrix, &Array2::eye(matrix.nrows()))
}

/// Copy an `ndarray` matrix into a pre-sized `DMatrix`, column by column to
/// follow `DMatrix`'s column-major storage.
pub fn fill_dmatrix(src: &Array2<f64>, dst: &mut DMatrix<f64>) {
    for j in 0..src.ncols() {
        for i in 0..src.nrows() {
            dst[(i, j)] = src[[i, j]];
        }
    }
}

fn to_ndarray(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Positive definite, indefinite and rank-deficient symmetric solves.
    // - Shape validation of the right-hand side.
    // -------------------------------------------------------------------------

    #[test]
    // Purpose
    // -------
    // A positive definite system is solved exactly and not flagged.
    //
    // Given
    // -----
    // - `H = [[4, 1], [1, 3]]`, `B = I`.
    //
    // Expect
    // ------
    // - `H · X ≈ I`, `singular == false`.
    fn solve_symmetric_positive_definite() {
        // Arrange
        let h = array![[4.0, 1.0], [1.0, 3.0]];

        // Act
        let out = invert_symmetric(&h).expect("solve");

        // Assert
        assert!(!out.singular);
        let prod = h.dot(&out.solution);
        for ((i, j), v) in prod.indexed_iter() {
            assert_relative_eq!(*v, if i == j { 1.0 } else { 0.0 }, epsilon = 1e-12);
        }
    }

    #[test]
    // Purpose
    // -------
    // An indefinite but nonsingular matrix is inverted exactly through the
    // eigen path.
    //
    // Given
    // -----
    // - `H = diag(2, -0.5)`.
    //
    // Expect
    // ------
    // - `X = diag(0.5, -2)`, `singular == false`.
    fn solve_symmetric_indefinite_is_exact_inverse() {
        let out = invert_symmetric(&array![[2.0, 0.0], [0.0, -0.5]]).expect("solve");
        assert!(!out.singular);
        assert_relative_eq!(out.solution[[0, 0]], 0.5, epsilon = 1e-12);
        assert_relative_eq!(out.solution[[1, 1]], -2.0, epsilon = 1e-12);
    }

    #[test]
    // Purpose
    // -------
    // A rank-deficient matrix yields the pseudo-inverse and is flagged.
    //
    // Given
    // -----
    // - `H = [[1, 1], [1, 1]]`, `b = (2, 2)ᵀ`.
    //
    // Expect
    // ------
    // - Minimum-norm solution `(1, 1)ᵀ`, `singular == true`.
    fn solve_symmetric_rank_deficient_uses_pseudo_inverse() {
        let out = solve_symmetric(&array![[1.0, 1.0], [1.0, 1.0]], &array![[2.0], [2.0]])
            .expect("solve");
        assert!(out.singular);
        assert_relative_eq!(out.solution[[0, 0]], 1.0, epsilon = 1e-10);
        assert_relative_eq!(out.solution[[1, 0]], 1.0, epsilon = 1e-10);
    }

    #[test]
    // Purpose
    // -------
    // Mismatched right-hand sides are rejected.
    //
    // Given
    // -----
    // - A 2×2 matrix and a 3×1 right-hand side.
    //
    // Expect
    // ------
    // - `JacobianDimMismatch`.
    fn solve_symmetric_rejects_mismatched_rhs() {
        let err = solve_symmetric(&Array2::eye(2), &Array2::zeros((3, 1))).expect_err("mismatch");
        assert!(matches!(err, OptError::JacobianDimMismatch { .. }));
    }
}
