//! minimizer::bounds — box constraints for the L-BFGS layer.
//!
//! Purpose
//! -------
//! Argmin's L-BFGS is unconstrained. Box constraints (needed for the
//! Lagrange multipliers of inequality observables, which live on a
//! half-line) are imposed by evaluating the objective at the clamped point
//! and projecting the gradient, so that coordinates sitting on an active
//! bound stop pulling the iterate outside the box.
//!
//! Invariants & assumptions
//! ------------------------
//! - `lower[i] <= upper[i]` for every coordinate; infinite bounds are
//!   allowed and make a coordinate free on that side.
//! - Clamping is idempotent, so the best iterate reported by the solver can
//!   always be clamped once more before it is returned.
use crate::optimization::{
    errors::{OptError, OptResult},
    minimizer::types::{Grad, Theta},
};
use ndarray::Array1;

/// Distance from a bound under which a coordinate counts as active.
const ACTIVE_EPS: f64 = 1e-12;

/// Per-coordinate box `[lower, upper]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Bounds {
    lower: Array1<f64>,
    upper: Array1<f64>,
}

impl Bounds {
    /// Build validated bounds.
    ///
    /// # Errors
    /// - [`OptError::BoundsDimMismatch`] if the two vectors differ in length.
    /// - [`OptError::InvalidBounds`] if a bound is NaN or `lower > upper`.
    pub fn new(lower: Array1<f64>, upper: Array1<f64>) -> OptResult<Self> {
        if lower.len() != upper.len() {
            return Err(OptError::BoundsDimMismatch { expected: lower.len(), found: upper.len() });
        }
        for (index, (&lo, &hi)) in lower.iter().zip(upper.iter()).enumerate() {
            if lo.is_nan() || hi.is_nan() || lo > hi {
                return Err(OptError::InvalidBounds { index, lower: lo, upper: hi });
            }
        }
        Ok(Self { lower, upper })
    }

    /// Build bounds from `(lower, upper)` pairs.
    pub fn from_pairs(pairs: &[(f64, f64)]) -> OptResult<Self> {
        let lower = pairs.iter().map(|p| p.0).collect();
        let upper = pairs.iter().map(|p| p.1).collect();
        Self::new(lower, upper)
    }

    /// `n` coordinates with no constraint.
    pub fn unbounded(n: usize) -> Self {
        Self {
            lower: Array1::from_elem(n, f64::NEG_INFINITY),
            upper: Array1::from_elem(n, f64::INFINITY),
        }
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    /// `true` when no coordinate has a finite bound.
    pub fn is_unbounded(&self) -> bool {
        self.lower.iter().all(|v| *v == f64::NEG_INFINITY)
            && self.upper.iter().all(|v| *v == f64::INFINITY)
    }

    pub fn lower(&self) -> &Array1<f64> {
        &self.lower
    }

    pub fn upper(&self) -> &Array1<f64> {
        &self.upper
    }

    /// Check that `theta` has one coordinate per bound.
    pub fn check_dim(&self, theta: &Theta) -> OptResult<()> {
        if theta.len() != self.len() {
            return Err(OptError::BoundsDimMismatch { expected: self.len(), found: theta.len() });
        }
        Ok(())
    }

    /// Project `theta` onto the box.
    pub fn clamp(&self, theta: &Theta) -> Theta {
        let mut out = theta.clone();
        out.iter_mut().zip(self.lower.iter().zip(self.upper.iter())).for_each(|(x, (&lo, &hi))| {
            *x = x.max(lo).min(hi);
        });
        out
    }

    /// Zero the gradient components that point out of the box at an active
    /// bound.
    ///
    /// With the cost being minimized, the solver moves along `-grad`; a
    /// coordinate on its lower bound with a positive gradient (or on its
    /// upper bound with a negative one) would leave the box.
    pub fn project_gradient(&self, theta: &Theta, grad: &mut Grad) {
        for (i, g) in grad.iter_mut().enumerate() {
            let x = theta[i];
            let at_lower = x <= self.lower[i] + ACTIVE_EPS;
            let at_upper = x >= self.upper[i] - ACTIVE_EPS;
            if (at_lower && *g > 0.0) || (at_upper && *g < 0.0) {
                *g = 0.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Construction guards, clamping and gradient projection at active bounds.
    //
    // They intentionally DO NOT cover:
    // - Bounded solves end-to-end (see the `api` tests).
    // -------------------------------------------------------------------------

    #[test]
    // Purpose
    // -------
    // Empty and mis-sized boxes are rejected.
    //
    // Given
    // -----
    // - A pair with lower > upper, and vectors of different lengths.
    //
    // Expect
    // ------
    // - `InvalidBounds` and `BoundsDimMismatch`.
    fn new_rejects_inverted_and_mismatched_bounds() {
        let inverted = Bounds::from_pairs(&[(0.0, 1.0), (2.0, 1.0)]);
        assert!(matches!(inverted, Err(OptError::InvalidBounds { index: 1, .. })));

        let mismatched = Bounds::new(array![0.0], array![1.0, 2.0]);
        assert!(matches!(mismatched, Err(OptError::BoundsDimMismatch { .. })));
    }

    #[test]
    // Purpose
    // -------
    // Clamping only moves coordinates that sit outside a finite bound.
    //
    // Given
    // -----
    // - Half-line bounds `[0, ∞)`, `(-∞, 0]` and a free coordinate.
    //
    // Expect
    // ------
    // - Negative first and positive second coordinates are pinned to 0; the
    //   free coordinate is untouched.
    fn clamp_pins_only_violating_coordinates() {
        // Arrange
        let bounds = Bounds::from_pairs(&[
            (0.0, f64::INFINITY),
            (f64::NEG_INFINITY, 0.0),
            (f64::NEG_INFINITY, f64::INFINITY),
        ])
        .expect("valid bounds");

        // Act
        let clamped = bounds.clamp(&array![-1.5, 2.0, -7.0]);

        // Assert
        assert_eq!(clamped, array![0.0, 0.0, -7.0]);
        assert!(!bounds.is_unbounded());
        assert!(Bounds::unbounded(3).is_unbounded());
    }

    #[test]
    // Purpose
    // -------
    // Gradient projection zeroes only outward-pointing components at active
    // bounds.
    //
    // Given
    // -----
    // - `[0, ∞)` bounds at `theta = [0, 0, 1]` and gradient `[+1, -1, +1]`.
    //
    // Expect
    // ------
    // - First component zeroed (would push below 0), second kept (moves
    //   inward), third kept (inactive).
    fn project_gradient_zeroes_outward_components() {
        // Arrange
        let bounds = Bounds::from_pairs(&[(0.0, f64::INFINITY); 3]).expect("valid bounds");
        let theta = array![0.0, 0.0, 1.0];
        let mut grad = array![1.0, -1.0, 1.0];

        // Act
        bounds.project_gradient(&theta, &mut grad);

        // Assert
        assert_eq!(grad, array![0.0, -1.0, 1.0]);
    }
}
