//! Numerical stability utilities.
//!
//! Guarded primitives shared by the reweighting, normalization and
//! hyperparameter layers:
//!
//! - [`weighted_log_sum_exp`]: `ln Σ w_i exp(a_i)` without overflow, the
//!   kernel of every Boltzmann tilt in the crate.
//! - [`to_log10`] / [`from_log10`]: the coordinates in which
//!   hyperparameters are searched and differentiated.
//! - [`rejected_step`]: the finite cost and slope reported at a point whose
//!   evaluation failed numerically, so line searches backtrack from it.
//! - Shared tolerances ([`EIGEN_EPS`], [`PIN_TOL`], [`STD_FLOOR`],
//!   [`REJECTION_PENALTY`]).
use ndarray::{Array1, ArrayView1};

/// Relative eigenvalue cutoff for pseudo-inverses: eigenvalues with
/// `|λ| <= EIGEN_EPS · max|λ|` are treated as zero.
pub const EIGEN_EPS: f64 = 1e-12;

/// A multiplier on a one-sided bound counts as pinned when it lies within
/// this distance of zero.
pub const PIN_TOL: f64 = 1e-10;

/// Relative floor under which a weighted standard deviation is treated as
/// zero (the column is then left unscaled).
pub const STD_FLOOR: f64 = 1e-12;

/// Height of the wall reported at a rejected point, relative to
/// `1 + |best cost|`.
pub const REJECTION_PENALTY: f64 = 1e3;

/// Stable `ln Σ_i w_i exp(a_i)` for non-negative weights.
///
/// The exponents are shifted by their maximum over frames with positive
/// weight, so the largest term is `w_i · 1`.
///
/// # Returns
/// - `-∞` when every weight is zero.
/// - `+∞`/`NaN` when an exponent with positive weight is `+∞`/`NaN`; callers
///   treat any non-finite result as a numerical instability.
pub fn weighted_log_sum_exp(weights: ArrayView1<f64>, exponents: ArrayView1<f64>) -> f64 {
    let shift = weights
        .iter()
        .zip(exponents.iter())
        .filter(|(w, _)| **w > 0.0)
        .map(|(_, a)| *a)
        .fold(f64::NEG_INFINITY, |acc, a| if a.is_nan() || a > acc { a } else { acc });
    if !shift.is_finite() {
        return shift;
    }
    let sum: f64 = weights
        .iter()
        .zip(exponents.iter())
        .filter(|(w, _)| **w > 0.0)
        .map(|(w, a)| w * (a - shift).exp())
        .sum();
    shift + sum.ln()
}

/// `log10(x)` for a strictly positive hyperparameter.
pub fn to_log10(x: f64) -> f64 {
    x.log10()
}

/// Inverse of [`to_log10`].
pub fn from_log10(y: f64) -> f64 {
    10f64.powf(y)
}

/// Cost and gradient reported at `theta` after its evaluation failed.
///
/// The cost is `best_cost + REJECTION_PENALTY · (1 + |best_cost|)`, the
/// value at `theta` of a linear ramp rising from the best accepted point
/// `best`; the gradient is the slope of that ramp. Both are finite, so the
/// step fails the sufficient-decrease test and the line search shrinks it.
/// At `theta == best` the gradient is zero.
pub fn rejected_step(best_cost: f64, best: ArrayView1<f64>, theta: ArrayView1<f64>) -> (f64, Array1<f64>) {
    let rise = REJECTION_PENALTY * (1.0 + best_cost.abs());
    let delta = &theta - &best;
    let dist2 = delta.dot(&delta);
    let slope = if dist2 > 0.0 { delta * (rise / dist2) } else { Array1::zeros(theta.len()) };
    (best_cost + rise, slope)
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
    // - Agreement of `weighted_log_sum_exp` with the naive formula on a safe
    //   range, and its behavior where the naive formula overflows.
    // - The log10 round trip.
    // - The wall reported at a rejected point.
    // -------------------------------------------------------------------------

    #[test]
    // Purpose
    // -------
    // On moderate inputs the guarded form equals the naive one.
    //
    // Given
    // -----
    // - Weights `(0.2, 0.3, 0.5)` and exponents `(-1, 0.5, 2)`.
    //
    // Expect
    // ------
    // - `ln Σ w exp(a)` to 1e-12.
    fn weighted_log_sum_exp_matches_naive_formula() {
        let w = array![0.2, 0.3, 0.5];
        let a = array![-1.0, 0.5, 2.0];
        let naive: f64 = w.iter().zip(a.iter()).map(|(w, a): (&f64, &f64)| w * a.exp()).sum::<f64>().ln();
        assert_relative_eq!(weighted_log_sum_exp(w.view(), a.view()), naive, epsilon = 1e-12);
    }

    #[test]
    // Purpose
    // -------
    // Large exponents do not overflow and zero-weight frames are ignored.
    //
    // Given
    // -----
    // - Exponents `(1000, 1000, 5000)` with weights `(0.5, 0.5, 0)`.
    //
    // Expect
    // ------
    // - Result `1000` (the zero-weight 5000 does not set the shift); all-zero
    //   weights give `-∞`.
    fn weighted_log_sum_exp_is_overflow_safe() {
        let w = array![0.5, 0.5, 0.0];
        let a = array![1000.0, 1000.0, 5000.0];
        assert_relative_eq!(weighted_log_sum_exp(w.view(), a.view()), 1000.0, epsilon = 1e-9);
        let zeros = array![0.0, 0.0];
        let b = array![1.0, 2.0];
        assert_eq!(weighted_log_sum_exp(zeros.view(), b.view()), f64::NEG_INFINITY);
    }

    #[test]
    // Purpose
    // -------
    // log10 coordinates round-trip.
    //
    // Given
    // -----
    // - `x = 0.37`.
    //
    // Expect
    // ------
    // - `from_log10(to_log10(x)) ≈ x`.
    fn log10_round_trip() {
        assert_relative_eq!(from_log10(to_log10(0.37)), 0.37, epsilon = 1e-14);
    }

    #[test]
    // Purpose
    // -------
    // A rejected point reports a finite cost above the best one and a slope
    // pointing away from the best point.
    //
    // Given
    // -----
    // - Best cost 2 at `(0, 0)`, rejected point `(3, 4)`.
    //
    // Expect
    // ------
    // - Cost `2 + 3 · REJECTION_PENALTY`; the directional derivative along
    //   the step equals the rise, so the ramp is linear.
    fn rejected_step_rises_from_best_point() {
        let best = array![0.0, 0.0];
        let theta = array![3.0, 4.0];

        let (cost, grad) = rejected_step(2.0, best.view(), theta.view());

        let rise = 3.0 * REJECTION_PENALTY;
        assert_relative_eq!(cost, 2.0 + rise, max_relative = 1e-12);
        assert_relative_eq!(grad.dot(&(&theta - &best)), rise, max_relative = 1e-12);
        assert!(grad.iter().all(|g| *g > 0.0));

        let (_, flat) = rejected_step(2.0, best.view(), best.view());
        assert!(flat.iter().all(|g| *g == 0.0));
    }
}
