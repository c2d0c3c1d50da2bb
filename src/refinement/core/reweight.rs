//! Exponential tilting of frame weights.
//!
//! Purpose
//! -------
//! Provide the Boltzmann-style reweighting primitive every level of the
//! engine builds on: `w'_i ∝ w_i · exp(-c_i)` with its log-partition, plus
//! the relative entropy of a tilted ensemble with respect to its prior.
//!
//! Key behaviors
//! -------------
//! - [`reweight`] renormalizes the input weights, shifts the correction by
//!   its minimum over weighted frames and returns the new normalized
//!   weights together with `logZ = ln Σ w·exp(-(c - shift)) - shift`.
//! - [`tilt_divergence`] evaluates `D_KL(w'‖w) = -(⟨c⟩_{w'} + logZ)`.
//!
//! Invariants & assumptions
//! ------------------------
//! - Inputs are copied; nothing is mutated in place.
//! - Any non-finite weight or log-partition is a
//!   [`RefineError::NumericalInstability`].
use crate::{
    optimization::numerical_stability::transformations::weighted_log_sum_exp,
    refinement::{
        core::ensemble::normalize_weights,
        errors::{RefineError, RefineResult},
    },
};
use ndarray::{Array1, ArrayView1, Zip};

/// Tilted weights and their log-partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Reweighted {
    /// New normalized weights.
    pub weights: Array1<f64>,
    /// `ln Σ w_i exp(-c_i)` for the normalized input weights.
    pub log_z: f64,
    /// Minimum correction over frames with positive weight.
    pub shift: f64,
}

/// Tilt `weights` by `exp(-correction)`.
///
/// # Errors
/// - [`RefineError::FrameCountMismatch`] if the arrays differ in length.
/// - [`RefineError::InvalidWeights`] if the weights are negative, non-finite
///   or all zero.
/// - [`RefineError::NumericalInstability`] if the tilt overflows or produces
///   NaN.
pub fn reweight(weights: ArrayView1<f64>, correction: ArrayView1<f64>) -> RefineResult<Reweighted> {
    if weights.len() != correction.len() {
        return Err(RefineError::FrameCountMismatch {
            ensemble: String::new(),
            what: "correction".to_string(),
            expected: weights.len(),
            found: correction.len(),
        });
    }
    let prior = normalize_weights("", weights.to_owned())?;

    let shift = prior
        .iter()
        .zip(correction.iter())
        .filter(|(w, _)| **w > 0.0)
        .map(|(_, c)| *c)
        .fold(f64::INFINITY, f64::min);
    if !shift.is_finite() || correction.iter().any(|c| c.is_nan()) {
        return Err(RefineError::instability("correction is not finite"));
    }
    let exponents = correction.mapv(|c| -c);
    let log_z = weighted_log_sum_exp(prior.view(), exponents.view());
    if !log_z.is_finite() {
        return Err(RefineError::instability("log-partition is not finite"));
    }

    let mut new = Array1::zeros(prior.len());
    Zip::from(&mut new).and(&prior).and(&exponents).for_each(|out, &w, &a| {
        *out = if w > 0.0 { w * (a - log_z).exp() } else { 0.0 };
    });
    if new.iter().any(|w| !w.is_finite()) {
        return Err(RefineError::instability("tilted weights are not finite"));
    }
    let total = new.sum();
    Ok(Reweighted { weights: new / total, log_z, shift })
}

/// `D_KL(w'‖w) = -(⟨c⟩_{w'} + logZ)` for weights tilted by `exp(-c)`.
pub fn tilt_divergence(tilted: ArrayView1<f64>, correction: ArrayView1<f64>, log_z: f64) -> f64 {
    -(tilted.dot(&correction) + log_z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::array;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Normalization and the log-partition identity.
    // - Stability for large corrections and failure on non-finite input.
    // - The divergence identity against the direct definition.
    // -------------------------------------------------------------------------

    #[test]
    // Purpose
    // -------
    // New weights sum to one and `Σ w·exp(-(c - shift)) = exp(logZ + shift)`.
    //
    // Given
    // -----
    // - Unnormalized weights `[2, 3, 5]` and correction `[0.3, -1.2, 2.0]`.
    //
    // Expect
    // ------
    // - Both identities hold to 1e-12.
    fn reweight_normalizes_and_matches_partition() {
        let w = array![2.0, 3.0, 5.0];
        let c = array![0.3, -1.2, 2.0];
        let out = reweight(w.view(), c.view()).unwrap();

        assert_abs_diff_eq!(out.weights.sum(), 1.0, epsilon = 1e-12);
        assert_eq!(out.shift, -1.2);
        let wn = &w / w.sum();
        let lhs: f64 = wn.iter().zip(c.iter()).map(|(w, c)| w * (-(c - out.shift)).exp()).sum();
        assert_relative_eq!(lhs, (out.log_z + out.shift).exp(), max_relative = 1e-12);
    }

    #[test]
    // Purpose
    // -------
    // Huge corrections do not overflow; NaN corrections fail loudly.
    //
    // Given
    // -----
    // - Correction `[1000, 1001]` with equal weights.
    // - Correction `[0, NaN]`.
    //
    // Expect
    // ------
    // - Weights `[e/(1+e), 1/(1+e)]`; `NumericalInstability` for NaN.
    fn reweight_is_shift_stable() {
        let out = reweight(array![1.0, 1.0].view(), array![1000.0, 1001.0].view()).unwrap();
        let e = std::f64::consts::E;
        assert_relative_eq!(out.weights[0], e / (1.0 + e), max_relative = 1e-12);
        assert!(out.log_z.is_finite());

        let err = reweight(array![1.0, 1.0].view(), array![0.0, f64::NAN].view()).unwrap_err();
        assert!(err.is_numerical());
    }

    #[test]
    // Purpose
    // -------
    // The tilt form of the relative entropy matches `Σ p ln(p / p0)`.
    //
    // Given
    // -----
    // - Prior `[0.2, 0.3, 0.5]` tilted by `[1, 0, -0.5]`.
    //
    // Expect
    // ------
    // - Both forms agree to 1e-12 and are positive.
    fn tilt_divergence_matches_definition() {
        let prior = array![0.2, 0.3, 0.5];
        let c = array![1.0, 0.0, -0.5];
        let out = reweight(prior.view(), c.view()).unwrap();
        let direct: f64 =
            out.weights.iter().zip(prior.iter()).map(|(p, q)| p * (p / q).ln()).sum();
        let tilt = tilt_divergence(out.weights.view(), c.view(), out.log_z);
        assert_relative_eq!(tilt, direct, max_relative = 1e-12);
        assert!(tilt > 0.0);
    }
}
