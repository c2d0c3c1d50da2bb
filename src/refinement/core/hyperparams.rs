//! Regularization strengths (α, β, γ).
//!
//! `+∞` disables a channel: α = ∞ turns ensemble refinement off, β = ∞ the
//! force-field correction and γ = ∞ the forward-model fit. The search moves
//! the finite strengths in log10 coordinates.
use crate::{
    optimization::numerical_stability::transformations::{from_log10, to_log10},
    refinement::errors::{RefineError, RefineResult},
};

/// Names of the three strengths, in vector order.
pub const HYPER_NAMES: [&str; 3] = ["alpha", "beta", "gamma"];

/// Validated regularization strengths.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hyperparameters {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Hyperparameters {
    /// # Errors
    /// - [`RefineError::InvalidHyperparameter`] if α is not strictly positive,
    ///   or β / γ is negative, or any strength is NaN.
    pub fn new(alpha: f64, beta: f64, gamma: f64) -> RefineResult<Self> {
        if alpha.is_nan() || alpha <= 0.0 {
            return Err(RefineError::InvalidHyperparameter {
                name: "alpha",
                value: alpha,
                reason: "must be strictly positive (or +inf)",
            });
        }
        for (name, value) in [("beta", beta), ("gamma", gamma)] {
            if value.is_nan() || value < 0.0 {
                return Err(RefineError::InvalidHyperparameter {
                    name,
                    value,
                    reason: "must be non-negative (or +inf)",
                });
            }
        }
        Ok(Self { alpha, beta, gamma })
    }

    /// Refinement only: β = γ = ∞.
    pub fn refinement_only(alpha: f64) -> RefineResult<Self> {
        Self::new(alpha, f64::INFINITY, f64::INFINITY)
    }

    pub fn refinement_enabled(&self) -> bool {
        self.alpha.is_finite()
    }

    pub fn ff_enabled(&self) -> bool {
        self.beta.is_finite()
    }

    pub fn fm_enabled(&self) -> bool {
        self.gamma.is_finite()
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.alpha, self.beta, self.gamma]
    }

    /// Indices (into [`HYPER_NAMES`]) of the finite strengths.
    pub fn free_indices(&self) -> Vec<usize> {
        self.as_array().iter().enumerate().filter(|(_, v)| v.is_finite()).map(|(i, _)| i).collect()
    }

    /// log10 of the finite strengths, in [`Self::free_indices`] order.
    pub fn log10_free(&self) -> Vec<f64> {
        let values = self.as_array();
        self.free_indices().into_iter().map(|i| to_log10(values[i])).collect()
    }

    /// Copy with the finite strengths replaced by `10^log10`.
    ///
    /// # Errors
    /// - [`RefineError::ParameterDimMismatch`] if `log10` does not match the
    ///   number of finite strengths.
    /// - Validation errors of [`Hyperparameters::new`].
    pub fn with_log10_free(&self, log10: &[f64]) -> RefineResult<Self> {
        let free = self.free_indices();
        if free.len() != log10.len() {
            return Err(RefineError::ParameterDimMismatch {
                what: "log10 hyperparameters".to_string(),
                expected: free.len(),
                found: log10.len(),
            });
        }
        let mut values = self.as_array();
        for (&i, &y) in free.iter().zip(log10) {
            values[i] = from_log10(y);
        }
        Self::new(values[0], values[1], values[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Validation of the admissible ranges.
    // - The log10 coordinates of the finite strengths.
    // -------------------------------------------------------------------------

    #[test]
    // Purpose
    // -------
    // α must be strictly positive; β and γ may be zero but not negative.
    //
    // Given
    // -----
    // - α = 0, β = -1, and a valid (1, 0, ∞) triple.
    //
    // Expect
    // ------
    // - Errors for the first two; the triple enables α and β only.
    fn new_validates_ranges() {
        assert!(Hyperparameters::new(0.0, 1.0, 1.0).is_err());
        assert!(Hyperparameters::new(1.0, -1.0, 1.0).is_err());
        let h = Hyperparameters::new(1.0, 0.0, f64::INFINITY).unwrap();
        assert!(h.refinement_enabled() && h.ff_enabled() && !h.fm_enabled());
    }

    #[test]
    // Purpose
    // -------
    // Only finite strengths move in log10 coordinates.
    //
    // Given
    // -----
    // - (100, ∞, 0.1) and new log10 values `[0, -2]`.
    //
    // Expect
    // ------
    // - `log10_free = [2, -1]`; the update gives (1, ∞, 0.01).
    fn log10_coordinates_skip_disabled_channels() {
        let h = Hyperparameters::new(100.0, f64::INFINITY, 0.1).unwrap();
        let y = h.log10_free();
        assert_relative_eq!(y[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(y[1], -1.0, epsilon = 1e-12);

        let h2 = h.with_log10_free(&[0.0, -2.0]).unwrap();
        assert_relative_eq!(h2.alpha, 1.0, epsilon = 1e-12);
        assert!(h2.beta.is_infinite());
        assert_relative_eq!(h2.gamma, 0.01, epsilon = 1e-14);
        assert!(h.with_log10_free(&[0.0]).is_err());
    }
}
