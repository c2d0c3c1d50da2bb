//! Penalties on the correction parameters.
//!
//! Purpose
//! -------
//! Close the set of force-field and forward-model penalties into tagged
//! enums, selected once when the fit is configured.
//!
//! Key behaviors
//! -------------
//! - [`FfRegularization::PlainL2`]: `Σ p_i²`.
//! - [`FfRegularization::ChargeNeutrality`]: `Σ_{i<n-1} p_i² + (m·p)²`; the
//!   last parameter is the one fixed by neutrality and is only penalized
//!   through the net-charge residual `m·p`.
//! - [`FfRegularization::ChargeNeutralityWithEta`]: `Σ p_i² + (m·p)²`, for
//!   layouts whose last parameter is an extra scale (multiplicity 0).
//! - [`FfRegularization::KlDivergence`]: relative entropy of the corrected
//!   ensembles with respect to the uncorrected ones; it needs ensemble data
//!   and is evaluated by the loss, not here.
//! - `Custom` variants wrap user callables returning `anyhow::Result<f64>`.
//!
//! Built-in penalties report analytic gradients; custom and
//! data-dependent ones return `None` and are differentiated numerically.
use crate::refinement::errors::{RefineError, RefineResult};
use ndarray::{Array1, ArrayView1};
use std::{fmt, sync::Arc};

/// User force-field penalty `R(p)`.
pub type FfPenaltyFn = dyn Fn(ArrayView1<f64>) -> anyhow::Result<f64> + Send + Sync;

/// User forward-model penalty `R(p, p₀)`.
pub type FmPenaltyFn =
    dyn Fn(ArrayView1<f64>, ArrayView1<f64>) -> anyhow::Result<f64> + Send + Sync;

#[derive(Clone)]
pub enum FfRegularization {
    PlainL2,
    ChargeNeutrality { multiplicities: Array1<f64> },
    ChargeNeutralityWithEta { multiplicities: Array1<f64> },
    KlDivergence,
    Custom(Arc<FfPenaltyFn>),
}

impl fmt::Debug for FfRegularization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FfRegularization::PlainL2 => write!(f, "PlainL2"),
            FfRegularization::ChargeNeutrality { multiplicities } => {
                write!(f, "ChargeNeutrality({multiplicities})")
            }
            FfRegularization::ChargeNeutralityWithEta { multiplicities } => {
                write!(f, "ChargeNeutralityWithEta({multiplicities})")
            }
            FfRegularization::KlDivergence => write!(f, "KlDivergence"),
            FfRegularization::Custom(_) => write!(f, "Custom(<fn>)"),
        }
    }
}

impl FfRegularization {
    /// Multiplicity vectors must have one entry per parameter.
    ///
    /// # Errors
    /// - [`RefineError::ParameterDimMismatch`].
    pub fn validate(&self, n_ff: usize) -> RefineResult<()> {
        match self {
            FfRegularization::ChargeNeutrality { multiplicities }
            | FfRegularization::ChargeNeutralityWithEta { multiplicities }
                if multiplicities.len() != n_ff =>
            {
                Err(RefineError::ParameterDimMismatch {
                    what: "charge multiplicities".to_string(),
                    expected: n_ff,
                    found: multiplicities.len(),
                })
            }
            _ => Ok(()),
        }
    }

    /// `true` for the data-dependent relative-entropy penalty.
    pub fn is_kl(&self) -> bool {
        matches!(self, FfRegularization::KlDivergence)
    }

    /// Penalty of parameter-only variants; `None` for [`Self::KlDivergence`].
    ///
    /// # Errors
    /// - [`RefineError::Callback`] if a custom penalty fails.
    /// - [`RefineError::NumericalInstability`] if it returns a non-finite value.
    pub fn penalty(&self, p: ArrayView1<f64>) -> RefineResult<Option<f64>> {
        let value = match self {
            FfRegularization::PlainL2 => p.dot(&p),
            FfRegularization::ChargeNeutrality { multiplicities } => {
                let free = p.len().saturating_sub(1);
                let head = p.slice(ndarray::s![..free]);
                head.dot(&head) + multiplicities.dot(&p).powi(2)
            }
            FfRegularization::ChargeNeutralityWithEta { multiplicities } => {
                p.dot(&p) + multiplicities.dot(&p).powi(2)
            }
            FfRegularization::KlDivergence => return Ok(None),
            FfRegularization::Custom(f) => {
                f(p).map_err(|e| RefineError::callback("force-field penalty", e))?
            }
        };
        if !value.is_finite() {
            return Err(RefineError::instability("force-field penalty is not finite"));
        }
        Ok(Some(value))
    }

    /// Analytic gradient of the built-in parameter-only penalties.
    pub fn gradient(&self, p: ArrayView1<f64>) -> Option<Array1<f64>> {
        match self {
            FfRegularization::PlainL2 => Some(&p * 2.0),
            FfRegularization::ChargeNeutrality { multiplicities } => {
                let r = multiplicities.dot(&p);
                let mut grad = multiplicities * (2.0 * r);
                let last = p.len().saturating_sub(1);
                for i in 0..last {
                    grad[i] += 2.0 * p[i];
                }
                Some(grad)
            }
            FfRegularization::ChargeNeutralityWithEta { multiplicities } => {
                let r = multiplicities.dot(&p);
                Some(&p * 2.0 + multiplicities * (2.0 * r))
            }
            FfRegularization::KlDivergence | FfRegularization::Custom(_) => None,
        }
    }
}

#[derive(Clone)]
pub enum FmRegularization {
    /// `Σ (p - p₀)²`.
    SquaredDistance,
    Custom(Arc<FmPenaltyFn>),
}

impl fmt::Debug for FmRegularization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FmRegularization::SquaredDistance => write!(f, "SquaredDistance"),
            FmRegularization::Custom(_) => write!(f, "Custom(<fn>)"),
        }
    }
}

impl FmRegularization {
    /// # Errors
    /// - [`RefineError::Callback`] if a custom penalty fails.
    /// - [`RefineError::NumericalInstability`] for a non-finite value.
    pub fn penalty(&self, p: ArrayView1<f64>, reference: ArrayView1<f64>) -> RefineResult<f64> {
        let value = match self {
            FmRegularization::SquaredDistance => {
                let d = &p - &reference;
                d.dot(&d)
            }
            FmRegularization::Custom(f) => {
                f(p, reference).map_err(|e| RefineError::callback("forward-model penalty", e))?
            }
        };
        if !value.is_finite() {
            return Err(RefineError::instability("forward-model penalty is not finite"));
        }
        Ok(value)
    }

    pub fn gradient(&self, p: ArrayView1<f64>, reference: ArrayView1<f64>) -> Option<Array1<f64>> {
        match self {
            FmRegularization::SquaredDistance => Some((&p - &reference) * 2.0),
            FmRegularization::Custom(_) => None,
        }
    }
}

/// Penalties of both correction channels.
#[derive(Debug, Clone)]
pub struct Regularization {
    pub ff: FfRegularization,
    pub fm: FmRegularization,
}

impl Default for Regularization {
    fn default() -> Self {
        Self { ff: FfRegularization::PlainL2, fm: FmRegularization::SquaredDistance }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::{
        errors::OptResult,
        minimizer::{finite_diff::fd_gradient, Theta},
    };
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Values of the charge-neutrality penalties on a hand-checked vector.
    // - Analytic gradients against finite differences.
    // - Dimension validation and custom callbacks.
    // -------------------------------------------------------------------------

    #[test]
    // Purpose
    // -------
    // Charge penalties match the closed forms.
    //
    // Given
    // -----
    // - `p = [1, 2, 3, 4, 5]`, `m = [1, 1, 1, 1, 2]`.
    //
    // Expect
    // ------
    // - Without η: `1 + 4 + 9 + 16 + 20² = 430`.
    // - With η over `[p, 0.5]`, `m = [1, 1, 1, 1, 2, 0]`: `55.25 + 400`.
    fn charge_penalties_match_closed_forms() {
        let p = array![1.0, 2.0, 3.0, 4.0, 5.0];
        let reg =
            FfRegularization::ChargeNeutrality { multiplicities: array![1.0, 1.0, 1.0, 1.0, 2.0] };
        assert_eq!(reg.penalty(p.view()).unwrap(), Some(430.0));

        let p_eta = array![1.0, 2.0, 3.0, 4.0, 5.0, 0.5];
        let reg = FfRegularization::ChargeNeutralityWithEta {
            multiplicities: array![1.0, 1.0, 1.0, 1.0, 2.0, 0.0],
        };
        assert_eq!(reg.penalty(p_eta.view()).unwrap(), Some(455.25));
        assert!(reg.validate(5).is_err());
        assert!(reg.validate(6).is_ok());
    }

    #[test]
    // Purpose
    // -------
    // Analytic gradients agree with finite differences.
    //
    // Given
    // -----
    // - The three parameter-only built-ins at a generic point.
    //
    // Expect
    // ------
    // - Agreement to 1e-6.
    fn analytic_gradients_match_finite_differences() {
        let p = array![0.3, -1.1, 0.7];
        let m = array![1.0, 2.0, -1.0];
        let regs = [
            FfRegularization::PlainL2,
            FfRegularization::ChargeNeutrality { multiplicities: m.clone() },
            FfRegularization::ChargeNeutralityWithEta { multiplicities: m },
        ];
        for reg in regs {
            let analytic = reg.gradient(p.view()).unwrap();
            let f = |t: &Theta| -> OptResult<f64> { Ok(reg.penalty(t.view())?.unwrap_or(0.0)) };
            let fd = fd_gradient(&f, &p).unwrap();
            for i in 0..3 {
                assert_abs_diff_eq!(analytic[i], fd[i], epsilon = 1e-6);
            }
        }
    }

    #[test]
    // Purpose
    // -------
    // Forward-model penalties and custom failures.
    //
    // Given
    // -----
    // - `p = [1, 2]`, `p₀ = [0, 0]`, and a custom penalty that errors.
    //
    // Expect
    // ------
    // - Squared distance 5 with gradient `[2, 4]`; the custom error becomes
    //   `Callback`.
    fn forward_model_penalties() {
        let p = array![1.0, 2.0];
        let p0 = array![0.0, 0.0];
        let fm = FmRegularization::SquaredDistance;
        assert_eq!(fm.penalty(p.view(), p0.view()).unwrap(), 5.0);
        assert_eq!(fm.gradient(p.view(), p0.view()).unwrap(), array![2.0, 4.0]);

        let failing = FmRegularization::Custom(Arc::new(
            |_: ArrayView1<f64>, _: ArrayView1<f64>| -> anyhow::Result<f64> {
                anyhow::bail!("no anchor")
            },
        ));
        let err = failing.penalty(p.view(), p0.view()).unwrap_err();
        assert!(matches!(err, RefineError::Callback { ref text, .. } if text.contains("no anchor")));
        assert!(FfRegularization::KlDivergence.penalty(p.view()).unwrap().is_none());
    }
}
