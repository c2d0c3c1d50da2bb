//! rust_refinement — ensemble refinement, force-field and forward-model
//! fitting with implicit hyperparameter gradients, with Python bindings.
//!
//! Purpose
//! -------
//! Serve as the crate root for Rust callers and as the PyO3 bridge that
//! exposes single-ensemble reweighting and refinement to Python via the
//! `_rust_refinement` extension module.
//!
//! Key behaviors
//! -------------
//! - Re-export the core Rust modules: [`refinement`] (data model, loss,
//!   fits, splits, search), [`optimization`] (L-BFGS engine and
//!   finite-difference derivatives) and [`inference`] (symmetric solves).
//! - With `python-bindings`, define the `reweight` function and the
//!   `RefinementFit` class of the `_rust_refinement` module.
//!
//! Invariants & assumptions
//! ------------------------
//! - All numerical work lives in the inner modules; the binding layer only
//!   converts inputs and maps errors to `ValueError`.
//! - Python inputs are copied into owned arrays before any computation.
//!
//! Conventions
//! -----------
//! - `RefineError` converts to `PyErr` at the boundary; the message is the
//!   error's `Display` text.
//!
//! Downstream usage
//! ----------------
//! - Native Rust code depends on [`refinement`] (or its prelude) and ignores
//!   the items behind `python-bindings`.
//!
//! Testing notes
//! -------------
//! - Numerical behavior is covered by unit tests in the inner modules and by
//!   the pipeline tests under `tests/`.

pub mod inference;
pub mod optimization;
pub mod refinement;
pub mod utils;

#[cfg(feature = "python-bindings")]
use numpy::{IntoPyArray, PyArray1};

#[cfg(feature = "python-bindings")]
use pyo3::{prelude::*, types::PyAny};

#[cfg(feature = "python-bindings")]
use crate::{
    refinement::{
        core::{hyperparams::Hyperparameters, regularization::Regularization, reweight},
        pipeline::fit::{fit, FitOutcome},
    },
    utils::{extract_f64_array, extract_f64_matrix, extract_fit_options, single_ensemble_data},
};

/// Tilt `weights` by `exp(-correction)`.
///
/// Returns the normalized tilted weights and `ln Σ w_i exp(-c_i)` of the
/// normalized input weights.
#[cfg(feature = "python-bindings")]
#[pyfunction]
#[pyo3(text_signature = "(weights, correction, /)")]
pub fn reweight_weights<'py>(
    py: Python<'py>, weights: &Bound<'py, PyAny>, correction: &Bound<'py, PyAny>,
) -> PyResult<(Bound<'py, PyArray1<f64>>, f64)> {
    let w = extract_f64_array(py, weights)?;
    let c = extract_f64_array(py, correction)?;
    let out = reweight::reweight(w.view(), c.view())?;
    Ok((out.weights.into_pyarray(py), out.log_z))
}

/// RefinementFit — Python-facing result of a single-ensemble refinement.
///
/// Purpose
/// -------
/// Refine one ensemble against one observable kind at a fixed α (β = γ = ∞)
/// and expose the refined weights, multipliers and fit summary.
///
/// Parameters
/// ----------
/// Constructed from Python via
/// `RefinementFit(weights, observables, values, sigmas, alpha, kind="=", ...)`:
/// - `weights`: prior frame weights (length `n_frames`).
/// - `observables`: `n_frames × n_obs` computed observables.
/// - `values`, `sigmas`: experimental values and uncertainties (`n_obs`).
/// - `alpha`: positive refinement strength; `inf` leaves the prior as is.
/// - `kind`: `"="`, `"<"` or `">"`.
/// - `tol_grad`, `max_iter`: multiplier-solver tolerances.
/// - `normalize`: standardize observables during the solve.
///
/// Notes
/// -----
/// - Native Rust code should call [`fit`] directly.
#[cfg(feature = "python-bindings")]
#[pyclass(module = "rust_refinement")]
pub struct RefinementFit {
    inner: FitOutcome,
}

#[cfg(feature = "python-bindings")]
#[pymethods]
impl RefinementFit {
    #[new]
    #[pyo3(
        signature = (
            weights, observables, values, sigmas, alpha,
            kind = "=", tol_grad = None, max_iter = None, normalize = true,
        ),
        text_signature = "(weights, observables, values, sigmas, alpha, /, kind='=', \
                          tol_grad=None, max_iter=None, normalize=True)"
    )]
    #[allow(clippy::too_many_arguments)]
    pub fn new<'py>(
        py: Python<'py>, weights: &Bound<'py, PyAny>, observables: &Bound<'py, PyAny>,
        values: &Bound<'py, PyAny>, sigmas: &Bound<'py, PyAny>, alpha: f64, kind: &str,
        tol_grad: Option<f64>, max_iter: Option<usize>, normalize: bool,
    ) -> PyResult<Self> {
        let data = single_ensemble_data(
            extract_f64_array(py, weights)?,
            extract_f64_matrix(observables)?,
            extract_f64_array(py, values)?,
            extract_f64_array(py, sigmas)?,
            kind,
        )?;
        let hyper = Hyperparameters::refinement_only(alpha)?;
        let opts = extract_fit_options(tol_grad, max_iter, normalize)?;
        let inner = fit(&data, &Regularization::default(), hyper, None, &opts)?;
        Ok(RefinementFit { inner })
    }

    /// Refined frame weights.
    #[getter]
    pub fn weights<'py>(&self, py: Python<'py>) -> Option<Bound<'py, PyArray1<f64>>> {
        self.inner.diagnostics.ensembles.first().map(|e| e.weights.clone().into_pyarray(py))
    }

    /// Multipliers in physical units (empty with α = ∞).
    #[getter]
    pub fn lambdas<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        self.inner.lambda.clone().into_pyarray(py)
    }

    #[getter]
    pub fn loss(&self) -> f64 {
        self.inner.diagnostics.loss
    }

    /// χ² of the refined weights.
    #[getter]
    pub fn chi2(&self) -> f64 {
        self.inner.diagnostics.chi2_total
    }

    #[getter]
    pub fn converged(&self) -> bool {
        self.inner.converged
    }

    #[getter]
    pub fn status(&self) -> String {
        self.inner.status.clone()
    }

    #[getter]
    pub fn warnings(&self) -> Vec<String> {
        self.inner.diagnostics.warnings.clone()
    }
}

/// Python module initializer for `_rust_refinement`.
#[cfg(feature = "python-bindings")]
#[pymodule]
fn _rust_refinement<'py>(_py: Python<'py>, m: &Bound<'py, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(reweight_weights, m)?)?;
    m.add_class::<RefinementFit>()?;
    Ok(())
}
