//! Conversion helpers for the PyO3 bindings.
//!
//! Python callers pass NumPy arrays, pandas objects or plain sequences;
//! these helpers turn them into owned `ndarray` values and assemble the
//! single-ensemble problems exposed by the extension module.
#[cfg(feature = "python-bindings")]
use ndarray::{Array1, Array2};

#[cfg(feature = "python-bindings")]
use pyo3::{
    exceptions::{PyTypeError, PyValueError},
    prelude::*,
    types::PyAny,
};

#[cfg(feature = "python-bindings")]
use numpy::{IntoPyArray, PyArrayMethods, PyReadonlyArray1, PyReadonlyArray2};

#[cfg(feature = "python-bindings")]
use crate::{
    optimization::minimizer::{MinimizerOptions, Tolerances},
    refinement::{
        core::{
            context::{GlobalContext, RefinementData},
            ensemble::Ensemble,
            reference::{ExpData, Reference, ReferenceKind},
        },
        errors::RefineError,
        pipeline::fit::FitOptions,
    },
};

/// Read a 1-D float array from an ndarray, a pandas Series or a sequence.
#[cfg(feature = "python-bindings")]
pub fn extract_f64_array<'py>(py: Python<'py>, raw: &Bound<'py, PyAny>) -> PyResult<Array1<f64>> {
    if let Ok(arr) = raw.extract::<PyReadonlyArray1<f64>>() {
        return Ok(arr.as_array().to_owned());
    }
    if let Ok(obj) = raw.call_method("to_numpy", (false,), None) {
        if let Ok(arr) = obj.extract::<PyReadonlyArray1<f64>>() {
            return Ok(arr.as_array().to_owned());
        }
    }
    let vec: Vec<f64> = raw.extract().map_err(|_| {
        PyTypeError::new_err("expected a 1-D numpy.ndarray, pandas.Series, or sequence of float64")
    })?;
    Ok(vec.into_pyarray(py).readonly().as_array().to_owned())
}

/// Read a 2-D float array (frames × observables).
#[cfg(feature = "python-bindings")]
pub fn extract_f64_matrix<'py>(raw: &Bound<'py, PyAny>) -> PyResult<Array2<f64>> {
    if let Ok(arr) = raw.extract::<PyReadonlyArray2<f64>>() {
        return Ok(arr.as_array().to_owned());
    }
    if let Ok(obj) = raw.call_method("to_numpy", (false,), None) {
        if let Ok(arr) = obj.extract::<PyReadonlyArray2<f64>>() {
            return Ok(arr.as_array().to_owned());
        }
    }
    let rows: Vec<Vec<f64>> = raw
        .extract()
        .map_err(|_| PyTypeError::new_err("expected a 2-D numpy.ndarray or nested sequence of float64"))?;
    let n_rows = rows.len();
    let n_cols = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != n_cols) {
        return Err(PyValueError::new_err("all rows must have the same length"));
    }
    Array2::from_shape_vec((n_rows, n_cols), rows.into_iter().flatten().collect())
        .map_err(|e| PyValueError::new_err(e.to_string()))
}

/// One ensemble with one observable kind named `"obs"`.
#[cfg(feature = "python-bindings")]
pub fn single_ensemble_data(
    weights: Array1<f64>, observables: Array2<f64>, values: Array1<f64>, sigmas: Array1<f64>,
    kind: &str,
) -> PyResult<RefinementData> {
    let kind: ReferenceKind = kind.parse()?;
    let data = ExpData::new("obs", values, sigmas)?;
    let reference = Reference::new("obs", kind, data, None)?;
    let ensemble = Ensemble::builder("ensemble", weights).observable("obs", observables, reference).build()?;
    Ok(RefinementData::new(GlobalContext::new(), vec![ensemble])?)
}

/// Fit options with optional multiplier-solver tolerances.
#[cfg(feature = "python-bindings")]
pub fn extract_fit_options(
    tol_grad: Option<f64>, max_iter: Option<usize>, normalize: bool,
) -> PyResult<FitOptions> {
    let defaults = FitOptions::default();
    let inner = match (tol_grad, max_iter) {
        (None, None) => defaults.inner,
        _ => {
            let tols = Tolerances::new(tol_grad, None, max_iter).map_err(RefineError::from)?;
            MinimizerOptions::with_tolerances(tols)
        }
    };
    Ok(FitOptions { inner, normalize_observables: normalize, ..defaults })
}
