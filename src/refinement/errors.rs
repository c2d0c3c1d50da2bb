//! refinement::errors — unified error type for the refinement engine.
//!
//! Purpose
//! -------
//! Define [`RefineError`] and [`RefineResult`], the error surface of data
//! construction, loss evaluation, parameter fits, splits and the
//! hyperparameter search.
//!
//! Key behaviors
//! -------------
//! - Structural input problems (missing observables, frame-count mismatches,
//!   malformed reference tags, inconsistent two-sided bounds, invalid
//!   weights or hyperparameters) are reported at construction time.
//! - Non-finite tilts surface as [`RefineError::NumericalInstability`].
//! - Failures of user-supplied callables are wrapped in
//!   [`RefineError::Callback`] with the `anyhow` error chain rendered to
//!   text.
//! - Solver errors are wrapped in [`RefineError::Optimization`].
//!
//! Conventions
//! -----------
//! - `From<OptError> for RefineError` and `From<RefineError> for OptError`
//!   let objectives report domain failures through Argmin while keeping
//!   `NumericalInstability` recognizable on both sides of the seam.
use crate::optimization::errors::OptError;

#[cfg(feature = "python-bindings")]
use pyo3::{exceptions::PyValueError, PyErr};

/// Result alias for the refinement layer.
pub type RefineResult<T> = Result<T, RefineError>;

#[derive(Debug, Clone, PartialEq)]
pub enum RefineError {
    // ---- Data ----
    /// An ensemble has no frames.
    EmptyEnsemble { ensemble: String },

    /// Frame weights must be finite, non-negative and not all zero.
    InvalidWeights { ensemble: String, index: usize, value: f64, reason: &'static str },

    /// An array attached to an ensemble has the wrong number of frames.
    FrameCountMismatch { ensemble: String, what: String, expected: usize, found: usize },

    /// An observable matrix and its reference disagree on the observable count.
    ObservableCountMismatch { ensemble: String, kind: String, expected: usize, found: usize },

    /// A kind has a reference but no computed values (and no forward model).
    MissingObservables { ensemble: String, kind: String },

    /// Reference type tag outside `"="`, `"<"`, `">"`, `"><"`.
    MalformedReferenceTag { tag: String },

    /// Reference values must be finite and uncertainties strictly positive.
    InvalidReference { kind: String, index: usize, value: f64, reason: &'static str },

    /// Two-sided reference with `lower > upper`.
    InconsistentBounds { kind: String, index: usize, lower: f64, upper: f64 },

    /// Temperatures must be finite and strictly positive.
    InvalidTemperature { name: String, value: f64 },

    /// Ensemble, kind or cycle names must be unique.
    DuplicateName { name: String },

    /// Name lookup failed.
    UnknownEnsemble { name: String },

    /// A kind name does not exist in the ensemble.
    UnknownKind { ensemble: String, kind: String },

    /// Force-field features or multiplicities do not match the parameter names.
    ParameterDimMismatch { what: String, expected: usize, found: usize },

    /// A forward model was supplied without reference coefficients (or the
    /// reverse), or returned an unusable mapping.
    InvalidForwardModel { ensemble: String, reason: String },

    /// Malformed stored normalization constants.
    InvalidNormalization { ensemble: String, kind: String, reason: &'static str },

    /// Malformed cycle definition.
    InvalidCycle { cycle: String, reason: String },

    /// Frame stride must be at least 1.
    InvalidStride { stride: usize },

    // ---- Configuration ----
    /// Hyperparameter outside its admissible range.
    InvalidHyperparameter { name: &'static str, value: f64, reason: &'static str },

    /// Split fraction outside `(0, 1)`.
    InvalidFraction { name: &'static str, value: f64 },

    /// A split would leave the training or test set empty, or explicit
    /// indices are out of range / duplicated.
    InvalidSplit { ensemble: String, reason: String },

    /// Block labels do not cover the frames.
    InvalidBlocks { ensemble: String, reason: String },

    /// A search needs at least one seed.
    NoSeeds,

    /// Unrecognized χ² target name.
    UnknownTarget { name: String },

    // ---- Evaluation ----
    /// A multiplier vector does not match the layout.
    MultiplierDimMismatch { expected: usize, found: usize },

    /// A parameter vector does not match the layout.
    ParameterVectorMismatch { expected: usize, found: usize },

    /// A tilt or log-partition became non-finite.
    NumericalInstability { context: String },

    /// A user-supplied function failed.
    Callback { context: String, text: String },

    /// Solver-level failure.
    Optimization(OptError),
}

impl RefineError {
    /// Wrap a failure returned by a user-supplied function.
    pub fn callback(context: impl Into<String>, err: anyhow::Error) -> Self {
        RefineError::Callback { context: context.into(), text: format!("{err:#}") }
    }

    /// Non-finite intermediate in `context`.
    pub fn instability(context: impl Into<String>) -> Self {
        RefineError::NumericalInstability { context: context.into() }
    }

    /// `true` for numerical failures (which an outer optimizer treats as a
    /// rejected step).
    pub fn is_numerical(&self) -> bool {
        match self {
            RefineError::NumericalInstability { .. } => true,
            RefineError::Optimization(e) => e.is_numerical(),
            _ => false,
        }
    }
}

impl std::error::Error for RefineError {}

impl std::fmt::Display for RefineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // ---- Data ----
            RefineError::EmptyEnsemble { ensemble } => {
                write!(f, "Ensemble '{ensemble}' has no frames")
            }
            RefineError::InvalidWeights { ensemble, index, value, reason } => {
                write!(f, "Invalid weight {value} at frame {index} of '{ensemble}': {reason}")
            }
            RefineError::FrameCountMismatch { ensemble, what, expected, found } => {
                write!(f, "'{ensemble}': {what} has {found} frames, expected {expected}")
            }
            RefineError::ObservableCountMismatch { ensemble, kind, expected, found } => {
                write!(f, "'{ensemble}/{kind}': {found} observables, reference has {expected}")
            }
            RefineError::MissingObservables { ensemble, kind } => {
                write!(f, "'{ensemble}/{kind}': no computed observables and no forward model")
            }
            RefineError::MalformedReferenceTag { tag } => {
                write!(f, "Malformed reference tag '{tag}': expected '=', '<', '>' or '><'")
            }
            RefineError::InvalidReference { kind, index, value, reason } => {
                write!(f, "Invalid reference for '{kind}' at {index}: {value}: {reason}")
            }
            RefineError::InconsistentBounds { kind, index, lower, upper } => {
                write!(f, "Two-sided reference '{kind}' at {index}: lower {lower} > upper {upper}")
            }
            RefineError::InvalidTemperature { name, value } => {
                write!(f, "Invalid temperature {value} for '{name}': must be finite and positive")
            }
            RefineError::DuplicateName { name } => write!(f, "Duplicate name '{name}'"),
            RefineError::UnknownEnsemble { name } => write!(f, "Unknown ensemble '{name}'"),
            RefineError::UnknownKind { ensemble, kind } => {
                write!(f, "Unknown observable kind '{kind}' in '{ensemble}'")
            }
            RefineError::ParameterDimMismatch { what, expected, found } => {
                write!(f, "{what}: expected {expected} entries, found {found}")
            }
            RefineError::InvalidForwardModel { ensemble, reason } => {
                write!(f, "Forward model of '{ensemble}': {reason}")
            }
            RefineError::InvalidNormalization { ensemble, kind, reason } => {
                write!(f, "Normalization of '{ensemble}/{kind}': {reason}")
            }
            RefineError::InvalidCycle { cycle, reason } => {
                write!(f, "Invalid cycle '{cycle}': {reason}")
            }
            RefineError::InvalidStride { stride } => {
                write!(f, "Invalid stride {stride}: must be at least 1")
            }

            // ---- Configuration ----
            RefineError::InvalidHyperparameter { name, value, reason } => {
                write!(f, "Invalid hyperparameter {name} = {value}: {reason}")
            }
            RefineError::InvalidFraction { name, value } => {
                write!(f, "Invalid fraction {name} = {value}: must lie in (0, 1)")
            }
            RefineError::InvalidSplit { ensemble, reason } => {
                write!(f, "Invalid split of '{ensemble}': {reason}")
            }
            RefineError::InvalidBlocks { ensemble, reason } => {
                write!(f, "Invalid blocks for '{ensemble}': {reason}")
            }
            RefineError::NoSeeds => write!(f, "Hyperparameter search needs at least one seed"),
            RefineError::UnknownTarget { name } => {
                write!(f, "Unknown χ² target '{name}': expected 'training', 'validation' or 'test'")
            }

            // ---- Evaluation ----
            RefineError::MultiplierDimMismatch { expected, found } => {
                write!(f, "Multiplier vector has {found} entries, layout expects {expected}")
            }
            RefineError::ParameterVectorMismatch { expected, found } => {
                write!(f, "Parameter vector has {found} entries, layout expects {expected}")
            }
            RefineError::NumericalInstability { context } => {
                write!(f, "Numerical instability: {context}")
            }
            RefineError::Callback { context, text } => {
                write!(f, "User function failed ({context}): {text}")
            }
            RefineError::Optimization(e) => write!(f, "Optimization failed: {e}"),
        }
    }
}

impl From<OptError> for RefineError {
    fn from(err: OptError) -> Self {
        match err {
            OptError::NumericalInstability { text } => {
                RefineError::NumericalInstability { context: text }
            }
            other => RefineError::Optimization(other),
        }
    }
}

impl From<RefineError> for OptError {
    fn from(err: RefineError) -> Self {
        match err {
            RefineError::NumericalInstability { context } => {
                OptError::NumericalInstability { text: context }
            }
            RefineError::Optimization(e) => e,
            other => OptError::ObjectiveFailed { text: other.to_string() },
        }
    }
}

#[cfg(feature = "python-bindings")]
impl From<RefineError> for PyErr {
    fn from(err: RefineError) -> PyErr {
        PyValueError::new_err(format!("RefineError: {err}"))
    }
}
