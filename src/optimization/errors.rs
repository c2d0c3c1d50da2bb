//! optimization::errors — failures of the L-BFGS engine and its helpers.
//!
//! Objective failures cross Argmin as boxed [`OptError`]s and are recovered
//! intact by `From<argmin::core::Error>`; native Argmin errors collapse into
//! [`OptError::Backend`] tagged with their Argmin variant name.
use argmin::core::{ArgminError, Error};

/// Result alias for optimizer operations.
pub type OptResult<T> = Result<T, OptError>;

#[derive(Debug, Clone, PartialEq)]
pub enum OptError {
    // ---- Gradient ----
    /// The objective has no analytic gradient; finite differences are used.
    GradientNotImplemented,

    GradientDimMismatch { expected: usize, found: usize },

    InvalidGradient { index: usize, value: f64, reason: &'static str },

    // ---- Solver configuration ----
    InvalidTolGrad { tol: f64, reason: &'static str },
    InvalidTolCost { tol: f64, reason: &'static str },
    InvalidMaxIter { max_iter: usize, reason: &'static str },
    /// Every stopping criterion was left unset.
    NoTolerancesProvided,
    InvalidLineSearch { name: String, reason: &'static str },
    InvalidLBFGSMem { mem: usize, reason: &'static str },

    // ---- Box constraints ----
    BoundsDimMismatch { expected: usize, found: usize },
    /// `lower > upper` or a NaN bound.
    InvalidBounds { index: usize, lower: f64, upper: f64 },

    // ---- Objective ----
    NonFiniteCost { value: f64 },
    /// A non-finite intermediate inside the objective (overflowing tilt,
    /// NaN average). Outer solvers treat it as a rejected point.
    NumericalInstability { text: String },
    /// Any other objective failure, rendered to text.
    ObjectiveFailed { text: String },

    // ---- Solver outcome ----
    InvalidThetaHat { index: usize, value: f64, reason: &'static str },
    MissingThetaHat,

    // ---- Derivatives ----
    HessianDimMismatch { expected: usize, found: (usize, usize) },
    InvalidHessian { row: usize, col: usize, value: f64 },
    /// Expected `(outputs, inputs)`.
    JacobianDimMismatch { expected: (usize, usize), found: (usize, usize) },
    InvalidJacobian { row: usize, col: usize, value: f64 },

    // ---- Argmin ----
    /// Native Argmin error; `kind` names the Argmin variant.
    Backend { kind: &'static str, text: String },
}

impl OptError {
    /// `true` for failures that come from a non-finite intermediate rather
    /// than from configuration or the backend.
    pub fn is_numerical(&self) -> bool {
        matches!(self, OptError::NumericalInstability { .. } | OptError::NonFiniteCost { .. })
    }
}

impl std::error::Error for OptError {}

impl std::fmt::Display for OptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptError::GradientNotImplemented => write!(f, "No analytic gradient"),
            OptError::GradientDimMismatch { expected, found } => {
                write!(f, "Gradient has {found} entries, expected {expected}")
            }
            OptError::InvalidGradient { index, value, reason } => {
                write!(f, "Gradient entry {index} = {value}: {reason}")
            }
            OptError::InvalidTolGrad { tol, reason } => write!(f, "tol_grad = {tol}: {reason}"),
            OptError::InvalidTolCost { tol, reason } => write!(f, "tol_cost = {tol}: {reason}"),
            OptError::InvalidMaxIter { max_iter, reason } => {
                write!(f, "max_iter = {max_iter}: {reason}")
            }
            OptError::NoTolerancesProvided => {
                write!(f, "At least one of tol_grad, tol_cost, max_iter is required")
            }
            OptError::InvalidLineSearch { name, reason } => {
                write!(f, "Line search '{name}': {reason}")
            }
            OptError::InvalidLBFGSMem { mem, reason } => write!(f, "L-BFGS memory {mem}: {reason}"),
            OptError::BoundsDimMismatch { expected, found } => {
                write!(f, "Bounds have {found} entries, expected {expected}")
            }
            OptError::InvalidBounds { index, lower, upper } => {
                write!(f, "Empty box [{lower}, {upper}] at index {index}")
            }
            OptError::NonFiniteCost { value } => write!(f, "Objective returned {value}"),
            OptError::NumericalInstability { text } => write!(f, "Numerical instability: {text}"),
            OptError::ObjectiveFailed { text } => write!(f, "Objective failed: {text}"),
            OptError::InvalidThetaHat { index, value, reason } => {
                write!(f, "Solver returned {value} at index {index}: {reason}")
            }
            OptError::MissingThetaHat => write!(f, "Solver returned no parameters"),
            OptError::HessianDimMismatch { expected, found } => {
                write!(f, "Hessian is {found:?}, expected ({expected}, {expected})")
            }
            OptError::InvalidHessian { row, col, value } => {
                write!(f, "Non-finite Hessian entry ({row}, {col}) = {value}")
            }
            OptError::JacobianDimMismatch { expected, found } => {
                write!(f, "Jacobian is {found:?}, expected {expected:?}")
            }
            OptError::InvalidJacobian { row, col, value } => {
                write!(f, "Non-finite Jacobian entry ({row}, {col}) = {value}")
            }
            OptError::Backend { kind, text } => write!(f, "Argmin {kind}: {text}"),
        }
    }
}

impl From<Error> for OptError {
    fn from(err: Error) -> Self {
        let err = match err.downcast::<OptError>() {
            Ok(own) => return own,
            Err(err) => err,
        };
        match err.downcast::<ArgminError>() {
            Ok(argmin_err) => {
                let kind = match &argmin_err {
                    ArgminError::InvalidParameter { .. } => "invalid parameter",
                    ArgminError::NotImplemented { .. } => "not implemented",
                    ArgminError::NotInitialized { .. } => "not initialized",
                    ArgminError::ConditionViolated { .. } => "condition violated",
                    ArgminError::CheckpointNotFound { .. } => "checkpoint not found",
                    ArgminError::PotentialBug { .. } => "potential bug",
                    ArgminError::ImpossibleError { .. } => "impossible error",
                    _ => "error",
                };
                OptError::Backend { kind, text: argmin_err.to_string() }
            }
            Err(other) => OptError::Backend { kind: "error", text: other.to_string() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Recovery of crate errors and Argmin errors from `argmin::core::Error`.
    // - The `is_numerical` classification used by the nested optimizers.
    // -------------------------------------------------------------------------

    #[test]
    // Purpose
    // -------
    // An `OptError` boxed into an Argmin error comes back unchanged.
    //
    // Given
    // -----
    // - `OptError::NumericalInstability` converted with `.into()`.
    //
    // Expect
    // ------
    // - Same variant and text; classified as numerical.
    fn boxed_numerical_instability_survives_argmin() {
        let original = OptError::NumericalInstability { text: "tilt overflow".to_string() };
        let boxed: Error = original.clone().into();

        let recovered = OptError::from(boxed);

        assert_eq!(recovered, original);
        assert!(recovered.is_numerical());
    }

    #[test]
    // Purpose
    // -------
    // Native Argmin errors become tagged backend errors.
    //
    // Given
    // -----
    // - `ArgminError::ConditionViolated { text: "descent" }`.
    //
    // Expect
    // ------
    // - `Backend { kind: "condition violated", .. }` whose text mentions
    //   "descent"; not numerical.
    fn argmin_errors_become_backend_errors() {
        let boxed: Error = ArgminError::ConditionViolated { text: "descent".to_string() }.into();

        let mapped = OptError::from(boxed);

        assert!(matches!(mapped, OptError::Backend { kind: "condition violated", .. }));
        assert!(!mapped.is_numerical());
        assert!(mapped.to_string().contains("descent"));
    }
}
