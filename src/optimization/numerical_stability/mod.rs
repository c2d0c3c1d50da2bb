//! numerical_stability — guarded numerics shared by the refinement layers.
//!
//! Purpose
//! -------
//! Centralize the overflow-safe exponential sums used by every Boltzmann
//! tilt, the log10 hyperparameter coordinates, and the small tolerances
//! that decide when an eigenvalue is zero, a multiplier is pinned, or a
//! standard deviation vanishes. Also the wall reported at points whose
//! evaluation failed numerically.
//!
//! Conventions
//! -----------
//! - Pure functions over `f64` / `ndarray` views; no logging and no global
//!   state.

pub mod transformations;

// ---- Re-exports (primary public surface) ----------------------------------

pub use self::transformations::{
    from_log10, rejected_step, to_log10, weighted_log_sum_exp, EIGEN_EPS, PIN_TOL,
    REJECTION_PENALTY, STD_FLOOR,
};

pub mod prelude {
    pub use super::transformations::{from_log10, to_log10, weighted_log_sum_exp};
}
