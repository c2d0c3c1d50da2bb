//! minimizer::types — numeric aliases and L-BFGS wiring shared by every
//! optimization layer of the crate.
//!
//! Purpose
//! -------
//! Keep the `ndarray`/Argmin generics in one place. The three nested
//! optimizations of a refinement run (Lagrange multipliers, model
//! parameters, hyperparameters) all minimize over a flat `Theta` and use
//! the solver aliases declared here.
//!
//! Conventions
//! -----------
//! - `Theta`, `Grad` are column vectors of the free coordinates.
//! - `Hessian` and `Jacobian` are dense; a Jacobian is laid out as
//!   `(outputs, inputs)`.
//! - `Cost` is the value being *minimized*; no sign flips happen below the
//!   objective implementations.
use argmin::solver::{
    linesearch::{HagerZhangLineSearch, MoreThuenteLineSearch},
    quasinewton::LBFGS,
};
use ndarray::{Array1, Array2};
use std::collections::HashMap;

/// Coordinate vector handed to the solver.
pub type Theta = Array1<f64>;

/// Gradient of the cost with respect to `Theta`.
pub type Grad = Array1<f64>;

/// Dense `n × n` second-derivative matrix.
pub type Hessian = Array2<f64>;

/// Dense `(outputs, inputs)` first-derivative matrix of a vector map.
pub type Jacobian = Array2<f64>;

/// Scalar objective value being minimized.
pub type Cost = f64;

/// Function-evaluation counters as reported by the solver.
///
/// Maps counter names (e.g., `"cost_count"`) to counts.
pub type FnEvalMap = HashMap<String, u64>;

/// Default history size (`m`) for L-BFGS runs.
pub const DEFAULT_LBFGS_MEM: usize = 7;

/// Hager–Zhang line search specialized to this crate’s numeric types.
pub type HagerZhangLS = HagerZhangLineSearch<Theta, Grad, Cost>;

/// More–Thuente line search specialized to this crate’s numeric types.
pub type MoreThuenteLS = MoreThuenteLineSearch<Theta, Grad, Cost>;

/// L-BFGS solver wired to the Hager–Zhang line search.
pub type LbfgsHagerZhang = LBFGS<HagerZhangLS, Theta, Grad, Cost>;

/// L-BFGS solver wired to the More–Thuente line search.
pub type LbfgsMoreThuente = LBFGS<MoreThuenteLS, Theta, Grad, Cost>;
