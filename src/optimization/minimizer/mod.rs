//! minimizer — argmin-powered L-BFGS minimization with optional box bounds.
//!
//! Purpose
//! -------
//! Provide the single optimization engine used by every layer of a
//! refinement run: the concave dual problem for Lagrange multipliers (with
//! half-line bounds for inequality observables), the model-parameter fit,
//! and the hyperparameter search. Callers implement [`Objective`] and call
//! [`minimize`] or [`minimize_bounded`].
//!
//! Key behaviors
//! -------------
//! - [`adapter::ArgMinAdapter`] bridges an [`Objective`] to Argmin, clamping
//!   into [`Bounds`] and projecting gradients at active bounds.
//! - [`builders`] construct L-BFGS with Hager–Zhang or More–Thuente line
//!   search; [`run::run_lbfgs`] executes and normalizes the result.
//! - [`finite_diff`] supplies gradients, Jacobians and Hessians when analytic
//!   derivatives are missing.
//!
//! Invariants & assumptions
//! ------------------------
//! - Objectives return the cost being minimized and never panic on invalid
//!   input; failures are [`OptError`](crate::optimization::errors::OptError)s.
//! - [`OptimOutcome::converged`] is `true` only when a tolerance was met.
//!
//! Testing notes
//! -------------
//! - Submodules carry unit tests for bounds, derivatives, validation and
//!   solver construction; [`api`] runs small convex problems end to end.

pub mod adapter;
pub mod api;
pub mod bounds;
pub mod builders;
pub mod finite_diff;
pub mod run;
pub mod traits;
pub mod types;
pub mod validation;

// ---- Re-exports (primary public surface) ----------------------------------

pub use self::api::{minimize, minimize_bounded};
pub use self::bounds::Bounds;
pub use self::traits::{LineSearcher, MinimizerOptions, Objective, OptimOutcome, Tolerances};
pub use self::types::{Cost, FnEvalMap, Grad, Hessian, Jacobian, Theta, DEFAULT_LBFGS_MEM};

pub mod prelude {
    pub use super::api::{minimize, minimize_bounded};
    pub use super::bounds::Bounds;
    pub use super::traits::{MinimizerOptions, Objective, OptimOutcome, Tolerances};
    pub use super::types::{Cost, Grad, Theta};
}
