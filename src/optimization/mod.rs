//! optimization — L-BFGS engine, derivative helpers and the shared error
//! surface.
//!
//! Purpose
//! -------
//! Provide one Argmin-backed minimizer for the three nested problems of a
//! refinement run (Lagrange multipliers, model parameters,
//! hyperparameters), together with finite-difference derivatives and the
//! guarded numerics they rely on.
//!
//! Key behaviors
//! -------------
//! - [`minimizer`]: [`Objective`](minimizer::Objective) trait, bounded and
//!   unbounded L-BFGS, finite-difference gradients/Jacobians/Hessians.
//! - [`numerical_stability`]: overflow-safe log-sum-exp and tolerances.
//! - [`errors`]: [`OptError`](errors::OptError) / `OptResult<T>`, which also
//!   carries objective failures through Argmin unchanged.
//!
//! Conventions
//! -----------
//! - Every objective is *minimized*; there are no sign flips in this layer.
//! - Failures are returned, never panicked; logging is limited to `debug!`
//!   solver summaries.

pub mod errors;
pub mod minimizer;
pub mod numerical_stability;

pub mod prelude {
    pub use super::errors::{OptError, OptResult};
    pub use super::minimizer::prelude::*;
    pub use super::numerical_stability::prelude::*;
}
