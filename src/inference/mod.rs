//! inference — linear algebra behind implicit differentiation.
//!
//! Purpose
//! -------
//! Hold the symmetric solves used when differentiating through nested
//! optima: the Lagrange-multiplier Hessian of the dual objective and the
//! total parameter Hessian of the loss.
//!
//! Conventions
//! -----------
//! - Matrices arrive as `ndarray` values and are solved with `nalgebra`.
//! - Singular systems are solved with a pseudo-inverse and flagged rather
//!   than rejected; callers decide whether to warn.

pub mod hessian;

pub use self::hessian::{invert_symmetric, solve_symmetric, SymmetricSolve};
