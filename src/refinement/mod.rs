//! refinement — ensemble refinement of molecular simulations against
//! experimental averages.
//!
//! Purpose
//! -------
//! Combine three corrections of a simulated ensemble into one loss and fit
//! them jointly:
//! - per-frame Lagrange multipliers λ (strength α) that reweight frames
//!   toward the experimental averages at a Kullback–Leibler cost,
//! - force-field correction parameters (strength β) that tilt the prior
//!   weights,
//! - forward-model parameters (strength γ) that recompute the observables.
//!
//! An infinite strength disables its channel. Finite strengths can be tuned
//! by cross-validation with implicit derivatives through the fitted optimum.
//!
//! Key behaviors
//! -------------
//! - [`core`] holds the validated data model ([`RefinementData`],
//!   [`Ensemble`], [`Reference`]), reweighting, the dual objective Γ of the
//!   multipliers and χ² metrics.
//! - [`pipeline`] builds the loss ([`RefinementProblem`]), fits parameters
//!   ([`fit`]), splits data ([`split`]), differentiates through the optimum
//!   ([`chi2_gradient`]) and searches the strengths ([`search`]).
//! - [`errors`] centralizes [`RefineError`] / [`RefineResult`].
//!
//! Invariants & assumptions
//! ------------------------
//! - Weights are non-negative with positive total; they are normalized on
//!   construction and after every tilt.
//! - Multipliers are flattened ensemble by ensemble, kind by kind (in the
//!   order the kinds were added to the ensemble builder), with the lower
//!   block of a two-sided reference before its upper block.
//! - Parameters are flattened as force-field parameters followed by
//!   forward-model parameters; a disabled channel contributes none.
//! - User callables (forward models, corrections, penalties) must be pure
//!   and safe to call from several threads.
//!
//! Conventions
//! -----------
//! - Losses are minimized; Γ is minimized over λ and the data term of the
//!   loss is `-α Σ Γ`.
//! - Searches move `log10` strengths; gradients are reported in those
//!   coordinates.
//! - Logging goes through `log`; only the search and failure fallbacks log
//!   above `debug`.
//!
//! Downstream usage
//! ----------------
//! 1. Build [`Ensemble`]s with [`Ensemble::builder`] and wrap them in
//!    [`RefinementData`] with a [`GlobalContext`].
//! 2. Pick [`Hyperparameters`] and a [`Regularization`].
//! 3. Call [`fit`] for fixed strengths, or [`refine_with_search`] to tune
//!    them first.
//!
//! Testing notes
//! -------------
//! - Unit tests live next to each module; `tests/` runs full pipelines on
//!   small synthetic ensembles.

pub mod core;
pub mod errors;
pub mod pipeline;

// ---- Re-exports (primary public surface) ----------------------------------

pub use self::core::{
    reweight, CorrectionModel, Cycle, Ensemble, ExpData, FfRegularization, FmRegularization,
    GlobalContext, Hyperparameters, MultiplierLayout, ParameterLayout, Reference, ReferenceKind,
    RefinementData, Regularization, Reweighted,
};
pub use self::errors::{RefineError, RefineResult};
pub use self::pipeline::{
    chi2_gradient, evaluate, fit, refine_with_search, search, split, ChiSquareTarget, Diagnostics,
    FitOptions, FitOutcome, LambdaMode, RefinementProblem, SearchOptions, SearchOutcome,
    SplitData, SplitOptions,
};

// ---- Optional convenience prelude for downstream crates -------------------
//
//     use rust_refinement::refinement::prelude::*;

pub mod prelude {
    pub use super::{
        evaluate, fit, refine_with_search, search, split, CorrectionModel, Cycle, Diagnostics,
        Ensemble, ExpData, FfRegularization, FitOptions, FitOutcome, FmRegularization,
        GlobalContext, Hyperparameters, Reference, RefineError, RefineResult, RefinementData,
        Regularization, SearchOptions, SearchOutcome, SplitOptions,
    };
}
