//! End-to-end refinement: loss, fits, splits and hyperparameter search.
//!
//! - [`loss`]: [`RefinementProblem`], the combined loss at fixed strengths.
//! - [`diagnostics`]: per-run bundle and the explicit-loss cross-check.
//! - [`fit`]: parameter fit at fixed strengths ([`fit`](fit::fit),
//!   [`evaluate`], held-out scoring with [`evaluate_split`]).
//! - [`split`]: seeded train/validation/test views.
//! - [`hypergradient`]: implicit derivatives of the optimum and of a χ².
//! - [`search`]: cross-validated search of the strengths.
pub mod diagnostics;
pub mod fit;
pub mod hypergradient;
pub mod loss;
pub mod search;
pub mod split;

pub use self::diagnostics::{Diagnostics, EnsembleDiagnostics, ExplicitLoss};
pub use self::fit::{
    evaluate, evaluate_split, fit, FitOptions, FitOutcome, FitTraceEntry, SplitEvaluation,
};
pub use self::hypergradient::{chi2_gradient, sensitivity, ChiSquareGradient, Sensitivity};
pub use self::loss::{CycleTerm, LambdaMode, LossComponents, RefinementProblem};
pub use self::search::{
    refine_with_search, search, ChiSquareTarget, SearchOptions, SearchOutcome, SearchTraceEntry,
};
pub use self::split::{split, BlockLayout, SplitData, SplitOptions};
