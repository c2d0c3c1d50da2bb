//! minimizer::builders — L-BFGS solver construction helpers.
//!
//! Purpose
//! -------
//! Hide Argmin's generic wiring behind two builders, one per supported line
//! search, and apply the tolerances carried by [`MinimizerOptions`]. Initial
//! parameters and the iteration cap are runtime concerns handled by
//! [`run_lbfgs`](crate::optimization::minimizer::run::run_lbfgs).
//!
//! Invariants & assumptions
//! ------------------------
//! - The L-BFGS memory is `opts.lbfgs_mem` or [`DEFAULT_LBFGS_MEM`].
//! - Tolerances rejected by Argmin surface as [`OptError`](crate::optimization::errors::OptError)
//!   through the crate's `From<argmin::core::Error>` conversion.
use crate::optimization::{
    errors::OptResult,
    minimizer::{
        traits::MinimizerOptions,
        types::{
            Cost, Grad, HagerZhangLS, LbfgsHagerZhang, LbfgsMoreThuente, MoreThuenteLS, Theta,
            DEFAULT_LBFGS_MEM,
        },
    },
};
use argmin::solver::quasinewton::LBFGS;

/// Construct L-BFGS with Hager–Zhang line search and the configured
/// tolerances.
///
/// # Errors
/// - Argmin rejections of `tol_grad` / `tol_cost`, converted to `OptError`.
pub fn build_optimizer_hager_zhang(opts: &MinimizerOptions) -> OptResult<LbfgsHagerZhang> {
    let mem = opts.lbfgs_mem.unwrap_or(DEFAULT_LBFGS_MEM);
    configure_lbfgs(LbfgsHagerZhang::new(HagerZhangLS::new(), mem), opts)
}

/// Construct L-BFGS with More–Thuente line search and the configured
/// tolerances.
///
/// # Errors
/// - Argmin rejections of `tol_grad` / `tol_cost`, converted to `OptError`.
pub fn build_optimizer_more_thuente(opts: &MinimizerOptions) -> OptResult<LbfgsMoreThuente> {
    let mem = opts.lbfgs_mem.unwrap_or(DEFAULT_LBFGS_MEM);
    configure_lbfgs(LbfgsMoreThuente::new(MoreThuenteLS::new(), mem), opts)
}

/// Apply the optional tolerances of `opts` to a solver with any line search.
///
/// A `None` tolerance leaves Argmin's default in place.
pub fn configure_lbfgs<L>(
    mut solver: LBFGS<L, Theta, Grad, Cost>, opts: &MinimizerOptions,
) -> OptResult<LBFGS<L, Theta, Grad, Cost>> {
    if let Some(g) = opts.tols.tol_grad {
        solver = solver.with_tolerance_grad(g)?;
    }
    if let Some(c) = opts.tols.tol_cost {
        solver = solver.with_tolerance_cost(c)?;
    }
    Ok(solver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::minimizer::traits::{LineSearcher, Tolerances};

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Construction of both solver flavours with default and explicit memory.
    //
    // They intentionally DO NOT cover:
    // - Executor behavior (see `api`).
    // -------------------------------------------------------------------------

    #[test]
    // Purpose
    // -------
    // Both builders succeed with valid tolerances, with or without an
    // explicit memory size.
    //
    // Given
    // -----
    // - Tolerances with gradient and cost rules, memory `None` and `Some(11)`.
    //
    // Expect
    // ------
    // - All four builds return `Ok`.
    fn builders_accept_default_and_explicit_memory() {
        // Arrange
        let tols = Tolerances::new(Some(1e-6), Some(1e-8), Some(50)).expect("valid tolerances");
        let default_mem = MinimizerOptions::new(tols, LineSearcher::HagerZhang, false, None)
            .expect("valid options");
        let explicit_mem = MinimizerOptions::new(tols, LineSearcher::MoreThuente, false, Some(11))
            .expect("valid options");

        // Act & Assert
        assert!(build_optimizer_hager_zhang(&default_mem).is_ok());
        assert!(build_optimizer_hager_zhang(&explicit_mem).is_ok());
        assert!(build_optimizer_more_thuente(&default_mem).is_ok());
        assert!(build_optimizer_more_thuente(&explicit_mem).is_ok());
    }

    #[test]
    // Purpose
    // -------
    // `configure_lbfgs` leaves Argmin defaults alone when no tolerance is set.
    //
    // Given
    // -----
    // - Options with only `max_iter`.
    //
    // Expect
    // ------
    // - Configuration succeeds.
    fn configure_lbfgs_with_only_max_iter_succeeds() {
        let tols = Tolerances::new(None, None, Some(5)).expect("valid tolerances");
        let opts = MinimizerOptions::with_tolerances(tols);
        let raw = LbfgsMoreThuente::new(MoreThuenteLS::new(), DEFAULT_LBFGS_MEM);
        assert!(configure_lbfgs(raw, &opts).is_ok());
    }
}
