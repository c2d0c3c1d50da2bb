//! Execution helper that runs an `argmin` solver on an [`Objective`] and
//! returns an [`OptimOutcome`].
use crate::optimization::{
    errors::OptResult,
    minimizer::{
        adapter::ArgMinAdapter,
        traits::{MinimizerOptions, Objective, OptimOutcome},
        types::{Grad, Theta},
    },
};
use argmin::core::{Executor, State};

/// Run an `argmin` L-BFGS solve.
///
/// Wires the adapter, the solver, the starting point and the iteration cap,
/// optionally attaches the slog observer (`obs_slog` feature with
/// `opts.verbose`), executes, and converts the final state.
///
/// For a bounded adapter the starting point and the reported best parameter
/// are clamped into the box, and the reported value is re-evaluated there
/// when clamping moved it.
///
/// # Errors
/// - Any `argmin` runtime error (objective failures, line-search failures),
///   converted through `From<argmin::core::Error>`; objective errors keep
///   their original `OptError` variant.
/// - Validation errors while building the [`OptimOutcome`].
pub fn run_lbfgs<'a, F, S>(
    theta0: Theta, opts: &MinimizerOptions, problem: ArgMinAdapter<'a, F>, solver: S,
) -> OptResult<OptimOutcome>
where
    F: Objective,
    S: argmin::core::Solver<
            ArgMinAdapter<'a, F>,
            argmin::core::IterState<Theta, Grad, (), (), (), f64>,
        > + Send
        + 'static,
{
    let bounds = problem.bounds;
    let theta0 = problem.feasible(&theta0).into_owned();

    #[cfg(feature = "obs_slog")]
    if opts.verbose {
        log_initial_state(&theta0, &problem)?;
    }

    let mut optimizer = Executor::new(problem.share(), solver);
    optimizer = optimizer.configure(|state| state.param(theta0));

    #[cfg(feature = "obs_slog")]
    if opts.verbose {
        let observer = argmin_observer_slog::SlogLogger::term_noblock();
        optimizer = optimizer.add_observer(observer, argmin::core::observers::ObserverMode::Always);
    }

    if let Some(max_iter) = opts.tols.max_iter {
        optimizer = optimizer.configure(|state| state.max_iters(max_iter as u64));
    }

    let mut result = optimizer.run()?.state().clone();
    let iterations = result.get_iter();
    let function_counts = result.get_func_counts().clone();
    let termination = result.get_termination_status().clone();
    let grad = result.take_gradient();
    let mut best_cost = result.get_best_cost();
    let mut best = result.take_best_param();
    if let (Some(b), Some(theta)) = (bounds, best.as_ref()) {
        let clamped = b.clamp(theta);
        if clamped != *theta {
            best_cost = problem.eval_cost(&clamped)?;
            best = Some(clamped);
        }
    }
    log::debug!(
        "L-BFGS finished after {iterations} iterations with cost {best_cost:.6e} ({termination:?})"
    );
    OptimOutcome::new(best, best_cost, termination, iterations, function_counts, grad)
}

// ---- Helper Methods ----

#[cfg(feature = "obs_slog")]
fn log_initial_state<F: Objective>(theta0: &Theta, problem: &ArgMinAdapter<'_, F>) -> OptResult<()> {
    use argmin_math::ArgminL2Norm;
    let c0 = problem.eval_cost(theta0)?;
    let g0n = problem.eval_gradient(theta0).ok().map(|g| g.l2_norm());
    eprintln!(
        "init: cost(theta0) = {:.6}{}",
        c0,
        g0n.map(|n| format!(", ||grad|| = {:.6}", n)).unwrap_or_default()
    );
    Ok(())
}
