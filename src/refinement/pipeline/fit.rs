//! Parameter fit at fixed hyperparameters.
//!
//! Purpose
//! -------
//! Minimize the combined loss over the force-field and forward-model
//! parameters with L-BFGS. Every loss evaluation re-solves the multipliers
//! (warm-started from the previous solve); the gradient holds them fixed at
//! that solve, which is exact at a stationary point of Γ.
//!
//! Key behaviors
//! -------------
//! - [`FitObjective`] owns an explicit context (trace and last solve) behind
//!   a `RefCell`; the gradient re-solves when called at a point the value
//!   was not evaluated at.
//! - The returned estimate is the traced evaluation with the smallest loss,
//!   not the solver's last iterate.
//! - A numerical failure at a trial point rejects that point: it is traced
//!   with [`FitTraceEntry::rejected`] set and the solver sees a finite wall
//!   above the best loss (see [`rejected_step`]), so the line search
//!   backtracks. Only a failure at the starting point ends the fit.
//! - With an empty parameter vector no outer optimization runs; the
//!   multipliers are solved once.
//! - With `normalize_observables` the fit runs on a standardized copy and
//!   the multipliers are mapped back to physical units before the final
//!   diagnostics are computed on the original data.
//!
//! Invariants & assumptions
//! ------------------------
//! - Multipliers in [`FitTraceEntry`] are in the units of the working copy.
//! - [`FitOutcome::lambda`] is always physical.
use crate::{
    optimization::{
        errors::{OptError, OptResult},
        minimizer::{finite_diff::fd_gradient, minimize, Grad, MinimizerOptions, Objective, Theta, Tolerances},
        numerical_stability::rejected_step,
    },
    refinement::{
        core::{
            context::RefinementData,
            hyperparams::Hyperparameters,
            layout::{MultiplierLayout, ParameterLayout},
            normalization::{normalize, to_physical_lambda},
            regularization::Regularization,
        },
        errors::{RefineError, RefineResult},
        pipeline::{
            diagnostics::Diagnostics,
            loss::{InnerSolve, LambdaMode, RefinementProblem},
            split::SplitData,
        },
    },
};
use ndarray::Array1;
use std::cell::RefCell;

/// Settings of a parameter fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    /// Solver over the parameters.
    pub outer: MinimizerOptions,
    /// Solver over the multipliers of each ensemble.
    pub inner: MinimizerOptions,
    pub normalize_observables: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        let tols = |max_iter| Tolerances { tol_grad: Some(1e-3), tol_cost: None, max_iter: Some(max_iter) };
        Self {
            outer: MinimizerOptions::with_tolerances(tols(200)),
            inner: MinimizerOptions::with_tolerances(tols(1000)),
            normalize_observables: true,
        }
    }
}

/// One loss evaluation of the fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FitTraceEntry {
    pub params: Array1<f64>,
    pub lambda: Array1<f64>,
    /// `+∞` for a rejected point.
    pub loss: f64,
    pub inner: Vec<Option<InnerSolve>>,
    /// Why the evaluation failed numerically, for a rejected point.
    pub rejected: Option<String>,
}

impl FitTraceEntry {
    pub fn inner_converged(&self) -> bool {
        self.inner.iter().flatten().all(|s| s.converged)
    }

    fn rejection(params: Array1<f64>, reason: String) -> Self {
        Self {
            params,
            lambda: Array1::zeros(0),
            loss: f64::INFINITY,
            inner: Vec::new(),
            rejected: Some(reason),
        }
    }
}

/// Result of [`fit`].
#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    pub hyper: Hyperparameters,
    pub params: Array1<f64>,
    /// Physical multipliers; empty with α = ∞.
    pub lambda: Array1<f64>,
    /// Outer convergence and every inner solve at the returned estimate.
    pub converged: bool,
    pub status: String,
    pub iterations: usize,
    pub diagnostics: Diagnostics,
    pub trace: Vec<FitTraceEntry>,
}

#[derive(Debug, Default)]
struct FitContext {
    trace: Vec<FitTraceEntry>,
    last: Option<(Array1<f64>, Array1<f64>)>,
    failure: Option<RefineError>,
}

/// Loss of the parameter fit as an [`Objective`].
pub struct FitObjective<'p, 'a> {
    problem: &'p RefinementProblem<'a>,
    ctx: RefCell<FitContext>,
}

impl<'p, 'a> FitObjective<'p, 'a> {
    pub fn new(problem: &'p RefinementProblem<'a>) -> Self {
        Self { problem, ctx: RefCell::new(FitContext::default()) }
    }

    fn record<T>(&self, result: RefineResult<T>) -> OptResult<T> {
        result.map_err(|err| {
            let mut ctx = self.ctx.borrow_mut();
            if ctx.failure.is_none() {
                ctx.failure = Some(err.clone());
            }
            err.into()
        })
    }

    /// Solve the multipliers at `theta`, trace the evaluation and return it.
    fn solve(&self, theta: &Theta) -> RefineResult<FitTraceEntry> {
        let warm = self.ctx.borrow().last.as_ref().map(|(_, l)| l.clone());
        let comps = self.problem.loss_components(theta, LambdaMode::Solve { warm: warm.as_ref() })?;
        let entry = FitTraceEntry {
            params: theta.clone(),
            lambda: comps.lambda,
            loss: comps.total,
            inner: comps.inner,
            rejected: None,
        };
        let mut ctx = self.ctx.borrow_mut();
        ctx.last = Some((entry.params.clone(), entry.lambda.clone()));
        ctx.trace.push(entry.clone());
        Ok(entry)
    }

    fn lambda_at(&self, theta: &Theta) -> RefineResult<Array1<f64>> {
        let cached = self
            .ctx
            .borrow()
            .last
            .as_ref()
            .filter(|(p, _)| p == theta)
            .map(|(_, l)| l.clone());
        match cached {
            Some(l) => Ok(l),
            None => Ok(self.solve(theta)?.lambda),
        }
    }

    /// Trace a numerical failure at `theta` and report the wall there.
    ///
    /// Without an accepted evaluation there is nothing to back off to and
    /// the failure is returned.
    fn reject(&self, theta: &Theta, err: RefineError) -> OptResult<f64> {
        log::debug!("parameter fit rejected a trial point: {err}");
        let best = self.best_accepted();
        let mut ctx = self.ctx.borrow_mut();
        ctx.trace.push(FitTraceEntry::rejection(theta.clone(), err.to_string()));
        match best {
            Some((cost, params)) => Ok(rejected_step(cost, params.view(), theta.view()).0),
            None => {
                if ctx.failure.is_none() {
                    ctx.failure = Some(err.clone());
                }
                Err(err.into())
            }
        }
    }

    fn best_accepted(&self) -> Option<(f64, Array1<f64>)> {
        self.ctx
            .borrow()
            .trace
            .iter()
            .filter(|e| e.rejected.is_none() && e.loss.is_finite())
            .min_by(|a, b| a.loss.total_cmp(&b.loss))
            .map(|e| (e.loss, e.params.clone()))
    }

    fn is_rejected(&self, theta: &Theta) -> bool {
        self.ctx.borrow().trace.iter().rev().any(|e| e.rejected.is_some() && &e.params == theta)
    }

    pub fn trace(&self) -> Vec<FitTraceEntry> {
        self.ctx.borrow().trace.clone()
    }

    fn into_parts(self) -> FitContext {
        self.ctx.into_inner()
    }
}

impl Objective for FitObjective<'_, '_> {
    type Data = ();

    fn value(&self, theta: &Theta, _: &()) -> OptResult<f64> {
        match self.solve(theta) {
            Ok(entry) => Ok(entry.loss),
            Err(err) if err.is_numerical() => self.reject(theta, err),
            Err(err) => self.record(Err(err)),
        }
    }

    fn check(&self, theta: &Theta, _: &()) -> OptResult<()> {
        Ok(self.problem.params().check(theta)?)
    }

    fn grad(&self, theta: &Theta, _: &()) -> OptResult<Grad> {
        if !self.is_rejected(theta) {
            match self.lambda_at(theta) {
                Ok(lambda) => {
                    let problem = self.problem;
                    let loss = |q: &Theta| -> OptResult<f64> { Ok(problem.loss_at_fixed(q, &lambda)?) };
                    return fd_gradient(&loss, theta);
                }
                Err(err) if err.is_numerical() => {
                    self.reject(theta, err)?;
                }
                Err(err) => return self.record(Err(err)),
            }
        }
        self.best_accepted()
            .map(|(cost, best)| rejected_step(cost, best.view(), theta.view()).1)
            .ok_or_else(|| OptError::NumericalInstability { text: "no accepted point to back off to".to_string() })
    }
}

/// Fit result in working units, before diagnostics.
#[derive(Debug, Clone)]
pub(crate) struct WorkingFit {
    pub params: Array1<f64>,
    pub lambda: Array1<f64>,
    pub converged: bool,
    pub status: String,
    pub iterations: usize,
    pub trace: Vec<FitTraceEntry>,
}

/// Fit on `working` (already normalized if requested) from `start`.
pub(crate) fn fit_working(
    working: &RefinementData, reg: &Regularization, hyper: Hyperparameters, start: Array1<f64>,
    opts: &FitOptions,
) -> RefineResult<WorkingFit> {
    let problem = RefinementProblem::new(working, reg, hyper, opts.inner.clone())?;
    problem.params().check(&start)?;
    let objective = FitObjective::new(&problem);

    if start.is_empty() {
        let entry = objective.solve(&start)?;
        let converged = entry.inner_converged();
        return Ok(WorkingFit {
            params: entry.params.clone(),
            lambda: entry.lambda.clone(),
            converged,
            status: "No parameters to optimize".to_string(),
            iterations: 0,
            trace: vec![entry],
        });
    }

    let result = minimize(&objective, start, &(), &opts.outer);
    let ctx = objective.into_parts();
    let (outer_converged, status, iterations) = match result {
        Ok(out) => (out.converged, out.status, out.iterations),
        Err(err) => match ctx.failure {
            Some(failure) if !failure.is_numerical() => return Err(failure),
            failure if ctx.trace.iter().all(|e| e.rejected.is_some()) => {
                return Err(failure.unwrap_or_else(|| err.into()));
            }
            _ => {
                log::warn!("parameter fit stopped early, returning the best evaluation: {err}");
                (false, err.to_string(), 0)
            }
        },
    };

    let best = ctx
        .trace
        .iter()
        .filter(|e| e.rejected.is_none() && e.loss.is_finite())
        .min_by(|a, b| a.loss.total_cmp(&b.loss))
        .cloned()
        .ok_or_else(|| RefineError::instability("no finite loss was evaluated"))?;
    let rejected = ctx.trace.iter().filter(|e| e.rejected.is_some()).count();
    if rejected > 0 {
        log::warn!("parameter fit rejected {rejected} trial point(s) after numerical failures");
    }
    Ok(WorkingFit {
        converged: outer_converged && best.inner_converged(),
        params: best.params,
        lambda: best.lambda,
        status,
        iterations,
        trace: ctx.trace,
    })
}

/// Fit the parameters at fixed `hyper`.
///
/// Parameters start from `start`, or from zero force-field parameters
/// followed by the reference forward-model coefficients.
///
/// # Errors
/// - [`RefineError::ParameterVectorMismatch`] for a wrong-length `start`.
/// - Callback and structural failures raised during the fit.
/// - Numerical failures at the starting point. Later numerical failures
///   reject their trial point; if the solver still stops on one, the best
///   evaluation is returned with `converged = false`.
pub fn fit(
    data: &RefinementData, reg: &Regularization, hyper: Hyperparameters, start: Option<&Array1<f64>>,
    opts: &FitOptions,
) -> RefineResult<FitOutcome> {
    let layout = ParameterLayout::new(data, &hyper);
    let start = start.cloned().unwrap_or_else(|| layout.default_start(data));
    let (working, mut warnings) = if opts.normalize_observables {
        normalize(data)
    } else {
        (data.clone(), Vec::new())
    };

    let run = fit_working(&working, reg, hyper, start, opts)?;
    let lambda = if run.lambda.is_empty() {
        run.lambda.clone()
    } else {
        to_physical_lambda(&working, &MultiplierLayout::new(&working), &run.lambda)
    };
    let mut diagnostics = evaluate(data, reg, hyper, &run.params, Some(&lambda), opts)?;
    if !run.converged {
        warnings.push(format!("parameter fit did not converge: {}", run.status));
    }
    warnings.append(&mut diagnostics.warnings);
    diagnostics.warnings = warnings;

    Ok(FitOutcome {
        hyper,
        params: run.params,
        lambda,
        converged: run.converged,
        status: run.status,
        iterations: run.iterations,
        diagnostics,
        trace: run.trace,
    })
}

/// Diagnostics at given parameters without re-solving the multipliers.
///
/// `lambda` is in physical units. Without it and with α finite the
/// multipliers are solved with `opts.inner`.
///
/// # Errors
/// - Layout mismatches and every evaluation failure.
pub fn evaluate(
    data: &RefinementData, reg: &Regularization, hyper: Hyperparameters, params: &Array1<f64>,
    lambda: Option<&Array1<f64>>, opts: &FitOptions,
) -> RefineResult<Diagnostics> {
    let problem = RefinementProblem::new(data, reg, hyper, opts.inner.clone())?;
    let mode = match lambda {
        Some(l) if hyper.refinement_enabled() => LambdaMode::Fixed(l),
        _ => LambdaMode::Solve { warm: None },
    };
    problem.diagnostics(params, mode)
}

/// Held-out scores of a fit on `split.train`.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitEvaluation {
    /// Trained observables on the held-out frames.
    pub validation: Diagnostics,
    /// Every observable on the test frames (all frames with
    /// `all_frames_test`), refined with the trained multipliers.
    pub test: Diagnostics,
    /// χ² of the new observables only.
    pub test_chi2: f64,
}

/// Score `params` and train-layout multipliers `lambda` on the held-out
/// views of `split`.
///
/// `lambda` is in the units of `split.train`; new observables get zero
/// multipliers.
///
/// # Errors
/// - [`RefineError::MultiplierDimMismatch`] if `lambda` does not follow the
///   train layout.
/// - Every evaluation failure of [`evaluate`].
pub fn evaluate_split(
    split: &SplitData, reg: &Regularization, hyper: Hyperparameters, params: &Array1<f64>,
    lambda: &Array1<f64>, opts: &FitOptions,
) -> RefineResult<SplitEvaluation> {
    let validation = evaluate(&split.validation, reg, hyper, params, Some(lambda), opts)?;
    let test_lambda = if lambda.is_empty() { lambda.clone() } else { split.embed_lambda(lambda)? };
    let test = evaluate(&split.test, reg, hyper, params, Some(&test_lambda), opts)?;
    let test_chi2 = test
        .ensembles
        .iter()
        .zip(split.test_selection())
        .map(|(ens, selection)| ens.metric.chi2_of(&selection))
        .sum();
    Ok(SplitEvaluation { validation, test, test_chi2 })
}
