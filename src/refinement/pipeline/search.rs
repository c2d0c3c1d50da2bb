//! Cross-validated hyperparameter search.
//!
//! Purpose
//! -------
//! Tune the finite strengths among `(α, β, γ)` by minimizing a held-out χ²
//! averaged over several random splits. Each trial point:
//!
//! 1. fits the parameters on the train view of every split,
//! 2. scores the chosen [`ChiSquareTarget`] and differentiates it in
//!    `log10` strengths through the fitted optimum,
//! 3. averages χ² and gradient over the splits once every split finished.
//!
//! A bounded L-BFGS then moves the `log10` strengths.
//!
//! Key behaviors
//! -------------
//! - The data is normalized once, with prior-weighted statistics of the
//!   full dataset, and split once per seed before the search; every trial
//!   reuses the same splits. Traced multipliers are therefore in units of
//!   the full-data normalization, not of each train view. χ² and the
//!   searched strengths do not depend on this choice.
//! - Splits run in parallel with `rayon`, optionally inside a dedicated pool
//!   of `threads` workers. Workers share only read-only data.
//! - The returned strengths are the traced trial with the smallest averaged
//!   χ²; a solver failure after at least one trial returns that trial with
//!   `converged = false`.
//! - A split whose fit or χ² fails numerically is kept in the trial with
//!   [`SplitTrial::failure`] set and left out of the averages. A trial in
//!   which every split failed is rejected: it is traced with
//!   [`SearchTraceEntry::rejected`] and the solver sees a finite wall above
//!   the best χ² (see [`rejected_step`]). Only a rejected starting point
//!   ends the search.
//!
//! Invariants & assumptions
//! ------------------------
//! - Searched strengths are finite and strictly positive; infinite ones stay
//!   disabled throughout.
//! - User callables must be safe to call concurrently.
use crate::{
    optimization::{
        errors::{OptError, OptResult},
        minimizer::{minimize_bounded, Bounds, Grad, MinimizerOptions, Objective, Theta, Tolerances},
        numerical_stability::rejected_step,
    },
    refinement::{
        core::{
            context::RefinementData,
            hyperparams::{Hyperparameters, HYPER_NAMES},
            layout::ParameterLayout,
            normalization::normalize,
            regularization::Regularization,
        },
        errors::{RefineError, RefineResult},
        pipeline::{
            fit::{fit, fit_working, FitOptions, FitOutcome},
            hypergradient::{chi2_gradient, ChiSquareGradient},
            loss::RefinementProblem,
            split::{split, SplitData, SplitOptions},
        },
    },
};
use ndarray::Array1;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::{cell::RefCell, str::FromStr};

/// Default `log10` box of every searched strength.
pub const DEFAULT_LOG10_BOUNDS: (f64, f64) = (-6.0, 6.0);

/// Which χ² the search minimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChiSquareTarget {
    /// Trained observables on trained frames.
    Training,
    /// Trained observables on held-out frames.
    #[default]
    Validation,
    /// New observables on the test frames.
    Test,
}

impl FromStr for ChiSquareTarget {
    type Err = RefineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "training" | "train" => Ok(ChiSquareTarget::Training),
            "validation" | "valid" => Ok(ChiSquareTarget::Validation),
            "test" => Ok(ChiSquareTarget::Test),
            other => Err(RefineError::UnknownTarget { name: other.to_string() }),
        }
    }
}

/// Settings of [`search`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub seeds: Vec<u64>,
    pub target: ChiSquareTarget,
    /// Split settings; the seed is replaced by each entry of `seeds`.
    pub split: SplitOptions,
    pub fit: FitOptions,
    /// Solver over the `log10` strengths.
    pub outer: MinimizerOptions,
    /// `log10` box per searched strength, in `free_indices` order.
    pub log10_bounds: Option<Vec<(f64, f64)>>,
    /// Worker count; the global `rayon` pool when `None`.
    pub threads: Option<usize>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        let tols = Tolerances { tol_grad: Some(0.5), tol_cost: Some(0.05), max_iter: Some(20) };
        Self {
            seeds: (0..4).collect(),
            target: ChiSquareTarget::default(),
            split: SplitOptions::default(),
            fit: FitOptions::default(),
            outer: MinimizerOptions::with_tolerances(tols),
            log10_bounds: None,
            threads: None,
        }
    }
}

/// Result of one split at one trial point.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitTrial {
    pub seed: u64,
    /// `NaN` for a failed split.
    pub chi2: f64,
    pub gradient: Array1<f64>,
    pub fit_converged: bool,
    pub warnings: Vec<String>,
    /// Numerical failure of this split, which is then left out of the
    /// trial averages.
    pub failure: Option<String>,
}

impl SplitTrial {
    fn failed(seed: u64, dim: usize, reason: String) -> Self {
        Self {
            seed,
            chi2: f64::NAN,
            gradient: Array1::zeros(dim),
            fit_converged: false,
            warnings: Vec::new(),
            failure: Some(reason),
        }
    }
}

/// One trial point of the search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchTraceEntry {
    pub log10_hyper: Array1<f64>,
    pub hyper: Hyperparameters,
    /// Mean over the splits that did not fail; `+∞` for a rejected trial.
    pub chi2: f64,
    /// Mean over the splits that did not fail, in `log10` strengths.
    pub gradient: Array1<f64>,
    pub splits: Vec<SplitTrial>,
    /// Why the trial was rejected (every split failed numerically).
    pub rejected: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub hyper: Hyperparameters,
    pub log10_hyper: Array1<f64>,
    /// Names of the searched strengths, in `log10_hyper` order.
    pub names: Vec<&'static str>,
    pub chi2: f64,
    pub converged: bool,
    pub status: String,
    pub iterations: usize,
    pub trace: Vec<SearchTraceEntry>,
    /// Normalization warnings raised before the search.
    pub warnings: Vec<String>,
}

/// Read-only state shared by every trial.
struct SearchRun<'a> {
    reg: &'a Regularization,
    start: Hyperparameters,
    opts: &'a SearchOptions,
    splits: Vec<(u64, SplitData)>,
    pool: Option<ThreadPool>,
}

impl SearchRun<'_> {
    fn trial(&self, x: &Array1<f64>) -> RefineResult<SearchTraceEntry> {
        let hyper = self.start.with_log10_free(&x.to_vec())?;
        let work = || {
            self.splits
                .par_iter()
                .map(|(seed, data)| split_trial(*seed, data, self.reg, hyper, self.opts))
                .collect::<Vec<_>>()
        };
        let results = match &self.pool {
            Some(pool) => pool.install(work),
            None => work(),
        };

        let mut splits = Vec::with_capacity(results.len());
        for ((seed, _), result) in self.splits.iter().zip(results) {
            match result {
                Ok(trial) => splits.push(trial),
                Err(err) if err.is_numerical() => {
                    log::warn!("split {seed} failed at log10 {x}: {err}");
                    splits.push(SplitTrial::failed(*seed, x.len(), err.to_string()));
                }
                Err(err) => return Err(err),
            }
        }

        let done: Vec<&SplitTrial> = splits.iter().filter(|s| s.failure.is_none()).collect();
        if done.is_empty() {
            return Err(RefineError::instability(format!("every split failed at log10 {x}")));
        }
        let n = done.len() as f64;
        let chi2 = done.iter().map(|s| s.chi2).sum::<f64>() / n;
        let gradient = done
            .iter()
            .fold(Array1::zeros(x.len()), |acc: Array1<f64>, s| acc + &s.gradient)
            / n;
        log::debug!("search trial at log10 {x} → χ² = {chi2:.6e}, gradient {gradient}");
        Ok(SearchTraceEntry { log10_hyper: x.clone(), hyper, chi2, gradient, splits, rejected: None })
    }
}

/// Fit one split and differentiate its target χ².
fn split_trial(
    seed: u64, data: &SplitData, reg: &Regularization, hyper: Hyperparameters, opts: &SearchOptions,
) -> RefineResult<SplitTrial> {
    let train = &data.train;
    let start = ParameterLayout::new(train, &hyper).default_start(train);
    let run = fit_working(train, reg, hyper, start, &opts.fit)?;
    let problem = RefinementProblem::new(train, reg, hyper, opts.fit.inner.clone())?;

    let scored: ChiSquareGradient = match opts.target {
        ChiSquareTarget::Training => {
            chi2_gradient(&problem, &run.params, &run.lambda, |q, l| problem.chi2_at(q, l, None))?
        }
        ChiSquareTarget::Validation => {
            let view = RefinementProblem::new(&data.validation, reg, hyper, opts.fit.inner.clone())?;
            chi2_gradient(&problem, &run.params, &run.lambda, |q, l| view.chi2_at(q, l, None))?
        }
        ChiSquareTarget::Test => {
            let view = RefinementProblem::new(&data.test, reg, hyper, opts.fit.inner.clone())?;
            let selection = data.test_selection();
            chi2_gradient(&problem, &run.params, &run.lambda, |q, l| {
                let embedded = if l.is_empty() { l.clone() } else { data.embed_lambda(l)? };
                view.chi2_at(q, &embedded, Some(selection.as_slice()))
            })?
        }
    };
    let mut warnings = scored.sensitivity.warnings;
    if !run.converged {
        warnings.push(format!("fit on split {seed} did not converge: {}", run.status));
    }
    Ok(SplitTrial {
        seed,
        chi2: scored.chi2,
        gradient: scored.gradient,
        fit_converged: run.converged,
        warnings,
        failure: None,
    })
}

#[derive(Debug, Default)]
struct SearchContext {
    trace: Vec<SearchTraceEntry>,
    failure: Option<RefineError>,
}

struct SearchObjective<'r, 'a> {
    run: &'r SearchRun<'a>,
    ctx: RefCell<SearchContext>,
}

impl SearchObjective<'_, '_> {
    fn entry(&self, x: &Theta) -> OptResult<SearchTraceEntry> {
        if let Some(hit) = self.ctx.borrow().trace.iter().rev().find(|e| &e.log10_hyper == x) {
            return Ok(hit.clone());
        }
        let hyper = self.run.start.with_log10_free(&x.to_vec()).map_err(|e| self.fail(e))?;
        match self.run.trial(x) {
            Ok(entry) => {
                self.ctx.borrow_mut().trace.push(entry.clone());
                Ok(entry)
            }
            Err(err) if err.is_numerical() => {
                log::warn!("search rejected the trial at log10 {x}: {err}");
                let entry = SearchTraceEntry {
                    log10_hyper: x.clone(),
                    hyper,
                    chi2: f64::INFINITY,
                    gradient: Array1::zeros(x.len()),
                    splits: Vec::new(),
                    rejected: Some(err.to_string()),
                };
                self.ctx.borrow_mut().trace.push(entry.clone());
                Ok(entry)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Keep the first failure for the caller and hand it to the solver.
    fn fail(&self, err: RefineError) -> OptError {
        let mut ctx = self.ctx.borrow_mut();
        if ctx.failure.is_none() {
            ctx.failure = Some(err.clone());
        }
        err.into()
    }

    fn best_accepted(&self) -> Option<(f64, Array1<f64>)> {
        self.ctx
            .borrow()
            .trace
            .iter()
            .filter(|e| e.rejected.is_none() && e.chi2.is_finite())
            .min_by(|a, b| a.chi2.total_cmp(&b.chi2))
            .map(|e| (e.chi2, e.log10_hyper.clone()))
    }
}

impl Objective for SearchObjective<'_, '_> {
    type Data = ();

    fn value(&self, theta: &Theta, _: &()) -> OptResult<f64> {
        let entry = self.entry(theta)?;
        match &entry.rejected {
            None => Ok(entry.chi2),
            Some(reason) => match self.best_accepted() {
                Some((chi2, best)) => Ok(rejected_step(chi2, best.view(), theta.view()).0),
                None => Err(self.fail(RefineError::instability(reason.clone()))),
            },
        }
    }

    fn check(&self, theta: &Theta, _: &()) -> OptResult<()> {
        let expected = self.run.start.free_indices().len();
        if theta.len() != expected {
            return Err(RefineError::ParameterDimMismatch {
                what: "log10 hyperparameters".to_string(),
                expected,
                found: theta.len(),
            }
            .into());
        }
        Ok(())
    }

    fn grad(&self, theta: &Theta, _: &()) -> OptResult<Grad> {
        let entry = self.entry(theta)?;
        match &entry.rejected {
            None => Ok(entry.gradient),
            Some(reason) => match self.best_accepted() {
                Some((chi2, best)) => Ok(rejected_step(chi2, best.view(), theta.view()).1),
                None => Err(self.fail(RefineError::instability(reason.clone()))),
            },
        }
    }
}

fn validate_start(start: &Hyperparameters) -> RefineResult<Vec<usize>> {
    let free = start.free_indices();
    if free.is_empty() {
        return Err(RefineError::InvalidHyperparameter {
            name: "alpha",
            value: start.alpha,
            reason: "at least one strength must be finite to search",
        });
    }
    let values = start.as_array();
    for &i in &free {
        if values[i] <= 0.0 {
            return Err(RefineError::InvalidHyperparameter {
                name: HYPER_NAMES[i],
                value: values[i],
                reason: "searched strengths must be strictly positive",
            });
        }
    }
    Ok(free)
}

fn search_bounds(n: usize, opts: &SearchOptions) -> RefineResult<Bounds> {
    let pairs = match &opts.log10_bounds {
        Some(pairs) if pairs.len() != n => {
            return Err(RefineError::ParameterDimMismatch {
                what: "log10 bounds".to_string(),
                expected: n,
                found: pairs.len(),
            });
        }
        Some(pairs) => pairs.clone(),
        None => vec![DEFAULT_LOG10_BOUNDS; n],
    };
    Ok(Bounds::from_pairs(&pairs)?)
}

/// Search the finite strengths of `start`.
///
/// # Errors
/// - [`RefineError::NoSeeds`] for an empty seed list.
/// - [`RefineError::InvalidHyperparameter`] when nothing can be searched or
///   a searched strength is not strictly positive.
/// - Split errors for every seed, raised before the search starts.
/// - Structural and callback errors from the trials.
/// - A numerical failure of every split at the starting point. Later
///   failures reject their trial; if the solver still stops on one, the
///   best trial is returned with `converged = false`.
pub fn search(
    data: &RefinementData, reg: &Regularization, start: Hyperparameters, opts: &SearchOptions,
) -> RefineResult<SearchOutcome> {
    if opts.seeds.is_empty() {
        return Err(RefineError::NoSeeds);
    }
    let free = validate_start(&start)?;
    opts.split.validate()?;
    let bounds = search_bounds(free.len(), opts)?;

    let (working, warnings) = if opts.fit.normalize_observables {
        normalize(data)
    } else {
        (data.clone(), Vec::new())
    };
    let splits = opts
        .seeds
        .iter()
        .map(|&seed| Ok((seed, split(&working, &opts.split.clone().with_seed(seed))?)))
        .collect::<RefineResult<Vec<_>>>()?;
    let pool = match opts.threads {
        Some(n) => Some(
            ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| RefineError::callback("worker pool", e.into()))?,
        ),
        None => None,
    };

    let run = SearchRun { reg, start, opts, splits, pool };
    run_search(&run, &free, &bounds, warnings)
}

/// Drive the outer solver over prepared splits.
fn run_search(
    run: &SearchRun<'_>, free: &[usize], bounds: &Bounds, warnings: Vec<String>,
) -> RefineResult<SearchOutcome> {
    let objective = SearchObjective { run, ctx: RefCell::new(SearchContext::default()) };
    let x0 = Array1::from(run.start.log10_free());
    let result = minimize_bounded(&objective, x0, &(), bounds, &run.opts.outer);
    let ctx = objective.ctx.into_inner();

    let (converged, status, iterations) = match result {
        Ok(out) => (out.converged, out.status, out.iterations),
        Err(err) => match ctx.failure {
            Some(failure) if !failure.is_numerical() => return Err(failure),
            failure if ctx.trace.iter().all(|e| e.rejected.is_some()) => {
                return Err(failure.unwrap_or_else(|| err.into()));
            }
            _ => {
                log::warn!("hyperparameter search stopped early, returning the best trial: {err}");
                (false, err.to_string(), 0)
            }
        },
    };

    let best = ctx
        .trace
        .iter()
        .filter(|e| e.rejected.is_none() && e.chi2.is_finite())
        .min_by(|a, b| a.chi2.total_cmp(&b.chi2))
        .cloned()
        .ok_or_else(|| RefineError::instability("no finite χ² was evaluated"))?;
    Ok(SearchOutcome {
        hyper: best.hyper,
        log10_hyper: best.log10_hyper,
        names: free.iter().map(|&i| HYPER_NAMES[i]).collect(),
        chi2: best.chi2,
        converged,
        status,
        iterations,
        trace: ctx.trace,
        warnings,
    })
}

/// Search, then refit on the full data at the tuned strengths.
///
/// # Errors
/// - Errors of [`search`] and [`fit`].
pub fn refine_with_search(
    data: &RefinementData, reg: &Regularization, start: Hyperparameters, opts: &SearchOptions,
) -> RefineResult<(SearchOutcome, FitOutcome)> {
    let outcome = search(data, reg, start, opts)?;
    let final_fit = fit(data, reg, outcome.hyper, None, &opts.fit)?;
    Ok((outcome, final_fit))
}
