//! Combined loss over all ensembles.
//!
//! Purpose
//! -------
//! Assemble the scalar objective of the parameter fit. For every ensemble,
//! at parameters `p = (p_ff, p_fm)`:
//!
//! 1. With β finite and a correction model, tilt the prior weights by
//!    `c(p_ff) / T` (log-partition `lnZ_P`); otherwise keep them.
//! 2. With γ finite and a forward model, recompute the observables from
//!    `p_fm`; otherwise use the stored ones. Two-sided kinds are widened.
//! 3. With α finite, either solve the dual Γ (warm-started) or evaluate it
//!    at given multipliers, and add `-α Γ`. With α = ∞ add `½ χ²` of the
//!    step-1 weights, plus `½ χ²` of every alchemical cycle.
//!
//! Then add `β R_ff` and `γ R_fm` for the finite strengths.
//!
//! Key behaviors
//! -------------
//! - [`RefinementProblem::loss_components`] is the fast path used by the
//!   optimizers and by the sensitivity analysis.
//! - [`RefinementProblem::diagnostics`] is the slow path behind `fit` and
//!   `evaluate`, see [`super::diagnostics`].
//! - The problem borrows the data; every call works on fresh arrays.
//!
//! Invariants & assumptions
//! ------------------------
//! - Multiplier vectors follow [`MultiplierLayout`] and parameter vectors
//!   follow [`ParameterLayout`]; both are checked at every entry point.
use crate::{
    optimization::minimizer::MinimizerOptions,
    refinement::{
        core::{
            context::{RefinementData, CYCLE_LEGS},
            ensemble::{Ensemble, ObservableSelection},
            gamma::{solve_gamma, GammaEval, GammaProblem},
            hyperparams::Hyperparameters,
            layout::{MultiplierLayout, ParameterLayout},
            metric::{compute_chi2, MetricReport},
            reference::ExpandedColumns,
            regularization::Regularization,
            reweight::{reweight, tilt_divergence},
        },
        errors::{RefineError, RefineResult},
    },
};
use ndarray::{concatenate, s, Array1, Array2, ArrayView1, Axis};
use std::collections::BTreeMap;

/// How multipliers are obtained during an evaluation.
#[derive(Debug, Clone, Copy)]
pub enum LambdaMode<'l> {
    /// Minimize Γ per ensemble, optionally warm-started.
    Solve { warm: Option<&'l Array1<f64>> },
    /// Evaluate Γ at the given (already optimal) multipliers.
    Fixed(&'l Array1<f64>),
}

/// Status of one inner Γ minimization.
#[derive(Debug, Clone, PartialEq)]
pub struct InnerSolve {
    pub converged: bool,
    pub status: String,
    pub iterations: usize,
    pub grad_norm: f64,
}

/// Scalar loss split into its channels.
#[derive(Debug, Clone, PartialEq)]
pub struct LossComponents {
    /// `-α Σ Γ`, or `½ χ²` (+ cycles) with α = ∞.
    pub data_term: f64,
    /// Unscaled force-field penalty (0 when β = ∞).
    pub reg_ff: f64,
    /// Unscaled forward-model penalty (0 when γ = ∞).
    pub reg_fm: f64,
    pub total: f64,
    /// Multipliers used (solved or given); empty with α = ∞.
    pub lambda: Array1<f64>,
    /// One entry per ensemble in solve mode.
    pub inner: Vec<Option<InnerSolve>>,
}

/// Curvature of Γ for one ensemble at fixed multipliers.
#[derive(Debug, Clone, PartialEq)]
pub struct GammaCurvature {
    pub hessian: Array2<f64>,
    /// `∂²Γ/∂λ∂α = λ σ²`.
    pub alpha_mixed: Array1<f64>,
}

/// Everything computed for one ensemble during an evaluation.
#[derive(Debug, Clone)]
pub(crate) struct EnsembleEval {
    /// Weights after the force-field tilt (the prior of Γ).
    pub prior: Array1<f64>,
    /// `lnZ_P` of the force-field tilt, `None` without correction.
    pub ff_log_z: Option<f64>,
    /// `D_KL(P‖P₀)` of the force-field tilt.
    pub ff_divergence: Option<f64>,
    /// Γ at the multipliers, with α finite.
    pub gamma: Option<GammaEval>,
    /// `D_KL(ŵ‖P)` of the refinement tilt.
    pub divergence: Option<f64>,
    pub lambda: Array1<f64>,
    pub inner: Option<InnerSolve>,
    /// Final weights (refined with α finite, otherwise the prior).
    pub weights: Array1<f64>,
    pub metric: MetricReport,
}

/// Cycle ΔΔG from per-leg log-partitions.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleTerm {
    pub name: String,
    pub ddg: f64,
    pub exp_ddg: f64,
    pub chi2: f64,
}

/// The combined loss over a dataset at fixed strengths.
#[derive(Debug, Clone)]
pub struct RefinementProblem<'a> {
    data: &'a RefinementData,
    reg: &'a Regularization,
    hyper: Hyperparameters,
    multipliers: MultiplierLayout,
    params: ParameterLayout,
    columns: Vec<ExpandedColumns>,
    inner: MinimizerOptions,
}

impl<'a> RefinementProblem<'a> {
    /// # Errors
    /// - [`RefineError::ParameterDimMismatch`] if the force-field penalty's
    ///   multiplicities do not match the parameter names.
    pub fn new(
        data: &'a RefinementData, reg: &'a Regularization, hyper: Hyperparameters,
        inner: MinimizerOptions,
    ) -> RefineResult<Self> {
        let params = ParameterLayout::new(data, &hyper);
        if hyper.ff_enabled() {
            reg.ff.validate(params.n_ff)?;
        }
        let multipliers = MultiplierLayout::new(data);
        let columns = data
            .ensembles()
            .iter()
            .map(|ens| {
                let mut cols = ExpandedColumns::default();
                for kind in ens.kinds() {
                    cols.extend(kind.reference.expand());
                }
                cols
            })
            .collect();
        Ok(Self { data, reg, hyper, multipliers, params, columns, inner })
    }

    pub fn data(&self) -> &'a RefinementData {
        self.data
    }

    pub fn regularization(&self) -> &'a Regularization {
        self.reg
    }

    pub fn hyper(&self) -> &Hyperparameters {
        &self.hyper
    }

    pub fn multipliers(&self) -> &MultiplierLayout {
        &self.multipliers
    }

    pub fn params(&self) -> &ParameterLayout {
        &self.params
    }

    pub fn inner_options(&self) -> &MinimizerOptions {
        &self.inner
    }

    /// Multiplier columns of ensemble `e`.
    pub fn columns(&self, e: usize) -> &ExpandedColumns {
        &self.columns[e]
    }

    /// Length of the multiplier vector this problem works with (0 when α = ∞).
    pub fn n_lambda(&self) -> usize {
        if self.hyper.refinement_enabled() {
            self.multipliers.len()
        } else {
            0
        }
    }

    fn check_lambda(&self, lambda: &Array1<f64>) -> RefineResult<()> {
        if lambda.len() != self.n_lambda() {
            return Err(RefineError::MultiplierDimMismatch {
                expected: self.n_lambda(),
                found: lambda.len(),
            });
        }
        Ok(())
    }

    /// Prior weights, observables and widened observables of ensemble `e`.
    fn ensemble_inputs(
        &self, ens: &Ensemble, p_ff: ArrayView1<f64>, p_fm: ArrayView1<f64>,
    ) -> RefineResult<(Array1<f64>, Option<(f64, f64)>, Vec<Array2<f64>>, Array2<f64>)> {
        let correction =
            if self.hyper.ff_enabled() { ens.correction_values(p_ff)? } else { None };
        let (prior, ff) = match correction {
            Some(c) => {
                let exponent = c / ens.temperature();
                let tilted = reweight(ens.weights().view(), exponent.view())?;
                let d_kl = tilt_divergence(tilted.weights.view(), exponent.view(), tilted.log_z);
                (tilted.weights, Some((tilted.log_z, d_kl)))
            }
            None => (ens.weights().clone(), None),
        };

        let fm = self.hyper.fm_enabled().then_some(p_fm);
        let kind_g = ens.observables(fm)?;
        let wide: Vec<Array2<f64>> = ens
            .kinds()
            .iter()
            .zip(kind_g.iter())
            .map(|(k, g)| k.reference.expand_values(g.view()))
            .collect();
        let g = if wide.is_empty() {
            Array2::zeros((ens.n_frames(), 0))
        } else {
            let views: Vec<_> = wide.iter().map(|a| a.view()).collect();
            concatenate(Axis(1), &views)
                .map_err(|e| RefineError::instability(format!("observables of '{}': {e}", ens.name())))?
        };
        Ok((prior, ff, kind_g, g))
    }

    /// Evaluate every ensemble at `p` under `mode`.
    pub(crate) fn evaluate_ensembles(
        &self, p: &Array1<f64>, mode: LambdaMode<'_>,
    ) -> RefineResult<Vec<EnsembleEval>> {
        self.params.check(p)?;
        match mode {
            LambdaMode::Fixed(l) => self.check_lambda(l)?,
            LambdaMode::Solve { warm: Some(l) } => self.check_lambda(l)?,
            LambdaMode::Solve { warm: None } => {}
        }
        let (p_ff, p_fm) = self.params.split(p);

        let mut out = Vec::with_capacity(self.data.ensembles().len());
        for (e, ens) in self.data.ensembles().iter().enumerate() {
            let (prior, ff, kind_g, g) = self.ensemble_inputs(ens, p_ff, p_fm)?;
            let (gamma, divergence, lambda, inner, weights) = if self.hyper.refinement_enabled() {
                let cols = &self.columns[e];
                let problem = GammaProblem::new(g.view(), cols, prior.view(), self.hyper.alpha)
                    .map_err(|err| with_ensemble(err, ens.name()))?;
                let (lambda, eval, inner) = match mode {
                    LambdaMode::Solve { warm } => {
                        let start = warm.map(|w| self.multipliers.slice(w, e));
                        let sol = solve_gamma(&problem, &cols.bounds, start, &self.inner)?;
                        let inner = InnerSolve {
                            converged: sol.converged,
                            status: sol.status,
                            iterations: sol.iterations,
                            grad_norm: sol.grad_norm,
                        };
                        (sol.lambda, sol.eval, Some(inner))
                    }
                    LambdaMode::Fixed(l) => {
                        let lambda = self.multipliers.slice(l, e).to_owned();
                        let eval = problem.evaluate(lambda.view())?;
                        (lambda, eval, None)
                    }
                };
                let divergence = problem.divergence(lambda.view(), &eval);
                let weights = eval.weights.clone();
                (Some(eval), Some(divergence), lambda, inner, weights)
            } else {
                (None, None, Array1::zeros(0), None, prior.clone())
            };

            let metric = compute_chi2(
                ens.kinds().iter().zip(kind_g.iter()).map(|(k, g)| (k.name.as_str(), &k.reference, g.view())),
                weights.view(),
            );
            out.push(EnsembleEval {
                prior,
                ff_log_z: ff.map(|(z, _)| z),
                ff_divergence: ff.map(|(_, d)| d),
                gamma,
                divergence,
                lambda,
                inner,
                weights,
                metric,
            });
        }
        Ok(out)
    }

    /// ΔΔG of every declared cycle from the per-ensemble force-field
    /// log-partitions.
    pub(crate) fn cycle_terms(&self, evals: &[EnsembleEval]) -> Vec<CycleTerm> {
        let log_z: BTreeMap<&str, f64> = self
            .data
            .ensembles()
            .iter()
            .zip(evals)
            .map(|(ens, ev)| {
                (ens.name(), ens.reference_log_z().unwrap_or(0.0) + ev.ff_log_z.unwrap_or(0.0))
            })
            .collect();
        self.data
            .context()
            .cycles
            .iter()
            .map(|cycle| {
                let leg = |suffix: &str| log_z.get(cycle.leg_name(suffix).as_str()).copied().unwrap_or(0.0);
                let [md, ms, ad, as_] = CYCLE_LEGS.map(leg);
                let ddg = cycle.temperature * ((ms - as_) - (md - ad));
                let chi2 = ((ddg - cycle.exp_ddg) / cycle.sigma).powi(2);
                CycleTerm { name: cycle.name.clone(), ddg, exp_ddg: cycle.exp_ddg, chi2 }
            })
            .collect()
    }

    /// Loss and its channels at `p`.
    ///
    /// # Errors
    /// - Layout mismatches, numerical instabilities and callback failures.
    pub fn loss_components(&self, p: &Array1<f64>, mode: LambdaMode<'_>) -> RefineResult<LossComponents> {
        let evals = self.evaluate_ensembles(p, mode)?;
        self.components_from(p, &evals)
    }

    pub(crate) fn components_from(
        &self, p: &Array1<f64>, evals: &[EnsembleEval],
    ) -> RefineResult<LossComponents> {
        let (p_ff, p_fm) = self.params.split(p);
        let alpha = self.hyper.alpha;

        let data_term = if self.hyper.refinement_enabled() {
            -alpha * evals.iter().filter_map(|ev| ev.gamma.as_ref()).map(|g| g.value).sum::<f64>()
        } else {
            let chi2: f64 = evals.iter().map(|ev| ev.metric.chi2).sum();
            let cycles: f64 = self.cycle_terms(evals).iter().map(|c| c.chi2).sum();
            0.5 * (chi2 + cycles)
        };

        let reg_ff = if !self.hyper.ff_enabled() {
            0.0
        } else if self.reg.ff.is_kl() {
            evals.iter().filter_map(|ev| ev.ff_divergence).sum()
        } else {
            self.reg.ff.penalty(p_ff)?.unwrap_or(0.0)
        };
        let reg_fm = match (&self.data.context().forward_coefficients, self.hyper.fm_enabled()) {
            (Some(p0), true) => self.reg.fm.penalty(p_fm, p0.view())?,
            _ => 0.0,
        };

        let mut total = data_term;
        if self.hyper.ff_enabled() {
            total += self.hyper.beta * reg_ff;
        }
        if self.hyper.fm_enabled() {
            total += self.hyper.gamma * reg_fm;
        }
        if !total.is_finite() {
            return Err(RefineError::instability("combined loss is not finite"));
        }

        let mut lambda = Array1::zeros(self.n_lambda());
        if self.hyper.refinement_enabled() {
            for (e, ev) in evals.iter().enumerate() {
                let slot = self.multipliers.ensemble(e);
                lambda.slice_mut(s![slot.range()]).assign(&ev.lambda);
            }
        }
        let inner = evals.iter().map(|ev| ev.inner.clone()).collect();
        Ok(LossComponents { data_term, reg_ff, reg_fm, total, lambda, inner })
    }

    /// Total loss at fixed multipliers (the envelope of the solved loss).
    pub fn loss_at_fixed(&self, p: &Array1<f64>, lambda: &Array1<f64>) -> RefineResult<f64> {
        Ok(self.loss_components(p, LambdaMode::Fixed(lambda))?.total)
    }

    /// Concatenated tilted averages `⟨g_j⟩` over all multiplier columns.
    pub fn averages_at_fixed(&self, p: &Array1<f64>, lambda: &Array1<f64>) -> RefineResult<Array1<f64>> {
        let evals = self.evaluate_ensembles(p, LambdaMode::Fixed(lambda))?;
        let parts: Vec<Array1<f64>> =
            evals.into_iter().filter_map(|ev| ev.gamma.map(|g| g.average)).collect();
        let views: Vec<_> = parts.iter().map(|a| a.view()).collect();
        if views.is_empty() {
            return Ok(Array1::zeros(0));
        }
        concatenate(Axis(0), &views).map_err(|e| RefineError::instability(e.to_string()))
    }

    /// Hessian of Γ and its α-mixed partial per ensemble, at fixed multipliers.
    ///
    /// Empty with α = ∞.
    pub fn gamma_curvature(&self, p: &Array1<f64>, lambda: &Array1<f64>) -> RefineResult<Vec<GammaCurvature>> {
        if !self.hyper.refinement_enabled() {
            return Ok(Vec::new());
        }
        self.params.check(p)?;
        self.check_lambda(lambda)?;
        let (p_ff, p_fm) = self.params.split(p);
        self.data
            .ensembles()
            .iter()
            .enumerate()
            .map(|(e, ens)| {
                let (prior, _, _, g) = self.ensemble_inputs(ens, p_ff, p_fm)?;
                let problem = GammaProblem::new(g.view(), &self.columns[e], prior.view(), self.hyper.alpha)?;
                let l = self.multipliers.slice(lambda, e);
                let eval = problem.evaluate(l)?;
                Ok(GammaCurvature { hessian: problem.hessian(&eval), alpha_mixed: problem.alpha_mixed(l) })
            })
            .collect()
    }

    /// χ² of the final weights at `(p, λ)`, optionally restricted to the
    /// selected observables of each ensemble.
    pub fn chi2_at(
        &self, p: &Array1<f64>, lambda: &Array1<f64>, subset: Option<&[ObservableSelection]>,
    ) -> RefineResult<f64> {
        let evals = self.evaluate_ensembles(p, LambdaMode::Fixed(lambda))?;
        Ok(match subset {
            Some(sel) => evals.iter().zip(sel).map(|(ev, s)| ev.metric.chi2_of(s)).sum(),
            None => evals.iter().map(|ev| ev.metric.chi2).sum(),
        })
    }
}

fn with_ensemble(err: RefineError, name: &str) -> RefineError {
    match err {
        RefineError::ObservableCountMismatch { kind, expected, found, .. } => {
            RefineError::ObservableCountMismatch { ensemble: name.to_string(), kind, expected, found }
        }
        RefineError::FrameCountMismatch { what, expected, found, .. } => {
            RefineError::FrameCountMismatch { ensemble: name.to_string(), what, expected, found }
        }
        other => other,
    }
}
