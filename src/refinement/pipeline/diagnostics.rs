//! Per-run diagnostics bundle.
//!
//! [`RefinementProblem::diagnostics`] re-evaluates every ensemble at given
//! parameters and collects final weights, log-partitions, per-kind metrics,
//! multipliers, divergences, cycle terms and a cross-check of the dual loss
//! against its explicit form `½χ² + α Σ D_KL + β R_ff + γ R_fm`.
use crate::refinement::{
    core::metric::MetricReport,
    errors::RefineResult,
    pipeline::loss::{CycleTerm, EnsembleEval, InnerSolve, LambdaMode, RefinementProblem},
};
use ndarray::Array1;

/// Relative gap above which the explicit-loss check adds a warning.
pub const EXPLICIT_LOSS_RTOL: f64 = 1e-4;

/// Outcome of one ensemble.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleDiagnostics {
    pub name: String,
    /// Final weights (refined with α finite).
    pub weights: Array1<f64>,
    /// Weights after the force-field tilt only.
    pub prior_weights: Array1<f64>,
    /// Log-partition of the refinement tilt.
    pub log_z: Option<f64>,
    /// Log-partition of the force-field tilt.
    pub ff_log_z: Option<f64>,
    pub metric: MetricReport,
    pub lambda: Option<Array1<f64>>,
    pub inner: Option<InnerSolve>,
    /// `D_KL(ŵ‖P)`.
    pub d_kl: Option<f64>,
    /// `D_KL(P‖P₀)`.
    pub ff_d_kl: Option<f64>,
    /// `-T (lnZ_P + lnZ_ref)` for corrected ensembles.
    pub corrected_dg: Option<f64>,
}

/// Explicit form of the loss next to the dual one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExplicitLoss {
    pub value: f64,
    pub d_kl_total: f64,
    pub abs_difference: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    pub loss: f64,
    pub data_term: f64,
    pub reg_ff: f64,
    pub reg_fm: f64,
    pub params: Array1<f64>,
    /// Concatenated multipliers; empty with α = ∞.
    pub lambda: Array1<f64>,
    pub ensembles: Vec<EnsembleDiagnostics>,
    pub chi2_total: f64,
    pub cycles: Vec<CycleTerm>,
    /// Only with α finite.
    pub explicit: Option<ExplicitLoss>,
    pub warnings: Vec<String>,
}

impl Diagnostics {
    pub fn ensemble(&self, name: &str) -> Option<&EnsembleDiagnostics> {
        self.ensembles.iter().find(|e| e.name == name)
    }
}

impl RefinementProblem<'_> {
    /// Full diagnostics at `p` with multipliers from `mode`.
    ///
    /// # Errors
    /// - Every error of [`RefinementProblem::loss_components`].
    pub fn diagnostics(&self, p: &Array1<f64>, mode: LambdaMode<'_>) -> RefineResult<Diagnostics> {
        let evals = self.evaluate_ensembles(p, mode)?;
        let comps = self.components_from(p, &evals)?;
        let hyper = *self.hyper();
        let mut warnings = Vec::new();

        let ensembles: Vec<EnsembleDiagnostics> = self
            .data()
            .ensembles()
            .iter()
            .zip(evals.iter())
            .map(|(ens, ev)| {
                if let Some(inner) = ev.inner.as_ref().filter(|i| !i.converged) {
                    warnings.push(format!(
                        "multipliers of '{}' did not converge: {}",
                        ens.name(),
                        inner.status
                    ));
                }
                describe(ens.name(), ens.temperature(), ens.reference_log_z(), ev)
            })
            .collect();

        let chi2_total = evals.iter().map(|ev| ev.metric.chi2).sum::<f64>();
        let explicit = hyper.refinement_enabled().then(|| {
            let d_kl_total: f64 = evals.iter().filter_map(|ev| ev.divergence).sum();
            let mut value = 0.5 * chi2_total + hyper.alpha * d_kl_total;
            if hyper.ff_enabled() {
                value += hyper.beta * comps.reg_ff;
            }
            if hyper.fm_enabled() {
                value += hyper.gamma * comps.reg_fm;
            }
            ExplicitLoss { value, d_kl_total, abs_difference: (value - comps.total).abs() }
        });
        if let Some(check) = explicit {
            if check.abs_difference > EXPLICIT_LOSS_RTOL * comps.total.abs().max(1.0) {
                let text = format!(
                    "explicit loss {:.6e} differs from the dual loss {:.6e}",
                    check.value, comps.total
                );
                log::warn!("{text}");
                warnings.push(text);
            }
        }

        Ok(Diagnostics {
            loss: comps.total,
            data_term: comps.data_term,
            reg_ff: comps.reg_ff,
            reg_fm: comps.reg_fm,
            params: p.clone(),
            lambda: comps.lambda,
            ensembles,
            chi2_total,
            cycles: self.cycle_terms(&evals),
            explicit,
            warnings,
        })
    }
}

fn describe(name: &str, temperature: f64, stored: Option<f64>, ev: &EnsembleEval) -> EnsembleDiagnostics {
    EnsembleDiagnostics {
        name: name.to_string(),
        weights: ev.weights.clone(),
        prior_weights: ev.prior.clone(),
        log_z: ev.gamma.as_ref().map(|g| g.log_z),
        ff_log_z: ev.ff_log_z,
        metric: ev.metric.clone(),
        lambda: ev.gamma.as_ref().map(|_| ev.lambda.clone()),
        inner: ev.inner.clone(),
        d_kl: ev.divergence,
        ff_d_kl: ev.ff_divergence,
        corrected_dg: ev.ff_log_z.map(|z| -temperature * (z + stored.unwrap_or(0.0))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        optimization::minimizer::{MinimizerOptions, Tolerances},
        refinement::core::{
            context::{GlobalContext, RefinementData},
            ensemble::{CorrectionModel, Ensemble},
            hyperparams::Hyperparameters,
            reference::{ExpData, Reference},
            regularization::Regularization,
        },
    };
    use approx::assert_relative_eq;
    use ndarray::array;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - The explicit-loss cross-check at solved multipliers.
    // - The corrected free energy of a tilted ensemble.
    // -------------------------------------------------------------------------

    fn data() -> RefinementData {
        let r = Reference::Equality(ExpData::new("x", array![2.0], array![0.5]).unwrap());
        let ens = Ensemble::builder("a", array![0.2, 0.3, 0.5])
            .observable("x", array![[1.0], [2.0], [3.0]], r)
            .correction(CorrectionModel::Linear, array![[0.0], [1.0], [2.0]])
            .temperature(2.0)
            .build()
            .unwrap();
        RefinementData::new(GlobalContext::new().with_ff_names(["q"]), vec![ens]).unwrap()
    }

    #[test]
    // Purpose
    // -------
    // At solved multipliers the explicit and dual losses agree and no
    // warning is raised.
    //
    // Given
    // -----
    // - One corrected ensemble, α = 1, β = 0.5, γ = ∞, `q = 0.3`.
    //
    // Expect
    // ------
    // - `abs_difference < 1e-6`, no warnings, `chi2_total` equals the
    //   ensemble metric.
    fn explicit_loss_matches_dual_loss() {
        let data = data();
        let reg = Regularization::default();
        let hyper = Hyperparameters::new(1.0, 0.5, f64::INFINITY).unwrap();
        let opts = MinimizerOptions::with_tolerances(Tolerances::new(Some(1e-8), None, Some(500)).unwrap());
        let problem = RefinementProblem::new(&data, &reg, hyper, opts).unwrap();
        let diag = problem.diagnostics(&array![0.3], LambdaMode::Solve { warm: None }).unwrap();

        let check = diag.explicit.unwrap();
        assert!(check.abs_difference < 1e-6, "gap {}", check.abs_difference);
        assert!(diag.warnings.is_empty(), "{:?}", diag.warnings);
        assert_relative_eq!(diag.chi2_total, diag.ensembles[0].metric.chi2, max_relative = 1e-14);
        assert_eq!(diag.lambda.len(), 1);
    }

    #[test]
    // Purpose
    // -------
    // The corrected ΔG is `-T lnZ_P` of the force-field tilt.
    //
    // Given
    // -----
    // - `q = 0.3`, T = 2, features `[0, 1, 2]`, prior `[0.2, 0.3, 0.5]`.
    //
    // Expect
    // ------
    // - `lnZ_P = ln Σ w_i exp(-0.15 f_i)` and ΔG = `-2 lnZ_P`.
    fn corrected_free_energy_follows_log_partition() {
        let data = data();
        let reg = Regularization::default();
        let hyper = Hyperparameters::new(f64::INFINITY, 0.5, f64::INFINITY).unwrap();
        let problem = RefinementProblem::new(&data, &reg, hyper, MinimizerOptions::default()).unwrap();
        let diag = problem.diagnostics(&array![0.3], LambdaMode::Solve { warm: None }).unwrap();

        let log_z = (0.2 + 0.3 * (-0.15f64).exp() + 0.5 * (-0.3f64).exp()).ln();
        let ens = diag.ensemble("a").unwrap();
        assert_relative_eq!(ens.ff_log_z.unwrap(), log_z, max_relative = 1e-12);
        assert_relative_eq!(ens.corrected_dg.unwrap(), -2.0 * log_z, max_relative = 1e-12);
        assert!(diag.explicit.is_none());
    }
}
