//! Implicit differentiation of a fitted refinement with respect to its
//! hyperparameters.
//!
//! Purpose
//! -------
//! At a fitted `(p*, λ*)` for strengths `(α, β, γ)`, compute how the
//! optimum moves when the finite strengths change, and chain-rule a
//! downstream χ² through that motion. All derivatives are taken with
//! respect to `log10` strengths, the coordinates of the outer search.
//!
//! Key behaviors
//! -------------
//! - Multipliers: from `∇_λΓ = v + αλσ² - ⟨g⟩(p) = 0`,
//!   `dλ/dα = -H⁻¹ λσ²` and `dλ/dp = H⁻¹ J` with `H = ∇²_λΓ` and
//!   `J = ∂⟨g⟩/∂p`. Only multipliers not pinned at their sign boundary
//!   move; an ensemble whose multipliers are all pinned contributes zero
//!   and a warning.
//! - Parameters: the total Hessian is `∂²L/∂p²|λ + α Jᵀ dλ/dp`, and
//!   `dp/dlog10 h = -Hess⁻¹ (∂∇_pL/∂log10 h + α Jᵀ ∂λ/∂log10 h)`.
//! - Singular Hessians are solved with a pseudo-inverse and flagged.
//!
//! Conventions
//! -----------
//! - Columns of hyperparameter matrices follow
//!   [`Hyperparameters::free_indices`].
//! - Multipliers are those of the problem's own data (normalized units when
//!   the problem was built on a normalized copy).
use crate::{
    inference::hessian::solve_symmetric,
    optimization::{
        errors::OptResult,
        minimizer::{
            finite_diff::{compute_hessian, fd_gradient, fd_jacobian},
            Grad, Theta,
        },
        numerical_stability::PIN_TOL,
    },
    refinement::{
        core::hyperparams::HYPER_NAMES,
        errors::{RefineError, RefineResult},
        pipeline::loss::{LambdaMode, LossComponents, RefinementProblem},
    },
};
use ndarray::{concatenate, s, Array1, Array2, Axis};
use std::f64::consts::LN_10;

/// Motion of a fitted optimum under the finite strengths.
#[derive(Debug, Clone, PartialEq)]
pub struct Sensitivity {
    /// Indices into [`HYPER_NAMES`] of the differentiated strengths.
    pub free: Vec<usize>,
    /// `∂λ/∂log10 α` at fixed parameters; empty with α = ∞.
    pub dlambda_dlog_alpha: Array1<f64>,
    /// `dλ/dp`, shape `(n_lambda, n_params)`.
    pub dlambda_dp: Array2<f64>,
    /// `dp/dlog10 h`, shape `(n_params, free.len())`.
    pub dp_dlog_hyper: Array2<f64>,
    /// A Hessian was solved in the pseudo-inverse sense.
    pub singular: bool,
    pub warnings: Vec<String>,
}

impl Sensitivity {
    pub fn names(&self) -> Vec<&'static str> {
        self.free.iter().map(|&i| HYPER_NAMES[i]).collect()
    }

    /// Total `dλ/dlog10 h`, shape `(n_lambda, free.len())`.
    pub fn dlambda_dlog_hyper(&self) -> Array2<f64> {
        let mut total = self.dlambda_dp.dot(&self.dp_dlog_hyper);
        if let Some(col) = self.free.iter().position(|&i| i == 0) {
            let mut c = total.column_mut(col);
            c += &self.dlambda_dlog_alpha;
        }
        total
    }
}

/// χ² of a target view and its gradient in `log10` strengths.
#[derive(Debug, Clone, PartialEq)]
pub struct ChiSquareGradient {
    pub chi2: f64,
    pub gradient: Array1<f64>,
    pub sensitivity: Sensitivity,
}

/// Sensitivities of the optimum `(p, lambda)` of `problem`.
///
/// # Errors
/// - Layout mismatches of `p` or `lambda`.
/// - Evaluation failures during differencing.
pub fn sensitivity(problem: &RefinementProblem<'_>, p: &Array1<f64>, lambda: &Array1<f64>) -> RefineResult<Sensitivity> {
    problem.params().check(p)?;
    let hyper = *problem.hyper();
    let free = hyper.free_indices();
    let n_p = p.len();
    let n_l = problem.n_lambda();
    let mut warnings = Vec::new();
    let mut singular = false;

    let mut dlambda_dlog_alpha = Array1::zeros(n_l);
    let mut dlambda_dp = Array2::zeros((n_l, n_p));
    let mut m = Array2::zeros((n_p, n_l));
    if hyper.refinement_enabled() && n_l > 0 {
        let jac = if n_p > 0 {
            let averages = |q: &Theta| -> OptResult<Array1<f64>> { Ok(problem.averages_at_fixed(q, lambda)?) };
            fd_jacobian(&averages, p, n_l)?
        } else {
            Array2::zeros((n_l, 0))
        };
        m = jac.t().to_owned() * hyper.alpha;

        let curvature = problem.gamma_curvature(p, lambda)?;
        for (e, curv) in curvature.iter().enumerate() {
            let slot = problem.multipliers().ensemble(e);
            if slot.len == 0 {
                continue;
            }
            let local: Vec<usize> = (0..slot.len)
                .filter(|&j| !slot.bounds[j].is_pinned(lambda[slot.offset + j], PIN_TOL))
                .collect();
            if local.is_empty() {
                let text = format!("every multiplier of '{}' is pinned; its sensitivity is zero", slot.name);
                log::warn!("{text}");
                warnings.push(text);
                continue;
            }
            let global: Vec<usize> = local.iter().map(|j| slot.offset + j).collect();
            let h = curv.hessian.select(Axis(0), &local).select(Axis(1), &local);
            let mut rhs = Array2::zeros((local.len(), 1 + n_p));
            rhs.column_mut(0).assign(&curv.alpha_mixed.select(Axis(0), &local));
            rhs.slice_mut(s![.., 1..]).assign(&jac.select(Axis(0), &global));
            let solve = solve_symmetric(&h, &rhs)?;
            if solve.singular {
                singular = true;
                let text = format!("multiplier Hessian of '{}' is singular", slot.name);
                log::warn!("{text}");
                warnings.push(text);
            }
            for (k, &g) in global.iter().enumerate() {
                dlambda_dlog_alpha[g] = -solve.solution[[k, 0]] * hyper.alpha * LN_10;
                dlambda_dp.row_mut(g).assign(&solve.solution.slice(s![k, 1..]));
            }
        }
    }
    if !hyper.refinement_enabled() {
        dlambda_dlog_alpha = Array1::zeros(0);
    }

    let mut dp_dlog_hyper = Array2::zeros((n_p, free.len()));
    if n_p > 0 && !free.is_empty() {
        let grad_fixed = |q: &Theta| -> OptResult<Grad> {
            let loss = |r: &Theta| -> OptResult<f64> { Ok(problem.loss_at_fixed(r, lambda)?) };
            fd_gradient(&loss, q)
        };
        let mut hess = compute_hessian(&grad_fixed, p)?;
        if n_l > 0 {
            hess = hess + m.dot(&dlambda_dp);
        }

        let mut mixed = Array2::zeros((n_p, free.len()));
        for (col, &i) in free.iter().enumerate() {
            let column = match i {
                0 => component_gradient(problem, p, lambda, |c| c.data_term)? * LN_10
                    + m.dot(&dlambda_dlog_alpha),
                1 => ff_gradient(problem, p, lambda)? * (hyper.beta * LN_10),
                _ => fm_gradient(problem, p, lambda)? * (hyper.gamma * LN_10),
            };
            mixed.column_mut(col).assign(&column);
        }
        let solve = solve_symmetric(&hess, &mixed)?;
        if solve.singular {
            singular = true;
            let text = "parameter Hessian is singular".to_string();
            log::warn!("{text}");
            warnings.push(text);
        }
        dp_dlog_hyper = -solve.solution;
    }

    Ok(Sensitivity { free, dlambda_dlog_alpha, dlambda_dp, dp_dlog_hyper, singular, warnings })
}

fn component_gradient(
    problem: &RefinementProblem<'_>, p: &Array1<f64>, lambda: &Array1<f64>,
    pick: fn(&LossComponents) -> f64,
) -> RefineResult<Array1<f64>> {
    let f = |q: &Theta| -> OptResult<f64> {
        Ok(pick(&problem.loss_components(q, LambdaMode::Fixed(lambda))?))
    };
    Ok(fd_gradient(&f, p)?)
}

fn ff_gradient(problem: &RefinementProblem<'_>, p: &Array1<f64>, lambda: &Array1<f64>) -> RefineResult<Array1<f64>> {
    let (p_ff, _) = problem.params().split(p);
    match problem.regularization().ff.gradient(p_ff) {
        Some(g) => {
            let mut full = Array1::zeros(p.len());
            full.slice_mut(s![..p_ff.len()]).assign(&g);
            Ok(full)
        }
        None => component_gradient(problem, p, lambda, |c| c.reg_ff),
    }
}

fn fm_gradient(problem: &RefinementProblem<'_>, p: &Array1<f64>, lambda: &Array1<f64>) -> RefineResult<Array1<f64>> {
    let (p_ff, p_fm) = problem.params().split(p);
    let analytic = problem
        .data()
        .context()
        .forward_coefficients
        .as_ref()
        .and_then(|p0| problem.regularization().fm.gradient(p_fm, p0.view()));
    match analytic {
        Some(g) => {
            let mut full = Array1::zeros(p.len());
            full.slice_mut(s![p_ff.len()..]).assign(&g);
            Ok(full)
        }
        None => component_gradient(problem, p, lambda, |c| c.reg_fm),
    }
}

/// χ² of `target` at `(p, lambda)` and its gradient in `log10` strengths.
///
/// `target` maps parameters and multipliers of `problem` to a χ²; it may
/// evaluate another view of the data (validation, test) as long as it
/// accepts the same vector layouts.
///
/// # Errors
/// - Errors of [`sensitivity`] and of `target`.
pub fn chi2_gradient<F>(
    problem: &RefinementProblem<'_>, p: &Array1<f64>, lambda: &Array1<f64>, target: F,
) -> RefineResult<ChiSquareGradient>
where
    F: Fn(&Array1<f64>, &Array1<f64>) -> RefineResult<f64>,
{
    let sensitivity = sensitivity(problem, p, lambda)?;
    let chi2 = target(p, lambda)?;
    let n_p = p.len();

    let z = concatenate(Axis(0), &[p.view(), lambda.view()])
        .map_err(|e| RefineError::instability(e.to_string()))?;
    let split_eval = |z: &Theta| -> OptResult<f64> {
        let q = z.slice(s![..n_p]).to_owned();
        let l = z.slice(s![n_p..]).to_owned();
        Ok(target(&q, &l)?)
    };
    let dz = fd_gradient(&split_eval, &z)?;
    let dchi_dp = dz.slice(s![..n_p]).to_owned();
    let dchi_dl = dz.slice(s![n_p..]).to_owned();

    let through_p = &dchi_dp + &dchi_dl.dot(&sensitivity.dlambda_dp);
    let mut gradient = through_p.dot(&sensitivity.dp_dlog_hyper);
    if let Some(col) = sensitivity.free.iter().position(|&i| i == 0) {
        gradient[col] += dchi_dl.dot(&sensitivity.dlambda_dlog_alpha);
    }
    Ok(ChiSquareGradient { chi2, gradient, sensitivity })
}
