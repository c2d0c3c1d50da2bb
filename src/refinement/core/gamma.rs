//! The dual ("Gamma") objective of maximum-entropy ensemble refinement.
//!
//! Purpose
//! -------
//! For fixed observables `g` (frames × columns), experimental values `v`,
//! uncertainties `σ`, prior weights `w` and strength `α > 0`, evaluate
//!
//! ```text
//! Γ(λ) = λ·v + (α/2) Σ λ_j² σ_j² + ln Σ_i w_i exp(-g_i·λ)
//! ```
//!
//! and minimize it over the multipliers. The minimizer gives the tilted
//! ensemble closest (in relative entropy) to the prior that matches the
//! experiments within `α`-scaled uncertainty.
//!
//! Key behaviors
//! -------------
//! - [`GammaProblem::evaluate`] returns `Γ`, its analytic gradient
//!   `v + α λ σ² - ⟨g⟩_λ`, the tilted averages and weights.
//! - [`GammaProblem::hessian`] returns `Cov_λ(g) + α diag(σ²)`, which is
//!   positive definite, so `Γ` is strictly convex.
//! - [`solve_gamma`] runs a bounded L-BFGS over the sign constraints of the
//!   columns (one-sided kinds live on half-lines).
//!
//! Failure policy
//! --------------
//! - Numerical instabilities propagate as errors.
//! - Any other solver failure yields a [`GammaSolution`] at the best point
//!   visited (the start if none) with `converged = false` and the solver's
//!   message in `status`.
use crate::{
    optimization::{
        errors::{OptError, OptResult},
        minimizer::{
            minimize_bounded, Bounds, Cost, Grad, MinimizerOptions, Objective, Theta,
        },
    },
    refinement::{
        core::{
            reference::{ExpandedColumns, LambdaBound},
            reweight::{reweight, tilt_divergence},
        },
        errors::{RefineError, RefineResult},
    },
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::cell::RefCell;

/// Γ at one multiplier vector.
#[derive(Debug, Clone, PartialEq)]
pub struct GammaEval {
    pub value: f64,
    pub grad: Array1<f64>,
    /// Tilted averages `⟨g_j⟩_λ`.
    pub average: Array1<f64>,
    /// Tilted weights.
    pub weights: Array1<f64>,
    /// `ln Σ w exp(-g·λ)`.
    pub log_z: f64,
}

/// Data of one Γ minimization.
#[derive(Debug, Clone, Copy)]
pub struct GammaProblem<'a> {
    g: ArrayView2<'a, f64>,
    cols: &'a ExpandedColumns,
    weights: ArrayView1<'a, f64>,
    alpha: f64,
}

impl<'a> GammaProblem<'a> {
    /// # Errors
    /// - [`RefineError::ObservableCountMismatch`] if `g` has a different
    ///   column count than `cols`.
    /// - [`RefineError::FrameCountMismatch`] if `g` and `weights` disagree.
    /// - [`RefineError::InvalidHyperparameter`] unless `0 < α < ∞`.
    pub fn new(
        g: ArrayView2<'a, f64>, cols: &'a ExpandedColumns, weights: ArrayView1<'a, f64>, alpha: f64,
    ) -> RefineResult<Self> {
        if g.ncols() != cols.len() {
            return Err(RefineError::ObservableCountMismatch {
                ensemble: String::new(),
                kind: "gamma".to_string(),
                expected: cols.len(),
                found: g.ncols(),
            });
        }
        if g.nrows() != weights.len() {
            return Err(RefineError::FrameCountMismatch {
                ensemble: String::new(),
                what: "gamma observables".to_string(),
                expected: weights.len(),
                found: g.nrows(),
            });
        }
        if !(alpha.is_finite() && alpha > 0.0) {
            return Err(RefineError::InvalidHyperparameter {
                name: "alpha",
                value: alpha,
                reason: "the dual objective needs a finite positive strength",
            });
        }
        Ok(Self { g, cols, weights, alpha })
    }

    pub fn n_columns(&self) -> usize {
        self.cols.len()
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn columns(&self) -> &ExpandedColumns {
        self.cols
    }

    /// Γ, gradient and tilted averages at `lambda`.
    ///
    /// # Errors
    /// - [`RefineError::MultiplierDimMismatch`] for a wrong-length `lambda`.
    /// - [`RefineError::NumericalInstability`] if the tilt overflows.
    pub fn evaluate(&self, lambda: ArrayView1<f64>) -> RefineResult<GammaEval> {
        if lambda.len() != self.n_columns() {
            return Err(RefineError::MultiplierDimMismatch {
                expected: self.n_columns(),
                found: lambda.len(),
            });
        }
        let correction = self.g.dot(&lambda);
        let tilted = reweight(self.weights, correction.view())?;
        let average = tilted.weights.dot(&self.g);
        let s2 = self.cols.sigmas.mapv(|s| s * s);

        let penalty = 0.5 * self.alpha * (&lambda * &lambda).dot(&s2);
        let value = lambda.dot(&self.cols.values) + penalty + tilted.log_z;
        let grad = &self.cols.values + &(&lambda * &s2 * self.alpha) - &average;
        if !value.is_finite() {
            return Err(RefineError::instability("dual objective is not finite"));
        }
        Ok(GammaEval { value, grad, average, weights: tilted.weights, log_z: tilted.log_z })
    }

    /// `∇²Γ = Cov_λ(g) + α diag(σ²)` from an evaluation at `λ`.
    pub fn hessian(&self, eval: &GammaEval) -> Array2<f64> {
        let centered = &self.g - &eval.average;
        let weighted = &centered * &eval.weights.view().insert_axis(Axis(1));
        let mut h = centered.t().dot(&weighted);
        for (j, s) in self.cols.sigmas.iter().enumerate() {
            h[[j, j]] += self.alpha * s * s;
        }
        h
    }

    /// `∂²Γ/∂λ∂α = λ σ²`.
    pub fn alpha_mixed(&self, lambda: ArrayView1<f64>) -> Array1<f64> {
        &lambda * &self.cols.sigmas.mapv(|s| s * s)
    }

    /// `D_KL` of the tilted ensemble relative to the prior weights.
    pub fn divergence(&self, lambda: ArrayView1<f64>, eval: &GammaEval) -> f64 {
        let correction = self.g.dot(&lambda);
        tilt_divergence(eval.weights.view(), correction.view(), eval.log_z)
    }
}

/// Outcome of a Γ minimization.
#[derive(Debug, Clone, PartialEq)]
pub struct GammaSolution {
    pub lambda: Array1<f64>,
    pub eval: GammaEval,
    pub converged: bool,
    pub status: String,
    pub iterations: usize,
    /// Norm of the gradient projected onto the feasible directions.
    pub grad_norm: f64,
}

struct GammaObjective<'p, 'a> {
    problem: &'p GammaProblem<'a>,
    best: RefCell<Option<(Theta, Cost)>>,
}

impl Objective for GammaObjective<'_, '_> {
    type Data = ();

    fn value(&self, theta: &Theta, _: &()) -> OptResult<Cost> {
        let value = self.problem.evaluate(theta.view())?.value;
        let mut best = self.best.borrow_mut();
        if best.as_ref().map_or(true, |(_, b)| value < *b) {
            *best = Some((theta.clone(), value));
        }
        Ok(value)
    }

    fn check(&self, theta: &Theta, _: &()) -> OptResult<()> {
        if theta.len() != self.problem.n_columns() {
            return Err(OptError::from(RefineError::MultiplierDimMismatch {
                expected: self.problem.n_columns(),
                found: theta.len(),
            }));
        }
        Ok(())
    }

    fn grad(&self, theta: &Theta, _: &()) -> OptResult<Grad> {
        Ok(self.problem.evaluate(theta.view())?.grad)
    }
}

/// Box of the inner solve from the column signs.
pub fn lambda_bounds(bounds: &[LambdaBound]) -> RefineResult<Bounds> {
    let pairs: Vec<(f64, f64)> = bounds.iter().map(LambdaBound::interval).collect();
    Ok(Bounds::from_pairs(&pairs)?)
}

/// Minimize Γ under the sign constraints `bounds`, starting from `start`
/// (zero when `None`).
///
/// # Errors
/// - [`RefineError::NumericalInstability`] from any evaluation.
/// - [`RefineError::MultiplierDimMismatch`] for a wrong-length start or
///   bound list.
pub fn solve_gamma(
    problem: &GammaProblem<'_>, bounds: &[LambdaBound], start: Option<ArrayView1<f64>>,
    opts: &MinimizerOptions,
) -> RefineResult<GammaSolution> {
    let n = problem.n_columns();
    if bounds.len() != n {
        return Err(RefineError::MultiplierDimMismatch { expected: n, found: bounds.len() });
    }
    let start = match start {
        Some(s) if s.len() != n => {
            return Err(RefineError::MultiplierDimMismatch { expected: n, found: s.len() });
        }
        Some(s) => s.to_owned(),
        None => Array1::zeros(n),
    };
    let boxed = lambda_bounds(bounds)?;
    let start = boxed.clamp(&start);

    if n == 0 {
        let eval = problem.evaluate(start.view())?;
        return Ok(finish(&boxed, start, eval, true, "No multipliers".to_string(), 0));
    }

    let objective = GammaObjective { problem, best: RefCell::new(None) };
    match minimize_bounded(&objective, start.clone(), &(), &boxed, opts) {
        Ok(out) => {
            let lambda = out.theta_hat;
            let eval = problem.evaluate(lambda.view())?;
            Ok(finish(&boxed, lambda, eval, out.converged, out.status, out.iterations))
        }
        Err(err) if err.is_numerical() => Err(err.into()),
        Err(err @ OptError::ObjectiveFailed { .. }) => Err(err.into()),
        Err(err) => {
            log::warn!("dual solve failed, keeping the best multipliers visited: {err}");
            let lambda = objective.best.take().map_or(start, |(theta, _)| theta);
            let eval = problem.evaluate(lambda.view())?;
            Ok(finish(&boxed, lambda, eval, false, err.to_string(), 0))
        }
    }
}

fn finish(
    boxed: &Bounds, lambda: Array1<f64>, eval: GammaEval, converged: bool, status: String,
    iterations: usize,
) -> GammaSolution {
    let mut projected = eval.grad.clone();
    boxed.project_gradient(&lambda, &mut projected);
    let grad_norm = projected.dot(&projected).sqrt();
    GammaSolution { lambda, eval, converged, status, iterations, grad_norm }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        optimization::minimizer::{finite_diff::fd_gradient, Tolerances},
        refinement::core::reference::{ExpData, Reference},
    };
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::array;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - The analytic gradient and Hessian against finite differences.
    // - Stationarity at the solution of the three-frame scenario.
    // - Pinning of one-sided multipliers that would take the wrong sign.
    //
    // They intentionally DO NOT cover:
    // - Loss assembly over several ensembles (see `pipeline::loss`).
    // -------------------------------------------------------------------------

    fn tight() -> MinimizerOptions {
        MinimizerOptions::with_tolerances(Tolerances::new(Some(1e-8), None, Some(500)).unwrap())
    }

    fn cols(reference: &Reference) -> ExpandedColumns {
        reference.expand()
    }

    #[test]
    // Purpose
    // -------
    // The analytic gradient matches a finite-difference gradient of Γ.
    //
    // Given
    // -----
    // - Two equality columns on four frames, α = 0.7, λ = (0.3, -0.2).
    //
    // Expect
    // ------
    // - Agreement to 1e-6.
    fn gradient_matches_finite_differences() {
        let reference = Reference::Equality(
            ExpData::new("k", array![1.0, 0.5], array![0.4, 0.8]).unwrap(),
        );
        let c = cols(&reference);
        let g = array![[0.0, 1.0], [1.0, 0.0], [2.0, 1.0], [3.0, -1.0]];
        let w = array![0.1, 0.2, 0.3, 0.4];
        let problem = GammaProblem::new(g.view(), &c, w.view(), 0.7).unwrap();

        let lambda = array![0.3, -0.2];
        let eval = problem.evaluate(lambda.view()).unwrap();
        let f = |t: &Theta| -> OptResult<f64> { Ok(problem.evaluate(t.view())?.value) };
        let fd = fd_gradient(&f, &lambda).unwrap();
        assert_abs_diff_eq!(eval.grad[0], fd[0], epsilon = 1e-6);
        assert_abs_diff_eq!(eval.grad[1], fd[1], epsilon = 1e-6);
    }

    #[test]
    // Purpose
    // -------
    // The Hessian is the tilted covariance plus α diag(σ²).
    //
    // Given
    // -----
    // - The same problem, compared against finite differences of the
    //   analytic gradient.
    //
    // Expect
    // ------
    // - Agreement to 1e-5.
    fn hessian_matches_gradient_differences() {
        let reference = Reference::Equality(
            ExpData::new("k", array![1.0, 0.5], array![0.4, 0.8]).unwrap(),
        );
        let c = cols(&reference);
        let g = array![[0.0, 1.0], [1.0, 0.0], [2.0, 1.0], [3.0, -1.0]];
        let w = array![0.1, 0.2, 0.3, 0.4];
        let problem = GammaProblem::new(g.view(), &c, w.view(), 0.7).unwrap();
        let lambda = array![0.3, -0.2];
        let h = problem.hessian(&problem.evaluate(lambda.view()).unwrap());

        let eps = 1e-6;
        for k in 0..2 {
            let mut up = lambda.clone();
            let mut dn = lambda.clone();
            up[k] += eps;
            dn[k] -= eps;
            let gu = problem.evaluate(up.view()).unwrap().grad;
            let gd = problem.evaluate(dn.view()).unwrap().grad;
            for j in 0..2 {
                assert_abs_diff_eq!(h[[j, k]], (gu[j] - gd[j]) / (2.0 * eps), epsilon = 1e-5);
            }
        }
    }

    #[test]
    // Purpose
    // -------
    // Three-frame scenario: the solution is stationary,
    // `⟨g⟩ = v + α λ σ²`, and pulls the average from 2.3 towards 2.
    //
    // Given
    // -----
    // - Weights `[0.2, 0.3, 0.5]`, `g = [1, 2, 3]`, `v = 2 ± 0.5`, α = 1.
    //
    // Expect
    // ------
    // - Converged, λ > 0, stationarity to 1e-6, average in (2, 2.3).
    fn three_frame_solution_is_stationary() {
        let reference =
            Reference::Equality(ExpData::new("k", array![2.0], array![0.5]).unwrap());
        let c = cols(&reference);
        let g = array![[1.0], [2.0], [3.0]];
        let w = array![0.2, 0.3, 0.5];
        let problem = GammaProblem::new(g.view(), &c, w.view(), 1.0).unwrap();

        let sol = solve_gamma(&problem, &c.bounds, None, &tight()).unwrap();
        let lam = sol.lambda[0];
        assert!(sol.converged);
        assert!(lam > 0.0);
        assert_abs_diff_eq!(sol.eval.average[0], 2.0 + lam * 0.25, epsilon = 1e-6);
        assert!(sol.eval.average[0] > 2.0 && sol.eval.average[0] < 2.3);
    }

    #[test]
    // Purpose
    // -------
    // An upper bound that is already satisfied keeps its multiplier pinned
    // at zero.
    //
    // Given
    // -----
    // - Prior average 2.3 and the bound `⟨g⟩ <= 3`.
    // - Prior average 2.3 and the bound `⟨g⟩ <= 2` (violated).
    //
    // Expect
    // ------
    // - λ = 0 with the prior weights for the first; λ > 0 for the second.
    fn satisfied_upper_bound_is_pinned() {
        let g = array![[1.0], [2.0], [3.0]];
        let w = array![0.2, 0.3, 0.5];

        let loose = Reference::UpperBound(ExpData::new("k", array![3.0], array![0.5]).unwrap());
        let c = cols(&loose);
        let problem = GammaProblem::new(g.view(), &c, w.view(), 1.0).unwrap();
        let sol = solve_gamma(&problem, &c.bounds, None, &tight()).unwrap();
        assert_eq!(sol.lambda[0], 0.0);
        assert_relative_eq!(sol.eval.average[0], 2.3, max_relative = 1e-12);
        assert!(sol.grad_norm < 1e-12);

        let tight_ref =
            Reference::UpperBound(ExpData::new("k", array![2.0], array![0.5]).unwrap());
        let c = cols(&tight_ref);
        let problem = GammaProblem::new(g.view(), &c, w.view(), 1.0).unwrap();
        let sol = solve_gamma(&problem, &c.bounds, None, &tight()).unwrap();
        assert!(sol.lambda[0] > 0.0);
    }

    #[test]
    // Purpose
    // -------
    // Input validation of the problem and the solver.
    //
    // Given
    // -----
    // - α = ∞, and a start vector of the wrong length.
    //
    // Expect
    // ------
    // - `InvalidHyperparameter` and `MultiplierDimMismatch`.
    fn rejects_invalid_inputs() {
        let reference =
            Reference::Equality(ExpData::new("k", array![2.0], array![0.5]).unwrap());
        let c = cols(&reference);
        let g = array![[1.0], [2.0]];
        let w = array![0.5, 0.5];
        assert!(GammaProblem::new(g.view(), &c, w.view(), f64::INFINITY).is_err());

        let problem = GammaProblem::new(g.view(), &c, w.view(), 1.0).unwrap();
        let bad = array![0.0, 0.0];
        let err = solve_gamma(&problem, &c.bounds, Some(bad.view()), &tight()).unwrap_err();
        assert!(matches!(err, RefineError::MultiplierDimMismatch { expected: 1, found: 2 }));
    }
}
