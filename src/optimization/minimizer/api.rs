//! High-level entry points for minimizing an [`Objective`].
//!
//! Both functions validate the starting point with [`Objective::check`],
//! build an L-BFGS solver for the configured line search and delegate to
//! [`run_lbfgs`].
use crate::optimization::{
    errors::OptResult,
    minimizer::{
        adapter::ArgMinAdapter,
        bounds::Bounds,
        builders::{build_optimizer_hager_zhang, build_optimizer_more_thuente},
        run::run_lbfgs,
        traits::{LineSearcher, MinimizerOptions, Objective, OptimOutcome},
        types::Theta,
    },
};

/// Minimize `f` without constraints.
///
/// # Errors
/// - Errors from `f.check`, the solver builders, or the run itself.
///
/// # Example
/// ```no_run
/// use ndarray::array;
/// use rust_refinement::optimization::errors::OptResult;
/// use rust_refinement::optimization::minimizer::{minimize, MinimizerOptions, Objective, Theta};
///
/// struct Bowl;
/// impl Objective for Bowl {
///     type Data = ();
///     fn value(&self, theta: &Theta, _: &()) -> OptResult<f64> {
///         Ok(theta.dot(theta))
///     }
///     fn check(&self, _: &Theta, _: &()) -> OptResult<()> {
///         Ok(())
///     }
/// }
///
/// let out = minimize(&Bowl, array![0.1, -0.2], &(), &MinimizerOptions::default())?;
/// println!("θ̂ = {:?}", out.theta_hat);
/// # Ok::<(), rust_refinement::optimization::errors::OptError>(())
/// ```
pub fn minimize<F: Objective>(
    f: &F, theta0: Theta, data: &F::Data, opts: &MinimizerOptions,
) -> OptResult<OptimOutcome> {
    f.check(&theta0, data)?;
    dispatch(theta0, opts, ArgMinAdapter::new(f, data))
}

/// Minimize `f` inside the box `bounds`.
///
/// The starting point is clamped into the box before the first evaluation.
///
/// # Errors
/// - [`OptError::BoundsDimMismatch`](crate::optimization::errors::OptError::BoundsDimMismatch)
///   if `theta0` and `bounds` differ in length.
/// - Errors from `f.check`, the solver builders, or the run itself.
pub fn minimize_bounded<F: Objective>(
    f: &F, theta0: Theta, data: &F::Data, bounds: &Bounds, opts: &MinimizerOptions,
) -> OptResult<OptimOutcome> {
    bounds.check_dim(&theta0)?;
    let theta0 = bounds.clamp(&theta0);
    f.check(&theta0, data)?;
    dispatch(theta0, opts, ArgMinAdapter::with_bounds(f, data, bounds))
}

fn dispatch<F: Objective>(
    theta0: Theta, opts: &MinimizerOptions, problem: ArgMinAdapter<'_, F>,
) -> OptResult<OptimOutcome> {
    match opts.line_searcher {
        LineSearcher::MoreThuente => {
            let solver = build_optimizer_more_thuente(opts)?;
            run_lbfgs(theta0, opts, problem, solver)
        }
        LineSearcher::HagerZhang => {
            let solver = build_optimizer_hager_zhang(opts)?;
            run_lbfgs(theta0, opts, problem, solver)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::{
        errors::OptError,
        minimizer::{
            traits::Tolerances,
            types::{Cost, Grad},
        },
    };
    use approx::assert_relative_eq;
    use ndarray::array;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Unconstrained and bounded solves of small convex problems, with and
    //   without analytic gradients, for both line searches.
    // - Error propagation from `check` and from mismatched bounds.
    //
    // They intentionally DO NOT cover:
    // - Refinement objectives (see the refinement modules).
    // -------------------------------------------------------------------------

    /// `Σ (x_i - c_i)^2` with an analytic gradient.
    struct Quadratic {
        center: Theta,
    }

    impl Objective for Quadratic {
        type Data = ();

        fn value(&self, theta: &Theta, _: &()) -> OptResult<Cost> {
            Ok((theta - &self.center).mapv(|d| d * d).sum())
        }

        fn check(&self, theta: &Theta, _: &()) -> OptResult<()> {
            if theta.len() != self.center.len() {
                return Err(OptError::GradientDimMismatch {
                    expected: self.center.len(),
                    found: theta.len(),
                });
            }
            Ok(())
        }

        fn grad(&self, theta: &Theta, _: &()) -> OptResult<Grad> {
            Ok((theta - &self.center) * 2.0)
        }
    }

    /// Same cost without a gradient, forcing finite differences.
    struct QuadraticNoGrad(Quadratic);

    impl Objective for QuadraticNoGrad {
        type Data = ();

        fn value(&self, theta: &Theta, data: &()) -> OptResult<Cost> {
            self.0.value(theta, data)
        }

        fn check(&self, theta: &Theta, data: &()) -> OptResult<()> {
            self.0.check(theta, data)
        }
    }

    fn tight_options(line_searcher: LineSearcher) -> MinimizerOptions {
        let tols = Tolerances::new(Some(1e-9), None, Some(200)).expect("valid tolerances");
        MinimizerOptions::new(tols, line_searcher, false, None).expect("valid options")
    }

    #[test]
    // Purpose
    // -------
    // Both line searches find the minimizer of an unconstrained quadratic.
    //
    // Given
    // -----
    // - Center `(1, -2)`, start at the origin, analytic gradient.
    //
    // Expect
    // ------
    // - `theta_hat ≈ (1, -2)`, `value ≈ 0`, `converged`.
    fn minimize_finds_unconstrained_quadratic_minimum() {
        for ls in [LineSearcher::MoreThuente, LineSearcher::HagerZhang] {
            // Arrange
            let f = Quadratic { center: array![1.0, -2.0] };

            // Act
            let out = minimize(&f, array![0.0, 0.0], &(), &tight_options(ls)).expect("solve");

            // Assert
            assert!(out.converged, "{ls:?} should converge: {}", out.status);
            assert_relative_eq!(out.theta_hat[0], 1.0, epsilon = 1e-6);
            assert_relative_eq!(out.theta_hat[1], -2.0, epsilon = 1e-6);
            assert!(out.value < 1e-10);
        }
    }

    #[test]
    // Purpose
    // -------
    // A bounded solve stops on the active bound and leaves free coordinates
    // at their unconstrained optimum.
    //
    // Given
    // -----
    // - Center `(1, -2)`, bounds `(-∞, 0]` and free, finite-difference
    //   gradient.
    //
    // Expect
    // ------
    // - `theta_hat ≈ (0, -2)` and `value ≈ 1`.
    fn minimize_bounded_stops_on_active_bound() {
        // Arrange
        let f = QuadraticNoGrad(Quadratic { center: array![1.0, -2.0] });
        let bounds =
            Bounds::from_pairs(&[(f64::NEG_INFINITY, 0.0), (f64::NEG_INFINITY, f64::INFINITY)])
                .expect("valid bounds");

        let tols = Tolerances::new(Some(1e-7), None, Some(200)).expect("valid tolerances");
        let opts = MinimizerOptions::with_tolerances(tols);

        // Act
        let out = minimize_bounded(&f, array![-1.0, 0.0], &(), &bounds, &opts).expect("solve");

        // Assert
        assert_relative_eq!(out.theta_hat[0], 0.0, epsilon = 1e-8);
        assert_relative_eq!(out.theta_hat[1], -2.0, epsilon = 1e-5);
        assert_relative_eq!(out.value, 1.0, epsilon = 1e-8);
    }

    #[test]
    // Purpose
    // -------
    // Configuration errors are reported before any solver work.
    //
    // Given
    // -----
    // - A start of the wrong length, and bounds of the wrong length.
    //
    // Expect
    // ------
    // - `GradientDimMismatch` from `check`; `BoundsDimMismatch` from the
    //   bounded entry point.
    fn errors_surface_before_solving() {
        let f = Quadratic { center: array![1.0, -2.0] };
        let opts = MinimizerOptions::default();
        assert!(matches!(
            minimize(&f, array![0.0], &(), &opts),
            Err(OptError::GradientDimMismatch { .. })
        ));
        assert!(matches!(
            minimize_bounded(&f, array![0.0, 0.0], &(), &Bounds::unbounded(3), &opts),
            Err(OptError::BoundsDimMismatch { .. })
        ));
    }
}
