//! minimizer::finite_diff — finite-difference gradients, Jacobians and
//! Hessians for fallible objectives.
//!
//! Purpose
//! -------
//! Provide derivative approximations for objectives that return
//! `OptResult`, on top of the `finitediff` crate, with error capture and
//! post-hoc validation. These helpers back the minimizer's gradient fallback
//! and the second-order quantities of the hyperparameter derivatives.
//!
//! Key behaviors
//! -------------
//! - [`fd_gradient`]: central differences with a forward-difference retry.
//! - [`fd_jacobian`]: central Jacobian of a vector map, `(outputs, inputs)`.
//! - [`compute_hessian`]: central Hessian of a gradient map with a
//!   forward-difference fallback, symmetrized in place.
//! - [`run_fd_diff`]: forward-difference gradient with error capture, used as
//!   the retry path.
//!
//! Invariants & assumptions
//! ------------------------
//! - `finitediff` differences with a fixed absolute step of `sqrt(eps)`.
//!   Central schemes are evaluated along the rescaled coordinate
//!   `theta + STEP_SCALE * y` at `y = 0`, which turns that step into
//!   `cbrt(eps)`, the step that balances truncation and rounding error for
//!   central differences. Nested use (a Hessian of a finite-difference
//!   gradient) stays accurate to roughly `1e-5` relative instead of being
//!   dominated by rounding noise.
//! - The first error raised by the objective during differencing is captured
//!   in a `RefCell` and returned instead of the (NaN-filled) approximation.
//!
//! Conventions
//! -----------
//! - Jacobians are `(outputs, inputs)`; a transposed result is reported as
//!   [`OptError::JacobianDimMismatch`], never silently reshaped.
//!
//! Testing notes
//! -------------
//! - Unit tests check the accuracy of the rescaled central schemes on
//!   polynomials (including a nested Hessian) and the error-capture paths.
use crate::optimization::{
    errors::{OptError, OptResult},
    minimizer::{
        types::{Grad, Hessian, Jacobian, Theta},
        validation::{validate_grad, validate_hessian, validate_jacobian},
    },
};
use finitediff::FiniteDiff;
use ndarray::Array1;
use std::cell::RefCell;

/// Ratio `cbrt(eps) / sqrt(eps)` between the central-difference step and
/// `finitediff`'s built-in step.
fn step_scale() -> f64 {
    f64::EPSILON.cbrt() / f64::EPSILON.sqrt()
}

/// Store the first error seen inside a finite-difference closure.
fn capture(slot: &RefCell<Option<OptError>>, err: OptError) {
    let mut slot = slot.borrow_mut();
    if slot.is_none() {
        *slot = Some(err);
    }
}

/// run_fd_diff — forward-difference gradient with error capture and validation.
///
/// Parameters
/// ----------
/// - `theta`: point at which the gradient is approximated.
/// - `func`: scalar objective; it is expected to write any failure into
///   `closure_err` and return `NaN`.
/// - `closure_err`: shared error slot, cleared on entry.
///
/// Errors
/// ------
/// - The captured objective error, if any.
/// - [`OptError::GradientDimMismatch`] / [`OptError::InvalidGradient`] from
///   [`validate_grad`].
pub fn run_fd_diff<G: Fn(&Theta) -> f64>(
    theta: &Theta, func: &G, closure_err: &RefCell<Option<OptError>>,
) -> OptResult<Grad> {
    closure_err.replace(None);
    let fd_grad = theta.forward_diff(func);
    if let Some(err) = closure_err.take() {
        return Err(err);
    }
    validate_grad(&fd_grad, theta.len())?;
    Ok(fd_grad)
}

/// fd_gradient — central-difference gradient of a fallible scalar objective.
///
/// Purpose
/// -------
/// Approximate `∇f(theta)` with the rescaled central scheme, retrying with
/// forward differences when the central pass either captured an objective
/// error or produced a non-finite component (e.g. one side of the stencil
/// left the objective's domain).
///
/// Errors
/// ------
/// - The objective error captured on the forward pass.
/// - Validation errors of the forward-difference gradient.
pub fn fd_gradient<F: Fn(&Theta) -> OptResult<f64>>(f: &F, theta: &Theta) -> OptResult<Grad> {
    let dim = theta.len();
    if dim == 0 {
        return Ok(Grad::zeros(0));
    }
    let closure_err: RefCell<Option<OptError>> = RefCell::new(None);
    let scale = step_scale();
    let scaled = |y: &Theta| -> f64 {
        match f(&(theta + &(y * scale))) {
            Ok(value) => value,
            Err(e) => {
                capture(&closure_err, e);
                f64::NAN
            }
        }
    };
    let origin = Theta::zeros(dim);
    let central = origin.central_diff(&scaled) / scale;
    if closure_err.borrow().is_none() && validate_grad(&central, dim).is_ok() {
        return Ok(central);
    }

    let plain = |x: &Theta| -> f64 {
        match f(x) {
            Ok(value) => value,
            Err(e) => {
                capture(&closure_err, e);
                f64::NAN
            }
        }
    };
    run_fd_diff(theta, &plain, &closure_err)
}

/// fd_jacobian — central-difference Jacobian of a fallible vector map.
///
/// Parameters
/// ----------
/// - `f`: map `R^n -> R^outputs`.
/// - `theta`: evaluation point.
/// - `outputs`: expected output length; a map returning another length is
///   treated as an error rather than padded.
///
/// Returns
/// -------
/// A validated `(outputs, theta.len())` matrix with entries
/// `J[i, k] = ∂f_i/∂theta_k`.
///
/// Errors
/// ------
/// - The first error raised by `f` during differencing.
/// - [`OptError::JacobianDimMismatch`] if `f` returns the wrong length or
///   the backend produced an unexpected layout.
/// - [`OptError::InvalidJacobian`] for non-finite entries.
pub fn fd_jacobian<F: Fn(&Theta) -> OptResult<Array1<f64>>>(
    f: &F, theta: &Theta, outputs: usize,
) -> OptResult<Jacobian> {
    let inputs = theta.len();
    if inputs == 0 || outputs == 0 {
        return Ok(Jacobian::zeros((outputs, inputs)));
    }
    let closure_err: RefCell<Option<OptError>> = RefCell::new(None);
    let scale = step_scale();
    let scaled = |y: &Theta| -> Array1<f64> {
        match f(&(theta + &(y * scale))) {
            Ok(out) if out.len() == outputs => out,
            Ok(out) => {
                capture(
                    &closure_err,
                    OptError::JacobianDimMismatch {
                        expected: (outputs, inputs),
                        found: (out.len(), inputs),
                    },
                );
                Array1::from_elem(outputs, f64::NAN)
            }
            Err(e) => {
                capture(&closure_err, e);
                Array1::from_elem(outputs, f64::NAN)
            }
        }
    };
    let origin = Theta::zeros(inputs);
    let jacobian = origin.central_jacobian(&scaled) / scale;
    if let Some(err) = closure_err.take() {
        return Err(err);
    }
    validate_jacobian(&jacobian, outputs, inputs)?;
    Ok(jacobian)
}

/// compute_hessian — finite-difference Hessian of a fallible gradient map.
///
/// Purpose
/// -------
/// Differentiate a gradient function once more, preferring the rescaled
/// central scheme and falling back to forward differences when the central
/// result fails validation. The result is symmetrized in place.
///
/// Errors
/// ------
/// - The first error raised by `f` on the fallback pass.
/// - [`OptError::HessianDimMismatch`] / [`OptError::InvalidHessian`] when the
///   fallback also fails validation.
///
/// Notes
/// -----
/// - `f` may itself be a finite-difference gradient (see [`fd_gradient`]);
///   the two step sizes are chosen so the nested result stays usable.
pub fn compute_hessian<F: Fn(&Theta) -> OptResult<Grad>>(
    f: &F, theta: &Theta,
) -> OptResult<Hessian> {
    let dim = theta.len();
    if dim == 0 {
        return Ok(Hessian::zeros((0, 0)));
    }
    let closure_err: RefCell<Option<OptError>> = RefCell::new(None);
    let scale = step_scale();
    let scaled = |y: &Theta| -> Grad {
        match f(&(theta + &(y * scale))) {
            Ok(g) => g,
            Err(e) => {
                capture(&closure_err, e);
                Grad::from_elem(dim, f64::NAN)
            }
        }
    };
    let origin = Theta::zeros(dim);
    let mut central = origin.central_hessian(&scaled) / scale;
    if closure_err.borrow().is_none() && validate_hessian(&central, dim).is_ok() {
        symmetrize_hess(&mut central);
        return Ok(central);
    }

    closure_err.replace(None);
    let mut forward = origin.forward_hessian(&scaled) / scale;
    if let Some(err) = closure_err.take() {
        return Err(err);
    }
    validate_hessian(&forward, dim)?;
    symmetrize_hess(&mut forward);
    Ok(forward)
}

// ---- Helper methods ----

/// Average each off-diagonal pair `(i, j)` / `(j, i)`; the diagonal is kept.
fn symmetrize_hess(hess: &mut Hessian) {
    for i in 0..hess.nrows() {
        for j in 0..i {
            let avg = 0.5 * (hess[[i, j]] + hess[[j, i]]);
            hess[[i, j]] = avg;
            hess[[j, i]] = avg;
        }
    }
}
