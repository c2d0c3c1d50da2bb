//! Adapter that exposes an [`Objective`] as an `argmin` problem.
//!
//! The cost is the objective value itself. For a bounded solve every
//! evaluation happens at the clamped point and the gradient is projected at
//! active bounds (see [`Bounds`]). Without an analytic gradient, the
//! objective is finite-differenced at that same clamped point.
use crate::optimization::{
    errors::{OptError, OptResult},
    minimizer::{
        bounds::Bounds,
        finite_diff::fd_gradient,
        traits::Objective,
        types::{Cost, Grad, Theta},
        validation::validate_grad,
    },
};
use argmin::core::{CostFunction, Error, Gradient};
use std::borrow::Cow;

/// Bridges an [`Objective`] to `argmin`'s `CostFunction` and `Gradient`.
#[derive(Debug)]
pub struct ArgMinAdapter<'a, F: Objective> {
    pub f: &'a F,
    pub data: &'a F::Data,
    pub bounds: Option<&'a Bounds>,
}

impl<'a, F: Objective> ArgMinAdapter<'a, F> {
    pub fn new(f: &'a F, data: &'a F::Data) -> Self {
        Self { f, data, bounds: None }
    }

    pub fn with_bounds(f: &'a F, data: &'a F::Data, bounds: &'a Bounds) -> Self {
        Self { f, data, bounds: Some(bounds) }
    }

    /// A second handle on the same objective, data and bounds.
    pub fn share(&self) -> Self {
        Self { f: self.f, data: self.data, bounds: self.bounds }
    }

    /// Map `theta` into the feasible box (identity for unbounded solves).
    pub fn feasible<'t>(&self, theta: &'t Theta) -> Cow<'t, Theta> {
        match self.bounds {
            Some(b) => Cow::Owned(b.clamp(theta)),
            None => Cow::Borrowed(theta),
        }
    }

    /// Objective value at the feasible point, required to be finite.
    pub fn eval_cost(&self, theta: &Theta) -> OptResult<Cost> {
        let x = self.feasible(theta);
        let output = self.f.value(&x, self.data)?;
        if !output.is_finite() {
            return Err(OptError::NonFiniteCost { value: output });
        }
        Ok(output)
    }

    /// Gradient at the feasible point: analytic if available, otherwise a
    /// finite-difference gradient; projected at active bounds.
    pub fn eval_gradient(&self, theta: &Theta) -> OptResult<Grad> {
        let x = self.feasible(theta);
        let dim = x.len();
        let mut grad = match self.f.grad(&x, self.data) {
            Ok(g) => {
                validate_grad(&g, dim)?;
                g
            }
            Err(OptError::GradientNotImplemented) => {
                let cost = |t: &Theta| -> OptResult<f64> {
                    let output = self.f.value(t, self.data)?;
                    if !output.is_finite() {
                        return Err(OptError::NonFiniteCost { value: output });
                    }
                    Ok(output)
                };
                fd_gradient(&cost, &x)?
            }
            Err(e) => return Err(e),
        };
        if let Some(b) = self.bounds {
            b.project_gradient(&x, &mut grad);
        }
        Ok(grad)
    }
}

impl<'a, F: Objective> CostFunction for ArgMinAdapter<'a, F> {
    type Param = Theta;
    type Output = Cost;

    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.eval_cost(theta)?)
    }
}

impl<'a, F: Objective> Gradient for ArgMinAdapter<'a, F> {
    type Param = Theta;
    type Gradient = Grad;

    fn gradient(&self, theta: &Self::Param) -> Result<Self::Gradient, Error> {
        Ok(self.eval_gradient(theta)?)
    }
}
