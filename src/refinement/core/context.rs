//! Global context and the validated refinement dataset.
//!
//! [`GlobalContext`] names the force-field parameters, carries the
//! reference forward-model coefficients and declares alchemical cycles.
//! [`RefinementData`] pairs a context with an ordered list of ensembles and
//! checks the two against each other once, before any optimization.
use crate::refinement::{
    core::ensemble::{CorrectionModel, Ensemble},
    errors::{RefineError, RefineResult},
};
use ndarray::Array1;
use std::collections::BTreeSet;

/// Leg suffixes of an alchemical cycle.
pub const CYCLE_LEGS: [&str; 4] = ["MD", "MS", "AD", "AS"];

/// Four-leg alchemical cycle with its experimental ΔΔG.
///
/// Legs are the ensembles named `<name>_MD`, `<name>_MS`, `<name>_AD` and
/// `<name>_AS`; a missing leg contributes zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Cycle {
    pub name: String,
    pub temperature: f64,
    pub exp_ddg: f64,
    pub sigma: f64,
}

impl Cycle {
    /// # Errors
    /// - [`RefineError::InvalidTemperature`] for a non-positive temperature.
    /// - [`RefineError::InvalidCycle`] for a non-finite ΔΔG or a
    ///   non-positive uncertainty.
    pub fn new(name: impl Into<String>, temperature: f64, exp_ddg: f64, sigma: f64) -> RefineResult<Self> {
        let name = name.into();
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(RefineError::InvalidTemperature { name, value: temperature });
        }
        if !exp_ddg.is_finite() {
            return Err(RefineError::InvalidCycle { cycle: name, reason: "ΔΔG must be finite".into() });
        }
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(RefineError::InvalidCycle {
                cycle: name,
                reason: "uncertainty must be finite and positive".into(),
            });
        }
        Ok(Self { name, temperature, exp_ddg, sigma })
    }

    pub fn leg_name(&self, leg: &str) -> String {
        format!("{}_{}", self.name, leg)
    }
}

/// Names and anchors shared by all ensembles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalContext {
    /// Force-field parameter names; their order is the parameter layout.
    pub ff_names: Vec<String>,
    /// Reference forward-model coefficients (start point and anchor).
    pub forward_coefficients: Option<Array1<f64>>,
    pub cycles: Vec<Cycle>,
}

impl GlobalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ff_names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.ff_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_forward_coefficients(mut self, coefficients: Array1<f64>) -> Self {
        self.forward_coefficients = Some(coefficients);
        self
    }

    pub fn with_cycle(mut self, cycle: Cycle) -> Self {
        self.cycles.push(cycle);
        self
    }

    pub fn n_ff(&self) -> usize {
        self.ff_names.len()
    }

    pub fn n_fm(&self) -> usize {
        self.forward_coefficients.as_ref().map_or(0, Array1::len)
    }
}

/// Validated ensembles plus their global context.
///
/// Ensemble order is the multiplier layout order. The data is read-only to
/// every optimization routine; splits and normalization build new values.
#[derive(Debug, Clone)]
pub struct RefinementData {
    context: GlobalContext,
    ensembles: Vec<Ensemble>,
}

impl RefinementData {
    /// Check ensembles against the context and resolve forward-only kinds
    /// at the reference coefficients.
    ///
    /// # Errors
    /// - [`RefineError::DuplicateName`] for repeated ensemble, parameter or
    ///   cycle names.
    /// - [`RefineError::ParameterDimMismatch`] for linear corrections whose
    ///   feature count differs from the parameter names.
    /// - [`RefineError::InvalidForwardModel`] for a forward model without
    ///   reference coefficients, or non-finite coefficients.
    /// - Errors from the forward model while resolving forward-only kinds.
    pub fn new(context: GlobalContext, mut ensembles: Vec<Ensemble>) -> RefineResult<Self> {
        unique(ensembles.iter().map(Ensemble::name))?;
        unique(context.ff_names.iter().map(String::as_str))?;
        unique(context.cycles.iter().map(|c| c.name.as_str()))?;

        if let Some(coeffs) = &context.forward_coefficients {
            if coeffs.iter().any(|c| !c.is_finite()) {
                return Err(RefineError::InvalidForwardModel {
                    ensemble: String::new(),
                    reason: "reference coefficients must be finite".into(),
                });
            }
        }

        for ens in ensembles.iter_mut() {
            if let Some(corr) = ens.correction() {
                let linear = matches!(corr.model, CorrectionModel::Linear);
                if linear && corr.features.ncols() != context.n_ff() {
                    return Err(RefineError::ParameterDimMismatch {
                        what: format!("linear correction features of '{}'", ens.name()),
                        expected: context.n_ff(),
                        found: corr.features.ncols(),
                    });
                }
            }
            if ens.forward().is_some() {
                let coeffs = context.forward_coefficients.as_ref().ok_or_else(|| {
                    RefineError::InvalidForwardModel {
                        ensemble: ens.name().to_string(),
                        reason: "forward model given without reference coefficients".into(),
                    }
                })?;
                ens.resolve_forward_kinds(coeffs.view())?;
            }
        }
        Ok(Self { context, ensembles })
    }

    /// Rebuild from parts already known to be consistent (split views).
    pub(crate) fn from_parts(context: GlobalContext, ensembles: Vec<Ensemble>) -> Self {
        Self { context, ensembles }
    }

    pub fn context(&self) -> &GlobalContext {
        &self.context
    }

    pub fn ensembles(&self) -> &[Ensemble] {
        &self.ensembles
    }

    pub fn ensemble(&self, name: &str) -> Option<&Ensemble> {
        self.ensembles.iter().find(|e| e.name() == name)
    }

    pub fn index_of(&self, name: &str) -> RefineResult<usize> {
        self.ensembles
            .iter()
            .position(|e| e.name() == name)
            .ok_or_else(|| RefineError::UnknownEnsemble { name: name.to_string() })
    }

    /// Subsample every ensemble with `stride`.
    pub fn with_stride(&self, stride: usize) -> RefineResult<Self> {
        let ensembles =
            self.ensembles.iter().map(|e| e.with_stride(stride)).collect::<RefineResult<_>>()?;
        Ok(Self { context: self.context.clone(), ensembles })
    }
}

fn unique<'a>(names: impl Iterator<Item = &'a str>) -> RefineResult<()> {
    let mut seen = BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(RefineError::DuplicateName { name: name.to_string() });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refinement::core::{
        ensemble::{ForwardFn, ForwardQuantities},
        reference::{ExpData, Reference},
    };
    use ndarray::{array, Array2};
    use std::{collections::BTreeMap, sync::Arc};

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Cross-checks between ensembles and the context.
    // - Resolution of forward-only kinds at the reference coefficients.
    // -------------------------------------------------------------------------

    fn reference() -> Reference {
        Reference::Equality(ExpData::new("k", array![1.0], array![1.0]).unwrap())
    }

    #[test]
    // Purpose
    // -------
    // Duplicate ensembles and mismatched linear features are rejected.
    //
    // Given
    // -----
    // - Two ensembles named `a`.
    // - A linear correction with 2 features and 1 parameter name.
    //
    // Expect
    // ------
    // - `DuplicateName` and `ParameterDimMismatch`.
    fn new_rejects_inconsistent_inputs() {
        let ens = Ensemble::builder("a", array![1.0, 1.0])
            .observable("k", array![[0.0], [1.0]], reference())
            .build()
            .unwrap();
        let err = RefinementData::new(GlobalContext::new(), vec![ens.clone(), ens]).unwrap_err();
        assert_eq!(err, RefineError::DuplicateName { name: "a".to_string() });

        let ens = Ensemble::builder("a", array![1.0, 1.0])
            .observable("k", array![[0.0], [1.0]], reference())
            .correction(CorrectionModel::Linear, Array2::zeros((2, 2)))
            .build()
            .unwrap();
        let ctx = GlobalContext::new().with_ff_names(["q"]);
        let err = RefinementData::new(ctx, vec![ens]).unwrap_err();
        assert!(matches!(err, RefineError::ParameterDimMismatch { expected: 1, found: 2, .. }));
    }

    #[test]
    // Purpose
    // -------
    // Forward-only kinds get values computed at the reference coefficients,
    // and a forward model without coefficients is rejected.
    //
    // Given
    // -----
    // - A forward model returning `p0 · x` and coefficients `[3]`.
    //
    // Expect
    // ------
    // - Stored values `3 · x`; without coefficients `InvalidForwardModel`.
    fn forward_only_kinds_are_resolved() {
        let func: Arc<ForwardFn> = Arc::new(|p, q, _| {
            Ok([("k".to_string(), &q["x"] * p[0])].into_iter().collect::<BTreeMap<_, _>>())
        });
        let quantities: ForwardQuantities =
            [("x".to_string(), array![[1.0], [2.0]])].into_iter().collect();
        let ens = Ensemble::builder("a", array![1.0, 1.0])
            .forward_observable("k", reference())
            .forward_model(func, quantities)
            .build()
            .unwrap();

        let err = RefinementData::new(GlobalContext::new(), vec![ens.clone()]).unwrap_err();
        assert!(matches!(err, RefineError::InvalidForwardModel { .. }));

        let ctx = GlobalContext::new().with_forward_coefficients(array![3.0]);
        let data = RefinementData::new(ctx, vec![ens]).unwrap();
        let g = data.ensembles()[0].kinds()[0].values.clone().unwrap();
        assert_eq!(g, array![[3.0], [6.0]]);
    }

    #[test]
    // Purpose
    // -------
    // Cycle validation and leg naming.
    //
    // Given
    // -----
    // - A cycle with zero uncertainty and a valid cycle `c`.
    //
    // Expect
    // ------
    // - `InvalidCycle`; legs named `c_MD` etc.
    fn cycles_validate_and_name_legs() {
        assert!(matches!(Cycle::new("c", 1.0, 0.0, 0.0), Err(RefineError::InvalidCycle { .. })));
        let c = Cycle::new("c", 1.0, 0.5, 0.1).unwrap();
        assert_eq!(c.leg_name(CYCLE_LEGS[1]), "c_MS");
    }
}
