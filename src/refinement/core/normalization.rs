//! Standardization of observables before fitting.
//!
//! Each observable column is mapped to `(g - mean) / std` with the
//! prior-weighted mean and standard deviation of its ensemble; experimental
//! values follow the same affine map and uncertainties are divided by
//! `std`. Γ, χ² and the relative entropy are invariant under this map, and
//! multipliers transform as `λ_phys = λ_norm / std`. User-supplied constants
//! take precedence over computed ones.
use crate::{
    optimization::numerical_stability::transformations::STD_FLOOR,
    refinement::core::{
        context::RefinementData,
        ensemble::{Ensemble, Normalization},
        layout::MultiplierLayout,
        reference::Reference,
    },
};
use ndarray::{concatenate, Array1, Axis};
use std::collections::BTreeMap;

/// Prior-weighted constants of every kind of `ens`.
///
/// Zero-variance columns keep `std = 1`; each one adds a warning.
pub fn weighted_constants(ens: &Ensemble) -> (BTreeMap<String, Normalization>, Vec<String>) {
    let mut out = BTreeMap::new();
    let mut warnings = Vec::new();
    for kind in ens.kinds() {
        if let Some(stored) = ens.normalization().get(&kind.name) {
            out.insert(kind.name.clone(), stored.clone());
            continue;
        }
        let Some(g) = &kind.values else { continue };
        let w = ens.weights();
        let mean = w.dot(g);
        let var = w.dot(&(g - &mean).mapv(|x| x * x));
        let mut std = var.mapv(f64::sqrt);
        for (j, s) in std.iter_mut().enumerate() {
            if *s <= STD_FLOOR * mean[j].abs().max(1.0) {
                let msg = format!(
                    "'{}/{}' observable {j} has zero variance; left unscaled",
                    ens.name(),
                    kind.name
                );
                log::warn!("{msg}");
                warnings.push(msg);
                *s = 1.0;
            }
        }
        out.insert(kind.name.clone(), Normalization { mean, std });
    }
    (out, warnings)
}

/// Normalized copy of `data` plus the warnings raised on the way.
pub fn normalize(data: &RefinementData) -> (RefinementData, Vec<String>) {
    let mut warnings = Vec::new();
    let ensembles = data
        .ensembles()
        .iter()
        .map(|ens| {
            if ens.is_normalized() {
                return ens.clone();
            }
            let (constants, w) = weighted_constants(ens);
            warnings.extend(w);
            ens.normalized_with(constants)
        })
        .collect();
    (RefinementData::from_parts(data.context().clone(), ensembles), warnings)
}

/// Per-column `std` in multiplier layout order (1 for unnormalized kinds).
pub fn lambda_scales(data: &RefinementData, layout: &MultiplierLayout) -> Array1<f64> {
    let mut parts: Vec<Array1<f64>> = Vec::new();
    for ens in data.ensembles() {
        for kind in ens.kinds() {
            let std = match ens.normalization().get(&kind.name) {
                Some(norm) if ens.is_normalized() => norm.std.clone(),
                _ => Array1::ones(kind.n_obs()),
            };
            if matches!(kind.reference, Reference::TwoSided { .. }) {
                parts.push(std.clone());
            }
            parts.push(std);
        }
    }
    let views: Vec<_> = parts.iter().map(|a| a.view()).collect();
    let scales = if views.is_empty() {
        Array1::zeros(0)
    } else {
        concatenate(Axis(0), &views).unwrap_or_else(|_| Array1::ones(layout.len()))
    };
    debug_assert_eq!(scales.len(), layout.len());
    scales
}

/// `λ_norm / std`.
pub fn to_physical_lambda(data: &RefinementData, layout: &MultiplierLayout, lambda: &Array1<f64>) -> Array1<f64> {
    lambda / &lambda_scales(data, layout)
}

/// `λ_phys · std`.
pub fn to_normalized_lambda(data: &RefinementData, layout: &MultiplierLayout, lambda: &Array1<f64>) -> Array1<f64> {
    lambda * &lambda_scales(data, layout)
}
