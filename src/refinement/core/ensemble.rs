//! Simulated ensembles: weighted frames, observables and correction hooks.
//!
//! Purpose
//! -------
//! Hold everything the refinement engine knows about one simulated system:
//! normalized frame weights, per-kind observable matrices with their
//! experimental references, and the optional force-field correction and
//! forward model through which parameters act on the ensemble.
//!
//! Key behaviors
//! -------------
//! - [`EnsembleBuilder`] validates every array against the frame count and
//!   every reference against its observable matrix before an [`Ensemble`]
//!   exists; nothing is discovered mid-solve.
//! - Kinds keep their insertion order; this order defines the multiplier
//!   layout of the ensemble.
//! - [`Ensemble::select_frames`], [`Ensemble::with_stride`] and
//!   [`Ensemble::select_observables`] return new ensembles; the original is
//!   never mutated.
//!
//! Invariants & assumptions
//! ------------------------
//! - `weights` sums to 1 and is non-negative.
//! - Every observable matrix, feature matrix and forward quantity has
//!   `n_frames` rows.
//! - A kind without stored values must be produced by the forward model;
//!   such kinds are resolved at the reference coefficients when the
//!   [`RefinementData`](super::context::RefinementData) is built.
//! - User callables must be free of side effects: the hyperparameter search
//!   calls them from several threads at once.
use crate::refinement::{
    core::reference::Reference,
    errors::{RefineError, RefineResult},
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Raw per-frame inputs of a forward model (frames on axis 0).
pub type ForwardQuantities = BTreeMap<String, Array2<f64>>;

/// Observable indices (into the full kind) kept by a split view.
pub type ObservableSelection = BTreeMap<String, Vec<usize>>;

/// `(parameters, quantities, selection) -> kind ↦ frames × observables`.
///
/// With `Some(selection)` the model may return only the selected columns of
/// each kind; returning every column is also accepted.
pub type ForwardFn = dyn Fn(
        ArrayView1<f64>,
        &ForwardQuantities,
        Option<&ObservableSelection>,
    ) -> anyhow::Result<BTreeMap<String, Array2<f64>>>
    + Send
    + Sync;

/// `(parameters, features) -> per-frame correction` in energy units.
pub type CorrectionFn =
    dyn Fn(ArrayView1<f64>, ArrayView2<f64>) -> anyhow::Result<Array1<f64>> + Send + Sync;

/// Force-field correction model.
#[derive(Clone)]
pub enum CorrectionModel {
    /// `c = features · p`; features must have one column per parameter.
    Linear,
    /// User-supplied correction.
    Custom(Arc<CorrectionFn>),
}

impl fmt::Debug for CorrectionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrectionModel::Linear => write!(f, "Linear"),
            CorrectionModel::Custom(_) => write!(f, "Custom(<fn>)"),
        }
    }
}

/// Correction model together with its per-frame features.
#[derive(Debug, Clone)]
pub struct ForceFieldCorrection {
    pub model: CorrectionModel,
    pub features: Array2<f64>,
}

/// Forward model together with its raw per-frame inputs.
#[derive(Clone)]
pub struct ForwardModel {
    pub func: Arc<ForwardFn>,
    pub quantities: ForwardQuantities,
}

impl fmt::Debug for ForwardModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardModel")
            .field("quantities", &self.quantities.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Affine normalization `x ↦ (x - mean) / std` of one kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    pub mean: Array1<f64>,
    pub std: Array1<f64>,
}

impl Normalization {
    pub fn apply(&self, g: &Array2<f64>) -> Array2<f64> {
        (g - &self.mean) / &self.std
    }

    fn select(&self, idx: &[usize]) -> Self {
        Self { mean: self.mean.select(Axis(0), idx), std: self.std.select(Axis(0), idx) }
    }
}

/// One observable kind of an ensemble.
#[derive(Debug, Clone)]
pub struct ObservableKind {
    pub name: String,
    pub reference: Reference,
    /// `frames × n_obs`; `None` only for forward-model kinds not yet resolved.
    pub values: Option<Array2<f64>>,
    /// Indices of these observables in the full kind.
    pub source_indices: Vec<usize>,
    /// Observable count of the full kind.
    pub full_len: usize,
}

impl ObservableKind {
    pub fn n_obs(&self) -> usize {
        self.reference.n_obs()
    }
}

/// Validated ensemble. Build with [`Ensemble::builder`].
#[derive(Debug, Clone)]
pub struct Ensemble {
    name: String,
    weights: Array1<f64>,
    kinds: Vec<ObservableKind>,
    temperature: f64,
    correction: Option<ForceFieldCorrection>,
    forward: Option<ForwardModel>,
    normalization: BTreeMap<String, Normalization>,
    normalized: bool,
    subset: bool,
    reference_log_z: Option<f64>,
}

impl Ensemble {
    /// Start building an ensemble from raw (unnormalized) frame weights.
    pub fn builder(name: impl Into<String>, weights: Array1<f64>) -> EnsembleBuilder {
        EnsembleBuilder {
            name: name.into(),
            weights,
            kinds: Vec::new(),
            temperature: 1.0,
            correction: None,
            forward: None,
            normalization: BTreeMap::new(),
            reference_log_z: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_frames(&self) -> usize {
        self.weights.len()
    }

    /// Normalized frame weights.
    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    pub fn kinds(&self) -> &[ObservableKind] {
        &self.kinds
    }

    pub fn kind(&self, name: &str) -> Option<&ObservableKind> {
        self.kinds.iter().find(|k| k.name == name)
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn correction(&self) -> Option<&ForceFieldCorrection> {
        self.correction.as_ref()
    }

    pub fn forward(&self) -> Option<&ForwardModel> {
        self.forward.as_ref()
    }

    pub fn reference_log_z(&self) -> Option<f64> {
        self.reference_log_z
    }

    /// Constants applied to the observables of this ensemble, if normalized;
    /// otherwise the user-supplied constants (if any).
    pub fn normalization(&self) -> &BTreeMap<String, Normalization> {
        &self.normalization
    }

    pub fn is_normalized(&self) -> bool {
        self.normalized
    }

    /// Total number of scalar observables over all kinds.
    pub fn n_obs(&self) -> usize {
        self.kinds.iter().map(ObservableKind::n_obs).sum()
    }

    /// Per-frame correction `c(p)` in energy units, or `None` without a model.
    ///
    /// # Errors
    /// - [`RefineError::ParameterDimMismatch`] if a linear model's features do
    ///   not match `params`.
    /// - [`RefineError::Callback`] if a custom model fails.
    /// - [`RefineError::FrameCountMismatch`] if a custom model returns the
    ///   wrong length.
    pub fn correction_values(&self, params: ArrayView1<f64>) -> RefineResult<Option<Array1<f64>>> {
        let Some(corr) = &self.correction else { return Ok(None) };
        let values = match &corr.model {
            CorrectionModel::Linear => {
                if corr.features.ncols() != params.len() {
                    return Err(RefineError::ParameterDimMismatch {
                        what: format!("linear correction features of '{}'", self.name),
                        expected: params.len(),
                        found: corr.features.ncols(),
                    });
                }
                corr.features.dot(&params)
            }
            CorrectionModel::Custom(f) => f(params, corr.features.view())
                .map_err(|e| RefineError::callback(format!("correction of '{}'", self.name), e))?,
        };
        if values.len() != self.n_frames() {
            return Err(RefineError::FrameCountMismatch {
                ensemble: self.name.clone(),
                what: "correction".to_string(),
                expected: self.n_frames(),
                found: values.len(),
            });
        }
        Ok(Some(values))
    }

    /// Observable matrices (one per kind, in kind order).
    ///
    /// With `fm_params` and a forward model, kinds returned by the model are
    /// recomputed (and normalized when the ensemble is normalized); the rest
    /// fall back to the stored values.
    ///
    /// # Errors
    /// - [`RefineError::Callback`] if the forward model fails.
    /// - [`RefineError::FrameCountMismatch`] /
    ///   [`RefineError::ObservableCountMismatch`] for malformed outputs.
    /// - [`RefineError::MissingObservables`] for a kind that has neither.
    pub fn observables(&self, fm_params: Option<ArrayView1<f64>>) -> RefineResult<Vec<Array2<f64>>> {
        let mut computed = match (fm_params, &self.forward) {
            (Some(p), Some(fwd)) => self.run_forward(p, fwd)?,
            _ => BTreeMap::new(),
        };
        self.kinds
            .iter()
            .map(|kind| match computed.remove(&kind.name) {
                Some(g) => Ok(g),
                None => kind.values.clone().ok_or_else(|| RefineError::MissingObservables {
                    ensemble: self.name.clone(),
                    kind: kind.name.clone(),
                }),
            })
            .collect()
    }

    /// Forward-model outputs reconciled with the kinds of this ensemble.
    fn run_forward(
        &self, params: ArrayView1<f64>, fwd: &ForwardModel,
    ) -> RefineResult<BTreeMap<String, Array2<f64>>> {
        let selection: Option<ObservableSelection> = self.subset.then(|| {
            self.kinds.iter().map(|k| (k.name.clone(), k.source_indices.clone())).collect()
        });
        let raw = (fwd.func)(params, &fwd.quantities, selection.as_ref())
            .map_err(|e| RefineError::callback(format!("forward model of '{}'", self.name), e))?;

        let mut out = BTreeMap::new();
        for (name, g) in raw {
            let Some(kind) = self.kind(&name) else { continue };
            if g.nrows() != self.n_frames() {
                return Err(RefineError::FrameCountMismatch {
                    ensemble: self.name.clone(),
                    what: format!("forward output '{name}'"),
                    expected: self.n_frames(),
                    found: g.nrows(),
                });
            }
            let g = if g.ncols() == kind.n_obs() {
                g
            } else if g.ncols() == kind.full_len {
                g.select(Axis(1), &kind.source_indices)
            } else {
                return Err(RefineError::ObservableCountMismatch {
                    ensemble: self.name.clone(),
                    kind: name,
                    expected: kind.n_obs(),
                    found: g.ncols(),
                });
            };
            let g = match self.normalization.get(&kind.name) {
                Some(norm) if self.normalized => norm.apply(&g),
                _ => g,
            };
            out.insert(kind.name.clone(), g);
        }
        Ok(out)
    }

    /// Keep the frames at `idx` (in the given order) and renormalize weights.
    ///
    /// # Errors
    /// - [`RefineError::InvalidWeights`] if the kept frames carry no weight.
    pub fn select_frames(&self, idx: &[usize]) -> RefineResult<Ensemble> {
        let weights = normalize_weights(&self.name, self.weights.select(Axis(0), idx))?;
        let kinds = self
            .kinds
            .iter()
            .map(|k| ObservableKind {
                values: k.values.as_ref().map(|g| g.select(Axis(0), idx)),
                ..k.clone()
            })
            .collect();
        let correction = self.correction.as_ref().map(|c| ForceFieldCorrection {
            model: c.model.clone(),
            features: c.features.select(Axis(0), idx),
        });
        let forward = self.forward.as_ref().map(|f| ForwardModel {
            func: Arc::clone(&f.func),
            quantities: f
                .quantities
                .iter()
                .map(|(k, q)| (k.clone(), q.select(Axis(0), idx)))
                .collect(),
        });
        Ok(Ensemble { weights, kinds, correction, forward, ..self.clone_header() })
    }

    /// Keep every `stride`-th frame starting from the first.
    ///
    /// # Errors
    /// - [`RefineError::InvalidStride`] for `stride == 0`.
    pub fn with_stride(&self, stride: usize) -> RefineResult<Ensemble> {
        if stride == 0 {
            return Err(RefineError::InvalidStride { stride });
        }
        let idx: Vec<usize> = (0..self.n_frames()).step_by(stride).collect();
        self.select_frames(&idx)
    }

    /// Keep, per kind, the observables at the given positions (into this
    /// ensemble's kind). Kinds absent from `selection` or with an empty index
    /// list are dropped; kind order is preserved.
    ///
    /// # Errors
    /// - [`RefineError::UnknownKind`] for a kind name not in the ensemble.
    /// - [`RefineError::InvalidSplit`] for an out-of-range index.
    pub fn select_observables(&self, selection: &ObservableSelection) -> RefineResult<Ensemble> {
        for (name, idx) in selection {
            let kind = self.kind(name).ok_or_else(|| RefineError::UnknownKind {
                ensemble: self.name.clone(),
                kind: name.clone(),
            })?;
            if let Some(&bad) = idx.iter().find(|&&i| i >= kind.n_obs()) {
                return Err(RefineError::InvalidSplit {
                    ensemble: self.name.clone(),
                    reason: format!("observable {bad} out of range for kind '{name}'"),
                });
            }
        }
        let mut normalization = self.normalization.clone();
        let kinds = self
            .kinds
            .iter()
            .filter_map(|k| {
                let idx = selection.get(&k.name).filter(|idx| !idx.is_empty())?;
                if let Some(norm) = normalization.get_mut(&k.name) {
                    *norm = norm.select(idx);
                }
                Some(ObservableKind {
                    name: k.name.clone(),
                    reference: k.reference.select(idx),
                    values: k.values.as_ref().map(|g| g.select(Axis(1), idx)),
                    source_indices: idx.iter().map(|&i| k.source_indices[i]).collect(),
                    full_len: k.full_len,
                })
            })
            .collect::<Vec<_>>();
        normalization.retain(|name, _| kinds.iter().any(|k| &k.name == name));
        Ok(Ensemble { kinds, normalization, subset: true, ..self.clone() })
    }

    /// Copy with the observables replaced by `(g - mean) / std` per kind.
    pub(crate) fn normalized_with(&self, constants: BTreeMap<String, Normalization>) -> Ensemble {
        let kinds = self
            .kinds
            .iter()
            .map(|k| match constants.get(&k.name) {
                Some(norm) => ObservableKind {
                    name: k.name.clone(),
                    reference: k.reference.affine(norm.mean.view(), norm.std.view()),
                    values: k.values.as_ref().map(|g| norm.apply(g)),
                    source_indices: k.source_indices.clone(),
                    full_len: k.full_len,
                },
                None => k.clone(),
            })
            .collect();
        Ensemble { kinds, normalization: constants, normalized: true, ..self.clone() }
    }

    /// Fill kinds that only the forward model produces.
    pub(crate) fn resolve_forward_kinds(&mut self, coefficients: ArrayView1<f64>) -> RefineResult<()> {
        if self.kinds.iter().all(|k| k.values.is_some()) {
            return Ok(());
        }
        let Some(fwd) = self.forward.clone() else {
            let kind = self.kinds.iter().find(|k| k.values.is_none()).map(|k| k.name.clone());
            return Err(RefineError::MissingObservables {
                ensemble: self.name.clone(),
                kind: kind.unwrap_or_default(),
            });
        };
        let mut computed = self.run_forward(coefficients, &fwd)?;
        for kind in self.kinds.iter_mut().filter(|k| k.values.is_none()) {
            let g = computed.remove(&kind.name).ok_or_else(|| RefineError::MissingObservables {
                ensemble: self.name.clone(),
                kind: kind.name.clone(),
            })?;
            kind.values = Some(g);
        }
        Ok(())
    }

    fn clone_header(&self) -> Ensemble {
        Ensemble {
            name: self.name.clone(),
            weights: Array1::zeros(0),
            kinds: Vec::new(),
            temperature: self.temperature,
            correction: None,
            forward: None,
            normalization: self.normalization.clone(),
            normalized: self.normalized,
            subset: self.subset,
            reference_log_z: self.reference_log_z,
        }
    }
}

/// Builder for [`Ensemble`].
pub struct EnsembleBuilder {
    name: String,
    weights: Array1<f64>,
    kinds: Vec<(String, Reference, Option<Array2<f64>>)>,
    temperature: f64,
    correction: Option<ForceFieldCorrection>,
    forward: Option<ForwardModel>,
    normalization: BTreeMap<String, Normalization>,
    reference_log_z: Option<f64>,
}

impl EnsembleBuilder {
    /// Add a kind with stored values (`frames × n_obs`).
    pub fn observable(mut self, name: impl Into<String>, values: Array2<f64>, reference: Reference) -> Self {
        self.kinds.push((name.into(), reference, Some(values)));
        self
    }

    /// Add a kind produced only by the forward model.
    pub fn forward_observable(mut self, name: impl Into<String>, reference: Reference) -> Self {
        self.kinds.push((name.into(), reference, None));
        self
    }

    /// Temperature converting corrections to dimensionless exponents (default 1).
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn correction(mut self, model: CorrectionModel, features: Array2<f64>) -> Self {
        self.correction = Some(ForceFieldCorrection { model, features });
        self
    }

    pub fn forward_model(mut self, func: Arc<ForwardFn>, quantities: ForwardQuantities) -> Self {
        self.forward = Some(ForwardModel { func, quantities });
        self
    }

    /// Stored normalization constants of a kind, used instead of computed ones.
    pub fn normalization(mut self, kind: impl Into<String>, mean: Array1<f64>, std: Array1<f64>) -> Self {
        self.normalization.insert(kind.into(), Normalization { mean, std });
        self
    }

    /// Stored reference log-partition (alchemical cycle legs).
    pub fn reference_log_z(mut self, log_z: f64) -> Self {
        self.reference_log_z = Some(log_z);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    /// - [`RefineError::EmptyEnsemble`], [`RefineError::InvalidWeights`].
    /// - [`RefineError::DuplicateName`] for repeated kind names.
    /// - [`RefineError::FrameCountMismatch`] /
    ///   [`RefineError::ObservableCountMismatch`] for misshapen arrays.
    /// - [`RefineError::MissingObservables`] for a forward-only kind without
    ///   a forward model.
    /// - [`RefineError::InvalidTemperature`], [`RefineError::InvalidNormalization`].
    pub fn build(self) -> RefineResult<Ensemble> {
        let name = self.name;
        if self.weights.is_empty() {
            return Err(RefineError::EmptyEnsemble { ensemble: name });
        }
        let weights = normalize_weights(&name, self.weights)?;
        let n = weights.len();

        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(RefineError::InvalidTemperature { name, value: self.temperature });
        }

        let mut kinds: Vec<ObservableKind> = Vec::with_capacity(self.kinds.len());
        for (kind_name, reference, values) in self.kinds {
            if kinds.iter().any(|k| k.name == kind_name) {
                return Err(RefineError::DuplicateName { name: kind_name });
            }
            match &values {
                Some(g) => {
                    check_rows(&name, &kind_name, n, g.nrows())?;
                    if g.ncols() != reference.n_obs() {
                        return Err(RefineError::ObservableCountMismatch {
                            ensemble: name,
                            kind: kind_name,
                            expected: reference.n_obs(),
                            found: g.ncols(),
                        });
                    }
                }
                None if self.forward.is_none() => {
                    return Err(RefineError::MissingObservables { ensemble: name, kind: kind_name });
                }
                None => {}
            }
            let full_len = reference.n_obs();
            kinds.push(ObservableKind {
                name: kind_name,
                reference,
                values,
                source_indices: (0..full_len).collect(),
                full_len,
            });
        }

        if let Some(corr) = &self.correction {
            check_rows(&name, "correction features", n, corr.features.nrows())?;
        }
        if let Some(fwd) = &self.forward {
            for (q_name, q) in &fwd.quantities {
                check_rows(&name, &format!("forward quantity '{q_name}'"), n, q.nrows())?;
            }
        }
        for (kind_name, norm) in &self.normalization {
            let kind = kinds.iter().find(|k| &k.name == kind_name).ok_or_else(|| {
                RefineError::UnknownKind { ensemble: name.clone(), kind: kind_name.clone() }
            })?;
            let invalid = |reason| RefineError::InvalidNormalization {
                ensemble: name.clone(),
                kind: kind_name.clone(),
                reason,
            };
            if norm.mean.len() != kind.n_obs() || norm.std.len() != kind.n_obs() {
                return Err(invalid("constants must have one entry per observable"));
            }
            if norm.mean.iter().any(|m| !m.is_finite())
                || norm.std.iter().any(|s| !s.is_finite() || *s <= 0.0)
            {
                return Err(invalid("means must be finite and stds finite and positive"));
            }
        }
        if let Some(v) = self.reference_log_z {
            if !v.is_finite() {
                return Err(RefineError::InvalidReference {
                    kind: format!("{name}/reference_log_z"),
                    index: 0,
                    value: v,
                    reason: "stored log-partition must be finite",
                });
            }
        }

        Ok(Ensemble {
            name,
            weights,
            kinds,
            temperature: self.temperature,
            correction: self.correction,
            forward: self.forward,
            normalization: self.normalization,
            normalized: false,
            subset: false,
            reference_log_z: self.reference_log_z,
        })
    }
}

fn check_rows(ensemble: &str, what: &str, expected: usize, found: usize) -> RefineResult<()> {
    if expected != found {
        return Err(RefineError::FrameCountMismatch {
            ensemble: ensemble.to_string(),
            what: what.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

/// Validate raw weights and scale them to sum 1.
pub(crate) fn normalize_weights(ensemble: &str, weights: Array1<f64>) -> RefineResult<Array1<f64>> {
    let invalid = |index, value, reason| RefineError::InvalidWeights {
        ensemble: ensemble.to_string(),
        index,
        value,
        reason,
    };
    for (i, &w) in weights.iter().enumerate() {
        if !w.is_finite() || w < 0.0 {
            return Err(invalid(i, w, "weights must be finite and non-negative"));
        }
    }
    let total = weights.sum();
    if total <= 0.0 {
        return Err(invalid(0, total, "weights sum to zero"));
    }
    Ok(weights / total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refinement::core::reference::ExpData;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Builder validation (weights, shapes, forward-only kinds).
    // - Frame and observable selection, stride.
    // - Forward-model reconciliation of full vs selected outputs.
    // -------------------------------------------------------------------------

    fn eq_ref(values: Array1<f64>) -> Reference {
        let sigmas = Array1::from_elem(values.len(), 1.0);
        Reference::Equality(ExpData::new("k", values, sigmas).unwrap())
    }

    fn two_kind_ensemble() -> Ensemble {
        Ensemble::builder("e", array![1.0, 1.0, 2.0, 4.0])
            .observable(
                "a",
                array![[1.0, 10.0], [2.0, 20.0], [3.0, 30.0], [4.0, 40.0]],
                eq_ref(array![2.0, 20.0]),
            )
            .observable("b", array![[0.1], [0.2], [0.3], [0.4]], eq_ref(array![0.2]))
            .build()
            .unwrap()
    }

    #[test]
    // Purpose
    // -------
    // Weights are renormalized and malformed inputs are rejected.
    //
    // Given
    // -----
    // - Weights `[1, 1, 2, 4]`.
    // - A negative weight, a 3-row matrix for 4 frames, a forward-only kind
    //   without forward model.
    //
    // Expect
    // ------
    // - Weights `[1, 1, 2, 4] / 8`.
    // - `InvalidWeights`, `FrameCountMismatch`, `MissingObservables`.
    fn builder_normalizes_and_validates() {
        let ens = two_kind_ensemble();
        assert_abs_diff_eq!(ens.weights()[3], 0.5, epsilon = 1e-15);
        assert_eq!(ens.n_obs(), 3);

        let err = Ensemble::builder("e", array![1.0, -1.0]).build().unwrap_err();
        assert!(matches!(err, RefineError::InvalidWeights { index: 1, .. }));

        let err = Ensemble::builder("e", array![1.0, 1.0, 1.0, 1.0])
            .observable("a", array![[1.0], [2.0], [3.0]], eq_ref(array![2.0]))
            .build()
            .unwrap_err();
        assert!(matches!(err, RefineError::FrameCountMismatch { expected: 4, found: 3, .. }));

        let err = Ensemble::builder("e", array![1.0])
            .forward_observable("a", eq_ref(array![2.0]))
            .build()
            .unwrap_err();
        assert!(matches!(err, RefineError::MissingObservables { .. }));
    }

    #[test]
    // Purpose
    // -------
    // Frame selection and stride subsample every per-frame array and
    // renormalize the weights.
    //
    // Given
    // -----
    // - The two-kind ensemble and stride 2.
    //
    // Expect
    // ------
    // - Frames 0 and 2 remain with weights `[1/3, 2/3]`.
    fn stride_keeps_every_kth_frame() {
        let ens = two_kind_ensemble().with_stride(2).unwrap();
        assert_eq!(ens.n_frames(), 2);
        assert_abs_diff_eq!(ens.weights()[1], 2.0 / 3.0, epsilon = 1e-15);
        let g = ens.kinds()[0].values.as_ref().unwrap();
        assert_eq!(g.column(0), array![1.0, 3.0]);
        assert!(matches!(
            two_kind_ensemble().with_stride(0),
            Err(RefineError::InvalidStride { stride: 0 })
        ));
    }

    #[test]
    // Purpose
    // -------
    // Observable selection keeps kind order, drops empty kinds and remembers
    // source indices.
    //
    // Given
    // -----
    // - Selection `{a: [1]}`.
    //
    // Expect
    // ------
    // - One kind `a` with a single observable whose source index is 1.
    fn select_observables_tracks_sources() {
        let sel: ObservableSelection = [("a".to_string(), vec![1])].into_iter().collect();
        let ens = two_kind_ensemble().select_observables(&sel).unwrap();
        assert_eq!(ens.kinds().len(), 1);
        assert_eq!(ens.kinds()[0].source_indices, vec![1]);
        assert_eq!(ens.kinds()[0].values.as_ref().unwrap().column(0)[3], 40.0);

        let bad: ObservableSelection = [("a".to_string(), vec![5])].into_iter().collect();
        assert!(matches!(
            two_kind_ensemble().select_observables(&bad),
            Err(RefineError::InvalidSplit { .. })
        ));
    }

    #[test]
    // Purpose
    // -------
    // Forward outputs covering the full kind are narrowed to a selected view.
    //
    // Given
    // -----
    // - A forward model returning `p0 · q` for two observables, ignoring the
    //   selection, on a view that keeps observable 1 only.
    //
    // Expect
    // ------
    // - The view sees one column equal to `p0 · q[:, 1]`.
    fn forward_output_is_reconciled_with_selection() {
        let func: Arc<ForwardFn> = Arc::new(|p, q, _sel| {
            let mut out = BTreeMap::new();
            out.insert("a".to_string(), &q["x"] * p[0]);
            Ok(out)
        });
        let quantities: ForwardQuantities =
            [("x".to_string(), array![[1.0, 2.0], [3.0, 4.0]])].into_iter().collect();
        let ens = Ensemble::builder("e", array![1.0, 1.0])
            .forward_observable("a", eq_ref(array![0.0, 0.0]))
            .forward_model(func, quantities)
            .build()
            .unwrap();
        let sel: ObservableSelection = [("a".to_string(), vec![1])].into_iter().collect();
        let view = ens.select_observables(&sel).unwrap();

        let g = view.observables(Some(array![2.0].view())).unwrap();
        assert_eq!(g[0], array![[4.0], [8.0]]);

        let err = view.observables(None).unwrap_err();
        assert!(matches!(err, RefineError::MissingObservables { .. }));
    }
}
