//! Explicit layouts of the multiplier and parameter vectors.
//!
//! Purpose
//! -------
//! Every flat vector in the engine is interpreted through one of these two
//! objects, built once per dataset and shared by the loss, the fit, the
//! splitter and the hypergradient engine.
//!
//! Key behaviors
//! -------------
//! - [`MultiplierLayout`]: ensembles in data order, kinds in insertion
//!   order, columns in [`Reference::expand`](super::reference::Reference::expand)
//!   order (LOWER block then UPPER block for two-sided kinds).
//! - [`ParameterLayout`]: force-field parameters (when β is finite)
//!   followed by forward-model parameters (when γ is finite).
use crate::refinement::{
    core::{context::RefinementData, hyperparams::Hyperparameters, reference::LambdaBound},
    errors::{RefineError, RefineResult},
};
use ndarray::{s, Array1, ArrayView1};
use std::ops::Range;

/// Columns of one kind inside the flat multiplier vector.
#[derive(Debug, Clone, PartialEq)]
pub struct KindSlot {
    pub kind: String,
    pub offset: usize,
    pub n_columns: usize,
}

/// Columns of one ensemble inside the flat multiplier vector.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleSlot {
    pub name: String,
    pub offset: usize,
    pub len: usize,
    pub kinds: Vec<KindSlot>,
    pub bounds: Vec<LambdaBound>,
}

impl EnsembleSlot {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Flattening order of the multiplier vector.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiplierLayout {
    ensembles: Vec<EnsembleSlot>,
    len: usize,
}

impl MultiplierLayout {
    pub fn new(data: &RefinementData) -> Self {
        let mut offset = 0;
        let ensembles = data
            .ensembles()
            .iter()
            .map(|ens| {
                let start = offset;
                let mut bounds = Vec::new();
                let kinds = ens
                    .kinds()
                    .iter()
                    .map(|k| {
                        let cols = k.reference.expand();
                        let slot =
                            KindSlot { kind: k.name.clone(), offset, n_columns: cols.len() };
                        offset += cols.len();
                        bounds.extend(cols.bounds);
                        slot
                    })
                    .collect();
                EnsembleSlot {
                    name: ens.name().to_string(),
                    offset: start,
                    len: offset - start,
                    kinds,
                    bounds,
                }
            })
            .collect();
        Self { ensembles, len: offset }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn ensembles(&self) -> &[EnsembleSlot] {
        &self.ensembles
    }

    pub fn ensemble(&self, index: usize) -> &EnsembleSlot {
        &self.ensembles[index]
    }

    /// Multipliers of ensemble `index`.
    pub fn slice<'a>(&self, lambda: &'a Array1<f64>, index: usize) -> ArrayView1<'a, f64> {
        lambda.slice(s![self.ensembles[index].range()])
    }

    /// Sign constraints of every column, in layout order.
    pub fn bounds(&self) -> Vec<LambdaBound> {
        self.ensembles.iter().flat_map(|e| e.bounds.iter().copied()).collect()
    }

    /// # Errors
    /// - [`RefineError::MultiplierDimMismatch`] if `lambda` has the wrong length.
    pub fn check(&self, lambda: &Array1<f64>) -> RefineResult<()> {
        if lambda.len() != self.len {
            return Err(RefineError::MultiplierDimMismatch { expected: self.len, found: lambda.len() });
        }
        Ok(())
    }
}

/// Split of the parameter vector into its two channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterLayout {
    pub n_ff: usize,
    pub n_fm: usize,
}

impl ParameterLayout {
    /// Channels disabled by an infinite strength get no parameters.
    pub fn new(data: &RefinementData, hyper: &Hyperparameters) -> Self {
        let ctx = data.context();
        Self {
            n_ff: if hyper.ff_enabled() { ctx.n_ff() } else { 0 },
            n_fm: if hyper.fm_enabled() { ctx.n_fm() } else { 0 },
        }
    }

    pub fn len(&self) -> usize {
        self.n_ff + self.n_fm
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(force-field, forward-model)` views of `params`.
    pub fn split<'a>(&self, params: &'a Array1<f64>) -> (ArrayView1<'a, f64>, ArrayView1<'a, f64>) {
        (params.slice(s![..self.n_ff]), params.slice(s![self.n_ff..]))
    }

    /// Zero force-field parameters followed by the reference coefficients.
    pub fn default_start(&self, data: &RefinementData) -> Array1<f64> {
        let mut p = Array1::zeros(self.len());
        if let Some(coeffs) = &data.context().forward_coefficients {
            if self.n_fm > 0 {
                p.slice_mut(s![self.n_ff..]).assign(coeffs);
            }
        }
        p
    }

    /// # Errors
    /// - [`RefineError::ParameterVectorMismatch`] if `params` has the wrong length.
    pub fn check(&self, params: &Array1<f64>) -> RefineResult<()> {
        if params.len() != self.len() {
            return Err(RefineError::ParameterVectorMismatch {
                expected: self.len(),
                found: params.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refinement::core::{
        context::GlobalContext,
        ensemble::Ensemble,
        reference::{ExpData, Reference},
    };
    use ndarray::array;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Offsets of kinds and ensembles, including two-sided widening.
    // - Kind order taken from the builder, not from the kind names.
    // - Parameter channels switched off by infinite strengths.
    // -------------------------------------------------------------------------

    fn data() -> RefinementData {
        let exp = |v: Array1<f64>| ExpData::new("k", v.clone(), Array1::ones(v.len())).unwrap();
        let a = Ensemble::builder("a", array![1.0, 1.0])
            .observable("x", array![[0.0, 1.0], [1.0, 2.0]], Reference::Equality(exp(array![0.5, 1.5])))
            .observable(
                "y",
                array![[0.0], [1.0]],
                Reference::two_sided("y", exp(array![0.0]), exp(array![1.0])).unwrap(),
            )
            .build()
            .unwrap();
        let b = Ensemble::builder("b", array![1.0])
            .observable("x", array![[3.0]], Reference::UpperBound(exp(array![2.0])))
            .build()
            .unwrap();
        let ctx = GlobalContext::new().with_ff_names(["q1", "q2"]).with_forward_coefficients(array![7.0]);
        RefinementData::new(ctx, vec![a, b]).unwrap()
    }

    #[test]
    // Purpose
    // -------
    // Offsets follow ensemble order, kind order and two-sided widening.
    //
    // Given
    // -----
    // - Ensemble `a` with 2 equality columns and one two-sided observable,
    //   ensemble `b` with one upper bound.
    //
    // Expect
    // ------
    // - `a` spans 0..4 (kind `y` at offset 2 with 2 columns), `b` spans 4..5.
    fn multiplier_layout_offsets() {
        let layout = MultiplierLayout::new(&data());
        assert_eq!(layout.len(), 5);
        assert_eq!(layout.ensemble(0).range(), 0..4);
        assert_eq!(layout.ensemble(0).kinds[1], KindSlot { kind: "y".into(), offset: 2, n_columns: 2 });
        assert_eq!(layout.ensemble(1).range(), 4..5);
        assert_eq!(layout.bounds()[4], LambdaBound::NonNegative);
        assert!(layout.check(&Array1::zeros(4)).is_err());
    }

    #[test]
    // Purpose
    // -------
    // Parameter channels follow the finite strengths.
    //
    // Given
    // -----
    // - Two force-field names and one forward coefficient.
    //
    // Expect
    // ------
    // - All finite: layout `[0, 0, 7]`; β infinite: `[7]`.
    fn parameter_layout_follows_hyperparameters() {
        let data = data();
        let full = ParameterLayout::new(&data, &Hyperparameters::new(1.0, 1.0, 1.0).unwrap());
        assert_eq!(full.default_start(&data), array![0.0, 0.0, 7.0]);
        let p = array![1.0, 2.0, 3.0];
        assert_eq!(full.split(&p).1, array![3.0]);

        let fm_only =
            ParameterLayout::new(&data, &Hyperparameters::new(1.0, f64::INFINITY, 1.0).unwrap());
        assert_eq!(fm_only.default_start(&data), array![7.0]);
    }

    #[test]
    // Purpose
    // -------
    // Kinds are laid out in the order they were added, not alphabetically.
    //
    // Given
    // -----
    // - One ensemble with kind `z` (one column) added before kind `a`
    //   (two columns).
    //
    // Expect
    // ------
    // - `z` at offset 0, `a` at offset 1.
    fn kinds_follow_insertion_order() {
        let exp = |v: Array1<f64>| ExpData::new("k", v.clone(), Array1::ones(v.len())).unwrap();
        let ens = Ensemble::builder("e", array![1.0, 1.0])
            .observable("z", array![[0.0], [1.0]], Reference::Equality(exp(array![0.5])))
            .observable("a", array![[0.0, 1.0], [1.0, 0.0]], Reference::Equality(exp(array![0.5, 0.5])))
            .build()
            .unwrap();
        let data = RefinementData::new(GlobalContext::new(), vec![ens]).unwrap();

        let layout = MultiplierLayout::new(&data);

        let kinds = &layout.ensemble(0).kinds;
        assert_eq!(kinds[0], KindSlot { kind: "z".into(), offset: 0, n_columns: 1 });
        assert_eq!(kinds[1], KindSlot { kind: "a".into(), offset: 1, n_columns: 2 });
    }
}
