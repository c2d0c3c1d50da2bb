//! Experimental reference data and constraint types.
//!
//! Purpose
//! -------
//! Represent the experimental side of every observable kind: measured
//! values, uncertainties and the kind of constraint they impose on the
//! ensemble average (equality, upper bound, lower bound, two-sided window).
//!
//! Key behaviors
//! -------------
//! - [`ReferenceKind`] parses the tags `"="`, `"<"`, `">"`, `"><"`.
//! - [`Reference`] is a tagged enum so a two-sided kind always carries both
//!   its lower and upper data; a half-specified window cannot be built.
//! - [`Reference::expand`] produces the multiplier columns of the kind:
//!   one column per observable, or a LOWER block followed by an UPPER block
//!   for two-sided kinds, each with its admissible sign ([`LambdaBound`]).
//!
//! Invariants & assumptions
//! ------------------------
//! - Values are finite and uncertainties are finite and strictly positive.
//! - For two-sided kinds `lower <= upper` element-wise.
//! - The LOWER/UPPER column order produced by [`Reference::expand`] and
//!   [`Reference::expand_values`] is the only column order used anywhere in
//!   the crate.
//!
//! Conventions
//! -----------
//! - An upper bound (`"<"`, `⟨g⟩ <= v`) restricts its multiplier to `λ >= 0`;
//!   a lower bound (`">"`) restricts it to `λ <= 0`. The tilt is
//!   `exp(-λ·g)`, so a positive multiplier pushes the average down.
use crate::refinement::errors::{RefineError, RefineResult};
use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::str::FromStr;

/// Constraint type of an observable kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// `"="`: the average should match the value.
    Equality,
    /// `"<"`: the average should not exceed the value.
    UpperBound,
    /// `">"`: the average should not fall below the value.
    LowerBound,
    /// `"><"`: the average should lie inside `[lower, upper]`.
    TwoSided,
}

impl ReferenceKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ReferenceKind::Equality => "=",
            ReferenceKind::UpperBound => "<",
            ReferenceKind::LowerBound => ">",
            ReferenceKind::TwoSided => "><",
        }
    }
}

impl FromStr for ReferenceKind {
    type Err = RefineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "=" => Ok(ReferenceKind::Equality),
            "<" => Ok(ReferenceKind::UpperBound),
            ">" => Ok(ReferenceKind::LowerBound),
            "><" => Ok(ReferenceKind::TwoSided),
            other => Err(RefineError::MalformedReferenceTag { tag: other.to_string() }),
        }
    }
}

/// Side of a two-sided window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Lower,
    Upper,
}

/// Admissible sign of one multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LambdaBound {
    Free,
    NonNegative,
    NonPositive,
}

impl LambdaBound {
    /// `(lower, upper)` box for the inner solver.
    pub fn interval(&self) -> (f64, f64) {
        match self {
            LambdaBound::Free => (f64::NEG_INFINITY, f64::INFINITY),
            LambdaBound::NonNegative => (0.0, f64::INFINITY),
            LambdaBound::NonPositive => (f64::NEG_INFINITY, 0.0),
        }
    }

    /// `true` when `lambda` sits on the closed end of a half-line.
    pub fn is_pinned(&self, lambda: f64, tol: f64) -> bool {
        !matches!(self, LambdaBound::Free) && lambda.abs() <= tol
    }
}

/// Measured values and uncertainties of one kind (one entry per observable).
#[derive(Debug, Clone, PartialEq)]
pub struct ExpData {
    pub values: Array1<f64>,
    pub sigmas: Array1<f64>,
}

impl ExpData {
    /// Build validated data.
    ///
    /// # Errors
    /// - [`RefineError::ObservableCountMismatch`] if the two arrays differ in
    ///   length.
    /// - [`RefineError::InvalidReference`] for a non-finite value or a
    ///   non-positive / non-finite uncertainty.
    pub fn new(kind: &str, values: Array1<f64>, sigmas: Array1<f64>) -> RefineResult<Self> {
        if values.len() != sigmas.len() {
            return Err(RefineError::ObservableCountMismatch {
                ensemble: String::new(),
                kind: kind.to_string(),
                expected: values.len(),
                found: sigmas.len(),
            });
        }
        for (index, (&v, &s)) in values.iter().zip(sigmas.iter()).enumerate() {
            if !v.is_finite() {
                return Err(RefineError::InvalidReference {
                    kind: kind.to_string(),
                    index,
                    value: v,
                    reason: "value must be finite",
                });
            }
            if !s.is_finite() || s <= 0.0 {
                return Err(RefineError::InvalidReference {
                    kind: kind.to_string(),
                    index,
                    value: s,
                    reason: "uncertainty must be finite and positive",
                });
            }
        }
        Ok(Self { values, sigmas })
    }

    /// Build from an `n × 2` matrix of `(value, uncertainty)` rows.
    pub fn from_pairs(kind: &str, pairs: ArrayView2<f64>) -> RefineResult<Self> {
        if pairs.ncols() != 2 {
            return Err(RefineError::ObservableCountMismatch {
                ensemble: String::new(),
                kind: kind.to_string(),
                expected: 2,
                found: pairs.ncols(),
            });
        }
        Self::new(kind, pairs.column(0).to_owned(), pairs.column(1).to_owned())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn select(&self, idx: &[usize]) -> Self {
        Self { values: self.values.select(Axis(0), idx), sigmas: self.sigmas.select(Axis(0), idx) }
    }

    fn affine(&self, mean: ArrayView1<f64>, std: ArrayView1<f64>) -> Self {
        Self { values: (&self.values - &mean) / &std, sigmas: &self.sigmas / &std }
    }
}

/// Experimental reference of one observable kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    Equality(ExpData),
    UpperBound(ExpData),
    LowerBound(ExpData),
    TwoSided { lower: ExpData, upper: ExpData },
}

/// Multiplier columns of one or more kinds, in layout order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExpandedColumns {
    pub values: Array1<f64>,
    pub sigmas: Array1<f64>,
    pub bounds: Vec<LambdaBound>,
}

impl ExpandedColumns {
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// Append the columns of `other`.
    pub fn extend(&mut self, other: ExpandedColumns) {
        self.values = concatenate![Axis(0), self.values.view(), other.values.view()];
        self.sigmas = concatenate![Axis(0), self.sigmas.view(), other.sigmas.view()];
        self.bounds.extend(other.bounds);
    }
}

impl Reference {
    /// Build a reference from a type tag and the experimental data.
    ///
    /// Two-sided kinds require `upper`; it is ignored for the other kinds.
    ///
    /// # Errors
    /// - [`RefineError::InvalidReference`] if a two-sided kind lacks its
    ///   upper data.
    /// - [`RefineError::ObservableCountMismatch`] if the LOWER and UPPER data
    ///   differ in length.
    /// - [`RefineError::InconsistentBounds`] if `lower > upper` somewhere.
    pub fn new(
        name: &str, kind: ReferenceKind, data: ExpData, upper: Option<ExpData>,
    ) -> RefineResult<Self> {
        match kind {
            ReferenceKind::Equality => Ok(Reference::Equality(data)),
            ReferenceKind::UpperBound => Ok(Reference::UpperBound(data)),
            ReferenceKind::LowerBound => Ok(Reference::LowerBound(data)),
            ReferenceKind::TwoSided => {
                let upper = upper.ok_or(RefineError::InvalidReference {
                    kind: name.to_string(),
                    index: 0,
                    value: f64::NAN,
                    reason: "two-sided reference needs UPPER data",
                })?;
                Self::two_sided(name, data, upper)
            }
        }
    }

    /// Two-sided window `[lower, upper]`.
    pub fn two_sided(name: &str, lower: ExpData, upper: ExpData) -> RefineResult<Self> {
        if lower.len() != upper.len() {
            return Err(RefineError::ObservableCountMismatch {
                ensemble: String::new(),
                kind: name.to_string(),
                expected: lower.len(),
                found: upper.len(),
            });
        }
        for (index, (&lo, &hi)) in lower.values.iter().zip(upper.values.iter()).enumerate() {
            if lo > hi {
                return Err(RefineError::InconsistentBounds {
                    kind: name.to_string(),
                    index,
                    lower: lo,
                    upper: hi,
                });
            }
        }
        Ok(Reference::TwoSided { lower, upper })
    }

    pub fn kind(&self) -> ReferenceKind {
        match self {
            Reference::Equality(_) => ReferenceKind::Equality,
            Reference::UpperBound(_) => ReferenceKind::UpperBound,
            Reference::LowerBound(_) => ReferenceKind::LowerBound,
            Reference::TwoSided { .. } => ReferenceKind::TwoSided,
        }
    }

    /// Number of scalar observables.
    pub fn n_obs(&self) -> usize {
        match self {
            Reference::Equality(d) | Reference::UpperBound(d) | Reference::LowerBound(d) => d.len(),
            Reference::TwoSided { lower, .. } => lower.len(),
        }
    }

    /// Number of multiplier columns.
    pub fn n_columns(&self) -> usize {
        match self {
            Reference::TwoSided { .. } => 2 * self.n_obs(),
            _ => self.n_obs(),
        }
    }

    /// Multiplier columns of this kind with their admissible signs.
    pub fn expand(&self) -> ExpandedColumns {
        let block = |d: &ExpData, bound: LambdaBound| ExpandedColumns {
            values: d.values.clone(),
            sigmas: d.sigmas.clone(),
            bounds: vec![bound; d.len()],
        };
        match self {
            Reference::Equality(d) => block(d, LambdaBound::Free),
            Reference::UpperBound(d) => block(d, LambdaBound::NonNegative),
            Reference::LowerBound(d) => block(d, LambdaBound::NonPositive),
            Reference::TwoSided { lower, upper } => {
                let mut cols = block(lower, LambdaBound::NonPositive);
                cols.extend(block(upper, LambdaBound::NonNegative));
                cols
            }
        }
    }

    /// Observable matrix (`frames × n_obs`) widened to the multiplier columns.
    pub fn expand_values(&self, g: ArrayView2<f64>) -> Array2<f64> {
        match self {
            Reference::TwoSided { .. } => concatenate![Axis(1), g, g],
            _ => g.to_owned(),
        }
    }

    /// Side of each multiplier column of a two-sided kind.
    pub fn column_side(&self, column: usize) -> Option<Side> {
        match self {
            Reference::TwoSided { lower, .. } if column < lower.len() => Some(Side::Lower),
            Reference::TwoSided { .. } => Some(Side::Upper),
            _ => None,
        }
    }

    /// Restrict to the observables at `idx` (in the given order).
    pub fn select(&self, idx: &[usize]) -> Self {
        match self {
            Reference::Equality(d) => Reference::Equality(d.select(idx)),
            Reference::UpperBound(d) => Reference::UpperBound(d.select(idx)),
            Reference::LowerBound(d) => Reference::LowerBound(d.select(idx)),
            Reference::TwoSided { lower, upper } => {
                Reference::TwoSided { lower: lower.select(idx), upper: upper.select(idx) }
            }
        }
    }

    /// Apply `x ↦ (x - mean) / std` to values and `σ ↦ σ / std`.
    pub fn affine(&self, mean: ArrayView1<f64>, std: ArrayView1<f64>) -> Self {
        match self {
            Reference::Equality(d) => Reference::Equality(d.affine(mean, std)),
            Reference::UpperBound(d) => Reference::UpperBound(d.affine(mean, std)),
            Reference::LowerBound(d) => Reference::LowerBound(d.affine(mean, std)),
            Reference::TwoSided { lower, upper } => Reference::TwoSided {
                lower: lower.affine(mean, std),
                upper: upper.affine(mean, std),
            },
        }
    }
}
