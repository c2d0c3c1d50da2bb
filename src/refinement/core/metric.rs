//! Observable matching metric: averages, deviations and χ².
//!
//! Deviations are measured in units of the experimental uncertainty:
//!
//! | kind | deviation |
//! |------|-----------|
//! | `=`  | `(⟨g⟩ - v) / σ` |
//! | `<`  | `max(⟨g⟩ - v, 0) / σ` |
//! | `>`  | `min(⟨g⟩ - v, 0) / σ` |
//! | `><` | `min(⟨g⟩ - lo, 0) / σ_lo + max(⟨g⟩ - up, 0) / σ_up` |
//!
//! A two-sided deviation is the sum of its one-sided parts. With
//! `lo <= up` (enforced when references are built) at most one part is
//! non-zero; crossed windows are still summed without failing.
use crate::refinement::core::{
    ensemble::ObservableSelection,
    reference::{ExpData, Reference},
};
use ndarray::{Array1, ArrayView1, ArrayView2, Zip};
use std::collections::BTreeMap;

/// Metric of one observable kind.
#[derive(Debug, Clone, PartialEq)]
pub struct KindMetric {
    pub average: Array1<f64>,
    pub deviation: Array1<f64>,
    pub chi2: f64,
}

/// Metric of all kinds of one ensemble.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricReport {
    pub kinds: BTreeMap<String, KindMetric>,
    pub chi2: f64,
}

impl MetricReport {
    /// χ² restricted to the selected observables (positions within each kind).
    pub fn chi2_of(&self, selection: &ObservableSelection) -> f64 {
        selection
            .iter()
            .filter_map(|(kind, idx)| self.kinds.get(kind).map(|m| (m, idx)))
            .map(|(m, idx)| idx.iter().map(|&i| m.deviation[i].powi(2)).sum::<f64>())
            .sum()
    }
}

fn one_sided(average: ArrayView1<f64>, data: &ExpData, clip: fn(f64) -> f64) -> Array1<f64> {
    let mut out = Array1::zeros(average.len());
    Zip::from(&mut out).and(&average).and(&data.values).and(&data.sigmas).for_each(
        |d, &a, &v, &s| {
            *d = clip(a - v) / s;
        },
    );
    out
}

/// Signed deviations of the averages from the reference.
pub fn deviations(reference: &Reference, average: ArrayView1<f64>) -> Array1<f64> {
    match reference {
        Reference::Equality(d) => one_sided(average, d, |x| x),
        Reference::UpperBound(d) => one_sided(average, d, |x| x.max(0.0)),
        Reference::LowerBound(d) => one_sided(average, d, |x| x.min(0.0)),
        Reference::TwoSided { lower, upper } => {
            one_sided(average, lower, |x| x.min(0.0)) + one_sided(average, upper, |x| x.max(0.0))
        }
    }
}

/// Average, deviation and χ² of one kind under `weights`.
pub fn kind_metric(reference: &Reference, weights: ArrayView1<f64>, g: ArrayView2<f64>) -> KindMetric {
    let average = weights.dot(&g);
    let deviation = deviations(reference, average.view());
    let chi2 = deviation.dot(&deviation);
    KindMetric { average, deviation, chi2 }
}

/// Metric of several kinds sharing the same weights.
pub fn compute_chi2<'a, I>(kinds: I, weights: ArrayView1<f64>) -> MetricReport
where
    I: IntoIterator<Item = (&'a str, &'a Reference, ArrayView2<'a, f64>)>,
{
    let mut report = MetricReport::default();
    for (name, reference, g) in kinds {
        let m = kind_metric(reference, weights, g);
        report.chi2 += m.chi2;
        report.kinds.insert(name.to_string(), m);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Deviations of every reference kind, including a crossed window.
    // - χ² totals and restriction to an observable subset.
    // -------------------------------------------------------------------------

    fn exp(v: f64, s: f64) -> ExpData {
        ExpData::new("k", array![v], array![s]).unwrap()
    }

    #[test]
    // Purpose
    // -------
    // One-sided kinds only count violations; equality counts both signs.
    //
    // Given
    // -----
    // - Average 2.5 against value 2 with σ = 0.5.
    //
    // Expect
    // ------
    // - `=`: 1, `<`: 1, `>`: 0.
    fn deviations_follow_reference_kind() {
        let avg = array![2.5];
        assert_eq!(deviations(&Reference::Equality(exp(2.0, 0.5)), avg.view())[0], 1.0);
        assert_eq!(deviations(&Reference::UpperBound(exp(2.0, 0.5)), avg.view())[0], 1.0);
        assert_eq!(deviations(&Reference::LowerBound(exp(2.0, 0.5)), avg.view())[0], 0.0);
    }

    #[test]
    // Purpose
    // -------
    // Two-sided deviations are zero inside the window, one-sided outside,
    // and summed for a crossed window.
    //
    // Given
    // -----
    // - Window `[1, 3]` (σ 0.5 and 1) and averages 2, 0, 4.
    // - A crossed window `[3, 1]` built directly and average 2.
    //
    // Expect
    // ------
    // - 0, -2, 1; crossed: `-1/σ_lo + 1/σ_up = -2 + 1 = -1`.
    fn two_sided_deviation_sums_both_sides() {
        let window = Reference::two_sided("k", exp(1.0, 0.5), exp(3.0, 1.0)).unwrap();
        let d = deviations(&window, array![2.0].view());
        assert_eq!(d[0], 0.0);
        assert_eq!(deviations(&window, array![0.0].view())[0], -2.0);
        assert_eq!(deviations(&window, array![4.0].view())[0], 1.0);

        let crossed = Reference::TwoSided { lower: exp(3.0, 0.5), upper: exp(1.0, 1.0) };
        assert_eq!(deviations(&crossed, array![2.0].view())[0], -1.0);
    }

    #[test]
    // Purpose
    // -------
    // χ² adds over kinds and the subset χ² picks single observables.
    //
    // Given
    // -----
    // - Uniform weights on frames `g = [[1, 0], [3, 0]]`, an equality kind
    //   with two observables (values 1 and 0, σ = 1).
    //
    // Expect
    // ------
    // - Averages `[2, 0]`, χ² = 1, subset `{a: [1]}` gives 0.
    fn chi2_totals_and_subsets() {
        let reference = Reference::Equality(
            ExpData::new("a", array![1.0, 0.0], array![1.0, 1.0]).unwrap(),
        );
        let g = array![[1.0, 0.0], [3.0, 0.0]];
        let w = array![0.5, 0.5];
        let report = compute_chi2([("a", &reference, g.view())], w.view());
        assert_abs_diff_eq!(report.chi2, 1.0, epsilon = 1e-15);
        assert_eq!(report.kinds["a"].average, array![2.0, 0.0]);

        let sel: ObservableSelection = [("a".to_string(), vec![1])].into_iter().collect();
        assert_eq!(report.chi2_of(&sel), 0.0);
    }
}
