//! Train / validation / test splits of a refinement dataset.
//!
//! Purpose
//! -------
//! Hold out, per ensemble, a share of frames and a share of scalar
//! observables, and build the three views the cross-validation works on:
//!
//! - **train**: trained observables on trained frames;
//! - **validation**: trained observables on held-out frames;
//! - **test**: every observable on held-out frames (or on all frames with
//!   `all_frames_test`); only the new observables are scored.
//!
//! Key behaviors
//! -------------
//! - Frames are drawn uniformly or by whole blocks ([`BlockLayout`]) so
//!   correlated stretches of a trajectory stay on one side.
//! - Draws use `StdRng::seed_from_u64(seed)` and walk the ensembles in
//!   order, so a seed fixes the split.
//! - Explicit [`SplitIndices`] bypass the draw.
//! - [`SplitData::embed_lambda`] scatters trained multipliers into the test
//!   layout, with zeros for the new observables.
//!
//! Invariants
//! ----------
//! - Per ensemble, train and test frames partition `0..n_frames` and train
//!   and test observables partition every kind.
//! - Every ensemble keeps at least one trained frame, one held-out frame and
//!   (when it has observables) one trained observable.
use crate::refinement::{
    core::{
        context::RefinementData,
        ensemble::{Ensemble, ObservableSelection},
        layout::MultiplierLayout,
        reference::Reference,
    },
    errors::{RefineError, RefineResult},
};
use ndarray::Array1;
use rand::{rngs::StdRng, seq::index::sample, seq::SliceRandom, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};

/// How frames are grouped when drawing held-out frames.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockLayout {
    /// Every ensemble cut into `n_blocks` contiguous blocks of near-equal size.
    Contiguous { n_blocks: usize },
    /// Per-ensemble block label of every frame; ensembles not listed are
    /// drawn frame by frame.
    Labels(BTreeMap<String, Vec<usize>>),
}

/// Settings of a random split.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitOptions {
    pub test_frames_fraction: f64,
    pub test_obs_fraction: f64,
    pub seed: u64,
    pub blocks: Option<BlockLayout>,
    /// Score the new observables on every frame instead of the held-out ones.
    pub all_frames_test: bool,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            test_frames_fraction: 0.2,
            test_obs_fraction: 0.2,
            seed: 0,
            blocks: None,
            all_frames_test: false,
        }
    }
}

impl SplitOptions {
    /// # Errors
    /// - [`RefineError::InvalidFraction`] unless both fractions lie in `(0, 1)`.
    pub fn new(test_frames_fraction: f64, test_obs_fraction: f64, seed: u64) -> RefineResult<Self> {
        let opts = Self { test_frames_fraction, test_obs_fraction, seed, ..Self::default() };
        opts.validate()?;
        Ok(opts)
    }

    pub fn with_blocks(mut self, blocks: BlockLayout) -> Self {
        self.blocks = Some(blocks);
        self
    }

    pub fn with_all_frames_test(mut self, all_frames_test: bool) -> Self {
        self.all_frames_test = all_frames_test;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> RefineResult<()> {
        for (name, value) in [
            ("test_frames_fraction", self.test_frames_fraction),
            ("test_obs_fraction", self.test_obs_fraction),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(RefineError::InvalidFraction { name, value });
            }
        }
        Ok(())
    }
}

/// Chosen indices of one ensemble. Frame lists are sorted.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnsembleSplit {
    pub train_frames: Vec<usize>,
    pub test_frames: Vec<usize>,
    /// Positions per kind, sorted.
    pub train_obs: ObservableSelection,
    pub test_obs: ObservableSelection,
}

/// Chosen indices of every ensemble, in dataset order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SplitIndices {
    pub ensembles: Vec<EnsembleSplit>,
}

/// The three views of a split plus the indices that produced them.
#[derive(Debug, Clone)]
pub struct SplitData {
    pub indices: SplitIndices,
    pub train: RefinementData,
    pub validation: RefinementData,
    pub test: RefinementData,
    pub all_frames_test: bool,
}

impl SplitData {
    /// Selection of the new observables in the test view, per ensemble.
    pub fn test_selection(&self) -> Vec<ObservableSelection> {
        self.indices.ensembles.iter().map(|e| e.test_obs.clone()).collect()
    }

    /// Scatter multipliers of the train layout into the test layout.
    ///
    /// # Errors
    /// - [`RefineError::MultiplierDimMismatch`] if `lambda` does not follow
    ///   the train layout.
    pub fn embed_lambda(&self, lambda: &Array1<f64>) -> RefineResult<Array1<f64>> {
        let train = MultiplierLayout::new(&self.train);
        train.check(lambda)?;
        let test = MultiplierLayout::new(&self.test);
        let mut out = Array1::zeros(test.len());

        for (e, (tr_slot, te_slot)) in train.ensembles().iter().zip(test.ensembles()).enumerate() {
            let ens = &self.test.ensembles()[e];
            let picks = &self.indices.ensembles[e].train_obs;
            for tr_kind in &tr_slot.kinds {
                let Some(te_kind) = te_slot.kinds.iter().find(|k| k.kind == tr_kind.kind) else {
                    continue;
                };
                let Some(positions) = picks.get(&tr_kind.kind) else { continue };
                let two_sided = ens
                    .kind(&tr_kind.kind)
                    .is_some_and(|k| matches!(k.reference, Reference::TwoSided { .. }));
                let n_train = positions.len();
                let n_full = if two_sided { te_kind.n_columns / 2 } else { te_kind.n_columns };
                for (j, &pos) in positions.iter().enumerate() {
                    out[te_kind.offset + pos] = lambda[tr_kind.offset + j];
                    if two_sided {
                        out[te_kind.offset + n_full + pos] = lambda[tr_kind.offset + n_train + j];
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Draw indices with `opts` and build the views.
///
/// # Errors
/// - Validation errors of [`SplitOptions`].
/// - [`RefineError::InvalidSplit`] if an ensemble is too small to keep
///   frames on both sides.
/// - [`RefineError::InvalidBlocks`] for unusable block layouts.
pub fn split(data: &RefinementData, opts: &SplitOptions) -> RefineResult<SplitData> {
    let indices = draw_indices(data, opts)?;
    split_with(data, indices, opts.all_frames_test)
}

/// Random indices for every ensemble.
///
/// # Errors
/// - See [`split`].
pub fn draw_indices(data: &RefinementData, opts: &SplitOptions) -> RefineResult<SplitIndices> {
    opts.validate()?;
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let ensembles = data
        .ensembles()
        .iter()
        .map(|ens| {
            let test_frames = match &opts.blocks {
                Some(blocks) => match block_labels(ens, blocks)? {
                    Some(labels) => draw_blocks(ens.name(), &labels, opts.test_frames_fraction, &mut rng)?,
                    None => draw_frames(ens, opts.test_frames_fraction, &mut rng)?,
                },
                None => draw_frames(ens, opts.test_frames_fraction, &mut rng)?,
            };
            let (train_obs, test_obs) = draw_observables(ens, opts.test_obs_fraction, &mut rng);
            Ok(complete(ens, test_frames, train_obs, test_obs))
        })
        .collect::<RefineResult<_>>()?;
    Ok(SplitIndices { ensembles })
}

/// Build the views from explicit indices.
///
/// # Errors
/// - [`RefineError::InvalidSplit`] if the indices do not match the dataset
///   (count, range, overlap, or an empty side).
pub fn split_with(data: &RefinementData, indices: SplitIndices, all_frames_test: bool) -> RefineResult<SplitData> {
    if indices.ensembles.len() != data.ensembles().len() {
        return Err(RefineError::InvalidSplit {
            ensemble: String::new(),
            reason: format!(
                "{} index sets for {} ensembles",
                indices.ensembles.len(),
                data.ensembles().len()
            ),
        });
    }
    let mut train = Vec::new();
    let mut validation = Vec::new();
    let mut test = Vec::new();
    for (ens, idx) in data.ensembles().iter().zip(&indices.ensembles) {
        check_partition(ens, idx)?;
        let held_out = ens.select_frames(&idx.test_frames)?;
        train.push(ens.select_frames(&idx.train_frames)?.select_observables(&idx.train_obs)?);
        validation.push(held_out.select_observables(&idx.train_obs)?);
        test.push(if all_frames_test { ens.clone() } else { held_out });
    }
    let ctx = data.context().clone();
    Ok(SplitData {
        indices,
        train: RefinementData::from_parts(ctx.clone(), train),
        validation: RefinementData::from_parts(ctx.clone(), validation),
        test: RefinementData::from_parts(ctx, test),
        all_frames_test,
    })
}

fn invalid(ens: &Ensemble, reason: impl Into<String>) -> RefineError {
    RefineError::InvalidSplit { ensemble: ens.name().to_string(), reason: reason.into() }
}

fn n_test_frames(name: &str, n: usize, fraction: f64) -> RefineResult<usize> {
    let k = (fraction * n as f64).round() as usize;
    if k == 0 || k >= n {
        return Err(RefineError::InvalidSplit {
            ensemble: name.to_string(),
            reason: format!("{k} held-out frames out of {n}"),
        });
    }
    Ok(k)
}

fn draw_frames(ens: &Ensemble, fraction: f64, rng: &mut StdRng) -> RefineResult<Vec<usize>> {
    let n = ens.n_frames();
    let k = n_test_frames(ens.name(), n, fraction)?;
    let mut picked = sample(rng, n, k).into_vec();
    picked.sort_unstable();
    Ok(picked)
}

fn block_labels(ens: &Ensemble, blocks: &BlockLayout) -> RefineResult<Option<Vec<usize>>> {
    let n = ens.n_frames();
    match blocks {
        BlockLayout::Contiguous { n_blocks } => {
            if *n_blocks < 2 || *n_blocks > n {
                return Err(RefineError::InvalidBlocks {
                    ensemble: ens.name().to_string(),
                    reason: format!("{n_blocks} blocks for {n} frames"),
                });
            }
            Ok(Some((0..n).map(|i| i * n_blocks / n).collect()))
        }
        BlockLayout::Labels(map) => match map.get(ens.name()) {
            Some(labels) if labels.len() != n => Err(RefineError::InvalidBlocks {
                ensemble: ens.name().to_string(),
                reason: format!("{} labels for {n} frames", labels.len()),
            }),
            Some(labels) => Ok(Some(labels.clone())),
            None => Ok(None),
        },
    }
}

fn draw_blocks(name: &str, labels: &[usize], fraction: f64, rng: &mut StdRng) -> RefineResult<Vec<usize>> {
    let mut ids: Vec<usize> = labels.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    if ids.len() < 2 {
        return Err(RefineError::InvalidBlocks {
            ensemble: name.to_string(),
            reason: "at least two blocks are needed".to_string(),
        });
    }
    let k = ((fraction * ids.len() as f64).round() as usize).clamp(1, ids.len() - 1);
    ids.shuffle(rng);
    let held: BTreeSet<usize> = ids.into_iter().take(k).collect();
    Ok(labels.iter().enumerate().filter(|(_, b)| held.contains(b)).map(|(i, _)| i).collect())
}

fn draw_observables(
    ens: &Ensemble, fraction: f64, rng: &mut StdRng,
) -> (ObservableSelection, ObservableSelection) {
    let flat: Vec<(&str, usize)> = ens
        .kinds()
        .iter()
        .flat_map(|k| (0..k.n_obs()).map(move |j| (k.name.as_str(), j)))
        .collect();
    let n = flat.len();
    let k = if n == 0 { 0 } else { ((fraction * n as f64).round() as usize).min(n - 1) };
    let held: BTreeSet<usize> = sample(rng, n, k).into_iter().collect();

    let mut train = ObservableSelection::new();
    let mut test = ObservableSelection::new();
    for kind in ens.kinds() {
        train.insert(kind.name.clone(), Vec::new());
        test.insert(kind.name.clone(), Vec::new());
    }
    for (i, (kind, j)) in flat.into_iter().enumerate() {
        let side = if held.contains(&i) { &mut test } else { &mut train };
        if let Some(list) = side.get_mut(kind) {
            list.push(j);
        }
    }
    (train, test)
}

fn complete(
    ens: &Ensemble, test_frames: Vec<usize>, train_obs: ObservableSelection, test_obs: ObservableSelection,
) -> EnsembleSplit {
    let held: BTreeSet<usize> = test_frames.iter().copied().collect();
    let train_frames = (0..ens.n_frames()).filter(|i| !held.contains(i)).collect();
    EnsembleSplit { train_frames, test_frames, train_obs, test_obs }
}

fn check_partition(ens: &Ensemble, idx: &EnsembleSplit) -> RefineResult<()> {
    let n = ens.n_frames();
    if idx.train_frames.is_empty() || idx.test_frames.is_empty() {
        return Err(invalid(ens, "both sides need at least one frame"));
    }
    let mut seen = vec![false; n];
    for &i in idx.train_frames.iter().chain(&idx.test_frames) {
        if i >= n {
            return Err(invalid(ens, format!("frame {i} out of range")));
        }
        if std::mem::replace(&mut seen[i], true) {
            return Err(invalid(ens, format!("frame {i} on both sides")));
        }
    }
    if seen.iter().any(|s| !s) {
        return Err(invalid(ens, "frames missing from the split"));
    }

    for kind in ens.kinds() {
        let train = idx.train_obs.get(&kind.name).map_or(&[][..], Vec::as_slice);
        let test = idx.test_obs.get(&kind.name).map_or(&[][..], Vec::as_slice);
        let mut seen = vec![false; kind.n_obs()];
        for &j in train.iter().chain(test) {
            if j >= kind.n_obs() || std::mem::replace(&mut seen[j], true) {
                return Err(invalid(ens, format!("observable {j} of '{}' is not a partition index", kind.name)));
            }
        }
        if seen.iter().any(|s| !s) {
            return Err(invalid(ens, format!("observables of '{}' missing from the split", kind.name)));
        }
    }
    if ens.n_obs() > 0 && idx.train_obs.values().all(Vec::is_empty) {
        return Err(invalid(ens, "no trained observable left"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refinement::core::{
        context::GlobalContext,
        reference::{ExpData, Reference},
    };
    use ndarray::{array, Array2};

    // -------------------------------------------------------------------------
    // Scope
    // -----
    // These tests cover:
    // - Partition and determinism of random and block draws.
    // - The three views and the multiplier embedding.
    // - Rejection of unusable fractions and explicit indices.
    // -------------------------------------------------------------------------

    fn data() -> RefinementData {
        let g = Array2::from_shape_fn((10, 4), |(i, j)| (i * 4 + j) as f64);
        let eq = Reference::Equality(
            ExpData::new("x", array![1.0, 2.0, 3.0, 4.0], array![1.0, 1.0, 1.0, 1.0]).unwrap(),
        );
        let two = Reference::two_sided(
            "y",
            ExpData::new("y", array![0.0, 0.0], array![1.0, 1.0]).unwrap(),
            ExpData::new("y", array![5.0, 5.0], array![1.0, 1.0]).unwrap(),
        )
        .unwrap();
        let ens = Ensemble::builder("a", Array1::ones(10))
            .observable("x", g.clone(), eq)
            .observable("y", g.slice(ndarray::s![.., ..2]).to_owned(), two)
            .build()
            .unwrap();
        RefinementData::new(GlobalContext::new(), vec![ens]).unwrap()
    }

    #[test]
    // Purpose
    // -------
    // A seeded split partitions frames and observables and is reproducible.
    //
    // Given
    // -----
    // - 10 frames, 6 observables, fractions 0.3 / 0.3, seed 7 twice.
    //
    // Expect
    // ------
    // - 3 held-out frames, 2 held-out observables, identical indices on
    //   the second draw, union of both sides equals everything once.
    fn random_split_partitions_and_repeats() {
        let data = data();
        let opts = SplitOptions::new(0.3, 0.3, 7).unwrap();
        let a = draw_indices(&data, &opts).unwrap();
        let b = draw_indices(&data, &opts).unwrap();
        assert_eq!(a, b);

        let e = &a.ensembles[0];
        assert_eq!(e.test_frames.len(), 3);
        let mut frames: Vec<usize> = e.train_frames.iter().chain(&e.test_frames).copied().collect();
        frames.sort_unstable();
        assert_eq!(frames, (0..10).collect::<Vec<_>>());

        let held: usize = e.test_obs.values().map(Vec::len).sum();
        assert_eq!(held, 2);
        for (kind, n) in [("x", 4), ("y", 2)] {
            let mut all: Vec<usize> = e.train_obs[kind].iter().chain(&e.test_obs[kind]).copied().collect();
            all.sort_unstable();
            assert_eq!(all, (0..n).collect::<Vec<_>>());
        }
    }

    #[test]
    // Purpose
    // -------
    // Block draws hold out whole blocks.
    //
    // Given
    // -----
    // - 10 frames in 5 contiguous blocks, fraction 0.4.
    //
    // Expect
    // ------
    // - 4 held-out frames forming two complete pairs `{2b, 2b+1}`.
    fn block_split_keeps_blocks_together() {
        let data = data();
        let opts = SplitOptions::new(0.4, 0.2, 3).unwrap().with_blocks(BlockLayout::Contiguous { n_blocks: 5 });
        let idx = draw_indices(&data, &opts).unwrap();
        let test = &idx.ensembles[0].test_frames;
        assert_eq!(test.len(), 4);
        for &i in test {
            assert!(test.contains(&(i ^ 1)));
        }
    }

    #[test]
    // Purpose
    // -------
    // Views carry the right shapes and the embedding scatters trained
    // multipliers, including both halves of two-sided kinds.
    //
    // Given
    // -----
    // - Explicit indices: frames 0..7 train, 7..10 test; `x` positions
    //   `[0, 2]` and `y` position `[1]` trained.
    //
    // Expect
    // ------
    // - Train view: 7 frames, 2 + 1 observables; test view: 3 frames, all 6.
    // - Embedded multipliers put trained values at their original columns.
    fn views_and_embedding() {
        let data = data();
        let sel = |x: Vec<usize>, y: Vec<usize>| -> ObservableSelection {
            [("x".to_string(), x), ("y".to_string(), y)].into_iter().collect()
        };
        let indices = SplitIndices {
            ensembles: vec![EnsembleSplit {
                train_frames: (0..7).collect(),
                test_frames: (7..10).collect(),
                train_obs: sel(vec![0, 2], vec![1]),
                test_obs: sel(vec![1, 3], vec![0]),
            }],
        };
        let s = split_with(&data, indices, false).unwrap();
        assert_eq!(s.train.ensembles()[0].n_frames(), 7);
        assert_eq!(s.train.ensembles()[0].n_obs(), 3);
        assert_eq!(s.validation.ensembles()[0].n_frames(), 3);
        assert_eq!(s.test.ensembles()[0].n_obs(), 6);

        // train columns: x0, x2, y1(lower), y1(upper)
        let lambda = array![1.0, 2.0, -3.0, 4.0];
        let full = s.embed_lambda(&lambda).unwrap();
        // test columns: x0..x3, y0(l), y1(l), y0(u), y1(u)
        assert_eq!(full, array![1.0, 0.0, 2.0, 0.0, 0.0, -3.0, 0.0, 4.0]);
    }

    #[test]
    // Purpose
    // -------
    // Unusable settings are rejected.
    //
    // Given
    // -----
    // - Fraction 1.0; fraction 0.01 on 10 frames; overlapping explicit frames.
    //
    // Expect
    // ------
    // - `InvalidFraction`, then `InvalidSplit` twice.
    fn rejects_degenerate_splits() {
        let data = data();
        assert!(matches!(SplitOptions::new(1.0, 0.2, 0), Err(RefineError::InvalidFraction { .. })));
        let opts = SplitOptions::new(0.01, 0.2, 0).unwrap();
        assert!(matches!(split(&data, &opts), Err(RefineError::InvalidSplit { .. })));

        let all: ObservableSelection = [("x".to_string(), vec![0, 1, 2, 3]), ("y".to_string(), vec![0, 1])]
            .into_iter()
            .collect();
        let indices = SplitIndices {
            ensembles: vec![EnsembleSplit {
                train_frames: (0..7).collect(),
                test_frames: (6..10).collect(),
                train_obs: all,
                test_obs: ObservableSelection::new(),
            }],
        };
        assert!(matches!(split_with(&data, indices, false), Err(RefineError::InvalidSplit { .. })));
    }
}
