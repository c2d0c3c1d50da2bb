//! Core data model and numerical kernels of ensemble refinement.
//!
//! - [`reference`]: experimental references and their multiplier columns.
//! - [`ensemble`], [`context`]: validated ensembles and the dataset.
//! - [`layout`]: flattening order of multipliers and parameters.
//! - [`hyperparams`]: the strengths α, β, γ.
//! - [`reweight`], [`gamma`], [`metric`]: tilting, the dual objective and χ².
//! - [`normalization`], [`regularization`]: observable scaling and penalties.
pub mod context;
pub mod ensemble;
pub mod gamma;
pub mod hyperparams;
pub mod layout;
pub mod metric;
pub mod normalization;
pub mod reference;
pub mod regularization;
pub mod reweight;

pub use self::context::{Cycle, GlobalContext, RefinementData};
pub use self::ensemble::{CorrectionModel, Ensemble, ForwardFn, ForwardQuantities};
pub use self::hyperparams::Hyperparameters;
pub use self::layout::{MultiplierLayout, ParameterLayout};
pub use self::reference::{ExpData, Reference, ReferenceKind};
pub use self::regularization::{FfRegularization, FmRegularization, Regularization};
pub use self::reweight::{reweight, Reweighted};
