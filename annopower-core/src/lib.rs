//! # annopower-core
//!
//! Power analysis for human evaluation studies that compare systems using
//! ordinal judgments from several annotators across blocked documents.
//!
//! The crate provides:
//! - a generative cumulative-link ordinal model with correlated annotator
//!   and document random effects ([`ordinal`]),
//! - blocked design generation ([`design`]),
//! - paired t and approximate randomization tests ([`significance`]),
//! - annotator grouping and group-preserving resampling ([`grouping`]),
//! - Monte Carlo drivers estimating type-I error, power and reliability
//!   ([`experiments`]), optionally through an external regression
//!   ([`regression`]).

pub mod annotations;
pub mod config;
pub mod design;
pub mod error;
pub mod experiments;
pub mod grouping;
pub mod ordinal;
pub mod regression;
pub mod results;
pub mod significance;

pub use annotations::{Annotation, AnnotationTable};
pub use config::{AnnoConfig, load_config};
pub use design::{Design, DesignMode, RegressionMode, create_design};
pub use error::{AnnoError, RegressionError, Result};
pub use experiments::ExperimentSettings;
pub use grouping::{AnnotatorGroup, get_annotator_groups};
pub use ordinal::{ModelCatalog, ModelDefinition, OrdinalModel};
pub use regression::{
    RegressionBackend, RegressionOutcome, ScriptRegression, ScriptedRegression, SystemPair,
};
pub use significance::SignificanceTest;
