//! Resampling and power experiment drivers.
//!
//! Every driver repeats independent trials: draw a sample (synthetic or a
//! group-preserving subsample), optionally aggregate, test, and accumulate.
//! Trial `i` owns a generator seeded from `(seed, i)`, so results do not
//! depend on how trials are scheduled.
//!
//! In-process trials fan out on the rayon pool. Trials that call the
//! regression collaborator run as concurrent futures bounded by
//! `max_concurrency`; a failed call is logged and treated as a trial with no
//! findings.

pub mod art;
pub mod power;
pub mod pseudo_power;
pub mod reliability;
pub mod type1;

pub use art::{art_pvalues, run_art_experiment, run_art_experiment_fixed_budget};
pub use power::{run_detection_power, test_design_power};
pub use pseudo_power::run_pseudo_power;
pub use reliability::{
    grouped_subsample_reliability, load_annotator_times, parse_annotator_times,
    split_half_reliability, time_reliability_curve,
};
pub use type1::type1_error_rates;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::annotations::AnnotationTable;
use crate::config::ExperimentConfig;
use crate::design::RegressionMode;
use crate::regression::{RegressionBackend, RegressionOutcome};

/// Knobs shared by the drivers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSettings {
    pub trials: usize,
    pub seed: u64,
    pub alpha: f64,
    pub art_trials: usize,
    pub max_concurrency: usize,
    pub samples_per_size: usize,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        Self::from(&ExperimentConfig::default())
    }
}

impl From<&ExperimentConfig> for ExperimentSettings {
    fn from(config: &ExperimentConfig) -> Self {
        Self {
            trials: config.trials,
            seed: config.seed,
            alpha: config.alpha,
            art_trials: config.art_trials,
            max_concurrency: config.max_concurrency,
            samples_per_size: config.samples_per_size,
        }
    }
}

const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

impl ExperimentSettings {
    pub fn with_trials(mut self, trials: usize) -> Self {
        self.trials = trials;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Generator owned by trial `trial`.
    pub fn trial_rng(&self, trial: usize) -> StdRng {
        StdRng::seed_from_u64(self.seed.wrapping_add(trial as u64))
    }

    /// Settings for the `point`-th design point of a sweep, with its own seed stream.
    pub fn at_point(&self, point: usize) -> Self {
        Self {
            seed: self.seed ^ (point as u64 + 1).wrapping_mul(SEED_STRIDE),
            ..*self
        }
    }

    pub(crate) fn concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }
}

/// Run one regression, degrading a failure to an empty outcome.
pub(crate) async fn regression_or_neutral(
    backend: &dyn RegressionBackend,
    table: &AnnotationTable,
    mode: &RegressionMode,
    trial: usize,
) -> RegressionOutcome {
    match backend.run_regression(table, mode).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(trial, error = %e, "Regression failed, treating trial as inconclusive");
            RegressionOutcome::default()
        }
    }
}
