//! Design power through the external regression.

use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use super::{ExperimentSettings, regression_or_neutral};
use crate::design::{Design, RegressionMode};
use crate::grouping::get_annotator_groups;
use crate::ordinal::OrdinalModel;
use crate::regression::{RegressionBackend, RegressionOutcome, SystemPair};
use crate::results::{DetectionSummary, PairPValue};

/// Sample `settings.trials` tables from `model` on `design` and regress each.
///
/// Outcomes come back in trial order.
async fn regress_trials(
    model: &OrdinalModel,
    design: &Design,
    mode: &RegressionMode,
    backend: &dyn RegressionBackend,
    settings: &ExperimentSettings,
) -> Vec<RegressionOutcome> {
    let mut outcomes: Vec<(usize, RegressionOutcome)> = stream::iter(0..settings.trials)
        .map(|trial| async move {
            let table = {
                let mut rng = settings.trial_rng(trial);
                let sample = model.sample(design, &mut rng);
                let groups = get_annotator_groups(&sample);
                sample.with_groups(&groups)
            };
            let outcome = regression_or_neutral(backend, &table, mode, trial).await;
            debug!(
                trial,
                detected = outcome.detected.len(),
                "Regression trial finished"
            );
            (trial, outcome)
        })
        .buffer_unordered(settings.concurrency())
        .collect()
        .await;

    outcomes.sort_by_key(|(trial, _)| *trial);
    outcomes.into_iter().map(|(_, outcome)| outcome).collect()
}

/// Every p-value the regression reports across `settings.trials` samples.
///
/// A trial that reports no p-values, including one whose regression failed,
/// contributes 1.0 for every system pair of the model.
pub async fn test_design_power(
    model: &OrdinalModel,
    design: &Design,
    mode: &RegressionMode,
    backend: &dyn RegressionBackend,
    settings: &ExperimentSettings,
) -> Vec<PairPValue> {
    info!(
        trials = settings.trials,
        slots = design.len(),
        mode = %mode,
        "Estimating design power"
    );
    let outcomes = regress_trials(model, design, mode, backend, settings).await;

    let mut rows = Vec::new();
    for outcome in outcomes {
        if outcome.p_values.is_empty() {
            for (i, j) in model.system_pairs() {
                rows.push(PairPValue {
                    left: model.systems()[i].clone(),
                    right: model.systems()[j].clone(),
                    p_value: 1.0,
                });
            }
            continue;
        }
        for ((left, right), p_value) in outcome.p_values {
            rows.push(PairPValue {
                left,
                right,
                p_value,
            });
        }
    }
    rows
}

/// How often each pair of interest is detected, in the given direction.
///
/// The summary also logs, per trial, the p-value of every pair of interest
/// in either orientation, or 1.0 when the regression did not report one.
pub async fn run_detection_power(
    model: &OrdinalModel,
    design: &Design,
    mode: &RegressionMode,
    pairs_of_interest: &[SystemPair],
    backend: &dyn RegressionBackend,
    settings: &ExperimentSettings,
) -> DetectionSummary {
    info!(
        trials = settings.trials,
        pairs = pairs_of_interest.len(),
        "Estimating detection power"
    );
    let outcomes = regress_trials(model, design, mode, backend, settings).await;

    let mut summary = DetectionSummary {
        trials: outcomes.len(),
        pairs: pairs_of_interest.to_vec(),
        ..Default::default()
    };
    for outcome in outcomes {
        for pair in pairs_of_interest {
            if outcome.detected.contains(pair) {
                *summary.counts.entry(pair.clone()).or_default() += 1;
            }
        }
        summary.p_value_log.push(
            pairs_of_interest
                .iter()
                .map(|(a, b)| outcome.p_value_for(a, b).unwrap_or(1.0))
                .collect(),
        );
    }
    for (pair, rate) in summary.rates() {
        info!(better = %pair.0, worse = %pair.1, rate, "Detection rate");
    }
    summary
}
