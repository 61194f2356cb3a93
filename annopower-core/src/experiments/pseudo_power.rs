//! Pseudo power: how well subsamples of real annotations reproduce the
//! differences found on the full data.

use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use tracing::{debug, info};

use super::{ExperimentSettings, regression_or_neutral};
use crate::annotations::AnnotationTable;
use crate::design::{DesignMode, RegressionMode};
use crate::error::{AnnoError, Result};
use crate::grouping::{GroupSample, generate_samples, get_annotator_groups};
use crate::regression::{RegressionBackend, SystemPair};
use crate::results::PseudoPowerRow;

fn fraction(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

/// Compare regressions on group subsamples against the full-table regression.
///
/// The full table is always analysed as crossed; `mode` applies to the
/// subsamples only. The full-table differences are the reference; their
/// reversals are the contradictions. For every group count from 1 to one less than the number
/// of groups, up to `settings.samples_per_size` subsamples are regressed and
/// scored. A failure of the full-table regression is fatal; a failed
/// subsample regression counts as a sample with no findings.
pub async fn run_pseudo_power(
    annotations: &AnnotationTable,
    mode: &RegressionMode,
    backend: &dyn RegressionBackend,
    settings: &ExperimentSettings,
) -> Result<Vec<PseudoPowerRow>> {
    let groups = get_annotator_groups(annotations);
    let table = annotations.clone().with_groups(&groups);
    let nested = mode.design == DesignMode::Nested;

    let base_mode = RegressionMode {
        design: DesignMode::Crossed,
        ..mode.clone()
    };
    let base = backend
        .run_regression(&table, &base_mode)
        .await
        .map_err(AnnoError::from)?;
    let base_differences = base.detected.clone();
    let contradictory = base.reversed();
    info!(
        groups = groups.len(),
        differences = base_differences.len(),
        "Full-table regression finished"
    );

    let mut rows = Vec::new();
    for group_size in 1..groups.len() {
        let mut rng = settings.trial_rng(group_size);
        let samples: Vec<GroupSample> =
            generate_samples(&table, &groups, group_size, nested, &mut rng)
                .take(settings.samples_per_size)
                .collect();

        let detected: Vec<(usize, BTreeSet<SystemPair>)> = stream::iter(samples.iter().enumerate())
            .map(|(idx, sample)| async move {
                let outcome = regression_or_neutral(backend, &sample.table, mode, idx).await;
                (sample.annotator_count, outcome.detected)
            })
            .buffered(settings.concurrency())
            .collect()
            .await;

        for (num_annotators, found) in detected {
            let agrees = found.intersection(&base_differences).count();
            let contradictions = found.intersection(&contradictory).count();
            let new_differences = found
                .iter()
                .filter(|d| !base_differences.contains(*d) && !contradictory.contains(*d))
                .count();
            debug!(
                group_size,
                num_annotators, agrees, contradictions, new_differences, "Subsample scored"
            );
            rows.push(PseudoPowerRow {
                num_annotators,
                agree_fraction: fraction(agrees, base_differences.len()),
                contradiction_fraction: fraction(contradictions, contradictory.len()),
                new_differences,
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::Annotation;
    use crate::regression::ScriptedRegression;

    /// Four single-annotator groups, two documents each, two systems.
    fn annotations() -> AnnotationTable {
        let mut rows = Vec::new();
        for annotator in 0..4 {
            for document in [annotator * 2, annotator * 2 + 1] {
                for system in 0..2 {
                    rows.push(Annotation {
                        system,
                        annotator,
                        document,
                        score: (3 - system) as f64,
                    });
                }
            }
        }
        AnnotationTable::synthetic(vec!["A".into(), "B".into()], 4, 8, rows)
    }

    #[tokio::test]
    async fn test_rows_per_group_size() {
        let backend = ScriptedRegression::with_report("A - B\t+\n").unwrap();
        let settings = ExperimentSettings {
            samples_per_size: 10,
            max_concurrency: 3,
            ..Default::default()
        };
        let mode = RegressionMode::new(DesignMode::Nested);
        let rows = run_pseudo_power(&annotations(), &mode, &backend, &settings)
            .await
            .unwrap();

        // C(4,1) + C(4,2) + C(4,3) samples.
        assert_eq!(rows.len(), 4 + 6 + 4);
        assert!(rows.iter().all(|r| r.agree_fraction == 1.0));
        assert!(rows.iter().all(|r| r.contradiction_fraction == 0.0));
        assert!(rows.iter().all(|r| r.new_differences == 0));
        assert_eq!(rows[0].num_annotators, 1);
        assert_eq!(rows[13].num_annotators, 3);

        let calls = backend.calls();
        assert_eq!(calls.len(), 1 + 14);
        assert_eq!(calls[0], (16, "crossed".to_string()));
        assert!(calls[1..].iter().all(|(_, mode)| mode == "nested"));
    }

    #[tokio::test]
    async fn test_classifies_contradictions_and_new() {
        let backend = ScriptedRegression::new();
        backend.queue_report("A - B\t+\n").unwrap();
        backend.queue_report("A - B\t-\nA - C\t+\n").unwrap();
        let settings = ExperimentSettings {
            samples_per_size: 1,
            max_concurrency: 1,
            ..Default::default()
        };
        let mode = RegressionMode::new(DesignMode::Crossed);
        let rows = run_pseudo_power(&annotations(), &mode, &backend, &settings)
            .await
            .unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].agree_fraction, 0.0);
        assert_eq!(rows[0].contradiction_fraction, 1.0);
        assert_eq!(rows[0].new_differences, 1);
        // Later samples hit the empty fallback.
        assert_eq!(rows[1].agree_fraction, 0.0);
        assert_eq!(rows[1].new_differences, 0);
    }

    #[tokio::test]
    async fn test_base_failure_is_fatal() {
        let backend = ScriptedRegression::new();
        backend.queue_failure("R not installed");
        let settings = ExperimentSettings::default();
        let mode = RegressionMode::new(DesignMode::Crossed);
        let err = run_pseudo_power(&annotations(), &mode, &backend, &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, AnnoError::Regression(_)));
    }

    #[tokio::test]
    async fn test_empty_base_gives_zero_fractions() {
        let backend = ScriptedRegression::new();
        backend.queue_report("").unwrap();
        backend.queue_report("A - B\t+\n").unwrap();
        let settings = ExperimentSettings {
            samples_per_size: 1,
            max_concurrency: 1,
            ..Default::default()
        };
        let mode = RegressionMode::new(DesignMode::Crossed);
        let rows = run_pseudo_power(&annotations(), &mode, &backend, &settings)
            .await
            .unwrap();
        assert_eq!(rows[0].agree_fraction, 0.0);
        assert_eq!(rows[0].contradiction_fraction, 0.0);
        assert_eq!(rows[0].new_differences, 1);
    }
}
