//! Power of the approximate randomization test on group-aggregated scores.

use rayon::prelude::*;
use tracing::info;

use super::ExperimentSettings;
use crate::design::{Design, create_design};
use crate::error::{AnnoError, Result};
use crate::grouping::get_annotator_groups;
use crate::ordinal::OrdinalModel;
use crate::results::{DesignKey, PairPValue, PowerRow};
use crate::significance::{mean, paired_approximate_randomization_test};

/// Documents per block in the ART sweeps.
pub const ART_DOCUMENTS_PER_BLOCK: usize = 5;

/// ART p-values for every system pair over `settings.trials` samples.
///
/// Scores are averaged per (system, annotator group) before testing. In each
/// returned row `left` is the system with the higher mean.
pub fn art_pvalues(
    model: &OrdinalModel,
    design: &Design,
    settings: &ExperimentSettings,
) -> Result<Vec<PairPValue>> {
    let pairs = model.system_pairs();

    let per_trial = (0..settings.trials)
        .into_par_iter()
        .map(|trial| -> Result<Vec<PairPValue>> {
            let mut rng = settings.trial_rng(trial);
            let sample = model.sample(design, &mut rng);
            let groups = get_annotator_groups(&sample);
            let means = sample.with_groups(&groups).means_by_group()?;

            let mut rows = Vec::with_capacity(pairs.len());
            for &(i, j) in &pairs {
                let p_value = paired_approximate_randomization_test(
                    &means[i],
                    &means[j],
                    settings.art_trials,
                    &mut rng,
                )?;
                let (better, worse) = if mean(&means[j]) > mean(&means[i]) {
                    (j, i)
                } else {
                    (i, j)
                };
                rows.push(PairPValue {
                    left: model.systems()[better].clone(),
                    right: model.systems()[worse].clone(),
                    p_value,
                });
            }
            Ok(rows)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(per_trial.into_iter().flatten().collect())
}

fn keyed(key: DesignKey, rows: Vec<PairPValue>) -> impl Iterator<Item = PowerRow> {
    rows.into_iter().map(move |row| PowerRow {
        key,
        better: row.left,
        worse: row.right,
        p_value: row.p_value,
    })
}

/// Compare single-annotator blocks with `annotator_count`-annotator blocks
/// at equal effort.
///
/// Single-annotator runs use `annotator_count` times as many blocks, so both
/// arms collect the same number of judgments.
pub fn run_art_experiment(
    model: &OrdinalModel,
    annotator_count: usize,
    block_counts: &[usize],
    settings: &ExperimentSettings,
) -> Result<Vec<PowerRow>> {
    let mut arms = vec![1];
    if annotator_count != 1 {
        arms.push(annotator_count);
    }

    let mut rows = Vec::new();
    let mut point = 0;
    for n_annotators in arms {
        for &base_blocks in block_counts {
            let n_blocks = if n_annotators == 1 {
                base_blocks * annotator_count
            } else {
                base_blocks
            };
            info!(
                annotators = n_annotators,
                blocks = n_blocks,
                "Running ART design point"
            );
            let design = create_design(n_blocks, ART_DOCUMENTS_PER_BLOCK, n_annotators);
            let pvalues = art_pvalues(model, &design, &settings.at_point(point))?;
            let key = DesignKey::new(n_blocks, ART_DOCUMENTS_PER_BLOCK, n_annotators);
            rows.extend(keyed(key, pvalues));
            point += 1;
        }
    }
    Ok(rows)
}

/// ART power when a fixed per-annotator budget of documents is spread over
/// `n_blocks` blocks.
pub fn run_art_experiment_fixed_budget(
    model: &OrdinalModel,
    budget: usize,
    annotator_count: usize,
    block_counts: &[usize],
    settings: &ExperimentSettings,
) -> Result<Vec<PowerRow>> {
    let mut rows = Vec::new();
    for (point, &n_blocks) in block_counts.iter().enumerate() {
        if n_blocks == 0 || n_blocks > budget {
            return Err(AnnoError::invalid_input(format!(
                "cannot split a budget of {budget} documents over {n_blocks} blocks"
            )));
        }
        let documents = budget / n_blocks;
        info!(blocks = n_blocks, documents, "Running fixed-budget ART design point");
        let design = create_design(n_blocks, documents, annotator_count);
        let pvalues = art_pvalues(model, &design, &settings.at_point(point))?;
        let key = DesignKey {
            annotators: annotator_count,
            effort: budget * annotator_count,
            total_annotators: n_blocks * annotator_count,
        };
        rows.extend(keyed(key, pvalues));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ordinal::ModelCatalog;

    fn settings(trials: usize) -> ExperimentSettings {
        ExperimentSettings {
            trials,
            art_trials: 99,
            seed: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_art_pvalues_oriented_by_mean() {
        let model = ModelCatalog::builtin().get("likertD:multi_news").unwrap();
        let rows = art_pvalues(&model, &create_design(6, 5, 1), &settings(3)).unwrap();
        assert_eq!(rows.len(), 3 * 6);
        assert!(rows.iter().all(|r| r.p_value > 0.0 && r.p_value <= 1.0));
        // The reference summaries are rated far above the weakest system.
        let ref_vs_pg = rows
            .iter()
            .filter(|r| r.left == "__REFERENCE__" && r.right == "onmt_pg")
            .count();
        assert_eq!(ref_vs_pg, 3);
    }

    #[test]
    fn test_equal_effort_keys() {
        let model = ModelCatalog::builtin().get("likertD:multi_news").unwrap();
        let rows = run_art_experiment(&model, 3, &[2], &settings(2)).unwrap();
        let mut keys: Vec<DesignKey> = rows.iter().map(|r| r.key).collect();
        keys.dedup();
        assert_eq!(
            keys,
            vec![
                DesignKey {
                    annotators: 1,
                    effort: 30,
                    total_annotators: 6
                },
                DesignKey {
                    annotators: 3,
                    effort: 30,
                    total_annotators: 6
                },
            ]
        );
    }

    #[test]
    fn test_fixed_budget_keys() {
        let model = ModelCatalog::builtin().get("likertD:multi_news").unwrap();
        let rows = run_art_experiment_fixed_budget(&model, 20, 3, &[2, 4], &settings(1)).unwrap();
        assert_eq!(rows.len(), 2 * 6);
        assert_eq!(rows[0].key.effort, 60);
        assert_eq!(rows[0].key.total_annotators, 6);
        assert_eq!(rows[6].key.total_annotators, 12);
    }

    #[test]
    fn test_fixed_budget_rejects_more_blocks_than_budget() {
        let model = ModelCatalog::builtin().get("likertD:multi_news").unwrap();
        assert!(run_art_experiment_fixed_budget(&model, 3, 3, &[4], &settings(1)).is_err());
        assert!(run_art_experiment_fixed_budget(&model, 3, 3, &[0], &settings(1)).is_err());
    }
}
