//! Type-I error calibration of the in-process paired tests.

use rayon::prelude::*;
use tracing::{debug, info};

use super::ExperimentSettings;
use crate::design::create_design;
use crate::error::Result;
use crate::ordinal::OrdinalModel;
use crate::results::Type1Row;
use crate::significance::SignificanceTest;

/// Annotators per block in the calibration designs.
pub const TYPE1_ANNOTATORS_PER_BLOCK: usize = 3;

const KEYS: [&str; 4] = ["ttest_no_agg", "ttest_agg", "art_no_agg", "art_agg"];

/// Rate at which each test rejects a true null hypothesis.
///
/// The model's coefficients are zeroed, so every rejection is a false
/// positive. For each `(blocks, documents_per_block)` point, every trial
/// tests every system pair twice: on raw per-observation scores (`*_no_agg`)
/// and on per-document means (`*_agg`).
pub fn type1_error_rates(
    model: &OrdinalModel,
    blocks: &[(usize, usize)],
    settings: &ExperimentSettings,
) -> Result<Vec<Type1Row>> {
    let null_model = model.zero_coefficients();
    let pairs = null_model.system_pairs();
    let tests = [
        SignificanceTest::TTest,
        SignificanceTest::ApproximateRandomization {
            trials: settings.art_trials,
        },
    ];

    let mut rows = Vec::with_capacity(blocks.len() * KEYS.len());
    for (point, &(n_blocks, n_docs)) in blocks.iter().enumerate() {
        info!(blocks = n_blocks, documents = n_docs, "Estimating type-I error rates");
        let design = create_design(n_blocks, n_docs, TYPE1_ANNOTATORS_PER_BLOCK);
        let point_settings = settings.at_point(point);

        let rejections = (0..settings.trials)
            .into_par_iter()
            .map(|trial| -> Result<[usize; 4]> {
                let mut rng = point_settings.trial_rng(trial);
                let sample = null_model.sample(&design, &mut rng);
                let aggregated = sample.means_by_document();
                let mut counts = [0usize; 4];

                for &(i, j) in &pairs {
                    let raw_i = sample.scores_by_slot(i);
                    let raw_j = sample.scores_by_slot(j);
                    for (t, test) in tests.iter().enumerate() {
                        if test.p_value(&raw_i, &raw_j, &mut rng)? < settings.alpha {
                            counts[2 * t] += 1;
                        }
                        if test.p_value(&aggregated[i], &aggregated[j], &mut rng)? < settings.alpha {
                            counts[2 * t + 1] += 1;
                        }
                    }
                }
                Ok(counts)
            })
            .try_reduce(
                || [0usize; 4],
                |mut acc, counts| {
                    for (a, c) in acc.iter_mut().zip(counts) {
                        *a += c;
                    }
                    Ok(acc)
                },
            )?;

        let comparisons = settings.trials * pairs.len();
        for (key, count) in KEYS.iter().zip(rejections) {
            let rate = if comparisons == 0 {
                0.0
            } else {
                count as f64 / comparisons as f64
            };
            debug!(test = key, rate, "Type-I error rate");
            rows.push(Type1Row {
                blocks: n_blocks,
                documents: n_docs,
                test: key.to_string(),
                rate,
            });
        }
    }
    Ok(rows)
}
