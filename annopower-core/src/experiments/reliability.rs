//! Reliability of per-system mean scores under annotator subsampling.
//!
//! All three procedures resample whole annotator groups and compare the
//! per-system means of the subsample with a reference, either the full
//! table or the complementary half.

use itertools::Itertools;
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, info};

use crate::annotations::{AnnotationTable, split_csv_line};
use crate::error::{AnnoError, Result};
use crate::grouping::{AnnotatorGroup, get_annotator_groups, select_members};
use crate::results::{ReliabilityPoint, SplitHalfSummary, TimeReliabilityPoint};
use crate::significance::{mean, pearson_correlation, variance};

/// Annotation cost multiplier for crossed subsamples.
const CROSSED_COST_FACTOR: usize = 3;

/// Above this many combinations, distinct combinations are drawn at random
/// instead of enumerated.
const ENUMERATION_LIMIT: u128 = 1_000_000;

/// Keep only the systems with a finite mean on both sides.
fn finite_pairs(a: &[f64], b: &[f64]) -> (Vec<f64>, Vec<f64>) {
    a.iter()
        .zip(b)
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(x, y)| (*x, *y))
        .unzip()
}

fn correlation_of_means(a: &[f64], b: &[f64]) -> Result<f64> {
    let (a, b) = finite_pairs(a, b);
    pearson_correlation(&a, &b)
}

/// Mean correlation of subsample system means with the full-table means,
/// for every number of sampled groups.
///
/// Each size draws `limit` random group subsets. Crossed subsamples keep
/// every member of a chosen group; nested ones keep one random member.
pub fn grouped_subsample_reliability<R: Rng + ?Sized>(
    annotations: &AnnotationTable,
    crossed: bool,
    limit: usize,
    rng: &mut R,
) -> Result<Vec<ReliabilityPoint>> {
    let groups = get_annotator_groups(annotations);
    let reference = annotations.system_means();
    info!(groups = groups.len(), crossed, limit, "Computing subsample reliability");

    let mut points = Vec::with_capacity(groups.len());
    for size in 1..=groups.len() {
        let mut correlations = Vec::with_capacity(limit);
        for _ in 0..limit {
            let chosen = groups.choose_multiple(rng, size);
            let annotators = select_members(chosen, !crossed, rng);
            let means = annotations.select_annotators(&annotators).system_means();
            correlations.push(correlation_of_means(&means, &reference)?);
        }
        let cost = if crossed {
            size * CROSSED_COST_FACTOR
        } else {
            size
        };
        let correlation = mean(&correlations);
        debug!(size, cost, correlation, "Reliability point");
        points.push(ReliabilityPoint {
            groups: size,
            cost,
            correlation,
        });
    }
    Ok(points)
}

fn binomial(n: usize, k: usize) -> u128 {
    let k = k.min(n - k.min(n));
    (0..k).fold(1u128, |acc, i| {
        acc.saturating_mul((n - i) as u128) / (i as u128 + 1)
    })
}

/// Up to `max` distinct `size`-combinations of group indices in random order.
fn random_combinations<R: Rng + ?Sized>(
    group_count: usize,
    size: usize,
    max: usize,
    rng: &mut R,
) -> Vec<Vec<usize>> {
    let available = binomial(group_count, size);
    if available <= ENUMERATION_LIMIT {
        let mut combos: Vec<Vec<usize>> = (0..group_count).combinations(size).collect();
        combos.shuffle(rng);
        combos.truncate(max);
        return combos;
    }

    let indices: Vec<usize> = (0..group_count).collect();
    let mut seen = BTreeSet::new();
    let target = max.min(usize::try_from(available).unwrap_or(usize::MAX));
    let mut combos = Vec::with_capacity(target);
    while combos.len() < target {
        let mut combo: Vec<usize> = indices.choose_multiple(rng, size).copied().collect();
        combo.sort_unstable();
        if seen.insert(combo.clone()) {
            combos.push(combo);
        }
    }
    combos
}

/// Correlation and total annotation time of random group combinations.
///
/// Sizes run from 2 up to two less than the number of groups; each size
/// contributes at most `max_combinations` distinct combinations. `times`
/// maps annotator labels to seconds spent.
pub fn time_reliability_curve<R: Rng + ?Sized>(
    annotations: &AnnotationTable,
    times: &HashMap<String, f64>,
    max_combinations: usize,
    rng: &mut R,
) -> Result<Vec<TimeReliabilityPoint>> {
    let groups = get_annotator_groups(annotations);
    let reference = annotations.system_means();
    let labels = annotations.annotator_labels();

    let group_time = |group: &AnnotatorGroup| -> Result<f64> {
        group
            .members()
            .iter()
            .map(|&a| {
                times.get(&labels[a]).copied().ok_or_else(|| {
                    AnnoError::invalid_input(format!("no time recorded for annotator '{}'", labels[a]))
                })
            })
            .sum()
    };
    let group_times: Vec<f64> = groups.iter().map(group_time).collect::<Result<_>>()?;

    let mut points = Vec::new();
    for size in 2..groups.len().saturating_sub(1) {
        for combo in random_combinations(groups.len(), size, max_combinations, rng) {
            let annotators: Vec<usize> = combo
                .iter()
                .flat_map(|&g| groups[g].members().iter().copied())
                .collect();
            let means = annotations.select_annotators(&annotators).system_means();
            points.push(TimeReliabilityPoint {
                groups: size,
                seconds: combo.iter().map(|&g| group_times[g]).sum(),
                correlation: correlation_of_means(&reference, &means)?,
            });
        }
        debug!(size, points = points.len(), "Time reliability size done");
    }
    Ok(points)
}

/// Agreement between a random half of the annotator groups and the rest.
///
/// Each of `limit` rounds shuffles the groups, takes the first half and
/// compares its per-system means with those of the remaining groups.
pub fn split_half_reliability<R: Rng + ?Sized>(
    annotations: &AnnotationTable,
    limit: usize,
    rng: &mut R,
) -> Result<SplitHalfSummary> {
    let mut groups = get_annotator_groups(annotations);
    if groups.len() < 2 {
        return Err(AnnoError::invalid_input(format!(
            "split-half reliability needs at least two annotator groups, found {}",
            groups.len()
        )));
    }

    let mut correlations = Vec::with_capacity(limit);
    let mut errors = Vec::with_capacity(limit);
    for _ in 0..limit {
        groups.shuffle(rng);
        let (first, second) = groups.split_at(groups.len() / 2);
        let first: Vec<usize> = select_members(first, false, rng);
        let second: Vec<usize> = select_members(second, false, rng);
        let means_1 = annotations.select_annotators(&first).system_means();
        let means_2 = annotations.select_annotators(&second).system_means();

        let (a, b) = finite_pairs(&means_1, &means_2);
        correlations.push(pearson_correlation(&a, &b)?);
        let abs_errors: Vec<f64> = a.iter().zip(&b).map(|(x, y)| (x - y).abs()).collect();
        errors.push(mean(&abs_errors));
    }

    Ok(SplitHalfSummary {
        rounds: limit,
        correlation_mean: mean(&correlations),
        correlation_variance: variance(&correlations),
        mae_mean: mean(&errors),
        mae_variance: variance(&errors),
    })
}

/// Parse an annotator time sheet: an `annotator` column plus one numeric
/// column, summed per annotator.
pub fn parse_annotator_times(content: &str, origin: &Path) -> Result<HashMap<String, f64>> {
    let mut lines = content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
    let (_, header) = lines
        .next()
        .ok_or_else(|| AnnoError::parse(origin, 1, "empty time file"))?;
    let columns = split_csv_line(header);
    let annotator_col = columns
        .iter()
        .position(|c| c == "annotator")
        .ok_or_else(|| AnnoError::parse(origin, 1, "missing 'annotator' column"))?;
    let time_col = (0..columns.len())
        .find(|&c| c != annotator_col)
        .ok_or_else(|| AnnoError::parse(origin, 1, "missing time column"))?;

    let mut times: HashMap<String, f64> = HashMap::new();
    for (idx, line) in lines {
        let fields = split_csv_line(line);
        let (Some(annotator), Some(raw)) = (fields.get(annotator_col), fields.get(time_col)) else {
            return Err(AnnoError::parse(origin, idx + 1, format!("expected {} fields", columns.len())));
        };
        let seconds = raw.parse::<f64>().map_err(|e| {
            AnnoError::parse(origin, idx + 1, format!("invalid time '{raw}': {e}"))
        })?;
        *times.entry(annotator.clone()).or_default() += seconds;
    }
    Ok(times)
}

pub fn load_annotator_times(path: &Path) -> Result<HashMap<String, f64>> {
    let content = std::fs::read_to_string(path)?;
    parse_annotator_times(&content, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::Annotation;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// `groups` groups of `per_group` annotators; system quality is stable
    /// across annotators up to a small per-annotator offset.
    fn table(groups: usize, per_group: usize) -> AnnotationTable {
        let mut rows = Vec::new();
        for g in 0..groups {
            for m in 0..per_group {
                let annotator = g * per_group + m;
                for document in [2 * g, 2 * g + 1] {
                    for system in 0..4 {
                        let noise = ((annotator * 7 + document + system) % 3) as f64 * 0.1;
                        rows.push(Annotation {
                            system,
                            annotator,
                            document,
                            score: system as f64 + noise,
                        });
                    }
                }
            }
        }
        AnnotationTable::synthetic(
            vec!["A".into(), "B".into(), "C".into(), "D".into()],
            groups * per_group,
            2 * groups,
            rows,
        )
    }

    #[test]
    fn test_binomial() {
        assert_eq!(binomial(5, 2), 10);
        assert_eq!(binomial(40, 20), 137_846_528_820);
        assert_eq!(binomial(3, 0), 1);
        assert_eq!(binomial(3, 3), 1);
    }

    #[test]
    fn test_random_combinations_distinct() {
        let mut rng = StdRng::seed_from_u64(2);
        let combos = random_combinations(6, 3, 500, &mut rng);
        assert_eq!(combos.len(), 20);
        let unique: BTreeSet<_> = combos.iter().cloned().collect();
        assert_eq!(unique.len(), 20);

        let sampled = random_combinations(40, 20, 25, &mut rng);
        assert_eq!(sampled.len(), 25);
        assert!(sampled.iter().all(|c| c.len() == 20));
    }

    #[test]
    fn test_subsample_reliability_costs() {
        let t = table(4, 3);
        let mut rng = StdRng::seed_from_u64(8);
        let crossed = grouped_subsample_reliability(&t, true, 20, &mut rng).unwrap();
        assert_eq!(crossed.len(), 4);
        assert_eq!(crossed[0].cost, 3);
        assert_eq!(crossed[3].cost, 12);
        // The full set of groups reproduces the reference exactly.
        assert!((crossed[3].correlation - 1.0).abs() < 1e-9);
        assert!(crossed.iter().all(|p| p.correlation > 0.9));

        let nested = grouped_subsample_reliability(&t, false, 20, &mut rng).unwrap();
        assert_eq!(nested[1].cost, 2);
    }

    #[test]
    fn test_time_reliability_curve() {
        let t = table(6, 1);
        let times: HashMap<String, f64> = (0..6).map(|a| (a.to_string(), 10.0 * (a + 1) as f64)).collect();
        let mut rng = StdRng::seed_from_u64(4);
        let points = time_reliability_curve(&t, &times, 500, &mut rng).unwrap();
        // Sizes 2, 3 and 4: C(6,2) + C(6,3) + C(6,4).
        assert_eq!(points.len(), 15 + 20 + 15);
        let smallest = points.iter().map(|p| p.seconds).fold(f64::INFINITY, f64::min);
        assert_eq!(smallest, 30.0);
    }

    #[test]
    fn test_time_reliability_missing_time() {
        let t = table(5, 1);
        let times = HashMap::from([("0".to_string(), 1.0)]);
        let mut rng = StdRng::seed_from_u64(4);
        assert!(time_reliability_curve(&t, &times, 10, &mut rng).is_err());
    }

    #[test]
    fn test_split_half() {
        let t = table(6, 2);
        let mut rng = StdRng::seed_from_u64(10);
        let summary = split_half_reliability(&t, 50, &mut rng).unwrap();
        assert_eq!(summary.rounds, 50);
        assert!(summary.correlation_mean > 0.95);
        assert!(summary.mae_mean < 0.2);
        assert!(summary.correlation_variance >= 0.0);
    }

    #[test]
    fn test_split_half_needs_two_groups() {
        let t = table(1, 3);
        let mut rng = StdRng::seed_from_u64(10);
        assert!(split_half_reliability(&t, 5, &mut rng).is_err());
    }

    #[test]
    fn test_parse_annotator_times() {
        let content = "annotator,seconds\na1,30\na2,12.5\na1,15\n";
        let times = parse_annotator_times(content, Path::new("times.csv")).unwrap();
        assert_eq!(times["a1"], 45.0);
        assert_eq!(times["a2"], 12.5);

        let err = parse_annotator_times("annotator,seconds\na1,slow\n", Path::new("t.csv")).unwrap_err();
        assert!(matches!(err, AnnoError::Parse { line: 2, .. }));
    }
}
