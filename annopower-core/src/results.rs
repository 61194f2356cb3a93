//! Result tables produced by the experiment drivers.
//!
//! Every table renders to CSV with a header row. Design-power outputs can be
//! read back with [`load_power_results`] for downstream curve plotting.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::annotations::split_csv_line;
use crate::error::{AnnoError, Result};
use crate::ordinal::OrdinalModel;
use crate::regression::SystemPair;

/// P-value of one system pair in one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairPValue {
    pub left: String,
    pub right: String,
    pub p_value: f64,
}

/// Design coordinates shared by the power-curve tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DesignKey {
    /// Annotators per block.
    pub annotators: usize,
    /// Total number of judgments per system.
    pub effort: usize,
    /// Total number of distinct annotators.
    pub total_annotators: usize,
}

impl DesignKey {
    pub fn new(blocks: usize, documents_per_block: usize, annotators_per_block: usize) -> Self {
        Self {
            annotators: annotators_per_block,
            effort: blocks * documents_per_block * annotators_per_block,
            total_annotators: blocks * annotators_per_block,
        }
    }
}

/// One oriented p-value at a design point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerRow {
    pub key: DesignKey,
    pub better: String,
    pub worse: String,
    pub p_value: f64,
}

/// Type-I error rate of one test variant at one design point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Type1Row {
    pub blocks: usize,
    pub documents: usize,
    /// `ttest_no_agg`, `ttest_agg`, `art_no_agg` or `art_agg`.
    pub test: String,
    pub rate: f64,
}

/// Agreement of subsampled regressions with the full-data regression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PseudoPowerRow {
    pub num_annotators: usize,
    pub agree_fraction: f64,
    pub contradiction_fraction: f64,
    pub new_differences: usize,
}

/// Detection counts for the pairs of interest across trials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionSummary {
    pub trials: usize,
    pub pairs: Vec<SystemPair>,
    pub counts: BTreeMap<SystemPair, usize>,
    /// Per-trial p-values, one column per entry of `pairs`.
    pub p_value_log: Vec<Vec<f64>>,
}

impl DetectionSummary {
    /// Detection rate of every pair of interest (0.0 for undetected pairs).
    pub fn rates(&self) -> Vec<(SystemPair, f64)> {
        self.pairs
            .iter()
            .map(|pair| {
                let count = self.counts.get(pair).copied().unwrap_or(0);
                let rate = if self.trials == 0 {
                    0.0
                } else {
                    count as f64 / self.trials as f64
                };
                (pair.clone(), rate)
            })
            .collect()
    }
}

/// Reliability of per-system means at one subsample size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityPoint {
    pub groups: usize,
    /// Annotation cost in group units (tripled for crossed designs).
    pub cost: usize,
    pub correlation: f64,
}

/// Correlation of one group combination against the full table, with its time cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeReliabilityPoint {
    pub groups: usize,
    pub seconds: f64,
    pub correlation: f64,
}

/// Split-half agreement of per-system means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitHalfSummary {
    pub rounds: usize,
    pub correlation_mean: f64,
    pub correlation_variance: f64,
    pub mae_mean: f64,
    pub mae_variance: f64,
}

/// Minimal CSV field escaping: quote values containing a comma, newline or
/// double-quote, doubling embedded double-quotes.
pub(crate) fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn pair_p_values_to_csv(rows: &[PairPValue]) -> String {
    let mut buf = String::from("left,right,p_value\n");
    for row in rows {
        let _ = writeln!(
            buf,
            "{},{},{}",
            csv_escape(&row.left),
            csv_escape(&row.right),
            row.p_value
        );
    }
    buf
}

pub fn power_rows_to_csv(rows: &[PowerRow]) -> String {
    let mut buf = String::from("annotators,effort,total_annotators,better,worse,p_value\n");
    for row in rows {
        let _ = writeln!(
            buf,
            "{},{},{},{},{},{}",
            row.key.annotators,
            row.key.effort,
            row.key.total_annotators,
            csv_escape(&row.better),
            csv_escape(&row.worse),
            row.p_value
        );
    }
    buf
}

pub fn type1_rows_to_csv(rows: &[Type1Row]) -> String {
    let mut buf = String::from("blocks,documents,test,rate\n");
    for row in rows {
        let _ = writeln!(buf, "{},{},{},{}", row.blocks, row.documents, row.test, row.rate);
    }
    buf
}

pub fn pseudo_power_rows_to_csv(rows: &[PseudoPowerRow]) -> String {
    let mut buf =
        String::from("num_annotators,agree_fraction,contradiction_fraction,new_differences\n");
    for row in rows {
        let _ = writeln!(
            buf,
            "{},{},{},{}",
            row.num_annotators, row.agree_fraction, row.contradiction_fraction, row.new_differences
        );
    }
    buf
}

/// Per-trial p-values of the pairs of interest, one column per pair.
pub fn detection_log_to_csv(summary: &DetectionSummary) -> String {
    let header: Vec<String> = summary
        .pairs
        .iter()
        .map(|(a, b)| csv_escape(&format!("{a} - {b}")))
        .collect();
    let mut buf = header.join(",");
    buf.push('\n');
    for trial in &summary.p_value_log {
        let fields: Vec<String> = trial.iter().map(f64::to_string).collect();
        buf.push_str(&fields.join(","));
        buf.push('\n');
    }
    buf
}

pub fn detection_rates_to_csv(summary: &DetectionSummary) -> String {
    let mut buf = String::from("better,worse,rate\n");
    for ((a, b), rate) in summary.rates() {
        let _ = writeln!(buf, "{},{},{}", csv_escape(&a), csv_escape(&b), rate);
    }
    buf
}

pub fn reliability_points_to_csv(points: &[ReliabilityPoint]) -> String {
    let mut buf = String::from("groups,cost,correlation\n");
    for p in points {
        let _ = writeln!(buf, "{},{},{}", p.groups, p.cost, p.correlation);
    }
    buf
}

pub fn time_reliability_points_to_csv(points: &[TimeReliabilityPoint]) -> String {
    let mut buf = String::from("groups,seconds,correlation\n");
    for p in points {
        let _ = writeln!(buf, "{},{},{}", p.groups, p.seconds, p.correlation);
    }
    buf
}

pub fn split_half_to_csv(summaries: &[(String, SplitHalfSummary)]) -> String {
    let mut buf =
        String::from("score,rounds,correlation_mean,correlation_variance,mae_mean,mae_variance\n");
    for (score, s) in summaries {
        let _ = writeln!(
            buf,
            "{},{},{},{},{},{}",
            csv_escape(score),
            s.rounds,
            s.correlation_mean,
            s.correlation_variance,
            s.mae_mean,
            s.mae_variance
        );
    }
    buf
}

/// Set the p-value to 1.0 wherever `better` does not have the strictly
/// larger coefficient in `model`.
///
/// Rows naming systems unknown to the model are masked as well.
pub fn mask_wrong_rankings(model: &OrdinalModel, rows: &mut [PowerRow]) -> usize {
    let coefficients: HashMap<&str, f64> = model
        .systems()
        .iter()
        .map(String::as_str)
        .zip(model.coefficients().iter().copied())
        .collect();

    let mut masked = 0;
    for row in rows.iter_mut() {
        let correct = match (
            coefficients.get(row.better.as_str()),
            coefficients.get(row.worse.as_str()),
        ) {
            (Some(better), Some(worse)) => better > worse,
            _ => false,
        };
        if !correct {
            row.p_value = 1.0;
            masked += 1;
        }
    }
    masked
}

/// Parse `(blocks, documents, annotators)` from a `<prefix>_<B>_<D>_<A>.csv` name.
pub fn parse_design_file_name(name: &str) -> Option<(usize, usize, usize)> {
    let stem = name.strip_suffix(".csv")?;
    let mut parts = stem.rsplitn(4, '_');
    let annotators = parts.next()?.parse().ok()?;
    let documents = parts.next()?.parse().ok()?;
    let blocks = trailing_number(parts.next()?)?;
    Some((blocks, documents, annotators))
}

/// The number at the end of `s`, which must be non-empty.
fn trailing_number(s: &str) -> Option<usize> {
    let start = s
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(idx, _)| idx)?;
    s[start..].parse().ok()
}

/// Read every design-power output in `dir` into keyed rows.
///
/// Files are `<prefix>_<blocks>_<docs>_<annotators>.csv` with a header row and
/// `better,worse,p_value` columns. Files whose name does not carry the design
/// suffix are skipped. The optional `filter` sees the path and the parsed
/// `(blocks, docs, annotators)`.
pub fn load_power_results(
    dir: &Path,
    filter: impl Fn(&Path, usize, usize, usize) -> bool,
) -> Result<Vec<PowerRow>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    paths.sort();

    let mut rows = Vec::new();
    for path in paths {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((blocks, documents, annotators)) = parse_design_file_name(name) else {
            debug!(path = %path.display(), "Skipping file without design suffix");
            continue;
        };
        if !filter(&path, blocks, documents, annotators) {
            continue;
        }

        let key = DesignKey::new(blocks, documents, annotators);
        let content = std::fs::read_to_string(&path)?;
        for (idx, line) in content.lines().enumerate().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            let fields = split_csv_line(line);
            if fields.len() != 3 {
                return Err(AnnoError::parse(
                    &path,
                    idx + 1,
                    format!("expected 3 fields, found {}", fields.len()),
                ));
            }
            let p_value = fields[2].parse::<f64>().map_err(|e| {
                AnnoError::parse(&path, idx + 1, format!("invalid p-value '{}': {e}", fields[2]))
            })?;
            rows.push(PowerRow {
                key,
                better: fields[0].clone(),
                worse: fields[1].clone(),
                p_value,
            });
        }
    }
    Ok(rows)
}
