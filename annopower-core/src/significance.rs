//! Paired two-sample significance tests.
//!
//! Both tests take two equal-length slices of paired observations and return
//! a two-sided p-value. Length mismatches are rejected before any work.

use rand::Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::error::{AnnoError, Result};

/// Default number of resampling trials for the randomization test.
pub const DEFAULT_ART_TRIALS: usize = 1000;

/// A paired significance test usable by the experiment drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignificanceTest {
    /// Paired Student-t test on the differences.
    TTest,
    /// Paired approximate randomization test.
    ApproximateRandomization { trials: usize },
}

impl SignificanceTest {
    pub fn art() -> Self {
        Self::ApproximateRandomization {
            trials: DEFAULT_ART_TRIALS,
        }
    }

    /// Short key used in result tables.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TTest => "ttest",
            Self::ApproximateRandomization { .. } => "art",
        }
    }

    pub fn p_value<R: Rng + ?Sized>(&self, x: &[f64], y: &[f64], rng: &mut R) -> Result<f64> {
        match self {
            Self::TTest => paired_t_test(x, y),
            Self::ApproximateRandomization { trials } => {
                paired_approximate_randomization_test(x, y, *trials, rng)
            }
        }
    }
}

fn check_paired(x: &[f64], y: &[f64]) -> Result<()> {
    if x.len() != y.len() {
        return Err(AnnoError::invalid_input(format!(
            "paired test needs equal-length samples, got {} and {}",
            x.len(),
            y.len()
        )));
    }
    Ok(())
}

/// Paired approximate randomization test.
///
/// Each trial swaps the members of every pair with probability 1/2 and
/// recomputes the absolute difference of the two group sums. The p-value is
/// `(hits + 1) / (n + 1)`, so it is never exactly 0.
pub fn paired_approximate_randomization_test<R: Rng + ?Sized>(
    x: &[f64],
    y: &[f64],
    n: usize,
    rng: &mut R,
) -> Result<f64> {
    check_paired(x, y)?;

    let diffs: Vec<f64> = x.iter().zip(y).map(|(a, b)| a - b).collect();
    let observed = diffs.iter().sum::<f64>().abs();

    let mut hits = 0usize;
    for _ in 0..n {
        let resampled: f64 = diffs
            .iter()
            .map(|&d| if rng.r#gen::<bool>() { -d } else { d })
            .sum();
        if resampled.abs() >= observed {
            hits += 1;
        }
    }

    Ok((hits + 1) as f64 / (n + 1) as f64)
}

/// Two-sided paired t-test.
///
/// Fewer than two pairs, or all-zero differences, give 1.0. Constant non-zero
/// differences give 0.0.
pub fn paired_t_test(x: &[f64], y: &[f64]) -> Result<f64> {
    check_paired(x, y)?;
    let n = x.len();
    if n < 2 {
        return Ok(1.0);
    }

    let diffs: Vec<f64> = x.iter().zip(y).map(|(a, b)| a - b).collect();
    let mean_d = mean(&diffs);
    let sd = sample_variance(&diffs, mean_d).sqrt();

    if sd < 1e-12 {
        return Ok(if mean_d.abs() < 1e-12 { 1.0 } else { 0.0 });
    }

    let t = mean_d / (sd / (n as f64).sqrt());
    student_t_two_sided_p(t, (n - 1) as f64)
}

/// Pearson correlation coefficient. Zero-variance inputs give 0.0.
pub fn pearson_correlation(x: &[f64], y: &[f64]) -> Result<f64> {
    check_paired(x, y)?;
    if x.is_empty() {
        return Ok(0.0);
    }
    let mx = mean(x);
    let my = mean(y);
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx).powi(2);
        syy += (b - my).powi(2);
    }
    let denom = (sxx * syy).sqrt();
    if denom < f64::EPSILON {
        return Ok(0.0);
    }
    Ok(sxy / denom)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population variance (ddof = 0).
pub fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

fn sample_variance(values: &[f64], mean: f64) -> f64 {
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

/// Two-sided tail probability `P(|T| >= |t|)` of Student's t with `df`
/// degrees of freedom.
pub fn student_t_two_sided_p(t: f64, df: f64) -> Result<f64> {
    if !t.is_finite() {
        return Ok(0.0);
    }
    let dist = StudentsT::new(0.0, 1.0, df)
        .map_err(|e| AnnoError::invalid_input(format!("t distribution with df = {df}: {e}")))?;
    Ok((2.0 * dist.sf(t.abs())).clamp(0.0, 1.0))
}
