//! Multivariate normal draws for correlated random effects.

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{AnnoError, Result};

/// Square matrix stored row-major as nested vectors.
pub type Matrix = Vec<Vec<f64>>;

/// Relative tolerance below which a negative eigenvalue counts as rounding.
const EIGEN_TOLERANCE: f64 = 1e-10;

/// Zero-mean multivariate normal with a fixed covariance.
///
/// The covariance is factored once at construction; a draw is `L z` with
/// `z ~ N(0, I)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MultivariateNormal {
    covariance: Matrix,
    factor: DMatrix<f64>,
}

impl MultivariateNormal {
    /// Factor `covariance`, rejecting matrices that are not square, not
    /// symmetric, or not positive semi-definite.
    pub fn new(covariance: Matrix) -> Result<Self> {
        let n = covariance.len();
        if covariance.iter().any(|row| row.len() != n) {
            return Err(AnnoError::config("covariance matrix is not square"));
        }
        let scale = covariance
            .iter()
            .enumerate()
            .map(|(i, row)| row[i].abs())
            .fold(1.0, f64::max);
        for i in 0..n {
            for j in 0..i {
                if (covariance[i][j] - covariance[j][i]).abs() > 1e-9 * scale {
                    return Err(AnnoError::config(format!(
                        "covariance matrix is not symmetric at ({i}, {j})"
                    )));
                }
            }
        }
        let dense = DMatrix::from_fn(n, n, |i, j| covariance[i][j]);
        let factor = psd_factor(dense, scale)?;
        Ok(Self { covariance, factor })
    }

    pub fn dim(&self) -> usize {
        self.covariance.len()
    }

    pub fn covariance(&self) -> &Matrix {
        &self.covariance
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let z = DVector::<f64>::from_fn(self.dim(), |_, _| rng.sample(StandardNormal));
        (&self.factor * z).iter().copied().collect()
    }
}

/// Factor `a` as `L Lᵀ`.
///
/// Positive definite matrices take the Cholesky path. Singular ones fall back
/// to the eigendecomposition `V diag(√λ)`, with eigenvalues down to
/// `-EIGEN_TOLERANCE * scale` clamped to zero; anything more negative means the
/// matrix is not positive semi-definite.
fn psd_factor(a: DMatrix<f64>, scale: f64) -> Result<DMatrix<f64>> {
    if a.is_empty() {
        return Ok(a);
    }
    if let Some(chol) = Cholesky::new(a.clone()) {
        return Ok(chol.l());
    }

    let eig = SymmetricEigen::new(a);
    let smallest = eig.eigenvalues.min();
    if smallest < -EIGEN_TOLERANCE * scale {
        return Err(AnnoError::config(format!(
            "covariance matrix is not positive semi-definite (smallest eigenvalue {smallest:.4})"
        )));
    }
    let roots = eig.eigenvalues.map(|lambda| lambda.max(0.0).sqrt());
    Ok(&eig.eigenvectors * DMatrix::from_diagonal(&roots))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_zero_matrix_draws_zeros() {
        let mvn = MultivariateNormal::new(vec![vec![0.0, 0.0], vec![0.0, 0.0]]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(mvn.sample(&mut rng), vec![0.0, 0.0]);
    }

    #[test]
    fn test_factor_reproduces_covariance() {
        let cov = vec![vec![4.0, 2.0], vec![2.0, 3.0]];
        let mvn = MultivariateNormal::new(cov.clone()).unwrap();
        let rebuilt = &mvn.factor * mvn.factor.transpose();
        for i in 0..2 {
            for j in 0..2 {
                assert!((rebuilt[(i, j)] - cov[i][j]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_singular_factor_reproduces_covariance() {
        let cov = vec![
            vec![1.0, 1.0, 0.0],
            vec![1.0, 1.0, 0.0],
            vec![0.0, 0.0, 2.0],
        ];
        let mvn = MultivariateNormal::new(cov.clone()).unwrap();
        let rebuilt = &mvn.factor * mvn.factor.transpose();
        for i in 0..3 {
            for j in 0..3 {
                assert!((rebuilt[(i, j)] - cov[i][j]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_singular_psd_accepted() {
        // Perfectly correlated components.
        let mvn = MultivariateNormal::new(vec![vec![1.0, 1.0], vec![1.0, 1.0]]).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let draw = mvn.sample(&mut rng);
        assert!((draw[0] - draw[1]).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_indefinite() {
        let err = MultivariateNormal::new(vec![vec![1.0, 2.0], vec![2.0, 1.0]]).unwrap_err();
        assert!(err.to_string().contains("positive semi-definite"));
    }

    #[test]
    fn test_empty_covariance() {
        let mvn = MultivariateNormal::new(Vec::new()).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        assert!(mvn.sample(&mut rng).is_empty());
    }

    #[test]
    fn test_rejects_asymmetric_and_ragged() {
        assert!(MultivariateNormal::new(vec![vec![1.0, 0.5], vec![0.0, 1.0]]).is_err());
        assert!(MultivariateNormal::new(vec![vec![1.0, 0.5], vec![0.5]]).is_err());
    }

    #[test]
    fn test_sample_variance_matches() {
        let mvn = MultivariateNormal::new(vec![vec![2.0, 0.0], vec![0.0, 0.5]]).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let n = 20_000;
        let (mut s0, mut s1) = (0.0, 0.0);
        for _ in 0..n {
            let d = mvn.sample(&mut rng);
            s0 += d[0] * d[0];
            s1 += d[1] * d[1];
        }
        assert!((s0 / n as f64 - 2.0).abs() < 0.1);
        assert!((s1 / n as f64 - 0.5).abs() < 0.03);
    }
}
