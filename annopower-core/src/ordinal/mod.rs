//! Cumulative-link ordinal response model.
//!
//! Ratings are generated by inverse-CDF sampling from a logistic cumulative
//! model with correlated annotator (and optionally document) random effects.
//! The first system is the reference: its random effect is only the shared
//! component 0, every other system adds its own component on top.

pub mod catalog;
pub mod mvn;

pub use catalog::ModelCatalog;
pub use mvn::{Matrix, MultivariateNormal};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::annotations::{Annotation, AnnotationTable};
use crate::design::Design;
use crate::error::{AnnoError, Result};

/// On-disk model definition (JSON).
///
/// Covariance matrices are flattened row-major, `systems²` entries each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub system_names: Vec<String>,
    pub coefficients: Vec<f64>,
    pub thresholds: Vec<f64>,
    pub random_effects: RandomEffects,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomEffects {
    pub annotator: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Vec<f64>>,
}

/// Immutable ordinal model parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct OrdinalModel {
    systems: Vec<String>,
    coefficients: Vec<f64>,
    thresholds: Vec<f64>,
    annotator_effects: MultivariateNormal,
    document_effects: Option<MultivariateNormal>,
}

impl OrdinalModel {
    /// Validate and build a model. Any inconsistency is a configuration error.
    pub fn new(
        systems: Vec<String>,
        coefficients: Vec<f64>,
        thresholds: Vec<f64>,
        annotator_covariance: Matrix,
        document_covariance: Option<Matrix>,
    ) -> Result<Self> {
        if systems.is_empty() {
            return Err(AnnoError::config("model needs at least one system"));
        }
        if coefficients.len() != systems.len() {
            return Err(AnnoError::config(format!(
                "{} coefficients for {} systems",
                coefficients.len(),
                systems.len()
            )));
        }
        if thresholds.is_empty() {
            return Err(AnnoError::config("model needs at least one threshold"));
        }
        if thresholds.windows(2).any(|w| w[0] >= w[1]) {
            warn!(?thresholds, "Thresholds are not strictly increasing");
        }

        let annotator_effects = effects("annotator", annotator_covariance, systems.len())?;
        let document_effects = document_covariance
            .map(|cov| effects("document", cov, systems.len()))
            .transpose()?;

        Ok(Self {
            systems,
            coefficients,
            thresholds,
            annotator_effects,
            document_effects,
        })
    }

    pub fn from_definition(def: &ModelDefinition) -> Result<Self> {
        let n = def.system_names.len();
        let annotator = unflatten("annotator", &def.random_effects.annotator, n)?;
        let document = def
            .random_effects
            .document
            .as_deref()
            .map(|flat| unflatten("document", flat, n))
            .transpose()?;
        Self::new(
            def.system_names.clone(),
            def.coefficients.clone(),
            def.thresholds.clone(),
            annotator,
            document,
        )
    }

    /// Load a model definition file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let def: ModelDefinition = serde_json::from_str(&content)
            .map_err(|e| AnnoError::config(format!("{}: {e}", path.display())))?;
        Self::from_definition(&def)
    }

    pub fn to_definition(&self) -> ModelDefinition {
        ModelDefinition {
            system_names: self.systems.clone(),
            coefficients: self.coefficients.clone(),
            thresholds: self.thresholds.clone(),
            random_effects: RandomEffects {
                annotator: self.annotator_effects.covariance().concat(),
                document: self
                    .document_effects
                    .as_ref()
                    .map(|mvn| mvn.covariance().concat()),
            },
        }
    }

    pub fn systems(&self) -> &[String] {
        &self.systems
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    pub fn has_document_effects(&self) -> bool {
        self.document_effects.is_some()
    }

    /// Number of ordinal categories `K = thresholds + 1`.
    pub fn category_count(&self) -> usize {
        self.thresholds.len() + 1
    }

    pub fn coefficient_of(&self, system: &str) -> Option<f64> {
        self.systems
            .iter()
            .position(|s| s == system)
            .map(|i| self.coefficients[i])
    }

    /// Every unordered pair of system indices, in system order.
    pub fn system_pairs(&self) -> Vec<(usize, usize)> {
        let n = self.systems.len();
        (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
            .collect()
    }

    /// The null-hypothesis variant: identical parameters, all coefficients zero.
    pub fn zero_coefficients(&self) -> Self {
        Self {
            coefficients: vec![0.0; self.coefficients.len()],
            ..self.clone()
        }
    }

    /// Draw one synthetic annotation table for `design`.
    ///
    /// Rows are ordered system-major, then by design slot.
    pub fn sample<R: Rng + ?Sized>(&self, design: &Design, rng: &mut R) -> AnnotationTable {
        let annotator_count = design.annotator_count();
        let document_count = design.document_count();

        let annotator_effects: Vec<Vec<f64>> = (0..annotator_count)
            .map(|_| self.annotator_effects.sample(rng))
            .collect();
        let document_effects: Option<Vec<Vec<f64>>> = self
            .document_effects
            .as_ref()
            .map(|mvn| (0..document_count).map(|_| mvn.sample(rng)).collect());

        let mut rows = Vec::with_capacity(self.systems.len() * design.len());
        for (system, coefficient) in self.coefficients.iter().enumerate() {
            for (annotator, document) in design.slots() {
                let mut offset = coefficient + random_effect(&annotator_effects[annotator], system);
                if let Some(doc_effects) = &document_effects {
                    offset += random_effect(&doc_effects[document], system);
                }
                let u: f64 = rng.r#gen();
                let score = 1 + self
                    .thresholds
                    .iter()
                    .filter(|&&threshold| u > logistic(threshold - offset))
                    .count();
                rows.push(Annotation {
                    system,
                    annotator,
                    document,
                    score: score as f64,
                });
            }
        }

        AnnotationTable::synthetic(self.systems.clone(), annotator_count, document_count, rows)
    }
}

/// Shared component plus the system-specific one for non-reference systems.
fn random_effect(effects: &[f64], system: usize) -> f64 {
    if system == 0 {
        effects[0]
    } else {
        effects[0] + effects[system]
    }
}

fn logistic(logit: f64) -> f64 {
    let odds = logit.exp();
    if odds.is_infinite() {
        1.0
    } else {
        odds / (1.0 + odds)
    }
}

fn effects(name: &str, covariance: Matrix, systems: usize) -> Result<MultivariateNormal> {
    if covariance.len() != systems {
        return Err(AnnoError::config(format!(
            "{name} covariance is {}x{}, expected {systems}x{systems}",
            covariance.len(),
            covariance.first().map_or(0, Vec::len)
        )));
    }
    MultivariateNormal::new(covariance).map_err(|e| match e {
        AnnoError::Config(msg) => AnnoError::config(format!("{name} {msg}")),
        other => other,
    })
}

fn unflatten(name: &str, flat: &[f64], systems: usize) -> Result<Matrix> {
    if systems == 0 {
        return Err(AnnoError::config("model needs at least one system"));
    }
    if flat.len() != systems * systems {
        return Err(AnnoError::config(format!(
            "{name} covariance has {} entries, expected {}",
            flat.len(),
            systems * systems
        )));
    }
    Ok(flat.chunks(systems).map(<[f64]>::to_vec).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::create_design;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn binary_model() -> OrdinalModel {
        OrdinalModel::new(
            vec!["A".into(), "B".into()],
            vec![0.0, 0.0],
            vec![0.0],
            vec![vec![0.0, 0.0], vec![0.0, 0.0]],
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_binary_noise_free_model_is_fair_coin() {
        let model = binary_model();
        let design = create_design(1000, 50, 1);
        let mut rng = StdRng::seed_from_u64(2024);
        let sample = model.sample(&design, &mut rng);
        assert_eq!(sample.len(), 100_000);

        let twos = sample.rows().iter().filter(|r| r.score == 2.0).count();
        let proportion = twos as f64 / sample.len() as f64;
        assert!((proportion - 0.5).abs() < 0.01, "proportion = {proportion}");
    }

    #[test]
    fn test_large_coefficient_pushes_scores_up() {
        let model = OrdinalModel::new(
            vec!["low".into(), "high".into()],
            vec![0.0, 6.0],
            vec![-1.0, 0.0, 1.0],
            vec![vec![0.2, 0.0], vec![0.0, 0.2]],
            None,
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(8);
        let sample = model.sample(&create_design(20, 5, 2), &mut rng);
        let means = sample.system_means();
        assert!(means[1] > means[0] + 1.0, "means = {means:?}");
    }

    #[test]
    fn test_sample_layout() {
        let model = binary_model();
        let design = create_design(2, 3, 2);
        let mut rng = StdRng::seed_from_u64(1);
        let sample = model.sample(&design, &mut rng);
        assert_eq!(sample.len(), 2 * design.len());
        assert_eq!(sample.annotator_labels().len(), 4);
        assert_eq!(sample.document_labels().len(), 6);
        assert!(sample.rows()[..design.len()].iter().all(|r| r.system == 0));
        assert!(sample.rows()[design.len()..].iter().all(|r| r.system == 1));
    }

    #[test]
    fn test_zero_coefficients_returns_new_model() {
        let model = OrdinalModel::new(
            vec!["A".into(), "B".into()],
            vec![0.0, -1.5],
            vec![-1.0, 1.0],
            vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            None,
        )
        .unwrap();
        let null = model.zero_coefficients();
        assert_eq!(null.coefficients(), &[0.0, 0.0]);
        assert_eq!(model.coefficients(), &[0.0, -1.5]);
        assert_eq!(null.thresholds(), model.thresholds());
    }

    #[test]
    fn test_dimension_mismatch_is_config_error() {
        let err = OrdinalModel::new(
            vec!["A".into(), "B".into(), "C".into()],
            vec![0.0, 0.0, 0.0],
            vec![0.0],
            vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, AnnoError::Config(_)));
        assert!(err.to_string().contains("expected 3x3"));
    }

    #[test]
    fn test_coefficient_count_checked() {
        let err = OrdinalModel::new(
            vec!["A".into()],
            vec![0.0, 1.0],
            vec![0.0],
            vec![vec![1.0]],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, AnnoError::Config(_)));
    }

    #[test]
    fn test_definition_roundtrip_through_file() {
        let json = r#"{
            "system_names": ["ref", "sys"],
            "coefficients": [0.0, -0.7],
            "thresholds": [-2.0, 0.0, 2.0],
            "random_effects": {
                "annotator": [1.0, 0.2, 0.2, 0.5],
                "document": [0.3, 0.0, 0.0, 0.3]
            }
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, json).unwrap();

        let model = OrdinalModel::from_file(&path).unwrap();
        assert_eq!(model.category_count(), 4);
        assert!(model.has_document_effects());
        assert_eq!(model.coefficient_of("sys"), Some(-0.7));

        let def = model.to_definition();
        assert_eq!(def.random_effects.annotator, vec![1.0, 0.2, 0.2, 0.5]);
        assert_eq!(OrdinalModel::from_definition(&def).unwrap(), model);
    }

    #[test]
    fn test_wrong_flattened_length() {
        let def = ModelDefinition {
            system_names: vec!["a".into(), "b".into()],
            coefficients: vec![0.0, 0.0],
            thresholds: vec![0.0],
            random_effects: RandomEffects {
                annotator: vec![1.0, 0.0, 1.0],
                document: None,
            },
        };
        let err = OrdinalModel::from_definition(&def).unwrap_err();
        assert!(err.to_string().contains("has 3 entries, expected 4"));
    }

    #[test]
    fn test_system_pairs() {
        let model = OrdinalModel::new(
            vec!["a".into(), "b".into(), "c".into()],
            vec![0.0; 3],
            vec![0.0],
            vec![vec![0.0; 3]; 3],
            None,
        )
        .unwrap();
        assert_eq!(model.system_pairs(), vec![(0, 1), (0, 2), (1, 2)]);
    }
}
