//! Named model catalog.
//!
//! The catalog stores definitions and validates on lookup, so a catalog can
//! be assembled from files without every entry having to be usable.

use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use super::{ModelDefinition, OrdinalModel, RandomEffects};
use crate::error::{AnnoError, Result};

const MULTI_NEWS_SYSTEMS: [&str; 4] = ["__REFERENCE__", "abssentrw", "BART", "onmt_pg"];
const CNN_DAILYMAIL_SYSTEMS: [&str; 5] =
    ["__REFERENCE__", "abssentrw", "BART", "onmt_pg", "seneca"];

const THRESHOLDS_MN_LIKERT: [f64; 6] = [-5.2598, -4.3442, -3.0329, -1.7464, -0.5523, 1.0697];
const COEFFICIENTS_MN_LIKERT: [f64; 4] = [0.0, -3.4401, -0.2851, -3.7812];
const COEFFICIENTS_MN_LIKERT_MODIFIED: [f64; 4] =
    [0.0, -3.4401 + 0.352 / 2.0, -0.69, -3.7812 - 0.352 / 2.0];
#[rustfmt::skip]
const ANNOTATOR_MN_LIKERT: [f64; 16] = [
    1.0589, -0.397, 0.313, -0.570,
    -0.397, 2.6498, -0.496, 0.876,
    0.313, -0.496, 0.5877, -0.107,
    -0.570, 0.876, -0.107, 4.0892,
];

const THRESHOLDS_MN_RANK: [f64; 3] = [-2.8417, -1.2238, 0.2938];
const COEFFICIENTS_MN_RANK: [f64; 4] = [0.0, -2.0126, -0.2246, -2.9426];
const COEFFICIENTS_MN_RANK_MODIFIED: [f64; 4] = [0.0, -2.0126 - 0.12, -0.69, -2.9426 + 0.12];
#[rustfmt::skip]
const ANNOTATOR_MN_RANK: [f64; 16] = [
    0.2163, -0.746, -0.686, -0.084,
    -0.746, 1.8462, 0.105, -0.431,
    -0.686, 0.105, 0.9569, 0.247,
    -0.084, -0.431, 0.247, 0.3873,
];

const THRESHOLDS_CNNDM_LIKERT: [f64; 6] = [-4.1557, -2.7845, -1.5968, -0.3418, 1.0436, 2.6899];
const COEFFICIENTS_CNNDM_LIKERT: [f64; 5] = [0.0, -0.7096, 1.3953, 0.6771, -1.2513];
#[rustfmt::skip]
const ANNOTATOR_CNNDM_LIKERT: [f64; 25] = [
    1.7905, -0.503, -0.723, -0.567, -0.536,
    -0.503, 0.3533, 0.578, 0.517, 0.339,
    -0.723, 0.578, 1.7695, 0.833, 0.736,
    -0.567, 0.517, 0.833, 0.9142, 0.240,
    -0.536, 0.339, 0.736, 0.240, 0.9160,
];
#[rustfmt::skip]
const DOCUMENT_CNNDM_LIKERT: [f64; 25] = [
    1.1083, -0.738, -0.680, -0.615, -0.816,
    -0.738, 1.0900, 0.470, 0.512, 0.941,
    -0.680, 0.470, 1.4792, 0.642, 0.722,
    -0.615, 0.512, 0.642, 1.475, 0.710,
    -0.816, 0.941, 0.722, 0.710, 1.9065,
];

/// Named model definitions available to an experiment run.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: BTreeMap<String, ModelDefinition>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pre-fitted summarization models.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.insert(
            "likertD:multi_news",
            definition(&MULTI_NEWS_SYSTEMS, &COEFFICIENTS_MN_LIKERT, &THRESHOLDS_MN_LIKERT, &ANNOTATOR_MN_LIKERT, None),
        );
        catalog.insert(
            "likertD:multi_news:modified",
            definition(
                &MULTI_NEWS_SYSTEMS,
                &COEFFICIENTS_MN_LIKERT_MODIFIED,
                &THRESHOLDS_MN_LIKERT,
                &ANNOTATOR_MN_LIKERT,
                None,
            ),
        );
        catalog.insert(
            "ranking:multi_news",
            definition(&MULTI_NEWS_SYSTEMS, &COEFFICIENTS_MN_RANK, &THRESHOLDS_MN_RANK, &ANNOTATOR_MN_RANK, None),
        );
        catalog.insert(
            "ranking:multi_news:modified",
            definition(
                &MULTI_NEWS_SYSTEMS,
                &COEFFICIENTS_MN_RANK_MODIFIED,
                &THRESHOLDS_MN_RANK,
                &ANNOTATOR_MN_RANK,
                None,
            ),
        );
        catalog.insert(
            "likertD:cnn_dailymail",
            definition(
                &CNN_DAILYMAIL_SYSTEMS,
                &COEFFICIENTS_CNNDM_LIKERT,
                &THRESHOLDS_CNNDM_LIKERT,
                &ANNOTATOR_CNNDM_LIKERT,
                Some(&DOCUMENT_CNNDM_LIKERT),
            ),
        );
        catalog
    }

    pub fn insert(&mut self, name: impl Into<String>, def: ModelDefinition) {
        self.models.insert(name.into(), def);
    }

    /// Add every `*.json` model definition in `dir`, keyed by file stem.
    ///
    /// Returns the number of models added. A malformed file aborts the load.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let mut added = 0;
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            let Some(name) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            let content = std::fs::read_to_string(&path)?;
            let def: ModelDefinition = serde_json::from_str(&content)
                .map_err(|e| AnnoError::config(format!("{}: {e}", path.display())))?;
            debug!(model = %name, path = %path.display(), "Loaded model definition");
            self.insert(name, def);
            added += 1;
        }
        Ok(added)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn definition(&self, name: &str) -> Option<&ModelDefinition> {
        self.models.get(name)
    }

    /// Build the named model, validating its parameters.
    pub fn get(&self, name: &str) -> Result<OrdinalModel> {
        let def = self.models.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.names().collect();
            AnnoError::config(format!(
                "unknown model '{name}', known models: {}",
                known.join(", ")
            ))
        })?;
        OrdinalModel::from_definition(def).map_err(|e| match e {
            AnnoError::Config(msg) => AnnoError::config(format!("model '{name}': {msg}")),
            other => other,
        })
    }
}

fn definition(
    systems: &[&str],
    coefficients: &[f64],
    thresholds: &[f64],
    annotator: &[f64],
    document: Option<&[f64]>,
) -> ModelDefinition {
    ModelDefinition {
        system_names: systems.iter().map(|s| s.to_string()).collect(),
        coefficients: coefficients.to_vec(),
        thresholds: thresholds.to_vec(),
        random_effects: RandomEffects {
            annotator: annotator.to_vec(),
            document: document.map(<[f64]>::to_vec),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        let catalog = ModelCatalog::builtin();
        let names: Vec<&str> = catalog.names().collect();
        assert_eq!(
            names,
            vec![
                "likertD:cnn_dailymail",
                "likertD:multi_news",
                "likertD:multi_news:modified",
                "ranking:multi_news",
                "ranking:multi_news:modified",
            ]
        );
    }

    #[test]
    fn test_likert_models_validate() {
        let catalog = ModelCatalog::builtin();
        let mn = catalog.get("likertD:multi_news:modified").unwrap();
        assert_eq!(mn.category_count(), 7);
        assert!((mn.coefficients()[1] - (-3.4401 + 0.176)).abs() < 1e-12);

        let cnn = catalog.get("likertD:cnn_dailymail").unwrap();
        assert_eq!(cnn.systems().len(), 5);
        assert!(cnn.has_document_effects());
    }

    #[test]
    fn test_indefinite_ranking_covariance_rejected() {
        let catalog = ModelCatalog::builtin();
        // Both ranking models share the same annotator covariance.
        for name in ["ranking:multi_news", "ranking:multi_news:modified"] {
            let err = catalog.get(name).unwrap_err();
            let message = err.to_string();
            assert!(message.contains("positive semi-definite"), "{message}");
            assert!(message.contains(&format!("model '{name}'")), "{message}");
        }
    }

    #[test]
    fn test_unknown_model_lists_known() {
        let err = ModelCatalog::builtin().get("likertD:xsum").unwrap_err();
        assert!(err.to_string().contains("likertD:multi_news"));
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        let def = ModelCatalog::builtin()
            .definition("likertD:multi_news")
            .cloned()
            .unwrap();
        std::fs::write(
            dir.path().join("custom.json"),
            serde_json::to_string(&def).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut catalog = ModelCatalog::new();
        assert_eq!(catalog.load_dir(dir.path()).unwrap(), 1);
        assert!(catalog.get("custom").is_ok());
    }
}
