//! Configuration for annopower.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config -> environment variables -> explicit overrides.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::design::{DesignMode, RegressionMode};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnoConfig {
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub regression: RegressionConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// Monte Carlo settings shared by the experiment drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Number of simulated trials per design point.
    #[serde(default = "default_trials")]
    pub trials: usize,
    /// Base seed; trial `i` derives its own generator from `(seed, i)`.
    #[serde(default)]
    pub seed: u64,
    /// Significance level for detections and type-I error counting.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Resampling rounds per approximate randomization test.
    #[serde(default = "default_art_trials")]
    pub art_trials: usize,
    /// Upper bound on regression processes running at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Subsamples drawn per group count in pseudo-power runs.
    #[serde(default = "default_samples_per_size")]
    pub samples_per_size: usize,
    #[serde(default = "default_blocks")]
    pub blocks: usize,
    #[serde(default = "default_documents_per_block")]
    pub documents_per_block: usize,
    #[serde(default = "default_annotators_per_block")]
    pub annotators_per_block: usize,
}

fn default_trials() -> usize {
    1000
}

fn default_alpha() -> f64 {
    0.05
}

fn default_art_trials() -> usize {
    crate::significance::DEFAULT_ART_TRIALS
}

fn default_max_concurrency() -> usize {
    std::thread::available_parallelism().map_or(4, |n| n.get())
}

fn default_samples_per_size() -> usize {
    10
}

fn default_blocks() -> usize {
    20
}

fn default_documents_per_block() -> usize {
    5
}

fn default_annotators_per_block() -> usize {
    3
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            trials: default_trials(),
            seed: 0,
            alpha: default_alpha(),
            art_trials: default_art_trials(),
            max_concurrency: default_max_concurrency(),
            samples_per_size: default_samples_per_size(),
            blocks: default_blocks(),
            documents_per_block: default_documents_per_block(),
            annotators_per_block: default_annotators_per_block(),
        }
    }
}

/// How the external regression is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionConfig {
    #[serde(default = "default_program")]
    pub program: PathBuf,
    #[serde(default = "default_script")]
    pub script: PathBuf,
    /// Name of the score column in the CSV handed to the script.
    #[serde(default = "default_score_column")]
    pub score_column: String,
    /// Per-invocation timeout; 0 disables it.
    #[serde(default)]
    pub timeout_secs: u64,
    /// Suffix appended as `<design>:<suffix>` to the mode of simulated
    /// studies. Empty sends the bare design.
    #[serde(default = "default_mode_extra")]
    pub mode_extra: String,
}

fn default_program() -> PathBuf {
    PathBuf::from("Rscript")
}

fn default_script() -> PathBuf {
    PathBuf::from("scripts/r/analyse-ordinal.r")
}

fn default_score_column() -> String {
    "score".to_string()
}

fn default_mode_extra() -> String {
    "none".to_string()
}

impl RegressionConfig {
    /// Regression mode for a simulated study analysed as `design`.
    pub fn simulation_mode(&self, design: DesignMode) -> RegressionMode {
        let mode = RegressionMode::new(design);
        if self.mode_extra.is_empty() {
            mode
        } else {
            mode.with_extra(self.mode_extra.clone())
        }
    }
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            script: default_script(),
            score_column: default_score_column(),
            timeout_secs: 0,
            mode_extra: default_mode_extra(),
        }
    }
}

/// Where additional model definitions are found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Directory of `*.json` model definitions added to the built-in catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_dir: Option<PathBuf>,
}

/// Location of the user-level config file, if a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "annopower", "annopower")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Location of the workspace config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".annopower").join("config.toml")
}

/// Load configuration from all layers.
///
/// Priority (highest first):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `ANNOPOWER_`)
/// 3. Workspace-local config (`.annopower/config.toml`)
/// 4. User config (`~/.config/annopower/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&AnnoConfig>,
) -> Result<AnnoConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(AnnoConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // ANNOPOWER_EXPERIMENT__TRIALS, ANNOPOWER_REGRESSION__PROGRAM, ...
    figment = figment.merge(Env::prefixed("ANNOPOWER_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AnnoConfig::default();
        assert_eq!(config.experiment.trials, 1000);
        assert_eq!(config.experiment.alpha, 0.05);
        assert_eq!(config.experiment.samples_per_size, 10);
        assert!(config.experiment.max_concurrency >= 1);
        assert_eq!(config.regression.program, PathBuf::from("Rscript"));
        assert_eq!(config.regression.score_column, "score");
        assert_eq!(config.regression.mode_extra, "none");
        assert!(config.catalog.model_dir.is_none());
    }

    #[test]
    fn test_simulation_mode_suffix() {
        let mut regression = RegressionConfig::default();
        assert_eq!(
            regression.simulation_mode(DesignMode::Crossed).to_string(),
            "crossed:none"
        );
        assert_eq!(
            regression.simulation_mode(DesignMode::Nested).to_string(),
            "nested:none"
        );

        regression.mode_extra = String::new();
        assert_eq!(
            regression.simulation_mode(DesignMode::Nested).to_string(),
            "nested"
        );
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = AnnoConfig::default();
        overrides.experiment.trials = 50;
        overrides.regression.timeout_secs = 120;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.experiment.trials, 50);
        assert_eq!(config.regression.timeout_secs, 120);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join(".annopower");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            r#"
[experiment]
trials = 200
seed = 7

[regression]
script = "r/fit.r"
score_column = "coherence_score"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.experiment.trials, 200);
        assert_eq!(config.experiment.seed, 7);
        // Unset keys keep their defaults.
        assert_eq!(config.experiment.art_trials, 1000);
        assert_eq!(config.regression.script, PathBuf::from("r/fit.r"));
        assert_eq!(config.regression.score_column, "coherence_score");
        assert_eq!(config.regression.program, PathBuf::from("Rscript"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = AnnoConfig::default();
        config.catalog.model_dir = Some(PathBuf::from("models"));
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AnnoConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: AnnoConfig = toml::from_str("[experiment]\nalpha = 0.01\n").unwrap();
        assert_eq!(parsed.experiment.alpha, 0.01);
        assert_eq!(parsed.experiment.trials, 1000);
        assert_eq!(parsed.regression, RegressionConfig::default());
    }
}
