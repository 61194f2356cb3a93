//! Subcommand handlers.

use std::path::{Path, PathBuf};
use std::time::Instant;

use annopower_core::config::{RegressionConfig, workspace_config_path};
use annopower_core::experiments::{
    grouped_subsample_reliability, load_annotator_times, run_art_experiment,
    run_art_experiment_fixed_budget, run_detection_power, run_pseudo_power,
    split_half_reliability, test_design_power, time_reliability_curve, type1_error_rates,
};
use annopower_core::results::{
    detection_log_to_csv, detection_rates_to_csv, pair_p_values_to_csv, power_rows_to_csv,
    pseudo_power_rows_to_csv, reliability_points_to_csv, split_half_to_csv,
    time_reliability_points_to_csv, type1_rows_to_csv,
};
use annopower_core::{
    AnnoConfig, AnnotationTable, DesignMode, ExperimentSettings, ModelCatalog, OrdinalModel,
    RegressionMode, ScriptRegression, SystemPair, create_design,
};
use tracing::{debug, info};

use crate::{Commands, ConfigAction, DesignArgs, Tuning};

/// Detection runs use single-annotator blocks of this many documents.
const DETECTION_DOCUMENTS_PER_BLOCK: usize = 5;

fn default_detection_pairs() -> Vec<SystemPair> {
    vec![
        ("__REFERENCE__".to_string(), "BART".to_string()),
        ("abssentrw".to_string(), "onmt_pg".to_string()),
    ]
}

pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    tuning: &Tuning,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace).await,
        command => {
            let config = load_tuned_config(workspace, tuning)?;
            run_experiment(command, workspace, &config).await
        }
    }
}

fn load_tuned_config(workspace: &Path, tuning: &Tuning) -> anyhow::Result<AnnoConfig> {
    let mut config = annopower_core::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    if let Some(trials) = tuning.trials {
        config.experiment.trials = trials;
    }
    if let Some(seed) = tuning.seed {
        config.experiment.seed = seed;
    }
    if let Some(concurrency) = tuning.concurrency {
        config.experiment.max_concurrency = concurrency;
    }
    debug!(?config, "Effective configuration");
    Ok(config)
}

async fn run_experiment(
    command: Commands,
    workspace: &Path,
    config: &AnnoConfig,
) -> anyhow::Result<()> {
    let settings = ExperimentSettings::from(&config.experiment);
    let started = Instant::now();

    match command {
        Commands::Sample {
            model,
            out_file,
            design,
            zero_coefficients,
        } => {
            let model = load_model(&model, workspace, config, zero_coefficients)?;
            let (blocks, documents, annotators) = design_dimensions(&design, config);
            let table = model.sample(
                &create_design(blocks, documents, annotators),
                &mut settings.trial_rng(0),
            );
            let out = resolve(workspace, &out_file);
            ensure_parent(&out)?;
            table.write_csv(&out, &config.regression.score_column)?;
            println!("Wrote {} annotations to {}", table.len(), out.display());
        }
        Commands::DesignPower {
            model,
            out_file,
            design,
            zero_coefficients,
            nested,
        } => {
            let model = load_model(&model, workspace, config, zero_coefficients)?;
            let (blocks, documents, annotators) = design_dimensions(&design, config);
            let mode = config.regression.simulation_mode(if nested {
                DesignMode::Nested
            } else {
                DesignMode::for_block_annotators(annotators)
            });
            info!(blocks, documents, annotators, mode = %mode, "Testing design power");
            let backend = regression_backend(&config.regression, workspace);
            let rows = test_design_power(
                &model,
                &create_design(blocks, documents, annotators),
                &mode,
                &backend,
                &settings,
            )
            .await;
            write_output(workspace, &out_file, &pair_p_values_to_csv(&rows))?;
        }
        Commands::DetectionPower {
            model,
            blocks,
            pairs,
            log_file,
            out,
        } => {
            let model = load_model(&model, workspace, config, false)?;
            let pairs = if pairs.is_empty() {
                default_detection_pairs()
            } else {
                pairs
            };
            for (better, worse) in &pairs {
                for system in [better, worse] {
                    if model.coefficient_of(system).is_none() {
                        anyhow::bail!("System '{}' is not part of the model", system);
                    }
                }
            }
            let backend = regression_backend(&config.regression, workspace);
            let summary = run_detection_power(
                &model,
                &create_design(blocks, DETECTION_DOCUMENTS_PER_BLOCK, 1),
                &config.regression.simulation_mode(DesignMode::Nested),
                &pairs,
                &backend,
                &settings,
            )
            .await;
            if let Some(log_file) = log_file {
                write_output(workspace, &log_file, &detection_log_to_csv(&summary))?;
            }
            match out {
                Some(out) => write_output(workspace, &out, &detection_rates_to_csv(&summary))?,
                None => {
                    for ((better, worse), rate) in summary.rates() {
                        println!("{better} > {worse}: {rate:.3}");
                    }
                }
            }
        }
        Commands::Type1 {
            model,
            out_file,
            points,
        } => {
            let model = load_model(&model, workspace, config, false)?;
            let rows = type1_error_rates(&model, &points, &settings)?;
            write_output(workspace, &out_file, &type1_rows_to_csv(&rows))?;
        }
        Commands::Art {
            model,
            out_file,
            annotators,
            blocks,
        } => {
            let model = load_model(&model, workspace, config, false)?;
            let rows = run_art_experiment(&model, annotators, &blocks, &settings)?;
            write_output(workspace, &out_file, &power_rows_to_csv(&rows))?;
        }
        Commands::ArtBudget {
            model,
            out_file,
            budget,
            annotators,
            blocks,
        } => {
            let model = load_model(&model, workspace, config, false)?;
            let rows =
                run_art_experiment_fixed_budget(&model, budget, annotators, &blocks, &settings)?;
            write_output(workspace, &out_file, &power_rows_to_csv(&rows))?;
        }
        Commands::PseudoPower {
            annotation_file,
            out_file,
            nested,
            score,
        } => {
            let score = score.unwrap_or_else(|| config.regression.score_column.clone());
            let table = load_annotations(workspace, &annotation_file, &score)?;
            let mode = RegressionMode::new(if nested {
                DesignMode::Nested
            } else {
                DesignMode::Crossed
            });
            let backend =
                regression_backend(&config.regression, workspace).with_score_column(score);
            let rows = run_pseudo_power(&table, &mode, &backend, &settings).await?;
            write_output(workspace, &out_file, &pseudo_power_rows_to_csv(&rows))?;
        }
        Commands::Reliability {
            annotation_file,
            out_file,
            crossed,
            limit,
            score,
        } => {
            let score = score.unwrap_or_else(|| config.regression.score_column.clone());
            let table = load_annotations(workspace, &annotation_file, &score)?;
            let points =
                grouped_subsample_reliability(&table, crossed, limit, &mut settings.trial_rng(0))?;
            write_output(workspace, &out_file, &reliability_points_to_csv(&points))?;
        }
        Commands::TimeReliability {
            annotation_file,
            times_file,
            out_file,
            max_combinations,
            score,
        } => {
            let score = score.unwrap_or_else(|| config.regression.score_column.clone());
            let table = load_annotations(workspace, &annotation_file, &score)?;
            let times = load_annotator_times(&resolve(workspace, &times_file))?;
            let points = time_reliability_curve(
                &table,
                &times,
                max_combinations,
                &mut settings.trial_rng(0),
            )?;
            write_output(workspace, &out_file, &time_reliability_points_to_csv(&points))?;
        }
        Commands::SplitHalf {
            annotation_file,
            out_file,
            limit,
            scores,
        } => {
            let scores = if scores.is_empty() {
                vec![config.regression.score_column.clone()]
            } else {
                scores
            };
            let mut summaries = Vec::with_capacity(scores.len());
            for (idx, score) in scores.into_iter().enumerate() {
                let table = load_annotations(workspace, &annotation_file, &score)?;
                let summary = split_half_reliability(&table, limit, &mut settings.trial_rng(idx))?;
                println!(
                    "{score}: correlation {:.3} (var {:.4}), MAE {:.3} (var {:.4})",
                    summary.correlation_mean,
                    summary.correlation_variance,
                    summary.mae_mean,
                    summary.mae_variance
                );
                summaries.push((score, summary));
            }
            write_output(workspace, &out_file, &split_half_to_csv(&summaries))?;
        }
        Commands::Models => {
            let catalog = load_catalog(workspace, config)?;
            for name in catalog.names() {
                let systems = catalog
                    .definition(name)
                    .map(|def| def.system_names.len())
                    .unwrap_or_default();
                println!("{name} ({systems} systems)");
            }
        }
        Commands::Config { action } => return handle_config(action, workspace).await,
    }

    info!(elapsed_ms = started.elapsed().as_millis() as u64, "Done");
    Ok(())
}

async fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if let Some(config_dir) = config_path.parent() {
                std::fs::create_dir_all(config_dir)?;
            }

            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let default_config = AnnoConfig::default();
            let toml_str = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = annopower_core::load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

fn resolve(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn write_output(workspace: &Path, path: &Path, content: &str) -> anyhow::Result<()> {
    let path = resolve(workspace, path);
    ensure_parent(&path)?;
    std::fs::write(&path, content)
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", path.display(), e))?;
    println!("Results written to: {}", path.display());
    Ok(())
}

fn design_dimensions(design: &DesignArgs, config: &AnnoConfig) -> (usize, usize, usize) {
    (
        design.blocks.unwrap_or(config.experiment.blocks),
        design.documents.unwrap_or(config.experiment.documents_per_block),
        design.annotators.unwrap_or(config.experiment.annotators_per_block),
    )
}

fn load_catalog(workspace: &Path, config: &AnnoConfig) -> anyhow::Result<ModelCatalog> {
    let mut catalog = ModelCatalog::builtin();
    if let Some(dir) = &config.catalog.model_dir {
        let dir = resolve(workspace, dir);
        let added = catalog
            .load_dir(&dir)
            .map_err(|e| anyhow::anyhow!("Failed to load models from {}: {}", dir.display(), e))?;
        debug!(added, dir = %dir.display(), "Extended model catalog");
    }
    Ok(catalog)
}

/// A `.json` argument is read as a model file; anything else is a catalog name.
fn load_model(
    name: &str,
    workspace: &Path,
    config: &AnnoConfig,
    zero_coefficients: bool,
) -> anyhow::Result<OrdinalModel> {
    let model = if name.ends_with(".json") {
        OrdinalModel::from_file(&resolve(workspace, Path::new(name)))?
    } else {
        load_catalog(workspace, config)?.get(name)?
    };
    info!(
        model = name,
        systems = model.systems().len(),
        categories = model.category_count(),
        "Loaded model"
    );
    Ok(if zero_coefficients {
        model.zero_coefficients()
    } else {
        model
    })
}

fn load_annotations(workspace: &Path, path: &Path, score: &str) -> anyhow::Result<AnnotationTable> {
    let table = AnnotationTable::from_csv_path(&resolve(workspace, path), score)?;
    info!(
        rows = table.len(),
        systems = table.systems().len(),
        "Loaded annotations"
    );
    Ok(table)
}

fn regression_backend(config: &RegressionConfig, workspace: &Path) -> ScriptRegression {
    let mut config = config.clone();
    config.script = resolve(workspace, &config.script);
    ScriptRegression::from_config(&config)
}
