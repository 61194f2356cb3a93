//! annopower CLI: simulate annotation studies and estimate their power.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// annopower: power analysis for ordinal human evaluation designs
#[derive(Parser, Debug)]
#[command(name = "annopower", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds `.annopower/config.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    command: Commands,
}

/// Per-run overrides of the `[experiment]` configuration section.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct Tuning {
    /// Number of simulated trials per design point
    #[arg(long, global = true)]
    pub trials: Option<usize>,

    /// Base random seed
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    /// Maximum concurrent regression processes
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Draw one synthetic annotation table from a model
    Sample {
        /// Catalog name or path to a model JSON file
        model: String,
        /// Output CSV
        out_file: PathBuf,
        #[command(flatten)]
        design: DesignArgs,
        /// Use the null model (all coefficients zero)
        #[arg(short = 'z', long)]
        zero_coefficients: bool,
    },
    /// Collect regression p-values over simulated studies of one design
    DesignPower {
        /// Catalog name or path to a model JSON file
        model: String,
        /// Output CSV (`left,right,p_value`)
        out_file: PathBuf,
        #[command(flatten)]
        design: DesignArgs,
        /// Use the null model (all coefficients zero)
        #[arg(short = 'z', long)]
        zero_coefficients: bool,
        /// Analyse as a nested design regardless of annotators per block
        #[arg(short = 'n', long)]
        nested: bool,
    },
    /// Count how often chosen system pairs are detected
    DetectionPower {
        /// Catalog name or path to a model JSON file
        #[arg(default_value = "likertD:multi_news:modified")]
        model: String,
        /// Number of single-annotator blocks of five documents
        #[arg(short = 'b', long, default_value_t = 20)]
        blocks: usize,
        /// Pair of interest as `BETTER:WORSE` (repeatable)
        #[arg(long = "pair", value_parser = parse_pair)]
        pairs: Vec<(String, String)>,
        /// Write per-trial p-values of the pairs to this CSV
        #[arg(short = 'l', long)]
        log_file: Option<PathBuf>,
        /// Write detection rates to this CSV instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Type-I error rates of the t-test and ART on a null model
    Type1 {
        /// Catalog name or path to a model JSON file
        model: String,
        /// Output CSV
        out_file: PathBuf,
        /// Design points as `BLOCKSxDOCUMENTS`, comma separated
        #[arg(long, value_delimiter = ',', value_parser = parse_point, default_value = "5x5,10x5,20x5")]
        points: Vec<(usize, usize)>,
    },
    /// ART power of single- versus multi-annotator blocks at equal effort
    Art {
        /// Catalog name or path to a model JSON file
        model: String,
        /// Output CSV
        out_file: PathBuf,
        /// Annotators per block in the multi-annotator arm
        #[arg(short = 'a', long, default_value_t = 3)]
        annotators: usize,
        /// Block counts, comma separated
        #[arg(short = 'b', long, value_delimiter = ',', default_value = "5,10,15,20")]
        blocks: Vec<usize>,
    },
    /// ART power when a fixed document budget is spread over blocks
    ArtBudget {
        /// Catalog name or path to a model JSON file
        model: String,
        /// Output CSV
        out_file: PathBuf,
        /// Documents each annotator can rate
        #[arg(long, default_value_t = 100)]
        budget: usize,
        /// Annotators per block
        #[arg(short = 'a', long, default_value_t = 3)]
        annotators: usize,
        /// Block counts, comma separated
        #[arg(short = 'b', long, value_delimiter = ',', default_value = "1,2,5,10,20")]
        blocks: Vec<usize>,
    },
    /// Agreement of regressions on annotator subsamples with the full data
    PseudoPower {
        /// Annotation CSV
        annotation_file: PathBuf,
        /// Output CSV
        out_file: PathBuf,
        /// Subsample one annotator per group and analyse as nested
        #[arg(short = 'n', long)]
        nested: bool,
        /// Score column (defaults to `regression.score_column`)
        #[arg(long)]
        score: Option<String>,
    },
    /// Correlation of subsample system means with the full-data means
    Reliability {
        /// Annotation CSV
        annotation_file: PathBuf,
        /// Output CSV
        out_file: PathBuf,
        /// Keep whole annotator groups instead of one annotator per group
        #[arg(long)]
        crossed: bool,
        /// Random subsets per sample size
        #[arg(long, default_value_t = 10_000)]
        limit: usize,
        #[arg(long)]
        score: Option<String>,
    },
    /// Correlation against total annotation time for group combinations
    TimeReliability {
        /// Annotation CSV
        annotation_file: PathBuf,
        /// Annotator time CSV (`annotator,<seconds>`)
        times_file: PathBuf,
        /// Output CSV
        out_file: PathBuf,
        /// Combinations per group count
        #[arg(long, default_value_t = 500)]
        max_combinations: usize,
        #[arg(long)]
        score: Option<String>,
    },
    /// Split-half reliability of system means
    SplitHalf {
        /// Annotation CSV
        annotation_file: PathBuf,
        /// Output CSV
        out_file: PathBuf,
        /// Random splits
        #[arg(long, default_value_t = 1000)]
        limit: usize,
        /// Score columns, comma separated
        #[arg(long, value_delimiter = ',')]
        scores: Vec<String>,
    },
    /// List the available models
    Models,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Blocked design dimensions.
#[derive(clap::Args, Debug, Clone)]
pub struct DesignArgs {
    /// Number of blocks
    #[arg(short = 'b', long = "blocks")]
    pub blocks: Option<usize>,
    /// Documents per block
    #[arg(short = 'd', long = "docs")]
    pub documents: Option<usize>,
    /// Annotators per block
    #[arg(short = 'a', long = "annotators")]
    pub annotators: Option<usize>,
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Write a default configuration to the workspace
    Init,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once(':') {
        Some((a, b)) if !a.is_empty() && !b.is_empty() => Ok((a.to_string(), b.to_string())),
        _ => Err(format!("expected BETTER:WORSE, got '{s}'")),
    }
}

fn parse_point(s: &str) -> Result<(usize, usize), String> {
    let (blocks, documents) = s
        .split_once('x')
        .ok_or_else(|| format!("expected BLOCKSxDOCUMENTS, got '{s}'"))?;
    let blocks = blocks
        .trim()
        .parse()
        .map_err(|e| format!("invalid block count '{blocks}': {e}"))?;
    let documents = documents
        .trim()
        .parse()
        .map_err(|e| format!("invalid document count '{documents}': {e}"))?;
    Ok((blocks, documents))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "annopower", "annopower")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "annopower.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, &cli.tuning).await
}
