#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;

use radsel::config::PipelineConfig;
use radsel::data::load_cohort;
use radsel::export::export_study;
use radsel::metrics::evaluate;
use radsel::model::ModelArtifact;
use radsel::pipeline::run_study;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the tab separated cohort table
    pub data: String,

    /// Path to the TOML run configuration
    #[arg(long)]
    pub config: String,

    /// Directory for tables and model artifacts
    #[arg(long, default_value = "radsel_out")]
    pub out: PathBuf,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Path to the tab separated table to score
    pub data: String,

    /// Path to the TOML run configuration (column names and feature schema)
    #[arg(long)]
    pub config: String,

    /// Path to a model artifact written by `radsel run`
    #[arg(long)]
    pub model: String,

    /// Output file for per-subject predictions
    #[arg(long, default_value = "predictions.tsv")]
    pub out: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "radsel",
    about = "Leakage-resistant feature selection and validation for binary diagnostic models"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Partition, select, fit and validate every configured model type
    #[command(about = "Run the full study (outputs: metrics, coefficients, models, failures)")]
    Run(RunArgs),

    /// Apply a saved model to new data
    #[command(about = "Score new subjects with a saved model (outputs: predictions.tsv)")]
    Predict(PredictArgs),

    /// Display version and build information
    Version,
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading configuration from: {}", args.config);
    let config = PipelineConfig::load(&args.config)?;

    println!("Loading cohort from: {}", args.data);
    let loaded = load_cohort(&args.data, &config.table_layout()?)?;
    println!(
        "Loaded {} subjects ({} malignant); excluded {} of {} rows with missing values.",
        loaded.cohort.len(),
        loaded.cohort.n_positive(),
        loaded.excluded_rows,
        loaded.total_rows
    );

    let report = run_study(&loaded.cohort, &config)?;
    for model in &report.models {
        println!(
            "{}: {} features selected ({})",
            model.model_type,
            model.fit.selected.len(),
            model.fit.selected.names.join(", ")
        );
        for (name, metrics) in &model.partition_reports {
            println!(
                "  {:<10} AUC {:.3} [{:.3}, {:.3}]  sens {:.3}  spec {:.3}  acc {:.3}  MCC {:.3}",
                name.as_str(),
                metrics.auc,
                metrics.auc_ci_lower,
                metrics.auc_ci_upper,
                metrics.sensitivity,
                metrics.specificity,
                metrics.accuracy,
                metrics.mcc
            );
        }
        let summary = model.nested.summary();
        println!(
            "  nested     AUC {:.3} ± {:.3} over {} folds ({} failed)",
            summary.auc.mean, summary.auc.sd, summary.completed_folds, summary.failed_folds
        );
    }

    let written = export_study(&report, &args.out)?;
    println!("Wrote {} files to {}", written.len(), args.out.display());
    Ok(())
}

fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig::load(&args.config)?;
    let artifact = ModelArtifact::load(&args.model)?;
    println!(
        "Loaded {} model with {} terms (threshold {:.4})",
        artifact.model_type,
        artifact.model.terms.len(),
        artifact.decision_threshold
    );

    let loaded = load_cohort(&args.data, &config.table_layout()?)?;
    let cohort = loaded.cohort;
    let (probs, calls) = artifact.predict(&cohort)?;
    let probs = probs.to_vec();
    write_predictions(&args.out, cohort.subject_ids(), &probs, &calls)?;
    println!("Predictions for {} subjects written to {}", cohort.len(), args.out.display());

    match evaluate(
        &probs,
        &cohort.labels(),
        Some(artifact.decision_threshold),
        &config.metrics,
        config.seed,
    ) {
        Ok(metrics) => println!(
            "AUC {:.3} [{:.3}, {:.3}]  sens {:.3}  spec {:.3}  MCC {:.3}",
            metrics.auc,
            metrics.auc_ci_lower,
            metrics.auc_ci_upper,
            metrics.sensitivity,
            metrics.specificity,
            metrics.mcc
        ),
        Err(e) => println!("Metrics not reported: {e}"),
    }
    Ok(())
}

fn write_predictions(
    path: &Path,
    ids: &[String],
    probs: &[f64],
    calls: &[bool],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut w = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    w.write_record(["subject_id", "probability", "malignant_call"])?;
    for ((id, p), call) in ids.iter().zip(probs).zip(calls) {
        w.write_record([id.clone(), p.to_string(), u8::from(*call).to_string()])?;
    }
    w.flush()?;
    Ok(())
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    if seconds < MINUTE {
        format!("{seconds} seconds ago")
    } else if seconds < HOUR {
        format!("{:.1} minutes ago", seconds as f64 / MINUTE as f64)
    } else if seconds < DAY {
        format!("{:.1} hours ago", seconds as f64 / HOUR as f64)
    } else {
        format!("{:.1} days ago", seconds as f64 / DAY as f64)
    }
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let build_timestamp: u64 = env!("RADSEL_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("radsel {version}");
    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(|e| e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
