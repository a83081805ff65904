use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use sumarena::aggregate::NormalizedScores;
use sumarena::config::BenchConfig;
use sumarena::phase::Phase;
use sumarena::report::{JsonReportSink, ReportSink};
use sumarena::store::Store;
use sumarena::store::models::{CodebaseInfo, RunStatus};

#[derive(Parser)]
#[command(name = "sumarena")]
#[command(version, about = "Resumable benchmark pipeline for code-summarization models")]
struct Cli {
    /// Path to the benchmark database.
    #[arg(long, default_value = "sumarena.db", global = true)]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new benchmark run from a config file.
    Create {
        /// Run name.
        #[arg(short, long)]
        name: String,
        /// Path to sumarena.toml.
        #[arg(short, long, default_value = "sumarena.toml")]
        config: PathBuf,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// List runs, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Show a run's phase progress.
    Status { run_id: String },
    /// Render the aggregated scores of a run to a JSON report.
    Report {
        run_id: String,
        #[arg(short, long, default_value = "report.json")]
        out: PathBuf,
    },
    /// Delete a run and everything attached to it.
    Delete {
        run_id: String,
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sumarena=info")),
        )
        .init();

    let cli = Cli::parse();
    let store = Store::open(&cli.db).context("Failed to open benchmark database")?;

    match cli.command {
        Commands::Create {
            name,
            config,
            description,
        } => {
            let config = BenchConfig::load(&config)?;
            let run = store.create_run(&name, &description, &config, &CodebaseInfo::default())?;
            println!("Created run {} ({})", run.id, run.name);
        }
        Commands::List { status } => {
            let status = match status.as_deref() {
                Some(s) => Some(
                    RunStatus::from_str(s).map_err(|e| anyhow::anyhow!(e))?,
                ),
                None => None,
            };
            let runs = store.list_runs(status)?;
            if runs.is_empty() {
                println!("No runs found");
                return Ok(());
            }
            for run in runs {
                println!(
                    "{}  {:<10}  {:<24}  {}",
                    run.id,
                    run.status.as_str(),
                    run.current_phase.map(|p| p.as_str()).unwrap_or("-"),
                    run.name
                );
            }
        }
        Commands::Status { run_id } => {
            let run = store.get_run(&run_id)?;
            println!("Run {} ({})", run.id, run.name);
            println!("  status: {}", run.status.as_str());
            if let Some(phase) = run.current_phase {
                println!("  current phase: {}", phase);
            }
            if let Some(error) = &run.error {
                println!("  error: {}", error);
            }
            for phase in Phase::ORDER {
                if let Some(progress) = store.get_phase_progress(&run_id, phase)? {
                    let mark = if progress.is_complete() { "done" } else { "open" };
                    println!(
                        "  {:<24} {:>6}/{:<6} {}",
                        phase.as_str(),
                        progress.completed,
                        progress.total,
                        mark
                    );
                }
            }
        }
        Commands::Report { run_id, out } => {
            let run = store.get_run(&run_id)?;
            let scores: Vec<(String, NormalizedScores)> = store.get_aggregated_scores(&run_id)?;
            if scores.is_empty() {
                anyhow::bail!("run {} has no aggregated scores yet", run_id);
            }
            JsonReportSink::new(out.clone()).write(&run, &scores)?;
            println!("Wrote report for {} models to {}", scores.len(), out.display());
        }
        Commands::Delete { run_id, force } => {
            if !force {
                anyhow::bail!("refusing to delete {} without --force", run_id);
            }
            if store.delete_run(&run_id)? {
                println!("Deleted run {}", run_id);
            } else {
                println!("Run {} not found", run_id);
            }
        }
    }
    Ok(())
}
