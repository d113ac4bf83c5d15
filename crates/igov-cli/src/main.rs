use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use igov_governance::{governance_from_env, ReportRange};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "igov-cli")]
#[command(about = "Image URL governance command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan read-only and print the preview job.
    Preview {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Execute a stored preview, or rescan and execute when it is unknown.
    Execute {
        #[arg(long)]
        job_id: Option<String>,
        /// Per-kind limit for the rescan path.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Write today's preview snapshot.
    Snapshot,
    /// Print the daily analytics report.
    Report {
        #[arg(long, default_value = "week")]
        range: ReportRange,
    },
    /// Serve the HTTP API and run the snapshot scheduler when enabled.
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("IGOV_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serializing output")?;
    println!("{text}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Preview { limit: None }) {
        Commands::Preview { limit } => {
            let governance = governance_from_env().await?;
            let job = governance.preview(limit).await;
            print_json(job.as_ref())?;
        }
        Commands::Execute { job_id, limit } => {
            let governance = governance_from_env().await?;
            let outcome = governance.execute(job_id.as_deref(), limit).await;
            print_json(&outcome)?;
        }
        Commands::Snapshot => {
            let governance = governance_from_env().await?;
            let stored = governance.snapshot_once().await?;
            println!("snapshot written: {}", stored.absolute_path.display());
        }
        Commands::Report { range } => {
            let governance = governance_from_env().await?;
            print_json(&governance.daily_report(range).await)?;
        }
        Commands::Serve => igov_web::serve_from_env().await?,
    }

    Ok(())
}
