/// Audit binary - checks fact store invariants and extraction progress
///
/// Usage:
///   deal-memory-audit [--db-path <path>] invariants [--json]
///   deal-memory-audit [--db-path <path>] document <document_id> [--pipeline-version v1]
///   deal-memory-audit [--db-path <path>] stats
///
/// Exits with status 1 when `invariants` finds a violation.
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deal_memory_ingestion::{EngineConfig, FactStore};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "deal-memory-audit")]
#[command(about = "Audit the deal knowledge engine's fact store")]
struct Args {
    /// Path to the SQLite fact store (defaults to DB_PATH)
    #[arg(long, short)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report superseded facts without exactly one superseding edge, SUPERSEDES
    /// cycles and facts without a source
    Invariants {
        #[arg(long)]
        json: bool,
    },
    /// Deep extraction progress of one document
    Document {
        document_id: String,
        #[arg(long)]
        pipeline_version: Option<String>,
    },
    /// Row counts
    Stats,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_env();
    let db_path = args
        .db_path
        .unwrap_or_else(|| PathBuf::from(&config.db_path));

    let store = FactStore::open(&db_path)
        .with_context(|| format!("opening fact store at {}", db_path.display()))?;
    info!("Fact store: {}", db_path.display());

    match args.command {
        Command::Invariants { json } => {
            let findings = store.check_invariants().context("checking invariants")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&findings)?);
            } else if findings.is_empty() {
                println!("All invariants hold.");
            } else {
                for finding in &findings {
                    println!("[{}] {}: {}", finding.rule, finding.subject, finding.detail);
                }
            }
            if !findings.is_empty() {
                error!("{} invariant violations", findings.len());
                std::process::exit(1);
            }
        }
        Command::Document {
            document_id,
            pipeline_version,
        } => {
            let version = pipeline_version.unwrap_or(config.pipeline_version);
            let status = store
                .document_status(&document_id, &version)
                .with_context(|| format!("loading status of {}", document_id))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Stats => {
            println!("facts:    {}", store.count_facts()?);
            println!("entities: {}", store.count_entities()?);
        }
    }

    Ok(())
}
