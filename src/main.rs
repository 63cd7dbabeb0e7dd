use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use weather_edge_engine::config::{Config, EnvConfig};
use weather_edge_engine::data::types::ScanInput;
use weather_edge_engine::execution::executor::ExecutionAdapter;
use weather_edge_engine::execution::persistence::Database;
use weather_edge_engine::pipeline::DecisionPipeline;

const OPERATOR_SOURCE: &str = "cli";

#[derive(Parser)]
#[command(name = "weather-edge")]
#[command(about = "Weather market decision engine", long_about = None)]
struct Cli {
    /// Path to the TOML config
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scan cycle over an ingestion snapshot (JSON)
    Scan {
        #[arg(long)]
        snapshot: String,

        /// Overrides the snapshot's run id
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Mark open positions and exit those at the exit price
    Exit {
        /// JSON object of market id -> yes price
        #[arg(long = "prices")]
        prices_path: String,

        #[arg(long, default_value = "")]
        run_id: String,
    },

    /// Print system state, open positions and the latest run
    Status,

    /// Stop new scan cycles
    Pause,

    /// Allow scan cycles again
    Resume,

    /// Block or unblock all order dispatch
    KillSwitch {
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Print every stored row for one run
    Audit { run_id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    let env_config = EnvConfig::load();

    info!("Opening database: {}", config.system.database_path);
    let db = Arc::new(Database::open(&config.system.database_path)?);
    let adapter = ExecutionAdapter::from_config(&config.execution, &env_config)
        .context("Failed to configure execution")?;
    info!("Execution mode: {}", adapter.mode());

    let pipeline = DecisionPipeline::new(config, db.clone(), adapter)?;
    let now = Utc::now();

    match cli.cmd {
        Commands::Scan { snapshot, run_id } => {
            let raw = fs::read_to_string(&snapshot)
                .with_context(|| format!("Failed to read snapshot: {}", snapshot))?;
            let mut input: ScanInput = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid snapshot: {}", snapshot))?;
            if let Some(run_id) = run_id {
                input.run_id = run_id;
            }
            let report = pipeline.run_scan(&input, now).await?;
            print_json(&report.summary)?;
        }
        Commands::Exit { prices_path, run_id } => {
            let raw = fs::read_to_string(&prices_path)
                .with_context(|| format!("Failed to read prices: {}", prices_path))?;
            let prices: BTreeMap<String, f64> =
                serde_json::from_str(&raw).with_context(|| format!("Invalid prices file: {}", prices_path))?;
            let report = pipeline.run_exit(&run_id, &prices, now).await?;
            print_json(&report.summary)?;
        }
        Commands::Status => print_json(&pipeline.status().await?)?,
        Commands::Pause => pipeline.pause(OPERATOR_SOURCE, now).await?,
        Commands::Resume => pipeline.resume(OPERATOR_SOURCE, now).await?,
        Commands::KillSwitch { state } => {
            let active = matches!(state, Toggle::On);
            pipeline.set_kill_switch(active, OPERATOR_SOURCE, now).await?;
        }
        Commands::Audit { run_id } => print_json(&db.run_audit(&run_id)?)?,
    }

    Ok(())
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
