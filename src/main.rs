use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use athena_orchestrator::api::{self, AppState};
use athena_orchestrator::{AgentManager, Config};

#[derive(Parser)]
#[command(name = "athena-orchestrator")]
#[command(about = "Orchestrates capability-advertising analysis agents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator and its HTTP API
    Serve {
        #[arg(short, long, help = "Path to a TOML config file")]
        config: Option<PathBuf>,
        #[arg(short, long, help = "Override the listening port")]
        port: Option<u16>,
    },
    /// Write the default configuration to a file
    InitConfig {
        #[arg(default_value = "athena.toml")]
        path: PathBuf,
    },
    /// Print the effective configuration
    ShowConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port } => serve(config, port).await?,
        Commands::InitConfig { path } => init_config(&path)?,
        Commands::ShowConfig { config } => {
            let config = Config::resolve(config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn serve(config_path: Option<PathBuf>, port: Option<u16>) -> Result<()> {
    init_logging();

    let mut config = Config::resolve(config_path.as_deref())?;
    if let Some(port) = port {
        config.server.port = port;
    }

    let manager = Arc::new(AgentManager::new(config));
    manager
        .initialize()
        .context("Failed to initialize agent manager")?;

    api::serve(AppState { manager }).await
}

fn init_config(path: &std::path::Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists; remove it or edit it directly", path.display());
    }
    std::fs::write(path, Config::default_toml())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
