use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgestat::MaintenanceTask;
use edgestat_config::RuntimeConfig;
use std::path::PathBuf;

/// Edge traffic statistics service
#[derive(Parser)]
#[command(name = "edgestat")]
#[command(version)]
#[command(about = "Ingest gateway traffic events, aggregate and publish statistics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// HTTP listen port (overrides config file)
    #[arg(short, long, value_name = "PORT", global = true)]
    port: Option<u16>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server and background workers (default)
    Serve,
    /// Run one maintenance task and print its report
    Run {
        #[arg(value_enum)]
        task: MaintenanceTask,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = if let Some(config_path) = &cli.config {
        RuntimeConfig::load_from_path(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        RuntimeConfig::load().context("Failed to load configuration")?
    };

    apply_cli_overrides(&mut config, &cli);
    config.validate().context("Invalid configuration")?;

    // run_with_config initializes tracing again; that's idempotent
    edgestat::init_tracing(&config);

    match cli.command {
        Some(Commands::Run { task }) => run_once(config, task).await,
        Some(Commands::Serve) | None => edgestat::run_with_config(config).await,
    }
}

fn apply_cli_overrides(config: &mut RuntimeConfig, cli: &Cli) {
    if let Some(port) = cli.port {
        config.server.listen_addr = format!("0.0.0.0:{}", port);
    }
    if let Some(level) = &cli.log_level {
        config.server.log_level = level.clone();
    }
}

async fn run_once(config: RuntimeConfig, task: MaintenanceTask) -> Result<()> {
    let stores = edgestat_storage::Stores::open(&config)
        .await
        .context("Failed to open storage")?;
    let state = edgestat::AppState::new(stores, config);
    let report = edgestat::run_task(&state, task).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
