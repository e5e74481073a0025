use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use gantry_cli::shutdown::ShutdownSignal;
use gantry_cli::supervisor::run_supervisor;
use gantry_cli::telemetry::init_tracing;
use gantry_cli::trading::{run_trading, ExitOutcome};
use gantry_config::{load_config, AppConfig};
use tracing::{error, info};

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 2;
const EXIT_HALTED: u8 = 3;
const EXIT_SUPERVISED: u8 = 4;
const EXIT_INTERNAL: u8 = 5;

#[derive(Parser)]
#[command(author, version, about = "Gantry paper-trading control plane")]
struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long, default_value = "default")]
    env: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading process
    RunTrading,
    /// Run the independent supervisor process
    RunSupervisor,
    /// Replay the journal into the analytical store
    Etl(EtlArgs),
}

#[derive(Args)]
struct EtlArgs {
    /// Keep running on an interval instead of a single pass
    #[arg(long)]
    follow: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match load_config(&cli.env) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let filter = match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    runtime.block_on(async move {
        match cli.command {
            Commands::RunTrading => {
                let log_path = config.trading.log_path.clone();
                if let Err(err) = init_tracing(&filter, Some(&log_path)) {
                    eprintln!("failed to install tracing: {err}");
                    return ExitCode::from(EXIT_INTERNAL);
                }
                let shutdown = ShutdownSignal::new();
                match run_trading(config, shutdown).await {
                    Ok(ExitOutcome::Normal) => ExitCode::from(EXIT_OK),
                    Ok(ExitOutcome::HaltSetOnStart) => ExitCode::from(EXIT_HALTED),
                    Ok(ExitOutcome::SupervisorTerminated) => ExitCode::from(EXIT_SUPERVISED),
                    Err(err) => {
                        error!(error = %err, "trading process failed");
                        ExitCode::from(EXIT_INTERNAL)
                    }
                }
            }
            Commands::RunSupervisor => {
                let log_path = config.supervisor.log_path.clone();
                if let Err(err) = init_tracing(&filter, Some(&log_path)) {
                    eprintln!("failed to install tracing: {err}");
                    return ExitCode::from(EXIT_INTERNAL);
                }
                let shutdown = ShutdownSignal::new();
                match run_supervisor(config, shutdown).await {
                    Ok(()) => ExitCode::from(EXIT_OK),
                    Err(err) => {
                        error!(error = %err, "supervisor process failed");
                        ExitCode::from(EXIT_INTERNAL)
                    }
                }
            }
            Commands::Etl(args) => {
                if let Err(err) = init_tracing(&filter, None) {
                    eprintln!("failed to install tracing: {err}");
                    return ExitCode::from(EXIT_INTERNAL);
                }
                match run_etl(&config, args.follow).await {
                    Ok(()) => ExitCode::from(EXIT_OK),
                    Err(err) => {
                        error!(error = %err, "etl failed");
                        ExitCode::from(EXIT_INTERNAL)
                    }
                }
            }
        }
    })
}

async fn run_etl(config: &AppConfig, follow: bool) -> Result<()> {
    let journal_path = config.storage.journal_path.clone();
    let analytics_path = config.storage.analytics_path.clone();
    loop {
        let journal = journal_path.clone();
        let analytics = analytics_path.clone();
        let summary = tokio::task::spawn_blocking(move || {
            gantry_data::Pipeline::new(journal, analytics).run_once()
        })
        .await??;
        info!(
            bars = summary.bars,
            orders = summary.orders,
            fills = summary.fills,
            positions = summary.positions,
            performance = summary.performance,
            "etl pass complete"
        );
        if !follow {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(config.trading.etl_interval_secs)).await;
    }
}
