mod config;
mod telemetry;

use clap::Parser;
use config::{Config, ConfigError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "beacon-relay", version, about = "Relays page-view beacons to an analytics sink")]
enum CliCommand {
    /// Serve beacons until interrupted
    Run {
        #[arg(long)]
        config_file_path: PathBuf,
    },
    /// Print the metrics emitted by the relay
    Metrics,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Telemetry(#[from] telemetry::TelemetryError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Relay(#[from] beacon::errors::RelayError),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    match &cli {
        CliCommand::Run { config_file_path } => match run(config_file_path) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "Beacon relay stopped");
                eprintln!("beacon-relay: {e}");
                ExitCode::FAILURE
            }
        },
        CliCommand::Metrics => {
            for def in beacon::metrics_defs::ALL_METRICS {
                println!(
                    "{}\t{}\t{}",
                    def.name,
                    def.metric_type.as_str(),
                    def.description
                );
            }
            ExitCode::SUCCESS
        }
    }
}

fn run(config_file_path: &Path) -> Result<(), CliError> {
    let config = Config::from_file(config_file_path)?;

    // Held until exit so buffered events are flushed
    let _sentry = telemetry::init_logging(config.common.logging.as_ref());
    if let Some(metrics) = &config.common.metrics {
        telemetry::init_metrics(metrics)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(beacon::run(config.relay, shutdown_signal()))?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition() {
        CliCommand::command().debug_assert();
    }

    #[test]
    fn parse_run() {
        let cli =
            CliCommand::parse_from(["beacon-relay", "run", "--config-file-path", "relay.yaml"]);
        assert!(matches!(
            cli,
            CliCommand::Run { config_file_path } if config_file_path == Path::new("relay.yaml")
        ));
    }
}
