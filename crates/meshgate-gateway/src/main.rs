//! The `meshgate` binary: load the configuration, start the gateway.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use meshgate_gateway::{Gateway, GatewayConfig};
use tracing_subscriber::EnvFilter;

/// Multi-protocol gateway in front of a fleet of MCP servers.
#[derive(Debug, Parser)]
#[command(name = "meshgate", version, about)]
struct Cli {
    /// Path to the gateway configuration file
    #[arg(short, long, env = "MESHGATE_CONFIG")]
    config: PathBuf,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match GatewayConfig::load(&cli.config) {
        Ok(config) => config,
        Err(reason) => {
            eprintln!("meshgate: {reason}");
            return ExitCode::from(2);
        }
    };
    init_tracing(&config.log_level);

    let gateway = match Gateway::build(config).await {
        Ok(gateway) => gateway,
        Err(reason) => {
            eprintln!("meshgate: {reason}");
            return ExitCode::from(2);
        }
    };

    match gateway.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(reason) => {
            eprintln!("meshgate: {reason}");
            ExitCode::FAILURE
        }
    }
}
