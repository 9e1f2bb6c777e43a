//! uologin: authenticating login proxy for the Ultima Online protocol
//!
//! Accepts game clients, validates their credentials against a local
//! user database, then splices them to the real game server.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use uologin::config::{Config, DEFAULT_CONFIG_PATH};
use uologin::instance::Instance;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "uologin", version, about = "Authenticating UO login proxy")]
struct Args {
    /// Configuration file
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("uologin=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(error) => {
            error!(path = %args.config.display(), %error, "cannot load configuration");
            return ExitCode::FAILURE;
        }
    };

    let instance = match Instance::new(config) {
        Ok(instance) => instance,
        Err(error) => {
            error!(%error, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    info!(version = VERSION, "uologin starting");

    match instance.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "startup failed");
            ExitCode::FAILURE
        }
    }
}
