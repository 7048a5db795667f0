pub mod bridge;
pub mod codec;
pub mod config;
pub mod dataset;
pub mod error;
pub mod mqtt;
pub mod publisher;
pub mod shutdown;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::bridge::Bridge;
use crate::config::{BridgeArgs, BridgeConfig};
use crate::shutdown::ShutdownHandler;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    setup()?;

    let args = BridgeArgs::parse();
    let mut config = BridgeConfig::load(args.config_path())
        .await
        .map_err(|e| eyre!("Failed to load configuration: {}", e))?;
    config.apply_args(&args);
    config
        .validate()
        .map_err(|e| eyre!("Invalid configuration: {}", e))?;

    setup_logging(config.logging.level()?);
    info!(
        "Starting facility-bridge {} for {}",
        env!("CARGO_PKG_VERSION"),
        config.broker.endpoint()
    );

    let shutdown = ShutdownHandler::new(CancellationToken::new());
    let interrupt_listener = shutdown.listen_for_interrupt();

    let bridge = Bridge::new(config, args.run_options(), shutdown);
    let result = bridge.run().await;
    interrupt_listener.abort();

    let report = result?;
    Ok(ExitCode::from(report.outcome.exit_code()))
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();
}
