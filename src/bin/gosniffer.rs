//! CLI entry point: parses flags, loads/generates the root CA, runs the
//! proxy server until a shutdown signal arrives, then drains in flight
//! connections within the configured deadline.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use gosniffer::config::{Cli, Config};
use gosniffer::logger;
use gosniffer::shutdown::ShutdownCoordinator;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 1;
// Covers both CA load/generate failure and listener bind failure: both
// surface from the same `proxy::run` future as one `anyhow::Result`.
const EXIT_STARTUP_ERROR: u8 = 2;
const EXIT_SHUTDOWN_DRAIN_ERROR: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    logger::init();

    let config = match Config::from_cli(Cli::parse()) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            logger::error("parsing configuration", &err);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let coordinator = ShutdownCoordinator::new();
    let server_config = config.clone();
    let server_coordinator = coordinator.clone();
    let server_task = tokio::spawn(async move { gosniffer::proxy::run(server_config, server_coordinator).await });

    wait_for_signal().await;
    logger::info("shutdown signal received, draining in-flight connections");

    let shutdown_result = coordinator.shutdown(config.shutdown_timeout).await;

    let server_result = match server_task.await {
        Ok(result) => result,
        Err(err) => Err(anyhow::anyhow!("proxy server task panicked: {err}")),
    };

    if let Err(err) = server_result {
        logger::error("running proxy server", &err);
        return ExitCode::from(EXIT_STARTUP_ERROR);
    }

    if let Err(err) = shutdown_result {
        logger::error("draining connections on shutdown", &err);
        return ExitCode::from(EXIT_SHUTDOWN_DRAIN_ERROR);
    }

    ExitCode::from(EXIT_OK)
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
