//! Halo server entry point: parses CLI flags, loads the server config,
//! spins up a multi-thread tokio runtime, and runs the acceptor loop.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser as ClapParser;
use halo_server::cli::Cli;
use halo_server::config::ServerConfig;
use halo_server::registrar::ClientRegistrar;
use halo_server::logging;
use tokio::net::TcpListener;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if cli.threads > 0 {
        builder.worker_threads(cli.threads);
    }
    let runtime = builder.enable_all().build().context("failed to build tokio runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = ServerConfig::load(&cli.config).with_context(|| format!("loading config {}", cli.config.display()))?;

    let listener = TcpListener::bind(("0.0.0.0", cli.port)).await.context("binding listener")?;
    tracing::info!(port = cli.port, strategy = ?cli.strategy, metric = ?cli.metric, "halo-server listening");

    let registrar = ClientRegistrar::new();
    registrar.run(listener, Arc::new(config), Arc::new(cli)).await?;

    tracing::info!("halo-server exiting cleanly");
    Ok(())
}
