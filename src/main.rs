//! Entry point for the cert-states-site daemon.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use scheduler::{ShutdownSignal, TimerWheel};
use tracing::{error, info};

mod acme;
mod cache;
mod cli;
mod config;
mod server;
mod storage;
mod tls;

#[tokio::main]
async fn main() -> ExitCode {
    logger::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let args: cli::Args = argh::from_env();

    let config = config::Config::load(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;

    let store = Arc::new(storage::Store::new(config.data_dir.clone()));
    let cache = cache::CertCache::new(&config, store.clone());

    // One signal stops the timer wheel and drains the listener;
    // dispatched issuer steps run to completion.
    let shutdown = ShutdownSignal::new();
    spawn_signal_listener(shutdown.clone());

    let wheel = TimerWheel::spawn(shutdown.clone());
    acme::start(&config, store, cache.clone(), wheel)
        .await
        .context("starting issuance")?;

    server::serve(&config, cache, shutdown).await
}

/// SIGINT, SIGTERM and SIGHUP each trigger the graceful shutdown.
fn spawn_signal_listener(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt =
            signal(SignalKind::interrupt()).expect("installing SIGINT handler");
        let mut terminate =
            signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        let mut hangup =
            signal(SignalKind::hangup()).expect("installing SIGHUP handler");

        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
            _ = hangup.recv() => info!("Received SIGHUP"),
        }
        shutdown.send();
    });
}
