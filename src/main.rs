//! `irkerd` entry point: parse CLI, initialize logging, construct the
//! dispatcher, bind the ingress listener(s), and run until a shutdown
//! signal arrives (§4.6 "Process lifecycle" of the design doc).

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use irkerd::{cli::Args, config::Tunables, dispatcher::Dispatcher, logging};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let _log_guard = logging::init(args.debug_level, args.log_file.as_deref());

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "unrecoverable startup error");
            ExitCode::from(1)
        }
    }
}

/// The startup sequence and main run loop, wrapped in `anyhow::Result` the
/// way the rest of this codebase's binaries handle top-level errors —
/// library code below this point returns typed [`DaemonError`]s instead.
///
/// [`DaemonError`]: irkerd::error::DaemonError
async fn run(args: Args) -> Result<()> {
    info!(version = irkerd::VERSION, "starting irkerd");

    let dispatcher = Dispatcher::new(args.default_nick(), Tunables::default());

    irkerd::ingress::serve(
        dispatcher.clone(),
        args.bind,
        args.port,
        args.unix_socket.clone(),
    )
    .await?;

    tokio::spawn(dispatcher.clone().run_sweeper());

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, closing server sessions");
    dispatcher.shutdown().await;
    info!("irkerd exiting cleanly");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
