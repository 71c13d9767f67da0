// src/shutdown.rs

//! Platform shutdown-signal handling shared by both drivers.

use tracing::info;

/// Waits for a shutdown signal: SIGINT or SIGTERM on Unix.
#[cfg(unix)]
pub(crate) async fn await_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");

    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
    }
}

/// Waits for a shutdown signal: Ctrl+C on Windows.
#[cfg(windows)]
pub(crate) async fn await_shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to create Ctrl+C stream");
    info!("Ctrl-C received, initiating graceful shutdown.");
}
