// SPDX-License-Identifier: Apache-2.0

//! Shutdown coordination: converts termination signals into the broadcast
//! quit token every pipeline stage observes, with a bounded drain window.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// How long the pipeline gets to drain after the first signal. A second
/// signal, or expiry, forces an immediate exit.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Install the signal handler and return the process-wide quit token.
///
/// The watchdog only fires while the process is still alive; a drain that
/// completes first exits cleanly through `main` before the timer matters.
pub fn handle_signals() -> CancellationToken {
    let quit = CancellationToken::new();

    let token = quit.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, draining");
        token.cancel();

        tokio::select! {
            _ = wait_for_signal() => {}
            _ = tokio::time::sleep(SHUTDOWN_GRACE) => {}
        }
        std::process::exit(1);
    });

    quit
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sig_term = signal(SignalKind::terminate()).expect("unable to install SIGTERM handler");
    let mut sig_int = signal(SignalKind::interrupt()).expect("unable to install SIGINT handler");

    tokio::select! {
        _ = sig_term.recv() => {}
        _ = sig_int.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
