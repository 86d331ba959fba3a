//! Signal handling for graceful shutdown.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancel the returned token on the first SIGINT or SIGTERM.
///
/// A second signal exits the process immediately.
pub fn install_signal_handler() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("received shutdown signal, initiating graceful shutdown");
        token.cancel();

        wait_for_signal().await;
        warn!("received second signal, forcing immediate exit");
        std::process::exit(1);
    });

    shutdown
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
