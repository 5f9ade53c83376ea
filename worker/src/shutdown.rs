use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Install SIGTERM/SIGINT handling and return the token the dispatch loop
/// watches. Signal delivery does nothing but cancel the token; all real
/// shutdown work happens on the loop thread, once per iteration.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let loop_token = token.clone();

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }

        loop_token.cancel();
    });

    token
}
