//! Process-wide shutdown signal.
//!
//! Signal listeners publish to one global token; session read loops hold child tokens and check
//! them on every poll tick, so no signal context ever touches a session directly.

use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;

static PROCESS_TOKEN: OnceLock<CancellationToken> = OnceLock::new();

fn root() -> &'static CancellationToken {
    PROCESS_TOKEN.get_or_init(CancellationToken::new)
}

/// A child of the process-wide token. Cancelling it does not affect the process token.
pub fn process_token() -> CancellationToken {
    root().child_token()
}

pub fn request_shutdown() {
    root().cancel();
}

pub fn shutdown_requested() -> bool {
    root().is_cancelled()
}

/// Cancels the process token on SIGINT/SIGTERM (Ctrl-C elsewhere).
pub async fn listen_for_shutdown_signals() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM listener");
                let _ = tokio::signal::ctrl_c().await;
                request_shutdown();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received");
    request_shutdown();
}
