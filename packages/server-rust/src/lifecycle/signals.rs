//! OS termination signals as a shutdown trigger.

use tracing::{info, warn};

/// Resolves with the signal name once SIGINT or SIGTERM arrives.
///
/// A signal whose handler cannot be installed is logged and never fires;
/// the other one still does.
pub async fn terminate_signal() -> &'static str {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGINT");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                "SIGTERM"
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    let name = tokio::select! {
        name = interrupt => name,
        name = terminate => name,
    };
    info!(signal = name, "termination signal received");
    name
}
