//! Graceful shutdown utilities

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix)
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!(
                    "Failed to install SIGTERM handler: {}. Only Ctrl+C will stop the service",
                    e
                );
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(mut sig) = term_signal {
                    sig.recv().await;
                } else {
                    std::future::pending::<()>().await
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Cancel `token` once a shutdown signal arrives.
///
/// The returned task also finishes if the token is cancelled elsewhere first.
pub fn cancel_on_shutdown(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_on_shutdown_exits_when_token_cancelled() {
        let token = CancellationToken::new();
        let handle = cancel_on_shutdown(token.clone());
        token.cancel();
        let joined = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(joined.is_ok());
    }
}
