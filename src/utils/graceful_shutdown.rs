use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use eyre::{Result, WrapErr};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Why the gateway is shutting down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Triggered from code, e.g. a fatal server error
    Requested,
}

/// Fans a single shutdown decision out to the server, the health loop and any
/// in-flight retry loops through one [`CancellationToken`].
pub struct GracefulShutdown {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
    /// How long in-flight requests may drain after the signal
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a manager with the default 30-second drain timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            drain_timeout,
        }
    }

    /// Token cancelled once shutdown starts. Child tokens are cancelled with it.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// First reason recorded, if shutdown has started.
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start shutdown. Only the first call has any effect.
    pub fn trigger(&self, reason: ShutdownReason) {
        let mut current = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            tracing::warn!(?reason, "Shutdown already initiated, ignoring");
            return;
        }
        *current = Some(reason);
        drop(current);

        tracing::info!(?reason, "Shutdown initiated");
        self.token.cancel();
    }

    /// Wait for SIGINT or SIGTERM and trigger shutdown.
    pub async fn run_signal_handler(&self) -> Result<()> {
        tracing::info!("Signal handler started, listening for SIGINT and SIGTERM");

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                self.trigger(ShutdownReason::Interrupt);
            }
            result = wait_for_sigterm() => {
                result?;
                self.trigger(ShutdownReason::Terminate);
            }
            _ = self.token.cancelled() => {}
        }

        Ok(())
    }

    /// Resolve once shutdown has started
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Requested)
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("Failed to register SIGTERM handler")?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_cancels_token_once() {
        let shutdown = GracefulShutdown::new();
        let token = shutdown.token();
        let child = token.child_token();
        assert!(!shutdown.is_shutdown_initiated());

        shutdown.trigger(ShutdownReason::Terminate);
        shutdown.trigger(ShutdownReason::Interrupt);

        assert!(token.is_cancelled());
        assert!(child.is_cancelled());
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Terminate));
        assert_eq!(
            shutdown.wait_for_shutdown_signal().await,
            ShutdownReason::Terminate
        );
    }

    #[tokio::test]
    async fn signal_handler_returns_when_triggered_elsewhere() {
        let shutdown = std::sync::Arc::new(GracefulShutdown::with_timeout(Duration::from_secs(1)));
        let handler = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.run_signal_handler().await })
        };

        shutdown.trigger(ShutdownReason::Requested);
        assert!(handler.await.unwrap().is_ok());
        assert_eq!(shutdown.drain_timeout(), Duration::from_secs(1));
    }
}
