//! Shutdown requests for the polling loop.
//!
//! The listener is installed once, before the first pass. A signal that
//! arrives while a pass is running stays pending and is seen at the next
//! sleep, so the pass finishes and its batch is sent before the loop exits.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

/// A pending shutdown request, observed only between passes.
pub struct Shutdown {
    signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    requested: bool,
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("requested", &self.requested)
            .finish_non_exhaustive()
    }
}

impl Shutdown {
    /// Wraps any future that completes when shutdown is wanted.
    pub fn new(signal: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            signal: Box::pin(signal),
            requested: false,
        }
    }

    /// Listens for SIGINT and SIGTERM from now on.
    ///
    /// # Errors
    ///
    /// Returns an IO error if a signal handler cannot be installed.
    #[cfg(unix)]
    pub fn from_signals() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        Ok(Self::new(async move {
            tokio::select! {
                _ = interrupt.recv() => warn!("interrupted, shutting down"),
                _ = terminate.recv() => warn!("terminated, shutting down"),
            }
        }))
    }

    /// Listens for Ctrl-C from now on.
    ///
    /// # Errors
    ///
    /// Never fails on this platform.
    #[cfg(not(unix))]
    pub fn from_signals() -> Result<Self> {
        Ok(Self::new(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => warn!("interrupted, shutting down"),
                Err(e) => warn!(error = %e, "ctrl-c listener failed, shutting down"),
            }
        }))
    }

    /// Returns `true` once shutdown has been observed.
    #[must_use]
    pub const fn is_requested(&self) -> bool {
        self.requested
    }

    /// Sleeps for `period` unless shutdown is requested first.
    ///
    /// Returns `true` if the loop should stop.
    pub async fn sleep(&mut self, period: Duration) -> bool {
        if self.requested {
            return true;
        }
        tokio::select! {
            () = tokio::time::sleep(period) => false,
            () = &mut self.signal => {
                self.requested = true;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    const LONG: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_sleep_runs_out_without_request() {
        let (_tx, rx) = oneshot::channel::<()>();
        let mut shutdown = Shutdown::new(async move {
            let _ = rx.await;
        });
        assert!(!shutdown.sleep(Duration::from_millis(10)).await);
        assert!(!shutdown.is_requested());
    }

    #[tokio::test]
    async fn test_request_during_pass_is_seen_at_next_sleep() {
        let (tx, rx) = oneshot::channel::<()>();
        let mut shutdown = Shutdown::new(async move {
            let _ = rx.await;
        });
        assert!(!shutdown.sleep(Duration::from_millis(10)).await);

        // Request arrives while no one is polling, as during a pass.
        tx.send(()).expect("send request");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(5), shutdown.sleep(LONG))
            .await
            .expect("request observed without waiting out the tick");
        assert!(stopped);
        assert!(shutdown.is_requested());
        assert!(shutdown.sleep(LONG).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigint_during_pass_is_kept() {
        let mut shutdown = Shutdown::from_signals().expect("install handlers");
        assert!(!shutdown.sleep(Duration::from_millis(10)).await);

        let status = std::process::Command::new("kill")
            .args(["-INT", &std::process::id().to_string()])
            .status()
            .expect("run kill");
        assert!(status.success());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(5), shutdown.sleep(LONG))
            .await
            .expect("SIGINT observed on the next sleep");
        assert!(stopped);
    }
}
