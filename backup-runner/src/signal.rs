//! Termination handling for the backup runner (§4.7 "Signal handling
//! (PID 1)").
//!
//! The runner is PID 1 inside its own pod, so SIGTERM/SIGINT are handled
//! directly rather than delegated to an init system. Unlike the
//! controllers' [`pvbackup_core::signal::Termination`] (which also reacts
//! to SIGHUP), §4.7's contract only names SIGTERM and SIGINT.

use tokio::signal::unix::{signal, SignalKind};

/// A one-shot, broadcastable termination signal
#[derive(Debug, Clone)]
pub struct Termination {
    cancelled: tokio_util::sync::CancellationToken,
}

impl Termination {
    /// Install SIGTERM/SIGINT handlers and return a handle
    #[must_use]
    pub fn install() -> Self {
        let cancelled = tokio_util::sync::CancellationToken::new();
        let token = cancelled.clone();
        let _handle = tokio::spawn(async move {
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!("failed to install SIGTERM handler: {err}");
                    return;
                }
            };
            let mut int = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!("failed to install SIGINT handler: {err}");
                    return;
                }
            };
            tokio::select! {
                _ = term.recv() => tracing::info!("received SIGTERM"),
                _ = int.recv() => tracing::info!("received SIGINT"),
            }
            token.cancel();
        });
        Self { cancelled }
    }

    /// Resolves once a termination signal has been received
    pub async fn cancelled(&self) {
        self.cancelled.cancelled().await;
    }

    /// Whether a termination signal has already been received
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn not_cancelled_until_signalled() {
        let termination = Termination::install();
        assert!(!termination.is_cancelled());
    }
}
