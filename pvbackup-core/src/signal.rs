//! Termination handling shared by every controller binary (§5).
//!
//! Installs handlers for SIGTERM, SIGINT and SIGHUP. Once any of them
//! fires, [`Termination::cancelled`] resolves so the caller can stop at its
//! next suspension point, drain the tracked-resources registry, run any
//! outstanding post-hooks, and exit 143.

use tokio::signal::unix::{signal, SignalKind};

/// Process exit code used for every signal-driven termination
pub const SIGNAL_EXIT_CODE: i32 = 143;

/// A one-shot, broadcastable termination signal
#[derive(Debug, Clone)]
pub struct Termination {
    cancelled: tokio_util::sync::CancellationToken,
}

impl Termination {
    /// Install SIGTERM/SIGINT/SIGHUP handlers and return a handle. The
    /// background task that races the three signal futures is spawned
    /// immediately; it exits once the first signal arrives.
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
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(err) => {
                    tracing::warn!("failed to install SIGHUP handler: {err}");
                    return;
                }
            };
            tokio::select! {
                _ = term.recv() => tracing::info!("received SIGTERM"),
                _ = int.recv() => tracing::info!("received SIGINT"),
                _ = hup.recv() => tracing::info!("received SIGHUP"),
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
