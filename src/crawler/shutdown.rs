//! Cooperative stop signal shared by the engine, fetcher and throttle

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable stop flag backed by a `watch` channel
///
/// Every clone observes the same flag. `triggered()` resolves once the flag
/// is set, so it can be raced against any wait with `tokio::select!`.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request shutdown; idempotent
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is requested
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so the channel never closes here
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Trigger on the first Ctrl+C / SIGTERM
    pub fn install_signal_handler(&self) {
        self.install_signal_handler_with(|| {});
    }

    /// Like [`ShutdownSignal::install_signal_handler`]; `before_exit` runs
    /// when a second signal forces the process out, since no destructor will
    pub fn install_signal_handler_with<F>(&self, before_exit: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let signal = self.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::warn!("Shutdown requested, finishing in-flight work");
            signal.trigger();

            // Second signal skips the grace period
            wait_for_signal().await;
            tracing::error!("Forced exit");
            before_exit();
            std::process::exit(130);
        });
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
