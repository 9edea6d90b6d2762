//! Graceful shutdown coordination.
//!
//! A single watch channel fans the stop signal out to every task: the signal
//! watcher stops admitting, entry chases cancel their pending orders, the
//! stream closes its listen key, the dashboard drains. Open positions are
//! left alone; their TP/SL live at the venue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

pub struct Shutdown {
    requested: AtomicBool,
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            requested: AtomicBool::new(false),
            tx,
            rx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn request(&self) {
        if self.requested.swap(true, Ordering::SeqCst) {
            warn!("shutdown already requested, ignoring duplicate signal");
            return;
        }
        info!("shutdown requested");
        let _ = self.tx.send(true);
    }

    /// Wait until a shutdown is requested.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Install OS signal handlers that request a graceful shutdown.
pub fn install_signal_handlers(shutdown: Arc<Shutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let on_sigterm = shutdown.clone();
        tokio::spawn(async move {
            let mut stream =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            stream.recv().await;
            info!("received SIGTERM");
            on_sigterm.request();
        });

        let on_sigint = shutdown;
        tokio::spawn(async move {
            let mut stream =
                signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            stream.recv().await;
            info!("received SIGINT");
            on_sigint.request();
        });
    }

    #[cfg(windows)]
    {
        tokio::spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
            info!("received Ctrl+C");
            shutdown.request();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_fires_watchers() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        assert!(!*rx.borrow());

        shutdown.request();
        assert!(shutdown.is_requested());
        rx.changed().await.unwrap();
        assert!(*rx.borrow());

        // Duplicate request is a no-op
        shutdown.request();
        assert!(shutdown.is_requested());
    }
}
