//! Process-wide shutdown coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};

/// Broadcast shutdown flag shared by every task in a process. Triggered by
/// SIGTERM/SIGINT, by the supervisor's halt flag, or programmatically.
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
    watch_tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        let (watch_tx, _) = watch::channel(false);
        let signal = Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            watch_tx: Arc::new(watch_tx),
        };
        signal.install_signal_handlers();
        signal
    }

    fn install_signal_handlers(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut term =
                    signal(SignalKind::terminate()).expect("install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            this.trigger();
        });
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.watch_tx.send(true);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        if self.triggered() {
            return;
        }
        self.notify.notified().await;
    }

    /// Sleep that is interrupted by shutdown; returns false when woken by
    /// the shutdown signal.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        if self.triggered() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.notify.notified() => false,
        }
    }

    /// Watch-channel view consumed by library spawn helpers.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.watch_tx.subscribe()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            flag: self.flag.clone(),
            notify: self.notify.clone(),
            watch_tx: self.watch_tx.clone(),
        }
    }
}
