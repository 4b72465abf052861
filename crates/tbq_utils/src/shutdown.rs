//! Signalling for shutting down long-lived queue and worker tasks.
//!
//! Unlike a broadcast, receivers created after the signal was sent still observe it, which
//! lets tasks spawned late (e.g. a bucket run starting during cancellation) exit promptly.

use tokio::sync::watch;

#[derive(Debug)]
pub struct ShutdownManager {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }
}

impl ShutdownManager {
    pub fn new_pair() -> (Self, ShutdownReceiver) {
        let manager = Self::default();
        let rx = manager.add_receiver();
        (manager, rx)
    }

    pub fn add_receiver(&self) -> ShutdownReceiver {
        ShutdownReceiver {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    /// Signals every receiver, past and future. Idempotent.
    pub fn shutdown_immediately(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownReceiver {
    rx: watch::Receiver<bool>,
}

impl ShutdownReceiver {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown was signalled, or the manager was dropped.
    /// Cancel-safe.
    pub async fn recv_shutdown(&mut self) {
        // An error means the manager is gone, which we treat the same as a shutdown.
        let _ = self.rx.wait_for(|shutdown| *shutdown).await;
    }
}
