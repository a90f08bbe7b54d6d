//! Process-wide cooperative shutdown signal.
//!
//! One `Shutdown` handle triggers; any number of cloned `ShutdownSignal`s
//! observe. Observers finish their own cleanup when they see the signal —
//! nothing is preempted, so an in-flight store write is never truncated.

use tokio::sync::watch;

/// The triggering side of the shutdown signal.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// The observing side. Cheap to clone; one per task that must wind down.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Create a new shutdown pair.
    pub fn new() -> (Shutdown, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (Shutdown { tx }, ShutdownSignal { rx })
    }

    /// Trigger shutdown. Idempotent; all signals wake.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl ShutdownSignal {
    /// Wait until shutdown is triggered. Returns immediately if it already was.
    pub async fn recv(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // Sender dropped counts as shutdown too
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }

    /// Non-blocking check.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}
