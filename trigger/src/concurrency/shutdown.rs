//! Shutdown signaling primitives for worker coordination.
//!
//! Abstracts tokio's watch channels into a simple shutdown signal shared by
//! every worker of a trigger binding. The transmitter is held by the pipeline
//! (and by the poll worker, which propagates its own termination); receivers
//! are cloned into each worker task.

use tokio::sync::watch;

/// Initial state of the shutdown channel: not shut down.
const SHUTDOWN_DEFAULT: bool = false;

/// Transmitter side of the shutdown channel.
pub type ShutdownTx = watch::Sender<bool>;

/// Receiver side of the shutdown channel.
///
/// Wraps a watch receiver so waiting does not require mutable access, which
/// lets workers select on shutdown from borrowed contexts.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    /// Returns `true` once shutdown has been signalled.
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Completes when shutdown is signalled (or every transmitter is gone).
    pub async fn wait_for_shutdown(&self) {
        let mut receiver = self.0.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Creates a new shutdown channel.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(SHUTDOWN_DEFAULT);
    (tx, ShutdownRx(rx))
}

/// Subscribes a new receiver to an existing shutdown channel.
pub fn subscribe(tx: &ShutdownTx) -> ShutdownRx {
    ShutdownRx(tx.subscribe())
}
