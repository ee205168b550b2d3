//! Cancellation signals shared between a client and the tasks serving it.

use std::sync::Arc;
use tokio::sync::watch;

/// Client side of a cancellation signal. Clones share the same signal.
/// Dropping every handle counts as cancelling.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, CancelSignal { rx })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new task-side view of this signal.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Whether both handles fire the same signal.
    pub fn same_signal(&self, other: &CancelHandle) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }
}

/// Task side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Non-blocking check.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the signal fires or every handle is gone.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (handle, mut signal) = CancelHandle::new();
            assert!(!signal.is_cancelled());
            let waiter = tokio::spawn(async move { signal.cancelled().await });
            handle.cancel();
            waiter.await.unwrap();
            assert!(handle.is_cancelled());
        })
        .await
        .expect("test_cancel_wakes_waiter timed out");
    }

    #[tokio::test]
    async fn test_dropping_handles_cancels() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let (handle, mut signal) = CancelHandle::new();
            let other = handle.clone();
            assert!(handle.same_signal(&other));
            drop(handle);
            assert!(!signal.is_cancelled());
            drop(other);
            assert!(signal.is_cancelled());
            signal.cancelled().await;
        })
        .await
        .expect("test_dropping_handles_cancels timed out");
    }
}
